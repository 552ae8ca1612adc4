//! Message body codec for delivery requests.
//!
//! Bodies are UTF-8 JSON. Decoding never panics and never logs: failures are
//! returned as a classified [`DecodeError`] so the consumer can dead-letter
//! the message with the failure attached.

use serde_json::error::Category;

use crate::types::DeliveryRequest;

/// Classified reason a message body could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8 (first invalid byte at offset {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },
    #[error("malformed JSON at line {line}, column {column}: {detail}")]
    Syntax {
        line: usize,
        column: usize,
        detail: String,
    },
    #[error("payload does not match the delivery request schema at line {line}, column {column}: {detail}")]
    Schema {
        line: usize,
        column: usize,
        detail: String,
    },
}

impl DecodeError {
    /// Short stable label for the failure class.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUtf8 { .. } => "invalid_utf8",
            Self::Syntax { .. } => "syntax",
            Self::Schema { .. } => "schema",
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        let line = err.line();
        let column = err.column();
        let detail = err.to_string();
        match err.classify() {
            Category::Data => Self::Schema {
                line,
                column,
                detail,
            },
            // Io cannot happen for slice input; treat it like truncated input.
            Category::Syntax | Category::Eof | Category::Io => Self::Syntax {
                line,
                column,
                detail,
            },
        }
    }
}

/// Decodes a raw message body into a [`DeliveryRequest`].
///
/// # Errors
///
/// Returns [`DecodeError::InvalidUtf8`] when the body is not UTF-8,
/// [`DecodeError::Syntax`] when it is not well-formed JSON, and
/// [`DecodeError::Schema`] when the JSON does not describe a delivery request.
pub fn decode(body: &[u8]) -> Result<DeliveryRequest, DecodeError> {
    let text = std::str::from_utf8(body).map_err(|e| DecodeError::InvalidUtf8 {
        valid_up_to: e.valid_up_to(),
    })?;
    Ok(serde_json::from_str(text)?)
}

/// Encodes a [`DeliveryRequest`] into a message body.
///
/// # Errors
///
/// Returns an error only if serialization fails, which cannot happen for the
/// field types of `DeliveryRequest` but is propagated rather than unwrapped.
pub fn encode(request: &DeliveryRequest) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(request)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::{ConfirmationRequired, PackageInfo, PackageSize};

    #[test]
    fn decodes_full_request() {
        let body = br#"{
            "deliveryId": "D1",
            "ownerId": "owner-9",
            "pickupLocation": "warehouse-1",
            "dropOffLocation": "47.6,-122.3",
            "pickupTime": "2026-10-16T10:00:00Z",
            "deadline": "ASAP",
            "expedited": true,
            "confirmationRequired": "Signature",
            "packageInfo": {"packageId": "P1", "size": "medium", "weight": 3.2, "tag": "books"},
            "someFutureField": {"ignored": true}
        }"#;
        let request = decode(body).unwrap();
        assert_eq!(request.delivery_id, "D1");
        assert!(request.expedited);
        assert_eq!(request.confirmation_required, ConfirmationRequired::Signature);
        let package = request.package_info.unwrap();
        assert_eq!(package.size, PackageSize::Medium);
        assert!((package.weight - 3.2).abs() < f64::EPSILON);
    }

    #[test]
    fn decodes_minimal_request() {
        let request = decode(br#"{"deliveryId":"D2"}"#).unwrap();
        assert_eq!(request.delivery_id, "D2");
        assert!(request.package_info.is_none());
    }

    #[test]
    fn malformed_json_is_syntax_error() {
        let err = decode(b"{not json").unwrap_err();
        assert_eq!(err.kind(), "syntax");
    }

    #[test]
    fn truncated_json_is_syntax_error() {
        let err = decode(br#"{"deliveryId":"D"#).unwrap_err();
        assert!(matches!(err, DecodeError::Syntax { .. }));
    }

    #[test]
    fn missing_delivery_id_is_schema_error() {
        let err = decode(br#"{"ownerId":"o"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Schema { .. }));
    }

    #[test]
    fn wrong_field_type_is_schema_error() {
        let err = decode(br#"{"deliveryId":"D","expedited":"yes"}"#).unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    #[test]
    fn invalid_utf8_is_reported_with_offset() {
        let err = decode(&[b'{', 0xff, 0xfe]).unwrap_err();
        assert_eq!(err, DecodeError::InvalidUtf8 { valid_up_to: 1 });
    }

    #[test]
    fn empty_body_is_syntax_error() {
        assert!(matches!(decode(b"").unwrap_err(), DecodeError::Syntax { .. }));
    }

    #[test]
    fn encoded_request_decodes_to_same_value() {
        let request = DeliveryRequest::new("D3").with_package(PackageInfo {
            package_id: "P3".to_string(),
            size: PackageSize::Small,
            weight: 1.0,
            tag: String::new(),
        });
        let body = encode(&request).unwrap();
        assert_eq!(decode(&body).unwrap(), request);
    }

    proptest! {
        #[test]
        fn decode_never_panics(body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&body);
        }
    }
}

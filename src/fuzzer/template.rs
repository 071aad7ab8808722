//! Request templates with marked injection points

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::encoding::base64_bytes;
use crate::error::HttpError;

/// One fragment of a templated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPart {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Whether payloads replace this fragment
    #[serde(default)]
    pub inject: bool,
}

impl RequestPart {
    pub fn fixed(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            inject: false,
        }
    }

    pub fn injectable(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            inject: true,
        }
    }
}

/// A request split into fixed fragments and injection points.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub parts: Vec<RequestPart>,
}

/// A template with payloads substituted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spliced {
    pub bytes: Vec<u8>,
    /// JSON object of original value to substitute, for changed points only
    pub changes: String,
}

impl RequestTemplate {
    pub fn new(parts: Vec<RequestPart>) -> Self {
        Self { parts }
    }

    pub fn injection_points(&self) -> usize {
        self.parts.iter().filter(|p| p.inject).count()
    }

    /// Current values of the injection points, in order.
    pub fn original_values(&self) -> Vec<Vec<u8>> {
        self.parts
            .iter()
            .filter(|p| p.inject)
            .map(|p| p.data.clone())
            .collect()
    }

    /// The request with its original values.
    pub fn base(&self) -> Vec<u8> {
        self.parts.iter().flat_map(|p| p.data.iter().copied()).collect()
    }

    /// Substitute one payload per injection point.
    pub fn splice(&self, payloads: &[Vec<u8>]) -> Result<Spliced, HttpError> {
        let points = self.injection_points();
        if payloads.len() != points {
            return Err(HttpError::Parse(format!(
                "{} payloads supplied for {} injection points",
                payloads.len(),
                points
            )));
        }

        let mut bytes = Vec::new();
        let mut changes = BTreeMap::new();
        let mut payloads = payloads.iter();

        for part in &self.parts {
            if !part.inject {
                bytes.extend_from_slice(&part.data);
                continue;
            }
            let Some(payload) = payloads.next() else {
                break;
            };
            if *payload != part.data {
                changes.insert(
                    String::from_utf8_lossy(&part.data).into_owned(),
                    String::from_utf8_lossy(payload).into_owned(),
                );
            }
            bytes.extend_from_slice(payload);
        }

        let changes = if changes.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&changes)
                .map_err(|e| HttpError::Parse(format!("payload map: {}", e)))?
        };
        Ok(Spliced { bytes, changes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> RequestTemplate {
        RequestTemplate::new(vec![
            RequestPart::fixed("GET /item?id="),
            RequestPart::injectable("7"),
            RequestPart::fixed("&sort="),
            RequestPart::injectable("asc"),
            RequestPart::fixed(" HTTP/1.1\r\nHost: shop.test\r\n\r\n"),
        ])
    }

    #[test]
    fn test_base_and_points() {
        let t = template();
        assert_eq!(t.injection_points(), 2);
        assert_eq!(t.original_values(), vec![b"7".to_vec(), b"asc".to_vec()]);
        assert!(t.base().starts_with(b"GET /item?id=7&sort=asc HTTP/1.1"));
    }

    #[test]
    fn test_splice_records_only_changed_points() {
        let spliced = template()
            .splice(&[b"'".to_vec(), b"asc".to_vec()])
            .unwrap();
        assert!(spliced.bytes.starts_with(b"GET /item?id='&sort=asc "));
        let changes: serde_json::Value = serde_json::from_str(&spliced.changes).unwrap();
        assert_eq!(changes, serde_json::json!({"7": "'"}));
    }

    #[test]
    fn test_splice_rejects_wrong_count() {
        assert!(template().splice(&[b"x".to_vec()]).is_err());
    }

    #[test]
    fn test_parts_deserialize_from_base64() {
        let t: RequestTemplate =
            serde_json::from_str(r#"{"parts":[{"data":"YQ==","inject":true},{"data":"Yg=="}]}"#)
                .unwrap();
        assert_eq!(t.parts[0], RequestPart::injectable("a"));
        assert_eq!(t.parts[1], RequestPart::fixed("b"));
    }
}

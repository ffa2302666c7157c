//! Scan result model and content-type classification.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The verdict of a security scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "ALLOW")]
    Allow,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "BLOCK")]
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "ALLOW",
            Decision::Warn => "WARN",
            Decision::Block => "BLOCK",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected threat with location info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    /// Broad category: "prompt_injection", "credential_leak".
    pub category: String,
    /// The specific pattern that matched.
    pub pattern: String,
    /// Where in the text (line/offset when available).
    pub location: String,
    /// "high", "medium", "low".
    pub severity: String,
    /// Human-readable explanation.
    pub description: String,
}

/// The result of a security scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub decision: Decision,
    pub scores: HashMap<String, f64>,
    pub reason: String,
    pub latency_ms: i64,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sanitized_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threats_found: Vec<Threat>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recommended_action: String,
}

impl ScanResult {
    /// An ALLOW result with empty scores, used when scanning is skipped.
    pub fn allow(reason: &str) -> Self {
        ScanResult {
            decision: Decision::Allow,
            scores: HashMap::new(),
            reason: reason.to_string(),
            latency_ms: 0,
            request_id: String::new(),
            metadata: None,
            sanitized_text: String::new(),
            threats_found: Vec::new(),
            recommended_action: String::new(),
        }
    }
}

const SCANNABLE_TYPES: &[&str] = &[
    "text/html",
    "text/plain",
    "text/markdown",
    "application/json",
    "application/xml",
    "text/xml",
    "application/javascript",
    "text/javascript",
    "text/css",
];

const BINARY_TYPES: &[&str] = &[
    "image/",
    "video/",
    "audio/",
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-",
];

/// Whether a Content-Type value names content worth scanning.
pub fn should_scan_content_type(content_type: &str) -> bool {
    SCANNABLE_TYPES.iter().any(|t| content_type.contains(t))
}

/// Whether a Content-Type value names binary content, which is never scanned.
pub fn is_binary_content_type(content_type: &str) -> bool {
    BINARY_TYPES.iter().any(|t| content_type.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_serde() {
        assert_eq!(serde_json::to_string(&Decision::Block).unwrap(), "\"BLOCK\"");
        let d: Decision = serde_json::from_str("\"WARN\"").unwrap();
        assert_eq!(d, Decision::Warn);
    }

    #[test]
    fn test_should_scan_content_type() {
        assert!(should_scan_content_type("text/html"));
        assert!(should_scan_content_type("text/html; charset=utf-8"));
        assert!(should_scan_content_type("application/json"));
        assert!(should_scan_content_type("text/markdown"));
        assert!(!should_scan_content_type("image/png"));
        assert!(!should_scan_content_type(""));
    }

    #[test]
    fn test_is_binary_content_type() {
        assert!(is_binary_content_type("image/png"));
        assert!(is_binary_content_type("application/octet-stream"));
        assert!(is_binary_content_type("application/pdf"));
        assert!(is_binary_content_type("application/x-tar"));
        assert!(!is_binary_content_type("text/html"));
        assert!(!is_binary_content_type("application/json"));
    }

    #[test]
    fn test_scan_result_json_shape() {
        let result = ScanResult::allow("No threats detected");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["decision"], "ALLOW");
        assert!(json.get("threats_found").is_none());
        assert!(json.get("sanitized_text").is_none());
    }
}

//! Configuration validation logic.

use crate::config::schema::ProxyConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a ProxyConfig for semantic correctness.
pub fn validate_proxy_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.api.endpoint.is_empty() {
        errors.push(ValidationError("api.endpoint must not be empty".to_string()));
    } else if !config.api.endpoint.starts_with("http://")
        && !config.api.endpoint.starts_with("https://")
    {
        errors.push(ValidationError(format!(
            "api.endpoint must be an http(s) URL, got '{}'",
            config.api.endpoint
        )));
    }

    if config.api.timeout_secs == 0 {
        errors.push(ValidationError("api.timeout_secs must be > 0".to_string()));
    }

    for (name, action) in [
        ("scanning.content.action_on_warn", &config.scanning.content.action_on_warn),
        ("scanning.content.action_on_block", &config.scanning.content.action_on_block),
        ("scanning.output.action_on_warn", &config.scanning.output.action_on_warn),
        ("scanning.output.action_on_block", &config.scanning.output.action_on_block),
    ] {
        if action != "warn" && action != "block" && action != "allow" {
            errors.push(ValidationError(format!(
                "{name} must be one of allow/warn/block, got '{action}'"
            )));
        }
    }

    match config.logging.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => errors.push(ValidationError(format!("unknown logging.level '{other}'"))),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

//! Robot options carried in the opaque execution config.
//!
//! Recognised keys:
//!
//! | Key            | Type                     | Effect                        |
//! |----------------|--------------------------|-------------------------------|
//! | `timeout_secs` | positive integer         | per-run timeout override      |
//! | `include`      | string or array of string| `--include <tag>` per entry   |
//! | `exclude`      | string or array of string| `--exclude <tag>` per entry   |
//! | `loglevel`     | string (e.g. `DEBUG:INFO`)| `--loglevel <level>`         |
//!
//! Unknown keys are ignored here and preserved on the queue item.

use std::time::Duration;

use serde_json::Value;

use crate::error::CoreError;

/// Log levels accepted by Robot's `--loglevel`.
const VALID_LOG_LEVELS: &[&str] = &["NONE", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

/// Parsed, validated runner options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub loglevel: Option<String>,
    pub timeout: Option<Duration>,
}

impl RobotOptions {
    /// Parse options from an execution config. `null` means defaults; any
    /// other non-object value is rejected.
    pub fn from_config(config: &Value) -> Result<Self, CoreError> {
        let obj = match config {
            Value::Null => return Ok(Self::default()),
            Value::Object(obj) => obj,
            _ => {
                return Err(CoreError::Validation(
                    "Execution config must be a JSON object".into(),
                ))
            }
        };

        let timeout = match obj.get("timeout_secs") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                _ => {
                    return Err(CoreError::Validation(
                        "timeout_secs must be a positive integer".into(),
                    ))
                }
            },
        };

        let loglevel = match obj.get("loglevel") {
            None | Some(Value::Null) => None,
            Some(Value::String(level)) => {
                let normalized = level.trim().to_ascii_uppercase();
                let valid = !normalized.is_empty()
                    && normalized
                        .split(':')
                        .all(|part| VALID_LOG_LEVELS.contains(&part));
                if !valid {
                    return Err(CoreError::Validation(format!(
                        "Invalid loglevel '{level}'. Must be one of: {VALID_LOG_LEVELS:?}"
                    )));
                }
                Some(normalized)
            }
            Some(_) => return Err(CoreError::Validation("loglevel must be a string".into())),
        };

        Ok(Self {
            include: tag_list(obj.get("include"), "include")?,
            exclude: tag_list(obj.get("exclude"), "exclude")?,
            loglevel,
            timeout,
        })
    }

    /// The timeout to enforce: the override if present, else `default`,
    /// never above `max`.
    pub fn effective_timeout(&self, default: Duration, max: Duration) -> Duration {
        self.timeout.unwrap_or(default).min(max)
    }

    /// Command-line arguments for the recognised options.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for tag in &self.include {
            args.push("--include".to_string());
            args.push(tag.clone());
        }
        for tag in &self.exclude {
            args.push("--exclude".to_string());
            args.push(tag.clone());
        }
        if let Some(level) = &self.loglevel {
            args.push("--loglevel".to_string());
            args.push(level.clone());
        }
        args
    }
}

fn tag_list(value: Option<&Value>, key: &str) -> Result<Vec<String>, CoreError> {
    let invalid = || CoreError::Validation(format!("{key} must be a tag or a list of non-empty tags"));
    let tags = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::String(tag)) => vec![tag.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid()),
    };
    if tags.iter().any(|t| t.trim().is_empty()) {
        return Err(invalid());
    }
    Ok(tags)
}

use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolSpec, optional_string};
use async_trait::async_trait;
use chrono::{FixedOffset, SecondsFormat, Utc};

pub struct CurrentTimeTool;

impl CurrentTimeTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CurrentTimeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "current_time".to_string(),
            description: "Get the current date and time, optionally at a fixed UTC offset like +02:00."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "utc_offset": { "type": "string", "description": "e.g. -05:00" }
                }
            }),
            requires_confirmation: false,
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let now = Utc::now();
        let Some(raw) = optional_string(&arguments, "utc_offset")? else {
            return Ok(serde_json::json!({
                "now": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                "utc_offset": "+00:00",
            }));
        };
        let offset = parse_offset(&raw)?;
        Ok(serde_json::json!({
            "now": now.with_timezone(&offset).to_rfc3339_opts(SecondsFormat::Secs, false),
            "utc_offset": offset.to_string(),
        }))
    }
}

fn parse_offset(raw: &str) -> Result<FixedOffset> {
    let raw = raw.trim();
    let invalid = || ToolError::InvalidArguments(format!("utc_offset must look like +HH:MM, got {raw:?}"));
    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_signed_offsets() {
        assert_eq!(parse_offset("+02:00").expect("east").local_minus_utc(), 7200);
        assert_eq!(parse_offset("-05:30").expect("west").local_minus_utc(), -19800);
        assert!(parse_offset("02:00").is_err());
        assert!(parse_offset("+25:00").is_err());
    }

    #[tokio::test]
    async fn execute_reports_requested_offset() {
        let out = CurrentTimeTool::new()
            .execute(json!({ "utc_offset": "+09:00" }))
            .await
            .expect("execute");
        assert_eq!(out["utc_offset"], "+09:00");
        assert!(out["now"].as_str().expect("now string").ends_with("+09:00"));
    }
}

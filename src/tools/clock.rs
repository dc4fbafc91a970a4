//! Clock 工具：当前 UTC 时间

use std::fmt::Write;

use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::parameters_schema;
use crate::tools::Tool;

#[allow(dead_code)]
#[derive(Debug, Deserialize, JsonSchema)]
struct ClockArgs {
    /// Optional strftime format, RFC 3339 when omitted
    format: Option<String>,
}

pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Current date and time in UTC."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<ClockArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let now = Utc::now();
        match args.get("format").and_then(|v| v.as_str()) {
            Some(fmt) if !fmt.is_empty() => {
                let mut out = String::new();
                write!(out, "{}", now.format(fmt)).map_err(|_| format!("invalid time format: {fmt}"))?;
                Ok(out)
            }
            _ => Ok(now.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_is_rfc3339() {
        let out = ClockTool.execute(serde_json::json!({})).await.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&out).is_ok());
    }

    #[tokio::test]
    async fn custom_format() {
        let out = ClockTool
            .execute(serde_json::json!({"format": "%Y"}))
            .await
            .unwrap();
        assert_eq!(out.len(), 4);
    }

    #[tokio::test]
    async fn invalid_format_is_an_error() {
        assert!(ClockTool
            .execute(serde_json::json!({"format": "%Q"}))
            .await
            .is_err());
    }
}

//! `get_current_time`

use async_trait::async_trait;
use chat_core::{
    error::Result,
    tool::{ParameterSchema, Tool, ToolContext, ToolKind, ToolOutcome, ToolSchema},
};
use chrono::{Datelike, FixedOffset, Timelike, Utc};
use serde_json::{Map, Value, json};

/// Offset used when the model does not ask for one (UTC+8)
pub const DEFAULT_OFFSET_HOURS: f64 = 8.0;

/// Current date and time at a fixed UTC offset
#[derive(Clone, Debug)]
pub struct DateTimeTool {
    default_offset_hours: f64,
}

impl Default for DateTimeTool {
    fn default() -> Self {
        Self {
            default_offset_hours: DEFAULT_OFFSET_HOURS,
        }
    }
}

impl DateTimeTool {
    pub fn new() -> Self {
        Self::default()
    }

    fn offset_hours(&self, arguments: &Map<String, Value>) -> f64 {
        match arguments.get("timezone_hours") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .unwrap_or(self.default_offset_hours)
    }
}

#[async_trait]
impl Tool for DateTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            kind: ToolKind::GetCurrentTime,
            description: "Get the current date and time (UTC+8 unless another offset is given). \
                Call this whenever the user asks what time or day it is, or needs a timestamp."
                .into(),
            parameters: vec![ParameterSchema::new(
                "timezone_hours",
                "number",
                "Optional UTC offset in hours, e.g. 8 for Beijing or -5 for US Eastern",
                false,
            )],
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn execute(&self, arguments: &Map<String, Value>, _ctx: &ToolContext) -> Result<ToolOutcome> {
        let hours = self.offset_hours(arguments);
        let Some(offset) = hours
            .is_finite()
            .then(|| (hours * 3600.0).round() as i32)
            .and_then(FixedOffset::east_opt)
        else {
            return Ok(ToolOutcome::failure(format!("invalid timezone offset: {hours}")));
        };

        let now = Utc::now().with_timezone(&offset);
        let data = json!({
            "iso": now.to_rfc3339(),
            "date": now.format("%Y-%m-%d").to_string(),
            "time": now.format("%H:%M:%S").to_string(),
            "timestamp": now.timestamp(),
            "timestamp_ms": now.timestamp_millis(),
            "timezone_offset": now.format("%:z").to_string(),
            "timezone_offset_hours": f64::from(offset.local_minus_utc()) / 3600.0,
            "utc_equivalent": now.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            "weekday": now.format("%A").to_string(),
            "weekday_num": now.weekday().number_from_monday(),
            "year": now.year(),
            "month": now.month(),
            "day": now.day(),
            "hour": now.hour(),
            "minute": now.minute(),
            "second": now.second(),
        });

        Ok(ToolOutcome::success("ok").with_data(data))
    }
}

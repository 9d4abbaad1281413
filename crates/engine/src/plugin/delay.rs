//! Built-in delay capability: sleeps for a configured duration.
//!
//! Used for pacing external systems and for exercising timeout and
//! cancellation paths end to end.

use async_trait::async_trait;
use rocketship_types::{EngineError, ErrorKind};
use rocketship_util::parse_duration;
use serde_json::{Value as JsonValue, json};

use super::{ActivityContext, Plugin, PluginOutcome, PluginParams};

pub struct DelayPlugin;

#[async_trait]
impl Plugin for DelayPlugin {
    fn name(&self) -> &str {
        "delay"
    }

    async fn execute(
        &self,
        ctx: &ActivityContext,
        params: &PluginParams,
    ) -> Result<PluginOutcome, EngineError> {
        let raw_duration = params
            .config
            .get("duration")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| EngineError::plugin("delay config requires a 'duration' string"))?;
        let duration = parse_duration(raw_duration)
            .ok_or_else(|| EngineError::plugin(format!("invalid duration '{raw_duration}'")))?;

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = ctx.cancelled() => {
                return Err(EngineError::new(ErrorKind::Cancelled, "delay cancelled"));
            }
        }

        Ok(PluginOutcome::from(json!({
            "slept_ms": duration.as_millis() as u64,
        })))
    }
}

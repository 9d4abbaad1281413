//! Plugin contract and registry.
//!
//! Every capability the engine can dispatch a step to implements [`Plugin`]:
//! one uniform `execute(ctx, params) -> outcome` surface. Configuration
//! differences live inside `params.config`, never in the interface, and a
//! plugin sees only what its params carry; the run context stays engine-side.

mod delay;
mod http;
mod registry;

pub use delay::DelayPlugin;
pub use http::HttpPlugin;
pub use registry::{PluginRegistry, RegistryBuilder};

use async_trait::async_trait;
use rocketship_types::{Assertion, EngineError, Save};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::watch;

/// Cooperative execution context handed to a running plugin.
///
/// Carries the run identity and the cancellation signal plugins must honour:
/// long-running work should race against [`ActivityContext::cancelled`].
#[derive(Debug, Clone)]
pub struct ActivityContext {
    run_id: String,
    cancel: watch::Receiver<bool>,
}

impl ActivityContext {
    pub fn new(run_id: impl Into<String>, cancel: watch::Receiver<bool>) -> Self {
        Self {
            run_id: run_id.into(),
            cancel,
        }
    }

    /// A context that is never cancelled, for tests and one-shot tools.
    ///
    /// The sender is dropped immediately; the receiver keeps reporting the
    /// initial `false` and [`ActivityContext::cancelled`] parks forever.
    pub fn detached(run_id: impl Into<String>) -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self {
            run_id: run_id.into(),
            cancel: receiver,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// True once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when cancellation is requested; never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut receiver = self.cancel.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender dropped without cancelling: park forever.
            futures_util::future::pending::<()>().await;
        }
    }
}

/// Everything a plugin invocation receives. Values are fully rendered; the
/// plugin never sees raw templates or the run context itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginParams {
    /// Rendered step configuration.
    pub config: JsonValue,
    /// Rendered assertions, for plugins that evaluate their own kinds.
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    /// Save rules, for plugins that resolve their own extraction kinds.
    #[serde(default)]
    pub save: Vec<Save>,
    /// Saved values visible to this step (init scope overlaid by runtime).
    #[serde(default)]
    pub state: HashMap<String, String>,
    /// Run environment map.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Run identifier.
    pub run: String,
}

/// What a plugin returns: its opaque output plus optional evidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginOutcome {
    /// Structured output assertions and saves are evaluated against.
    pub output: JsonValue,
    /// Request evidence (method, url, headers, body) when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<JsonValue>,
    /// Response evidence when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<JsonValue>,
    /// Extra log lines to forward to run subscribers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl From<JsonValue> for PluginOutcome {
    fn from(output: JsonValue) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }
}

/// A named capability the engine can dispatch steps to.
///
/// Implementations must be pure with respect to the workflow: no dependence
/// on process-global mutable state beyond their own resource pools, and
/// cooperative cancellation via the provided context.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique registry name, e.g. `http`.
    fn name(&self) -> &str;

    /// Execute one rendered step.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        params: &PluginParams,
    ) -> Result<PluginOutcome, EngineError>;
}

//! Shared fixtures for integration tests.
//!
//! [`StepEngine`] runs a tiny line-based language so lifecycle tests can
//! control exactly when a run blocks, fails or registers cleanup:
//!
//! ```text
//! // @macro:singleton
//! wait                 block until the gate opens or the run is cancelled
//! set x 1              globals["x"] = 1 (any JSON value)
//! incr x               globals["x"] += 1
//! return x             result is globals["x"]
//! dispose_fail boom    register a disposable that fails with "boom"
//! fail boom            raise a runtime error
//! ```
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use macrobox::{
    EngineError, ExecutionContext, InMemoryScriptSource, SandboxManager, ScriptEngine,
};
use tokio::sync::watch;

/// A latch that blocks `wait` steps until opened.
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Line-based engine for deterministic lifecycle tests.
#[derive(Clone, Default)]
pub struct StepEngine {
    gate: Gate,
}

impl StepEngine {
    pub fn new(gate: Gate) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl ScriptEngine for StepEngine {
    fn name(&self) -> &str {
        "step"
    }

    async fn run(
        &self,
        code: &str,
        context: &mut ExecutionContext,
    ) -> Result<serde_json::Value, EngineError> {
        let mut value = serde_json::Value::Null;
        for line in code.lines().map(str::trim) {
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let mut parts = line.splitn(3, ' ');
            let step = parts.next().unwrap_or_default();
            let arg = parts.next().unwrap_or_default();
            let rest = parts.next().unwrap_or_default();
            match step {
                "wait" => {
                    let token = context.cancellation().clone();
                    tokio::select! {
                        () = self.gate.wait() => {}
                        () = token.cancelled() => {}
                    }
                }
                "set" => {
                    let parsed = serde_json::from_str(rest)
                        .map_err(|e| EngineError::runtime(e.to_string()))?;
                    context.globals.insert(arg.to_string(), parsed);
                }
                "incr" => {
                    let current = context
                        .globals
                        .get(arg)
                        .and_then(serde_json::Value::as_i64)
                        .ok_or_else(|| EngineError::runtime(format!("{arg} is not defined")))?;
                    context
                        .globals
                        .insert(arg.to_string(), serde_json::json!(current + 1));
                }
                "return" => {
                    value = context
                        .globals
                        .get(arg)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                }
                "dispose_fail" => {
                    let message = arg.to_string();
                    context
                        .metadata()
                        .disposables
                        .push(move || -> anyhow::Result<()> { anyhow::bail!("{message}") })
                        .map_err(|e| EngineError::runtime(e.to_string()))?;
                }
                "fail" => return Err(EngineError::runtime(arg)),
                other => return Err(EngineError::runtime(format!("unknown step {other}"))),
            }
        }
        Ok(value)
    }
}

/// A manager over in-memory documents driven by [`StepEngine`].
pub fn step_manager(gate: &Gate) -> (SandboxManager, InMemoryScriptSource) {
    let source = InMemoryScriptSource::new();
    let manager = SandboxManager::builder()
        .with_engine(StepEngine::new(gate.clone()))
        .with_source(source.clone())
        .build();
    (manager, source)
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

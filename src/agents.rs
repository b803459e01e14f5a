//! Agent method catalogs and the inference backend seam.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::capability::Capability;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::protocol::{AgentKind, Params};

impl AgentKind {
    /// Methods an agent of this kind serves.
    pub fn capabilities(self) -> &'static [&'static str] {
        match self {
            AgentKind::Transcription => &["transcribe"],
            AgentKind::Vision => &[
                "detect_objects",
                "extract_text",
                "caption_image",
                "identify_graphs",
                "process_frame",
            ],
            AgentKind::Generation => &["generate_summary", "generate_pdf", "generate_powerpoint"],
            AgentKind::Orchestrator => &["run_workflow"],
        }
    }
}

/// The model behind an agent. Opaque to the protocol: it takes a method name
/// and parameters and produces a result.
#[async_trait::async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run one inference call.
    async fn invoke(&self, method: &str, params: Params) -> Result<Value>;
}

/// Backend for nodes started without a model. Every call fails.
#[derive(Debug, Clone, Copy)]
pub struct OfflineBackend {
    kind: AgentKind,
}

impl OfflineBackend {
    pub fn new(kind: AgentKind) -> Self {
        Self { kind }
    }
}

#[async_trait::async_trait]
impl InferenceBackend for OfflineBackend {
    async fn invoke(&self, method: &str, _params: Params) -> Result<Value> {
        Err(Error::HandlerFailure(format!(
            "no {} backend loaded for `{method}`",
            self.kind
        )))
    }
}

struct Forward {
    method: &'static str,
    backend: Arc<dyn InferenceBackend>,
}

#[async_trait::async_trait]
impl Capability for Forward {
    async fn invoke(&self, params: Params) -> Result<Value> {
        self.backend.invoke(self.method, params).await
    }
}

/// Register every catalog method of the endpoint's kind as a call into
/// `backend`.
///
/// The orchestrator has no backend; its catalog is served by
/// [`crate::workflow::mount_orchestrator`].
pub fn mount(endpoint: &Endpoint, backend: Arc<dyn InferenceBackend>) -> Result<()> {
    let kind = endpoint.kind();
    if kind == AgentKind::Orchestrator {
        return Err(Error::InvalidState(
            "orchestrator methods are served by the workflow runner".into(),
        ));
    }

    for &method in kind.capabilities() {
        endpoint.register(
            method,
            Arc::new(Forward {
                method,
                backend: backend.clone(),
            }),
        )?;
    }
    debug!(agent = %kind, methods = kind.capabilities().len(), "backend mounted");
    Ok(())
}

/// Register `ping` and `describe`.
pub fn mount_builtins(endpoint: &Endpoint) -> Result<()> {
    endpoint.register_fn("ping", |_| async { Ok(json!({ "pong": true })) })?;

    let handle = endpoint.downgrade();
    endpoint.register_fn("describe", move |_| {
        let handle = handle.clone();
        async move {
            let endpoint = handle
                .upgrade()
                .ok_or_else(|| Error::InvalidState("endpoint dropped".into()))?;
            Ok(json!({
                "agent": endpoint.kind(),
                "methods": endpoint.methods(),
            }))
        }
    })
}

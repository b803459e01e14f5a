//! Workflow management for multi-step orchestrator tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::protocol::{AgentKind, Params};

/// A workflow represents a multi-step task driven by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow ID.
    pub id: String,
    /// Workflow name/description.
    pub name: String,
    /// Current state.
    pub state: WorkflowState,
    /// Workflow steps.
    pub steps: Vec<WorkflowStep>,
    /// Current step index.
    pub current_step: usize,
    /// Step outputs keyed by step name.
    pub context: Map<String, Value>,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// When the workflow was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a new workflow.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            state: WorkflowState::Pending,
            steps: Vec::new(),
            current_step: 0,
            context: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Transcribe a media file, then summarise the transcript.
    pub fn media_summary(file_path: impl Into<String>) -> Self {
        let mut transcribe = Params::new();
        transcribe.insert("file_path".into(), Value::String(file_path.into()));
        let mut summarise = Params::new();
        summarise.insert("text".into(), Value::String("$transcribe.text".into()));

        let mut workflow = Self::new("media summary");
        workflow.add_step(WorkflowStep::call(
            "transcribe",
            CallSpec::new(AgentKind::Transcription, "transcribe", transcribe),
        ));
        workflow.add_step(WorkflowStep::call(
            "generate_summary",
            CallSpec::new(AgentKind::Generation, "generate_summary", summarise),
        ));
        workflow
    }

    /// Add a step to the workflow.
    pub fn add_step(&mut self, step: WorkflowStep) {
        self.steps.push(step);
        self.updated_at = Utc::now();
    }

    /// Get the current step.
    pub fn current(&self) -> Option<&WorkflowStep> {
        self.steps.get(self.current_step)
    }

    /// Get the current step mutably.
    pub fn current_mut(&mut self) -> Option<&mut WorkflowStep> {
        self.steps.get_mut(self.current_step)
    }

    /// Advance to the next step.
    pub fn advance(&mut self) -> Result<()> {
        if self.current_step >= self.steps.len() {
            return Err(Error::InvalidState("workflow already complete".into()));
        }
        self.current_step += 1;
        self.updated_at = Utc::now();

        if self.current_step >= self.steps.len() {
            self.state = WorkflowState::Completed;
        }
        Ok(())
    }

    /// Set workflow to failed state.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = WorkflowState::Failed {
            reason: reason.into(),
        };
        self.updated_at = Utc::now();
    }

    /// Check if workflow is complete.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.state,
            WorkflowState::Completed | WorkflowState::Failed { .. }
        )
    }

    /// Set context value.
    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    /// Get context value.
    pub fn get_context(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }
}

/// State of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowState {
    /// Workflow is pending, not yet started.
    Pending,
    /// Workflow is running.
    Running,
    /// Workflow completed successfully.
    Completed,
    /// Workflow failed.
    Failed { reason: String },
}

/// A single step in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step name; its output is stored under this key in the context.
    pub name: String,
    /// What the step does.
    #[serde(flatten)]
    pub config: StepConfig,
    /// Step state.
    #[serde(default)]
    pub state: StepState,
    /// Result of the step (if completed).
    #[serde(default)]
    pub result: Option<StepResult>,
}

impl WorkflowStep {
    /// Create a step.
    pub fn new(name: impl Into<String>, config: StepConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: StepState::Pending,
            result: None,
        }
    }

    /// Create a single call step.
    pub fn call(name: impl Into<String>, spec: CallSpec) -> Self {
        Self::new(name, StepConfig::Call(spec))
    }

    /// Create a fan-out step.
    pub fn parallel(name: impl Into<String>, calls: Vec<CallSpec>) -> Self {
        Self::new(name, StepConfig::Parallel { calls })
    }

    /// Create a notification step.
    pub fn publish(name: impl Into<String>, method: impl Into<String>, params: Params) -> Self {
        Self::new(
            name,
            StepConfig::Publish {
                method: method.into(),
                params,
            },
        )
    }

    /// Mark step as running.
    pub fn start(&mut self) {
        self.state = StepState::Running;
    }

    /// Mark step as completed with result.
    pub fn complete(&mut self, result: StepResult) {
        self.state = StepState::Completed;
        self.result = Some(result);
    }

    /// Mark step as failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = StepState::Failed {
            reason: reason.into(),
        };
    }
}

/// State of a workflow step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepState {
    /// Step is pending.
    #[default]
    Pending,
    /// Step is running.
    Running,
    /// Step completed successfully.
    Completed,
    /// Step failed.
    Failed { reason: String },
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// One request issued by a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallSpec {
    pub target: AgentKind,
    pub method: String,
    /// String values of the form `$step` or `$step.field` are replaced with
    /// earlier step outputs.
    #[serde(default)]
    pub params: Params,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl CallSpec {
    /// Create a call with the default timeout.
    pub fn new(target: AgentKind, method: impl Into<String>, params: Params) -> Self {
        Self {
            target,
            method: method.into(),
            params,
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Override the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Configuration for a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Send one request.
    Call(CallSpec),
    /// Send several requests concurrently; all must succeed.
    Parallel { calls: Vec<CallSpec> },
    /// Broadcast a notification.
    Publish {
        method: String,
        #[serde(default)]
        params: Params,
    },
}

/// Result of a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    /// Step output. Parallel steps produce an array in call order.
    pub output: Value,
    /// Execution time in milliseconds.
    pub duration_ms: u64,
}

/// Outcome of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowReport {
    pub id: String,
    pub name: String,
    pub state: WorkflowState,
    pub completed_steps: usize,
    /// Step outputs keyed by step name.
    pub outputs: Map<String, Value>,
    pub duration_ms: u64,
}

/// Replace `$step` / `$step.field` references in `value` with context
/// entries.
///
/// Only strings naming a step already in `context` are references; any other
/// string, such as `"$5 off"`, is kept as is. A leading `$$` stands for a
/// literal `$`. A known step without the requested field is an error.
pub fn substitute(value: &Value, context: &Map<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) => {
            if let Some(literal) = s.strip_prefix("$$") {
                return Ok(Value::String(format!("${literal}")));
            }
            match s.strip_prefix('$') {
                Some(reference) => match lookup(reference, context) {
                    Lookup::Found(output) => Ok(output.clone()),
                    Lookup::MissingField => {
                        Err(Error::InvalidParams(format!("unresolved reference {s}")))
                    }
                    Lookup::UnknownStep => Ok(value.clone()),
                },
                None => Ok(value.clone()),
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, context))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(fields) => substitute_params(fields, context).map(Value::Object),
        _ => Ok(value.clone()),
    }
}

fn substitute_params(params: &Params, context: &Map<String, Value>) -> Result<Params> {
    params
        .iter()
        .map(|(key, value)| Ok((key.clone(), substitute(value, context)?)))
        .collect()
}

enum Lookup<'a> {
    Found(&'a Value),
    MissingField,
    UnknownStep,
}

fn lookup<'a>(reference: &str, context: &'a Map<String, Value>) -> Lookup<'a> {
    let (step, field) = match reference.split_once('.') {
        Some((step, field)) => (step, Some(field)),
        None => (reference, None),
    };
    let Some(output) = context.get(step) else {
        return Lookup::UnknownStep;
    };
    match field {
        Some(field) => output.get(field).map_or(Lookup::MissingField, Lookup::Found),
        None => Lookup::Found(output),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Executes workflows through an endpoint.
#[derive(Clone)]
pub struct WorkflowRunner {
    endpoint: Endpoint,
}

impl WorkflowRunner {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Run every step in order. The first failing step fails the workflow
    /// and later steps are not attempted.
    pub async fn run(&self, mut workflow: Workflow) -> WorkflowReport {
        let started = Instant::now();
        workflow.state = WorkflowState::Running;
        info!(
            workflow = %workflow.id,
            name = %workflow.name,
            steps = workflow.steps.len(),
            "workflow started"
        );

        while let Some(step) = workflow.current_mut() {
            step.start();
            let name = step.name.clone();
            let config = step.config.clone();
            let step_started = Instant::now();

            match self.execute(&config, &workflow.context).await {
                Ok(output) => {
                    if let Some(step) = workflow.current_mut() {
                        step.complete(StepResult {
                            output: output.clone(),
                            duration_ms: elapsed_ms(step_started),
                        });
                    }
                    workflow.set_context(name, output);
                    if let Err(e) = workflow.advance() {
                        workflow.fail(e.to_string());
                        break;
                    }
                }
                Err(e) => {
                    warn!(workflow = %workflow.id, step = %name, %e, "workflow step failed");
                    if let Some(step) = workflow.current_mut() {
                        step.fail(e.to_string());
                    }
                    workflow.fail(format!("step `{name}` failed: {e}"));
                    break;
                }
            }
        }

        if workflow.state == WorkflowState::Running {
            workflow.state = WorkflowState::Completed;
        }
        info!(workflow = %workflow.id, state = ?workflow.state, "workflow finished");

        let completed_steps = workflow
            .steps
            .iter()
            .filter(|step| step.state == StepState::Completed)
            .count();
        WorkflowReport {
            id: workflow.id,
            name: workflow.name,
            state: workflow.state,
            completed_steps,
            outputs: workflow.context,
            duration_ms: elapsed_ms(started),
        }
    }

    async fn execute(&self, config: &StepConfig, context: &Map<String, Value>) -> Result<Value> {
        match config {
            StepConfig::Call(spec) => self.call(spec, context).await,
            StepConfig::Parallel { calls } => {
                let results = join_all(calls.iter().map(|spec| self.call(spec, context))).await;
                results
                    .into_iter()
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array)
            }
            StepConfig::Publish { method, params } => {
                let params = substitute_params(params, context)?;
                self.endpoint.publish(method.as_str(), params).await?;
                Ok(Value::Null)
            }
        }
    }

    async fn call(&self, spec: &CallSpec, context: &Map<String, Value>) -> Result<Value> {
        let params = substitute_params(&spec.params, context)?;
        self.endpoint
            .send_request(
                spec.target,
                spec.method.as_str(),
                params,
                Duration::from_millis(spec.timeout_ms),
            )
            .await
    }
}

#[derive(Debug, Deserialize)]
struct RunWorkflow {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    steps: Vec<WorkflowStep>,
}

/// Register the orchestrator's `run_workflow` capability.
///
/// Accepts either explicit `steps` or a `file_path` for the media summary
/// pipeline. A failed workflow is reported as a handler failure.
pub fn mount_orchestrator(endpoint: &Endpoint) -> Result<()> {
    let handle = endpoint.downgrade();
    endpoint.register_typed("run_workflow", move |args: RunWorkflow| {
        let handle = handle.clone();
        async move {
            let endpoint = handle
                .upgrade()
                .ok_or_else(|| Error::InvalidState("orchestrator dropped".into()))?;

            let mut workflow = match (args.steps.is_empty(), args.file_path) {
                (false, _) => {
                    let mut workflow = Workflow::new(args.name.as_deref().unwrap_or("workflow"));
                    for step in args.steps {
                        workflow.add_step(step);
                    }
                    workflow
                }
                (true, Some(file_path)) => Workflow::media_summary(file_path),
                (true, None) => {
                    return Err(Error::InvalidParams(
                        "run_workflow needs `steps` or `file_path`".into(),
                    ))
                }
            };
            if let Some(name) = args.name {
                workflow.name = name;
            }

            let report = WorkflowRunner::new(endpoint).run(workflow).await;
            match &report.state {
                WorkflowState::Failed { reason } => Err(Error::HandlerFailure(reason.clone())),
                _ => Ok(report),
            }
        }
    })
}

//! Procedure runner
//!
//! Drives one action run end to end: `start` on the state machine, then every
//! sequence node downstream of the action is compiled against the start
//! payload and executed in traversal order, then `completed`. Error check
//! nodes met on the way ask their device for pending errors. A validation
//! error, a fatal step failure or a failed error check stops the action
//! instead. Errors the device reports are recorded, not fatal.
//!
//! Step events and measurement results of every run are published on one
//! broadcast channel.

use crate::action::graph::ERROR_CHECK_NODE_TYPE;
use crate::action::{
    trigger_result, ActionPayload, ActionStateMachine, RunHandle, TriggerRequest, TriggerResult,
    TriggerType,
};
use crate::catalog::DriverCatalog;
use crate::error::{AppResult, CalError};
use crate::executor::{
    ErrorCheckReport, ExecutionEvent, RunContext, SequenceExecutor, StepResult,
};
use crate::results::{build_results, MeasurementResult};
use crate::sequence::{BindingContext, Plan};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

/// Published while runs progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum RunOutput {
    /// A step result or bulk batch.
    Step(ExecutionEvent),
    /// A measurement evaluated from a sequence node's responses.
    Result(MeasurementResult),
    /// The outcome of an error check node.
    ErrorCheck(ErrorCheckReport),
}

/// Everything one completed run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Start payload of the run.
    pub payload: ActionPayload,
    /// Every step result in execution order.
    pub steps: Vec<StepResult>,
    /// Every measurement evaluated.
    pub results: Vec<MeasurementResult>,
    /// Every error check performed.
    #[serde(default)]
    pub error_checks: Vec<ErrorCheckReport>,
}

/// Runs actions of one procedure.
pub struct ProcedureRunner {
    machine: Arc<ActionStateMachine>,
    executor: Arc<SequenceExecutor>,
    catalog: Arc<DriverCatalog>,
    outputs: broadcast::Sender<RunOutput>,
}

impl ProcedureRunner {
    /// Runner driving `machine` with `executor`, compiling against `catalog`.
    pub fn new(
        machine: Arc<ActionStateMachine>,
        executor: Arc<SequenceExecutor>,
        catalog: Arc<DriverCatalog>,
    ) -> Self {
        let (outputs, _) = broadcast::channel(executor.event_capacity());
        Self {
            machine,
            executor,
            catalog,
            outputs,
        }
    }

    /// State machine of the procedure.
    pub fn machine(&self) -> &Arc<ActionStateMachine> {
        &self.machine
    }

    /// Subscribe to step events, results and error checks.
    pub fn subscribe(&self) -> broadcast::Receiver<RunOutput> {
        self.outputs.subscribe()
    }

    /// Start the requested action and wait for its run to finish.
    ///
    /// `request` must be a `start` request.
    pub async fn run(&self, request: &TriggerRequest) -> AppResult<RunReport> {
        if request.kind != TriggerType::Start {
            return Err(CalError::Configuration(format!(
                "'{}' request does not start a run",
                request.kind
            )));
        }
        let handle = self.machine.apply(request).await?.ok_or_else(|| {
            CalError::Configuration("start request granted no run".to_string())
        })?;
        self.drive(handle).await
    }

    /// Apply a trigger request. A granted start runs on a background task.
    pub async fn trigger(self: &Arc<Self>, request: &TriggerRequest) -> TriggerResult {
        let outcome = self.machine.apply(request).await;
        if let Ok(Some(handle)) = &outcome {
            self.spawn_run(handle.clone());
        }
        trigger_result(request, &outcome)
    }

    fn spawn_run(self: &Arc<Self>, handle: RunHandle) -> JoinHandle<AppResult<RunReport>> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.drive(handle).await })
    }

    async fn drive(&self, handle: RunHandle) -> AppResult<RunReport> {
        let payload = handle.payload.clone();
        let span = info_span!(
            "run",
            run_id = %payload.run_id,
            section = %payload.section,
            action = %payload.action
        );

        async {
            let bindings = BindingContext::with_message(json!({ "payload": &payload }));
            let mut run = RunContext::new(payload.run_id.clone());
            let mut report = RunReport {
                payload: payload.clone(),
                steps: Vec::new(),
                results: Vec::new(),
                error_checks: Vec::new(),
            };

            let graph = Arc::clone(self.machine.graph());
            for node in graph.downstream_work(handle.node) {
                let flow = graph.node(node);
                if flow.is_kind(ERROR_CHECK_NODE_TYPE) {
                    let unit_id = flow.unit_id.as_deref().unwrap_or_default();
                    let kind = flow.check_type.unwrap_or_default();
                    let check = match self.executor.check_errors(unit_id, kind).await {
                        Ok(check) => check,
                        Err(e) => {
                            error!(node = %flow.id, error = %e, "Error check failed");
                            self.machine.stop(handle.node).await?;
                            return Err(e);
                        }
                    };
                    let _ = self.outputs.send(RunOutput::ErrorCheck(check.clone()));
                    report.error_checks.push(check);
                    continue;
                }
                let Some(document) = flow.sequence_document() else {
                    continue;
                };

                let plan = match document.compile(&self.catalog, &bindings) {
                    Ok(plan) => plan,
                    Err(errors) => {
                        for e in &errors {
                            error!(node = %flow.id, error = %e, "Sequence failed validation");
                        }
                        self.machine.stop(handle.node).await?;
                        return Err(CalError::Validation(errors));
                    }
                };

                let steps = match self.execute(&plan, &mut run, &handle).await {
                    Ok(steps) => steps,
                    Err(CalError::Cancelled) => {
                        info!("Run cancelled");
                        return Err(CalError::Cancelled);
                    }
                    Err(e) => {
                        error!(node = %flow.id, error = %e, "Run failed");
                        self.machine.stop(handle.node).await?;
                        return Err(e);
                    }
                };

                let specs = flow.results.as_deref().unwrap_or_default();
                for result in build_results(specs, &payload, &steps) {
                    let _ = self.outputs.send(RunOutput::Result(result.clone()));
                    report.results.push(result);
                }
                report.steps.extend(steps);
            }

            self.machine.completed(&payload).await?;
            info!(
                steps = report.steps.len(),
                results = report.results.len(),
                error_checks = report.error_checks.len(),
                "Run completed"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Execute one plan, forwarding its events to subscribers as they arrive.
    async fn execute(
        &self,
        plan: &Plan,
        run: &mut RunContext,
        handle: &RunHandle,
    ) -> AppResult<Vec<StepResult>> {
        let (tx, mut rx) = mpsc::channel(self.executor.event_capacity());
        let outputs = self.outputs.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = outputs.send(RunOutput::Step(event));
            }
        });

        let outcome = self.executor.execute(plan, run, &handle.cancel, &tx).await;
        drop(tx);
        let _ = forward.await;
        outcome
    }
}

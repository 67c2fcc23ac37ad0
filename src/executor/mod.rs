//! Sequence executor
//!
//! Runs a compiled [`Plan`] step by step against the interfaces held by an
//! [`InterfaceManager`]. Steps are strictly ordered: a later step may render a
//! response an earlier one stored under its tag.
//!
//! ## Failure policy
//!
//! - `command` steps: a transport or render failure is fatal. The run stops
//!   with [`CalError::StepFailed`] carrying the step index.
//! - `delay`, `reset` and `trigger` steps: failures are logged at `warn` and
//!   execution continues.
//!
//! Every suspension point races the run's [`CancelSignal`]; once raised no
//! further step starts.

/// Cooperative cancellation.
pub mod cancel;
/// Instrument error checks.
pub mod check;
/// Step results and events.
pub mod report;
/// Read retry policy.
pub mod retry;

pub use cancel::CancelSignal;
pub use check::{ErrorCheckKind, ErrorCheckReport};
pub use report::{ExecutionEvent, StepBatch, StepResult};
pub use retry::RetryPolicy;

use crate::config::{DeviceBinding, EngineConfig};
use crate::error::{AppResult, CalError, StepFailure};
use crate::instruction::{render, Bindings, DataType};
use crate::sequence::{BoundInstruction, CommandStep, Plan, ResetTarget, Step};
use crate::transport::{InterfaceManager, ReadMode, TransportError};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Per-run state threaded through every step.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Run the steps belong to.
    pub run_id: String,
    /// Response tags and variables seen so far
    pub bindings: Bindings,
}

impl RunContext {
    /// Empty context for `run_id`.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            bindings: Bindings::new(),
        }
    }

    /// Seed driver variables, e.g. from a driver's defaults.
    pub fn with_variables(mut self, variables: impl IntoIterator<Item = (String, String)>) -> Self {
        for (name, value) in variables {
            self.bindings.set_variable(name, value);
        }
        self
    }
}

/// Executes plans against configured devices.
pub struct SequenceExecutor {
    interfaces: Arc<InterfaceManager>,
    devices: HashMap<String, DeviceBinding>,
    retry: RetryPolicy,
    event_capacity: usize,
}

impl SequenceExecutor {
    /// Executor over `interfaces` with one binding per unit id.
    pub fn new(
        interfaces: Arc<InterfaceManager>,
        devices: impl IntoIterator<Item = DeviceBinding>,
    ) -> Self {
        Self {
            interfaces,
            devices: devices
                .into_iter()
                .map(|d| (d.unit_id.clone(), d))
                .collect(),
            retry: RetryPolicy::default(),
            event_capacity: 256,
        }
    }

    /// Executor configured from `[execution]` and `[[devices]]`.
    pub fn from_config(config: &EngineConfig, interfaces: Arc<InterfaceManager>) -> Self {
        Self::new(interfaces, config.devices.iter().cloned())
            .with_retry_policy(RetryPolicy::new(
                config.execution.default_read_attempts,
                config.execution.retry_backoff,
            ))
            .with_event_capacity(config.execution.event_capacity)
    }

    /// Replace the read retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Capacity of the event channel `spawn` returns.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Interfaces the executor leases from.
    pub fn interfaces(&self) -> &Arc<InterfaceManager> {
        &self.interfaces
    }

    /// Capacity of the event channel `spawn` returns.
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    /// Check that every unit and interface the plan names exists.
    pub fn bind(&self, plan: &Plan) -> AppResult<()> {
        for unit in plan.unit_ids() {
            let device = self
                .devices
                .get(unit)
                .ok_or_else(|| CalError::UnknownUnit(unit.to_string()))?;
            if !self.interfaces.contains(&device.interface) {
                return Err(CalError::UnknownInterface(device.interface.clone()));
            }
        }
        for step in &plan.steps {
            if let Step::Reset(ResetTarget::Interface { interface_id }) = step {
                if !self.interfaces.contains(interface_id) {
                    return Err(CalError::UnknownInterface(interface_id.clone()));
                }
            }
        }
        Ok(())
    }

    /// Run `plan` to completion, cancellation or the first fatal failure.
    ///
    /// Results go to `events` one per step, or as one [`StepBatch`] at the end
    /// when the plan responds in bulk. A fatal step failure still emits its
    /// result, in bulk mode as the last entry of the batch. A failed or
    /// cancelled run returns only the error.
    pub async fn execute(
        &self,
        plan: &Plan,
        run: &mut RunContext,
        cancel: &CancelSignal,
        events: &mpsc::Sender<ExecutionEvent>,
    ) -> AppResult<Vec<StepResult>> {
        self.bind(plan)?;
        let span = info_span!("execute", run_id = %run.run_id, steps = plan.len());

        async {
            let mut results = Vec::with_capacity(plan.len());
            for (index, step) in plan.steps.iter().enumerate() {
                if cancel.is_cancelled() {
                    info!(index, "Run cancelled before step");
                    return Err(CalError::Cancelled);
                }

                let step_span = info_span!("step", index, kind = step.kind_name());
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(index, "Run cancelled during step");
                        return Err(CalError::Cancelled);
                    }
                    outcome = self.run_step(index, step, run).instrument(step_span) => outcome,
                };

                let fatal = matches!(step, Step::Command(_) | Step::SetVariable { .. });
                let result = match outcome {
                    Ok(result) => result,
                    Err((mut result, failure)) if fatal => {
                        error!(index, error = %failure, "Command step failed");
                        result.error = Some(failure.to_string());
                        let event = if plan.respond_in_bulk {
                            results.push(result);
                            ExecutionEvent::Batch(StepBatch {
                                respond_in_bulk: true,
                                results,
                            })
                        } else {
                            ExecutionEvent::Step(result)
                        };
                        emit(events, event).await;
                        return Err(CalError::StepFailed {
                            index,
                            source: failure,
                        });
                    }
                    Err((mut result, failure)) => {
                        warn!(index, kind = step.kind_name(), error = %failure, "Step failed, continuing");
                        result.error = Some(failure.to_string());
                        result
                    }
                };

                if !plan.respond_in_bulk {
                    emit(events, ExecutionEvent::Step(result.clone())).await;
                }
                results.push(result);
            }

            if plan.respond_in_bulk {
                emit(
                    events,
                    ExecutionEvent::Batch(StepBatch {
                        respond_in_bulk: true,
                        results: results.clone(),
                    }),
                )
                .await;
            }
            info!(steps = results.len(), "Plan executed");
            Ok(results)
        }
        .instrument(span)
        .await
    }

    /// Execute on a background task, streaming events.
    pub fn spawn(
        self: &Arc<Self>,
        plan: Plan,
        mut run: RunContext,
        cancel: CancelSignal,
    ) -> (
        ReceiverStream<ExecutionEvent>,
        JoinHandle<AppResult<Vec<StepResult>>>,
    ) {
        let (tx, rx) = mpsc::channel(self.event_capacity);
        let executor = Arc::clone(self);
        let task = tokio::spawn(async move { executor.execute(&plan, &mut run, &cancel, &tx).await });
        (ReceiverStream::new(rx), task)
    }

    fn device(&self, unit_id: &str) -> Result<&DeviceBinding, TransportError> {
        self.devices.get(unit_id).ok_or(TransportError::NotConfigured)
    }

    async fn run_step(
        &self,
        index: usize,
        step: &Step,
        run: &mut RunContext,
    ) -> Result<StepResult, (StepResult, StepFailure)> {
        let mut result = StepResult::new(index, &run.run_id, step.kind_name(), step.unit_id());
        let outcome = match step {
            Step::Command(command) => self.command(command, run, &mut result).await,
            Step::SetVariable {
                variable,
                instruction,
            } => set_variable(variable, instruction, run, &mut result),
            Step::Delay(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            Step::Reset(target) => self.reset(target).await,
            Step::Trigger { unit_id } => self.trigger(unit_id).await,
        };
        match outcome {
            Ok(()) => Ok(result),
            Err(failure) => Err((result, failure)),
        }
    }

    async fn command(
        &self,
        command: &CommandStep,
        run: &mut RunContext,
        result: &mut StepResult,
    ) -> Result<(), StepFailure> {
        if !command.delay_before.is_zero() {
            tokio::time::sleep(command.delay_before).await;
        }

        let device = self.device(&command.unit_id)?;
        let text = match &command.instruction {
            Some(bound) => Some(render(&bound.instruction, &bound.arguments, &run.bindings)?),
            None => command.write_data.clone(),
        };
        result.command = text.clone();

        let mut handle = self.interfaces.lease(&device.interface).await?;
        if let (Some(address), Some(gpib)) = (device.gpib_address, handle.gpib_mut()) {
            gpib.set_address(address).await?;
        }
        let transport = handle.transport_mut();

        if command.kind.writes() {
            transport.write_string(text.as_deref().unwrap_or_default()).await?;
        }

        if let Some(read) = &command.read {
            let mode = read.length.map_or(ReadMode::Terminated, ReadMode::Length);
            let data_type = read.data_type;
            let policy = self.retry.with_attempts(command.read_attempts);
            let ((raw, value), attempts) = policy
                .run(transport, move |t| {
                    async move {
                        let raw = t.read(mode).await?;
                        let value = data_type.convert(&raw)?;
                        Ok((raw, value))
                    }
                    .boxed()
                })
                .await?;

            let raw_text = match data_type {
                DataType::Binary => String::from_utf8_lossy(&raw).into_owned(),
                _ => String::from_utf8_lossy(&raw).trim().to_string(),
            };
            debug!(tag = %read.response_tag, attempts, "Response stored");
            run.bindings.set_response(&read.response_tag, raw_text.clone());
            result.response_tag = Some(read.response_tag.clone());
            result.raw_value = Some(raw_text);
            result.value = Some(value);
            result.attempts = attempts;
        }
        drop(handle);

        if !command.delay_after.is_zero() {
            tokio::time::sleep(command.delay_after).await;
        }
        Ok(())
    }

    async fn reset(&self, target: &ResetTarget) -> Result<(), StepFailure> {
        match target {
            ResetTarget::Device { unit_id } => {
                let device = self.device(unit_id)?;
                let mut handle = self.interfaces.lease(&device.interface).await?;
                match handle.gpib_mut() {
                    Some(gpib) => gpib.selected_device_clear(device.gpib_address).await?,
                    None => warn!(unit = %unit_id, "Device clear needs a GPIB interface, skipped"),
                }
            }
            ResetTarget::Interface { interface_id } => {
                let mut handle = self.interfaces.lease(interface_id).await?;
                match handle.gpib_mut() {
                    Some(gpib) => gpib.reset().await?,
                    None => {
                        let transport = handle.transport_mut();
                        transport.disconnect().await?;
                        transport.connect().await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn trigger(&self, unit_id: &str) -> Result<(), StepFailure> {
        let device = self.device(unit_id)?;
        let mut handle = self.interfaces.lease(&device.interface).await?;
        match handle.gpib_mut() {
            Some(gpib) => {
                let address = device.gpib_address.ok_or(TransportError::NotConfigured)?;
                gpib.trigger(&[address]).await?
            }
            None => warn!(unit = %unit_id, "Trigger needs a GPIB interface, skipped"),
        }
        Ok(())
    }
}

fn set_variable(
    variable: &str,
    bound: &BoundInstruction,
    run: &mut RunContext,
    result: &mut StepResult,
) -> Result<(), StepFailure> {
    let value = render(&bound.instruction, &bound.arguments, &run.bindings)?;
    debug!(variable, value = %value, "Variable assigned");
    run.bindings.set_variable(variable, value.clone());
    result.command = Some(value);
    Ok(())
}

async fn emit(events: &mpsc::Sender<ExecutionEvent>, event: ExecutionEvent) {
    if events.send(event).await.is_err() {
        debug!("Result receiver dropped");
    }
}

/// Delay applied by `delay` steps, exposed for the CLI summary.
pub fn total_delay(plan: &Plan) -> Duration {
    plan.steps
        .iter()
        .map(|step| match step {
            Step::Delay(d) => *d,
            Step::Command(c) => c.delay_before + c.delay_after,
            _ => Duration::ZERO,
        })
        .sum()
}

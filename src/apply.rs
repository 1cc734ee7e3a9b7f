//! Plan realisation and the reconcile entry point.
//!
//! A plan is applied either step by step through `reg add` / `reg delete`
//! or as one generated document handed to `reg import`. The document lives
//! in a uniquely named temporary file that is removed when the operation
//! ends, whether it succeeded, failed or was stopped.

use crate::cancel::{Cancellable, StopHandle};
use crate::config::RegConfig;
use crate::document::render_plan;
use crate::error::{is_quiet_success, RegistryError, Result};
use crate::plan::{build_plan, select_mode, ApplyMode, ExecutionPlan, ExecutionStep, ReconcileOptions};
use crate::process::{AddCommand, CommandOutput, DeleteCommand, RegBackend, RegView};
use crate::query::{QueryOptions, RegClient};
use crate::state::{QueryResult, RegistryStruct};
use crate::utils::encode_utf16le_document;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Outcome of applying a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ApplyReport {
    /// The plan that was computed.
    pub plan: ExecutionPlan,
    /// How it was applied.
    pub mode: ApplyMode,
    /// Steps applied before the operation finished. Less than the plan
    /// length only when the operation was stopped early.
    pub applied: usize,
}

/// Checks a mutating command's output.
///
/// # Errors
///
/// Known stderr signatures map to their typed error; any other non-zero exit
/// or stderr other than the success message is `UnknownFailure`.
pub fn check_completion(output: &CommandOutput) -> Result<()> {
    if let Some(e) = RegistryError::from_stderr(&output.stderr) {
        return Err(e);
    }
    if output.code != Some(0) || !is_quiet_success(&output.stderr) {
        return Err(RegistryError::unknown_failure(output.code, &output.stderr));
    }
    Ok(())
}

async fn bounded<F>(timeout: Option<Duration>, command: F) -> Result<CommandOutput>
where
    F: Future<Output = Result<CommandOutput>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, command)
            .await
            .map_err(|_| RegistryError::Timeout(limit))?,
        None => command.await,
    }
}

impl RegClient {
    /// Applies `plan` in `mode`.
    ///
    /// Stopping finishes after the step in flight; the report says how many
    /// steps ran. Each tool invocation is bounded by the configured timeout.
    pub fn apply_plan(&self, plan: ExecutionPlan, mode: ApplyMode, view: RegView) -> Cancellable<ApplyReport> {
        let backend = self.backend().clone();
        let config = self.config().clone();
        Cancellable::new(move |stop| async move {
            let applied = run_plan(&backend, &config, &plan, mode, view, &stop).await?;
            Ok(ApplyReport { plan, mode, applied })
        })
    }

    /// Moves the registry towards `desired`.
    ///
    /// Queries the current state of every desired key and every explicit
    /// deletion target, builds the plan, selects the apply mode and applies
    /// it. Stopping during the read returns an empty report without writing.
    pub fn reconcile(&self, desired: RegistryStruct, options: ReconcileOptions) -> Cancellable<ApplyReport> {
        let client = self.clone();
        Cancellable::new(move |stop| async move {
            let current = client.read_current(&desired, &options, &stop).await?;
            if stop.is_stopped() {
                info!("Reconcile stopped before any change was applied");
                return Ok(ApplyReport {
                    plan: ExecutionPlan::default(),
                    mode: ApplyMode::Direct,
                    applied: 0,
                });
            }

            let plan = build_plan(&desired, &current, &options);
            let mode = select_mode(&plan, options.mode);
            info!(steps = plan.len(), ?mode, "Applying reconciliation plan");
            let applied = run_plan(client.backend(), client.config(), &plan, mode, options.view, &stop).await?;
            Ok(ApplyReport { plan, mode, applied })
        })
    }

    async fn read_current(
        &self,
        desired: &RegistryStruct,
        options: &ReconcileOptions,
        stop: &StopHandle,
    ) -> Result<QueryResult> {
        let queries: Vec<QueryOptions> = options
            .query_keys(desired)
            .into_iter()
            .map(|key| {
                let mut query = QueryOptions::new(key);
                query.view = options.view;
                query
            })
            .collect();
        if queries.is_empty() {
            return Ok(QueryResult::default());
        }
        self.query_many_with_stop(queries, None, stop.child()).await
    }
}

#[instrument(skip_all, fields(steps = plan.len(), ?mode))]
async fn run_plan(
    backend: &Arc<dyn RegBackend>,
    config: &RegConfig,
    plan: &ExecutionPlan,
    mode: ApplyMode,
    view: RegView,
    stop: &StopHandle,
) -> Result<usize> {
    if plan.is_empty() {
        debug!("Nothing to apply");
        return Ok(0);
    }
    match mode {
        ApplyMode::Direct => run_direct(backend, config, plan, view, stop).await,
        ApplyMode::Document => run_document(backend, config, plan, view).await,
    }
}

async fn run_direct(
    backend: &Arc<dyn RegBackend>,
    config: &RegConfig,
    plan: &ExecutionPlan,
    view: RegView,
    stop: &StopHandle,
) -> Result<usize> {
    let mut applied = 0;
    for step in plan {
        if stop.is_stopped() {
            info!(applied, "Apply stopped early");
            break;
        }
        let output = match step {
            ExecutionStep::Add { key, value } => {
                let command = AddCommand {
                    key: key.clone(),
                    value: value.clone(),
                    separator: config.separator,
                    view,
                };
                bounded(config.timeout, backend.add(&command)).await?
            }
            ExecutionStep::Delete { key, value } => {
                let command = DeleteCommand {
                    key: key.clone(),
                    value: value.clone(),
                    view,
                };
                bounded(config.timeout, backend.delete(&command)).await?
            }
        };
        check_completion(&output)?;
        applied += 1;
    }
    Ok(applied)
}

async fn run_document(
    backend: &Arc<dyn RegBackend>,
    config: &RegConfig,
    plan: &ExecutionPlan,
    view: RegView,
) -> Result<usize> {
    let text = render_plan(plan)?;

    // Deleted when `document` goes out of scope.
    let document = tempfile::Builder::new()
        .prefix(&config.temp_prefix)
        .suffix(".reg")
        .tempfile()?
        .into_temp_path();
    tokio::fs::write(&document, encode_utf16le_document(&text)).await?;
    debug!(path = %document.display(), bytes = text.len(), "Importing generated document");

    let output = bounded(config.timeout, backend.import(&document, view)).await?;
    check_completion(&output)?;
    Ok(plan.len())
}

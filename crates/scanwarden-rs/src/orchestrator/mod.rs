//! Scan orchestration: plan resolution, bounded or serial execution through a
//! [`ToolRunner`], normalization, aggregation and the scan state machine.

mod aggregate;
mod registry;

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{debug, error, info, warn};

pub use self::aggregate::summarize;
use self::{
    aggregate::Aggregate,
    registry::{CancelRequest, ScanRegistry},
};
use crate::{
    config::AppConfig,
    error::ScanError,
    executor::{check_request, CancelToken, ToolRunner},
    models::{
        AggregatedScanResult, ProgressEvent, ScanEvent, ScanPhase, ScanRecord, ScanState, ScanStatus,
        ToolExecutionResult, VulnerabilityRecord,
    },
    normalizers::normalize,
    plan::{ExecutionDiscipline, ToolPlan},
    progress::{ProgressBroadcaster, Subscription},
    store::ScanStore,
    tools::ToolInvocationSpec,
};

/// Grace periods a cancelled scan gets to unwind: SIGTERM to SIGKILL, output
/// draining, and slack for finalization.
const CANCEL_BOUND_GRACES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// In-flight invocations were signalled and the scan unwound.
    Signalled,
    /// The scan had not started; it went straight to CANCELLED.
    CancelledBeforeStart,
    /// Nothing to do, the scan had already finished.
    AlreadyTerminal,
    /// The scan did not unwind within the cancellation bound. It was marked
    /// CANCELLED without results; its late outcome is discarded.
    Forced,
}

#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    runner: Arc<dyn ToolRunner>,
    broadcaster: ProgressBroadcaster,
    store: Arc<dyn ScanStore>,
    config: Arc<AppConfig>,
    registry: ScanRegistry,
}

impl ScanOrchestrator {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        broadcaster: ProgressBroadcaster,
        store: Arc<dyn ScanStore>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                broadcaster,
                store,
                config,
                registry: ScanRegistry::default(),
            }),
        }
    }

    pub fn subscribe(&self, scan_id: &str) -> Subscription {
        self.inner.broadcaster.subscribe(scan_id)
    }

    /// Registers a PENDING scan so it can be cancelled before it starts.
    pub fn submit(&self, scan_id: &str) -> Result<(), ScanError> {
        self.inner.registry.register(scan_id)
    }

    pub fn status(&self, scan_id: &str) -> Option<ScanStatus> {
        self.inner.registry.status(scan_id)
    }

    /// Drops a finished scan from the status registry. Scans that have not
    /// reached a terminal state are kept and `false` is returned.
    pub fn forget(&self, scan_id: &str) -> bool {
        self.inner.registry.forget(scan_id)
    }

    /// Runs a PENDING (or unknown) scan to a terminal state.
    ///
    /// Individual tool failures are part of the returned aggregate. `Err` is
    /// returned for orchestration faults (the scan is then FAILED), for a
    /// cancelled scan, and for a scan that was already started.
    pub async fn run_scan(&self, scan_id: &str, target: &str, mode: &str) -> Result<AggregatedScanResult, ScanError> {
        let cancel = self.inner.registry.claim(scan_id).map_err(|e| {
            warn!(scan_id, error = %e, "rejected scan start");
            e
        })?;

        let plan = match self.prepare(target, mode) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(scan_id, mode, None, e).await),
        };

        let started_at = Utc::now();
        if let Err(e) = self.inner.store.mark_running(scan_id, started_at).await {
            let err = ScanError::Persistence(format!("{e:#}"));
            return Err(self.fail(scan_id, mode, None, err).await);
        }
        self.inner.registry.transition(scan_id, ScanState::Running);
        info!(scan_id, target, mode, tools = plan.len(), discipline = ?plan.discipline, "scan started");
        self.emit(ProgressEvent::new(
            scan_id,
            ScanPhase::Started,
            ScanState::Running,
            0,
            format!("Starting {mode} scan of {target} with {} tool(s)", plan.len()),
        ));

        let total = plan.len();
        let mut aggregate = Aggregate::new(scan_id, total);
        let total_execution_time_ms = run_invocations(
            self.inner.runner.as_ref(),
            &plan,
            target,
            &cancel,
            self.inner.config.max_concurrent_invocations,
            |spec| {
                let percent = self.inner.registry.percent(scan_id);
                self.emit(
                    ProgressEvent::new(scan_id, ScanPhase::ToolStarted, ScanState::Running, percent, format!("Running {}", spec.tool))
                        .with_tool(spec.tool),
                );
            },
            |_, result| {
                let findings = normalize(&result);
                info!(
                    scan_id,
                    tool = %result.tool,
                    exit_code = result.exit_code,
                    success = result.success,
                    timed_out = result.timed_out,
                    cancelled = result.cancelled,
                    duration_ms = result.duration_ms,
                    findings = findings.len(),
                    "tool finished"
                );
                let message = describe(&result, findings.len());
                let tool = result.tool;
                aggregate.record(result, findings);

                let percent = progress_percent(aggregate.completed(), total);
                let found = aggregate.vulnerability_count();
                self.inner.registry.record_progress(scan_id, percent, found);
                self.emit(
                    ProgressEvent::new(scan_id, ScanPhase::ToolCompleted, ScanState::Running, percent, message)
                        .with_tool(tool)
                        .with_vulnerabilities(found),
                );
            },
        )
        .await;

        self.finalize(scan_id, mode, started_at, aggregate, total_execution_time_ms, &cancel)
            .await
    }

    /// Signals every in-flight invocation of the scan and waits up to three
    /// grace periods for it to reach a terminal state; a scan still running
    /// after that is forced to CANCELLED. Cancelling a finished scan is a no-op.
    pub async fn cancel_scan(&self, scan_id: &str) -> Result<CancelOutcome, ScanError> {
        match self.inner.registry.request_cancel(scan_id)? {
            CancelRequest::AlreadyTerminal => {
                debug!(scan_id, "cancel ignored, scan already finished");
                Ok(CancelOutcome::AlreadyTerminal)
            }
            CancelRequest::BeforeStart => {
                self.close_cancelled(scan_id, "cancelled before start").await;
                Ok(CancelOutcome::CancelledBeforeStart)
            }
            CancelRequest::Signalled(mut state) => {
                let bound = self.inner.config.cancel_grace() * CANCEL_BOUND_GRACES;
                let reached = timeout(bound, state.wait_for(|s| s.is_terminal()))
                    .await
                    .map(|r| r.is_ok());
                if matches!(reached, Ok(true)) {
                    return Ok(CancelOutcome::Signalled);
                }

                let bound_ms = bound.as_millis() as u64;
                if !self.inner.registry.transition(scan_id, ScanState::Cancelled) {
                    // finished while the bound ran out
                    return Ok(CancelOutcome::Signalled);
                }
                warn!(scan_id, bound_ms, "scan did not unwind within the cancellation bound, forcing CANCELLED");
                let message = format!("cancellation not acknowledged within {bound_ms}ms");
                self.inner.registry.record_error(scan_id, message.clone());
                self.close_cancelled(scan_id, &message).await;
                Ok(CancelOutcome::Forced)
            }
        }
    }

    /// Registers the scan and runs it on its own supervised task. A panic
    /// inside the scan drives it to FAILED even if the handle is dropped.
    pub fn spawn_scan(
        &self,
        scan_id: impl Into<String>,
        target: impl Into<String>,
        mode: impl Into<String>,
    ) -> Result<ScanHandle, ScanError> {
        let scan_id = scan_id.into();
        self.submit(&scan_id)?;

        let this = self.clone();
        let (id, target, mode) = (scan_id.clone(), target.into(), mode.into());
        let task = tokio::spawn(async move {
            let scan = {
                let (this, id, mode) = (this.clone(), id.clone(), mode.clone());
                tokio::spawn(async move { this.run_scan(&id, &target, &mode).await })
            };
            match scan.await {
                Ok(result) => result,
                Err(e) => {
                    let message = format!("scan task aborted: {e}");
                    Err(this.fail(&id, &mode, None, ScanError::Task(message)).await)
                }
            }
        });
        Ok(ScanHandle {
            scan_id,
            orchestrator: self.clone(),
            task,
        })
    }

    fn prepare(&self, target: &str, mode: &str) -> Result<ToolPlan, ScanError> {
        let plan = ToolPlan::resolve(mode, &self.inner.config)?;
        for spec in &plan.invocations {
            check_request(spec.tool, target, spec.timeout_ms)?;
        }
        Ok(plan)
    }

    async fn finalize(
        &self,
        scan_id: &str,
        mode: &str,
        started_at: DateTime<Utc>,
        aggregate: Aggregate,
        total_execution_time_ms: u64,
        cancel: &CancelToken,
    ) -> Result<AggregatedScanResult, ScanError> {
        if self.inner.registry.status(scan_id).is_some_and(|s| s.state.is_terminal()) {
            warn!(scan_id, "scan was already closed, discarding its late result");
            return Err(ScanError::Cancelled(scan_id.to_string()));
        }

        let cancelled = cancel.is_cancelled();
        self.emit(
            ProgressEvent::new(scan_id, ScanPhase::Finalizing, ScanState::Running, 95, "Aggregating results")
                .with_vulnerabilities(aggregate.vulnerability_count()),
        );

        let keep = !cancelled || self.inner.config.retain_partial_on_cancel;
        let result = aggregate.finish(total_execution_time_ms, keep);
        let state = if cancelled { ScanState::Cancelled } else { ScanState::Completed };

        let serialized = match serde_json::to_string(&result) {
            Ok(json) => json,
            Err(e) => {
                let err = ScanError::Persistence(format!("could not serialize results: {e}"));
                return Err(self.fail(scan_id, mode, Some(started_at), err).await);
            }
        };
        let record = ScanRecord {
            id: scan_id.to_string(),
            status: state,
            scan_type: mode.to_string(),
            started_at: Some(started_at),
            completed_at: Some(Utc::now()),
            error_message: cancelled.then(|| "scan cancelled".to_string()),
            results: Some(serialized),
        };
        let vulnerabilities = result
            .vulnerabilities
            .iter()
            .map(|v| VulnerabilityRecord::from_vulnerability(scan_id, v))
            .collect();
        if let Err(e) = self.inner.store.save_final(record, vulnerabilities).await {
            let err = ScanError::Persistence(format!("{e:#}"));
            return Err(self.fail(scan_id, mode, Some(started_at), err).await);
        }

        if !self.inner.registry.transition(scan_id, state) {
            return Err(ScanError::Cancelled(scan_id.to_string()));
        }
        let found = result.vulnerabilities.len();
        let summary = &result.summary;
        info!(
            scan_id,
            state = %state,
            total_tools = summary.total_tools,
            failed_tools = summary.failed_tools,
            vulnerabilities = found,
            total_execution_time_ms = summary.total_execution_time_ms,
            "scan finished"
        );

        if cancelled {
            self.inner.registry.record_progress(scan_id, 0, found);
            self.inner.registry.record_error(scan_id, "scan cancelled");
            // percent keeps the last milestone reached before the cancel
            let percent = self.inner.registry.percent(scan_id);
            self.emit(
                ProgressEvent::new(scan_id, ScanPhase::Cancelled, ScanState::Cancelled, percent, "Scan cancelled")
                    .with_vulnerabilities(found),
            );
            let err = ScanError::Cancelled(scan_id.to_string());
            self.inner.broadcaster.publish(ScanEvent::ScanError {
                scan_id: scan_id.to_string(),
                error: err.to_string(),
            });
            self.inner.broadcaster.close(scan_id);
            return Err(err);
        }

        self.inner.registry.record_progress(scan_id, 100, found);
        self.emit(
            ProgressEvent::new(
                scan_id,
                ScanPhase::Completed,
                ScanState::Completed,
                100,
                format!("Scan completed: {found} finding(s) from {} tool(s)", summary.total_tools),
            )
            .with_vulnerabilities(found),
        );
        self.inner.broadcaster.publish(ScanEvent::ScanComplete {
            scan_id: scan_id.to_string(),
            results: result.clone(),
        });
        self.inner.broadcaster.close(scan_id);
        Ok(result)
    }

    /// Drives the scan to FAILED and hands the error back to the caller.
    async fn fail(&self, scan_id: &str, mode: &str, started_at: Option<DateTime<Utc>>, err: ScanError) -> ScanError {
        let message = err.to_string();
        if !self.inner.registry.transition(scan_id, ScanState::Failed) {
            warn!(scan_id, error = %message, "scan already closed, not marking it failed");
            return err;
        }
        error!(scan_id, mode, error = %message, "scan failed");
        self.inner.registry.record_error(scan_id, message.clone());

        let record = ScanRecord {
            id: scan_id.to_string(),
            status: ScanState::Failed,
            scan_type: mode.to_string(),
            started_at,
            completed_at: Some(Utc::now()),
            error_message: Some(message.clone()),
            results: None,
        };
        if let Err(e) = self.inner.store.save_final(record, Vec::new()).await {
            warn!(scan_id, error = %e, "could not persist failed scan");
        }

        let percent = self.inner.registry.percent(scan_id);
        self.emit(ProgressEvent::new(scan_id, ScanPhase::Failed, ScanState::Failed, percent, message.clone()));
        self.inner.broadcaster.publish(ScanEvent::ScanError {
            scan_id: scan_id.to_string(),
            error: message,
        });
        self.inner.broadcaster.close(scan_id);
        err
    }

    /// Persists a bare CANCELLED record and ends the scan's event stream.
    async fn close_cancelled(&self, scan_id: &str, reason: &str) {
        let record = ScanRecord {
            id: scan_id.to_string(),
            status: ScanState::Cancelled,
            scan_type: String::new(),
            started_at: None,
            completed_at: Some(Utc::now()),
            error_message: Some(reason.to_string()),
            results: None,
        };
        if let Err(e) = self.inner.store.save_final(record, Vec::new()).await {
            warn!(scan_id, error = %e, "could not persist cancelled scan");
        }
        let percent = self.inner.registry.percent(scan_id);
        self.emit(ProgressEvent::new(
            scan_id,
            ScanPhase::Cancelled,
            ScanState::Cancelled,
            percent,
            format!("Scan {reason}"),
        ));
        self.inner.broadcaster.publish(ScanEvent::ScanError {
            scan_id: scan_id.to_string(),
            error: ScanError::Cancelled(scan_id.to_string()).to_string(),
        });
        self.inner.broadcaster.close(scan_id);
    }

    fn emit(&self, event: ProgressEvent) {
        self.inner.broadcaster.publish(ScanEvent::ScanUpdate(event));
    }
}

/// Owner's handle on a scan running on its own task.
pub struct ScanHandle {
    scan_id: String,
    orchestrator: ScanOrchestrator,
    task: JoinHandle<Result<AggregatedScanResult, ScanError>>,
}

impl ScanHandle {
    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub async fn cancel(&self) -> Result<CancelOutcome, ScanError> {
        self.orchestrator.cancel_scan(&self.scan_id).await
    }

    /// Waits for the scan. A panic inside the scan has already been recorded
    /// as FAILED by its supervisor, whether or not anyone joins.
    pub async fn join(self) -> Result<AggregatedScanResult, ScanError> {
        self.task
            .await
            .unwrap_or_else(|e| Err(ScanError::Task(format!("scan supervisor aborted: {e}"))))
    }
}

/// Executes a plan's invocations under its discipline and returns the total
/// execution time: wall clock for parallel plans, the sum of durations for
/// sequential ones. Exactly one result per invocation reaches `on_done`, in
/// completion order; invocations reached after a cancel are recorded as
/// cancelled without being started.
pub(crate) async fn run_invocations<S, D>(
    runner: &dyn ToolRunner,
    plan: &ToolPlan,
    target: &str,
    cancel: &CancelToken,
    max_concurrent: usize,
    on_start: S,
    mut on_done: D,
) -> u64
where
    S: Fn(&ToolInvocationSpec) + Sync,
    D: FnMut(&ToolInvocationSpec, ToolExecutionResult),
{
    match plan.discipline {
        ExecutionDiscipline::Sequential => {
            let mut total = 0u64;
            for spec in &plan.invocations {
                let result = run_one(runner, spec, target, cancel, &on_start).await;
                total = total.saturating_add(result.duration_ms);
                on_done(spec, result);
            }
            total
        }
        ExecutionDiscipline::Parallel => {
            let started = Instant::now();
            let on_start = &on_start;
            let mut in_flight = stream::iter(0..plan.invocations.len())
                .map(|index| {
                    let spec = &plan.invocations[index];
                    async move { (index, run_one(runner, spec, target, cancel, on_start).await) }
                })
                .buffer_unordered(max_concurrent.max(1));
            while let Some((index, result)) = in_flight.next().await {
                on_done(&plan.invocations[index], result);
            }
            started.elapsed().as_millis() as u64
        }
    }
}

async fn run_one<S>(
    runner: &dyn ToolRunner,
    spec: &ToolInvocationSpec,
    target: &str,
    cancel: &CancelToken,
    on_start: &S,
) -> ToolExecutionResult
where
    S: Fn(&ToolInvocationSpec) + Sync,
{
    if cancel.is_cancelled() {
        return ToolExecutionResult::skipped(spec.tool);
    }
    on_start(spec);
    match runner
        .execute(spec.tool, &spec.args, target, spec.timeout_ms, cancel)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            warn!(tool = %spec.tool, error = %e, "invocation rejected");
            ToolExecutionResult::from_error(spec.tool, &e, String::new(), String::new(), 0)
        }
    }
}

fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 95;
    }
    (5 + completed.min(total) * 90 / total) as u8
}

fn describe(result: &ToolExecutionResult, findings: usize) -> String {
    if result.timed_out {
        format!("{} timed out after {}ms", result.tool, result.duration_ms)
    } else if result.cancelled {
        format!("{} cancelled", result.tool)
    } else if result.success {
        format!("{} finished with {findings} finding(s)", result.tool)
    } else {
        let reason = result.error.as_deref().unwrap_or("non-zero exit");
        format!("{} failed with exit code {} ({reason})", result.tool, result.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_stays_below_completion_until_finalized() {
        assert_eq!(progress_percent(0, 4), 5);
        assert_eq!(progress_percent(2, 4), 50);
        assert_eq!(progress_percent(4, 4), 95);
        assert_eq!(progress_percent(9, 4), 95);
    }

    #[test]
    fn describe_distinguishes_outcomes() {
        let skipped = ToolExecutionResult::skipped(crate::tools::ToolKind::Nikto);
        assert_eq!(describe(&skipped, 0), "nikto cancelled");
        let failed = ToolExecutionResult::exited(crate::tools::ToolKind::Nmap, 2, String::new(), String::new(), 1);
        assert_eq!(describe(&failed, 0), "nmap failed with exit code 2 (non-zero exit)");
    }
}

//! Pipeline Stage Executor
//!
//! Drives a [`StageGraph`] to completion from a single control loop:
//!
//! 1. **Skip pass:** pending stages that can never run are skipped with a
//!    reason: run cancelled, run aborted by a critical failure, no command
//!    configured, or an upstream stage that did not complete.
//! 2. **Launch pass:** pending stages whose dependencies all completed are
//!    started in topological order up to the worker cap (1 in sequential
//!    mode). A stage whose breaker is open is skipped with `CircuitOpen`.
//! 3. **Await:** the next finished stage is recorded, the manifest is
//!    persisted and failure policy is applied.
//!
//! Every external invocation goes through the stage's [`ResiliencePolicy`]
//! and a process slot from a shared semaphore, so the number of child
//! processes never exceeds `max_workers` across all stages.

use super::circuit_breaker::{CircuitBreaker, Transition};
use super::events::PipelineEvent;
use super::report::ExecutionReport;
use super::retry::{ResiliencePolicy, RetryPolicy};
use super::runner::{CommandRunner, Invocation, ProcessRunner};
use super::stage::{PipelineStage, StageGraph, StageKind, StageScope, StageStatus};
use super::template::{self, EntryVars, RunContext};
use crate::error::{Result, StageError, StageErrorKind};
use crate::manifest::ManifestManager;
use crate::progress::ProgressTracker;
use crate::registry::{RegistrySnapshot, UniversalEntry};
use chrono::Utc;
use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::{self, FuturesUnordered, StreamExt};
use scorelink_common::config::{ExecutionMode, PipelineSettings};
use scorelink_common::EntryId;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owned copy of what a running stage needs from its [`PipelineStage`]
#[derive(Debug, Clone)]
struct StageJob {
    name: String,
    scope: StageScope,
    command: Vec<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    timeout: Duration,
}

impl StageJob {
    fn from_stage(stage: &PipelineStage) -> Self {
        Self {
            name: stage.name.clone(),
            scope: stage.scope,
            command: stage.command.clone(),
            inputs: stage.inputs.clone(),
            outputs: stage.outputs.clone(),
            timeout: stage.timeout,
        }
    }
}

/// Result of running one stage
#[derive(Debug)]
struct StageRun {
    result: std::result::Result<(), StageError>,
    attempts: u32,
    duration: Duration,
    recorded: usize,
}

/// Runs the stage graph against a frozen registry snapshot
pub struct StageExecutor {
    snapshot: Arc<RegistrySnapshot>,
    manifest: Arc<ManifestManager>,
    run: RunContext,
    settings: PipelineSettings,
    runner: Arc<dyn CommandRunner>,
    progress: ProgressTracker,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
    cancel: CancellationToken,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    process_slots: Arc<Semaphore>,
}

impl StageExecutor {
    pub fn new(
        snapshot: Arc<RegistrySnapshot>,
        manifest: Arc<ManifestManager>,
        run: RunContext,
        settings: PipelineSettings,
    ) -> Self {
        let slots = settings.max_workers.max(1);
        Self {
            snapshot,
            manifest,
            run,
            runner: Arc::new(ProcessRunner),
            progress: ProgressTracker::with_stages(StageKind::ALL.map(StageKind::name)),
            event_tx: None,
            cancel: CancellationToken::new(),
            breakers: Mutex::new(HashMap::new()),
            process_slots: Arc::new(Semaphore::new(slots)),
            settings,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Send [`PipelineEvent`]s to `event_tx`; events are dropped while the channel is full
    pub fn with_events(mut self, event_tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Breaker of `stage`; breakers live as long as the executor
    pub fn breaker(&self, stage: &str) -> Arc<CircuitBreaker> {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .entry(stage.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::from_settings(
                    stage,
                    &self.settings.circuit_breaker,
                ))
            })
            .clone()
    }

    /// Run every stage of `graph` to a terminal status
    pub async fn execute(&self, graph: &mut StageGraph, mode: ExecutionMode) -> Result<ExecutionReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let cap = match mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::BoundedParallel => self.settings.max_workers.max(1),
        };
        let order: Vec<usize> = graph.topological_order().to_vec();

        info!(
            mode = %mode,
            workers = cap,
            stages = order.len(),
            entries = self.snapshot.len(),
            "Executing stage graph"
        );

        // Stage futures borrow the executor and are polled only by this loop
        let mut running: FuturesUnordered<LocalBoxFuture<'_, (usize, StageRun)>> = FuturesUnordered::new();
        let mut recorded: HashMap<String, usize> = HashMap::new();
        let mut aborted_by: Option<(String, StageError)> = None;

        loop {
            let mut changed = false;

            for &i in &order {
                if graph.stage(i).status() != StageStatus::Pending {
                    continue;
                }
                if let Some(reason) = self.skip_reason(graph, i, aborted_by.as_ref()) {
                    self.skip_stage(graph, i, reason).await?;
                    changed = true;
                }
            }

            if !self.cancel.is_cancelled() && aborted_by.is_none() {
                for &i in &order {
                    if running.len() >= cap {
                        break;
                    }
                    let stage = graph.stage(i);
                    if stage.status() != StageStatus::Pending || !dependencies_completed(graph, stage) {
                        continue;
                    }

                    let name = stage.name.clone();
                    if self.breaker(&name).is_rejecting() {
                        let reason = StageError::CircuitOpen { stage: name.clone() };
                        self.skip_stage(graph, i, reason.clone()).await?;
                        changed = true;
                        if self.aborts_run(graph.stage(i)) {
                            warn!(stage = %name, "Stage breaker open, aborting run");
                            aborted_by = Some((name, reason));
                            break;
                        }
                        continue;
                    }

                    graph.stage_mut(i).transition(StageStatus::Running)?;
                    changed = true;
                    let job = StageJob::from_stage(graph.stage(i));
                    let total = self.snapshot.len();
                    self.progress.stage_started(&job.name, total);
                    self.emit(PipelineEvent::StageStarted {
                        stage: job.name.clone(),
                        total_items: total,
                        timestamp: Utc::now().timestamp(),
                    });
                    info!(stage = %job.name, scope = ?job.scope, "Stage started");
                    running.push(async move { (i, self.run_stage(job, cap).await) }.boxed_local());
                }
            }

            let Some((i, run)) = running.next().await else {
                if changed {
                    continue;
                }
                break;
            };

            let name = graph.stage(i).name.clone();
            recorded.insert(name.clone(), run.recorded);

            match run.result {
                Ok(()) => {
                    let stage = graph.stage_mut(i);
                    stage.transition(StageStatus::Completed)?;
                    stage.record_outcome(run.attempts, run.duration, None);
                    self.progress.stage_completed(&name);
                    info!(
                        stage = %name,
                        attempts = run.attempts,
                        duration_ms = run.duration.as_millis() as u64,
                        artifacts = run.recorded,
                        "Stage completed"
                    );
                    self.emit(PipelineEvent::StageCompleted {
                        stage: name.clone(),
                        attempts: run.attempts,
                        duration_ms: run.duration.as_millis() as u64,
                    });
                }
                Err(stage_error) => {
                    let stage = graph.stage_mut(i);
                    stage.transition(StageStatus::Failed)?;
                    stage.record_outcome(run.attempts, run.duration, Some(stage_error.clone()));
                    let critical = stage.is_critical();
                    self.progress.stage_failed(&name, &stage_error.to_string());
                    error!(
                        stage = %name,
                        critical = critical,
                        attempts = run.attempts,
                        error = %stage_error,
                        "Stage failed"
                    );
                    self.emit(PipelineEvent::StageFailed {
                        stage: name.clone(),
                        error_kind: stage_error.kind(),
                        message: stage_error.to_string(),
                    });

                    if aborted_by.is_none() && self.aborts_run(graph.stage(i)) {
                        warn!(stage = %name, critical = critical, "Aborting run, pending stages will be skipped");
                        aborted_by = Some((name.clone(), stage_error));
                    }
                }
            }

            if let Err(e) = self.manifest.persist() {
                error!(stage = %name, error = %e, "Failed to persist manifest after stage");
            }
        }

        let report = ExecutionReport::from_graph(
            graph,
            mode,
            started_at,
            clock.elapsed(),
            self.cancel.is_cancelled(),
            aborted_by.map(|(name, _)| name),
            |stage| recorded.get(stage).copied().unwrap_or(0),
        );
        self.emit(PipelineEvent::RunFinished {
            success: report.success,
            timestamp: Utc::now().timestamp(),
        });

        info!(
            success = report.success,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Stage graph finished"
        );
        Ok(report)
    }

    fn aborts_run(&self, stage: &PipelineStage) -> bool {
        stage.is_critical() || !self.settings.continue_on_non_critical_failure
    }

    fn skip_reason(
        &self,
        graph: &StageGraph,
        index: usize,
        aborted_by: Option<&(String, StageError)>,
    ) -> Option<StageError> {
        let stage = graph.stage(index);
        if self.cancel.is_cancelled() {
            return Some(StageError::Cancelled {
                stage: stage.name.clone(),
            });
        }
        if !stage.is_configured() {
            return Some(StageError::NotConfigured {
                stage: stage.name.clone(),
            });
        }
        if let Some((upstream, error)) = aborted_by {
            return Some(upstream_error(upstream, Some(error)));
        }
        for dep in &stage.depends_on {
            let Some(upstream) = graph.get(dep) else {
                continue;
            };
            if matches!(upstream.status(), StageStatus::Failed | StageStatus::Skipped) {
                return Some(upstream_error(dep, upstream.error()));
            }
        }
        None
    }

    async fn skip_stage(&self, graph: &mut StageGraph, index: usize, reason: StageError) -> Result<()> {
        let stage = graph.stage_mut(index);
        let name = stage.name.clone();
        stage.skip(reason.clone())?;

        let message = reason.to_string();
        match reason.kind() {
            StageErrorKind::NotConfigured => debug!(stage = %name, "Stage not configured, skipped"),
            _ => warn!(stage = %name, reason = %message, "Stage skipped"),
        }
        self.progress.stage_skipped(&name, &message);
        self.emit(PipelineEvent::StageSkipped {
            stage: name,
            root_kind: reason.root_kind(),
            reason: message,
        });
        Ok(())
    }

    async fn run_stage(&self, job: StageJob, cap: usize) -> StageRun {
        let started = Instant::now();
        let stage_dir = self.run.stage_dir(&job.name);

        if let Err(e) = tokio::fs::create_dir_all(&stage_dir).await {
            return StageRun {
                result: Err(StageError::Spawn {
                    stage: job.name.clone(),
                    message: format!("cannot create {}: {}", stage_dir.display(), e),
                }),
                attempts: 0,
                duration: started.elapsed(),
                recorded: 0,
            };
        }

        let policy = ResiliencePolicy::new(
            job.name.clone(),
            RetryPolicy::from_settings(&self.settings.retry),
            self.breaker(&job.name),
        );

        let (result, attempts, recorded) = match job.scope {
            StageScope::Batch => self.run_batch(&job, &policy).await,
            StageScope::PerEntry => self.run_per_entry(&job, &policy, cap).await,
        };

        StageRun {
            result,
            attempts,
            duration: started.elapsed(),
            recorded,
        }
    }

    /// One invocation for the whole snapshot
    async fn run_batch(
        &self,
        job: &StageJob,
        policy: &ResiliencePolicy,
    ) -> (std::result::Result<(), StageError>, u32, usize) {
        let entries: Vec<EntryVars> = self.snapshot.all().iter().map(EntryVars::from_entry).collect();

        let prepared = (|| {
            let argv = self.expand_all(job, &job.command, None)?;
            let mut inputs = BTreeSet::new();
            let mut outputs: Vec<(EntryId, PathBuf)> = Vec::new();
            for vars in &entries {
                inputs.extend(self.expand_paths(job, &job.inputs, Some(vars))?);
                for path in self.expand_paths(job, &job.outputs, Some(vars))? {
                    outputs.push((vars.id, path));
                }
            }
            if entries.is_empty() {
                inputs.extend(self.expand_paths_without_entry(job, &job.inputs)?);
            }
            Ok::<_, StageError>((argv, inputs, outputs))
        })();
        let (argv, inputs, outputs) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return (Err(e), 0, 0),
        };

        if let Err(e) = check_inputs(&job.name, inputs.iter()) {
            return (Err(e), 0, 0);
        }

        let expected: Vec<PathBuf> = outputs
            .iter()
            .map(|(_, p)| p.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let invocation = Invocation {
            stage: job.name.clone(),
            argv,
            timeout: job.timeout,
            working_dir: None,
            entry: None,
        };

        let outcome = policy
            .call(&self.cancel, |_| self.invoke(&invocation, &expected))
            .await;
        self.emit_transitions(&job.name, &outcome.transitions);
        if let Err(e) = outcome.result {
            return (Err(e), outcome.attempts, 0);
        }

        match self.record(job, outputs) {
            Ok(added) => (Ok(()), outcome.attempts, added),
            Err(e) => (Err(e), outcome.attempts, 0),
        }
    }

    /// One invocation per entry, at most `cap` at a time
    async fn run_per_entry(
        &self,
        job: &StageJob,
        policy: &ResiliencePolicy,
        cap: usize,
    ) -> (std::result::Result<(), StageError>, u32, usize) {
        type EntryResult = (usize, std::result::Result<Vec<(EntryId, PathBuf)>, StageError>, u32);
        let results: Vec<EntryResult> = stream::iter(0..self.snapshot.len())
            .map(|position| async move {
                let entry = &self.snapshot.all()[position];
                let (result, attempts) = self.run_entry(job, policy, entry).await;
                (position, result, attempts)
            })
            .buffer_unordered(cap.max(1))
            .collect()
            .await;

        let attempts = results.iter().map(|(_, _, a)| *a).max().unwrap_or(0);

        // One manifest write for every entry that succeeded, even if others failed
        let artifacts: Vec<(EntryId, PathBuf)> = results
            .iter()
            .filter_map(|(_, r, _)| r.as_ref().ok())
            .flatten()
            .cloned()
            .collect();
        let recorded = match self.record(job, artifacts) {
            Ok(added) => added,
            Err(e) => return (Err(e), attempts, 0),
        };

        let mut failures: Vec<(usize, StageError)> = results
            .into_iter()
            .filter_map(|(position, result, _)| result.err().map(|e| (position, e)))
            .collect();
        if failures.is_empty() {
            return (Ok(()), attempts, recorded);
        }

        failures.sort_by_key(|(position, _)| *position);
        let failed = failures.len();
        // Report the first real failure rather than the rejections it caused
        let (_, error) = failures
            .iter()
            .find(|(_, e)| e.kind() != StageErrorKind::CircuitOpen)
            .unwrap_or(&failures[0])
            .clone();
        warn!(
            stage = %job.name,
            failed = failed,
            total = self.snapshot.len(),
            "Per-entry invocations failed"
        );
        (Err(error), attempts, recorded)
    }

    async fn run_entry(
        &self,
        job: &StageJob,
        policy: &ResiliencePolicy,
        entry: &UniversalEntry,
    ) -> (std::result::Result<Vec<(EntryId, PathBuf)>, StageError>, u32) {
        if self.cancel.is_cancelled() {
            return (
                Err(StageError::Cancelled {
                    stage: job.name.clone(),
                }),
                0,
            );
        }

        let vars = EntryVars::from_entry(entry);
        let prepared = (|| {
            let argv = self.expand_all(job, &job.command, Some(&vars))?;
            let inputs = self.expand_paths(job, &job.inputs, Some(&vars))?;
            let outputs = self.expand_paths(job, &job.outputs, Some(&vars))?;
            Ok::<_, StageError>((argv, inputs, outputs))
        })();
        let (argv, inputs, outputs) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return (Err(e), 0),
        };
        if let Err(e) = check_inputs(&job.name, inputs.iter()) {
            return (Err(e), 0);
        }

        let invocation = Invocation {
            stage: job.name.clone(),
            argv,
            timeout: job.timeout,
            working_dir: None,
            entry: Some(entry.id),
        };
        let outcome = policy
            .call(&self.cancel, |_| self.invoke(&invocation, &outputs))
            .await;
        self.emit_transitions(&job.name, &outcome.transitions);

        let result = match outcome.result {
            Ok(()) => Ok(outputs.into_iter().map(|path| (entry.id, path)).collect()),
            Err(e) => {
                debug!(stage = %job.name, entry_id = %entry.id, error = %e, "Entry invocation failed");
                Err(e)
            }
        };
        (result, outcome.attempts)
    }

    /// One attempt: take a process slot, run, verify declared outputs
    async fn invoke(
        &self,
        invocation: &Invocation,
        outputs: &[PathBuf],
    ) -> std::result::Result<(), StageError> {
        let _slot = self
            .process_slots
            .acquire()
            .await
            .map_err(|_| StageError::Cancelled {
                stage: invocation.stage.clone(),
            })?;

        self.runner.run(invocation, &self.cancel).await?;

        let missing: Vec<PathBuf> = outputs.iter().filter(|p| !p.exists()).cloned().collect();
        if !missing.is_empty() {
            return Err(StageError::OutputMissing {
                stage: invocation.stage.clone(),
                missing,
            });
        }
        Ok(())
    }

    /// Record artifacts in the manifest and count completed items
    fn record(
        &self,
        job: &StageJob,
        artifacts: Vec<(EntryId, PathBuf)>,
    ) -> std::result::Result<usize, StageError> {
        let ids: BTreeSet<EntryId> = artifacts.iter().map(|(id, _)| *id).collect();
        let added = self
            .manifest
            .update_many(&job.name, artifacts)
            .map_err(|e| StageError::Manifest {
                stage: job.name.clone(),
                message: e.to_string(),
            })?;

        for id in ids {
            self.progress.item_completed(&job.name, id);
            self.emit(PipelineEvent::ItemCompleted {
                stage: job.name.clone(),
                entry_id: id,
            });
        }
        Ok(added)
    }

    fn expand_all(
        &self,
        job: &StageJob,
        templates: &[String],
        entry: Option<&EntryVars>,
    ) -> std::result::Result<Vec<String>, StageError> {
        templates
            .iter()
            .map(|t| {
                template::expand(t, &self.run, &job.name, entry).map_err(|message| StageError::Spawn {
                    stage: job.name.clone(),
                    message,
                })
            })
            .collect()
    }

    fn expand_paths(
        &self,
        job: &StageJob,
        templates: &[String],
        entry: Option<&EntryVars>,
    ) -> std::result::Result<Vec<PathBuf>, StageError> {
        Ok(self
            .expand_all(job, templates, entry)?
            .into_iter()
            .map(PathBuf::from)
            .collect())
    }

    /// Paths of templates that do not depend on an entry
    fn expand_paths_without_entry(
        &self,
        job: &StageJob,
        templates: &[String],
    ) -> std::result::Result<Vec<PathBuf>, StageError> {
        let run_wide: Vec<String> = templates
            .iter()
            .filter(|t| !template::uses_entry_placeholders(t))
            .cloned()
            .collect();
        self.expand_paths(job, &run_wide, None)
    }

    fn emit_transitions(&self, stage: &str, transitions: &[Transition]) {
        for transition in transitions {
            self.emit(PipelineEvent::BreakerStateChanged {
                stage: stage.to_string(),
                from: transition.from,
                to: transition.to,
            });
        }
    }

    /// Never waits on the receiver; events are dropped while the channel is full
    fn emit(&self, event: PipelineEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(event = ?event, "Event channel full, dropping pipeline event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

fn dependencies_completed(graph: &StageGraph, stage: &PipelineStage) -> bool {
    stage.depends_on.iter().all(|dep| {
        graph
            .get(dep)
            .map_or(false, |upstream| upstream.status() == StageStatus::Completed)
    })
}

fn upstream_error(upstream: &str, error: Option<&StageError>) -> StageError {
    match error {
        Some(StageError::Upstream { root, reason, .. }) => StageError::Upstream {
            upstream: upstream.to_string(),
            root: *root,
            reason: reason.clone(),
        },
        Some(other) => StageError::Upstream {
            upstream: upstream.to_string(),
            root: other.kind(),
            reason: other.to_string(),
        },
        None => StageError::Upstream {
            upstream: upstream.to_string(),
            root: StageErrorKind::Upstream,
            reason: "did not complete".to_string(),
        },
    }
}

fn check_inputs<'a>(
    stage: &str,
    inputs: impl Iterator<Item = &'a PathBuf>,
) -> std::result::Result<(), StageError> {
    let missing: Vec<PathBuf> = inputs.filter(|p| !p.exists()).cloned().collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StageError::InputMissing {
            stage: stage.to_string(),
            missing,
        })
    }
}

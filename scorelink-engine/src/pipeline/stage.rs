//! Stage model and the fixed stage graph
//!
//! The topology is fixed in code by [`StageKind`]; configuration only
//! supplies each stage's command, input/output templates and limits.

use super::template;
use crate::error::{EngineError, Result, StageError};
use scorelink_common::config::TomlConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// The fixed set of render stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    CoordinateTransform,
    NoteRender,
    AudioSynthesis,
    FeatureAnalysis,
    Composite,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::CoordinateTransform,
        StageKind::NoteRender,
        StageKind::AudioSynthesis,
        StageKind::FeatureAnalysis,
        StageKind::Composite,
    ];

    /// Stage name; also its output subdirectory and config key
    pub fn name(self) -> &'static str {
        match self {
            StageKind::CoordinateTransform => "coordinates",
            StageKind::NoteRender => "note_images",
            StageKind::AudioSynthesis => "audio_render",
            StageKind::FeatureAnalysis => "audio_features",
            StageKind::Composite => "composite",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn depends_on(self) -> &'static [StageKind] {
        match self {
            StageKind::CoordinateTransform => &[],
            StageKind::NoteRender => &[StageKind::CoordinateTransform],
            StageKind::AudioSynthesis => &[],
            StageKind::FeatureAnalysis => &[StageKind::AudioSynthesis],
            StageKind::Composite => &[StageKind::NoteRender],
        }
    }

    pub fn default_criticality(self) -> Criticality {
        match self {
            StageKind::AudioSynthesis | StageKind::FeatureAnalysis => Criticality::NonCritical,
            _ => Criticality::Critical,
        }
    }

    pub fn scope(self) -> StageScope {
        match self {
            StageKind::NoteRender | StageKind::FeatureAnalysis => StageScope::PerEntry,
            _ => StageScope::Batch,
        }
    }

    /// Extension of the default output template
    pub fn artifact_extension(self) -> &'static str {
        match self {
            StageKind::CoordinateTransform => "json",
            StageKind::NoteRender => "svg",
            StageKind::AudioSynthesis => "wav",
            StageKind::FeatureAnalysis => "json",
            StageKind::Composite => "png",
        }
    }

    /// `{stage_dir}/{id}.<ext>`
    pub fn default_output_template(self) -> String {
        format!("{{stage_dir}}/{{id}}.{}", self.artifact_extension())
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How often the command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageScope {
    /// Once for the whole snapshot
    Batch,
    /// Once per registry entry
    PerEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure aborts the run
    Critical,
    /// Failure skips only dependents
    NonCritical,
}

/// Per-stage state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Allowed: pending → running | skipped, running → completed | failed
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Running)
                | (StageStatus::Pending, StageStatus::Skipped)
                | (StageStatus::Running, StageStatus::Completed)
                | (StageStatus::Running, StageStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One node of the stage graph with its run state
#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub name: String,
    pub kind: StageKind,
    /// argv template; empty when the stage is not configured
    pub command: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub depends_on: Vec<String>,
    pub criticality: Criticality,
    pub scope: StageScope,
    pub timeout: Duration,
    status: StageStatus,
    error: Option<StageError>,
    attempts: u32,
    duration: Option<Duration>,
}

impl PipelineStage {
    /// Unconfigured stage with built-in defaults for `kind`
    pub fn new(kind: StageKind, timeout: Duration) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            command: Vec::new(),
            inputs: Vec::new(),
            outputs: vec![kind.default_output_template()],
            depends_on: kind.depends_on().iter().map(|k| k.name().to_string()).collect(),
            criticality: kind.default_criticality(),
            scope: kind.scope(),
            timeout,
            status: StageStatus::Pending,
            error: None,
            attempts: 0,
            duration: None,
        }
    }

    pub fn with_command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }

    pub fn is_critical(&self) -> bool {
        self.criticality == Criticality::Critical
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn error(&self) -> Option<&StageError> {
        self.error.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: StageStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                stage: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        debug!(stage = %self.name, from = %self.status, to = %next, "Stage transition");
        self.status = next;
        Ok(())
    }

    pub(crate) fn record_outcome(&mut self, attempts: u32, duration: Duration, error: Option<StageError>) {
        self.attempts = attempts;
        self.duration = Some(duration);
        self.error = error;
    }

    pub(crate) fn skip(&mut self, reason: StageError) -> Result<()> {
        self.transition(StageStatus::Skipped)?;
        self.error = Some(reason);
        Ok(())
    }

    fn validate_templates(&self, stage_names: &[&str]) -> Result<()> {
        let command_allows_entry = self.scope == StageScope::PerEntry;
        for arg in &self.command {
            template::validate(arg, command_allows_entry, stage_names)
                .map_err(|e| EngineError::Graph(format!("stage {} command: {}", self.name, e)))?;
        }
        for path in self.inputs.iter().chain(&self.outputs) {
            template::validate(path, true, stage_names)
                .map_err(|e| EngineError::Graph(format!("stage {} path: {}", self.name, e)))?;
        }
        Ok(())
    }
}

/// Stages in a validated dependency order
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<PipelineStage>,
    order: Vec<usize>,
}

impl StageGraph {
    /// Build the fixed graph, applying `[stages.<name>]` settings
    pub fn build(config: &TomlConfig) -> Result<Self> {
        for name in config.stages.keys() {
            if StageKind::from_name(name).is_none() {
                return Err(EngineError::Graph(format!(
                    "unknown stage '{}' in configuration (known: {})",
                    name,
                    StageKind::ALL.map(StageKind::name).join(", ")
                )));
            }
        }

        let default_timeout = config.pipeline.stage_timeout();
        let stages = StageKind::ALL
            .into_iter()
            .map(|kind| {
                let mut stage = PipelineStage::new(kind, default_timeout);
                if let Some(settings) = config.stages.get(kind.name()) {
                    if settings.enabled {
                        stage.command = settings.command.clone();
                    }
                    if !settings.outputs.is_empty() {
                        stage.outputs = settings.outputs.clone();
                    }
                    stage.inputs = settings.inputs.clone();
                    if let Some(secs) = settings.timeout_secs {
                        stage.timeout = Duration::from_secs(secs);
                    }
                    if let Some(critical) = settings.critical {
                        stage.criticality = if critical {
                            Criticality::Critical
                        } else {
                            Criticality::NonCritical
                        };
                    }
                }
                stage
            })
            .collect();

        let graph = Self::from_stages(stages)?;
        info!(
            configured = graph.stages.iter().filter(|s| s.is_configured()).count(),
            total = graph.stages.len(),
            "Stage graph built"
        );
        Ok(graph)
    }

    /// Validate names, dependencies and templates, and order topologically
    pub fn from_stages(stages: Vec<PipelineStage>) -> Result<Self> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.name.as_str(), i).is_some() {
                return Err(EngineError::Graph(format!("duplicate stage '{}'", stage.name)));
            }
        }

        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        let mut in_degree = vec![0usize; stages.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            stage.validate_templates(&names)?;
            for dep in &stage.depends_on {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    EngineError::Graph(format!("stage '{}' depends on unknown stage '{}'", stage.name, dep))
                })?;
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        // Kahn's algorithm; ties broken by declaration order
        let mut ready: VecDeque<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(stages.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != stages.len() {
            return Err(EngineError::Graph("stage dependencies contain a cycle".to_string()));
        }

        Ok(Self { stages, order })
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Stage indices in dependency order
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&PipelineStage> {
        self.index_of(name).map(|i| &self.stages[i])
    }

    pub fn stage(&self, index: usize) -> &PipelineStage {
        &self.stages[index]
    }

    pub fn stage_mut(&mut self, index: usize) -> &mut PipelineStage {
        &mut self.stages[index]
    }
}

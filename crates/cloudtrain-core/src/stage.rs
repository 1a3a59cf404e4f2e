//! Pipeline stages and their timing records.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PipelineError;

/// Steps of a full run, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ResolveSession,
    /// Download, decode and package to `.npy`
    FetchDataset,
    UploadDataset,
    Train,
    RetrieveArtifacts,
    Deploy,
    Predict,
    Reclaim,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::ResolveSession,
        Stage::FetchDataset,
        Stage::UploadDataset,
        Stage::Train,
        Stage::RetrieveArtifacts,
        Stage::Deploy,
        Stage::Predict,
        Stage::Reclaim,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::ResolveSession => "resolve_session",
            Stage::FetchDataset => "fetch_dataset",
            Stage::UploadDataset => "upload_dataset",
            Stage::Train => "train",
            Stage::RetrieveArtifacts => "retrieve_artifacts",
            Stage::Deploy => "deploy",
            Stage::Predict => "predict",
            Stage::Reclaim => "reclaim",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub duration_ms: u64,
    /// Short human-readable summary
    pub detail: String,
}

/// Collects stage results as the pipeline advances.
#[derive(Debug, Default)]
pub(crate) struct StageLog {
    results: Vec<StageResult>,
}

/// A stage that has started but not finished.
#[must_use]
pub(crate) struct RunningStage {
    stage: Stage,
    started: Instant,
}

impl StageLog {
    pub(crate) fn start(&self, stage: Stage) -> RunningStage {
        info!(stage = stage.name(), "stage started");
        RunningStage {
            stage,
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(&mut self, running: RunningStage, detail: impl Into<String>) {
        let result = StageResult {
            stage: running.stage,
            duration_ms: running.started.elapsed().as_millis() as u64,
            detail: detail.into(),
        };
        info!(
            stage = result.stage.name(),
            duration_ms = result.duration_ms,
            detail = %result.detail,
            "stage finished"
        );
        self.results.push(result);
    }

    /// Log the failure and hand the error back for propagation.
    pub(crate) fn fail(&self, running: RunningStage, err: PipelineError) -> PipelineError {
        warn!(
            stage = running.stage.name(),
            duration_ms = running.started.elapsed().as_millis() as u64,
            error = %err,
            "stage failed"
        );
        err
    }

    pub(crate) fn skip(&self, stage: Stage, reason: &str) {
        info!(stage = stage.name(), reason, "skipping stage");
    }

    pub(crate) fn into_results(self) -> Vec<StageResult> {
        self.results
    }
}

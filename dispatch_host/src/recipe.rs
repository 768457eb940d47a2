//! Slice-then-print pipeline.
//!
//! A recipe job covers the whole pipeline: it reports slicing progress as
//! heartbeats, then is handed to the machine to track the print itself.

use crate::jobs::{JobFactory, JobSpec, abandon};
use crate::machine::{Machine, MachineError};
use async_trait::async_trait;
use dispatch_shared::job::{Job, JobError, JobKind};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("slicing failed: {0}")]
    Slice(String),
    #[error("no slicer configured for '{0}'")]
    NoSlicer(PathBuf),
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SliceProgress<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// Turns a model into G-code for the named machine profile.
#[async_trait]
pub trait Slicer: Send + Sync {
    async fn slice(
        &self,
        input: &Path,
        output: &Path,
        profile: &str,
        progress: SliceProgress<'_>,
    ) -> Result<(), RecipeError>;
}

pub fn is_gcode(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gcode") || ext.eq_ignore_ascii_case("gco"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "print".to_string())
}

pub struct Recipe {
    slicer: Option<Arc<dyn Slicer>>,
    jobs: JobFactory,
    workdir: PathBuf,
}

impl Recipe {
    pub fn new(jobs: JobFactory) -> Self {
        Self {
            slicer: None,
            jobs,
            workdir: std::env::temp_dir(),
        }
    }

    pub fn with_slicer(mut self, slicer: Arc<dyn Slicer>) -> Self {
        self.slicer = Some(slicer);
        self
    }

    /// Directory sliced output is written to before printing.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    async fn slice(&self, job: &Job, input: &Path, output: &Path, profile: &str) -> Result<(), RecipeError> {
        let slicer = self
            .slicer
            .as_ref()
            .ok_or_else(|| RecipeError::NoSlicer(input.to_path_buf()))?;
        tracing::info!(job_id = job.id(), input = %input.display(), profile, "slicing");
        let progress = |percent: u8| {
            job.try_heartbeat(json!({ "stage": "slicing", "percent": percent }));
        };
        slicer.slice(input, output, profile, &progress).await
    }

    /// Slice `input` if needed and print it on `machine`.
    pub async fn print(&self, machine: &dyn Machine, input: &Path) -> Result<Arc<Job>, RecipeError> {
        let job = self
            .jobs
            .create(JobSpec::new(file_name(input), JobKind::Print).pausable(true).origin(machine.origin()));
        job.start()?;
        let outcome = async {
            let gcode = if is_gcode(input) {
                input.to_path_buf()
            } else {
                let output = self.workdir.join(format!("job-{}.gcode", job.id()));
                self.slice(&job, input, &output, &machine.info().profile).await?;
                output
            };
            machine.print_from_file(&gcode, Some(job.clone())).await?;
            Ok::<(), RecipeError>(())
        }
        .await;
        if let Err(e) = outcome {
            tracing::error!(job_id = job.id(), machine = %machine.name(), "recipe print failed: {}", e);
            abandon(&job, json!({ "message": e.to_string() }));
            return Err(e);
        }
        Ok(job)
    }

    /// Slice `input` (or copy it, if already G-code) to `output`.
    pub async fn print_to_file(&self, input: &Path, output: &Path, profile: &str) -> Result<Arc<Job>, RecipeError> {
        let job = self.jobs.create(JobSpec::new(file_name(output), JobKind::PrintToFile));
        job.start()?;
        let outcome = async {
            if is_gcode(input) {
                tokio::fs::copy(input, output).await?;
            } else {
                self.slice(&job, input, output, profile).await?;
            }
            Ok::<(), RecipeError>(())
        }
        .await;
        match outcome {
            Ok(()) => {
                job.end(json!({ "path": output.display().to_string() }))?;
                Ok(job)
            }
            Err(e) => {
                tracing::error!(job_id = job.id(), output = %output.display(), "print to file failed: {}", e);
                abandon(&job, json!({ "message": e.to_string() }));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcode_extensions() {
        assert!(is_gcode(Path::new("part.gcode")));
        assert!(is_gcode(Path::new("PART.GCO")));
        assert!(!is_gcode(Path::new("part.stl")));
        assert!(!is_gcode(Path::new("part")));
    }
}

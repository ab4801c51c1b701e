use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TransformParams;

use super::hash::FileStamp;
use super::paths::ExtensionFilter;

pub const DEFAULT_TRANSFORM_EXTENSIONS: &[&str] = &["flac"];
pub const DEFAULT_TRANSFORM_BATCH: usize = 32;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform command is empty")]
    EmptyCommand,
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: String },
}

/// A pipeline run that stopped early. `altered` lists the files changed
/// before the failing batch.
#[derive(Debug, Error)]
#[error("transform stopped after altering {} files", altered.len())]
pub struct TransformFailure {
    pub altered: Vec<PathBuf>,
    #[source]
    pub error: TransformError,
}

/// Post-sync processing applied to files a run wrote. Implementations skip
/// files they do not recognise and are safe to run twice.
pub trait TransformPipeline: Send + Sync {
    fn recognizes(&self, path: &Path) -> bool;

    /// Processes `files` and returns the ones it altered.
    fn apply(&self, files: &[PathBuf], params: &TransformParams)
    -> Result<Vec<PathBuf>, TransformFailure>;
}

/// Runs an external program once per batch of recognised files. Parameters
/// travel as `ROCKSYNC_TARGET_BITS`, `ROCKSYNC_TARGET_RATE` and
/// `ROCKSYNC_COVER_MAX`; files are appended as arguments.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: String,
    args: Vec<String>,
    extensions: ExtensionFilter,
    batch_size: usize,
}

impl CommandPipeline {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            extensions: ExtensionFilter::new(DEFAULT_TRANSFORM_EXTENSIONS),
            batch_size: DEFAULT_TRANSFORM_BATCH,
        }
    }

    /// Splits a command line on whitespace.
    pub fn parse(command: &str) -> Result<Self, TransformError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(TransformError::EmptyCommand)?;
        Ok(Self::new(program, parts.collect()))
    }

    pub fn with_extensions(mut self, extensions: ExtensionFilter) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn run_batch(&self, batch: &[PathBuf], params: &TransformParams) -> Result<(), TransformError> {
        debug!(program = %self.program, files = batch.len(), "running transform batch");
        let status = Command::new(&self.program)
            .args(&self.args)
            .args(batch)
            .env("ROCKSYNC_TARGET_BITS", params.bit_depth.to_string())
            .env("ROCKSYNC_TARGET_RATE", params.sample_rate.to_string())
            .env("ROCKSYNC_COVER_MAX", params.cover_max_px.to_string())
            .status()
            .map_err(|source| TransformError::Launch {
                program: self.program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(TransformError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

impl TransformPipeline for CommandPipeline {
    fn recognizes(&self, path: &Path) -> bool {
        self.extensions.admits(path)
    }

    fn apply(
        &self,
        files: &[PathBuf],
        params: &TransformParams,
    ) -> Result<Vec<PathBuf>, TransformFailure> {
        let targets: Vec<PathBuf> = files
            .iter()
            .filter(|path| self.recognizes(path))
            .cloned()
            .collect();
        let mut altered = Vec::new();

        for batch in targets.chunks(self.batch_size) {
            let before: Vec<Option<FileStamp>> = batch.iter().map(|p| stamp(p)).collect();
            let result = self.run_batch(batch, params);
            for (path, before) in batch.iter().zip(before) {
                if stamp(path) != before {
                    altered.push(path.clone());
                }
            }
            if let Err(error) = result {
                warn!(
                    program = %self.program,
                    altered = altered.len(),
                    error = %error,
                    "transform batch failed"
                );
                return Err(TransformFailure { altered, error });
            }
        }

        info!(
            program = %self.program,
            considered = targets.len(),
            altered = altered.len(),
            "transform finished"
        );
        Ok(altered)
    }
}

fn stamp(path: &Path) -> Option<FileStamp> {
    std::fs::metadata(path).ok().map(|meta| FileStamp::from_metadata(&meta))
}

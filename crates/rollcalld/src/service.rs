use rollcall_core::{ResolutionPipeline, RollcallError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] RollcallError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Clone-safe handle to the resolution pipeline.
///
/// Core operations block on locks and SQLite I/O, so each call runs on the
/// blocking thread pool rather than on the D-Bus executor.
#[derive(Clone)]
pub struct CoreHandle {
    pipeline: Arc<ResolutionPipeline>,
}

impl CoreHandle {
    pub fn new(pipeline: ResolutionPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    /// Run `f` against the pipeline on a blocking worker.
    pub async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&ResolutionPipeline) -> rollcall_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pipeline = self.pipeline.clone();
        let result = tokio::task::spawn_blocking(move || f(&pipeline))
            .await
            .map_err(|e| ServiceError::Worker(format!("{op}: {e}")))?;
        if let Err(e) = &result {
            tracing::debug!(op, error = %e, "core operation failed");
        }
        Ok(result?)
    }

    /// Direct access for cheap, non-blocking reads.
    pub fn pipeline(&self) -> &ResolutionPipeline {
        &self.pipeline
    }
}

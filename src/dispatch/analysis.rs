//! Image analysis collaborator
//!
//! Analyzers are plain synchronous functions of a pixel buffer. The
//! [`AnalysisWorker`] runs them on the blocking pool so the dispatch task is
//! never stalled, bounds each request with a timeout, and lets the caller
//! abandon a request through a cancellation token.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::frame::Position;
use crate::error::{AppError, Result};

/// Turns a decoded frame into the centroid of the tracked object
pub trait Analyzer: Send + Sync + 'static {
    /// `None` means no target in this frame
    fn analyze(&self, pixels: &Bytes) -> Option<(i32, i32)>;

    fn name(&self) -> &str {
        "analyzer"
    }
}

impl<F> Analyzer for F
where
    F: Fn(&Bytes) -> Option<(i32, i32)> + Send + Sync + 'static,
{
    fn analyze(&self, pixels: &Bytes) -> Option<(i32, i32)> {
        self(pixels)
    }
}

/// Asynchronous request/response wrapper around an [`Analyzer`]
#[derive(Clone)]
pub struct AnalysisWorker {
    analyzer: Arc<dyn Analyzer>,
    timeout: Duration,
}

impl AnalysisWorker {
    pub fn new(analyzer: Arc<dyn Analyzer>, timeout: Duration) -> Self {
        Self { analyzer, timeout }
    }

    /// Analyze one buffer.
    ///
    /// Fails with [`AppError::Analysis`] on timeout, cancellation or a
    /// panicking analyzer. A blocking analyzer that overran keeps its pool
    /// thread until it returns; its result is discarded.
    pub async fn analyze(
        &self,
        pixels: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Option<Position>> {
        let analyzer = self.analyzer.clone();
        let job = tokio::task::spawn_blocking(move || analyzer.analyze(&pixels));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(AppError::Analysis("analysis cancelled".into()))
            }
            joined = tokio::time::timeout(self.timeout, job) => match joined {
                Ok(Ok(result)) => Ok(result.map(Position::from)),
                Ok(Err(e)) => Err(AppError::Analysis(format!(
                    "{} failed: {}",
                    self.analyzer.name(),
                    e
                ))),
                Err(_) => Err(AppError::Analysis(format!(
                    "{} timed out after {:?}",
                    self.analyzer.name(),
                    self.timeout
                ))),
            },
        }
    }
}

//! Comment and status delivery back to the originating provider.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::comment::AnalyzerComments;
use crate::event::{AnalysisStatus, Event};

/// Emits the surviving comments and lifecycle status for an event.
///
/// When `safe` is set, a previous run died while posting and the ledger may
/// be incomplete: the poster must avoid re-emitting comments it can see it
/// already delivered (e.g. by consulting the hosting platform).
#[async_trait]
pub trait Poster: Send + Sync {
    async fn post(&self, event: &Event, comments: &[AnalyzerComments], safe: bool) -> Result<()>;
    async fn status(&self, event: &Event, status: AnalysisStatus) -> Result<()>;
}

/// Poster that writes comments to the log; the default for one-shot runs.
pub struct LogPoster;

#[async_trait]
impl Poster for LogPoster {
    async fn post(&self, _event: &Event, comments: &[AnalyzerComments], _safe: bool) -> Result<()> {
        for group in comments {
            for comment in &group.comments {
                if comment.is_global() {
                    info!(text = %comment.text, "global comment");
                } else if comment.is_file_level() {
                    info!(file = %comment.file, text = %comment.text, "file comment");
                } else {
                    info!(
                        file = %comment.file,
                        line = comment.line,
                        text = %comment.text,
                        "line comment"
                    );
                }
            }
        }
        Ok(())
    }

    async fn status(&self, _event: &Event, status: AnalysisStatus) -> Result<()> {
        info!(status = %status, "analysis status");
        Ok(())
    }
}

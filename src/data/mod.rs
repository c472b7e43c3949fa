//! The streaming data service: serves file trees and change sets over a
//! repository revision so analyzers never need repository access of their
//! own.
//!
//! Two server-streaming methods, `data.getFiles` and `data.getChanges`, are
//! backed by a chain of decorator services over the raw git loader:
//! `git → language → uast → purge`. Each stage wraps the upstream scanner;
//! the handler at the top bridges the final scanner onto the RPC stream.

pub mod client;
pub mod git;
pub mod lang;
pub mod purge;
pub mod uast;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::event::ReferencePointer;
use crate::rpc::{RpcError, RpcService, StreamSender, INTERNAL, METHOD_NOT_FOUND};
use crate::scanner::BoxScanner;

// ─── Streaming payloads ──────────────────────────────────────────────────────

/// One file at a revision. `content`, `language` and `uast` are present only
/// when the request asked for them and the corresponding pipeline stage is
/// enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct File {
    pub path: String,
    pub mode: u32,
    pub hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uast: Option<Value>,
}

/// One changed file between two revisions. An added file has no `base`, a
/// deleted file no `head`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Change {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<File>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<File>,
}

impl Change {
    /// The file the filters apply to: head when present, base for deletions.
    pub fn filter_target(&self) -> Option<&File> {
        self.head.as_ref().or(self.base.as_ref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesRequest {
    pub revision: ReferencePointer,
    pub want_contents: bool,
    pub want_language: bool,
    pub want_uast: bool,
    pub include_pattern: String,
    pub exclude_pattern: String,
    pub include_vendored: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangesRequest {
    /// Merge-base of the range; `None` enumerates the whole tree at `head`.
    pub base: Option<ReferencePointer>,
    pub head: ReferencePointer,
    pub want_contents: bool,
    pub want_language: bool,
    pub want_uast: bool,
    pub include_pattern: String,
    pub exclude_pattern: String,
    pub include_vendored: bool,
}

pub type FileScanner = BoxScanner<File>;
pub type ChangeScanner = BoxScanner<Change>;

// ─── Getter contracts ────────────────────────────────────────────────────────

#[async_trait]
pub trait ChangeGetter: Send + Sync {
    async fn get_changes(&self, req: &ChangesRequest) -> Result<ChangeScanner, RpcError>;
}

#[async_trait]
pub trait FileGetter: Send + Sync {
    async fn get_files(&self, req: &FilesRequest) -> Result<FileScanner, RpcError>;
}

// ─── RPC handler ─────────────────────────────────────────────────────────────

/// Streams each scanned item to the peer, mapping termination causes to RPC
/// status codes: client cancellation → `CANCELED`, upstream scanner failure
/// → `INTERNAL`, downstream send failure → returned verbatim with no further
/// sends. The scanner is closed on every exit path.
pub struct DataServerHandler {
    pub changes: Arc<dyn ChangeGetter>,
    pub files: Arc<dyn FileGetter>,
}

#[async_trait]
impl RpcService for DataServerHandler {
    async fn call(
        &self,
        method: &str,
        params: Value,
        stream: &StreamSender,
        token: &CancellationToken,
    ) -> Result<Value, RpcError> {
        match method {
            "data.getChanges" => {
                let req: ChangesRequest = serde_json::from_value(params)
                    .map_err(|e| RpcError::invalid_argument(format!("bad request: {e}")))?;
                let scanner = self.changes.get_changes(&req).await?;
                stream_all(scanner, stream, token).await
            }
            "data.getFiles" => {
                let req: FilesRequest = serde_json::from_value(params)
                    .map_err(|e| RpcError::invalid_argument(format!("bad request: {e}")))?;
                let scanner = self.files.get_files(&req).await?;
                stream_all(scanner, stream, token).await
            }
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("unknown method '{other}'"),
            )),
        }
    }
}

/// Assemble the standard pipeline over a local repository:
/// `git → language → uast (or the no-bblfsh guard) → purge`.
pub fn build_pipeline(
    git_dir: impl Into<std::path::PathBuf>,
    parser: Option<Arc<dyn uast::Parser>>,
) -> DataServerHandler {
    let git = Arc::new(git::GitService::new(git_dir));
    let lang = Arc::new(lang::LangService::new(git.clone(), git));

    let (changes, files): (Arc<dyn ChangeGetter>, Arc<dyn FileGetter>) = match parser {
        Some(parser) => {
            let svc = Arc::new(uast::UastService::new(lang.clone(), lang, parser));
            (svc.clone(), svc)
        }
        None => {
            let svc = Arc::new(uast::NoUastService::new(lang.clone(), lang));
            (svc.clone(), svc)
        }
    };

    let purge = Arc::new(purge::PurgeService::new(changes, files));
    DataServerHandler {
        changes: purge.clone(),
        files: purge,
    }
}

async fn stream_all<T: Serialize + Send + Default>(
    mut scanner: BoxScanner<T>,
    stream: &StreamSender,
    token: &CancellationToken,
) -> Result<Value, RpcError> {
    let mut sent = 0usize;
    let result = loop {
        if token.is_cancelled() {
            break Err(RpcError::canceled("request canceled: context canceled"));
        }

        let advanced = tokio::select! {
            _ = token.cancelled() => {
                break Err(RpcError::canceled("request canceled: context canceled"));
            }
            advanced = scanner.next() => advanced,
        };
        if !advanced {
            break match scanner.err() {
                Some(e) => Err(RpcError::new(INTERNAL, format!("data stream failed: {e:#}"))),
                None => Ok(json!({ "items": sent })),
            };
        }

        let item = scanner.item();
        if let Err(e) = stream.send_item(&item).await {
            break Err(e);
        }
        sent += 1;
    };

    if let Err(e) = scanner.close().await {
        warn!(err = %e, "scanner close failed");
    }
    result
}

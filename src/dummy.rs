//! The dummy analyzer — a real, wire-complete analyzer used by the `dummy`
//! subcommand and the end-to-end tests. It fetches the event's changes from
//! the data service and flags lines that run too long, which exercises the
//! full orchestrator → analyzer → data service loop without any external
//! tooling.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::analyzer::EventResponse;
use crate::comment::Comment;
use crate::data::client::DataClient;
use crate::data::{ChangeGetter, ChangesRequest, FileGetter, FilesRequest};
use crate::event::{PushEvent, ReviewEvent};
use crate::rpc::{RpcError, RpcService, StreamSender, METHOD_NOT_FOUND};

const MAX_LINE_LEN: usize = 120;

pub struct DummyAnalyzer {
    pub version: String,
    pub data: DataClient,
    /// Ask the data service for syntax trees (exercises the uast stage).
    pub request_uast: bool,
    /// On push events, fetch the head tree and report a file count.
    pub request_files_push: bool,
}

impl DummyAnalyzer {
    async fn analyze_review(&self, event: &ReviewEvent) -> Result<EventResponse, RpcError> {
        let req = ChangesRequest {
            base: Some(event.commit_revision.base.clone()),
            head: event.commit_revision.head.clone(),
            want_contents: true,
            want_uast: self.request_uast,
            ..Default::default()
        };

        let mut scanner = self.data.get_changes(&req).await?;
        let mut comments = Vec::new();
        let mut changed = 0usize;
        while scanner.next().await {
            let change = scanner.item();
            changed += 1;
            let Some(head) = change.head else { continue };
            for (idx, line) in head.content.lines().enumerate() {
                if line.len() > MAX_LINE_LEN {
                    comments.push(Comment {
                        file: head.path.clone(),
                        line: (idx + 1) as i64,
                        text: format!("line exceeds {MAX_LINE_LEN} characters"),
                        ..Default::default()
                    });
                }
            }
            if head.uast.is_some() {
                debug!(file = %head.path, "received syntax tree");
            }
        }
        let failed = scanner.err().map(|e| RpcError::internal(format!("data request failed: {e:#}")));
        let _ = scanner.close().await;
        if let Some(e) = failed {
            return Err(e);
        }

        comments.push(Comment {
            text: format!("dummy analyzer inspected {changed} changed files"),
            ..Default::default()
        });

        Ok(EventResponse {
            analyzer_version: self.version.clone(),
            comments,
        })
    }

    async fn analyze_push(&self, event: &PushEvent) -> Result<EventResponse, RpcError> {
        let mut comments = Vec::new();

        if self.request_files_push {
            let req = FilesRequest {
                revision: event.commit_revision.head.clone(),
                ..Default::default()
            };
            let mut scanner = self.data.get_files(&req).await?;
            let mut total = 0usize;
            while scanner.next().await {
                scanner.item();
                total += 1;
            }
            let failed = scanner.err().map(|e| RpcError::internal(format!("data request failed: {e:#}")));
            let _ = scanner.close().await;
            if let Some(e) = failed {
                return Err(e);
            }
            comments.push(Comment {
                text: format!("push of {} commits, {total} files at head", event.commits),
                ..Default::default()
            });
        }

        Ok(EventResponse {
            analyzer_version: self.version.clone(),
            comments,
        })
    }
}

#[async_trait]
impl RpcService for DummyAnalyzer {
    async fn call(
        &self,
        method: &str,
        params: Value,
        _stream: &StreamSender,
        _token: &CancellationToken,
    ) -> Result<Value, RpcError> {
        let response = match method {
            "review.notify" => {
                let event: ReviewEvent = serde_json::from_value(params)
                    .map_err(|e| RpcError::invalid_argument(format!("bad review event: {e}")))?;
                self.analyze_review(&event).await?
            }
            "push.notify" => {
                let event: PushEvent = serde_json::from_value(params)
                    .map_err(|e| RpcError::invalid_argument(format!("bad push event: {e}")))?;
                self.analyze_push(&event).await?
            }
            other => {
                return Err(RpcError::new(
                    METHOD_NOT_FOUND,
                    format!("unknown method '{other}'"),
                ))
            }
        };
        serde_json::to_value(&response)
            .map_err(|e| RpcError::internal(format!("can't encode response: {e}")))
    }
}

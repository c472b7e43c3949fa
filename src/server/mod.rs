//! The event orchestrator: glue between providers, the data service and the
//! analyzers.
//!
//! Per event: persist state, resolve the effective configuration, fan out to
//! every enabled analyzer concurrently, collect within the per-kind timeout,
//! dedupe against the batch and the ledger, post the survivors, and record
//! the terminal status. The stored status doubles as the crash-recovery
//! state machine; see [`Server::handle_event`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::analyzer::Analyzer;
use crate::comment::{self, AnalyzerComments, Comment};
use crate::config::{self, AnalyzerConfig};
use crate::data::{FileGetter, FilesRequest};
use crate::event::{AnalysisStatus, Event, EventKind, EventStatus};
use crate::poster::Poster;
use crate::provider::EventHandler;
use crate::rpc::{RpcError, CANCELED, DEADLINE_EXCEEDED};
use crate::store::{
    CommentOperator, EventOperator, NoopCommentOperator, NoopEventOperator,
    NoopOrganizationOperator, OrganizationOperator,
};

/// Config hints keyed by RPC status code, logged alongside analyzer
/// failures.
fn friendly_error_message(kind: EventKind, code: i32) -> Option<&'static str> {
    match (kind, code) {
        (EventKind::Review, DEADLINE_EXCEEDED) => {
            Some("timeout exceeded, try increasing analyzer_review in config.yml")
        }
        (EventKind::Push, DEADLINE_EXCEEDED) => {
            Some("timeout exceeded, try increasing analyzer_push in config.yml")
        }
        _ => None,
    }
}

/// Failure that must escape `handle_event` even when processing errors are
/// otherwise recorded as `failed` and swallowed: malformed events and broken
/// configuration are operator mistakes, not transient upstream weather.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct FatalError(#[from] anyhow::Error);

fn fatal(err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(FatalError(err))
}

pub struct ServerOptions {
    pub poster: Arc<dyn Poster>,
    pub file_getter: Arc<dyn FileGetter>,
    pub analyzers: HashMap<String, Analyzer>,
    pub event_op: Option<Arc<dyn EventOperator>>,
    pub comment_op: Option<Arc<dyn CommentOperator>>,
    pub organization_op: Option<Arc<dyn OrganizationOperator>>,
    /// Deadline for one analyzer to answer a review notification; zero
    /// disables the deadline. Same for `push_timeout`.
    pub review_timeout: Duration,
    pub push_timeout: Duration,
    /// Surface analyzer and posting errors instead of recording `failed` and
    /// moving on. Used by the one-shot CLI drivers.
    pub exit_on_error: bool,
}

pub struct Server {
    poster: Arc<dyn Poster>,
    file_getter: Arc<dyn FileGetter>,
    /// Read-only after construction.
    analyzers: HashMap<String, Analyzer>,
    event_op: Arc<dyn EventOperator>,
    comment_op: Arc<dyn CommentOperator>,
    organization_op: Arc<dyn OrganizationOperator>,
    review_timeout: Duration,
    push_timeout: Duration,
    exit_on_error: bool,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            poster: options.poster,
            file_getter: options.file_getter,
            analyzers: options.analyzers,
            event_op: options.event_op.unwrap_or_else(|| Arc::new(NoopEventOperator)),
            comment_op: options
                .comment_op
                .unwrap_or_else(|| Arc::new(NoopCommentOperator)),
            organization_op: options
                .organization_op
                .unwrap_or_else(|| Arc::new(NoopOrganizationOperator)),
            review_timeout: options.review_timeout,
            push_timeout: options.push_timeout,
            exit_on_error: options.exit_on_error,
        }
    }

    /// Process one event end to end.
    ///
    /// Dispatch on the stored status: `processed` and `failed` are terminal
    /// and skipped; `posting` means a previous run died while posting, so
    /// analysis is re-run with safe posting on; anything else is a normal
    /// run. The terminal status is written back regardless of outcome, and
    /// unless `exit_on_error` is set (or the run was cancelled) a processing
    /// failure is recorded rather than surfaced.
    pub async fn handle_event(&self, token: &CancellationToken, event: &Event) -> Result<()> {
        let head = &event.revision().head;
        info!(
            kind = %event.kind(),
            event = %event.internal_id(),
            repo = %head.internal_repository_url,
            head = %head.reference_name,
            "handling event"
        );

        let status = match self.event_op.save(event).await {
            Ok(status) => status,
            Err(e) => {
                error!(err = %e, "can't save event to database");
                return Err(e);
            }
        };

        match status {
            EventStatus::Processed => {
                debug!(event = %event.internal_id(), "event successfully processed, skipping");
                return Ok(());
            }
            EventStatus::Failed => {
                // No automatic retry of failed events; that's operator policy.
                debug!(event = %event.internal_id(), "event processing failed, skipping");
                return Ok(());
            }
            _ => {}
        }

        // Posting started on a previous run but never reached a terminal
        // status: re-run analysis, but let the poster skip re-delivery.
        let safe_posting = status == EventStatus::Posting;

        if status == EventStatus::New {
            if let Err(e) = self.event_op.update_status(event, EventStatus::Pending).await {
                error!(err = %e, "can't update status in database");
            }
        }

        let result = match event {
            Event::Review(_) => self.handle_review(token, event, safe_posting).await,
            Event::Push(_) => self.handle_push(token, event, safe_posting).await,
        };

        let terminal = match &result {
            Ok(()) => EventStatus::Processed,
            Err(e) => {
                error!(event = %event.internal_id(), err = %e, "event processing failed");
                EventStatus::Failed
            }
        };
        if let Err(e) = self.event_op.update_status(event, terminal).await {
            error!(err = %e, "can't update status in database");
        }

        if let Err(e) = result {
            // Fatal validation/config errors and cancellation always
            // surface; transient processing failures only when the caller
            // asked for them.
            if e.is::<FatalError>()
                || token.is_cancelled()
                || has_code(&e, CANCELED)
                || self.exit_on_error
            {
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn handle_review(
        &self,
        token: &CancellationToken,
        event: &Event,
        safe_posting: bool,
    ) -> Result<()> {
        info!(provider = %event.provider(), "processing pull request");
        self.process(token, event, safe_posting).await
    }

    pub async fn handle_push(
        &self,
        token: &CancellationToken,
        event: &Event,
        safe_posting: bool,
    ) -> Result<()> {
        info!(provider = %event.provider(), "processing push");
        self.process(token, event, safe_posting).await
    }

    async fn process(
        &self,
        token: &CancellationToken,
        event: &Event,
        safe_posting: bool,
    ) -> Result<()> {
        event.validate().map_err(fatal)?;

        let conf = self.effective_config(event).await?;

        self.status(event, AnalysisStatus::Pending).await;

        let comments = self.concurrent_request(token, &conf, event).await?;

        if let Err(e) = self.post(event, comments, safe_posting).await {
            self.status(event, AnalysisStatus::Error).await;
            return Err(anyhow!("posting analysis failed: {e:#}"));
        }

        self.status(event, AnalysisStatus::Success).await;
        Ok(())
    }

    // ─── Configuration resolution ────────────────────────────────────────────

    /// Server defaults, overlaid with the organization configuration, overlaid
    /// with the repository-local `.lookout.yml` at the event's head.
    async fn effective_config(&self, event: &Event) -> Result<HashMap<String, AnalyzerConfig>> {
        let defaults: HashMap<String, AnalyzerConfig> = self
            .analyzers
            .iter()
            .map(|(name, a)| (name.clone(), a.config.clone()))
            .collect();

        let org_yaml = self
            .organization_op
            .config(event.provider(), event.organization_id())
            .await
            .context("could not load the default configuration for the organization")
            .map_err(fatal)?;
        let conf = config::overlay_yaml(&defaults, &org_yaml)
            .context("failed to apply the organization default configuration")
            .map_err(fatal)?;

        // A data-service hiccup while fetching the repo file is transient;
        // a file that exists but does not parse is a fatal config error.
        match self.repo_config(event).await? {
            Some(yaml) => config::overlay_yaml(&conf, &yaml)
                .context("failed to apply the repository .lookout.yml file")
                .map_err(fatal),
            None => Ok(conf),
        }
    }

    /// Fetch `.lookout.yml` at the head revision via the data service.
    /// A missing or empty file is not an error.
    async fn repo_config(&self, event: &Event) -> Result<Option<String>> {
        debug!("getting .lookout.yml");
        let head = event.revision().head.clone();
        let req = FilesRequest {
            revision: head,
            include_pattern: r"^\.lookout\.yml$".to_string(),
            want_contents: true,
            ..Default::default()
        };

        let mut scanner = self.file_getter.get_files(&req).await.map_err(|e| {
            anyhow!(
                "can't get .lookout.yml in revision {}: {e}",
                event.revision().head
            )
        })?;
        let mut content = String::new();
        if scanner.next().await {
            content = scanner.item().content;
        }
        let failed = scanner.err().map(|e| anyhow!("{e:#}"));
        scanner.close().await?;
        if let Some(e) = failed {
            return Err(e);
        }

        if content.is_empty() {
            info!("repository config is not found");
            return Ok(None);
        }
        Ok(Some(content))
    }

    // ─── Fan-out ─────────────────────────────────────────────────────────────

    /// One task per enabled analyzer; disabled analyzers contribute an empty
    /// slot immediately. The collector reads exactly one result per
    /// registered analyzer. First error wins (only reported under
    /// `exit_on_error`): it cancels the group and returns without waiting
    /// for stragglers, which observe the shared token.
    async fn concurrent_request(
        &self,
        token: &CancellationToken,
        conf: &HashMap<String, AnalyzerConfig>,
        event: &Event,
    ) -> Result<Vec<AnalyzerComments>> {
        let group = token.child_token();
        let n = self.analyzers.len();
        let (results_tx, mut results_rx) = mpsc::channel::<Option<AnalyzerComments>>(n.max(1));
        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(n.max(1));

        let timeout = match event.kind() {
            EventKind::Review => self.review_timeout,
            EventKind::Push => self.push_timeout,
        };

        for (name, analyzer) in &self.analyzers {
            let effective = conf
                .get(name)
                .cloned()
                .unwrap_or_else(|| analyzer.config.clone());
            if analyzer.config.disabled || effective.disabled {
                info!(analyzer = %name, "analyzer disabled by configuration");
                let _ = results_tx.try_send(None);
                continue;
            }

            let name = name.clone();
            let analyzer = analyzer.clone();
            let event = event.with_configuration(config::merge_settings(
                &analyzer.config.settings,
                &effective.settings,
            ));
            let kind = event.kind();
            let group = group.clone();
            let results_tx = results_tx.clone();
            let err_tx = err_tx.clone();
            let exit_on_error = self.exit_on_error;

            tokio::spawn(async move {
                let call = async {
                    match &event {
                        Event::Review(e) => analyzer.client.notify_review(e).await,
                        Event::Push(e) => analyzer.client.notify_push(e).await,
                    }
                };
                let outcome = tokio::select! {
                    _ = group.cancelled() => Err(RpcError::canceled("analysis canceled")),
                    outcome = with_timeout(timeout, call) => outcome,
                };

                let result = match outcome {
                    Ok(comments) if comments.is_empty() => {
                        info!(analyzer = %name, "no comments were produced");
                        None
                    }
                    Ok(comments) => Some(AnalyzerComments {
                        config: analyzer.config.clone(),
                        comments,
                    }),
                    Err(e) => {
                        let mut message = String::from("analysis failed");
                        if let Some(hint) = friendly_error_message(kind, e.code) {
                            message = format!("{message}: {hint}");
                        }
                        error!(analyzer = %name, code = e.code, "{message}");
                        if exit_on_error {
                            let _ = err_tx.send(anyhow::Error::new(e)).await;
                        }
                        None
                    }
                };
                let _ = results_tx.send(result).await;
            });
        }

        let mut comments = Vec::new();
        for _ in 0..n {
            tokio::select! {
                Some(err) = err_rx.recv() => {
                    group.cancel();
                    return Err(err);
                }
                result = results_rx.recv() => {
                    if let Some(Some(analyzer_comments)) = result {
                        comments.push(analyzer_comments);
                    }
                }
            }
        }

        if token.is_cancelled() {
            return Err(anyhow::Error::new(RpcError::canceled(
                "event handling canceled",
            )));
        }
        Ok(comments)
    }

    // ─── Posting ─────────────────────────────────────────────────────────────

    /// Dedup within the batch, drop everything the ledger already saw, mark
    /// the event `posting`, deliver, and record the delivered comments. The
    /// `posting` write happens before the poster call on purpose: if the
    /// process dies mid-post, the next run observes it and resumes in safe
    /// mode.
    async fn post(&self, event: &Event, groups: Vec<AnalyzerComments>, safe: bool) -> Result<()> {
        let groups = comment::dedup(groups);

        let mut survivors: Vec<AnalyzerComments> = Vec::new();
        for group in groups {
            let mut kept: Vec<Comment> = Vec::new();
            for c in group.comments {
                let already = self
                    .comment_op
                    .posted(event, &c)
                    .await
                    .context("comment posted check failed")?;
                if !already {
                    kept.push(c);
                }
            }
            if !kept.is_empty() {
                survivors.push(AnalyzerComments {
                    config: group.config,
                    comments: kept,
                });
            }
        }

        if survivors.is_empty() {
            return Ok(());
        }

        self.event_op
            .update_status(event, EventStatus::Posting)
            .await?;

        info!(comments = comment::count(&survivors), "posting analysis");
        self.poster.post(event, &survivors, safe).await?;

        for group in &survivors {
            for c in &group.comments {
                if let Err(e) = self.comment_op.save(event, c, &group.config.name).await {
                    error!(err = %e, "can't save comment");
                }
            }
        }
        Ok(())
    }

    /// Best-effort status report; never aborts analysis.
    async fn status(&self, event: &Event, status: AnalysisStatus) {
        if let Err(e) = self.poster.status(event, status).await {
            error!(status = %status, err = %e, "posting status failed");
        }
    }
}

#[async_trait]
impl EventHandler for Server {
    async fn handle_event(&self, token: &CancellationToken, event: &Event) -> Result<()> {
        Server::handle_event(self, token, event).await
    }
}

async fn with_timeout<F>(timeout: Duration, call: F) -> Result<Vec<Comment>, RpcError>
where
    F: Future<Output = Result<Vec<Comment>, RpcError>>,
{
    if timeout.is_zero() {
        return call.await;
    }
    match tokio::time::timeout(timeout, call).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RpcError::deadline_exceeded("deadline exceeded")),
    }
}

fn has_code(err: &anyhow::Error, code: i32) -> bool {
    err.downcast_ref::<RpcError>()
        .map(|e| e.code == code)
        .unwrap_or(false)
}

//! Orchestrator behavior with scripted analyzers, a collecting poster, and
//! in-memory stores: configuration-driven disabling, cross-analyzer dedup,
//! timeouts, crash-safe posting resumption, and the status state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use reviewd::analyzer::{Analyzer, AnalyzerClient};
use reviewd::comment::{AnalyzerComments, Comment};
use reviewd::config::AnalyzerConfig;
use reviewd::data::{File, FileGetter, FileScanner, FilesRequest};
use reviewd::event::{
    AnalysisStatus, CommitRevision, Event, EventStatus, PushEvent, ReferencePointer, ReviewEvent,
};
use reviewd::poster::Poster;
use reviewd::rpc::{RpcError, CANCELED, DEADLINE_EXCEEDED};
use reviewd::scanner::VecScanner;
use reviewd::server::{Server, ServerOptions};
use reviewd::store::memory::{MemCommentOperator, MemEventOperator, MemOrganizationOperator};
use reviewd::store::{CommentOperator, EventOperator};

// ─── Test doubles ────────────────────────────────────────────────────────────

/// Analyzer returning a fixed set of comments, optionally after a delay.
struct ScriptedAnalyzer {
    comments: Vec<Comment>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    fn new(comments: Vec<Comment>) -> Arc<Self> {
        Arc::new(Self {
            comments,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(comments: Vec<Comment>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            comments,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self) -> Result<Vec<Comment>, RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.comments.clone())
    }
}

#[async_trait]
impl AnalyzerClient for ScriptedAnalyzer {
    async fn notify_review(&self, _event: &ReviewEvent) -> Result<Vec<Comment>, RpcError> {
        self.respond().await
    }

    async fn notify_push(&self, _event: &PushEvent) -> Result<Vec<Comment>, RpcError> {
        self.respond().await
    }
}

/// Records every post and status delivery.
#[derive(Default)]
struct CollectingPoster {
    posts: Mutex<Vec<(Vec<AnalyzerComments>, bool)>>,
    statuses: Mutex<Vec<AnalysisStatus>>,
    fail_posts: bool,
}

#[async_trait]
impl Poster for CollectingPoster {
    async fn post(
        &self,
        _event: &Event,
        comments: &[AnalyzerComments],
        safe: bool,
    ) -> anyhow::Result<()> {
        if self.fail_posts {
            anyhow::bail!("poster is down");
        }
        self.posts.lock().await.push((comments.to_vec(), safe));
        Ok(())
    }

    async fn status(&self, _event: &Event, status: AnalysisStatus) -> anyhow::Result<()> {
        self.statuses.lock().await.push(status);
        Ok(())
    }
}

/// Serves a fixed `.lookout.yml` (or nothing) to the config resolver.
struct StaticFileGetter {
    lookout_yml: Option<String>,
}

#[async_trait]
impl FileGetter for StaticFileGetter {
    async fn get_files(&self, _req: &FilesRequest) -> Result<FileScanner, RpcError> {
        let files = match &self.lookout_yml {
            Some(content) => vec![File {
                path: ".lookout.yml".to_string(),
                content: content.clone(),
                ..Default::default()
            }],
            None => Vec::new(),
        };
        Ok(Box::new(VecScanner::new(files)))
    }
}

fn comment(file: &str, line: i64, text: &str) -> Comment {
    Comment {
        file: file.to_string(),
        line,
        text: text.to_string(),
        ..Default::default()
    }
}

fn review_event(id: &str) -> Event {
    let reference = |name: &str, hash: char| ReferencePointer {
        internal_repository_url: "file:///fixture/basic".to_string(),
        reference_name: name.to_string(),
        hash: hash.to_string().repeat(40),
    };
    Event::Review(ReviewEvent {
        internal_id: id.to_string(),
        provider: "json".to_string(),
        commit_revision: CommitRevision {
            base: reference("refs/heads/main", 'a'),
            head: reference("refs/pull/42/head", 'b'),
        },
        ..Default::default()
    })
}

struct Harness {
    server: Server,
    poster: Arc<CollectingPoster>,
    event_op: Arc<MemEventOperator>,
    comment_op: Arc<MemCommentOperator>,
}

struct HarnessOptions {
    analyzers: Vec<(&'static str, Arc<ScriptedAnalyzer>)>,
    lookout_yml: Option<String>,
    review_timeout: Duration,
    exit_on_error: bool,
    fail_posts: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            analyzers: Vec::new(),
            lookout_yml: None,
            review_timeout: Duration::ZERO,
            exit_on_error: false,
            fail_posts: false,
        }
    }
}

fn harness(options: HarnessOptions) -> Harness {
    let poster = Arc::new(CollectingPoster {
        fail_posts: options.fail_posts,
        ..Default::default()
    });
    let event_op = Arc::new(MemEventOperator::new());
    let comment_op = Arc::new(MemCommentOperator::new());

    let analyzers: HashMap<String, Analyzer> = options
        .analyzers
        .into_iter()
        .map(|(name, client)| {
            (
                name.to_string(),
                Analyzer {
                    client,
                    config: AnalyzerConfig {
                        name: name.to_string(),
                        ..Default::default()
                    },
                },
            )
        })
        .collect();

    let server = Server::new(ServerOptions {
        poster: poster.clone(),
        file_getter: Arc::new(StaticFileGetter {
            lookout_yml: options.lookout_yml,
        }),
        analyzers,
        event_op: Some(event_op.clone()),
        comment_op: Some(comment_op.clone()),
        organization_op: Some(Arc::new(MemOrganizationOperator::new())),
        review_timeout: options.review_timeout,
        push_timeout: Duration::ZERO,
        exit_on_error: options.exit_on_error,
    });

    Harness {
        server,
        poster,
        event_op,
        comment_op,
    }
}

fn posted_keys(groups: &[AnalyzerComments]) -> Vec<(String, i64, String)> {
    let mut keys: Vec<_> = groups
        .iter()
        .flat_map(|g| g.comments.iter())
        .map(|c| (c.file.clone(), c.line, c.text.clone()))
        .collect();
    keys.sort();
    keys
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn repo_config_disables_analyzer() {
    let a = ScriptedAnalyzer::new(vec![comment("m", 1, "from a")]);
    let b = ScriptedAnalyzer::new(vec![comment("m", 2, "from b")]);
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a.clone()), ("b", b.clone())],
        lookout_yml: Some("analyzers:\n  - name: b\n    disabled: true\n".to_string()),
        ..Default::default()
    });

    let event = review_event("ev-disable");
    h.server
        .handle_event(&CancellationToken::new(), &event)
        .await
        .unwrap();

    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 0, "disabled analyzer must not be contacted");

    let posts = h.poster.posts.lock().await;
    assert_eq!(posts.len(), 1);
    assert_eq!(
        posted_keys(&posts[0].0),
        vec![("m".to_string(), 1, "from a".to_string())]
    );
}

#[tokio::test]
async fn duplicate_comments_across_analyzers_collapse() {
    let a = ScriptedAnalyzer::new(vec![comment("m", 5, "x")]);
    let b = ScriptedAnalyzer::new(vec![comment("m", 5, "x"), comment("m", 7, "y")]);
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a), ("b", b)],
        ..Default::default()
    });

    let event = review_event("ev-dedup");
    h.server
        .handle_event(&CancellationToken::new(), &event)
        .await
        .unwrap();

    let posts = h.poster.posts.lock().await;
    assert_eq!(posts.len(), 1);
    assert_eq!(
        posted_keys(&posts[0].0),
        vec![
            ("m".to_string(), 5, "x".to_string()),
            ("m".to_string(), 7, "y".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn analyzer_timeout_is_swallowed_by_default() {
    let a = ScriptedAnalyzer::slow(vec![comment("m", 1, "late")], Duration::from_secs(1));
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a)],
        review_timeout: Duration::from_millis(10),
        ..Default::default()
    });

    let event = review_event("ev-timeout");
    h.server
        .handle_event(&CancellationToken::new(), &event)
        .await
        .unwrap();

    // The analyzer contributed nothing, so nothing was posted and the event
    // still completed.
    assert!(h.poster.posts.lock().await.is_empty());
    assert_eq!(
        h.event_op.status("ev-timeout").await,
        Some(EventStatus::Processed)
    );
    assert_eq!(
        *h.poster.statuses.lock().await,
        vec![AnalysisStatus::Pending, AnalysisStatus::Success]
    );
}

#[tokio::test(start_paused = true)]
async fn analyzer_timeout_is_fatal_under_exit_on_error() {
    let a = ScriptedAnalyzer::slow(vec![comment("m", 1, "late")], Duration::from_secs(1));
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a)],
        review_timeout: Duration::from_millis(10),
        exit_on_error: true,
        ..Default::default()
    });

    let event = review_event("ev-timeout-fatal");
    let err = h
        .server
        .handle_event(&CancellationToken::new(), &event)
        .await
        .unwrap_err();

    let rpc = err.downcast_ref::<RpcError>().expect("rpc error");
    assert_eq!(rpc.code, DEADLINE_EXCEEDED);
    assert_eq!(
        h.event_op.status("ev-timeout-fatal").await,
        Some(EventStatus::Failed)
    );
}

#[tokio::test]
async fn resumed_posting_skips_ledgered_comments() {
    let a = ScriptedAnalyzer::new(vec![comment("m", 5, "x"), comment("m", 6, "z")]);
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a)],
        ..Default::default()
    });

    // Pre-state: a previous run died while posting, after delivering (m,5,x).
    let event = review_event("ev-resume");
    h.event_op.save(&event).await.unwrap();
    h.event_op
        .update_status(&event, EventStatus::Posting)
        .await
        .unwrap();
    h.comment_op
        .save(&event, &comment("m", 5, "x"), "a")
        .await
        .unwrap();

    h.server
        .handle_event(&CancellationToken::new(), &event)
        .await
        .unwrap();

    let posts = h.poster.posts.lock().await;
    assert_eq!(posts.len(), 1);
    let (groups, safe) = &posts[0];
    assert!(*safe, "resumed run must post in safe mode");
    assert_eq!(
        posted_keys(groups),
        vec![("m".to_string(), 6, "z".to_string())]
    );
    assert_eq!(
        h.event_op.status("ev-resume").await,
        Some(EventStatus::Processed)
    );
}

#[tokio::test]
async fn empty_repo_config_falls_back_to_defaults() {
    let a = ScriptedAnalyzer::new(vec![comment("m", 1, "ok")]);
    let b = ScriptedAnalyzer::new(vec![]);
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a.clone()), ("b", b.clone())],
        lookout_yml: Some(String::new()),
        ..Default::default()
    });

    h.server
        .handle_event(&CancellationToken::new(), &review_event("ev-empty-cfg"))
        .await
        .unwrap();

    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    assert_eq!(h.poster.posts.lock().await.len(), 1);
}

// ─── State machine & idempotency ─────────────────────────────────────────────

#[tokio::test]
async fn status_transitions_are_monotone() {
    let a = ScriptedAnalyzer::new(vec![comment("m", 1, "c")]);
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a)],
        ..Default::default()
    });

    h.server
        .handle_event(&CancellationToken::new(), &review_event("ev-mono"))
        .await
        .unwrap();

    assert_eq!(
        h.event_op.history("ev-mono").await,
        vec![
            EventStatus::New,
            EventStatus::Pending,
            EventStatus::Posting,
            EventStatus::Processed,
        ]
    );
}

#[tokio::test]
async fn failed_post_records_failed_status() {
    let a = ScriptedAnalyzer::new(vec![comment("m", 1, "c")]);
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a)],
        fail_posts: true,
        ..Default::default()
    });

    // Not fatal for the loop by default, but the terminal status is failed
    // and the provider saw an error status.
    h.server
        .handle_event(&CancellationToken::new(), &review_event("ev-badpost"))
        .await
        .unwrap();

    assert_eq!(
        h.event_op.status("ev-badpost").await,
        Some(EventStatus::Failed)
    );
    assert_eq!(
        *h.poster.statuses.lock().await,
        vec![AnalysisStatus::Pending, AnalysisStatus::Error]
    );
}

#[tokio::test]
async fn terminal_events_are_skipped() {
    let a = ScriptedAnalyzer::new(vec![comment("m", 1, "c")]);
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a.clone())],
        ..Default::default()
    });
    let token = CancellationToken::new();
    let event = review_event("ev-skip");

    h.server.handle_event(&token, &event).await.unwrap();
    assert_eq!(a.calls(), 1);

    // Processed: second delivery is a no-op.
    h.server.handle_event(&token, &event).await.unwrap();
    assert_eq!(a.calls(), 1);
    assert_eq!(h.poster.posts.lock().await.len(), 1);
}

#[tokio::test]
async fn ledger_prevents_double_posting_across_reruns() {
    let a = ScriptedAnalyzer::new(vec![comment("m", 5, "x")]);
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a)],
        ..Default::default()
    });
    let token = CancellationToken::new();
    let event = review_event("ev-once");

    h.server.handle_event(&token, &event).await.unwrap();

    // Force a re-run of a fully processed event; the analyzer re-emits the
    // same comment, the ledger drops it, the poster is not called again.
    h.event_op
        .update_status(&event, EventStatus::Pending)
        .await
        .unwrap();
    h.server.handle_event(&token, &event).await.unwrap();

    let posts = h.poster.posts.lock().await;
    assert_eq!(posts.len(), 1, "each (file, line, text) posts at most once");
    assert_eq!(
        h.event_op.status("ev-once").await,
        Some(EventStatus::Processed)
    );
}

#[tokio::test]
async fn cancellation_surfaces_and_returns_promptly() {
    let a = ScriptedAnalyzer::slow(vec![comment("m", 1, "never")], Duration::from_secs(60));
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a)],
        ..Default::default()
    });

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        h.server.handle_event(&token, &review_event("ev-cancel")),
    )
    .await
    .expect("handle_event must return after cancellation");

    let err = result.unwrap_err();
    let rpc = err.downcast_ref::<RpcError>().expect("rpc error");
    assert_eq!(rpc.code, CANCELED);
    assert!(h.poster.posts.lock().await.is_empty());
}

#[tokio::test]
async fn invalid_event_fails_fast() {
    let h = harness(HarnessOptions::default());
    let event = Event::Push(PushEvent {
        internal_id: "ev-invalid".to_string(),
        ..Default::default()
    });

    // Validation failures record the terminal status and still surface,
    // even without exit_on_error; they are operator mistakes, not weather.
    let err = h
        .server
        .handle_event(&CancellationToken::new(), &event)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("revision"));
    assert_eq!(
        h.event_op.status("ev-invalid").await,
        Some(EventStatus::Failed)
    );
}

#[tokio::test]
async fn malformed_repo_config_is_fatal() {
    let a = ScriptedAnalyzer::new(vec![comment("m", 1, "c")]);
    let h = harness(HarnessOptions {
        analyzers: vec![("a", a.clone())],
        lookout_yml: Some("analyzers: {not valid".to_string()),
        ..Default::default()
    });

    let err = h
        .server
        .handle_event(&CancellationToken::new(), &review_event("ev-badyaml"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains(".lookout.yml"));
    assert_eq!(a.calls(), 0, "analysis must not start on broken config");
    assert_eq!(
        h.event_op.status("ev-badyaml").await,
        Some(EventStatus::Failed)
    );
}

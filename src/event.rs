//! Event model — the notifications that drive an analysis run.
//!
//! Providers deliver two event kinds: a review event (a pull/merge request
//! was opened or updated) and a push event (commits landed on a branch).
//! Both carry a [`CommitRevision`] naming the base and head of the range to
//! analyze, and an `internal_id` that uniquely identifies the event across
//! retries: it is the idempotency key for the whole pipeline.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Revision addressing ─────────────────────────────────────────────────────

/// A point in a repository: `(repository URL, reference name, commit hash)`.
///
/// `internal_repository_url` is a stable internal URL (`file://…` or
/// `https://host/owner/repo`); `reference_name` is an opaque ref string;
/// `hash` is a hex commit id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferencePointer {
    pub internal_repository_url: String,
    pub reference_name: String,
    pub hash: String,
}

impl ReferencePointer {
    /// Filesystem path for `file://` URLs; other schemes are returned as-is.
    pub fn repository_path(&self) -> &str {
        self.internal_repository_url
            .strip_prefix("file://")
            .unwrap_or(&self.internal_repository_url)
    }
}

impl fmt::Display for ReferencePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.internal_repository_url,
            &self.hash[..self.hash.len().min(7)]
        )
    }
}

/// The ordered pair of revisions an event spans: `base` is the merge-base or
/// parent, `head` the tip being analyzed. Both must name the same repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitRevision {
    pub base: ReferencePointer,
    pub head: ReferencePointer,
}

impl CommitRevision {
    fn validate(&self) -> Result<()> {
        if self.base.internal_repository_url.is_empty() || self.base.hash.is_empty() {
            bail!("base revision is incomplete: {:?}", self.base);
        }
        if self.head.internal_repository_url.is_empty() || self.head.hash.is_empty() {
            bail!("head revision is incomplete: {:?}", self.head);
        }
        if self.base.internal_repository_url != self.head.internal_repository_url {
            bail!(
                "base and head name different repositories: '{}' vs '{}'",
                self.base.internal_repository_url,
                self.head.internal_repository_url
            );
        }
        Ok(())
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// A pull/merge-request notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewEvent {
    pub internal_id: String,
    pub provider: String,
    pub organization_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_mergeable: bool,
    /// The ref the review originates from (e.g. `refs/pull/42/head`).
    pub source: ReferencePointer,
    /// Free-form per-analyzer settings, filled by the orchestrator right
    /// before the event is sent to each analyzer.
    pub configuration: Map<String, Value>,
    pub commit_revision: CommitRevision,
}

/// A branch-push notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushEvent {
    pub internal_id: String,
    pub provider: String,
    pub organization_id: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Number of commits in the push.
    pub commits: u32,
    pub configuration: Map<String, Value>,
    pub commit_revision: CommitRevision,
}

/// The two event kinds the orchestrator understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Review(ReviewEvent),
    Push(PushEvent),
}

/// Kind tag, used for per-kind timeouts and log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Review,
    Push,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Review => write!(f, "review"),
            EventKind::Push => write!(f, "push"),
        }
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Review(_) => EventKind::Review,
            Event::Push(_) => EventKind::Push,
        }
    }

    /// The idempotency key: uniquely identifies this event across retries.
    pub fn internal_id(&self) -> &str {
        match self {
            Event::Review(e) => &e.internal_id,
            Event::Push(e) => &e.internal_id,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Event::Review(e) => &e.provider,
            Event::Push(e) => &e.provider,
        }
    }

    pub fn organization_id(&self) -> &str {
        match self {
            Event::Review(e) => &e.organization_id,
            Event::Push(e) => &e.organization_id,
        }
    }

    pub fn revision(&self) -> &CommitRevision {
        match self {
            Event::Review(e) => &e.commit_revision,
            Event::Push(e) => &e.commit_revision,
        }
    }

    /// Clone of this event with `configuration` replaced by `settings`.
    /// Used by the fan-out to hand each analyzer its merged settings.
    pub fn with_configuration(&self, settings: Map<String, Value>) -> Event {
        let mut event = self.clone();
        match &mut event {
            Event::Review(e) => e.configuration = settings,
            Event::Push(e) => e.configuration = settings,
        }
        event
    }

    /// An event is processable only when both revisions carry a repository
    /// URL and a commit hash, and both name the same repository.
    pub fn validate(&self) -> Result<()> {
        if self.internal_id().is_empty() {
            bail!("event has no internal id");
        }
        self.revision().validate()
    }
}

// ─── Persistence status ──────────────────────────────────────────────────────

/// Lifecycle of a stored event:
/// `new → pending → (posting → processed | failed)`.
///
/// `posting` is the crash-safety marker: it is written just before comments
/// go out, so a run that died mid-post is recognizable on the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    New,
    Pending,
    Posting,
    Processed,
    Failed,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventStatus::New => "new",
            EventStatus::Pending => "pending",
            EventStatus::Posting => "posting",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EventStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(EventStatus::New),
            "pending" => Ok(EventStatus::Pending),
            "posting" => Ok(EventStatus::Posting),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            other => bail!("unknown event status '{other}'"),
        }
    }
}

/// Lifecycle status reported back to the originating provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Success,
    Error,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStatus::Pending => write!(f, "pending"),
            AnalysisStatus::Success => write!(f, "success"),
            AnalysisStatus::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revision(base_url: &str, head_url: &str) -> CommitRevision {
        CommitRevision {
            base: ReferencePointer {
                internal_repository_url: base_url.to_string(),
                reference_name: "refs/heads/main".to_string(),
                hash: "f67e5455a86d0f2a366f1b980489fac77a373bd0".to_string(),
            },
            head: ReferencePointer {
                internal_repository_url: head_url.to_string(),
                reference_name: "refs/pull/42/head".to_string(),
                hash: "02801e1a27a0a906d59530aeb81f4cd137f2c717".to_string(),
            },
        }
    }

    fn review_event() -> Event {
        Event::Review(ReviewEvent {
            internal_id: "ev-1".to_string(),
            provider: "json".to_string(),
            commit_revision: revision("file:///repo", "file:///repo"),
            ..Default::default()
        })
    }

    #[test]
    fn validate_accepts_complete_revision() {
        assert!(review_event().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_hash() {
        let mut rev = revision("file:///repo", "file:///repo");
        rev.head.hash.clear();
        let event = Event::Push(PushEvent {
            internal_id: "ev-2".to_string(),
            commit_revision: rev,
            ..Default::default()
        });
        assert!(event.validate().is_err());
    }

    #[test]
    fn validate_rejects_cross_repository_revision() {
        let event = Event::Review(ReviewEvent {
            internal_id: "ev-3".to_string(),
            commit_revision: revision("file:///a", "file:///b"),
            ..Default::default()
        });
        let err = event.validate().unwrap_err();
        assert!(err.to_string().contains("different repositories"));
    }

    #[test]
    fn status_string_form_is_stable() {
        for status in [
            EventStatus::New,
            EventStatus::Pending,
            EventStatus::Posting,
            EventStatus::Processed,
            EventStatus::Failed,
        ] {
            let parsed: EventStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("unknown".parse::<EventStatus>().is_err());
    }
}

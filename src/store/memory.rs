//! In-memory operators. The default for `serve` runs without a database and
//! the workhorse of the integration tests; state lives for the process only.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CommentOperator, EventOperator, OrganizationOperator};
use crate::comment::Comment;
use crate::event::{Event, EventStatus};

#[derive(Default)]
pub struct MemEventOperator {
    /// internal id → full transition history, newest last.
    events: Mutex<HashMap<String, Vec<EventStatus>>>,
}

impl MemEventOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status, if the event was ever saved.
    pub async fn status(&self, internal_id: &str) -> Option<EventStatus> {
        self.events
            .lock()
            .await
            .get(internal_id)
            .and_then(|h| h.last().copied())
    }

    /// Every status the event went through, oldest first.
    pub async fn history(&self, internal_id: &str) -> Vec<EventStatus> {
        self.events
            .lock()
            .await
            .get(internal_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventOperator for MemEventOperator {
    async fn save(&self, event: &Event) -> Result<EventStatus> {
        let mut events = self.events.lock().await;
        let history = events
            .entry(event.internal_id().to_string())
            .or_insert_with(|| vec![EventStatus::New]);
        Ok(history.last().copied().unwrap_or(EventStatus::New))
    }

    async fn update_status(&self, event: &Event, status: EventStatus) -> Result<()> {
        let mut events = self.events.lock().await;
        match events.get_mut(event.internal_id()) {
            Some(history) => {
                history.push(status);
                Ok(())
            }
            None => bail!("event not found"),
        }
    }
}

#[derive(Default)]
pub struct MemCommentOperator {
    comments: Mutex<HashMap<String, Vec<Comment>>>,
}

impl MemCommentOperator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommentOperator for MemCommentOperator {
    async fn posted(&self, event: &Event, comment: &Comment) -> Result<bool> {
        let comments = self.comments.lock().await;
        let Some(saved) = comments.get(event.internal_id()) else {
            return Ok(false);
        };
        Ok(saved.iter().any(|c| c.dedup_key() == comment.dedup_key()))
    }

    async fn save(&self, event: &Event, comment: &Comment, _analyzer: &str) -> Result<()> {
        self.comments
            .lock()
            .await
            .entry(event.internal_id().to_string())
            .or_default()
            .push(comment.clone());
        Ok(())
    }
}

/// Fixed organization configs, keyed by `(provider, organization id)`.
#[derive(Default)]
pub struct MemOrganizationOperator {
    configs: HashMap<(String, String), String>,
}

impl MemOrganizationOperator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, provider: &str, org_id: &str, yaml: &str) -> Self {
        self.configs
            .insert((provider.to_string(), org_id.to_string()), yaml.to_string());
        self
    }
}

#[async_trait]
impl OrganizationOperator for MemOrganizationOperator {
    async fn config(&self, provider: &str, org_id: &str) -> Result<String> {
        Ok(self
            .configs
            .get(&(provider.to_string(), org_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommitRevision, ReferencePointer, ReviewEvent};

    fn event(id: &str) -> Event {
        Event::Review(ReviewEvent {
            internal_id: id.to_string(),
            commit_revision: CommitRevision {
                base: ReferencePointer {
                    internal_repository_url: "file:///r".into(),
                    hash: "a".repeat(40),
                    ..Default::default()
                },
                head: ReferencePointer {
                    internal_repository_url: "file:///r".into(),
                    hash: "b".repeat(40),
                    ..Default::default()
                },
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn save_creates_then_returns_current() {
        let op = MemEventOperator::new();
        let e = event("e1");

        assert_eq!(op.save(&e).await.unwrap(), EventStatus::New);
        op.update_status(&e, EventStatus::Pending).await.unwrap();
        op.update_status(&e, EventStatus::Posting).await.unwrap();
        assert_eq!(op.save(&e).await.unwrap(), EventStatus::Posting);
    }

    #[tokio::test]
    async fn update_unknown_event_fails() {
        let op = MemEventOperator::new();
        assert!(op
            .update_status(&event("missing"), EventStatus::Failed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn ledger_matches_on_file_line_text() {
        let op = MemCommentOperator::new();
        let e = event("e1");
        let c = Comment {
            file: "m".into(),
            line: 5,
            text: "x".into(),
            ..Default::default()
        };

        assert!(!op.posted(&e, &c).await.unwrap());
        op.save(&e, &c, "a").await.unwrap();
        assert!(op.posted(&e, &c).await.unwrap());

        // Same comment under a different event identity is unposted.
        assert!(!op.posted(&event("e2"), &c).await.unwrap());

        // Different confidence still counts as posted.
        let mut similar = c.clone();
        similar.confidence = 90;
        assert!(op.posted(&e, &similar).await.unwrap());
    }
}

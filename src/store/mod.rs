//! Persistence contracts: the event status store (the status state machine
//! lives behind `EventOperator`), the posted-comment ledger, and
//! per-organization default configuration.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::comment::Comment;
use crate::event::{Event, EventStatus};

/// Event status store. `save` is a read-or-create: the first call for a
/// given internal id creates the row at `new` and returns `new`; later calls
/// return whatever status the event currently holds.
#[async_trait]
pub trait EventOperator: Send + Sync {
    async fn save(&self, event: &Event) -> Result<EventStatus>;
    async fn update_status(&self, event: &Event, status: EventStatus) -> Result<()>;
}

/// Ledger of posted comments. Equality is `(file, line, text)` under the
/// event's internal id.
#[async_trait]
pub trait CommentOperator: Send + Sync {
    async fn posted(&self, event: &Event, comment: &Comment) -> Result<bool>;
    async fn save(&self, event: &Event, comment: &Comment, analyzer: &str) -> Result<()>;
}

/// Organization-level default configuration, one YAML document per
/// `(provider, organization id)` pair.
#[async_trait]
pub trait OrganizationOperator: Send + Sync {
    async fn config(&self, provider: &str, org_id: &str) -> Result<String>;
}

// ─── No-op defaults ──────────────────────────────────────────────────────────
//
// Wired when a store is not configured: every event looks new, nothing was
// ever posted, no organization has a default config.

pub struct NoopEventOperator;

#[async_trait]
impl EventOperator for NoopEventOperator {
    async fn save(&self, _event: &Event) -> Result<EventStatus> {
        Ok(EventStatus::New)
    }

    async fn update_status(&self, _event: &Event, _status: EventStatus) -> Result<()> {
        Ok(())
    }
}

pub struct NoopCommentOperator;

#[async_trait]
impl CommentOperator for NoopCommentOperator {
    async fn posted(&self, _event: &Event, _comment: &Comment) -> Result<bool> {
        Ok(false)
    }

    async fn save(&self, _event: &Event, _comment: &Comment, _analyzer: &str) -> Result<()> {
        Ok(())
    }
}

pub struct NoopOrganizationOperator;

#[async_trait]
impl OrganizationOperator for NoopOrganizationOperator {
    async fn config(&self, _provider: &str, _org_id: &str) -> Result<String> {
        Ok(String::new())
    }
}

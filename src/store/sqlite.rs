//! SQLite-backed operators. One WAL-mode pool serves all three contracts;
//! the event status column is read and written inside a transaction, which
//! is what serializes concurrent runs over the same internal id.

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;

use super::{CommentOperator, EventOperator, OrganizationOperator};
use crate::comment::Comment;
use crate::event::{Event, EventStatus};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::raw_sql(include_str!("migrations/001_init.sql"))
            .execute(&pool)
            .await
            .context("can't run database migrations")?;
        Ok(Self { pool })
    }

    /// Store an organization's default configuration YAML.
    pub async fn set_organization_config(
        &self,
        provider: &str,
        org_id: &str,
        config: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO organization_configs (provider, organization_id, config)
             VALUES (?, ?, ?)
             ON CONFLICT(provider, organization_id) DO UPDATE SET config = excluded.config",
        )
        .bind(provider)
        .bind(org_id)
        .bind(config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventOperator for SqliteStore {
    async fn save(&self, event: &Event) -> Result<EventStatus> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT status FROM events WHERE internal_id = ?")
                .bind(event.internal_id())
                .fetch_optional(&mut *tx)
                .await?;

        let status = match existing {
            Some((status,)) => status.parse()?,
            None => {
                sqlx::query(
                    "INSERT INTO events (internal_id, provider, organization_id, kind, status, created_at)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(event.internal_id())
                .bind(event.provider())
                .bind(event.organization_id())
                .bind(event.kind().to_string())
                .bind(EventStatus::New.to_string())
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;
                EventStatus::New
            }
        };

        tx.commit().await?;
        Ok(status)
    }

    async fn update_status(&self, event: &Event, status: EventStatus) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE events SET status = ?, updated_at = ? WHERE internal_id = ?",
        )
        .bind(status.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(event.internal_id())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            bail!("event '{}' not found", event.internal_id());
        }
        Ok(())
    }
}

#[async_trait]
impl CommentOperator for SqliteStore {
    async fn posted(&self, event: &Event, comment: &Comment) -> Result<bool> {
        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM comments
             WHERE internal_id = ? AND file = ? AND line = ? AND text = ?
             LIMIT 1",
        )
        .bind(event.internal_id())
        .bind(&comment.file)
        .bind(comment.line)
        .bind(&comment.text)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn save(&self, event: &Event, comment: &Comment, analyzer: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO comments (internal_id, analyzer, file, line, text, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.internal_id())
        .bind(analyzer)
        .bind(&comment.file)
        .bind(comment.line)
        .bind(&comment.text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OrganizationOperator for SqliteStore {
    async fn config(&self, provider: &str, org_id: &str) -> Result<String> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT config FROM organization_configs
             WHERE provider = ? AND organization_id = ?",
        )
        .bind(provider)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(config,)| config).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommitRevision, PushEvent, ReferencePointer};
    use tempfile::TempDir;

    fn event(id: &str) -> Event {
        Event::Push(PushEvent {
            internal_id: id.to_string(),
            provider: "json".to_string(),
            commits: 1,
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

    async fn store(dir: &TempDir) -> SqliteStore {
        SqliteStore::new(&dir.path().join("reviewd.db")).await.unwrap()
    }

    #[tokio::test]
    async fn event_status_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let e = event("e1");

        {
            let s = store(&dir).await;
            assert_eq!(EventOperator::save(&s, &e).await.unwrap(), EventStatus::New);
            s.update_status(&e, EventStatus::Posting).await.unwrap();
        }

        // A fresh pool over the same file observes the posting marker.
        let s = store(&dir).await;
        assert_eq!(EventOperator::save(&s, &e).await.unwrap(), EventStatus::Posting);
    }

    #[tokio::test]
    async fn ledger_round_trip() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir).await;
        let e = event("e1");
        let c = Comment {
            file: "m".into(),
            line: 5,
            text: "x".into(),
            ..Default::default()
        };

        assert!(!s.posted(&e, &c).await.unwrap());
        CommentOperator::save(&s, &e, &c, "dummy").await.unwrap();
        assert!(s.posted(&e, &c).await.unwrap());
        assert!(!s.posted(&event("other"), &c).await.unwrap());
    }

    #[tokio::test]
    async fn organization_config_upsert() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir).await;

        assert_eq!(s.config("github", "org1").await.unwrap(), "");
        s.set_organization_config("github", "org1", "analyzers: []")
            .await
            .unwrap();
        s.set_organization_config("github", "org1", "analyzers:\n  - name: a\n")
            .await
            .unwrap();
        assert!(s.config("github", "org1").await.unwrap().contains("name: a"));
    }
}

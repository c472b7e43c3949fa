//! The JSON provider: a watcher that reads one event per stdin line, and a
//! poster that writes one JSON line per comment. Together they make the
//! daemon scriptable without any code-hosting integration.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{is_stop, EventHandler, Watcher};
use crate::comment::AnalyzerComments;
use crate::event::{AnalysisStatus, Event, PushEvent, ReviewEvent};
use crate::poster::Poster;
use crate::rpc::RpcError;

pub const PROVIDER: &str = "json";

// ─── Watcher ─────────────────────────────────────────────────────────────────

/// Watches a line-delimited JSON stream: `{"event":"review"|"push", …}`.
/// Malformed lines are logged and skipped; the stream ending ends the watch
/// cleanly.
pub struct JsonWatcher<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin + Send> JsonWatcher<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }
}

#[derive(Deserialize)]
struct EventTag {
    #[serde(default)]
    event: String,
}

/// Parse one input line into an event; `None` for lines that only deserve a
/// log message.
pub fn parse_line(line: &str) -> Option<Event> {
    if line.trim().is_empty() {
        return None;
    }

    let tag: EventTag = match serde_json::from_str(line) {
        Ok(tag) => tag,
        Err(e) => {
            error!(input = %line, err = %e, "could not unmarshal the event");
            return None;
        }
    };

    match tag.event.to_lowercase().as_str() {
        "" => {
            error!(input = %line, r#"field "event" is mandatory"#);
            None
        }
        "review" => match serde_json::from_str::<ReviewEvent>(line) {
            Ok(event) => Some(Event::Review(event)),
            Err(e) => {
                error!(input = %line, err = %e, "could not unmarshal the review event");
                None
            }
        },
        "push" => match serde_json::from_str::<PushEvent>(line) {
            Ok(event) => Some(Event::Push(event)),
            Err(e) => {
                error!(input = %line, err = %e, "could not unmarshal the push event");
                None
            }
        },
        other => {
            error!(event = %other, "event not supported");
            None
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Watcher for JsonWatcher<R> {
    async fn watch(
        &mut self,
        token: &CancellationToken,
        handler: &dyn EventHandler,
    ) -> Result<()> {
        info!(provider = PROVIDER, "starting watcher");

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => {
                    return Err(RpcError::canceled("watcher canceled").into());
                }
                line = self.lines.next_line() => line?,
            };

            let Some(line) = line else {
                // End of input.
                return Ok(());
            };
            let Some(event) = parse_line(&line) else {
                continue;
            };

            if let Err(e) = handler.handle_event(token, &event).await {
                if is_stop(&e) {
                    return Ok(());
                }
                return Err(e);
            }
        }
    }
}

// ─── Poster ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PostedComment<'a> {
    #[serde(rename = "analyzer-name")]
    analyzer_name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    file: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    line: &'a i64,
    text: &'a str,
}

fn is_zero(line: &&i64) -> bool {
    **line == 0
}

/// Writes one JSON object per comment, annotated with the analyzer it came
/// from, and one per status change.
pub struct JsonPoster<W> {
    out: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonPoster<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Poster for JsonPoster<W> {
    async fn post(&self, _event: &Event, comments: &[AnalyzerComments], _safe: bool) -> Result<()> {
        let mut out = self.out.lock().await;
        for group in comments {
            for comment in &group.comments {
                let mut line = serde_json::to_string(&PostedComment {
                    analyzer_name: &group.config.name,
                    file: &comment.file,
                    line: &comment.line,
                    text: &comment.text,
                })?;
                line.push('\n');
                out.write_all(line.as_bytes()).await?;
            }
        }
        out.flush().await?;
        Ok(())
    }

    async fn status(&self, _event: &Event, status: AnalysisStatus) -> Result<()> {
        let mut out = self.out.lock().await;
        let mut line = serde_json::to_string(&serde_json::json!({ "status": status }))?;
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }
}

//! Analyzer RPC surface: two unary notifications, one per event kind. The
//! connection is long-lived; the per-call deadline belongs to the
//! orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::comment::Comment;
use crate::config::AnalyzerConfig;
use crate::event::{PushEvent, ReviewEvent};
use crate::rpc::client::RpcClient;
use crate::rpc::RpcError;

/// Reply of both notification methods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventResponse {
    pub analyzer_version: String,
    pub comments: Vec<Comment>,
}

/// Client half of the analyzer contract. The production implementation
/// speaks RPC; tests plug in their own.
#[async_trait]
pub trait AnalyzerClient: Send + Sync {
    async fn notify_review(&self, event: &ReviewEvent) -> Result<Vec<Comment>, RpcError>;
    async fn notify_push(&self, event: &PushEvent) -> Result<Vec<Comment>, RpcError>;
}

/// A registered analyzer: its connection plus its server-side configuration.
#[derive(Clone)]
pub struct Analyzer {
    pub client: Arc<dyn AnalyzerClient>,
    pub config: AnalyzerConfig,
}

// ─── WebSocket-backed client ─────────────────────────────────────────────────

pub struct WsAnalyzerClient {
    rpc: RpcClient,
}

impl WsAnalyzerClient {
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        Ok(Self {
            rpc: RpcClient::connect(addr).await?,
        })
    }
}

#[async_trait]
impl AnalyzerClient for WsAnalyzerClient {
    async fn notify_review(&self, event: &ReviewEvent) -> Result<Vec<Comment>, RpcError> {
        let result = self.rpc.call("review.notify", event).await?;
        let response: EventResponse = serde_json::from_value(result)
            .map_err(|e| RpcError::internal(format!("malformed analyzer response: {e}")))?;
        Ok(response.comments)
    }

    async fn notify_push(&self, event: &PushEvent) -> Result<Vec<Comment>, RpcError> {
        let result = self.rpc.call("push.notify", event).await?;
        let response: EventResponse = serde_json::from_value(result)
            .map_err(|e| RpcError::internal(format!("malformed analyzer response: {e}")))?;
        Ok(response.comments)
    }
}

//! Syntax-tree annotation via an external bblfsh parser reached over RPC.
//!
//! The stage only runs for files whose language was detected and only when
//! the request asks for trees. A parse failure is per-file: it is logged and
//! the file goes out without a tree. When no parser is reachable at startup
//! the whole stage is replaced by [`NoUastService`], which refuses
//! `want_uast` requests outright.

use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use super::{Change, ChangeGetter, ChangeScanner, ChangesRequest, File, FileGetter, FileScanner, FilesRequest};
use crate::rpc::client::RpcClient;
use crate::rpc::RpcError;
use crate::scanner::{BoxScanner, Scanner};

/// A syntax-tree parser. The production implementation speaks RPC to a
/// bblfsh endpoint; tests substitute their own.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(&self, language: &str, path: &str, content: &str) -> Result<Value, RpcError>;
}

pub struct BblfshParser {
    rpc: RpcClient,
}

impl BblfshParser {
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        Ok(Self {
            rpc: RpcClient::connect(addr).await?,
        })
    }
}

#[async_trait]
impl Parser for BblfshParser {
    async fn parse(&self, language: &str, path: &str, content: &str) -> Result<Value, RpcError> {
        let result = self
            .rpc
            .call(
                "parse",
                &json!({"language": language, "filename": path, "content": content}),
            )
            .await?;
        Ok(result.get("uast").cloned().unwrap_or(result))
    }
}

// ─── Annotating service ──────────────────────────────────────────────────────

pub struct UastService {
    changes: Arc<dyn ChangeGetter>,
    files: Arc<dyn FileGetter>,
    parser: Arc<dyn Parser>,
}

impl UastService {
    pub fn new(
        changes: Arc<dyn ChangeGetter>,
        files: Arc<dyn FileGetter>,
        parser: Arc<dyn Parser>,
    ) -> Self {
        Self {
            changes,
            files,
            parser,
        }
    }
}

#[async_trait]
impl ChangeGetter for UastService {
    async fn get_changes(&self, req: &ChangesRequest) -> Result<ChangeScanner, RpcError> {
        if !req.want_uast {
            return self.changes.get_changes(req).await;
        }
        // The parser needs file contents even when the caller did not ask
        // for them; the purge stage strips them back out of the response.
        let mut upstream = req.clone();
        upstream.want_contents = true;
        let inner = self.changes.get_changes(&upstream).await?;
        Ok(Box::new(UastScanner {
            inner,
            parser: self.parser.clone(),
            current: None,
            project: project_change,
        }))
    }
}

#[async_trait]
impl FileGetter for UastService {
    async fn get_files(&self, req: &FilesRequest) -> Result<FileScanner, RpcError> {
        if !req.want_uast {
            return self.files.get_files(req).await;
        }
        let mut upstream = req.clone();
        upstream.want_contents = true;
        let inner = self.files.get_files(&upstream).await?;
        Ok(Box::new(UastScanner {
            inner,
            parser: self.parser.clone(),
            current: None,
            project: project_file,
        }))
    }
}

fn project_change(change: &mut Change) -> Vec<&mut File> {
    let mut files = Vec::with_capacity(2);
    if let Some(f) = change.base.as_mut() {
        files.push(f);
    }
    if let Some(f) = change.head.as_mut() {
        files.push(f);
    }
    files
}

fn project_file(file: &mut File) -> Vec<&mut File> {
    vec![file]
}

/// Decorator that parses each file's content and attaches the tree.
struct UastScanner<T: Send + Default> {
    inner: BoxScanner<T>,
    parser: Arc<dyn Parser>,
    current: Option<T>,
    project: fn(&mut T) -> Vec<&mut File>,
}

#[async_trait]
impl<T: Send + Default> Scanner for UastScanner<T> {
    type Item = T;

    async fn next(&mut self) -> bool {
        if !self.inner.next().await {
            return false;
        }
        let mut item = self.inner.item();
        for file in (self.project)(&mut item) {
            if file.language.is_empty() || file.content.is_empty() {
                continue;
            }
            match self
                .parser
                .parse(&file.language, &file.path, &file.content)
                .await
            {
                Ok(tree) => file.uast = Some(tree),
                Err(e) => {
                    warn!(file = %file.path, language = %file.language, err = %e, "can't parse file");
                }
            }
        }
        self.current = Some(item);
        true
    }

    fn err(&self) -> Option<&Error> {
        self.inner.err()
    }

    fn item(&mut self) -> T {
        self.current.take().unwrap_or_default()
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}

// ─── Guard used when bblfsh is absent ────────────────────────────────────────

pub const NO_BBLFSH_MSG: &str = "Data server was started without bblfsh. WantUAST isn't allowed";

/// Stand-in for [`UastService`] when the parser could not be reached at
/// startup: refuses tree requests, passes everything else through.
pub struct NoUastService {
    changes: Arc<dyn ChangeGetter>,
    files: Arc<dyn FileGetter>,
}

impl NoUastService {
    pub fn new(changes: Arc<dyn ChangeGetter>, files: Arc<dyn FileGetter>) -> Self {
        Self { changes, files }
    }
}

#[async_trait]
impl ChangeGetter for NoUastService {
    async fn get_changes(&self, req: &ChangesRequest) -> Result<ChangeScanner, RpcError> {
        if req.want_uast {
            return Err(RpcError::invalid_argument(NO_BBLFSH_MSG));
        }
        self.changes.get_changes(req).await
    }
}

#[async_trait]
impl FileGetter for NoUastService {
    async fn get_files(&self, req: &FilesRequest) -> Result<FileScanner, RpcError> {
        if req.want_uast {
            return Err(RpcError::invalid_argument(NO_BBLFSH_MSG));
        }
        self.files.get_files(req).await
    }
}


//! Final pipeline stage: strips `content` and `uast` the requester did not
//! ask for, so intermediate stages (language detection, tree annotation) can
//! read contents without inflating the stream going out on the wire.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Change, ChangeGetter, ChangeScanner, ChangesRequest, File, FileGetter, FileScanner, FilesRequest};
use crate::rpc::RpcError;
use crate::scanner::MapScanner;

pub struct PurgeService {
    changes: Arc<dyn ChangeGetter>,
    files: Arc<dyn FileGetter>,
}

impl PurgeService {
    pub fn new(changes: Arc<dyn ChangeGetter>, files: Arc<dyn FileGetter>) -> Self {
        Self { changes, files }
    }
}

fn purge_file(file: &mut File, want_contents: bool, want_uast: bool) {
    if !want_contents {
        file.content = String::new();
    }
    if !want_uast {
        file.uast = None;
    }
}

#[async_trait]
impl ChangeGetter for PurgeService {
    async fn get_changes(&self, req: &ChangesRequest) -> Result<ChangeScanner, RpcError> {
        let inner = self.changes.get_changes(req).await?;
        let (want_contents, want_uast) = (req.want_contents, req.want_uast);
        if want_contents && want_uast {
            return Ok(inner);
        }
        Ok(Box::new(MapScanner::new(
            inner,
            Box::new(move |change: &mut Change| {
                if let Some(f) = change.base.as_mut() {
                    purge_file(f, want_contents, want_uast);
                }
                if let Some(f) = change.head.as_mut() {
                    purge_file(f, want_contents, want_uast);
                }
            }),
        )))
    }
}

#[async_trait]
impl FileGetter for PurgeService {
    async fn get_files(&self, req: &FilesRequest) -> Result<FileScanner, RpcError> {
        let inner = self.files.get_files(req).await?;
        let (want_contents, want_uast) = (req.want_contents, req.want_uast);
        if want_contents && want_uast {
            return Ok(inner);
        }
        Ok(Box::new(MapScanner::new(
            inner,
            Box::new(move |file: &mut File| purge_file(file, want_contents, want_uast)),
        )))
    }
}

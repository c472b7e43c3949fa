//! Raw git loader — the authoritative source of `path`, `mode` and `hash`.
//!
//! Commits are resolved when a scanner is created; the tree walk or diff is
//! flattened to a list of blob ids up front, and blob contents are loaded
//! lazily per item while the scanner is consumed.

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Error;
use async_trait::async_trait;
use git2::{Commit, Delta, ObjectType, Oid, Repository, Tree};

use super::{Change, ChangeGetter, ChangeScanner, ChangesRequest, File, FileGetter, FileScanner, FilesRequest};
use crate::event::ReferencePointer;
use crate::rpc::RpcError;
use crate::scanner::Scanner;

pub struct GitService {
    git_dir: PathBuf,
}

impl GitService {
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
        }
    }

    fn open(&self) -> Result<Repository, RpcError> {
        Repository::open(&self.git_dir).map_err(|e| {
            RpcError::internal(format!(
                "can't open repository at '{}': {e}",
                self.git_dir.display()
            ))
        })
    }
}

fn resolve_commit<'r>(
    repo: &'r Repository,
    rev: &ReferencePointer,
) -> Result<Commit<'r>, RpcError> {
    if !rev.hash.is_empty() {
        let oid = Oid::from_str(&rev.hash)
            .map_err(|e| RpcError::invalid_argument(format!("malformed revision '{}': {e}", rev.hash)))?;
        return repo
            .find_commit(oid)
            .map_err(|e| RpcError::not_found(format!("unknown commit '{}': {e}", rev.hash)));
    }
    if !rev.reference_name.is_empty() {
        return repo
            .revparse_single(&rev.reference_name)
            .and_then(|obj| obj.peel_to_commit())
            .map_err(|e| {
                RpcError::not_found(format!("unknown reference '{}': {e}", rev.reference_name))
            });
    }
    Err(RpcError::invalid_argument(
        "revision has neither hash nor reference name",
    ))
}

#[derive(Debug, Clone)]
struct BlobMeta {
    path: String,
    mode: u32,
    oid: Oid,
}

fn walk_tree(tree: &Tree<'_>) -> Result<Vec<BlobMeta>, RpcError> {
    let mut metas = Vec::new();
    tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            metas.push(BlobMeta {
                path: format!("{root}{}", entry.name().unwrap_or_default()),
                mode: entry.filemode() as u32,
                oid: entry.id(),
            });
        }
        git2::TreeWalkResult::Ok
    })
    .map_err(|e| RpcError::internal(format!("tree walk failed: {e}")))?;
    Ok(metas)
}

fn load_file(repo: &Repository, meta: &BlobMeta, want_contents: bool) -> Result<File, Error> {
    let content = if want_contents {
        let blob = repo.find_blob(meta.oid)?;
        String::from_utf8_lossy(blob.content()).into_owned()
    } else {
        String::new()
    };
    Ok(File {
        path: meta.path.clone(),
        mode: meta.mode,
        hash: meta.oid.to_string(),
        content,
        ..Default::default()
    })
}

#[async_trait]
impl FileGetter for GitService {
    async fn get_files(&self, req: &FilesRequest) -> Result<FileScanner, RpcError> {
        let repo = self.open()?;
        let metas = {
            let commit = resolve_commit(&repo, &req.revision)?;
            let tree = commit
                .tree()
                .map_err(|e| RpcError::internal(format!("can't read tree: {e}")))?;
            walk_tree(&tree)?
        };
        Ok(Box::new(GitFileScanner {
            repo,
            metas: metas.into(),
            want_contents: req.want_contents,
            current: None,
            err: None,
        }))
    }
}

#[async_trait]
impl ChangeGetter for GitService {
    async fn get_changes(&self, req: &ChangesRequest) -> Result<ChangeScanner, RpcError> {
        let repo = self.open()?;
        let metas = {
            let head_commit = resolve_commit(&repo, &req.head)?;
            let head_tree = head_commit
                .tree()
                .map_err(|e| RpcError::internal(format!("can't read head tree: {e}")))?;

            match &req.base {
                None => walk_tree(&head_tree)?
                    .into_iter()
                    .map(|meta| ChangeMeta {
                        base: None,
                        head: Some(meta),
                    })
                    .collect(),
                Some(base) => {
                    let base_commit = resolve_commit(&repo, base)?;
                    let base_tree = base_commit
                        .tree()
                        .map_err(|e| RpcError::internal(format!("can't read base tree: {e}")))?;
                    diff_trees(&repo, &base_tree, &head_tree)?
                }
            }
        };

        Ok(Box::new(GitChangeScanner {
            repo,
            metas: metas.into(),
            want_contents: req.want_contents,
            current: None,
            err: None,
        }))
    }
}

#[derive(Debug, Clone)]
struct ChangeMeta {
    base: Option<BlobMeta>,
    head: Option<BlobMeta>,
}

fn diff_trees(
    repo: &Repository,
    base: &Tree<'_>,
    head: &Tree<'_>,
) -> Result<Vec<ChangeMeta>, RpcError> {
    let diff = repo
        .diff_tree_to_tree(Some(base), Some(head), None)
        .map_err(|e| RpcError::internal(format!("diff failed: {e}")))?;

    let mut metas = Vec::new();
    for delta in diff.deltas() {
        let old = delta.old_file();
        let new = delta.new_file();
        let old_meta = (!old.id().is_zero()).then(|| BlobMeta {
            path: old.path().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
            mode: old.mode() as u32,
            oid: old.id(),
        });
        let new_meta = (!new.id().is_zero()).then(|| BlobMeta {
            path: new.path().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
            mode: new.mode() as u32,
            oid: new.id(),
        });

        let meta = match delta.status() {
            Delta::Added => ChangeMeta {
                base: None,
                head: new_meta,
            },
            Delta::Deleted => ChangeMeta {
                base: old_meta,
                head: None,
            },
            _ => ChangeMeta {
                base: old_meta,
                head: new_meta,
            },
        };
        metas.push(meta);
    }
    Ok(metas)
}

// ─── Scanners ────────────────────────────────────────────────────────────────

struct GitFileScanner {
    repo: Repository,
    metas: VecDeque<BlobMeta>,
    want_contents: bool,
    current: Option<File>,
    err: Option<Error>,
}

#[async_trait]
impl Scanner for GitFileScanner {
    type Item = File;

    async fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        let Some(meta) = self.metas.pop_front() else {
            return false;
        };
        match load_file(&self.repo, &meta, self.want_contents) {
            Ok(file) => {
                self.current = Some(file);
                true
            }
            Err(e) => {
                self.err = Some(e.context(format!("can't load blob for '{}'", meta.path)));
                false
            }
        }
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn item(&mut self) -> File {
        self.current.take().unwrap_or_default()
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.metas.clear();
        Ok(())
    }
}

struct GitChangeScanner {
    repo: Repository,
    metas: VecDeque<ChangeMeta>,
    want_contents: bool,
    current: Option<Change>,
    err: Option<Error>,
}

#[async_trait]
impl Scanner for GitChangeScanner {
    type Item = Change;

    async fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        let Some(meta) = self.metas.pop_front() else {
            return false;
        };

        let base = meta
            .base
            .as_ref()
            .map(|m| load_file(&self.repo, m, self.want_contents))
            .transpose();
        let head = meta
            .head
            .as_ref()
            .map(|m| load_file(&self.repo, m, self.want_contents))
            .transpose();
        match (base, head) {
            (Ok(base), Ok(head)) => {
                self.current = Some(Change { base, head });
                true
            }
            (Err(e), _) | (_, Err(e)) => {
                self.err = Some(e.context("can't load changed blob"));
                false
            }
        }
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn item(&mut self) -> Change {
        self.current.take().unwrap_or_default()
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.metas.clear();
        Ok(())
    }
}

//! Comments produced by analyzers, grouped per analyzer, with the
//! batch-level deduplication the posting step relies on.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::AnalyzerConfig;

/// An annotation on a revision. Scope ladder: empty `file` is a global
/// comment; non-empty `file` with `line == 0` is file-level; otherwise the
/// comment is anchored to a line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Comment {
    pub file: String,
    pub line: i64,
    pub text: String,
    pub confidence: u32,
}

impl Comment {
    pub fn is_global(&self) -> bool {
        self.file.is_empty()
    }

    pub fn is_file_level(&self) -> bool {
        !self.file.is_empty() && self.line == 0
    }

    /// Two comments are equivalent for dedup iff this key matches.
    pub fn dedup_key(&self) -> (&str, i64, &str) {
        (&self.file, self.line, &self.text)
    }
}

/// The output of one analyzer for one event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzerComments {
    pub config: AnalyzerConfig,
    pub comments: Vec<Comment>,
}

/// Collapse comments sharing `(file, line, text)` across all groups into the
/// first occurrence. The surviving comment keeps its originating analyzer
/// (the group it first appeared in); groups left empty are dropped. The
/// result is independent of comment order within the input groups only up to
/// which duplicate survives; callers must not rely on which analyzer "wins".
pub fn dedup(groups: Vec<AnalyzerComments>) -> Vec<AnalyzerComments> {
    let mut seen: HashSet<(String, i64, String)> = HashSet::new();
    let mut out = Vec::with_capacity(groups.len());

    for group in groups {
        let mut kept = Vec::with_capacity(group.comments.len());
        for comment in group.comments {
            let key = (
                comment.file.clone(),
                comment.line,
                comment.text.clone(),
            );
            if seen.insert(key) {
                kept.push(comment);
            }
        }
        if !kept.is_empty() {
            out.push(AnalyzerComments {
                config: group.config,
                comments: kept,
            });
        }
    }

    out
}

/// Total number of comments across all groups.
pub fn count(groups: &[AnalyzerComments]) -> usize {
    groups.iter().map(|g| g.comments.len()).sum()
}

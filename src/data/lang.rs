//! Language detection and path filtering.
//!
//! This stage owns three request knobs: anchored include/exclude regexes on
//! the path, vendored-file exclusion, and the `language` field. It is wired
//! between the git loader and the syntax-tree annotator and is skipped
//! entirely when none of its knobs are active.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{Change, ChangeGetter, ChangeScanner, ChangesRequest, File, FileGetter, FileScanner, FilesRequest};
use crate::rpc::RpcError;
use crate::scanner::{FnScanner, MapScanner};

static VENDOR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(^|/)vendor/",
        r"(^|/)node_modules/",
        r"(^|/)third_party/",
        r"(^|/)Godeps/",
        r"(^|/)dist/",
        r"\.min\.(js|css)$",
        r"(^|/)package-lock\.json$",
        r"(^|/)Cargo\.lock$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("vendor pattern"))
    .collect()
});

pub fn is_vendored(path: &str) -> bool {
    VENDOR_PATTERNS.iter().any(|re| re.is_match(path))
}

/// Extension-based language detection; returns `""` for unknown files.
pub fn detect_language(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default();
    match ext {
        "rs" => "Rust",
        "go" => "Go",
        "py" => "Python",
        "js" | "mjs" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "java" => "Java",
        "c" | "h" => "C",
        "cc" | "cpp" | "hpp" => "C++",
        "rb" => "Ruby",
        "php" => "PHP",
        "cs" => "C#",
        "sh" | "bash" => "Shell",
        "yml" | "yaml" => "YAML",
        "json" => "JSON",
        "toml" => "TOML",
        "md" => "Markdown",
        "html" => "HTML",
        "css" => "CSS",
        "sql" => "SQL",
        _ => "",
    }
}

/// Compiled per-request path filter.
#[derive(Debug)]
struct PathFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
    drop_vendored: bool,
}

impl PathFilter {
    fn compile(
        include: &str,
        exclude: &str,
        include_vendored: bool,
    ) -> Result<Self, RpcError> {
        // Patterns match the whole path.
        let anchor = |pattern: &str| -> Result<Regex, RpcError> {
            Regex::new(&format!("^(?:{pattern})$"))
                .map_err(|e| RpcError::invalid_argument(format!("invalid path pattern '{pattern}': {e}")))
        };
        Ok(Self {
            include: (!include.is_empty()).then(|| anchor(include)).transpose()?,
            exclude: (!exclude.is_empty()).then(|| anchor(exclude)).transpose()?,
            drop_vendored: !include_vendored,
        })
    }

    fn skip(&self, path: &str) -> bool {
        if let Some(re) = &self.include {
            if !re.is_match(path) {
                return true;
            }
        }
        if let Some(re) = &self.exclude {
            if re.is_match(path) {
                return true;
            }
        }
        self.drop_vendored && is_vendored(path)
    }
}

fn fill_language(file: &mut File) {
    if file.language.is_empty() {
        file.language = detect_language(&file.path).to_string();
    }
}

pub struct LangService {
    changes: Arc<dyn ChangeGetter>,
    files: Arc<dyn FileGetter>,
}

impl LangService {
    pub fn new(changes: Arc<dyn ChangeGetter>, files: Arc<dyn FileGetter>) -> Self {
        Self { changes, files }
    }
}

/// The language field is needed by the annotator too, so `want_uast`
/// activates detection even when the caller did not ask for languages.
fn wants_detection(want_language: bool, want_uast: bool) -> bool {
    want_language || want_uast
}

fn filters_active(include: &str, exclude: &str, include_vendored: bool) -> bool {
    !include.is_empty() || !exclude.is_empty() || !include_vendored
}

#[async_trait]
impl ChangeGetter for LangService {
    async fn get_changes(&self, req: &ChangesRequest) -> Result<ChangeScanner, RpcError> {
        let detect = wants_detection(req.want_language, req.want_uast);
        let filtering = filters_active(&req.include_pattern, &req.exclude_pattern, req.include_vendored);

        let inner = self.changes.get_changes(req).await?;
        if !detect && !filtering {
            return Ok(inner);
        }

        let mut scanner = inner;
        if filtering {
            let filter = PathFilter::compile(
                &req.include_pattern,
                &req.exclude_pattern,
                req.include_vendored,
            )?;
            scanner = Box::new(FnScanner::new(
                scanner,
                Box::new(move |change: &Change| {
                    // A change with neither side is malformed upstream output.
                    let file = change
                        .filter_target()
                        .ok_or_else(|| anyhow!("change with no base and no head"))?;
                    Ok(filter.skip(&file.path))
                }),
            ));
        }
        if detect {
            scanner = Box::new(MapScanner::new(
                scanner,
                Box::new(|change: &mut Change| {
                    if let Some(f) = change.base.as_mut() {
                        fill_language(f);
                    }
                    if let Some(f) = change.head.as_mut() {
                        fill_language(f);
                    }
                }),
            ));
        }
        Ok(scanner)
    }
}

#[async_trait]
impl FileGetter for LangService {
    async fn get_files(&self, req: &FilesRequest) -> Result<FileScanner, RpcError> {
        let detect = wants_detection(req.want_language, req.want_uast);
        let filtering = filters_active(&req.include_pattern, &req.exclude_pattern, req.include_vendored);

        let inner = self.files.get_files(req).await?;
        if !detect && !filtering {
            return Ok(inner);
        }

        let mut scanner = inner;
        if filtering {
            let filter = PathFilter::compile(
                &req.include_pattern,
                &req.exclude_pattern,
                req.include_vendored,
            )?;
            scanner = Box::new(FnScanner::new(
                scanner,
                Box::new(move |file: &File| Ok(filter.skip(&file.path))),
            ));
        }
        if detect {
            scanner = Box::new(MapScanner::new(
                scanner,
                Box::new(|file: &mut File| fill_language(file)),
            ));
        }
        Ok(scanner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendored_paths() {
        assert!(is_vendored("vendor/lib.go"));
        assert!(is_vendored("web/node_modules/react/index.js"));
        assert!(is_vendored("assets/app.min.js"));
        assert!(!is_vendored("src/main.rs"));
    }

    #[test]
    fn language_by_extension() {
        assert_eq!(detect_language("src/main.rs"), "Rust");
        assert_eq!(detect_language(".lookout.yml"), "YAML");
        assert_eq!(detect_language("LICENSE"), "");
    }

    #[test]
    fn filter_is_anchored() {
        let f = PathFilter::compile(r"^\.lookout\.yml$", "", true).unwrap();
        assert!(!f.skip(".lookout.yml"));
        assert!(f.skip("sub/.lookout.yml"));
        assert!(f.skip("lookout.yml"));
    }

    #[test]
    fn filter_rejects_bad_pattern() {
        let err = PathFilter::compile("(", "", true).unwrap_err();
        assert_eq!(err.code, crate::rpc::INVALID_ARGUMENT);
    }

    #[test]
    fn exclude_and_vendor_combine() {
        let f = PathFilter::compile("", r".*_test\.go", false).unwrap();
        assert!(f.skip("pkg/a_test.go"));
        assert!(f.skip("vendor/dep.go"));
        assert!(!f.skip("pkg/a.go"));
    }
}

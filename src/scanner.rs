//! Pull-based lazy iteration over streamed items.
//!
//! A [`Scanner`] bridges upstream I/O (git walks, RPC streams) to downstream
//! consumers without buffering the whole sequence: `next` advances, `item`
//! takes the current element, `err` reports why the sequence ended, `close`
//! releases resources. Decorators stack (a filter over a map over a source)
//! and `close` unwinds through the stack.

use anyhow::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;

/// Contract for a lazy sequence of items.
///
/// Usage: call `next` until it returns `false`; between a truthy `next` and
/// the following call, `item` takes the current element (exactly once). After
/// `next` returns `false`, `err` is the authoritative termination signal
/// (`None` means clean end of stream) and stays stable across repeated calls.
/// `close` is idempotent and safe to call in any state.
#[async_trait]
pub trait Scanner: Send {
    type Item: Send + Default;

    /// Advance to the next item; `false` on end of stream or error.
    async fn next(&mut self) -> bool;

    /// Final error after `next` returned `false`; `None` on a clean end.
    fn err(&self) -> Option<&Error>;

    /// Take the current item. Valid only after a truthy `next`; a second
    /// take before the next advance yields a default value.
    fn item(&mut self) -> Self::Item;

    /// Release underlying resources.
    async fn close(&mut self) -> Result<()>;
}

/// Boxed scanner, the form the data-service pipeline passes around.
pub type BoxScanner<T> = Box<dyn Scanner<Item = T>>;

impl<T: Send + Default> std::fmt::Debug for dyn Scanner<Item = T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Scanner")
    }
}

/// Filter decision: `Ok(true)` skips the item, the first `Err` terminates
/// the scanner with that error.
pub type FilterFn<T> = Box<dyn FnMut(&T) -> Result<bool> + Send>;

/// One-shot hook run at the first `next`; a failure becomes the scanner's
/// error and no items are yielded.
pub type StartFn = Box<dyn FnOnce() -> Result<()> + Send>;

// ─── VecScanner ──────────────────────────────────────────────────────────────

/// Scanner over a prebuilt vector. Backs the git loader's precomputed walks
/// and the test fixtures.
pub struct VecScanner<T> {
    items: VecDeque<T>,
    current: Option<T>,
    err: Option<Error>,
}

impl<T> VecScanner<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
            current: None,
            err: None,
        }
    }

    /// A scanner that ends immediately with `err` without yielding anything.
    pub fn failing(err: Error) -> Self {
        Self {
            items: VecDeque::new(),
            current: None,
            err: Some(err),
        }
    }
}

#[async_trait]
impl<T: Send + Default> Scanner for VecScanner<T> {
    type Item = T;

    async fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        match self.items.pop_front() {
            Some(item) => {
                self.current = Some(item);
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn item(&mut self) -> T {
        self.current.take().unwrap_or_default()
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ─── FnScanner ───────────────────────────────────────────────────────────────

/// Filtering decorator with an optional one-shot on-start hook.
pub struct FnScanner<T: Send + Default> {
    inner: BoxScanner<T>,
    filter: Option<FilterFn<T>>,
    on_start: Option<StartFn>,
    current: Option<T>,
    err: Option<Error>,
    done: bool,
}

impl<T: Send + Default> FnScanner<T> {
    pub fn new(inner: BoxScanner<T>, filter: FilterFn<T>) -> Self {
        Self {
            inner,
            filter: Some(filter),
            on_start: None,
            current: None,
            err: None,
            done: false,
        }
    }

    pub fn with_on_start(mut self, hook: StartFn) -> Self {
        self.on_start = Some(hook);
        self
    }
}

#[async_trait]
impl<T: Send + Default> Scanner for FnScanner<T> {
    type Item = T;

    async fn next(&mut self) -> bool {
        if self.done {
            return false;
        }

        if let Some(hook) = self.on_start.take() {
            if let Err(e) = hook() {
                self.err = Some(e);
                self.done = true;
                return false;
            }
        }

        loop {
            if !self.inner.next().await {
                self.done = true;
                return false;
            }

            let item = self.inner.item();
            let skip = match self.filter.as_mut() {
                Some(f) => f(&item),
                None => Ok(false),
            };
            match skip {
                Ok(true) => continue,
                Ok(false) => {
                    self.current = Some(item);
                    return true;
                }
                Err(e) => {
                    self.err = Some(e);
                    self.done = true;
                    return false;
                }
            }
        }
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref().or_else(|| self.inner.err())
    }

    fn item(&mut self) -> T {
        self.current.take().unwrap_or_default()
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

// ─── MapScanner ──────────────────────────────────────────────────────────────

/// In-place transform decorator; used by the language and purge stages.
pub struct MapScanner<T: Send + Default> {
    inner: BoxScanner<T>,
    map: Box<dyn FnMut(&mut T) + Send>,
    current: Option<T>,
}

impl<T: Send + Default> MapScanner<T> {
    pub fn new(inner: BoxScanner<T>, map: Box<dyn FnMut(&mut T) + Send>) -> Self {
        Self {
            inner,
            map,
            current: None,
        }
    }
}

#[async_trait]
impl<T: Send + Default> Scanner for MapScanner<T> {
    type Item = T;

    async fn next(&mut self) -> bool {
        if !self.inner.next().await {
            return false;
        }
        let mut item = self.inner.item();
        (self.map)(&mut item);
        self.current = Some(item);
        true
    }

    fn err(&self) -> Option<&Error> {
        self.inner.err()
    }

    fn item(&mut self) -> T {
        self.current.take().unwrap_or_default()
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// Drain a scanner into a vector, closing it on every path. Convenience for
/// consumers that want the whole (small) sequence, like the config resolver.
pub async fn collect<T: Send + Default>(mut scanner: BoxScanner<T>) -> Result<Vec<T>> {
    let mut items = Vec::new();
    while scanner.next().await {
        items.push(scanner.item());
    }
    let failed = scanner.err().map(|e| anyhow::anyhow!("{e:#}"));
    scanner.close().await?;
    match failed {
        Some(e) => Err(e),
        None => Ok(items),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn numbers(n: i64) -> BoxScanner<i64> {
        Box::new(VecScanner::new((0..n).collect()))
    }

    #[tokio::test]
    async fn vec_scanner_yields_all_items() {
        let mut s = numbers(3);
        let mut seen = Vec::new();
        while s.next().await {
            seen.push(s.item());
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(!s.next().await);
        assert!(s.err().is_none());
        assert!(s.close().await.is_ok());
    }

    #[tokio::test]
    async fn filter_skips_matching_items() {
        let mut s = FnScanner::new(numbers(4), Box::new(|n: &i64| Ok(n % 2 == 0)));
        let mut seen = Vec::new();
        while s.next().await {
            seen.push(s.item());
        }
        assert_eq!(seen, vec![1, 3]);
        assert!(s.err().is_none());
    }

    #[tokio::test]
    async fn filter_error_terminates_scan() {
        let mut s = FnScanner::new(numbers(3), Box::new(|_: &i64| Err(anyhow!("boom"))));
        assert!(!s.next().await);
        assert_eq!(s.err().unwrap().to_string(), "boom");
        // err is stable across repeated calls
        assert!(!s.next().await);
        assert_eq!(s.err().unwrap().to_string(), "boom");
        assert!(s.close().await.is_ok());
        assert!(s.close().await.is_ok());
    }

    #[tokio::test]
    async fn on_start_runs_once_before_first_item() {
        let started = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = started.clone();
        let mut s = FnScanner::new(numbers(3), Box::new(|_: &i64| Ok(false))).with_on_start(
            Box::new(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }),
        );

        let mut count = 0;
        while s.next().await {
            s.item();
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(started.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn on_start_failure_yields_no_items() {
        let mut s = FnScanner::new(numbers(3), Box::new(|_: &i64| Ok(false)))
            .with_on_start(Box::new(|| Err(anyhow!("start failed"))));

        assert!(!s.next().await);
        assert_eq!(s.err().unwrap().to_string(), "start failed");
    }

    #[tokio::test]
    async fn map_transforms_each_item() {
        let mut s = MapScanner::new(numbers(3), Box::new(|n: &mut i64| *n *= 10));
        let mut seen = Vec::new();
        while s.next().await {
            seen.push(s.item());
        }
        assert_eq!(seen, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn decorators_propagate_source_error() {
        let source: BoxScanner<i64> = Box::new(VecScanner::failing(anyhow!("io down")));
        let mut s = MapScanner::new(source, Box::new(|_: &mut i64| {}));
        assert!(!s.next().await);
        assert_eq!(s.err().unwrap().to_string(), "io down");
    }

    #[tokio::test]
    async fn collect_surfaces_scan_error() {
        let source: BoxScanner<i64> = Box::new(VecScanner::failing(anyhow!("bad")));
        assert!(collect(source).await.is_err());
        assert_eq!(collect(numbers(2)).await.unwrap(), vec![0, 1]);
    }
}

use crate::core::sync::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Snapshot of indexing progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub total_items: usize,
    pub items_loaded: usize,
    pub current_item: Option<String>,
}

impl Progress {
    /// Completed fraction in `[0, 1]`; zero until the total is known.
    pub fn fraction(&self) -> f32 {
        if self.total_items == 0 {
            0.0
        } else {
            (self.items_loaded as f32 / self.total_items as f32).min(1.0)
        }
    }
}

/// Progress and cancellation token for a single indexing attempt.
///
/// Shared between the thread that requested indexing and the worker doing
/// it. A context is never reused: every attempt allocates a fresh one.
#[derive(Debug, Default)]
pub struct LoadingContext {
    progress: Mutex<Progress>,
    cancelled: AtomicBool,
    // Held by `cancel` and `commit`, so a commit either finishes before
    // cancellation returns or never runs.
    commit_gate: Mutex<()>,
}

impl LoadingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total_items(&self, total: usize) {
        lock(&self.progress).total_items = total;
    }

    pub fn total_items(&self) -> usize {
        lock(&self.progress).total_items
    }

    pub fn items_loaded(&self) -> usize {
        lock(&self.progress).items_loaded
    }

    pub fn current_item(&self) -> Option<String> {
        lock(&self.progress).current_item.clone()
    }

    /// Record the item about to be processed.
    pub fn start_item(&self, item: impl Into<String>) {
        lock(&self.progress).current_item = Some(item.into());
    }

    /// Count one more item as loaded.
    pub fn item_loaded(&self) {
        let mut progress = lock(&self.progress);
        progress.items_loaded += 1;
    }

    pub fn progress(&self) -> Progress {
        lock(&self.progress).clone()
    }

    /// Request cancellation. Idempotent.
    ///
    /// Blocks while a [`commit`](Self::commit) is in flight; once this
    /// returns, no later commit on this context will run.
    pub fn cancel(&self) {
        let _gate = lock(&self.commit_gate);
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("loading context cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run `f` unless the context has been cancelled.
    ///
    /// Workers publish their results through this so a cancelled attempt
    /// can never write after `cancel` has returned. `f` must not call
    /// `cancel` on the same context.
    pub fn commit<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let _gate = lock(&self.commit_gate);
        if self.is_cancelled() {
            None
        } else {
            Some(f())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_progress_tracking() {
        let ctx = LoadingContext::new();
        ctx.set_total_items(4);
        ctx.start_item("a.md");
        ctx.item_loaded();
        ctx.start_item("b.md");
        ctx.item_loaded();

        let progress = ctx.progress();
        assert_eq!(progress.total_items, 4);
        assert_eq!(progress.items_loaded, 2);
        assert_eq!(progress.current_item.as_deref(), Some("b.md"));
        assert!((progress.fraction() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_fraction_without_total() {
        assert_eq!(Progress::default().fraction(), 0.0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let ctx = LoadingContext::new();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_commit_skipped_after_cancel() {
        let ctx = LoadingContext::new();
        assert_eq!(ctx.commit(|| 1), Some(1));
        ctx.cancel();
        assert_eq!(ctx.commit(|| 2), None);
    }

    #[test]
    fn test_items_loaded_across_threads() {
        let ctx = Arc::new(LoadingContext::new());
        ctx.set_total_items(400);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || {
                    for _ in 0..100 {
                        ctx.item_loaded();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(ctx.items_loaded(), 400);
    }
}

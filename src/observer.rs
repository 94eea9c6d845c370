//! Observer trait for per-reference pipeline events.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::config::NamerConfigBuilder::observer`] to receive events as the
//! pipeline classifies references, calls the naming model, and executes the
//! attachment plan.
//!
//! The observer is also the library's interaction point: before each model
//! batch is sent, [`PipelineObserver::confirm_batch`] is consulted and may
//! cancel the run. Callers can forward events to a progress bar, a log, or a
//! UI without the library knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use md_intent_namer::{NamerConfig, PipelineObserver};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingObserver {
//!     named: Arc<AtomicUsize>,
//! }
//!
//! impl PipelineObserver for CountingObserver {
//!     fn on_reference_named(&self, index: usize, total: usize, name: &str) {
//!         self.named.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("[{index}/{total}] -> {name}");
//!     }
//! }
//!
//! let observer = Arc::new(CountingObserver {
//!     named: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = NamerConfig::builder()
//!     .observer(observer as Arc<dyn PipelineObserver>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it works through a document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `confirm_batch` defaults to `true` (proceed).
///
/// Implementations must be `Send + Sync`; the same observer instance may be
/// shared between a preview pass and an apply pass.
pub trait PipelineObserver: Send + Sync {
    /// Called once after scanning, before any model call.
    ///
    /// # Arguments
    /// * `total_refs` — image references found in the document
    fn on_scan_complete(&self, total_refs: usize) {
        let _ = total_refs;
    }

    /// Called before a batch request is sent to the naming model.
    ///
    /// Return `false` to cancel the run. `batch_payload` is the JSON text
    /// that would be sent, so interactive hosts can show it for approval.
    fn confirm_batch(&self, batch_num: usize, batch_size: usize, batch_payload: &str) -> bool {
        let _ = (batch_num, batch_size, batch_payload);
        true
    }

    /// Called when a reference has received its final name.
    ///
    /// # Arguments
    /// * `index` — 1-indexed position among the document's references
    /// * `total` — total references
    /// * `name`  — final file name chosen for this reference
    fn on_reference_named(&self, index: usize, total: usize, name: &str) {
        let _ = (index, total, name);
    }

    /// Called when the model fails for a reference and the pipeline falls
    /// back to a heuristic phrase.
    fn on_model_fallback(&self, index: usize, total: usize, error: &str) {
        let _ = (index, total, error);
    }

    /// Called before a plan item is executed (move or download).
    ///
    /// # Arguments
    /// * `item_index` — 1-indexed plan item
    /// * `total`      — items in the plan
    /// * `action`     — `"move"` or `"download"`
    /// * `target`     — destination file name
    fn on_item_start(&self, item_index: usize, total: usize, action: &str, target: &str) {
        let _ = (item_index, total, action, target);
    }

    /// Called after a plan item finishes.
    ///
    /// # Arguments
    /// * `status` — `"done"` or `"error"`
    /// * `detail` — last log line for this item
    fn on_item_complete(&self, item_index: usize, total: usize, status: &str, detail: &str) {
        let _ = (item_index, total, status, detail);
    }

    /// Called once after the run, whether or not it completed all items.
    ///
    /// # Arguments
    /// * `total_refs` — references in the document
    /// * `done_count` — plan items that reached `done`
    fn on_run_complete(&self, total_refs: usize, done_count: usize) {
        let _ = (total_refs, done_count);
    }
}

/// A no-op implementation for callers that don't need pipeline events.
///
/// This is the default when no observer is configured.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Convenience alias matching the type stored in [`crate::config::NamerConfig`].
pub type Observer = Arc<dyn PipelineObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingObserver {
        scans: Arc<AtomicUsize>,
        named: Arc<AtomicUsize>,
        fallbacks: Arc<AtomicUsize>,
        items: Arc<AtomicUsize>,
        done_total: Arc<AtomicUsize>,
        allow_batches: bool,
    }

    impl PipelineObserver for TrackingObserver {
        fn on_scan_complete(&self, total_refs: usize) {
            self.scans.store(total_refs, Ordering::SeqCst);
        }

        fn confirm_batch(&self, _batch_num: usize, _batch_size: usize, _payload: &str) -> bool {
            self.allow_batches
        }

        fn on_reference_named(&self, _index: usize, _total: usize, _name: &str) {
            self.named.fetch_add(1, Ordering::SeqCst);
        }

        fn on_model_fallback(&self, _index: usize, _total: usize, _error: &str) {
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_item_complete(&self, _item_index: usize, _total: usize, _status: &str, _detail: &str) {
            self.items.fetch_add(1, Ordering::SeqCst);
        }

        fn on_run_complete(&self, _total_refs: usize, done_count: usize) {
            self.done_total.store(done_count, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let obs = NoopObserver;
        obs.on_scan_complete(4);
        assert!(obs.confirm_batch(1, 5, "{}"));
        obs.on_reference_named(1, 4, "doc_001_overview.png");
        obs.on_model_fallback(2, 4, "model call failed");
        obs.on_item_start(1, 4, "move", "doc_001_overview.png");
        obs.on_item_complete(1, 4, "done", "moved");
        obs.on_run_complete(4, 4);
    }

    #[test]
    fn tracking_observer_receives_events() {
        let tracker = TrackingObserver {
            scans: Arc::new(AtomicUsize::new(0)),
            named: Arc::new(AtomicUsize::new(0)),
            fallbacks: Arc::new(AtomicUsize::new(0)),
            items: Arc::new(AtomicUsize::new(0)),
            done_total: Arc::new(AtomicUsize::new(0)),
            allow_batches: true,
        };

        tracker.on_scan_complete(3);
        assert_eq!(tracker.scans.load(Ordering::SeqCst), 3);

        tracker.on_reference_named(1, 3, "a.png");
        tracker.on_reference_named(2, 3, "b.png");
        tracker.on_model_fallback(3, 3, "timeout");
        assert_eq!(tracker.named.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.fallbacks.load(Ordering::SeqCst), 1);

        tracker.on_item_complete(1, 3, "done", "moved");
        tracker.on_item_complete(2, 3, "done", "exists");
        assert_eq!(tracker.items.load(Ordering::SeqCst), 2);

        tracker.on_run_complete(3, 2);
        assert_eq!(tracker.done_total.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn confirm_batch_can_cancel() {
        let tracker = TrackingObserver {
            scans: Arc::new(AtomicUsize::new(0)),
            named: Arc::new(AtomicUsize::new(0)),
            fallbacks: Arc::new(AtomicUsize::new(0)),
            items: Arc::new(AtomicUsize::new(0)),
            done_total: Arc::new(AtomicUsize::new(0)),
            allow_batches: false,
        };
        assert!(!tracker.confirm_batch(1, 5, "{\"images\":[]}"));
    }

    #[test]
    fn arc_dyn_observer_works() {
        let obs: Arc<dyn PipelineObserver> = Arc::new(NoopObserver);
        obs.on_scan_complete(10);
        assert!(obs.confirm_batch(1, 5, "{}"));
    }
}

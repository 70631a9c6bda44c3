//! Process-wide collection registry.
//!
//! Re-creating a collection under the same name (hot reload, test reruns)
//! must first tear down the previous instance: cancel its stream
//! subscription and detach its persistence handles. The registry maps
//! collection names to their cleanup functions to make that idempotent.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

type Cleanup = Box<dyn FnOnce() + Send>;

fn registry() -> &'static Mutex<HashMap<String, Cleanup>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Cleanup>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register the cleanup function for a collection, running any previous
/// registration's cleanup first.
pub fn register(collection: &str, cleanup: Cleanup) {
    let previous = registry()
        .lock()
        .unwrap()
        .insert(collection.to_string(), cleanup);
    if let Some(previous) = previous {
        log::debug!("Cleaning up previous instance of collection '{}'", collection);
        previous();
    }
}

/// Run and remove the registered cleanup for a collection, if any.
pub fn cleanup(collection: &str) {
    let cleanup = registry().lock().unwrap().remove(collection);
    if let Some(cleanup) = cleanup {
        cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_runs_previous_cleanup() {
        let counter = Arc::new(AtomicUsize::new(0));

        let first = counter.clone();
        register("registry-test-a", Box::new(move || {
            first.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let second = counter.clone();
        register("registry-test-a", Box::new(move || {
            second.fetch_add(10, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        cleanup("registry-test-a");
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let observed = counter.clone();
        register("registry-test-b", Box::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        cleanup("registry-test-b");
        cleanup("registry-test-b");

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

//! Operation-scoped I/O handle tracking

use crate::core::error::Result;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Anything an operation opens and must close at teardown
pub trait IoHandle: Send {
    /// Short description used in logs
    fn describe(&self) -> String;

    /// Release the handle. Must tolerate being called more than once.
    fn close(&mut self) -> Result<()>;
}

pub type SharedHandle = Arc<Mutex<dyn IoHandle>>;

/// Every handle opened by one operation, closed together exactly once
#[derive(Default)]
pub struct HandleSet {
    handles: Vec<SharedHandle>,
    closed: bool,
}

impl HandleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a handle. Registering after teardown closes it immediately.
    pub fn register(&mut self, handle: SharedHandle) {
        if self.closed {
            close_one(&handle);
            return;
        }
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close every tracked handle; later calls do nothing
    pub fn close_all(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for handle in self.handles.drain(..) {
            close_one(&handle);
        }
    }
}

impl Drop for HandleSet {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn close_one(handle: &SharedHandle) {
    let mut guard = handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let name = guard.describe();
    match guard.close() {
        Ok(()) => debug!(handle = %name, "Closed I/O handle"),
        Err(e) => warn!(handle = %name, error = %e, "Failed to close I/O handle"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl IoHandle for Counting {
        fn describe(&self) -> String {
            "counting".to_string()
        }

        fn close(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_close_all_runs_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut set = HandleSet::new();
        set.register(Arc::new(Mutex::new(Counting(closes.clone()))));
        set.register(Arc::new(Mutex::new(Counting(closes.clone()))));

        set.close_all();
        set.close_all();
        drop(set);

        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_after_close() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut set = HandleSet::new();
        set.close_all();
        set.register(Arc::new(Mutex::new(Counting(closes.clone()))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }
}

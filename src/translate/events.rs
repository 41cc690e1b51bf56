//! Caller-facing event notifications
//!
//! Handlers are registered per operation and identified by a subscription
//! id. Notification snapshots the handler list first and calls handlers
//! without holding any lock, so a handler may re-enter the operation.

use crate::core::error::{ErrorReport, TranslateError};
use crate::library::models::{CollectionId, ItemId};
use crate::pipeline::records::{ScrapedCollection, ScrapedItem};
use crate::translator::types::FoundTranslator;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Unique identifier for a subscription
pub type SubscriptionId = String;

/// Selection candidate: (key, display title)
pub type SelectCandidate = (String, String);

/// Returns the keys the caller approved
pub type SelectHandler = Arc<dyn Fn(&[SelectCandidate]) -> Vec<String> + Send + Sync>;
/// Fired after a record was persisted
pub type ItemDoneHandler = Arc<dyn Fn(ItemId, &ScrapedItem) + Send + Sync>;
/// Receives records instead of the pipeline (nested translators)
pub type ItemHandler = Arc<dyn Fn(ScrapedItem) + Send + Sync>;
pub type CollectionDoneHandler = Arc<dyn Fn(CollectionId, &ScrapedCollection) + Send + Sync>;
pub type DoneHandler = Arc<dyn Fn(bool) + Send + Sync>;
/// Returning `Some(false)` suppresses the log echo
pub type DebugHandler = Arc<dyn Fn(&str) -> Option<bool> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&TranslateError, &ErrorReport) + Send + Sync>;
pub type TranslatorsHandler = Arc<dyn Fn(&[FoundTranslator]) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    select: Vec<(SubscriptionId, SelectHandler)>,
    item_done: Vec<(SubscriptionId, ItemDoneHandler)>,
    item: Vec<(SubscriptionId, ItemHandler)>,
    collection_done: Vec<(SubscriptionId, CollectionDoneHandler)>,
    done: Vec<(SubscriptionId, DoneHandler)>,
    debug: Vec<(SubscriptionId, DebugHandler)>,
    error: Vec<(SubscriptionId, ErrorHandler)>,
    translators: Vec<(SubscriptionId, TranslatorsHandler)>,
}

fn subscribe<H>(list: &mut Vec<(SubscriptionId, H)>, handler: H) -> SubscriptionId {
    let id = Uuid::new_v4().to_string();
    list.push((id.clone(), handler));
    id
}

fn snapshot<H: Clone>(list: &[(SubscriptionId, H)]) -> Vec<H> {
    list.iter().map(|(_, h)| h.clone()).collect()
}

fn remove<H>(list: &mut Vec<(SubscriptionId, H)>, id: &str) -> bool {
    let before = list.len();
    list.retain(|(sid, _)| sid != id);
    list.len() != before
}

/// Handler registry for one operation
#[derive(Default)]
pub struct Handlers {
    subscribers: Mutex<Subscribers>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn on_select(&self, handler: SelectHandler) -> SubscriptionId {
        subscribe(&mut self.lock().select, handler)
    }

    pub fn on_item_done(&self, handler: ItemDoneHandler) -> SubscriptionId {
        subscribe(&mut self.lock().item_done, handler)
    }

    pub fn on_item(&self, handler: ItemHandler) -> SubscriptionId {
        subscribe(&mut self.lock().item, handler)
    }

    pub fn on_collection_done(&self, handler: CollectionDoneHandler) -> SubscriptionId {
        subscribe(&mut self.lock().collection_done, handler)
    }

    pub fn on_done(&self, handler: DoneHandler) -> SubscriptionId {
        subscribe(&mut self.lock().done, handler)
    }

    pub fn on_debug(&self, handler: DebugHandler) -> SubscriptionId {
        subscribe(&mut self.lock().debug, handler)
    }

    pub fn on_error(&self, handler: ErrorHandler) -> SubscriptionId {
        subscribe(&mut self.lock().error, handler)
    }

    pub fn on_translators(&self, handler: TranslatorsHandler) -> SubscriptionId {
        subscribe(&mut self.lock().translators, handler)
    }

    /// Remove a subscription of any kind
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut subs = self.lock();
        remove(&mut subs.select, id)
            || remove(&mut subs.item_done, id)
            || remove(&mut subs.item, id)
            || remove(&mut subs.collection_done, id)
            || remove(&mut subs.done, id)
            || remove(&mut subs.debug, id)
            || remove(&mut subs.error, id)
            || remove(&mut subs.translators, id)
    }

    /// The first registered selection handler
    pub(crate) fn select_handler(&self) -> Option<SelectHandler> {
        self.lock().select.first().map(|(_, h)| h.clone())
    }

    pub(crate) fn has_item_handlers(&self) -> bool {
        !self.lock().item.is_empty()
    }

    pub(crate) fn item(&self, record: &ScrapedItem) {
        let handlers = snapshot(&self.lock().item);
        for handler in handlers {
            handler(record.clone());
        }
    }

    pub(crate) fn item_done(&self, id: ItemId, record: &ScrapedItem) {
        let handlers = snapshot(&self.lock().item_done);
        for handler in handlers {
            handler(id, record);
        }
    }

    pub(crate) fn collection_done(&self, id: CollectionId, collection: &ScrapedCollection) {
        let handlers = snapshot(&self.lock().collection_done);
        for handler in handlers {
            handler(id, collection);
        }
    }

    pub(crate) fn done(&self, success: bool) {
        let handlers = snapshot(&self.lock().done);
        for handler in handlers {
            handler(success);
        }
    }

    /// Returns whether the message should still be echoed to the log
    pub(crate) fn debug(&self, message: &str) -> bool {
        let mut echo = true;
        let handlers = snapshot(&self.lock().debug);
        for handler in handlers {
            if handler(message) == Some(false) {
                echo = false;
            }
        }
        echo
    }

    pub(crate) fn error(&self, error: &TranslateError, report: &ErrorReport) {
        let handlers = snapshot(&self.lock().error);
        for handler in handlers {
            handler(error, report);
        }
    }

    pub(crate) fn translators(&self, found: &[FoundTranslator]) {
        let handlers = snapshot(&self.lock().translators);
        for handler in handlers {
            handler(found);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let handlers = Handlers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = handlers.on_done(Arc::new(move |_: bool| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        handlers.done(true);
        assert!(handlers.unsubscribe(&id));
        assert!(!handlers.unsubscribe(&id));
        handlers.done(true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_echo_suppression() {
        let handlers = Handlers::new();
        assert!(handlers.debug("no handlers"));
        handlers.on_debug(Arc::new(|_: &str| None));
        assert!(handlers.debug("undecided"));
        handlers.on_debug(Arc::new(|_: &str| Some(false)));
        assert!(!handlers.debug("quiet"));
    }

    #[test]
    fn test_handler_may_reenter() {
        let handlers = Arc::new(Handlers::new());
        let inner = handlers.clone();
        handlers.on_done(Arc::new(move |_: bool| {
            inner.on_done(Arc::new(|_: bool| {}));
        }));
        handlers.done(false);
    }
}

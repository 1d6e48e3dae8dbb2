use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::{Listener, ListenerId, ProviderEvent, ProviderEventKind};

/// Listener table shared by provider implementations.
#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, ProviderEventKind, Listener)>>,
}

impl EventEmitter {
    pub fn on(&self, kind: ProviderEventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, kind, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        guard.retain(|(entry, _, _)| *entry != id);
        guard.len() != before
    }

    /// Listeners run outside the table lock so they may re-enter `on`/`remove`.
    pub fn emit(&self, event: &ProviderEvent) {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry_kind, _)| *entry_kind == kind)
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in matching {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count(&self, kind: ProviderEventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry_kind, _)| *entry_kind == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_api_types::ChainId;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emits_only_to_matching_kind_and_removes_by_id() {
        let emitter = EventEmitter::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let chain_listener = emitter.on(
            ProviderEventKind::ChainChanged,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        emitter.on(ProviderEventKind::AccountsChanged, Arc::new(|_| {}));

        emitter.emit(&ProviderEvent::ChainChanged(ChainId(5)));
        emitter.emit(&ProviderEvent::AccountsChanged(Vec::new()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.count(ProviderEventKind::ChainChanged), 1);

        assert!(emitter.remove(chain_listener));
        assert!(!emitter.remove(chain_listener));
        emitter.emit(&ProviderEvent::ChainChanged(ChainId(6)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 1);
    }
}

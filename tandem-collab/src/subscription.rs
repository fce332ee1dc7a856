//! Which application event types the caller wants delivered.
//!
//! The registry only does bookkeeping; the transport turns the returned
//! type lists into subscribe/unsubscribe frames and replays
//! [`active_types`](EventSubscriptionRegistry::active_types) after every
//! reconnect.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::event::EventMessage;

pub type EventCallback = Arc<dyn Fn(&EventMessage) + Send + Sync>;

/// Handle naming one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

#[derive(Default)]
pub struct EventSubscriptionRegistry {
    next_id: u64,
    by_type: BTreeMap<String, Vec<(CallbackId, EventCallback)>>,
}

impl EventSubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `types`. Returns its id and the types that
    /// had no subscriber before (the ones the relay must be told about).
    pub fn subscribe<I, S>(&mut self, types: I, callback: EventCallback) -> (CallbackId, Vec<String>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = CallbackId(self.next_id);
        self.next_id += 1;

        let mut fresh = Vec::new();
        for event_type in types {
            let event_type = event_type.into();
            let callbacks = self.by_type.entry(event_type.clone()).or_default();
            if callbacks.iter().any(|(cid, _)| *cid == id) {
                continue;
            }
            if callbacks.is_empty() {
                fresh.push(event_type);
            }
            callbacks.push((id, callback.clone()));
        }
        (id, fresh)
    }

    /// Remove `callback` (or every callback when `None`) from `types`.
    /// Returns the types left without any subscriber.
    pub fn unsubscribe<I, S>(&mut self, types: I, callback: Option<CallbackId>) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut emptied = Vec::new();
        for event_type in types {
            let event_type = event_type.as_ref();
            let Some(callbacks) = self.by_type.get_mut(event_type) else {
                continue;
            };
            match callback {
                Some(id) => callbacks.retain(|(cid, _)| *cid != id),
                None => callbacks.clear(),
            }
            if callbacks.is_empty() {
                self.by_type.remove(event_type);
                emptied.push(event_type.to_owned());
            }
        }
        emptied
    }

    pub fn is_subscribed(&self, event_type: &str) -> bool {
        self.by_type.contains_key(event_type)
    }

    /// Every type with at least one subscriber, sorted.
    pub fn active_types(&self) -> Vec<String> {
        self.by_type.keys().cloned().collect()
    }

    /// Callbacks interested in `event_type`, cloned so they can run after
    /// the registry lock is released.
    pub fn callbacks_for(&self, event_type: &str) -> Vec<EventCallback> {
        self.by_type
            .get(event_type)
            .map(|cbs| cbs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for EventSubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .by_type
            .iter()
            .map(|(t, cbs)| (t.as_str(), cbs.len()))
            .collect();
        f.debug_struct("EventSubscriptionRegistry")
            .field("types", &counts)
            .finish()
    }
}

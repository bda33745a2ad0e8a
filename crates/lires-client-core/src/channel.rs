//! Runtime-independent parts of the event channel: handler registration and
//! the reconnect state machine. The I/O loop that drives them lives in the
//! application crate.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::debug;

use crate::events::{Event, EventKind};

/// A registered event callback.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    kind: EventKind,
    handler: EventHandler,
}

#[derive(Default)]
struct Registrations {
    next_id: u64,
    entries: Vec<Registration>,
}

fn lock(inner: &Mutex<Registrations>) -> MutexGuard<'_, Registrations> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event handlers keyed by [`EventKind`], invoked in registration order.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<Mutex<Registrations>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every kind in `kinds`.
    ///
    /// Registering the same `Arc` again for a kind it already handles is a
    /// no-op. The returned [`Subscription`] unregisters on drop.
    pub fn register(
        &self,
        kinds: impl IntoIterator<Item = EventKind>,
        handler: EventHandler,
    ) -> Subscription {
        let mut registrations = lock(&self.inner);
        let mut ids = Vec::new();
        for kind in kinds {
            let duplicate = registrations
                .entries
                .iter()
                .any(|r| r.kind == kind && Arc::ptr_eq(&r.handler, &handler));
            if duplicate {
                debug!(%kind, "handler already registered");
                continue;
            }
            let id = HandlerId(registrations.next_id);
            registrations.next_id += 1;
            registrations.entries.push(Registration {
                id,
                kind,
                handler: Arc::clone(&handler),
            });
            ids.push(id);
        }
        Subscription {
            registry: Arc::downgrade(&self.inner),
            ids,
        }
    }

    /// Convenience wrapper around [`register`](Self::register) for closures.
    pub fn on<F>(&self, kinds: impl IntoIterator<Item = EventKind>, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(kinds, Arc::new(handler))
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut registrations = lock(&self.inner);
        let before = registrations.entries.len();
        registrations.entries.retain(|r| r.id != id);
        registrations.entries.len() != before
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Invoke every handler registered for the event's kind. Returns the
    /// number of handlers called.
    ///
    /// Handlers run outside the registry lock, so they may register or
    /// unregister handlers themselves.
    pub fn dispatch(&self, event: &Event) -> usize {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = lock(&self.inner)
            .entries
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| Arc::clone(&r.handler))
            .collect();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

/// Handle for a registration. Dropping it removes the handlers it added.
#[must_use = "dropping a Subscription unregisters its handlers"]
pub struct Subscription {
    registry: Weak<Mutex<Registrations>>,
    ids: Vec<HandlerId>,
}

impl Subscription {
    pub fn ids(&self) -> &[HandlerId] {
        &self.ids
    }

    pub fn unsubscribe(self) {}

    /// Keep the handlers registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.ids.clear();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            lock(&inner).entries.retain(|r| !self.ids.contains(&r.id));
        }
    }
}

/// Connection state of the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    ClosedRetrying,
    ClosedFinal,
}

impl ChannelState {
    pub fn is_final(self) -> bool {
        self == ChannelState::ClosedFinal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: Duration::from_secs(1),
        }
    }
}

/// What to do after the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Reconnect after `after`; `remaining` retries are left afterwards.
    Retry { after: Duration, remaining: u32 },
    GiveUp,
}

/// Counts consecutive closes against a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: ReconnectPolicy,
    remaining: u32,
}

impl RetryBudget {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            remaining: policy.max_retries,
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Restore the full budget (after a successful open, or on request).
    pub fn reset(&mut self) {
        self.remaining = self.policy.max_retries;
    }

    /// Zero the budget so the next close is final.
    pub fn disable(&mut self) {
        self.remaining = 0;
    }

    pub fn on_close(&mut self) -> CloseOutcome {
        if self.remaining == 0 {
            return CloseOutcome::GiveUp;
        }
        self.remaining -= 1;
        CloseOutcome::Retry {
            after: self.policy.backoff,
            remaining: self.remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, NoteChange};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn note_event() -> Event {
        Event {
            session_id: "s".into(),
            payload: EventPayload::UpdateNote(NoteChange {
                uuid: Some("d".into()),
                note: "n".into(),
            }),
        }
    }

    #[test]
    fn dispatch_in_registration_order() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let log = Arc::clone(&log);
            registry.on([EventKind::UpdateNote], move |_| log.lock().unwrap().push(1))
        };
        let second = {
            let log = Arc::clone(&log);
            registry.on([EventKind::UpdateNote], move |_| log.lock().unwrap().push(2))
        };
        let _other = registry.on([EventKind::DeleteEntry], |_| {
            panic!("wrong kind");
        });

        assert_eq!(registry.dispatch(&note_event()), 2);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        drop((first, second));
    }

    #[test]
    fn same_handler_registered_once() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: EventHandler = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_: &Event| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let a = registry.register([EventKind::UpdateNote], Arc::clone(&handler));
        let b = registry.register([EventKind::UpdateNote, EventKind::DeleteTag], handler);
        assert_eq!(b.ids().len(), 1);
        assert_eq!(registry.handler_count(EventKind::UpdateNote), 1);

        registry.dispatch(&note_event());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop((a, b));
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let registry = HandlerRegistry::new();
        let sub = registry.on(EventKind::LIBRARY, |_| {});
        assert_eq!(registry.handler_count(EventKind::UpdateNote), 1);
        drop(sub);
        assert_eq!(registry.handler_count(EventKind::UpdateNote), 0);

        registry.on([EventKind::Login], |_| {}).detach();
        assert_eq!(registry.handler_count(EventKind::Login), 1);
    }

    #[test]
    fn handler_may_unregister_itself() {
        let registry = HandlerRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let sub = {
            let slot = Arc::clone(&slot);
            registry.on([EventKind::UpdateNote], move |_| {
                slot.lock().unwrap().take();
            })
        };
        *slot.lock().unwrap() = Some(sub);
        assert_eq!(registry.dispatch(&note_event()), 1);
        assert_eq!(registry.dispatch(&note_event()), 0);
    }

    #[test]
    fn budget_counts_down_and_resets() {
        let policy = ReconnectPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(5),
        };
        let mut budget = RetryBudget::new(policy);
        assert_eq!(
            budget.on_close(),
            CloseOutcome::Retry {
                after: Duration::from_millis(5),
                remaining: 1
            }
        );
        assert!(matches!(budget.on_close(), CloseOutcome::Retry { remaining: 0, .. }));
        assert_eq!(budget.on_close(), CloseOutcome::GiveUp);
        budget.reset();
        assert_eq!(budget.remaining(), 2);
        budget.disable();
        assert_eq!(budget.on_close(), CloseOutcome::GiveUp);
    }
}

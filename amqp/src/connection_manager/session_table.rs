use crate::common::AmqpResult;
use crate::session::AmqpSession;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;

/// One table entry, initialized at most once.
#[derive(Default)]
pub(crate) struct SessionSlot {
    session: OnceCell<AmqpSession>,
    orphaned: AtomicBool,
}

impl SessionSlot {
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> AmqpResult<&AmqpSession>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AmqpResult<AmqpSession>>,
    {
        self.session.get_or_try_init(init).await
    }

    pub fn get(&self) -> Option<&AmqpSession> {
        self.session.get()
    }

    fn initialized(&self) -> bool {
        self.session.initialized()
    }

    /// Take the slot out of service; an empty slot leaves its creator to end the session
    fn detach(&self) -> Option<AmqpSession> {
        let session = self.get().cloned();
        self.orphaned.store(session.is_none(), Ordering::SeqCst);
        session
    }
}

/// Who is responsible for a session after its creation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotOwner {
    /// Still registered; the table ends it on removal or close
    Table,
    /// Removed while empty; nobody else will end it
    Creator,
    /// Removed after creation; whoever removed it ended it
    Remover,
}

/// Name-keyed table of sessions.
///
/// Each name maps to a slot that is initialized at most once. The table lock
/// is only held to find or insert a slot; session creation itself runs
/// outside it, so concurrent callers for one name await the same slot while
/// other names proceed independently.
#[derive(Default)]
pub(crate) struct SessionTable {
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the slot for `name`, inserting an empty one if absent
    pub fn slot(&self, name: &str) -> Arc<SessionSlot> {
        self.lock().entry(name.to_string()).or_default().clone()
    }

    pub fn get(&self, name: &str) -> Option<AmqpSession> {
        self.lock().get(name).and_then(|slot| slot.get().cloned())
    }

    /// Remove the entry for `name`; returns the session if one had been created
    pub fn remove(&self, name: &str) -> Option<AmqpSession> {
        self.lock().remove(name)?.detach()
    }

    /// Remove `session` only if it is still the instance registered under its name
    pub fn remove_instance(&self, session: &AmqpSession) -> bool {
        let mut slots = self.lock();
        let registered = slots
            .get(session.name())
            .and_then(|slot| slot.get())
            .is_some_and(|current| current == session);
        if registered {
            slots.remove(session.name());
        }
        registered
    }

    /// Drop an empty `slot` left behind by a failed creation
    pub fn discard_slot(&self, name: &str, slot: &Arc<SessionSlot>) -> bool {
        let mut slots = self.lock();
        let stale = slots
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if stale {
            slots.remove(name);
            slot.orphaned.store(true, Ordering::SeqCst);
        }
        stale
    }

    /// Decide who ends the session held by `slot` now that it is created
    pub fn owner(&self, name: &str, slot: &Arc<SessionSlot>) -> SlotOwner {
        let slots = self.lock();
        if slots
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            SlotOwner::Table
        } else if slot.orphaned.load(Ordering::SeqCst) {
            SlotOwner::Creator
        } else {
            SlotOwner::Remover
        }
    }

    /// Take every created session out of the table
    pub fn drain(&self) -> Vec<AmqpSession> {
        self.lock()
            .drain()
            .filter_map(|(_, slot)| slot.detach())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

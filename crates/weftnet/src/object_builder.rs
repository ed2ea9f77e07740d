//! Per-type dispatch records and the deferred-mutation listener tables.
//!
//! Listener sets are mutated through pending add/remove queues instead of
//! in place. A dispatch cycle flushes the queues, takes the active map out
//! of the lock, invokes the callbacks without holding it, and puts the map
//! back. Listeners can therefore add or remove listeners (including
//! themselves) from inside their own callback; the change becomes visible
//! at the next message boundary for that type.

use crate::network::{DataEvent, Network};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;
use weftnet_core::{ListenerId, Peer};

/// Callback invoked with each received value of type `T`.
pub type DataListener<T> = Box<dyn FnMut(DataEvent<'_, T>) + Send>;

// ---------------------------------------------------------------------------
// Deferred-mutation listener table
// ---------------------------------------------------------------------------

pub(crate) struct ListenerTable<F> {
    active: HashMap<ListenerId, F>,
    to_add: Vec<(ListenerId, F)>,
    to_remove: Vec<ListenerId>,
}

impl<F> ListenerTable<F> {
    pub(crate) fn new() -> Self {
        Self {
            active: HashMap::new(),
            to_add: Vec::new(),
            to_remove: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, id: ListenerId, listener: F) {
        self.to_add.push((id, listener));
    }

    /// Queues a removal. A listener still sitting in the pending-add queue
    /// is cancelled immediately. Returns whether anything will be removed.
    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        if self.active.contains_key(&id) {
            if self.to_remove.contains(&id) {
                false
            } else {
                self.to_remove.push(id);
                true
            }
        } else if let Some(pos) = self.to_add.iter().position(|(added, _)| *added == id) {
            self.to_add.swap_remove(pos);
            true
        } else {
            false
        }
    }

    /// Applies the pending queues to the active map.
    pub(crate) fn flush(&mut self) {
        for (id, listener) in self.to_add.drain(..) {
            self.active.insert(id, listener);
        }
        for id in self.to_remove.drain(..) {
            self.active.remove(&id);
        }
    }

    pub(crate) fn is_active_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Moves the active map out so callbacks can run without the lock.
    pub(crate) fn take_active(&mut self) -> HashMap<ListenerId, F> {
        std::mem::take(&mut self.active)
    }

    /// Puts the active map back after a dispatch cycle. Mutations that
    /// happened in between are waiting in the queues for the next flush.
    pub(crate) fn restore(&mut self, active: HashMap<ListenerId, F>) {
        self.active = active;
    }

    pub(crate) fn clear(&mut self) {
        self.active.clear();
        self.to_add.clear();
        self.to_remove.clear();
    }
}

// ---------------------------------------------------------------------------
// Object builders
// ---------------------------------------------------------------------------

/// Type-erased view of an [`ObjectBuilder`], stored in the registry keyed
/// by type hash.
pub(crate) trait AnyBuilder: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Deserializes one value from the front of `input` and fans it out.
    ///
    /// Returns `Ok(false)` without consuming anything when no listener is
    /// registered, so the caller can offer the bytes to the default
    /// listener instead. Returns `Ok(true)` once the value was consumed.
    fn build_and_call(
        &self,
        network: &Network,
        source: &Peer,
        input: &mut &[u8],
        sent_to_all: bool,
    ) -> Result<bool, rmp_serde::decode::Error>;

    fn remove_listener(&self, id: ListenerId) -> bool;

    fn clear(&self);
}

/// The dispatch record of one registered type: its deserializer (via the
/// `T: DeserializeOwned` bound) plus the listener subtable.
pub(crate) struct ObjectBuilder<T> {
    table: Mutex<ListenerTable<DataListener<T>>>,
}

impl<T> ObjectBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(ListenerTable::new()),
        }
    }

    pub(crate) fn add_listener(&self, id: ListenerId, listener: DataListener<T>) {
        self.table.lock().unwrap().add(id, listener);
    }

    /// Invokes every listener with the given value. Returns whether any
    /// listener was registered.
    pub(crate) fn fire(
        &self,
        network: &Network,
        source: &Peer,
        value: &T,
        is_private: bool,
    ) -> bool {
        let mut active = {
            let mut table = self.table.lock().unwrap();
            table.flush();
            if table.is_active_empty() {
                return false;
            }
            table.take_active()
        };
        for (id, listener) in active.iter_mut() {
            listener(DataEvent {
                network,
                source,
                data: value,
                is_private,
                listener_id: *id,
            });
        }
        self.table.lock().unwrap().restore(active);
        true
    }
}

impl<T: serde::de::DeserializeOwned + 'static> AnyBuilder for ObjectBuilder<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn build_and_call(
        &self,
        network: &Network,
        source: &Peer,
        input: &mut &[u8],
        sent_to_all: bool,
    ) -> Result<bool, rmp_serde::decode::Error> {
        {
            let mut table = self.table.lock().unwrap();
            table.flush();
            if table.is_active_empty() {
                return Ok(false);
            }
        }
        let value: T = rmp_serde::decode::from_read(&mut *input)?;
        self.fire(network, source, &value, !sent_to_all);
        Ok(true)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.table.lock().unwrap().remove(id)
    }

    fn clear(&self) {
        self.table.lock().unwrap().clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_add_is_invisible_until_flush() {
        let mut table: ListenerTable<u32> = ListenerTable::new();
        table.add(1, 10);
        assert!(table.is_active_empty());
        table.flush();
        assert!(!table.is_active_empty());
    }

    #[test]
    fn removing_a_pending_add_cancels_it() {
        let mut table: ListenerTable<u32> = ListenerTable::new();
        table.add(1, 10);
        assert!(table.remove(1));
        table.flush();
        assert!(table.is_active_empty());
    }

    #[test]
    fn double_remove_reports_false() {
        let mut table: ListenerTable<u32> = ListenerTable::new();
        table.add(1, 10);
        table.flush();
        assert!(table.remove(1));
        assert!(!table.remove(1));
        table.flush();
        assert!(table.is_active_empty());
    }

    #[test]
    fn remove_of_unknown_id_reports_false() {
        let mut table: ListenerTable<u32> = ListenerTable::new();
        assert!(!table.remove(7));
    }

    #[test]
    fn take_and_restore_preserve_queued_mutations() {
        let mut table: ListenerTable<u32> = ListenerTable::new();
        table.add(1, 10);
        table.flush();
        let active = table.take_active();
        // A mutation arriving mid-dispatch waits in the queue.
        table.add(2, 20);
        table.restore(active);
        table.flush();
        assert_eq!(table.active.len(), 2);
    }
}

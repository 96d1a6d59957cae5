//! Identifier → connection map with child id allocation.

use crate::error::{Result, SocketError};
use crate::SocketId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

struct Slot<T> {
    serial: u64,
    value: Arc<T>,
}

/// Hands out ids for accepted sockets
///
/// Freed ids are reused first; otherwise a counter moves forward, skipping
/// anything already registered.
#[derive(Debug)]
struct IdAllocator {
    next: SocketId,
    free: Vec<SocketId>,
    generated: HashSet<SocketId>,
}

impl IdAllocator {
    fn candidate(&mut self) -> SocketId {
        if let Some(id) = self.free.pop() {
            return id;
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Live connections keyed by identifier
///
/// Each entry carries the serial of the instance that owns it, so removal
/// on close only ever removes that same instance.
pub struct SessionRegistry<T> {
    entries: DashMap<SocketId, Slot<T>>,
    allocator: Mutex<IdAllocator>,
}

impl<T> SessionRegistry<T> {
    /// Create an empty registry; generated ids start at `first_child_id`
    pub fn new(first_child_id: SocketId) -> Self {
        Self {
            entries: DashMap::new(),
            allocator: Mutex::new(IdAllocator {
                next: first_child_id,
                free: Vec::new(),
                generated: HashSet::new(),
            }),
        }
    }

    fn allocator(&self) -> MutexGuard<'_, IdAllocator> {
        self.allocator.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert under a caller-chosen id
    pub fn register(&self, id: SocketId, serial: u64, value: Arc<T>) -> Result<()> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(SocketError::InvalidInvocation(format!(
                "id {} already in use",
                id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Slot { serial, value });
                trace!("Registered socket {}", id);
                Ok(())
            }
        }
    }

    /// Allocate a child id and insert the value built for it, atomically
    pub fn register_child<F>(&self, build: F) -> Result<(SocketId, Arc<T>)>
    where
        F: FnOnce(SocketId) -> (u64, Arc<T>),
    {
        let mut allocator = self.allocator();
        for _ in 0..=u32::MAX {
            let id = allocator.candidate();
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                let (serial, value) = build(id);
                slot.insert(Slot {
                    serial,
                    value: value.clone(),
                });
                allocator.generated.insert(id);
                trace!("Registered child socket {}", id);
                return Ok((id, value));
            }
        }
        Err(SocketError::Other("socket id space exhausted".to_string()))
    }

    /// The id `register_child` would hand out next, without reserving it
    pub fn next_id(&self) -> SocketId {
        let mut allocator = self.allocator();
        while let Some(&id) = allocator.free.last() {
            if !self.entries.contains_key(&id) {
                return id;
            }
            allocator.free.pop();
        }
        let mut id = allocator.next;
        while self.entries.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        id
    }

    /// Current holder of `id`
    pub fn lookup(&self, id: SocketId) -> Option<Arc<T>> {
        self.entries.get(&id).map(|slot| slot.value.clone())
    }

    /// Remove whatever holds `id`
    pub fn unregister(&self, id: SocketId) -> Option<Arc<T>> {
        let (_, slot) = self.entries.remove(&id)?;
        self.release(id);
        Some(slot.value)
    }

    /// Remove `id` only while it is still held by the instance `serial`
    pub fn unregister_if(&self, id: SocketId, serial: u64) -> Option<Arc<T>> {
        let (_, slot) = self.entries.remove_if(&id, |_, slot| slot.serial == serial)?;
        self.release(id);
        Some(slot.value)
    }

    fn release(&self, id: SocketId) {
        let mut allocator = self.allocator();
        if allocator.generated.remove(&id) {
            allocator.free.push(id);
        }
        trace!("Unregistered socket {}", id);
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything, returning the former holders
    pub fn drain(&self) -> Vec<Arc<T>> {
        let ids: Vec<SocketId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.unregister(id)).collect()
    }
}

impl<T> std::fmt::Debug for SessionRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

//! Correlation-id slab owning in-flight [`IoContext`]s.
//!
//! An id packs a slot and a generation counter into one `u64`. Slots are
//! recycled with a bumped generation, so an id from a finished operation
//! can never alias a newer operation occupying the same slot. `take` is
//! the at-most-once gate: whichever path (readiness delivery, close
//! injection, teardown) takes the context first delivers it; everyone
//! else sees `None`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::context::IoContext;
use crate::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Index {
  generation: u32,
  slot: u32,
}

impl Index {
  fn as_u64(self) -> u64 {
    ((self.generation as u64) << 32) | self.slot as u64
  }

  fn from_u64(id: u64) -> Self {
    Self { generation: (id >> 32) as u32, slot: id as u32 }
  }

  fn next_generation(self) -> Self {
    Self { generation: self.generation.wrapping_add(1), slot: self.slot }
  }
}

struct Record {
  context: IoContext,
  generation: u32,
}

#[derive(Default)]
struct Slots {
  map: HashMap<u32, Record>,
  free: Vec<Index>,
  next_slot: u32,
}

pub(crate) struct ContextStore {
  inner: Mutex<Slots>,
}

impl ContextStore {
  pub fn new() -> Self {
    Self { inner: Mutex::new(Slots::default()) }
  }

  /// Stores a context and returns its correlation id.
  pub fn insert(&self, context: IoContext) -> u64 {
    let mut slots = self.inner.lock();
    let index = match slots.free.pop() {
      Some(free) => free.next_generation(),
      None => {
        let slot = slots.next_slot;
        slots.next_slot = slots.next_slot.wrapping_add(1);
        Index { generation: 0, slot }
      }
    };
    let previous = slots
      .map
      .insert(index.slot, Record { context, generation: index.generation });
    debug_assert!(previous.is_none(), "slot {} double-occupied", index.slot);
    index.as_u64()
  }

  /// Removes and returns the context, or `None` when the id is stale
  /// (wrong generation) or already taken.
  pub fn take(&self, id: u64) -> Option<IoContext> {
    let index = Index::from_u64(id);
    let mut slots = self.inner.lock();
    let Slots { map, free, .. } = &mut *slots;
    match map.entry(index.slot) {
      Entry::Occupied(entry) if entry.get().generation == index.generation => {
        let record = entry.remove();
        free.push(index);
        Some(record.context)
      }
      _ => None,
    }
  }

  /// Mutates a stored context in place, if the id is still live.
  pub fn with_mut<R>(
    &self,
    id: u64,
    f: impl FnOnce(&mut IoContext) -> R,
  ) -> Option<R> {
    let index = Index::from_u64(id);
    let mut slots = self.inner.lock();
    slots
      .map
      .get_mut(&index.slot)
      .filter(|record| record.generation == index.generation)
      .map(|record| f(&mut record.context))
  }

  /// Number of contexts currently in flight.
  pub fn len(&self) -> usize {
    self.inner.lock().map.len()
  }

  /// Empties the store, returning every remaining context. Used on
  /// engine teardown to fail leftovers.
  pub fn drain(&self) -> Vec<IoContext> {
    let mut slots = self.inner.lock();
    let drained =
      slots.map.drain().map(|(_, record)| record.context).collect();
    slots.free.clear();
    slots.next_slot = 0;
    drained
  }
}

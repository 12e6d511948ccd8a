//! Tracing garbage collector for the Zym VM.
//!
//! The heap hands out [`Handle`]s — `(index, generation)` pairs — instead of
//! pointers, so a stale handle to a reclaimed slot can never resolve to a
//! different object. Collection is a plain mark-and-sweep: the VM supplies
//! its roots as a [`Trace`] value and the heap walks the object graph with an
//! explicit worklist.

#![forbid(unsafe_code)]

use std::cell::Cell;

/// A handle to a heap-managed object.
///
/// Slot reuse bumps the slot's generation, so handles left over from a
/// previous occupant fail to resolve instead of aliasing the new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// A value the collector can walk.
pub trait Trace {
    fn trace(&self, tracer: &mut dyn Tracer);
}

/// Mark sink handed to [`Trace`] implementations.
pub trait Tracer {
    fn mark(&mut self, handle: Handle);
}

struct Slot<T> {
    generation: u32,
    /// Slot is marked iff this equals the heap's current epoch.
    marked_epoch: Cell<u32>,
    value: Option<T>,
}

/// A single-threaded mark-and-sweep heap.
pub struct Heap<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    epoch: u32,
}

impl<T> Default for Heap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Heap<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            epoch: 0,
        }
    }

    /// Allocates `value` and returns its handle. Does not collect; the
    /// caller decides when a collection cycle runs.
    pub fn alloc(&mut self, value: T) -> Handle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none(), "free list entry is occupied");
            slot.value = Some(value);
            slot.marked_epoch.set(0);
            return Handle {
                index,
                generation: slot.generation,
            };
        }

        let index: u32 = self
            .slots
            .len()
            .try_into()
            .expect("heap slot index overflow");
        self.slots.push(Slot {
            generation: 0,
            marked_epoch: Cell::new(0),
            value: Some(value),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// Visits every live object mutably.
    ///
    /// The VM uses this for its reference-repair pass when upvalues close:
    /// repair must reach every live reference object, not a bounded subset.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(Handle, &mut T)) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.as_mut() {
                f(
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                );
            }
        }
    }
}

impl<T: Trace> Heap<T> {
    /// Runs one mark-and-sweep cycle with `roots` as the root set.
    pub fn collect(&mut self, roots: &dyn Trace) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            // 2^32 collections have wrapped the epoch counter; reset marks
            // so no slot looks spuriously marked.
            for slot in &self.slots {
                slot.marked_epoch.set(0);
            }
            self.epoch = 1;
        }

        let mut marker = Marker {
            heap: &*self,
            worklist: Vec::new(),
        };
        roots.trace(&mut marker);
        while let Some(handle) = marker.worklist.pop() {
            if let Some(value) = marker.heap.get(handle) {
                value.trace(&mut marker);
            }
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.is_none() || slot.marked_epoch.get() == self.epoch {
                continue;
            }
            slot.value = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
            self.live -= 1;
        }
    }
}

struct Marker<'a, T> {
    heap: &'a Heap<T>,
    worklist: Vec<Handle>,
}

impl<T> Tracer for Marker<'_, T> {
    fn mark(&mut self, handle: Handle) {
        let Some(slot) = self.heap.slots.get(handle.index as usize) else {
            return;
        };
        if slot.generation != handle.generation || slot.value.is_none() {
            return;
        }
        if slot.marked_epoch.get() == self.heap.epoch {
            return;
        }
        slot.marked_epoch.set(self.heap.epoch);
        self.worklist.push(handle);
    }
}

//! Fixed-capacity arena with generation-checked handles
//!
//! Slots are allocated once when the pool is built. Freeing a slot bumps its
//! generation, so handles kept past a free are rejected instead of aliasing
//! whatever reuses the slot.

use serde::{Deserialize, Serialize};

/// Index into a [`Pool`] plus the generation it was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    index: u16,
    generation: u16,
}

impl Handle {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    len: usize,
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(usize::from(u16::MAX));
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        Self { slots, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.capacity() - self.len
    }

    /// Store `value` in a free slot; hands it back when the pool is full
    pub fn insert(&mut self, value: T) -> Result<Handle, T> {
        let Some(index) = self.slots.iter().position(|s| s.value.is_none()) else {
            return Err(value);
        };
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        self.len += 1;
        Ok(Handle {
            index: index as u16,
            generation: slot.generation,
        })
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(usize::from(handle.index))
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(usize::from(handle.index))
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Free the slot and invalidate every handle to it
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(usize::from(handle.index))?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(value)
    }

    /// Handle of the current occupant of slot `index`
    pub fn handle_at(&self, index: u16) -> Option<Handle> {
        let slot = self.slots.get(usize::from(index))?;
        slot.value.as_ref().map(|_| Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Handle {
                        index: i as u16,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.value.as_mut().map(|v| {
                (
                    Handle {
                        index: i as u16,
                        generation,
                    },
                    v,
                )
            })
        })
    }

    /// First occupied slot matching `pred`
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Handle> {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }
}

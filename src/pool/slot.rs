//! Indexed slot arena
//!
//! Slots are addressed by index with a generation counter, so a handle
//! outliving its slot's reuse is detected instead of aliasing the new owner.

use std::fmt;

/// Ownership state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the pool, available for the next submission
    Free,
    /// Handed to the device carrying input data
    QueuedInput,
    /// Handed to the device waiting to be filled
    QueuedOutput,
    /// Filled output held by a consumer until released
    ReadyForDelivery,
}

impl SlotState {
    /// Whether the device currently owns the slot
    pub fn is_queued(&self) -> bool {
        matches!(self, SlotState::QueuedInput | SlotState::QueuedOutput)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Free => write!(f, "free"),
            SlotState::QueuedInput => write!(f, "queued-input"),
            SlotState::QueuedOutput => write!(f, "queued-output"),
            SlotState::ReadyForDelivery => write!(f, "ready"),
        }
    }
}

/// Handle to one use of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub index: usize,
    pub generation: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    state: SlotState,
    generation: u64,
}

/// Fixed array of slots of one queue
#[derive(Debug, Clone)]
pub struct SlotArena {
    slots: Vec<Slot>,
    capacity: usize,
    /// Next index to try when looking for a free slot
    cursor: usize,
}

impl SlotArena {
    pub fn new(count: usize, capacity: usize) -> Self {
        Self {
            slots: vec![
                Slot {
                    state: SlotState::Free,
                    generation: 0,
                };
                count
            ],
            capacity,
            cursor: 0,
        }
    }

    /// Start every slot's generation at `base`, so handles from an earlier
    /// arena never match this one
    pub fn with_base_generation(mut self, base: u64) -> Self {
        for slot in &mut self.slots {
            slot.generation = base;
        }
        self
    }

    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes each slot holds
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|s| s.state)
    }

    pub fn id(&self, index: usize) -> Option<SlotId> {
        self.slots.get(index).map(|s| SlotId {
            index,
            generation: s.generation,
        })
    }

    /// Next free slot, scanning round-robin from the last one handed out
    pub fn find_free(&self) -> Option<usize> {
        let n = self.slots.len();
        (0..n)
            .map(|i| (self.cursor + i) % n)
            .find(|&i| self.slots[i].state == SlotState::Free)
    }

    /// Move a slot from `from` to `to`; returns false if it was not in `from`
    pub fn transition(&mut self, index: usize, from: SlotState, to: SlotState) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.state == from => {
                slot.state = to;
                if from == SlotState::Free {
                    self.cursor = (index + 1) % self.slots.len();
                }
                true
            }
            _ => false,
        }
    }

    /// End the current use of a slot: later handles to it become stale
    pub fn retire(&mut self, id: SlotId, to: SlotState) -> bool {
        match self.slots.get_mut(id.index) {
            Some(slot)
                if slot.generation == id.generation
                    && slot.state == SlotState::ReadyForDelivery =>
            {
                slot.generation += 1;
                slot.state = to;
                true
            }
            _ => false,
        }
    }

    /// Return every device-owned slot to Free
    pub fn reclaim_queued(&mut self) -> usize {
        let mut count = 0;
        for slot in &mut self.slots {
            if slot.state.is_queued() {
                slot.state = SlotState::Free;
                count += 1;
            }
        }
        count
    }

    /// Return every slot to Free, invalidating outstanding handles
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            if slot.state == SlotState::ReadyForDelivery {
                slot.generation += 1;
            }
            slot.state = SlotState::Free;
        }
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    pub fn indices(&self, state: SlotState) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == state)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_round_robin() {
        let mut arena = SlotArena::new(3, 16);
        assert_eq!(arena.find_free(), Some(0));
        assert!(arena.transition(0, SlotState::Free, SlotState::QueuedInput));
        assert_eq!(arena.find_free(), Some(1));
        assert!(arena.transition(0, SlotState::QueuedInput, SlotState::Free));
        assert_eq!(arena.find_free(), Some(1));
        assert!(arena.transition(1, SlotState::Free, SlotState::QueuedInput));
        assert!(arena.transition(2, SlotState::Free, SlotState::QueuedInput));
        assert_eq!(arena.find_free(), Some(0));
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let mut arena = SlotArena::new(2, 16);
        assert!(!arena.transition(0, SlotState::QueuedOutput, SlotState::Free));
        assert!(!arena.transition(5, SlotState::Free, SlotState::QueuedOutput));
        assert_eq!(arena.state(0), Some(SlotState::Free));
    }

    #[test]
    fn test_retire_rejects_stale_handle() {
        let mut arena = SlotArena::new(1, 16);
        arena.transition(0, SlotState::Free, SlotState::QueuedOutput);
        arena.transition(0, SlotState::QueuedOutput, SlotState::ReadyForDelivery);
        let id = arena.id(0).unwrap();

        assert!(arena.retire(id, SlotState::QueuedOutput));
        assert!(!arena.retire(id, SlotState::QueuedOutput));

        // Slot reused: the old handle must still be refused
        arena.transition(0, SlotState::QueuedOutput, SlotState::ReadyForDelivery);
        assert!(!arena.retire(id, SlotState::Free));
        assert_eq!(arena.state(0), Some(SlotState::ReadyForDelivery));
    }

    #[test]
    fn test_reset_and_reclaim() {
        let mut arena = SlotArena::new(3, 16);
        arena.transition(0, SlotState::Free, SlotState::QueuedOutput);
        arena.transition(1, SlotState::Free, SlotState::QueuedOutput);
        arena.transition(1, SlotState::QueuedOutput, SlotState::ReadyForDelivery);
        let held = arena.id(1).unwrap();

        assert_eq!(arena.reclaim_queued(), 1);
        assert_eq!(arena.count(SlotState::ReadyForDelivery), 1);

        arena.reset();
        assert_eq!(arena.count(SlotState::Free), 3);
        assert!(!arena.retire(held, SlotState::Free));
    }

    #[test]
    fn test_base_generation() {
        let old = SlotArena::new(1, 16);
        let stale = old.id(0).unwrap();

        let mut arena = SlotArena::new(1, 16).with_base_generation(1 << 32);
        arena.transition(0, SlotState::Free, SlotState::QueuedOutput);
        arena.transition(0, SlotState::QueuedOutput, SlotState::ReadyForDelivery);
        assert!(!arena.retire(stale, SlotState::Free));
        assert!(arena.retire(arena.id(0).unwrap(), SlotState::Free));
    }
}

//! Job index allocator: bounded integer handles shared by every job role.

use std::collections::BTreeSet;

/// Default number of jobs (pending negotiations plus active transfers) alive at once.
pub const DEFAULT_MAX_JOBS: usize = 8;

type CountObserver = Box<dyn Fn(usize) + Send + Sync>;

/// Hands out the smallest free slot while fewer than `max` are held.
pub struct SlotAllocator {
    max: usize,
    held: BTreeSet<usize>,
    on_change: Option<CountObserver>,
}

impl SlotAllocator {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            held: BTreeSet::new(),
            on_change: None,
        }
    }

    /// Call `observer(held_count)` after every successful acquire or release.
    pub fn with_observer(max: usize, observer: impl Fn(usize) + Send + Sync + 'static) -> Self {
        Self {
            max,
            held: BTreeSet::new(),
            on_change: Some(Box::new(observer)),
        }
    }

    pub fn acquire(&mut self) -> Result<usize, SlotError> {
        if self.held.len() >= self.max {
            return Err(SlotError::Exhausted(self.max));
        }
        let slot = (0..self.max)
            .find(|s| !self.held.contains(s))
            .ok_or(SlotError::Exhausted(self.max))?;
        self.held.insert(slot);
        self.notify();
        Ok(slot)
    }

    pub fn release(&mut self, slot: usize) -> Result<(), SlotError> {
        if !self.held.remove(&slot) {
            return Err(SlotError::NotHeld(slot));
        }
        self.notify();
        Ok(())
    }

    pub fn is_held(&self, slot: usize) -> bool {
        self.held.contains(&slot)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    fn notify(&self) {
        if let Some(f) = &self.on_change {
            f(self.held.len());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("all {0} job slots are in use")]
    Exhausted(usize),
    #[error("slot {0} is not held")]
    NotHeld(usize),
}

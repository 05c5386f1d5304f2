use crate::{descriptor::DescriptorBinder, Tracable};

/// Objects owned by one frame in flight.
pub struct FrameAssets {
    pub(crate) tracable: Option<Tracable>,
    pub(crate) binder: DescriptorBinder,
}

impl FrameAssets {
    pub(crate) fn new(binder: DescriptorBinder) -> Self {
        Self {
            tracable: None,
            binder,
        }
    }

    pub fn tracable(&self) -> Option<&Tracable> {
        self.tracable.as_ref()
    }

    pub fn binder(&self) -> &DescriptorBinder {
        &self.binder
    }
}

/// A fixed set of slots used round robin, one per frame in flight.
pub struct FrameRing<T> {
    slots: Vec<T>,
    index: usize,
}

impl<T> FrameRing<T> {
    /// `slots` must not be empty.
    pub fn new(slots: Vec<T>) -> Self {
        debug_assert!(!slots.is_empty());
        Self { slots, index: 0 }
    }

    pub fn current(&self) -> &T {
        &self.slots[self.index]
    }

    pub fn current_mut(&mut self) -> &mut T {
        &mut self.slots[self.index]
    }

    /// The slot used by the call before the current one.
    pub fn previous(&self) -> &T {
        &self.slots[(self.index + self.slots.len() - 1) % self.slots.len()]
    }

    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.slots.len();
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

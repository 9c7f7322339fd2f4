/// Index-addressable, slot-reusing storage for clients and ledgers. A slot is either
/// occupied or free; freed slots are pushed onto a free list and handed back out before
/// the backing vector grows, so indices stay stable for the lifetime of the occupant and
/// are what the reactor embeds directly into its event tags.
pub struct Slab<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Slab<T> {
    pub fn new() -> Slab<T> {
        Slab { slots: Vec::new(), free: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Slab<T> {
        Slab { slots: Vec::with_capacity(capacity), free: Vec::new() }
    }

    /// Inserts `value`, reusing a freed slot if one is available, and returns its index.
    pub fn insert(&mut self, value: T) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(value);
            idx
        } else {
            self.slots.push(Some(value));
            self.slots.len() - 1
        }
    }

    /// Removes and returns the value at `idx`, freeing the slot for reuse. Returns
    /// `None` if the slot was already empty.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let value = self.slots.get_mut(idx)?.take();
        if value.is_some() {
            self.free.push(idx);
        }
        value
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx)?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx)?.as_mut()
    }

    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        matches!(self.slots.get(idx), Some(Some(_)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (i, v)))
    }

    /// Linear scan for the first occupied slot matching `pred`. Used for the ledger
    /// slab's UUID lookup, which has no secondary index.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        self.iter().find(|(_, v)| pred(v)).map(|(i, _)| i)
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Slab<T> {
        Slab::new()
    }
}

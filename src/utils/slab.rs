use std::mem::MaybeUninit;

/// A slab arena with reusable slots.
///
/// Values are stored in a contiguous array and addressed by the `usize`
/// slot returned from [`insert`](Self::insert). Removing a value frees its
/// slot for reuse by a later insertion, so slots are small, dense and
/// stable for the lifetime of the value they hold.
///
/// The timer queue uses this as the owning store for scheduled timers; the
/// ordered indices hold slots instead of pointers.
///
/// # Safety
///
/// Slot occupancy is tracked explicitly, and all accessors assert it, so
/// the `MaybeUninit` storage never leaks uninitialized reads through the
/// safe API.
pub(crate) struct Slab<T> {
    /// Storage for items; a slot is initialized iff its `used` flag is set.
    items: Vec<MaybeUninit<T>>,
    /// Stack of free slots available for reuse.
    free: Vec<usize>,
    /// Occupancy flags, parallel to `items`.
    used: Vec<bool>,
    /// Number of occupied slots.
    len: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with `size` pre-allocated free slots.
    pub(crate) fn with_capacity(size: usize) -> Self {
        let items = (0..size).map(|_| MaybeUninit::<T>::uninit()).collect();
        let free = (0..size).rev().collect();
        let used = vec![false; size];

        Self {
            items,
            free,
            used,
            len: 0,
        }
    }

    /// Inserts a value and returns the slot it now occupies.
    ///
    /// Reuses a free slot when one exists, otherwise doubles the storage.
    pub(crate) fn insert(&mut self, item: T) -> usize {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let old_len = self.items.len();
                let new_len = if old_len == 0 { 1 } else { 2 * old_len };

                self.items
                    .extend((old_len..new_len).map(|_| MaybeUninit::<T>::uninit()));
                self.used.extend((old_len..new_len).map(|_| false));
                self.free.extend(((old_len + 1)..new_len).rev());

                old_len
            }
        };

        self.items[slot] = MaybeUninit::new(item);
        self.used[slot] = true;
        self.len += 1;

        slot
    }

    /// Removes and returns the value stored in `slot`, freeing the slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is out of range or not occupied.
    pub(crate) fn remove(&mut self, slot: usize) -> T {
        assert!(slot < self.items.len(), "slot {slot} out of range");
        assert!(self.used[slot], "slot {slot} is not occupied");

        self.used[slot] = false;
        self.free.push(slot);
        self.len -= 1;

        let item = unsafe { self.items[slot].assume_init_read() };
        self.items[slot] = MaybeUninit::uninit();

        item
    }

    /// Returns the number of occupied slots.
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl<T> Drop for Slab<T> {
    fn drop(&mut self) {
        for (item, &used) in self.items.iter_mut().zip(self.used.iter()) {
            if used {
                unsafe { item.assume_init_drop() };
            }
        }
    }
}

//! # Slot Pool
//!
//! A fixed-capacity pool that maps small integer ids to slots of a value
//! type. Values and occupancy are kept in separate arrays; a slot's value
//! stays in place when it is freed and is overwritten by whoever allocates
//! it next, so large records (task stacks) are never moved.
//!
//! Allocation is first-fit: the lowest free index is always handed out,
//! which keeps ids deterministic and reusable only after an explicit free.

/// Types that have a placeholder value for unoccupied slots.
///
/// Needed so a pool can be built in a `const` context (for a `static`)
/// without constructing values on the stack.
pub trait Vacant {
    /// Value an unoccupied slot holds before it is first allocated.
    const VACANT: Self;
}

/// Every slot of the pool is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolFull;

/// A fixed-capacity pool of `N` slots holding `T`.
pub struct SlotPool<T, const N: usize> {
    values: [T; N],
    occupied: [bool; N],
}

impl<T: Vacant, const N: usize> SlotPool<T, N> {
    /// Create a pool with every slot free.
    pub const fn new() -> Self {
        Self {
            values: [const { T::VACANT }; N],
            occupied: [false; N],
        }
    }
}

impl<T, const N: usize> SlotPool<T, N> {
    /// Number of slots.
    pub const CAPACITY: usize = N;

    /// Claim the lowest free slot and return its id.
    ///
    /// The slot still holds whatever value it held before; the caller is
    /// expected to populate it through [`SlotPool::at_mut`].
    pub fn allocate(&mut self) -> Result<usize, PoolFull> {
        let id = self
            .occupied
            .iter()
            .position(|&occupied| !occupied)
            .ok_or(PoolFull)?;
        self.occupied[id] = true;
        Ok(id)
    }

    /// Release a slot. Freeing an id that is out of range or not occupied
    /// does nothing.
    pub fn free(&mut self, id: usize) {
        if let Some(occupied) = self.occupied.get_mut(id) {
            *occupied = false;
        }
    }

    /// Release every slot.
    pub fn free_all(&mut self) {
        self.occupied = [false; N];
    }

    /// Is `id` an occupied slot?
    pub fn is_allocated(&self, id: usize) -> bool {
        self.occupied.get(id).copied().unwrap_or(false)
    }

    /// Borrow the value in an occupied slot.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not occupied. Ids are only ever issued by the
    /// kernel, so this is a contract violation rather than a runtime error.
    #[track_caller]
    pub fn at(&self, id: usize) -> &T {
        self.check(id);
        &self.values[id]
    }

    /// Mutably borrow the value in an occupied slot.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not occupied.
    #[track_caller]
    pub fn at_mut(&mut self, id: usize) -> &mut T {
        self.check(id);
        &mut self.values[id]
    }

    /// Borrow the value in `id`, if occupied.
    pub fn get(&self, id: usize) -> Option<&T> {
        self.is_allocated(id).then(|| &self.values[id])
    }

    /// Ids of all occupied slots, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.occupied
            .iter()
            .enumerate()
            .filter_map(|(id, &occupied)| occupied.then_some(id))
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.occupied.iter().filter(|&&occupied| occupied).count()
    }

    /// Are all slots free?
    pub fn is_empty(&self) -> bool {
        !self.occupied.contains(&true)
    }

    #[track_caller]
    fn check(&self, id: usize) {
        if !self.is_allocated(id) {
            panic!("slot {} is not allocated", id);
        }
    }
}

impl<T: Vacant, const N: usize> Default for SlotPool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Value(u32);

    impl Vacant for Value {
        const VACANT: Self = Value(0);
    }

    #[test]
    fn test_allocate_until_full() {
        let mut pool: SlotPool<Value, 4> = SlotPool::new();
        for expected in 0..4 {
            assert_eq!(pool.allocate(), Ok(expected));
        }
        assert_eq!(pool.allocate(), Err(PoolFull));
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_free_then_reuse_lowest() {
        let mut pool: SlotPool<Value, 4> = SlotPool::new();
        for _ in 0..4 {
            pool.allocate().unwrap();
        }
        pool.free(2);
        pool.free(1);
        assert!(!pool.is_allocated(1));
        assert_eq!(pool.allocate(), Ok(1));
        assert_eq!(pool.allocate(), Ok(2));
        assert_eq!(pool.allocate(), Err(PoolFull));
    }

    #[test]
    fn test_free_unoccupied_is_noop() {
        let mut pool: SlotPool<Value, 4> = SlotPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        *pool.at_mut(a) = Value(11);
        *pool.at_mut(b) = Value(22);

        pool.free(3);
        pool.free(99);
        assert_eq!(pool.at(a), &Value(11));
        assert_eq!(pool.at(b), &Value(22));
        let ids: Vec<usize> = pool.ids().collect();
        assert_eq!(ids, [a, b]);
    }

    #[test]
    fn test_free_all() {
        let mut pool: SlotPool<Value, 3> = SlotPool::new();
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        pool.free_all();
        assert!(pool.is_empty());
        assert_eq!(pool.allocate(), Ok(0));
    }

    #[test]
    fn test_value_survives_until_overwritten() {
        let mut pool: SlotPool<Value, 2> = SlotPool::new();
        let id = pool.allocate().unwrap();
        *pool.at_mut(id) = Value(7);
        pool.free(id);
        assert_eq!(pool.get(id), None);
        assert_eq!(pool.allocate(), Ok(id));
        assert_eq!(pool.at(id), &Value(7));
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_at_unallocated_panics() {
        let pool: SlotPool<Value, 2> = SlotPool::new();
        let _ = pool.at(1);
    }

    #[test]
    fn test_allocation_tracks_live_set() {
        // Scripted allocate/free sequence checked against a plain model
        let mut pool: SlotPool<Value, 5> = SlotPool::new();
        let mut live = [false; 5];
        let script: [(bool, usize); 12] = [
            (true, 0),
            (true, 0),
            (true, 0),
            (false, 1),
            (true, 0),
            (false, 0),
            (false, 0),
            (true, 0),
            (true, 0),
            (true, 0),
            (false, 4),
            (true, 0),
        ];
        for (alloc, id) in script {
            if alloc {
                let got = pool.allocate().unwrap();
                let expected = live.iter().position(|&l| !l).unwrap();
                assert_eq!(got, expected);
                live[got] = true;
            } else {
                pool.free(id);
                live[id] = false;
            }
            for (id, &l) in live.iter().enumerate() {
                assert_eq!(pool.is_allocated(id), l);
            }
        }
    }
}

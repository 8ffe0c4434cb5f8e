//! Arena-backed recency list.
//!
//! Entries live in a slot vector and are linked by [`SlotId`], giving stable
//! handles and O(1) promote/remove without raw pointers.
//!
//! ## Architecture
//!
//! ```text
//!   slots: Vec<Option<Link<T>>>          free: [3]
//!   ┌────┬──────────────────────────────────────────────┐
//!   │ 0  │ Link { value: A, prev: None,    next: Some(2) } │
//!   │ 1  │ Link { value: C, prev: Some(2), next: None    } │
//!   │ 2  │ Link { value: B, prev: Some(0), next: Some(1) } │
//!   │ 3  │ None (free)                                  │
//!   └────┴──────────────────────────────────────────────┘
//!
//!   head (MRU) ─► [0:A] ◄──► [2:B] ◄──► [1:C] ◄── tail (LRU)
//! ```
//!
//! ## Operations
//! - `push_front`: O(1), reuses a free slot when one exists
//! - `move_to_front`: O(1)
//! - `remove` / `pop_back`: O(1)
//! - `iter`: O(n), MRU to LRU

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Link<T> {
    value: T,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

/// Doubly linked list ordered from most to least recently used.
#[derive(Debug)]
pub struct RecencyList<T> {
    slots: Vec<Option<Link<T>>>,
    free: Vec<usize>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

impl<T> RecencyList<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.link(id).map(|link| &link.value)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.link_mut(id).map(|link| &mut link.value)
    }

    /// Least recently used slot.
    pub fn back_id(&self) -> Option<SlotId> {
        self.tail
    }

    /// Most recently used slot.
    pub fn front_id(&self) -> Option<SlotId> {
        self.head
    }

    /// Inserts `value` as most recently used.
    pub fn push_front(&mut self, value: T) -> SlotId {
        let link = Link {
            value,
            prev: None,
            next: self.head,
        };
        let id = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(link);
                SlotId(idx)
            },
            None => {
                self.slots.push(Some(link));
                SlotId(self.slots.len() - 1)
            },
        };
        match self.head {
            Some(old_head) => {
                if let Some(old) = self.link_mut(old_head) {
                    old.prev = Some(id);
                }
            },
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
        id
    }

    /// Promotes `id` to most recently used. Returns `false` for a stale id.
    pub fn move_to_front(&mut self, id: SlotId) -> bool {
        if self.link(id).is_none() {
            return false;
        }
        if self.head == Some(id) {
            return true;
        }
        self.unlink(id);
        let old_head = self.head;
        if let Some(link) = self.link_mut(id) {
            link.prev = None;
            link.next = old_head;
        }
        if let Some(old_head) = old_head {
            if let Some(old) = self.link_mut(old_head) {
                old.prev = Some(id);
            }
        } else {
            self.tail = Some(id);
        }
        self.head = Some(id);
        true
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        self.link(id)?;
        self.unlink(id);
        let link = self.slots[id.0].take()?;
        self.free.push(id.0);
        self.len -= 1;
        Some(link.value)
    }

    pub fn pop_back(&mut self) -> Option<T> {
        let id = self.tail?;
        self.remove(id)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Iterates from most to least recently used.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            current: self.head,
        }
    }

    fn link(&self, id: SlotId) -> Option<&Link<T>> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn link_mut(&mut self, id: SlotId) -> Option<&mut Link<T>> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    fn unlink(&mut self, id: SlotId) {
        let (prev, next) = match self.link(id) {
            Some(link) => (link.prev, link.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(link) = self.link_mut(p) {
                    link.next = next;
                }
            },
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(link) = self.link_mut(n) {
                    link.prev = prev;
                }
            },
            None => self.tail = prev,
        }
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        let mut count = 0usize;
        let mut prev = None;
        let mut current = self.head;
        while let Some(id) = current {
            let link = self.link(id).expect("linked slot is vacant");
            assert_eq!(link.prev, prev, "broken back link at {id:?}");
            prev = Some(id);
            current = link.next;
            count += 1;
            assert!(count <= self.len, "cycle in recency list");
        }
        assert_eq!(self.tail, prev);
        assert_eq!(count, self.len);
        assert_eq!(self.slots.len() - self.free.len(), self.len);
    }
}

impl<T> Default for RecencyList<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, T> {
    list: &'a RecencyList<T>,
    current: Option<SlotId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (SlotId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let link = self.list.link(id)?;
        self.current = link.next;
        Some((id, &link.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order<T: Copy>(list: &RecencyList<T>) -> Vec<T> {
        list.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn push_front_orders_mru_first() {
        let mut list = RecencyList::new();
        list.push_front(1);
        list.push_front(2);
        list.push_front(3);
        assert_eq!(order(&list), vec![3, 2, 1]);
        assert_eq!(list.len(), 3);
        list.debug_validate_invariants();
    }

    #[test]
    fn move_to_front_promotes() {
        let mut list = RecencyList::new();
        let a = list.push_front("a");
        list.push_front("b");
        let c = list.push_front("c");

        assert!(list.move_to_front(a));
        assert_eq!(order(&list), vec!["a", "c", "b"]);
        assert!(list.move_to_front(a));
        assert_eq!(list.front_id(), Some(a));
        list.debug_validate_invariants();

        assert_eq!(list.remove(c), Some("c"));
        assert!(!list.move_to_front(c));
        list.debug_validate_invariants();
    }

    #[test]
    fn pop_back_returns_lru() {
        let mut list = RecencyList::new();
        list.push_front(1);
        list.push_front(2);
        assert_eq!(list.pop_back(), Some(1));
        assert_eq!(list.pop_back(), Some(2));
        assert_eq!(list.pop_back(), None);
        assert!(list.is_empty());
        list.debug_validate_invariants();
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut list = RecencyList::new();
        let a = list.push_front(1);
        list.push_front(2);
        list.remove(a);
        let c = list.push_front(3);
        assert_eq!(a.index(), c.index());
        assert_eq!(list.get(c), Some(&3));
        list.debug_validate_invariants();
    }

    #[test]
    fn clear_resets_everything() {
        let mut list = RecencyList::new();
        for i in 0..10 {
            list.push_front(i);
        }
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.back_id(), None);
        list.debug_validate_invariants();
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_invariants_hold_under_random_ops(ops in proptest::collection::vec(0u8..4, 0..200)) {
                let mut list = RecencyList::new();
                let mut ids = Vec::new();
                for (step, op) in ops.into_iter().enumerate() {
                    match op {
                        0 => ids.push(list.push_front(step)),
                        1 => {
                            if let Some(id) = ids.get(step % ids.len().max(1)) {
                                list.move_to_front(*id);
                            }
                        },
                        2 => {
                            if !ids.is_empty() {
                                let id = ids.swap_remove(step % ids.len());
                                list.remove(id);
                            }
                        },
                        _ => {
                            if let Some(back) = list.back_id() {
                                ids.retain(|id| *id != back);
                                list.pop_back();
                            }
                        },
                    }
                    list.debug_validate_invariants();
                    prop_assert_eq!(list.len(), ids.len());
                }
            }
        }
    }
}

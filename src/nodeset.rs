/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Dense set of move nodes, used for visited marks in graph walks.

use crate::MoveId;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

type Frame = u64;
const BITS_PER_FRAME: usize = core::mem::size_of::<Frame>() * 8;

#[derive(Clone, PartialEq, Eq)]
pub struct NodeSet {
    bits: Vec<Frame>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self { bits: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            bits: vec![0; n / BITS_PER_FRAME + 1],
        }
    }

    #[inline(always)]
    fn compute_index(el: MoveId) -> (usize, usize) {
        (el.index() / BITS_PER_FRAME, el.index() % BITS_PER_FRAME)
    }

    /// Returns `true` if the node was not yet in the set.
    pub fn insert(&mut self, el: MoveId) -> bool {
        let (frame_no, idx) = Self::compute_index(el);
        if frame_no >= self.bits.len() {
            self.bits.resize(frame_no + 1, 0);
        }
        let was_set = self.bits[frame_no] & (1 << idx) != 0;
        self.bits[frame_no] |= 1 << idx;
        !was_set
    }

    pub fn remove(&mut self, el: MoveId) {
        let (frame_no, idx) = Self::compute_index(el);
        if let Some(frame) = self.bits.get_mut(frame_no) {
            *frame &= !(1 << idx);
        }
    }

    pub fn contains(&self, el: MoveId) -> bool {
        let (frame_no, idx) = Self::compute_index(el);
        self.bits
            .get(frame_no)
            .map_or(false, |frame| frame & (1 << idx) != 0)
    }

    pub fn clear(&mut self) {
        for frame in self.bits.iter_mut() {
            *frame = 0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|frame| *frame == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|f| f.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> NodeSetIter<'_> {
        NodeSetIter {
            next_frame_idx: 0,
            curr_frame: 0,
            bits: &self.bits,
        }
    }
}

pub struct NodeSetIter<'a> {
    next_frame_idx: usize,
    curr_frame: Frame,
    bits: &'a [Frame],
}

impl<'a> Iterator for NodeSetIter<'a> {
    type Item = MoveId;

    fn next(&mut self) -> Option<MoveId> {
        while self.curr_frame == 0 {
            if self.next_frame_idx >= self.bits.len() {
                return None;
            }
            self.curr_frame = self.bits[self.next_frame_idx];
            self.next_frame_idx += 1;
        }
        let skip = self.curr_frame.trailing_zeros();
        self.curr_frame &= !(1 << skip);
        Some(MoveId::new(
            (self.next_frame_idx - 1) * BITS_PER_FRAME + skip as usize,
        ))
    }
}

impl FromIterator<MoveId> for NodeSet {
    fn from_iter<I: IntoIterator<Item = MoveId>>(iter: I) -> Self {
        let mut set = NodeSet::with_capacity(0);
        for n in iter {
            set.insert(n);
        }
        set
    }
}

impl fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for el in self.iter() {
            write!(f, "{el} ")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(i: usize) -> MoveId {
        MoveId::new(i)
    }

    #[test]
    fn operations() {
        let mut set = NodeSet::with_capacity(200);
        for i in [10, 11, 199, 23, 45] {
            assert!(set.insert(m(i)));
        }
        assert!(!set.insert(m(23)));
        assert_eq!(set.iter().collect::<Vec<_>>(), [m(10), m(11), m(23), m(45), m(199)]);
        assert!(set.contains(m(10)));
        assert!(!set.contains(m(12)));
        set.remove(m(23));
        assert!(!set.contains(m(23)));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn grows_on_demand() {
        let mut set = NodeSet::with_capacity(0);
        assert!(set.is_empty());
        assert!(!set.contains(m(1000)));
        set.insert(m(1000));
        assert!(set.contains(m(1000)));
        set.remove(m(1000));
        assert!(set.is_empty());
    }
}

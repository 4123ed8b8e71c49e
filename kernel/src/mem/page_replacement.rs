use super::frame_table::FrameId;
use alloc::vec::Vec;

/// Chooses which resident frame to give up when physical memory runs out.
///
/// The policy holds exactly the frames that are currently evictable.
pub trait PageReplacementPolicy: Send {
    fn insert(&mut self, frame: FrameId);

    /// Returns false if `frame` was not held.
    fn remove(&mut self, frame: FrameId) -> bool;

    /// Pick a victim and stop tracking it. `referenced` reports whether the
    /// frame was used since it was last asked, and clears that state.
    fn select_victim(&mut self, referenced: &mut dyn FnMut(FrameId) -> bool) -> Option<FrameId>;

    fn contains(&self, frame: FrameId) -> bool;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Second-chance clock.
///
/// New frames go in just behind the hand, so they are inspected last.
#[derive(Debug, Default)]
pub struct Clock {
    ring: Vec<FrameId>,
    /// Next position to inspect, modulo `ring.len()`.
    hand: usize,
}

impl Clock {
    fn position(&self, frame: FrameId) -> Option<usize> {
        self.ring.iter().position(|&f| f == frame)
    }

    fn take(&mut self, index: usize) -> FrameId {
        let frame = self.ring.remove(index);
        if index < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.ring.len() {
            self.hand = 0;
        }
        frame
    }
}

impl PageReplacementPolicy for Clock {
    fn insert(&mut self, frame: FrameId) {
        debug_assert!(!self.contains(frame));
        let at = self.hand.min(self.ring.len());
        self.ring.insert(at, frame);
        self.hand = at + 1;
    }

    fn remove(&mut self, frame: FrameId) -> bool {
        match self.position(frame) {
            Some(index) => {
                self.take(index);
                true
            }
            None => false,
        }
    }

    fn select_victim(&mut self, referenced: &mut dyn FnMut(FrameId) -> bool) -> Option<FrameId> {
        if self.ring.is_empty() {
            return None;
        }

        // Two sweeps clear every reference bit, unless pages keep getting
        // touched behind the hand; then the frame under the hand goes anyway.
        for _ in 0..2 * self.ring.len() {
            let index = self.hand % self.ring.len();
            self.hand = index + 1;
            if !referenced(self.ring[index]) {
                return Some(self.take(index));
            }
        }

        let index = self.hand % self.ring.len();
        Some(self.take(index))
    }

    fn contains(&self, frame: FrameId) -> bool {
        self.position(frame).is_some()
    }

    fn len(&self) -> usize {
        self.ring.len()
    }
}

//! Round-robin position over a list that may shrink and grow.
//!
//! The hand only knows positions, not what is stored at them, so the frame
//! table can keep frames in whatever order it likes and tell the hand when a
//! position disappears.

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClockHand {
    /// Position examined last, if any.
    last: Option<usize>,
}

impl ClockHand {
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Advance to the next position in a list of `len` elements, wrapping to
    /// the head after the tail.
    pub fn advance(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            self.last = None;
            return None;
        }
        let next = match self.last {
            Some(i) if i + 1 < len => i + 1,
            _ => 0,
        };
        self.last = Some(next);
        Some(next)
    }

    /// The element at `index` was removed. The element that followed it is
    /// the next one the hand visits.
    pub fn removed(&mut self, index: usize) {
        self.last = match self.last {
            Some(i) if index < i => Some(i - 1),
            Some(i) if index == i => i.checked_sub(1),
            last => last,
        };
    }
}

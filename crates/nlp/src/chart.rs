//! # Chart Arena
//!
//! Charts hold one entry per `(span, mark, sentence, state, position)`, where
//! `position` is the location of the span's head word. Spans are
//! `0 ≤ start < end ≤ n`, so there are `n(n+1)/2` of them; they are laid out
//! in a flat triangular arena:
//!
//! ```text
//!   span_index(start, end) = start·n − start(start−1)/2 + (end − start − 1)
//!   offset = ((span_index · 3 + mark) · batch + b) · states · n + state · n + position
//! ```
//!
//! Charts are sized up front and never grow. Allocation is checked against a
//! byte budget and uses fallible reservation, so an oversized batch surfaces
//! as [`NlpError::ResourceExhausted`] instead of aborting the process.

use std::mem;

use crate::NlpError;

/// How much of a head's valence has been resolved inside a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mark {
    /// The head may still take dependents on both sides
    NonStop,
    /// The head has stopped taking right dependents
    RightStopped,
    /// The head has stopped on both sides; the span is complete
    BothStopped,
}

impl Mark {
    /// All marks, in index order.
    pub const ALL: [Mark; 3] = [Mark::NonStop, Mark::RightStopped, Mark::BothStopped];

    /// Dense index of the mark.
    pub fn index(self) -> usize {
        match self {
            Mark::NonStop => 0,
            Mark::RightStopped => 1,
            Mark::BothStopped => 2,
        }
    }
}

/// Dimensions of a chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChartLayout {
    /// Longest sentence the chart can hold
    pub max_len: usize,
    /// Sentences per batch
    pub batch: usize,
    /// Latent states
    pub num_state: usize,
}

impl ChartLayout {
    /// Layout for `batch` sentences of at most `max_len` tokens.
    pub fn new(max_len: usize, batch: usize, num_state: usize) -> Self {
        Self {
            max_len,
            batch,
            num_state,
        }
    }

    /// Number of spans `(start, end)`.
    pub fn num_spans(&self) -> usize {
        self.max_len * (self.max_len + 1) / 2
    }

    /// Triangular index of a span.
    #[inline]
    pub fn span_index(&self, start: usize, end: usize) -> usize {
        debug_assert!(start < end && end <= self.max_len, "bad span ({start}, {end})");
        let n = self.max_len;
        start * n - start * start.saturating_sub(1) / 2 + (end - start - 1)
    }

    /// Entries stored per `(span, mark)` cell.
    pub fn cell_len(&self) -> usize {
        self.batch * self.num_state * self.max_len
    }

    /// Total entries, or `None` on overflow.
    pub fn num_entries(&self) -> Option<usize> {
        let spans = self.max_len.checked_mul(self.max_len.checked_add(1)?)? / 2;
        spans
            .checked_mul(Mark::ALL.len())?
            .checked_mul(self.batch)?
            .checked_mul(self.num_state)?
            .checked_mul(self.max_len)
    }

    /// Bytes needed for entries of type `T`, or `None` on overflow.
    pub fn bytes_for<T>(&self) -> Option<usize> {
        self.num_entries()?.checked_mul(mem::size_of::<T>())
    }

    /// Offset of the first position of `(start, end, mark, b, state)`.
    #[inline]
    pub fn slot(&self, start: usize, end: usize, mark: Mark, b: usize, state: usize) -> usize {
        let cell = self.span_index(start, end) * Mark::ALL.len() + mark.index();
        ((cell * self.batch + b) * self.num_state + state) * self.max_len
    }
}

/// A dense chart over a [`ChartLayout`].
#[derive(Debug, Clone)]
pub struct Chart<T> {
    layout: ChartLayout,
    data: Vec<T>,
}

impl<T: Clone> Chart<T> {
    /// Allocate a chart filled with `fill`.
    ///
    /// # Errors
    /// [`NlpError::ResourceExhausted`] when the chart would exceed
    /// `budget_bytes` or the allocator refuses the reservation.
    pub fn try_new(layout: ChartLayout, fill: T, budget_bytes: usize) -> Result<Self, NlpError> {
        let exhausted = |requested| NlpError::ResourceExhausted {
            requested,
            budget: budget_bytes,
        };
        let requested = layout
            .bytes_for::<T>()
            .ok_or_else(|| exhausted(usize::MAX))?;
        if requested > budget_bytes {
            return Err(exhausted(requested));
        }
        let entries = layout
            .num_entries()
            .ok_or_else(|| exhausted(usize::MAX))?;

        let mut data = Vec::new();
        data.try_reserve_exact(entries)
            .map_err(|_| exhausted(requested))?;
        data.resize(entries, fill);
        Ok(Self { layout, data })
    }
}

impl<T> Chart<T> {
    /// The chart's dimensions.
    pub fn layout(&self) -> &ChartLayout {
        &self.layout
    }

    /// Entries for every head position of `(start, end, mark, b, state)`.
    #[inline]
    pub fn positions(&self, start: usize, end: usize, mark: Mark, b: usize, state: usize) -> &[T] {
        let at = self.layout.slot(start, end, mark, b, state);
        &self.data[at..at + self.layout.max_len]
    }

    /// Mutable entries for every head position of `(start, end, mark, b, state)`.
    #[inline]
    pub fn positions_mut(
        &mut self,
        start: usize,
        end: usize,
        mark: Mark,
        b: usize,
        state: usize,
    ) -> &mut [T] {
        let at = self.layout.slot(start, end, mark, b, state);
        &mut self.data[at..at + self.layout.max_len]
    }

    /// Entry at one head position.
    #[inline]
    pub fn get(&self, start: usize, end: usize, mark: Mark, b: usize, state: usize, pos: usize) -> &T {
        &self.data[self.layout.slot(start, end, mark, b, state) + pos]
    }

    /// Mutable entry at one head position.
    #[inline]
    pub fn get_mut(
        &mut self,
        start: usize,
        end: usize,
        mark: Mark,
        b: usize,
        state: usize,
        pos: usize,
    ) -> &mut T {
        let at = self.layout.slot(start, end, mark, b, state) + pos;
        &mut self.data[at]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_span_index_is_a_bijection() {
        for n in 1..12 {
            let layout = ChartLayout::new(n, 1, 1);
            let mut seen = HashSet::new();
            for start in 0..n {
                for end in start + 1..=n {
                    let idx = layout.span_index(start, end);
                    assert!(idx < layout.num_spans());
                    assert!(seen.insert(idx), "duplicate index for ({start}, {end})");
                }
            }
            assert_eq!(seen.len(), layout.num_spans());
        }
    }

    #[test]
    fn test_slots_do_not_overlap() {
        let layout = ChartLayout::new(4, 2, 3);
        let mut chart = Chart::try_new(layout, 0u32, usize::MAX).unwrap();
        let mut counter = 0;
        for start in 0..4 {
            for end in start + 1..=4 {
                for mark in Mark::ALL {
                    for b in 0..2 {
                        for s in 0..3 {
                            for slot in chart.positions_mut(start, end, mark, b, s) {
                                assert_eq!(*slot, 0);
                                counter += 1;
                                *slot = counter;
                            }
                        }
                    }
                }
            }
        }
        assert_eq!(counter as usize, layout.num_entries().unwrap());
        assert_eq!(*chart.get(3, 4, Mark::BothStopped, 1, 2, 3), counter);
    }

    #[test]
    fn test_budget_exceeded() {
        let layout = ChartLayout::new(10, 32, 40);
        let bytes = layout.bytes_for::<f64>().unwrap();
        let result = Chart::try_new(layout, 0.0f64, bytes - 1);
        match result {
            Err(NlpError::ResourceExhausted { requested, budget }) => {
                assert_eq!(requested, bytes);
                assert_eq!(budget, bytes - 1);
            }
            other => panic!("expected resource exhaustion, got {:?}", other.map(|_| ())),
        }
        assert!(Chart::try_new(layout, 0.0f64, bytes).is_ok());
    }

    #[test]
    fn test_overflowing_layout_is_exhaustion() {
        let layout = ChartLayout::new(usize::MAX / 4, 4, 4);
        let err = Chart::try_new(layout, 0u8, usize::MAX).unwrap_err();
        assert!(err.is_recoverable());
    }
}

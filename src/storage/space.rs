//! Sorted, coalesced lists of free byte ranges.

use crate::types::{ArborError, Result};

/// A byte range `[start, start + len)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Span {
    /// First byte.
    pub start: u64,
    /// Length in bytes.
    pub len: u64,
}

impl Span {
    /// Creates a span.
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Extends `self` by `other` when it starts right where `self` ends.
    pub fn coalesce_with(&mut self, other: &Span) -> bool {
        if self.end() == other.start {
            self.len += other.len;
            true
        } else {
            false
        }
    }

    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Free ranges kept sorted by start with neighbours always coalesced.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct SpaceList {
    spans: Vec<Span>,
}

impl SpaceList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a list from arbitrary, non-overlapping spans.
    pub fn from_spans(mut spans: Vec<Span>) -> Result<Self> {
        spans.retain(|s| s.len > 0);
        spans.sort();
        let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
        for span in spans {
            if let Some(last) = merged.last_mut() {
                if last.overlaps(&span) {
                    return Err(ArborError::Inconsistent(format!(
                        "free ranges overlap at {:#x}",
                        span.start
                    )));
                }
                if last.coalesce_with(&span) {
                    continue;
                }
            }
            merged.push(span);
        }
        Ok(Self { spans: merged })
    }

    /// The free ranges in address order.
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Total free bytes.
    pub fn total(&self) -> u64 {
        self.spans.iter().map(|s| s.len).sum()
    }

    /// Largest single free range.
    pub fn largest(&self) -> u64 {
        self.spans.iter().map(|s| s.len).max().unwrap_or(0)
    }

    /// True when no range is free.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Returns `[start, start + len)` to the list, merging with neighbours.
    pub fn add(&mut self, start: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let span = Span::new(start, len);
        let idx = self.spans.partition_point(|s| s.start < start);
        if idx > 0 && self.spans[idx - 1].overlaps(&span) {
            return Err(double_free(start));
        }
        if idx < self.spans.len() && self.spans[idx].overlaps(&span) {
            return Err(double_free(start));
        }
        self.spans.insert(idx, span);
        if idx + 1 < self.spans.len() {
            let next = self.spans[idx + 1];
            if self.spans[idx].coalesce_with(&next) {
                self.spans.remove(idx + 1);
            }
        }
        if idx > 0 {
            let cur = self.spans[idx];
            if self.spans[idx - 1].coalesce_with(&cur) {
                self.spans.remove(idx);
            }
        }
        Ok(())
    }

    /// Takes `[start, start + len)` out of the list; the range must be free.
    pub fn remove(&mut self, start: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = start + len;
        let idx = self.spans.partition_point(|s| s.end() <= start);
        let Some(span) = self.spans.get(idx).copied() else {
            return Err(not_free(start));
        };
        if span.start > start || span.end() < end {
            return Err(not_free(start));
        }
        let head = Span::new(span.start, start - span.start);
        let tail = Span::new(end, span.end() - end);
        self.spans.remove(idx);
        if tail.len > 0 {
            self.spans.insert(idx, tail);
        }
        if head.len > 0 {
            self.spans.insert(idx, head);
        }
        Ok(())
    }

    /// Lowest start of a free range of at least `len` bytes.
    pub fn find_fit(&self, len: u64) -> Option<u64> {
        self.spans.iter().find(|s| s.len >= len).map(|s| s.start)
    }

    /// True when the whole range is free.
    pub fn contains(&self, start: u64, len: u64) -> bool {
        let idx = self.spans.partition_point(|s| s.end() <= start);
        self.spans
            .get(idx)
            .is_some_and(|s| s.start <= start && s.end() >= start + len)
    }

    /// Moves every range of `other` into `self`, leaving `other` empty.
    pub fn absorb(&mut self, other: &mut SpaceList) -> Result<()> {
        for span in std::mem::take(&mut other.spans) {
            self.add(span.start, span.len)?;
        }
        Ok(())
    }

    /// Union of two lists without modifying either.
    pub fn union(&self, other: &SpaceList) -> Result<SpaceList> {
        let mut spans = self.spans.clone();
        spans.extend_from_slice(&other.spans);
        SpaceList::from_spans(spans)
    }
}

fn double_free(start: u64) -> ArborError {
    ArborError::Inconsistent(format!("range at {start:#x} freed twice"))
}

fn not_free(start: u64) -> ArborError {
    ArborError::Inconsistent(format!("range at {start:#x} is not free"))
}

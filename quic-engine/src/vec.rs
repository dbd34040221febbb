//! Scatter-gather segment arrays
//!
//! A [`SegmentArray`] describes a logical byte range that may be spread over several
//! non-contiguous buffers, e.g. previously queued chunks of a send stream followed by data the
//! application just wrote. [`split`] and [`merge`] let a packet writer carve exactly the bytes that
//! fit the space left in a packet, or recombine leftover fragments after a partial send, by
//! rewriting segment descriptors only. The bytes themselves are never copied or moved; they stay
//! in whatever buffers the caller allocated.

use std::{fmt, ops::Range, ptr, slice};

use bytes::BufMut;
use thiserror::Error;
use tinyvec::ArrayVec;
use tracing::trace;

/// A borrowed view of a run of bytes inside a caller-owned buffer
///
/// Segments compare equal when they start at the same address and have the same length.
#[derive(Clone, Copy, Default)]
pub struct Segment<'a> {
    /// The backing buffer this segment was carved from
    buf: &'a [u8],
    start: usize,
    end: usize,
}

impl<'a> Segment<'a> {
    /// View all of `buf`
    ///
    /// A segment built this way is never coalesced with one built from a different slice, even
    /// if the two happen to be adjacent in memory. Carve segments with
    /// [`from_range`](Self::from_range) from one root buffer to get coalescing.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            start: 0,
            end: buf.len(),
        }
    }

    /// View `buf[range]`
    ///
    /// Segments viewing the same `buf` are recognised as contiguous when one ends where the next
    /// begins, which lets [`merge`] coalesce them into a single segment.
    ///
    /// # Panics
    ///
    /// If `range` is not within `buf`.
    pub fn from_range(buf: &'a [u8], range: Range<usize>) -> Self {
        assert!(
            range.start <= range.end && range.end <= buf.len(),
            "segment range {range:?} out of bounds for buffer of length {}",
            buf.len()
        );
        Self {
            buf,
            start: range.start,
            end: range.end,
        }
    }

    /// Number of bytes viewed
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the segment views no bytes at all
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The viewed bytes
    pub fn as_slice(&self) -> &'a [u8] {
        &self.buf[self.start..self.end]
    }

    /// Address of the first viewed byte
    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    /// Whether `next` starts exactly where `self` ends, within the same backing buffer
    pub fn is_contiguous_with(&self, next: &Segment<'_>) -> bool {
        ptr::eq(self.buf, next.buf) && self.end == next.start
    }

    fn split_at(self, mid: usize) -> (Self, Self) {
        debug_assert!(mid <= self.len());
        let at = self.start + mid;
        (Self { end: at, ..self }, Self { start: at, ..self })
    }

    /// Absorb `next`, which must directly follow `self`
    fn extend_with(&mut self, next: &Self) {
        debug_assert!(self.is_contiguous_with(next));
        self.end = next.end;
    }
}

impl<'a> From<&'a [u8]> for Segment<'a> {
    fn from(buf: &'a [u8]) -> Self {
        Self::new(buf)
    }
}

impl PartialEq for Segment<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr() == other.as_ptr() && self.len() == other.len()
    }
}

impl Eq for Segment<'_> {}

impl fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("base", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Ordered segments held in fixed, inline storage of `N` slots
///
/// Concatenating the segments in order yields the logical byte range the array describes. The
/// array never grows beyond `N` and never allocates; exceeding the capacity is reported through
/// [`CapacityError`] by [`push`](Self::push) and is a caller bug everywhere else.
///
/// Empty segments are never stored.
#[derive(Clone)]
pub struct SegmentArray<'a, const N: usize> {
    segments: ArrayVec<[Segment<'a>; N]>,
}

impl<'a, const N: usize> SegmentArray<'a, N> {
    /// Construct an array with no live segments
    pub fn new() -> Self {
        Self {
            segments: ArrayVec::default(),
        }
    }

    /// Construct an array holding `segments`, in order
    ///
    /// # Panics
    ///
    /// If more than `N` non-empty segments are supplied.
    pub fn from_segments(segments: impl IntoIterator<Item = Segment<'a>>) -> Self {
        let mut array = Self::new();
        for segment in segments {
            if let Err(e) = array.push(segment) {
                panic!("{e}");
            }
        }
        array
    }

    /// Append `segment`
    ///
    /// Empty segments are accepted and dropped.
    pub fn push(&mut self, segment: Segment<'a>) -> Result<(), CapacityError> {
        if segment.is_empty() {
            return Ok(());
        }
        match self.segments.try_push(segment) {
            None => Ok(()),
            Some(_) => Err(CapacityError { capacity: N }),
        }
    }

    /// Number of live segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether there are no live segments
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Maximum number of segments the array can hold
    pub fn capacity(&self) -> usize {
        N
    }

    /// Total number of bytes viewed by all live segments
    pub fn byte_len(&self) -> usize {
        len(self.as_slice())
    }

    /// The live segments
    pub fn as_slice(&self) -> &[Segment<'a>] {
        &self.segments
    }

    /// Iterate over the live segments in order
    pub fn iter(&self) -> slice::Iter<'_, Segment<'a>> {
        self.segments.iter()
    }

    /// The first live segment, if any
    pub fn first(&self) -> Option<&Segment<'a>> {
        self.segments.first()
    }

    /// The last live segment, if any
    pub fn last(&self) -> Option<&Segment<'a>> {
        self.segments.last()
    }

    /// Forget all segments
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Gather the viewed bytes, in order, into `buf`
    ///
    /// Returns the number of bytes written.
    ///
    /// # Panics
    ///
    /// If `buf` does not have room for [`byte_len`](Self::byte_len) more bytes.
    pub fn copy_to<B: BufMut>(&self, buf: &mut B) -> usize {
        let mut written = 0;
        for segment in self.iter() {
            buf.put_slice(segment.as_slice());
            written += segment.len();
        }
        written
    }

    /// Drop the first `n` segments, shifting the rest to the front
    fn remove_front(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let remaining = self.segments.len() - n;
        self.segments.rotate_left(n);
        self.segments.truncate(remaining);
    }
}

impl<const N: usize> Default for SegmentArray<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for SegmentArray<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'s, 'a, const N: usize> IntoIterator for &'s SegmentArray<'a, N> {
    type Item = &'s Segment<'a>;
    type IntoIter = slice::Iter<'s, Segment<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A [`SegmentArray`] had no free slot for another segment
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("segment array is full ({capacity} segments)")]
pub struct CapacityError {
    /// Capacity of the array that rejected the segment
    pub capacity: usize,
}

/// Total number of bytes viewed by `segments`
pub fn len(segments: &[Segment<'_>]) -> usize {
    segments.iter().map(Segment::len).sum()
}

/// Move the first `budget` bytes of `src` into `dst`
///
/// If `src` holds fewer than `budget` bytes, all of it is moved. A segment straddling the cut is
/// split in two: its head goes to `dst` and its tail becomes the first segment of `src`. Segments
/// consumed entirely are removed from the front of `src`.
///
/// # Panics
///
/// If `dst` is not empty, or cannot hold every segment that needs to move. Nothing is modified in
/// that case.
pub fn split<'a, const N: usize, const M: usize>(
    src: &mut SegmentArray<'a, N>,
    dst: &mut SegmentArray<'a, M>,
    budget: usize,
) {
    assert!(dst.is_empty(), "split destination must start empty");

    let mut left = budget;
    let mut whole = 0;
    for segment in src.iter() {
        if segment.len() > left {
            break;
        }
        left -= segment.len();
        whole += 1;
    }
    // Bytes taken from the segment straddling the budget, if any
    let partial = if whole < src.len() { left } else { 0 };
    let needed = whole + usize::from(partial > 0);
    assert!(
        needed <= M,
        "split needs {needed} destination segments but capacity is {M}"
    );

    for segment in &src.segments[..whole] {
        dst.segments.push(*segment);
    }
    if partial > 0 {
        let (head, tail) = src.segments[whole].split_at(partial);
        dst.segments.push(head);
        src.segments[whole] = tail;
    }
    src.remove_front(whole);

    trace!(
        budget,
        moved = dst.byte_len(),
        dst_count = dst.len(),
        src_count = src.len(),
        "split segments"
    );
}

/// Move up to `budget` bytes from the front of `src` onto the end of `dst`
///
/// Bytes that directly follow `dst`'s last segment in the same backing buffer are coalesced into
/// that segment. Only segments carved with [`Segment::from_range`] from one root buffer qualify;
/// views of separate slices stay separate segments even when they are adjacent in memory, and
/// therefore count against `max_count`.
///
/// Anything that cannot be coalesced is appended as a new segment, which is only allowed while
/// `dst` holds fewer than `max_count` segments. Once that limit is reached, the contiguous run that
/// continues `dst`'s last segment is still absorbed, and merging stops at the first piece that
/// would need a segment of its own.
///
/// Returns the number of bytes moved, which is `min(budget, len(src))` unless `max_count` was the
/// binding constraint.
///
/// # Panics
///
/// If `max_count` exceeds the capacity of `dst`.
pub fn merge<'a, const N: usize, const M: usize>(
    dst: &mut SegmentArray<'a, N>,
    src: &mut SegmentArray<'a, M>,
    budget: usize,
    max_count: usize,
) -> usize {
    assert!(
        max_count <= N,
        "max_count {max_count} exceeds destination capacity {N}"
    );

    let mut left = budget;
    let mut consumed = 0;
    while left > 0 && consumed < src.len() {
        let segment = src.segments[consumed];
        let take = segment.len().min(left);
        let (head, tail) = segment.split_at(take);

        let coalesce = dst
            .last()
            .is_some_and(|last| last.is_contiguous_with(&head));
        if coalesce {
            if let Some(last) = dst.segments.last_mut() {
                last.extend_with(&head);
            }
        } else if dst.len() < max_count {
            dst.segments.push(head);
        } else {
            break;
        }

        left -= take;
        if tail.is_empty() {
            consumed += 1;
        } else {
            src.segments[consumed] = tail;
        }
    }
    src.remove_front(consumed);

    let moved = budget - left;
    trace!(
        budget,
        max_count,
        moved,
        dst_count = dst.len(),
        src_count = src.len(),
        "merged segments"
    );
    moved
}

//! Byte-range references into the blob store.

use df_core::{Error, ObjectId, Result};
use serde::{Deserialize, Serialize};

/// A byte range of one stored object.
///
/// Segments are plain values: cloning one never touches the stored bytes,
/// and nothing ever mutates the bytes a segment points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub object_id: ObjectId,
    pub offset: u64,
    pub size: u64,
}

impl Segment {
    pub fn new(object_id: ObjectId, offset: u64, size: u64) -> Self {
        Self {
            object_id,
            offset,
            size,
        }
    }

    /// One past the last byte this segment covers within its object.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Sum of the sizes of `segments`.
pub fn total_size(segments: &[Segment]) -> u64 {
    segments.iter().map(|s| s.size).sum()
}

/// Cut the byte range `[offset, offset + size)` out of a segment list.
///
/// Segments that end at or before `offset` are skipped, the first overlapping
/// segment is trimmed from the front and the last one from the back. The
/// source list is left untouched and the returned sizes always add up to
/// `size`. Zero-length segments carry no bytes and never appear in the output.
///
/// # Errors
///
/// Returns [`Error::InvalidRange`] when the range reaches past the end of the
/// list.
pub fn subreference_segments(segments: &[Segment], offset: u64, size: u64) -> Result<Vec<Segment>> {
    let total = total_size(segments);
    let in_range = offset.checked_add(size).is_some_and(|end| end <= total);
    if !in_range {
        return Err(Error::InvalidRange {
            offset,
            size,
            total,
        });
    }

    if size == 0 {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut offset_remaining = offset;
    let mut size_remaining = size;

    for segment in segments {
        if size_remaining == 0 {
            break;
        }
        if segment.size <= offset_remaining {
            offset_remaining -= segment.size;
            continue;
        }

        let take = (segment.size - offset_remaining).min(size_remaining);
        out.push(Segment::new(
            segment.object_id,
            segment.offset + offset_remaining,
            take,
        ));
        offset_remaining = 0;
        size_remaining -= take;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_segments() -> (ObjectId, ObjectId, Vec<Segment>) {
        let a = ObjectId::new();
        let b = ObjectId::new();
        // Two 10-byte segments from different objects plus a slice of `a`.
        let segments = vec![
            Segment::new(a, 0, 10),
            Segment::new(b, 100, 10),
            Segment::new(a, 50, 5),
        ];
        (a, b, segments)
    }

    #[test]
    fn whole_range_reproduces_list() {
        let (_, _, segments) = make_test_segments();
        let out = subreference_segments(&segments, 0, 25).unwrap();
        assert_eq!(out, segments);
    }

    #[test]
    fn inside_single_segment() {
        let (_, b, segments) = make_test_segments();
        let out = subreference_segments(&segments, 12, 3).unwrap();
        assert_eq!(out, vec![Segment::new(b, 102, 3)]);
    }

    #[test]
    fn spanning_three_segments() {
        let (a, b, segments) = make_test_segments();
        let out = subreference_segments(&segments, 8, 15).unwrap();
        assert_eq!(
            out,
            vec![
                Segment::new(a, 8, 2),
                Segment::new(b, 100, 10),
                Segment::new(a, 50, 3),
            ]
        );
        assert_eq!(total_size(&out), 15);
    }

    #[test]
    fn offset_on_segment_boundary_skips_whole_segment() {
        let (_, b, segments) = make_test_segments();
        let out = subreference_segments(&segments, 10, 10).unwrap();
        assert_eq!(out, vec![Segment::new(b, 100, 10)]);
    }

    #[test]
    fn zero_size_is_empty() {
        let (_, _, segments) = make_test_segments();
        assert!(subreference_segments(&segments, 25, 0).unwrap().is_empty());
        assert!(subreference_segments(&[], 0, 0).unwrap().is_empty());
    }

    #[test]
    fn past_end_is_rejected() {
        let (_, _, segments) = make_test_segments();
        let err = subreference_segments(&segments, 20, 6).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidRange {
                offset: 20,
                size: 6,
                total: 25
            }
        ));
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let (_, _, segments) = make_test_segments();
        assert!(subreference_segments(&segments, u64::MAX, 2).is_err());
    }

    #[test]
    fn source_list_is_untouched() {
        let (_, _, segments) = make_test_segments();
        let before = segments.clone();
        let _ = subreference_segments(&segments, 3, 20).unwrap();
        assert_eq!(segments, before);
    }

    #[test]
    fn every_valid_range_has_requested_size() {
        let (_, _, segments) = make_test_segments();
        let total = total_size(&segments);
        for offset in 0..=total {
            for size in 0..=(total - offset) {
                let out = subreference_segments(&segments, offset, size).unwrap();
                assert_eq!(total_size(&out), size, "offset {offset} size {size}");
            }
        }
    }

    #[test]
    fn zero_length_segments_are_dropped() {
        let a = ObjectId::new();
        let segments = vec![
            Segment::new(a, 0, 4),
            Segment::new(a, 4, 0),
            Segment::new(a, 4, 4),
        ];
        let out = subreference_segments(&segments, 0, 8).unwrap();
        assert_eq!(out, vec![Segment::new(a, 0, 4), Segment::new(a, 4, 4)]);
    }
}

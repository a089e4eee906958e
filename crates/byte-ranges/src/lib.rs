//! Parsing, validation, normalization and coalescing of HTTP `Range`
//! request headers, as described by RFC 7233.
//!
//! A header is first parsed into raw [`ByteRange`]s, which are not yet bound
//! to any particular content length. Once the length of the representation is
//! known, ranges are normalized into closed [`Span`]s and coalesced into an
//! ascending, disjoint set which is suitable for building a (possibly
//! multipart) partial response.
use itertools::Itertools;
use std::fmt;

/// Default bound on the number of ranges accepted within a single header.
/// Requests presenting more are rejected outright, to bound the work which a
/// single request can amplify into.
pub const DEFAULT_MAX_RANGES: usize = 5;

/// Error of a Range header which cannot be served.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("malformed Range header: {0}")]
    Format(String),
    #[error("range not satisfiable: {0}")]
    Unsatisfiable(String),
}

/// ByteRange is a single requested range of bytes which has not yet been
/// resolved against a content length. It takes one of the forms:
///
/// * `min-max`: a closed range of byte offsets.
/// * `min-`: all bytes from `min` through the end of the content.
/// * `-N`: the final N bytes of the content, held as `min: None, max: -N`.
///
/// A ByteRange with neither bound selects the entire content.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    min: Option<i64>,
    max: Option<i64>,
}

impl ByteRange {
    /// Build a ByteRange from raw bounds, rejecting combinations which
    /// cannot describe a range of any content.
    pub fn new(min: Option<i64>, max: Option<i64>) -> Result<Self, Error> {
        let invalid = match (min, max) {
            // A suffix must be expressed as a negative `max`.
            (None, Some(max)) => max >= 0,
            (Some(min), _) if min < 0 => true,
            (Some(min), Some(max)) => min > max,
            (Some(_), None) | (None, None) => false,
        };

        if invalid {
            return Err(Error::Unsatisfiable(format!(
                "invalid range bounds (min: {min:?}, max: {max:?})"
            )));
        }
        Ok(Self { min, max })
    }

    /// Range of the final `len` bytes of the content.
    pub fn suffix(len: i64) -> Result<Self, Error> {
        let max = len
            .checked_neg()
            .ok_or_else(|| Error::Unsatisfiable(format!("suffix length {len} is out of range")))?;
        Self::new(None, Some(max))
    }

    pub fn min(&self) -> Option<i64> {
        self.min
    }

    pub fn max(&self) -> Option<i64> {
        self.max
    }

    /// Resolve this range against a content of `length` bytes, returning the
    /// equivalent closed range with both bounds present and in-bounds.
    /// Normalizing an already-normalized range is a no-op.
    pub fn normalize(&self, length: u64) -> Result<ByteRange, Error> {
        let (min, max) = self.bounds(length)?;
        Ok(ByteRange {
            min: Some(min),
            max: Some(max),
        })
    }

    /// Resolve this range against a content of `length` bytes as a Span.
    pub fn span(&self, length: u64) -> Result<Span, Error> {
        let (min, max) = self.bounds(length)?;
        Ok(Span {
            first: min as u64,
            last: max as u64,
        })
    }

    fn bounds(&self, length: u64) -> Result<(i64, i64), Error> {
        let length = match i64::try_from(length) {
            Ok(length) if length >= 1 => length,
            _ => {
                return Err(Error::Unsatisfiable(format!(
                    "content length {length} cannot be ranged over"
                )))
            }
        };

        let mut min = self.min.unwrap_or(0);
        let mut max = self.max.unwrap_or(length - 1);

        if max < 0 {
            min = length + max;
            max = length - 1;
        }
        if max >= length {
            max = length - 1;
        }

        if min < 0 || max < 0 || min > max {
            return Err(Error::Unsatisfiable(format!(
                "range {self} does not overlap content of length {length}"
            )));
        }
        Ok((min, max))
    }
}

/// Renders the range in its header form, such as `0-499`, `500-`, or `-200`.
impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (None, None) => Ok(()),
            (None, Some(max)) => write!(f, "{max}"),
            (Some(min), None) => write!(f, "{min}-"),
            (Some(min), Some(max)) => write!(f, "{min}-{max}"),
        }
    }
}

/// Span is a closed, normalized interval of byte offsets `[first, last]`
/// within a content of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub first: u64,
    pub last: u64,
}

impl Span {
    /// Number of bytes covered by the Span.
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Half-open index range of the Span, for slicing the content.
    pub fn to_range(&self) -> std::ops::Range<usize> {
        self.first as usize..(self.last as usize + 1)
    }

    /// Value of a `Content-Range` header describing this Span of content
    /// having total `length`.
    pub fn content_range(&self, length: u64) -> String {
        format!("bytes {}-{}/{length}", self.first, self.last)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

/// Parse the value of a `Range` header.
///
/// Returns Ok(None) if the header uses a range unit other than `bytes`,
/// as a server must ignore range units it does not understand.
/// Empty elements of the range set are skipped.
pub fn parse(header: &str) -> Result<Option<Vec<ByteRange>>, Error> {
    let (unit, set) = match header.split_once('=') {
        Some((unit, set)) => (unit.trim(), Some(set)),
        None => (header.trim(), None),
    };

    if !unit.eq_ignore_ascii_case("bytes") {
        return Ok(None);
    }
    let Some(set) = set else {
        return Err(Error::Format(format!(
            "expected `bytes=` followed by a range set, not {header:?}"
        )));
    };

    let ranges = set
        .split(',')
        .map(str::trim)
        .filter(|spec| !spec.is_empty())
        .map(parse_spec)
        .collect::<Result<Vec<_>, _>>()?;

    if ranges.is_empty() {
        return Err(Error::Format(format!("{header:?} has an empty range set")));
    }
    Ok(Some(ranges))
}

fn parse_spec(spec: &str) -> Result<ByteRange, Error> {
    let Some((first, last)) = spec.split_once('-') else {
        return Err(Error::Format(format!("{spec:?} is not a byte range")));
    };

    match (first, last) {
        ("", "") => Err(Error::Format(format!("{spec:?} has no bounds"))),
        ("", suffix) => ByteRange::suffix(parse_offset(suffix, spec)?),
        (first, "") => ByteRange::new(Some(parse_offset(first, spec)?), None),
        (first, last) => ByteRange::new(
            Some(parse_offset(first, spec)?),
            Some(parse_offset(last, spec)?),
        ),
    }
}

fn parse_offset(digits: &str, spec: &str) -> Result<i64, Error> {
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Format(format!("{spec:?} is not a byte range")));
    }
    digits
        .parse()
        .map_err(|_| Error::Format(format!("offset {digits} of {spec:?} is out of range")))
}

/// Normalize all `ranges` against `length`, and merge overlapping or adjacent
/// ranges into the minimal ascending, disjoint set of Spans which covers them.
/// The result is independent of the order of `ranges`.
pub fn sort_and_coalesce(ranges: &[ByteRange], length: u64) -> Result<Vec<Span>, Error> {
    let spans = ranges
        .iter()
        .map(|range| range.span(length))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(spans
        .into_iter()
        .sorted_by_key(|span| span.first)
        .coalesce(|cur, next| {
            if cur.last.saturating_add(1) >= next.first {
                Ok(Span {
                    first: cur.first,
                    last: cur.last.max(next.last),
                })
            } else {
                Err((cur, next))
            }
        })
        .collect())
}

/// Resolve an optional `Range` header against a content of `length` bytes.
///
/// Returns Ok(None) where the full content should be served: there's no
/// header, the header's unit is not understood, or the requested ranges
/// coalesce into the entire content. Otherwise returns the coalesced Spans.
/// Headers with more than `max_ranges` ranges are unsatisfiable.
pub fn resolve(
    header: Option<&str>,
    length: u64,
    max_ranges: usize,
) -> Result<Option<Vec<Span>>, Error> {
    let Some(header) = header else {
        return Ok(None);
    };
    let Some(ranges) = parse(header)? else {
        return Ok(None);
    };

    if ranges.len() > max_ranges {
        return Err(Error::Unsatisfiable(format!(
            "{} ranges were requested but at most {max_ranges} are served",
            ranges.len()
        )));
    }
    let spans = sort_and_coalesce(&ranges, length)?;

    match spans.as_slice() {
        [only] if only.first == 0 && only.len() == length => Ok(None),
        _ => Ok(Some(spans)),
    }
}

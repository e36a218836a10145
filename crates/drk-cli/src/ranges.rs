//! Range file parsing.
//!
//! A range file lists `base`, `end` and `stride` as hexadecimal values, one
//! per line, three lines per range. Reading stops at the first empty line,
//! the first value that does not parse, a trailing partial triple, or a
//! triple that is not a valid range. Everything before the stop point is
//! kept.

use drk_common::error::DrkError;
use drk_common::probe::AddressRange;
use std::path::Path;
use thiserror::Error;

/// Why parsing stopped before the end of the input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StopReason {
    /// An empty line terminates the list.
    #[error("empty line {line}")]
    EmptyLine {
        /// 1-based line number.
        line: usize,
    },

    /// A value was not a hexadecimal `u64`.
    #[error("line {line}: {text:?} is not a hexadecimal address")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Offending text.
        text: String,
    },

    /// Input ended in the middle of a triple.
    #[error("input ends after {values} of 3 values for the last range")]
    Truncated {
        /// Values read for the incomplete range.
        values: usize,
    },

    /// The triple ending at `line` is not a valid range.
    #[error("line {line}: {source}")]
    Invalid {
        /// 1-based line number of the stride.
        line: usize,
        /// Range validation failure.
        #[source]
        source: DrkError,
    },
}

impl StopReason {
    /// Whether this is the normal list terminator rather than bad input.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(self, StopReason::EmptyLine { .. })
    }
}

/// Ranges read from a file and where reading stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRanges {
    /// Complete, valid ranges in file order.
    pub ranges: Vec<AddressRange>,
    /// `None` when the whole input was consumed.
    pub stop: Option<StopReason>,
}

/// Failure to read the range file at all.
#[derive(Debug, Error)]
#[error("failed to read range file {path}: {source}")]
pub struct RangeFileError {
    path: String,
    #[source]
    source: std::io::Error,
}

/// Parse one value, with or without a `0x` prefix.
pub fn parse_hex(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Parse range triples from `input`.
#[must_use]
pub fn parse_ranges(input: &str) -> ParsedRanges {
    let mut ranges = Vec::new();
    let mut triple = [0u64; 3];
    let mut filled = 0;

    for (index, raw) in input.lines().enumerate() {
        let line = index + 1;
        if raw.trim().is_empty() {
            return ParsedRanges {
                ranges,
                stop: Some(StopReason::EmptyLine { line }),
            };
        }
        let Some(value) = parse_hex(raw) else {
            return ParsedRanges {
                ranges,
                stop: Some(StopReason::Malformed {
                    line,
                    text: raw.trim().to_string(),
                }),
            };
        };

        triple[filled] = value;
        filled += 1;
        if filled == 3 {
            filled = 0;
            match AddressRange::new(triple[0], triple[1], triple[2]) {
                Ok(range) => ranges.push(range),
                Err(source) => {
                    return ParsedRanges {
                        ranges,
                        stop: Some(StopReason::Invalid { line, source }),
                    }
                }
            }
        }
    }

    let stop = (filled > 0).then_some(StopReason::Truncated { values: filled });
    ParsedRanges { ranges, stop }
}

/// Read and parse a range file.
///
/// # Errors
///
/// Returns [`RangeFileError`] if the file cannot be read. Parse problems are
/// reported through [`ParsedRanges::stop`] instead.
pub fn read_range_file(path: &Path) -> Result<ParsedRanges, RangeFileError> {
    let content = std::fs::read_to_string(path).map_err(|source| RangeFileError {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_ranges(&content))
}

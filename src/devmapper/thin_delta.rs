//! Parsing `thin_delta` output into byte-space mappings
//!
//! `thin_delta` emits one element per run of blocks:
//!
//! ```text
//! <superblock uuid="" time="0" transaction="1" data_block_size="4096" nr_data_blocks="0">
//!   <diff left="1" right="2">
//!     <same begin="0" length="1"/>
//!     <different begin="4" length="1"/>
//!     <left_only begin="8" length="2"/>
//!   </diff>
//! </superblock>
//! ```
//!
//! Elements without `begin`/`length` are structure and are skipped.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::objectstore::{Mapping, Mappings};
use crate::util::cached_regex;

/// Kind of a thin_delta run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Same,
    Different,
    LeftOnly,
    RightOnly,
}

impl DeltaKind {
    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "same" => Some(DeltaKind::Same),
            "different" => Some(DeltaKind::Different),
            "left_only" | "left" => Some(DeltaKind::LeftOnly),
            "right_only" | "right" => Some(DeltaKind::RightOnly),
            _ => None,
        }
    }
}

/// Convert `thin_delta` output into mappings of `block_size` bytes each.
///
/// `same` runs are only reported when `include_same` is set.
pub fn parse_thin_delta(output: &str, block_size: i64, include_same: bool) -> Result<Mappings> {
    static ELEMENT_RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    static ATTR_RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let element_re = cached_regex(&ELEMENT_RE, r"<\s*([a-z_]+)([^<>]*?)/?>")?;
    let attr_re = cached_regex(&ATTR_RE, r#"([a-z_]+)\s*=\s*"([^"]*)""#)?;

    if block_size <= 0 {
        return Err(Error::InvalidArgument(format!("invalid block size {}", block_size)));
    }

    let mut mappings = Vec::new();
    for caps in element_re.captures_iter(output) {
        let Some(kind) = DeltaKind::parse(&caps[1]) else {
            continue;
        };

        let mut begin = None;
        let mut length = None;
        for attr in attr_re.captures_iter(&caps[2]) {
            let value = || {
                attr[2].parse::<i64>().map_err(|_| {
                    Error::Corrupt(format!("bad thin_delta attribute {}", &attr[0]))
                })
            };
            match &attr[1] {
                "begin" => begin = Some(value()?),
                "length" => length = Some(value()?),
                _ => {}
            }
        }
        let (Some(begin), Some(length)) = (begin, length) else {
            continue;
        };

        if kind == DeltaKind::Same && !include_same {
            continue;
        }
        mappings.push(Mapping {
            offset: begin * block_size,
            size: length * block_size,
        });
    }

    Ok(Mappings {
        block_size,
        mappings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: i64 = 2097152;

    const OUTPUT_SAME: &str = r#"<same begin="0" length="1"/>
            <same begin="1" length="1"/>
            <same begin="4" length="3"/>
            <same begin="8" length="1"/>
            <same begin="12" length="1"/>"#;

    const OUTPUT_DIFF: &str = r#"<different begin="0" length="1"/>
        <different begin="4" length="1"/>"#;

    const OUTPUT_MIX: &str = r#"<same begin="0" length="1"/>
        <left begin="2" length="1"/>
        <different begin="4" length="1"/>
        <different begin="6" length="1"/>
        <right begin="8" length="2"/>"#;

    fn m(begin: i64, length: i64) -> Mapping {
        Mapping {
            offset: begin * BLOCK_SIZE,
            size: length * BLOCK_SIZE,
        }
    }

    #[test]
    fn test_same_with_include_same() {
        let result = parse_thin_delta(OUTPUT_SAME, BLOCK_SIZE, true).unwrap();
        assert_eq!(result.block_size, BLOCK_SIZE);
        assert_eq!(
            result.mappings,
            vec![m(0, 1), m(1, 1), m(4, 3), m(8, 1), m(12, 1)]
        );
    }

    #[test]
    fn test_same_without_include_same_is_empty() {
        let result = parse_thin_delta(OUTPUT_SAME, BLOCK_SIZE, false).unwrap();
        assert!(result.mappings.is_empty());
    }

    #[test]
    fn test_mix_and_diff() {
        let result = parse_thin_delta(OUTPUT_MIX, BLOCK_SIZE, false).unwrap();
        assert_eq!(result.mappings, vec![m(2, 1), m(4, 1), m(6, 1), m(8, 2)]);

        let result = parse_thin_delta(OUTPUT_DIFF, BLOCK_SIZE, false).unwrap();
        assert_eq!(result.mappings, vec![m(0, 1), m(4, 1)]);
    }

    #[test]
    fn test_full_document_skips_structure() {
        let output = r#"<superblock uuid="" time="0" transaction="1" data_block_size="128" nr_data_blocks="100">
  <diff left="1" right="2">
    <left_only begin="3" length="1"/>
    <right_only begin="9" length="2"/>
  </diff>
</superblock>"#;
        let result = parse_thin_delta(output, BLOCK_SIZE, true).unwrap();
        assert_eq!(result.mappings, vec![m(3, 1), m(9, 2)]);
    }

    #[test]
    fn test_bad_input() {
        assert!(parse_thin_delta(OUTPUT_SAME, 0, true).is_err());
        let err = parse_thin_delta(r#"<same begin="x" length="1"/>"#, BLOCK_SIZE, true);
        assert!(matches!(err, Err(Error::Corrupt(_))));
    }
}

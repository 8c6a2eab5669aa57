use std::fmt;
use std::str::FromStr;

use anyhow::{Context as _, Result, bail};
use bitcoin::bip32::ChildNumber;

/// A textual HD derivation path with optionally named components, e.g.
/// `m/schema:1'/recovery:1'/invoices:4/738292/11`.
///
/// Names are documentation only: two paths are considered equal when their
/// indices and hardening match, regardless of labels.
#[derive(Debug, Clone)]
pub struct KeyPath {
    segments: Vec<PathSegment>,
}

#[derive(Debug, Clone)]
pub(crate) struct PathSegment {
    pub(crate) name: Option<String>,
    pub(crate) index: u32,
    pub(crate) hardened: bool,
}

impl PathSegment {
    fn matches(&self, other: &PathSegment) -> bool {
        self.index == other.index && self.hardened == other.hardened
    }
}

impl KeyPath {
    /// Parses a path of the form `m/[name:]index[']/...`. Indices must be
    /// below 2^31; the apostrophe marks a hardened component.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let root = parts.next().context("empty derivation path")?;
        if root != "m" {
            bail!("derivation path must start with 'm', got {s:?}");
        }

        let mut segments = Vec::new();
        for part in parts {
            segments.push(parse_segment(part).with_context(|| format!("parse path {s:?}"))?);
        }
        Ok(Self { segments })
    }

    /// Appends an unnamed non-hardened child. `index` must be below 2^31.
    pub fn child(&self, index: u32) -> KeyPath {
        let mut segments = self.segments.clone();
        segments.push(PathSegment {
            name: None,
            index,
            hardened: false,
        });
        KeyPath { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns the components after `prefix`, or `None` when this path
    /// does not extend it.
    pub(crate) fn strip_prefix(&self, prefix: &KeyPath) -> Option<&[PathSegment]> {
        if prefix.segments.len() > self.segments.len() {
            return None;
        }
        let matches = prefix
            .segments
            .iter()
            .zip(&self.segments)
            .all(|(p, s)| p.matches(s));
        matches.then(|| &self.segments[prefix.segments.len()..])
    }

    /// The path as bip32 child numbers, root first.
    pub fn child_numbers(&self) -> Result<Vec<ChildNumber>> {
        self.segments.iter().map(segment_child_number).collect()
    }
}

pub(crate) fn segment_child_number(segment: &PathSegment) -> Result<ChildNumber> {
    let number = if segment.hardened {
        ChildNumber::from_hardened_idx(segment.index)
    } else {
        ChildNumber::from_normal_idx(segment.index)
    };
    number.with_context(|| format!("child index {} out of range", segment.index))
}

fn parse_segment(part: &str) -> Result<PathSegment> {
    if part.is_empty() {
        bail!("empty path component");
    }

    let (body, hardened) = match part.strip_suffix('\'') {
        Some(body) => (body, true),
        None => (part, false),
    };

    let (name, index_str) = match body.split_once(':') {
        Some((name, index)) => (Some(name.to_string()), index),
        None => (None, body),
    };

    let index: u32 = index_str
        .parse()
        .with_context(|| format!("invalid child index {index_str:?}"))?;
    if index >= 1 << 31 {
        bail!("child index {index} out of range");
    }

    Ok(PathSegment {
        name,
        index,
        hardened,
    })
}

impl PartialEq for KeyPath {
    fn eq(&self, other: &Self) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a.matches(b))
    }
}

impl Eq for KeyPath {}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for segment in &self.segments {
            write!(f, "/")?;
            if let Some(name) = &segment.name {
                write!(f, "{name}:")?;
            }
            write!(f, "{}", segment.index)?;
            if segment.hardened {
                write!(f, "'")?;
            }
        }
        Ok(())
    }
}

impl FromStr for KeyPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        KeyPath::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let cases = [
            "m",
            "m/0",
            "m/schema:1'/recovery:1'",
            "m/schema:1'/recovery:1'/invoices:4/738292/11",
        ];
        for case in cases {
            let path = KeyPath::parse(case).unwrap();
            assert_eq!(path.to_string(), case, "case {case}");
        }
    }

    #[test]
    fn named_and_unnamed_segments_compare_equal() {
        let named = KeyPath::parse("m/schema:1'/recovery:1'").unwrap();
        let unnamed = KeyPath::parse("m/1'/1'").unwrap();
        assert_eq!(named, unnamed);
    }

    #[test]
    fn hardening_distinguishes_paths() {
        let hardened = KeyPath::parse("m/1'").unwrap();
        let normal = KeyPath::parse("m/1").unwrap();
        assert_ne!(hardened, normal);
    }

    #[test]
    fn rejects_malformed_paths() {
        for case in ["", "x/1", "m/", "m/abc", "m/2147483648", "m/1''"] {
            assert!(KeyPath::parse(case).is_err(), "case {case:?}");
        }
    }

    #[test]
    fn child_appends_normal_component() {
        let base = KeyPath::parse("m/schema:1'/recovery:1'").unwrap();
        let path = base.child(7).child(9);
        assert_eq!(path.to_string(), "m/schema:1'/recovery:1'/7/9");
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn strip_prefix_returns_suffix() {
        let base = KeyPath::parse("m/schema:1'/recovery:1'").unwrap();
        let full = KeyPath::parse("m/1'/1'/invoices:4/5/6").unwrap();

        let suffix = full.strip_prefix(&base).unwrap();
        assert_eq!(suffix.len(), 3);
        assert_eq!(suffix[0].index, 4);
        assert_eq!(suffix[2].index, 6);

        let other = KeyPath::parse("m/2'/1'").unwrap();
        assert!(full.strip_prefix(&other).is_none());
    }

    #[test]
    fn child_numbers_reflect_hardening() {
        let path = KeyPath::parse("m/schema:1'/recovery:1'/invoices:4").unwrap();
        let numbers = path.child_numbers().unwrap();
        assert_eq!(
            numbers,
            vec![
                ChildNumber::from_hardened_idx(1).unwrap(),
                ChildNumber::from_hardened_idx(1).unwrap(),
                ChildNumber::from_normal_idx(4).unwrap(),
            ]
        );
    }
}

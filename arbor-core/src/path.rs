//! Immutable tree paths.
//!
//! A [`Path`] is an ordered list of segments. The root path has no segments
//! and renders as `/`; every other path renders with a leading slash and
//! `/`-joined segments (`/users/1/age`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Characters that may not appear inside a data path segment.
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root path (zero segments).
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated path. Empty segments are ignored, so `""`,
    /// `"/"` and `"//"` all parse to the root.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            if let Some(c) = segment.chars().find(|c| FORBIDDEN.contains(c) || c.is_control()) {
                return Err(Error::InvalidPath {
                    path: raw.to_string(),
                    reason: format!("segment '{segment}' contains '{}'", c.escape_default()),
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Build a path from raw segments without validation.
    ///
    /// Used for rule patterns, whose `$wildcard` segments are not valid data
    /// path segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// A new path with `segment` appended.
    pub fn append(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// A new path with all of `other`'s segments appended.
    pub fn join(&self, other: &Path) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// The parent path. The root is its own parent.
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// The last segment, or `None` for the root.
    pub fn last_element(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The first segment, or `None` for the root.
    pub fn first_element(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True for the root and for single-segment paths.
    pub fn is_simple(&self) -> bool {
        self.segments.len() <= 1
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if `self` is `other` or one of its ancestors.
    pub fn is_ancestor_of_or_equal(&self, other: &Path) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        other.segments.len() > self.segments.len() && self.is_ancestor_of_or_equal(other)
    }

    /// The child of `self` on the way down to `descendant`.
    ///
    /// Returns `None` unless `self` is a strict ancestor of `descendant`.
    pub fn child_toward(&self, descendant: &Path) -> Option<Path> {
        if !self.is_ancestor_of(descendant) {
            return None;
        }
        Some(self.append(descendant.segments[self.segments.len()].clone()))
    }

    /// All strict ancestors, nearest first, ending with the root.
    pub fn ancestors(&self) -> impl Iterator<Item = Path> + '_ {
        (0..self.segments.len()).rev().map(move |len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Path::parse(&raw).map_err(serde::de::Error::custom)
    }
}

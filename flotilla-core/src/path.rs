//! Hierarchical path identifiers for groups and apps.
//!
//! A `PathId` names a node in the group tree. Absolute paths are anchored
//! at the root; relative paths are resolved against an absolute base with
//! [`PathId::canonical_path`].

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing a path identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathIdError {
    /// Segment contains characters outside `[A-Za-z0-9._-]`.
    #[error("invalid path segment '{0}'")]
    InvalidSegment(String),
}

/// Canonical hierarchical identifier: ordered non-empty segments plus an
/// absolute flag. The empty absolute path is the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathId {
    segments: Vec<String>,
    absolute: bool,
}

impl PathId {
    /// The root path `/`.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            absolute: true,
        }
    }

    /// Build an absolute path from segments.
    pub fn absolute<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            absolute: true,
        }
    }

    /// Parse a path. A leading `/` marks the path absolute; empty segments
    /// (doubled or trailing slashes) are ignored.
    pub fn parse(input: &str) -> Result<Self, PathIdError> {
        let trimmed = input.trim();
        let absolute = trimmed.starts_with('/');
        let mut segments = Vec::new();
        for raw in trimmed.split('/') {
            if raw.is_empty() {
                continue;
            }
            if !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            {
                return Err(PathIdError::InvalidSegment(raw.to_string()));
            }
            segments.push(raw.to_string());
        }
        Ok(Self { segments, absolute })
    }

    /// Whether this is the absolute empty path.
    pub fn is_root(&self) -> bool {
        self.absolute && self.segments.is_empty()
    }

    /// Whether the path is anchored at the root.
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Path segments in order.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the path has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Final segment, if any.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent path. The parent of the root is the root.
    pub fn parent(&self) -> PathId {
        if self.segments.is_empty() {
            return self.clone();
        }
        Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
            absolute: self.absolute,
        }
    }

    /// Extend the path by one child segment.
    pub fn child(&self, name: impl Into<String>) -> PathId {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        Self {
            segments,
            absolute: self.absolute,
        }
    }

    /// Resolve against an absolute base: an absolute receiver is returned
    /// unchanged, a relative one is appended to `base`.
    pub fn canonical_path(&self, base: &PathId) -> PathId {
        if self.absolute {
            return self.clone();
        }
        let mut segments = base.segments.clone();
        segments.extend(self.segments.iter().cloned());
        Self {
            segments,
            absolute: true,
        }
    }

    /// Whether `other` is this path or lies beneath it.
    pub fn contains(&self, other: &PathId) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments == other.segments[..self.segments.len()]
    }

    /// Prefix of this path with `n` segments.
    pub fn prefix(&self, n: usize) -> PathId {
        Self {
            segments: self.segments[..n.min(self.segments.len())].to_vec(),
            absolute: self.absolute,
        }
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute && self.segments.is_empty() {
            return write!(f, "/");
        }
        if self.absolute {
            write!(f, "/")?;
        }
        write!(f, "{}", self.segments.join("/"))
    }
}

impl FromStr for PathId {
    type Err = PathIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PathId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PathId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PathId::parse(&raw).map_err(D::Error::custom)
    }
}

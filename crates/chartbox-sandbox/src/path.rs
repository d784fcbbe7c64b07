//! Dotted, index-aware paths into option trees.
//!
//! `series.0.itemStyle.color` addresses the `color` field of the `itemStyle`
//! object of the first `series` element. Segments made only of ASCII digits
//! are indices; everything else is a field name.
//!
//! Lookups through a missing container yield `None`. Assignments through a
//! missing container are skipped and reported by returning `false`; nothing
//! is created along the way and arrays never grow.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::tree::ConfigTree;

/// Errors from parsing a dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The path string was empty.
    #[error("path is empty")]
    Empty,

    /// A segment between two dots (or at either end) was empty.
    #[error("path `{path}` has an empty segment at position {position}")]
    EmptySegment {
        /// The offending path.
        path: String,
        /// Zero-based segment position.
        position: usize,
    },
}

/// One step of an [`OptionPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Object key.
    Field(String),
    /// Array index. Against an object it addresses the decimal key.
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

/// A parsed, non-empty path into a [`ConfigTree`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OptionPath {
    segments: Vec<Segment>,
}

impl OptionPath {
    /// Parse a dotted path.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        if path.is_empty() {
            return Err(PathError::Empty);
        }
        let segments = path
            .split('.')
            .enumerate()
            .map(|(position, raw)| {
                if raw.is_empty() {
                    return Err(PathError::EmptySegment {
                        path: path.to_string(),
                        position,
                    });
                }
                if raw.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(index) = raw.parse::<usize>() {
                        return Ok(Segment::Index(index));
                    }
                }
                Ok(Segment::Field(raw.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    /// Parse several paths, failing on the first malformed one.
    pub fn parse_all<S: AsRef<str>>(paths: &[S]) -> Result<Vec<Self>, PathError> {
        paths.iter().map(|p| Self::parse(p.as_ref())).collect()
    }

    /// Path of a single field.
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Field(name.into())],
        }
    }

    /// Extend with a field segment.
    pub fn push_field(mut self, name: impl Into<String>) -> Self {
        self.segments.push(Segment::Field(name.into()));
        self
    }

    /// Extend with an index segment.
    pub fn push_index(mut self, index: usize) -> Self {
        self.segments.push(Segment::Index(index));
        self
    }

    /// The segments, outermost first.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl FromStr for OptionPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for OptionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl Serialize for OptionPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn step<'a>(node: &'a ConfigTree, segment: &Segment) -> Option<&'a ConfigTree> {
    match (node, segment) {
        (ConfigTree::Object(map), Segment::Field(name)) => map.get(name),
        (ConfigTree::Object(map), Segment::Index(i)) => map.get(&i.to_string()),
        (ConfigTree::Array(items), Segment::Index(i)) => items.get(*i),
        _ => None,
    }
}

fn step_mut<'a>(node: &'a mut ConfigTree, segment: &Segment) -> Option<&'a mut ConfigTree> {
    match (node, segment) {
        (ConfigTree::Object(map), Segment::Field(name)) => map.get_mut(name),
        (ConfigTree::Object(map), Segment::Index(i)) => map.get_mut(&i.to_string()),
        (ConfigTree::Array(items), Segment::Index(i)) => items.get_mut(*i),
        _ => None,
    }
}

impl ConfigTree {
    /// Value at `path`, or `None` if any segment is missing.
    pub fn get_path(&self, path: &OptionPath) -> Option<&ConfigTree> {
        path.segments()
            .iter()
            .try_fold(self, |node, segment| step(node, segment))
    }

    /// Mutable value at `path`, or `None` if any segment is missing.
    pub fn get_path_mut(&mut self, path: &OptionPath) -> Option<&mut ConfigTree> {
        path.segments()
            .iter()
            .try_fold(self, |node, segment| step_mut(node, segment))
    }

    /// Write `value` at `path`.
    ///
    /// Returns `false` without writing when an intermediate container is
    /// missing, when the parent is not a container, or when an array index
    /// is out of bounds. Object parents get the key inserted or replaced.
    pub fn set_path(&mut self, path: &OptionPath, value: ConfigTree) -> bool {
        let Some((last, parents)) = path.segments().split_last() else {
            return false;
        };
        let parent = parents
            .iter()
            .try_fold(self, |node, segment| step_mut(node, segment));

        match (parent, last) {
            (Some(ConfigTree::Object(map)), Segment::Field(name)) => {
                map.insert(name.clone(), value);
                true
            }
            (Some(ConfigTree::Object(map)), Segment::Index(i)) => {
                map.insert(i.to_string(), value);
                true
            }
            (Some(ConfigTree::Array(items)), Segment::Index(i)) => match items.get_mut(*i) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

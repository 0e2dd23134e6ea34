use std::fmt;

use crate::error::StoreError;

/// Characters a tree key may not contain.
pub const FORBIDDEN_KEY_CHARS: &[char] = &['.', '#', '$', '[', ']'];

/// A validated, slash-separated location in the store tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// Parse `a/b/c`. Leading, trailing and doubled slashes are ignored.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let segments: Vec<String> = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if segments.iter().any(|s| !is_valid_key(s)) {
            return Err(StoreError::InvalidPath(raw.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment, e.g. `messages` for `messages/s/c`.
    pub fn top_level(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Append an already-validated key.
    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(key.to_string());
        Self { segments }
    }

    /// True if `self` equals `other` or lies above it.
    pub fn contains(&self, other: &StorePath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// True if a write at one path can change the value seen at the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Strict ancestors, nearest last, excluding the root.
    pub fn ancestors(&self) -> Vec<StorePath> {
        (1..self.segments.len())
            .map(|len| Self {
                segments: self.segments[..len].to_vec(),
            })
            .collect()
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// Whether `key` can be used as a single path segment.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.contains('/')
        && !key.contains(FORBIDDEN_KEY_CHARS)
        && !key.chars().any(char::is_control)
}

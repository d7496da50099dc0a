//! Source positions for diagnostics.
//!
//! Every user-derived entity carries a [`Location`]; synthesized entities
//! carry an empty one. Locations are metadata: they never participate in
//! comparisons, so two expressions that differ only in position compare
//! equal. That invariant is centralized here by making `Location` compare
//! equal to every other `Location`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A line/column pair, 1-based.
#[derive(Debug, Clone, Copy)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// Optional source file plus start and end positions.
#[derive(Debug, Clone, Default)]
pub struct Location {
    source: Option<String>,
    start: Option<Position>,
    end: Option<Position>,
}

impl Location {
    /// The empty location of synthesized entities.
    pub const NONE: Location = Location {
        source: None,
        start: None,
        end: None,
    };

    /// Create a location with a start position and no source file.
    pub fn new(line: u32, column: u32) -> Self {
        Location {
            source: None,
            start: Some(Position { line, column }),
            end: None,
        }
    }

    /// Attach a source file name.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attach an end position.
    pub fn with_end(mut self, line: u32, column: u32) -> Self {
        self.end = Some(Position { line, column });
        self
    }

    /// Whether this location points anywhere.
    pub fn is_present(&self) -> bool {
        self.start.is_some()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn start(&self) -> Option<Position> {
        self.start
    }

    pub fn end(&self) -> Option<Position> {
        self.end
    }

    /// Prefer this location, falling back to `other` when empty.
    pub fn or(&self, other: &Location) -> Location {
        if self.is_present() {
            self.clone()
        } else {
            other.clone()
        }
    }
}

// Positions are diagnostic metadata only. All locations compare equal so
// that structural equality of identifiers, links, and expressions is
// position-independent.
impl PartialEq for Location {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Eq for Location {}

impl PartialOrd for Location {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Location {
    fn cmp(&self, _: &Self) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for Location {
    fn hash<H: Hasher>(&self, _: &mut H) {}
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(start) => write!(
                f,
                "{}:{}:{}",
                self.source.as_deref().unwrap_or("<stdin>"),
                start.line,
                start.column
            ),
            None => Ok(()),
        }
    }
}

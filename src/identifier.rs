//! Qualified identifiers.
//!
//! An identifier is a nonempty sequence of name parts. Top-level
//! declarations carry exactly two parts (package, local name); fields and
//! literals inside a message carry one. Identifiers order alphabetically so
//! diagnostics are stable, and equality is part-wise; the attached location
//! never participates (see [`crate::location`]).

use std::fmt;

use crate::location::Location;

/// Separator between identifier parts in textual form.
pub const SEPARATOR: &str = "::";

/// A qualified name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id {
    parts: Vec<String>,
    location: Location,
}

impl Id {
    /// Create an identifier from name parts. Empty part lists collapse to a
    /// single empty part; callers validate names at the model level.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() {
            parts.push(String::new());
        }
        Id {
            parts,
            location: Location::NONE,
        }
    }

    /// Parse an identifier from its textual form, splitting on `::`.
    pub fn parse(text: &str) -> Self {
        Id::new(text.split(SEPARATOR))
    }

    /// Attach a source location.
    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// The base name: the last part.
    pub fn name(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or("")
    }

    /// The enclosing package: all parts but the last. Empty for single-part
    /// identifiers.
    pub fn package(&self) -> Id {
        if self.parts.len() > 1 {
            Id::new(self.parts[..self.parts.len() - 1].iter().cloned())
        } else {
            Id::new(std::iter::empty::<String>())
        }
    }

    /// Append a child part: `P * name` = `P::name`.
    pub fn join(&self, name: impl Into<String>) -> Id {
        let mut parts = self.parts.clone();
        parts.push(name.into());
        Id {
            parts,
            location: self.location.clone(),
        }
    }

    /// Prepend a string to the first part, preserving the location.
    pub fn prefixed(&self, prefix: &str) -> Id {
        let mut parts = self.parts.clone();
        parts[0] = format!("{}{}", prefix, parts[0]);
        Id {
            parts,
            location: self.location.clone(),
        }
    }

    /// All parts joined with underscores, for generated names.
    pub fn flat(&self) -> String {
        self.parts.join("_")
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join(SEPARATOR))
    }
}

impl From<&str> for Id {
    fn from(text: &str) -> Self {
        Id::parse(text)
    }
}

impl From<String> for Id {
    fn from(text: String) -> Self {
        Id::parse(&text)
    }
}

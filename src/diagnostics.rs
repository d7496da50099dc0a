//! Diagnostic stream and checkpointed error propagation.
//!
//! Model types and verifier phases append entries to a [`Diagnostics`]
//! buffer without raising. At well-defined checkpoints, [`Diagnostics::propagate`]
//! converts a buffer that contains errors into a composite [`ModelError`]
//! carrying every accumulated entry. `Info` entries attach context to the
//! preceding error (e.g. the failing path).

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::location::Location;

/// Severity of a diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// Subsystem that produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    Model,
    Internal,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Model => write!(f, "model"),
            Subsystem::Internal => write!(f, "internal"),
        }
    }
}

/// A single diagnostic entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub message: String,
    pub subsystem: Subsystem,
    pub severity: Severity,
    pub location: Location,
}

impl Entry {
    pub fn new(
        message: impl Into<String>,
        subsystem: Subsystem,
        severity: Severity,
        location: Location,
    ) -> Self {
        Entry {
            message: message.into(),
            subsystem,
            severity,
            location,
        }
    }

    /// A model error entry.
    pub fn error(message: impl Into<String>, location: Location) -> Self {
        Entry::new(message, Subsystem::Model, Severity::Error, location)
    }

    /// A model info entry attaching context to the preceding error.
    pub fn info(message: impl Into<String>, location: Location) -> Self {
        Entry::new(message, Subsystem::Model, Severity::Info, location)
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.location.is_present() {
            write!(f, "{}: ", self.location)?;
        }
        write!(f, "{}: {}: {}", self.subsystem, self.severity, self.message)
    }
}

/// Append-only diagnostic buffer.
///
/// The buffer is owned by a model entity during its validation window and
/// sealed afterwards. Like [`Location`], it is metadata: buffers compare
/// equal so that model-type equality is content-only.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Vec<Entry>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = Entry>) {
        self.entries.extend(entries);
    }

    pub fn append(&mut self, other: &Diagnostics) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any error-severity entry has been recorded.
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.severity == Severity::Error)
    }

    /// Checkpoint: raise the accumulated entries as a composite error if any
    /// error has been recorded. The buffer keeps its entries either way, so
    /// collaborators may catch the error at a message boundary and continue.
    pub fn propagate(&self) -> Result<(), ModelError> {
        if self.has_errors() {
            Err(ModelError {
                entries: self.entries.clone(),
            })
        } else {
            Ok(())
        }
    }
}

impl PartialEq for Diagnostics {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Eq for Diagnostics {}

impl PartialOrd for Diagnostics {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Diagnostics {
    fn cmp(&self, _: &Self) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for Diagnostics {
    fn hash<H: Hasher>(&self, _: &mut H) {}
}

/// Composite error carrying all diagnostic entries accumulated up to a
/// propagation checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelError {
    entries: Vec<Entry>,
}

impl ModelError {
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// The messages of all error-severity entries.
    pub fn error_messages(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.severity == Severity::Error)
            .map(|e| e.message.as_str())
            .collect()
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

impl std::error::Error for ModelError {}

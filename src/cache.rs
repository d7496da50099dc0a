//! Content-addressed cache of verified message fingerprints.
//!
//! The fingerprint covers everything verification depends on (identifier,
//! structure, types, checksums), so membership is a sound reason to skip
//! the proof phases. Persistence is a best-effort JSON file; a missing or
//! unreadable file yields an empty cache.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::message::Message;
use crate::types::TypeDef;

impl Message {
    /// Content hash of the verification-relevant parts of this message.
    pub fn fingerprint(&self) -> String {
        blake3::hash(fingerprint_input(self).as_bytes())
            .to_hex()
            .to_string()
    }
}

fn fingerprint_input(message: &Message) -> String {
    let mut input = String::new();
    input.push_str(&message.identifier().to_string());
    for link in message.structure() {
        input.push_str(&format!(
            "\n{} -> {}: {}",
            link.source, link.target, link
        ));
    }
    for (field, t) in message.types() {
        input.push_str(&format!("\n{} : {}", field, canonical_type(t)));
    }
    for (name, expressions) in message.checksums() {
        input.push_str(&format!("\nchecksum {}:", name));
        for expression in expressions {
            input.push_str(&format!(" {}", expression));
        }
    }
    input
}

fn canonical_type(t: &TypeDef) -> String {
    match t {
        TypeDef::Modular(m) => format!("mod {} is {}", m.id(), m.modulus()),
        TypeDef::Range(r) => format!(
            "range {} is {} .. {} size {}",
            r.id(),
            r.first(),
            r.last(),
            r.size()
        ),
        TypeDef::Enumeration(e) => {
            let literals: Vec<String> = e
                .literals()
                .iter()
                .map(|(l, v)| format!("{} => {}", l, v))
                .collect();
            format!(
                "enum {} is ({}) size {} always_valid {}",
                e.id(),
                literals.join(", "),
                e.size(),
                e.always_valid()
            )
        }
        TypeDef::Opaque(_) => "opaque".to_string(),
        TypeDef::Sequence(s) => {
            format!("sequence {} of {}", s.id(), canonical_type(s.element()))
        }
        TypeDef::Message(m) => format!("message {}", fingerprint_input(m)),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Entries {
    verified: BTreeSet<String>,
}

/// Cache of fingerprints of successfully verified messages.
#[derive(Debug, Default)]
pub struct VerificationCache {
    entries: Entries,
    file: Option<PathBuf>,
}

impl VerificationCache {
    /// An in-memory cache.
    pub fn new() -> Self {
        VerificationCache::default()
    }

    /// A cache backed by a JSON file. The file is read if it exists;
    /// corrupt content is treated as empty.
    pub fn with_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).unwrap_or_else(|error| {
                warn!(%error, "ignoring corrupt verification cache");
                Entries::default()
            })
        } else {
            Entries::default()
        };
        debug!(entries = entries.verified.len(), "verification cache loaded");
        Ok(VerificationCache {
            entries,
            file: Some(path),
        })
    }

    /// Whether this message was verified successfully before.
    pub fn contains(&self, message: &Message) -> bool {
        self.entries.verified.contains(&message.fingerprint())
    }

    /// Record a successful verification. Best-effort persistence: an
    /// unwritable cache file is logged and otherwise ignored.
    pub fn insert(&mut self, message: &Message) {
        self.entries.verified.insert(message.fingerprint());
        if let Some(path) = &self.file {
            let serialized =
                serde_json::to_string_pretty(&self.entries).expect("serializable entries");
            if let Err(error) = fs::write(path, serialized) {
                warn!(%error, "unable to persist verification cache");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.verified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.verified.is_empty()
    }
}

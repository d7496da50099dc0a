//! Wireform: formal specification and verification of binary message
//! formats.
//!
//! The core of the toolchain is a verification engine for message types: a
//! message is a directed acyclic graph of typed fields linked by
//! conditional transitions with size/offset aspects, and verification
//! decides whether the declaration is internally consistent. Every field
//! must be reachable, every path well-formed, every bit accounted for
//! exactly once, and every size expression feasible; the obligations are
//! discharged to an SMT solver through a parallel proof driver.
//!
//! # Structure
//!
//! - [`expr`] — the expression algebra: arithmetic, relational, Boolean,
//!   aggregate, and attribute nodes with substitution and simplification.
//! - [`types`] — scalar and composite model types.
//! - [`message`] — the message graph, its verification phases, and the
//!   merger that inlines message-typed fields.
//! - [`proof`] — proof obligation construction and the parallel driver on
//!   top of the `wireform_smt` solver facade.
//! - [`refinement`] — payload refinements between messages.
//! - [`cache`] — content-addressed cache of verified message fingerprints.
//!
//! The concrete-syntax parser, code generator, state-machine layer, and
//! CLI are separate subsystems; this crate receives pre-identified fields,
//! pre-typed links, and pre-parsed expressions.

pub mod cache;
pub mod diagnostics;
pub mod expr;
pub mod identifier;
pub mod location;
pub mod message;
pub mod proof;
pub mod refinement;
pub mod types;

pub use cache::VerificationCache;
pub use diagnostics::{Diagnostics, Entry, ModelError, Severity, Subsystem};
pub use expr::typing::Ty;
pub use expr::Expr;
pub use identifier::Id;
pub use location::Location;
pub use message::merge::MessageArguments;
pub use message::verify::VerifiedMessage;
pub use message::{ByteOrder, Field, Link, Message};
pub use proof::{Config, Proof, ProofResult, ProofSession};
pub use refinement::Refinement;
pub use types::{
    boolean, Enumeration, ModularInteger, Opaque, RangeInteger, Sequence, TypeDef,
};

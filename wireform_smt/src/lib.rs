//! Wireform SMT Backend
//!
//! Z3-based proof backend for the Wireform verification engine.
//!
//! # Overview
//!
//! This crate discharges the proof obligations produced by the message
//! verifier: satisfiability checks over linear integer arithmetic with
//! uninterpreted constants, with per-obligation timeouts, unsat cores, and
//! maximum-value queries.
//!
//! # Architecture
//!
//! The crate owns a lightweight, plain-data IR ([`SmtExpr`]). The main
//! `wireform` crate translates its expression algebra into this IR before
//! dispatching an obligation, so solver workers never share expression state
//! with the coordinator and this crate never depends on the message model.
//!
//! Constructs without a linear-integer encoding (aggregates, checksum
//! validity) arrive here as uninterpreted constants; the solver reasons about
//! them structurally.

pub mod error;
pub mod ir;
pub mod solver;

pub use error::{SolverError, SolverResult};
pub use ir::{SmtBinOp, SmtExpr, SmtNaryOp, SmtSort};
pub use solver::{Outcome, SatVerdict, Solver};

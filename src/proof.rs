//! Proof obligations and the parallel proof driver.
//!
//! Obligations are built by deep-copying expressions into the plain-data
//! solver IR at submission time, so solver workers never share expression
//! state with the coordinator. A [`ProofSession`] collects obligations into
//! batches (`push` seals a batch), dispatches them to a pool of blocking
//! workers, and folds the results back into the diagnostic stream in
//! submission order, regardless of completion order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use wireform_smt::{SatVerdict, SmtBinOp, SmtExpr, SmtNaryOp, Solver};

use crate::diagnostics::{Diagnostics, Entry};
use crate::expr::Expr;
use crate::location::Location;
use crate::message::{Link, Message};

/// Verification parameters: worker count and per-obligation solver timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of proof workers. One worker yields a strictly sequential
    /// driver with identical semantics.
    pub workers: usize,
    /// Per-obligation solver timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 1,
            timeout_ms: 10_000,
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Result of a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofResult {
    Sat,
    Unsat,
    Unknown,
}

impl From<SatVerdict> for ProofResult {
    fn from(verdict: SatVerdict) -> Self {
        match verdict {
            SatVerdict::Sat => ProofResult::Sat,
            SatVerdict::Unsat => ProofResult::Unsat,
            SatVerdict::Unknown => ProofResult::Unknown,
        }
    }
}

/// Outcome of a single satisfiability check, with the facts of the unsat
/// core as display string and location.
#[derive(Debug, Clone)]
pub struct Proof {
    pub result: ProofResult,
    pub unsatisfied: Vec<(String, Location)>,
}

impl Proof {
    /// Info entries naming the unsatisfied facts.
    pub fn unsatisfied_entries(&self) -> Vec<Entry> {
        self.unsatisfied
            .iter()
            .map(|(fact, location)| {
                Entry::info(format!("unsatisfied \"{}\"", fact), location.clone())
            })
            .collect()
    }
}

/// Check satisfiability of `goal` under `facts`. Encoding failures and
/// solver timeouts yield [`ProofResult::Unknown`] with an explanation.
pub fn prove(goal: &Expr, facts: &[Expr], config: &Config) -> Proof {
    let obligation = match encode_obligation(goal, facts) {
        Ok(o) => o,
        Err(explanation) => {
            return Proof {
                result: ProofResult::Unknown,
                unsatisfied: vec![(explanation, goal.location())],
            }
        }
    };
    run_obligation(&obligation, &Solver::new(config.timeout()))
}

/// A goal plus facts in solver form, with fact metadata for unsat cores.
struct EncodedObligation {
    goal: SmtExpr,
    facts: Vec<SmtExpr>,
    fact_meta: Vec<(String, Location)>,
}

fn encode_obligation(goal: &Expr, facts: &[Expr]) -> Result<EncodedObligation, String> {
    let goal_simplified = goal.simplified();
    let mut encoded_facts = Vec::with_capacity(facts.len());
    let mut fact_meta = Vec::with_capacity(facts.len());
    for fact in facts {
        let simplified = fact.simplified();
        encoded_facts.push(encode_bool(&simplified)?);
        fact_meta.push((fact.to_string(), fact.location()));
    }
    Ok(EncodedObligation {
        goal: encode_bool(&goal_simplified)?,
        facts: encoded_facts,
        fact_meta,
    })
}

fn run_obligation(obligation: &EncodedObligation, solver: &Solver) -> Proof {
    match solver.check(&obligation.goal, &obligation.facts) {
        Ok(outcome) => Proof {
            result: outcome.verdict.into(),
            unsatisfied: outcome
                .unsat_core
                .iter()
                .filter_map(|i| obligation.fact_meta.get(*i).cloned())
                .collect(),
        },
        Err(error) => Proof {
            result: ProofResult::Unknown,
            unsatisfied: vec![(error.to_string(), Location::NONE)],
        },
    }
}

// Expression encoding. Constructs without a linear-integer image (aggregate
// and string literals, checksum validity) become uninterpreted constants
// named by their canonical display form.

fn is_boolean(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::True
            | Expr::False
            | Expr::And(_)
            | Expr::Or(_)
            | Expr::Not(_)
            | Expr::Equal(_)
            | Expr::NotEqual(_)
            | Expr::Less(_)
            | Expr::LessEqual(_)
            | Expr::Greater(_)
            | Expr::GreaterEqual(_)
            | Expr::In(_)
            | Expr::NotIn(_)
            | Expr::ValidChecksum(_)
    )
}

fn encode_bool(expr: &Expr) -> Result<SmtExpr, String> {
    match expr {
        Expr::True => Ok(SmtExpr::Bool(true)),
        Expr::False => Ok(SmtExpr::Bool(false)),
        Expr::Variable(v) => Ok(SmtExpr::bool_var(v.id.to_string())),
        Expr::ValidChecksum(_) => Ok(SmtExpr::bool_var(expr.to_string())),

        Expr::And(n) => Ok(SmtExpr::and(
            n.terms.iter().map(encode_bool).collect::<Result<_, _>>()?,
        )),
        Expr::Or(n) => Ok(SmtExpr::or(
            n.terms.iter().map(encode_bool).collect::<Result<_, _>>()?,
        )),
        Expr::Not(e) => Ok(SmtExpr::not(encode_bool(e)?)),

        Expr::Equal(b) => encode_equality(b, false),
        Expr::NotEqual(b) => encode_equality(b, true),

        Expr::Less(b) => encode_comparison(b, SmtBinOp::Lt),
        Expr::LessEqual(b) => encode_comparison(b, SmtBinOp::Le),
        Expr::Greater(b) => encode_comparison(b, SmtBinOp::Gt),
        Expr::GreaterEqual(b) => encode_comparison(b, SmtBinOp::Ge),

        Expr::In(b) => encode_membership(b, false),
        Expr::NotIn(b) => encode_membership(b, true),

        other => Err(format!(
            "expression \"{}\" is not a boolean formula",
            other
        )),
    }
}

fn encode_equality(b: &crate::expr::Binary, negated: bool) -> Result<SmtExpr, String> {
    let boolean_operands = is_boolean(&b.left) || is_boolean(&b.right);
    let (left, right) = if boolean_operands {
        (encode_bool(&b.left)?, encode_bool(&b.right)?)
    } else {
        (encode_int(&b.left)?, encode_int(&b.right)?)
    };
    let op = if negated { SmtBinOp::Neq } else { SmtBinOp::Eq };
    Ok(SmtExpr::binary(op, left, right))
}

fn encode_comparison(b: &crate::expr::Binary, op: SmtBinOp) -> Result<SmtExpr, String> {
    Ok(SmtExpr::binary(
        op,
        encode_int(&b.left)?,
        encode_int(&b.right)?,
    ))
}

fn encode_membership(b: &crate::expr::Binary, negated: bool) -> Result<SmtExpr, String> {
    let value = encode_int(&b.left)?;
    let range = match &*b.right {
        Expr::ValueRange(r) => SmtExpr::and(vec![
            SmtExpr::binary(SmtBinOp::Ge, value.clone(), encode_int(&r.lower)?),
            SmtExpr::binary(SmtBinOp::Le, value, encode_int(&r.upper)?),
        ]),
        other => {
            return Err(format!(
                "unsupported membership test against \"{}\"",
                other
            ))
        }
    };
    Ok(if negated {
        SmtExpr::not(range)
    } else {
        range
    })
}

fn encode_int(expr: &Expr) -> Result<SmtExpr, String> {
    match expr {
        Expr::Number(n) => Ok(SmtExpr::int(n.value)),
        Expr::Variable(v) => Ok(SmtExpr::int_var(v.id.to_string())),
        Expr::First(_) | Expr::Last(_) | Expr::Size(_) => {
            Ok(SmtExpr::int_var(expr.to_string()))
        }
        // Uninterpreted constants: structural identity by display form.
        Expr::Aggregate(_) | Expr::String(_) => Ok(SmtExpr::int_var(expr.to_string())),

        Expr::Neg(e) => Ok(SmtExpr::Neg(Box::new(encode_int(e)?))),
        Expr::Add(n) => Ok(SmtExpr::nary(
            SmtNaryOp::Add,
            n.terms.iter().map(encode_int).collect::<Result<_, _>>()?,
        )),
        Expr::Mul(n) => Ok(SmtExpr::nary(
            SmtNaryOp::Mul,
            n.terms.iter().map(encode_int).collect::<Result<_, _>>()?,
        )),
        Expr::Sub(b) => Ok(SmtExpr::binary(
            SmtBinOp::Sub,
            encode_int(&b.left)?,
            encode_int(&b.right)?,
        )),
        Expr::Div(b) => Ok(SmtExpr::binary(
            SmtBinOp::Div,
            encode_int(&b.left)?,
            encode_int(&b.right)?,
        )),
        Expr::Mod(b) => Ok(SmtExpr::binary(
            SmtBinOp::Mod,
            encode_int(&b.left)?,
            encode_int(&b.right)?,
        )),

        // Simplification folds constant exponents; a small constant
        // exponent over a symbolic base expands to a product.
        Expr::Pow(b) => match b.right.as_number() {
            Some(exponent) if (0..=64).contains(&exponent) => {
                let base = encode_int(&b.left)?;
                if exponent == 0 {
                    return Ok(SmtExpr::int(1));
                }
                Ok(SmtExpr::nary(
                    SmtNaryOp::Mul,
                    std::iter::repeat(base).take(exponent as usize).collect(),
                ))
            }
            _ => Err(format!(
                "unsupported exponentiation \"{}\" in solver input",
                expr
            )),
        },

        other => Err(format!(
            "expression \"{}\" is not an integer term",
            other
        )),
    }
}

// Obligation facts for a link on a path (spec'd positions of the target
// field plus the global message facts and the link condition).

impl Message {
    /// Where the target field of every link on a path starts, ends, and how
    /// large it is, as equational facts, together with the global message
    /// facts and the conjunctive terms of the link condition.
    ///
    /// With `ignore_implicit_sizes`, size and last equations referring to
    /// the message end are elided; used when summing fixed field sizes.
    pub(crate) fn link_facts(
        &self,
        link: &Link,
        ignore_implicit_sizes: bool,
    ) -> Result<Vec<Expr>, crate::diagnostics::ModelError> {
        let name = link.target.id().clone();
        let target_first = self.target_first(link);
        let target_size = self.target_size(link)?;
        let target_last = self.target_last(link)?;

        let implicit = target_size.contains(&Expr::size("Message"))
            || target_size.contains(&Expr::last("Message"));

        let mut facts = vec![Expr::equal(Expr::first(name.clone()), target_first)];
        if !(ignore_implicit_sizes && implicit) {
            facts.push(Expr::equal(Expr::size(name.clone()), target_size));
            facts.push(Expr::equal(Expr::last(name.clone()), target_last));
        }
        facts.push(Expr::greater_equal(Expr::first("Message"), Expr::number(0)));
        facts.push(Expr::greater_equal(
            Expr::last("Message"),
            Expr::last(name),
        ));
        facts.push(Expr::greater_equal(
            Expr::last("Message"),
            Expr::first("Message"),
        ));
        facts.push(Expr::equal(
            Expr::size("Message"),
            Expr::add(vec![
                Expr::sub(Expr::last("Message"), Expr::first("Message")),
                Expr::number(1),
            ]),
        ));
        facts.extend(link.condition.conjuncts());
        Ok(facts)
    }

    /// All link facts along a path.
    pub(crate) fn path_facts(
        &self,
        path: &[Link],
        ignore_implicit_sizes: bool,
    ) -> Result<Vec<Expr>, crate::diagnostics::ModelError> {
        let mut facts = Vec::new();
        for link in path {
            facts.extend(self.link_facts(link, ignore_implicit_sizes)?);
        }
        Ok(facts)
    }
}

/// Maximum value of `target` under `facts`, or `None` when unbounded or
/// unsatisfiable.
pub fn maximum(target: &Expr, facts: &[Expr], config: &Config) -> Option<i128> {
    let encoded_target = encode_int(&target.simplified()).ok()?;
    let encoded_facts: Result<Vec<SmtExpr>, String> =
        facts.iter().map(|f| encode_bool(&f.simplified())).collect();
    Solver::new(config.timeout())
        .maximum(&encoded_target, &encoded_facts.ok()?)
        .ok()
        .flatten()
}

/// An obligation in a proof session.
struct Obligation {
    index: usize,
    encoded: Result<EncodedObligation, String>,
    goal_location: Location,
    expected: ProofResult,
    /// Report when the result *matches* the expected result instead of when
    /// it differs (used for "must be unsatisfiable together" obligations
    /// phrased positively).
    negate: bool,
    /// Attach the unsat core to the report.
    add_unsat: bool,
    error: Vec<Entry>,
}

/// Batched parallel proof driver.
///
/// Obligations accumulate between calls to [`ProofSession::push`]; `check`
/// dispatches every batch to the worker pool and emits the diagnostics of
/// failed obligations in submission order. Workers check the abort flag
/// between obligations.
pub struct ProofSession {
    config: Config,
    current: Vec<Obligation>,
    batches: Vec<Obligation>,
    next_index: usize,
    abort: Arc<AtomicBool>,
}

impl ProofSession {
    pub fn new(config: &Config) -> Self {
        ProofSession {
            config: config.clone(),
            current: Vec::new(),
            batches: Vec::new(),
            next_index: 0,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle for aborting the session from the coordinator.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Add an obligation to the current batch. `error` is the diagnostic
    /// template emitted if the obligation fails.
    pub fn add(
        &mut self,
        goal: &Expr,
        facts: &[Expr],
        expected: ProofResult,
        error: Vec<Entry>,
        negate: bool,
        add_unsat: bool,
    ) {
        let obligation = Obligation {
            index: self.next_index,
            encoded: encode_obligation(goal, facts),
            goal_location: goal.location(),
            expected,
            negate,
            add_unsat,
            error,
        };
        self.next_index += 1;
        self.current.push(obligation);
    }

    /// Seal the current batch.
    pub fn push(&mut self) {
        self.batches.append(&mut self.current);
    }

    /// Dispatch all collected obligations and append the diagnostics of
    /// failed ones, in submission order.
    pub fn check(&mut self, diagnostics: &mut Diagnostics) {
        self.push();
        let obligations = std::mem::take(&mut self.batches);
        if obligations.is_empty() {
            return;
        }

        let workers = self.config.workers.max(1).min(obligations.len());
        debug!(
            obligations = obligations.len(),
            workers, "dispatching proof obligations"
        );

        let queue: Mutex<VecDeque<usize>> =
            Mutex::new((0..obligations.len()).collect());
        let (sender, receiver) = mpsc::channel::<(usize, Proof)>();
        let timeout = self.config.timeout();
        let abort = &self.abort;

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let sender = sender.clone();
                let queue = &queue;
                let obligations = &obligations;
                scope.spawn(move || {
                    let solver = Solver::new(timeout);
                    loop {
                        if abort.load(Ordering::Relaxed) {
                            break;
                        }
                        let index = match queue.lock().expect("queue poisoned").pop_front() {
                            Some(i) => i,
                            None => break,
                        };
                        let obligation = &obligations[index];
                        let proof = match &obligation.encoded {
                            Ok(encoded) => run_obligation(encoded, &solver),
                            Err(explanation) => Proof {
                                result: ProofResult::Unknown,
                                unsatisfied: vec![(
                                    explanation.clone(),
                                    obligation.goal_location.clone(),
                                )],
                            },
                        };
                        trace!(index, result = ?proof.result, "obligation checked");
                        if sender.send((index, proof)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(sender);

            let mut results: Vec<Option<Proof>> = vec![None; obligations.len()];
            for (index, proof) in receiver {
                results[index] = Some(proof);
            }

            for (obligation, proof) in obligations.iter().zip(results) {
                let proof = match proof {
                    Some(p) => p,
                    None => continue,
                };
                self.report(obligation, &proof, diagnostics);
            }
        });
    }

    fn report(&self, obligation: &Obligation, proof: &Proof, diagnostics: &mut Diagnostics) {
        if proof.result == ProofResult::Unknown {
            diagnostics.extend(obligation.error.iter().cloned());
            for (explanation, location) in &proof.unsatisfied {
                diagnostics.push(Entry::info(
                    format!("proof result unknown: {}", explanation),
                    location.clone(),
                ));
            }
            return;
        }

        let failed = if obligation.negate {
            proof.result == obligation.expected
        } else {
            proof.result != obligation.expected
        };
        if !failed {
            return;
        }

        diagnostics.extend(obligation.error.iter().cloned());
        if obligation.add_unsat {
            diagnostics.extend(proof.unsatisfied_entries());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn trivial_facts_are_sat() {
        let proof = prove(
            &Expr::True,
            &[Expr::equal(Expr::var("X"), Expr::number(1))],
            &config(),
        );
        assert_eq!(proof.result, ProofResult::Sat);
        assert!(proof.unsatisfied.is_empty());
    }

    #[test]
    fn contradiction_reports_core() {
        let facts = vec![
            Expr::equal(Expr::var("X"), Expr::number(1)),
            Expr::equal(Expr::var("X"), Expr::number(2)),
        ];
        let proof = prove(&Expr::True, &facts, &config());
        assert_eq!(proof.result, ProofResult::Unsat);
        assert!(!proof.unsatisfied.is_empty());
        let entries = proof.unsatisfied_entries();
        assert!(entries
            .iter()
            .any(|e| e.message.contains("unsatisfied \"X = 1\"")
                || e.message.contains("unsatisfied \"X = 2\"")));
    }

    #[test]
    fn attributes_become_solver_variables() {
        let facts = vec![
            Expr::equal(Expr::first("F"), Expr::number(1)),
            Expr::equal(Expr::size("F"), Expr::number(8)),
            Expr::equal(
                Expr::last("F"),
                Expr::sub(
                    Expr::add(vec![Expr::first("F"), Expr::size("F")]),
                    Expr::number(1),
                ),
            ),
            Expr::not_equal(Expr::last("F"), Expr::number(8)),
        ];
        let proof = prove(&Expr::True, &facts, &config());
        assert_eq!(proof.result, ProofResult::Unsat);
    }

    #[test]
    fn membership_encodes_as_bounds() {
        let goal = Expr::in_range(
            Expr::var("X"),
            Expr::value_range(Expr::number(1), Expr::number(8)),
        );
        let facts = vec![Expr::equal(Expr::var("X"), Expr::number(9))];
        let proof = prove(&goal, &facts, &config());
        assert_eq!(proof.result, ProofResult::Unsat);
    }

    #[test]
    fn aggregates_are_uninterpreted_but_consistent() {
        // The same aggregate maps to the same constant, so equating a
        // variable with it twice is consistent.
        let facts = vec![
            Expr::equal(
                Expr::var("F"),
                Expr::aggregate(vec![Expr::number(1), Expr::number(2)]),
            ),
            Expr::equal(
                Expr::var("F"),
                Expr::aggregate(vec![Expr::number(1), Expr::number(2)]),
            ),
        ];
        assert_eq!(prove(&Expr::True, &facts, &config()).result, ProofResult::Sat);
    }

    #[test]
    fn symbolic_pow_with_constant_exponent_expands() {
        let goal = Expr::equal(
            Expr::pow(Expr::var("X"), Expr::number(2)),
            Expr::number(9),
        );
        let facts = vec![Expr::equal(Expr::var("X"), Expr::number(3))];
        assert_eq!(prove(&goal, &facts, &config()).result, ProofResult::Sat);
    }

    #[test]
    fn valid_checksum_is_uninterpreted_boolean() {
        let facts = vec![
            Expr::valid_checksum("C"),
            Expr::not(Expr::valid_checksum("C")),
        ];
        assert_eq!(
            prove(&Expr::True, &facts, &config()).result,
            ProofResult::Unsat
        );
    }

    #[test]
    fn maximum_query() {
        let facts = vec![
            Expr::greater_equal(Expr::var("X"), Expr::number(0)),
            Expr::less_equal(Expr::var("X"), Expr::number(200)),
        ];
        assert_eq!(maximum(&Expr::var("X"), &facts, &config()), Some(200));
    }

    #[test]
    fn session_reports_in_submission_order() {
        let mut session = ProofSession::new(&Config {
            workers: 4,
            timeout_ms: 10_000,
        });
        // Obligation 0: expected UNSAT but SAT -> fails.
        session.add(
            &Expr::equal(Expr::var("A"), Expr::number(1)),
            &[],
            ProofResult::Unsat,
            vec![Entry::error("first failure", Location::NONE)],
            false,
            false,
        );
        session.push();
        // Obligation 1: expected SAT and SAT -> passes.
        session.add(
            &Expr::equal(Expr::var("B"), Expr::number(1)),
            &[],
            ProofResult::Sat,
            vec![Entry::error("should not appear", Location::NONE)],
            false,
            false,
        );
        // Obligation 2: negate with expected SAT; goal is SAT -> fails.
        session.add(
            &Expr::equal(Expr::var("C"), Expr::number(1)),
            &[],
            ProofResult::Sat,
            vec![Entry::error("second failure", Location::NONE)],
            true,
            false,
        );
        session.push();

        let mut diagnostics = Diagnostics::new();
        session.check(&mut diagnostics);
        let messages: Vec<&str> = diagnostics
            .entries()
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(messages, vec!["first failure", "second failure"]);
    }

    #[test]
    fn single_worker_is_equivalent(){
        let run = |workers: usize| {
            let mut session = ProofSession::new(&Config {
                workers,
                timeout_ms: 10_000,
            });
            for i in 0..6 {
                let expected = if i % 2 == 0 {
                    ProofResult::Unsat
                } else {
                    ProofResult::Sat
                };
                session.add(
                    &Expr::equal(Expr::var(format!("V{}", i).as_str()), Expr::number(1)),
                    &[],
                    expected,
                    vec![Entry::error(format!("obligation {}", i), Location::NONE)],
                    false,
                    false,
                );
            }
            let mut diagnostics = Diagnostics::new();
            session.check(&mut diagnostics);
            diagnostics
                .entries()
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(1), run(4));
    }

    #[test]
    fn unknown_counts_as_failure() {
        let mut session = ProofSession::new(&config());
        // An undefined sentinel cannot be encoded; the obligation must fail
        // with an explanatory diagnostic even though expected is SAT.
        session.add(
            &Expr::Undefined,
            &[],
            ProofResult::Sat,
            vec![Entry::error("encode failure", Location::NONE)],
            false,
            false,
        );
        let mut diagnostics = Diagnostics::new();
        session.check(&mut diagnostics);
        assert!(diagnostics.has_errors());
        assert!(diagnostics
            .entries()
            .iter()
            .any(|e| e.message.contains("proof result unknown")));
    }
}

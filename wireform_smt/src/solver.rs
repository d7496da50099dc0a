//! Z3 solver facade.
//!
//! Each check runs on a fresh context and solver configured with the
//! per-obligation timeout. Facts are asserted with tracking literals so that
//! an UNSAT result yields the indices of the facts in the unsat core; the
//! caller maps those back to source expressions and locations.

use std::time::Duration;

use tracing::trace;
use z3::ast::{Ast, Bool, Int};
use z3::{Config, Context, SatResult};

use crate::error::{SolverError, SolverResult};
use crate::ir::{SmtBinOp, SmtExpr, SmtNaryOp};

/// Verdict of a satisfiability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatVerdict {
    Sat,
    Unsat,
    /// Timeout or undecidable fragment.
    Unknown,
}

/// Result of a satisfiability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub verdict: SatVerdict,
    /// Indices into the fact list of the assertions in the unsat core.
    /// Empty unless the verdict is [`SatVerdict::Unsat`].
    pub unsat_core: Vec<usize>,
}

/// The Z3-backed satisfiability checker.
pub struct Solver {
    timeout: Duration,
}

impl Solver {
    /// Create a solver with the given per-check timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn config(&self) -> Config {
        let mut cfg = Config::new();
        cfg.set_param_value("timeout", &self.timeout.as_millis().to_string());
        cfg
    }

    /// Check satisfiability of `goal` together with `facts`.
    ///
    /// The goal is asserted untracked; every fact is asserted under a fresh
    /// tracking literal so the unsat core can be reported by index.
    pub fn check(&self, goal: &SmtExpr, facts: &[SmtExpr]) -> SolverResult<Outcome> {
        let cfg = self.config();
        let ctx = Context::new(&cfg);
        let solver = z3::Solver::new(&ctx);

        solver.assert(&encode_bool(&ctx, goal)?);

        let mut trackers: Vec<Bool<'_>> = Vec::with_capacity(facts.len());
        for (i, fact) in facts.iter().enumerate() {
            let tracker = Bool::new_const(&ctx, format!("fact#{}", i));
            solver.assert_and_track(&encode_bool(&ctx, fact)?, &tracker);
            trackers.push(tracker);
        }

        let verdict = match solver.check() {
            SatResult::Sat => SatVerdict::Sat,
            SatResult::Unsat => SatVerdict::Unsat,
            SatResult::Unknown => SatVerdict::Unknown,
        };
        trace!(?verdict, facts = facts.len(), "solver check");

        let unsat_core = if verdict == SatVerdict::Unsat {
            solver
                .get_unsat_core()
                .iter()
                .filter_map(|c| trackers.iter().position(|t| t == c))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Outcome {
            verdict,
            unsat_core,
        })
    }

    /// Maximum value of `target` under `facts`, or `None` if the facts are
    /// unsatisfiable, the optimum is unbounded, or the solver gives up.
    pub fn maximum(&self, target: &SmtExpr, facts: &[SmtExpr]) -> SolverResult<Option<i128>> {
        let cfg = self.config();
        let ctx = Context::new(&cfg);
        let optimize = z3::Optimize::new(&ctx);

        for fact in facts {
            optimize.assert(&encode_bool(&ctx, fact)?);
        }
        let target_ast = encode_int(&ctx, target)?;
        optimize.maximize(&target_ast);

        match optimize.check(&[]) {
            SatResult::Sat => {
                let model = optimize
                    .get_model()
                    .ok_or_else(|| SolverError::backend("optimum without model"))?;
                Ok(model
                    .eval(&target_ast, true)
                    .and_then(|v| v.as_i64())
                    .map(i128::from))
            }
            SatResult::Unsat | SatResult::Unknown => Ok(None),
        }
    }
}

enum Term<'ctx> {
    Int(Int<'ctx>),
    Bool(Bool<'ctx>),
}

impl<'ctx> Term<'ctx> {
    fn into_int(self, operator: &str) -> SolverResult<Int<'ctx>> {
        match self {
            Term::Int(i) => Ok(i),
            Term::Bool(_) => Err(SolverError::sort_mismatch(operator, "Int")),
        }
    }

    fn into_bool(self, operator: &str) -> SolverResult<Bool<'ctx>> {
        match self {
            Term::Bool(b) => Ok(b),
            Term::Int(_) => Err(SolverError::sort_mismatch(operator, "Bool")),
        }
    }
}

fn encode_bool<'ctx>(ctx: &'ctx Context, expr: &SmtExpr) -> SolverResult<Bool<'ctx>> {
    match encode(ctx, expr)? {
        Term::Bool(b) => Ok(b),
        Term::Int(_) => Err(SolverError::sort_mismatch("assertion", "Bool")),
    }
}

fn encode_int<'ctx>(ctx: &'ctx Context, expr: &SmtExpr) -> SolverResult<Int<'ctx>> {
    match encode(ctx, expr)? {
        Term::Int(i) => Ok(i),
        Term::Bool(_) => Err(SolverError::sort_mismatch("arithmetic term", "Int")),
    }
}

fn encode<'ctx>(ctx: &'ctx Context, expr: &SmtExpr) -> SolverResult<Term<'ctx>> {
    match expr {
        SmtExpr::Int(value) => Ok(Term::Int(int_const(ctx, *value))),
        SmtExpr::Bool(value) => Ok(Term::Bool(Bool::from_bool(ctx, *value))),
        SmtExpr::IntVar(name) => Ok(Term::Int(Int::new_const(ctx, name.as_str()))),
        SmtExpr::BoolVar(name) => Ok(Term::Bool(Bool::new_const(ctx, name.as_str()))),

        SmtExpr::Neg(operand) => {
            let i = encode(ctx, operand)?.into_int("negation")?;
            Ok(Term::Int(i.unary_minus()))
        }

        SmtExpr::Not(operand) => {
            let b = encode(ctx, operand)?.into_bool("logical negation")?;
            Ok(Term::Bool(b.not()))
        }

        SmtExpr::Binary { op, left, right } => {
            let l = encode(ctx, left)?;
            let r = encode(ctx, right)?;
            encode_binary(ctx, *op, l, r)
        }

        SmtExpr::Nary { op, terms } => encode_nary(ctx, *op, terms),
    }
}

fn encode_binary<'ctx>(
    ctx: &'ctx Context,
    op: SmtBinOp,
    left: Term<'ctx>,
    right: Term<'ctx>,
) -> SolverResult<Term<'ctx>> {
    match op {
        SmtBinOp::Sub => Ok(Term::Int(Int::sub(
            ctx,
            &[
                &left.into_int("subtraction")?,
                &right.into_int("subtraction")?,
            ],
        ))),
        SmtBinOp::Div => Ok(Term::Int(
            left.into_int("division")?.div(&right.into_int("division")?),
        )),
        SmtBinOp::Mod => Ok(Term::Int(
            left.into_int("modulo")?.modulo(&right.into_int("modulo")?),
        )),

        SmtBinOp::Eq | SmtBinOp::Neq => {
            let equality = match (left, right) {
                (Term::Int(l), Term::Int(r)) => l._eq(&r),
                (Term::Bool(l), Term::Bool(r)) => l._eq(&r),
                _ => return Err(SolverError::sort_mismatch("equality", "matching sorts")),
            };
            Ok(Term::Bool(if op == SmtBinOp::Neq {
                equality.not()
            } else {
                equality
            }))
        }

        SmtBinOp::Lt => Ok(Term::Bool(
            left.into_int("comparison")?.lt(&right.into_int("comparison")?),
        )),
        SmtBinOp::Le => Ok(Term::Bool(
            left.into_int("comparison")?.le(&right.into_int("comparison")?),
        )),
        SmtBinOp::Gt => Ok(Term::Bool(
            left.into_int("comparison")?.gt(&right.into_int("comparison")?),
        )),
        SmtBinOp::Ge => Ok(Term::Bool(
            left.into_int("comparison")?.ge(&right.into_int("comparison")?),
        )),

        SmtBinOp::Implies => Ok(Term::Bool(
            left.into_bool("implication")?
                .implies(&right.into_bool("implication")?),
        )),
    }
}

fn encode_nary<'ctx>(
    ctx: &'ctx Context,
    op: SmtNaryOp,
    terms: &[SmtExpr],
) -> SolverResult<Term<'ctx>> {
    match op {
        SmtNaryOp::Add | SmtNaryOp::Mul => {
            let mut encoded = Vec::with_capacity(terms.len());
            for term in terms {
                encoded.push(encode(ctx, term)?.into_int("arithmetic")?);
            }
            let refs: Vec<&Int<'ctx>> = encoded.iter().collect();
            Ok(Term::Int(match op {
                SmtNaryOp::Add => Int::add(ctx, &refs),
                _ => Int::mul(ctx, &refs),
            }))
        }
        SmtNaryOp::And | SmtNaryOp::Or => {
            let mut encoded = Vec::with_capacity(terms.len());
            for term in terms {
                encoded.push(encode(ctx, term)?.into_bool("boolean operation")?);
            }
            let refs: Vec<&Bool<'ctx>> = encoded.iter().collect();
            Ok(Term::Bool(match op {
                SmtNaryOp::And => Bool::and(ctx, &refs),
                _ => Bool::or(ctx, &refs),
            }))
        }
    }
}

/// Encode an `i128` constant. Values outside the `i64` range are decomposed
/// into base-2**32 digits so that 2**64 range bounds encode exactly.
fn int_const<'ctx>(ctx: &'ctx Context, value: i128) -> Int<'ctx> {
    if let Ok(v) = i64::try_from(value) {
        return Int::from_i64(ctx, v);
    }

    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut digits: Vec<u64> = Vec::new();
    while magnitude > 0 {
        digits.push((magnitude & 0xFFFF_FFFF) as u64);
        magnitude >>= 32;
    }

    let radix = Int::from_u64(ctx, 1 << 32);
    let mut result = Int::from_u64(ctx, 0);
    for digit in digits.iter().rev() {
        result = Int::add(
            ctx,
            &[&Int::mul(ctx, &[&result, &radix]), &Int::from_u64(ctx, *digit)],
        );
    }
    if negative {
        result.unary_minus()
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::SmtExpr as E;

    fn solver() -> Solver {
        Solver::new(Duration::from_secs(10))
    }

    #[test]
    fn tautology_is_sat() {
        let outcome = solver().check(&E::Bool(true), &[]).unwrap();
        assert_eq!(outcome.verdict, SatVerdict::Sat);
    }

    #[test]
    fn contradiction_is_unsat() {
        let x = E::int_var("x");
        let facts = vec![
            E::eq(x.clone(), E::int(1)),
            E::eq(x, E::int(2)),
        ];
        let outcome = solver().check(&E::Bool(true), &facts).unwrap();
        assert_eq!(outcome.verdict, SatVerdict::Unsat);
        assert!(!outcome.unsat_core.is_empty());
    }

    #[test]
    fn unsat_core_points_at_conflicting_facts() {
        let x = E::int_var("x");
        let facts = vec![
            E::binary(SmtBinOp::Ge, E::int_var("unrelated"), E::int(0)),
            E::eq(x.clone(), E::int(1)),
            E::eq(x, E::int(2)),
        ];
        let outcome = solver().check(&E::Bool(true), &facts).unwrap();
        assert_eq!(outcome.verdict, SatVerdict::Unsat);
        assert!(outcome.unsat_core.contains(&1));
        assert!(outcome.unsat_core.contains(&2));
        assert!(!outcome.unsat_core.contains(&0));
    }

    #[test]
    fn large_constants_encode_exactly() {
        // x < 2**64 and x > 2**64 - 2 forces x = 2**64 - 1
        let x = E::int_var("x");
        let limit: i128 = 1 << 64;
        let facts = vec![
            E::binary(SmtBinOp::Lt, x.clone(), E::int(limit)),
            E::binary(SmtBinOp::Gt, x.clone(), E::int(limit - 2)),
            E::binary(SmtBinOp::Neq, x, E::int(limit - 1)),
        ];
        let outcome = solver().check(&E::Bool(true), &facts).unwrap();
        assert_eq!(outcome.verdict, SatVerdict::Unsat);
    }

    #[test]
    fn maximum_of_bounded_variable() {
        let x = E::int_var("x");
        let facts = vec![
            E::binary(SmtBinOp::Ge, x.clone(), E::int(0)),
            E::binary(SmtBinOp::Le, x.clone(), E::int(41)),
        ];
        let max = solver().maximum(&x, &facts).unwrap();
        assert_eq!(max, Some(41));
    }

    #[test]
    fn maximum_of_unsatisfiable_facts_is_none() {
        let x = E::int_var("x");
        let facts = vec![
            E::binary(SmtBinOp::Ge, x.clone(), E::int(1)),
            E::binary(SmtBinOp::Le, x.clone(), E::int(0)),
        ];
        assert_eq!(solver().maximum(&x, &facts).unwrap(), None);
    }

    #[test]
    fn boolean_equality_is_iff() {
        let p = E::bool_var("p");
        let q = E::bool_var("q");
        let facts = vec![
            E::eq(p.clone(), q.clone()),
            p,
            E::not(q),
        ];
        let outcome = solver().check(&E::Bool(true), &facts).unwrap();
        assert_eq!(outcome.verdict, SatVerdict::Unsat);
    }

    #[test]
    fn sort_mismatch_is_reported() {
        let bad = E::eq(E::int_var("x"), E::bool_var("p"));
        assert!(solver().check(&bad, &[]).is_err());
    }
}

//! Expression simplification.
//!
//! Bottom-up rewriting: constant folding over exact `i128` arithmetic,
//! flattening of associative operators, removal of neutral `True`/`False`
//! terms, and canonical operand ordering for commutative operators.
//! Arithmetic that would overflow is left unfolded.
//!
//! The result is a fixpoint: `e.simplified().simplified() == e.simplified()`.

use super::{Binary, Expr, Nary, Range};

impl Expr {
    /// Return the simplified form of this expression.
    pub fn simplified(&self) -> Expr {
        match self {
            Expr::Undefined
            | Expr::True
            | Expr::False
            | Expr::Number(_)
            | Expr::String(_)
            | Expr::Variable(_)
            | Expr::First(_)
            | Expr::Last(_)
            | Expr::Size(_)
            | Expr::ValidChecksum(_) => self.clone(),

            Expr::Aggregate(a) => Expr::Aggregate(super::Aggregate {
                elements: a.elements.iter().map(Expr::simplified).collect(),
                location: a.location.clone(),
            }),

            Expr::Neg(e) => match e.simplified() {
                Expr::Number(n) => Expr::number(-n.value),
                Expr::Neg(inner) => *inner,
                other => Expr::Neg(Box::new(other)),
            },

            Expr::Add(n) => simplify_sum(n),
            Expr::Mul(n) => simplify_product(n),

            Expr::Sub(b) => {
                let left = b.left.simplified();
                let right = b.right.simplified();
                match (&left, &right) {
                    (Expr::Number(l), Expr::Number(r)) => {
                        match l.value.checked_sub(r.value) {
                            Some(v) => Expr::number(v),
                            None => rebuild(b, left.clone(), right.clone(), Expr::Sub),
                        }
                    }
                    (_, Expr::Number(r)) if r.value == 0 => left,
                    _ => rebuild(b, left, right, Expr::Sub),
                }
            }

            Expr::Div(b) => {
                let left = b.left.simplified();
                let right = b.right.simplified();
                match (&left, &right) {
                    (Expr::Number(l), Expr::Number(r))
                        if r.value != 0 && l.value % r.value == 0 =>
                    {
                        Expr::number(l.value / r.value)
                    }
                    _ => rebuild(b, left, right, Expr::Div),
                }
            }

            Expr::Mod(b) => {
                let left = b.left.simplified();
                let right = b.right.simplified();
                match (&left, &right) {
                    (Expr::Number(l), Expr::Number(r)) if r.value > 0 => {
                        Expr::number(l.value.rem_euclid(r.value))
                    }
                    _ => rebuild(b, left, right, Expr::Mod),
                }
            }

            Expr::Pow(b) => {
                let left = b.left.simplified();
                let right = b.right.simplified();
                match (&left, &right) {
                    (Expr::Number(l), Expr::Number(r)) if r.value >= 0 => {
                        match u32::try_from(r.value)
                            .ok()
                            .and_then(|e| l.value.checked_pow(e))
                        {
                            Some(v) => Expr::number(v),
                            None => rebuild(b, left.clone(), right.clone(), Expr::Pow),
                        }
                    }
                    _ => rebuild(b, left, right, Expr::Pow),
                }
            }

            Expr::Equal(b) => simplify_relation(b, Expr::Equal, |o| o == std::cmp::Ordering::Equal),
            Expr::NotEqual(b) => {
                simplify_relation(b, Expr::NotEqual, |o| o != std::cmp::Ordering::Equal)
            }
            Expr::Less(b) => simplify_relation(b, Expr::Less, |o| o == std::cmp::Ordering::Less),
            Expr::LessEqual(b) => {
                simplify_relation(b, Expr::LessEqual, |o| o != std::cmp::Ordering::Greater)
            }
            Expr::Greater(b) => {
                simplify_relation(b, Expr::Greater, |o| o == std::cmp::Ordering::Greater)
            }
            Expr::GreaterEqual(b) => {
                simplify_relation(b, Expr::GreaterEqual, |o| o != std::cmp::Ordering::Less)
            }

            Expr::And(n) => simplify_connective(n, true),
            Expr::Or(n) => simplify_connective(n, false),

            Expr::Not(e) => match e.simplified() {
                Expr::True => Expr::False,
                Expr::False => Expr::True,
                Expr::Not(inner) => *inner,
                other => Expr::Not(Box::new(other)),
            },

            Expr::ValueRange(r) => Expr::ValueRange(Range {
                lower: Box::new(r.lower.simplified()),
                upper: Box::new(r.upper.simplified()),
                location: r.location.clone(),
            }),

            Expr::In(b) => {
                let left = b.left.simplified();
                let right = b.right.simplified();
                rebuild(b, left, right, Expr::In)
            }
            Expr::NotIn(b) => {
                let left = b.left.simplified();
                let right = b.right.simplified();
                rebuild(b, left, right, Expr::NotIn)
            }
        }
    }
}

fn rebuild(
    original: &Binary,
    left: Expr,
    right: Expr,
    ctor: fn(Binary) -> Expr,
) -> Expr {
    ctor(Binary {
        left: Box::new(left),
        right: Box::new(right),
        location: original.location.clone(),
    })
}

/// Fold a relation between constants, or between syntactically identical
/// operands. Identical operands decide a relation for every valuation, so
/// the fold is sound even for non-constant terms.
fn simplify_relation(
    b: &Binary,
    ctor: fn(Binary) -> Expr,
    holds: fn(std::cmp::Ordering) -> bool,
) -> Expr {
    let left = b.left.simplified();
    let right = b.right.simplified();
    if let (Expr::Number(l), Expr::Number(r)) = (&left, &right) {
        return if holds(l.value.cmp(&r.value)) {
            Expr::True
        } else {
            Expr::False
        };
    }
    if left == right {
        return if holds(std::cmp::Ordering::Equal) {
            Expr::True
        } else {
            Expr::False
        };
    }
    rebuild(b, left, right, ctor)
}

/// Simplify an n-ary sum: flatten, fold constants, drop zero, order terms.
/// Folding is all-or-nothing: if the constant part overflows, every number
/// term is kept as-is, so the result is stable under re-simplification.
fn simplify_sum(n: &Nary) -> Expr {
    let (mut terms, numbers) = flatten(n, |e| match e {
        Expr::Add(inner) => inner.terms,
        other => vec![other],
    });

    match fold(&numbers, 0, i128::checked_add) {
        Some(constant) => {
            if constant != 0 || terms.is_empty() {
                terms.push(Expr::number(constant));
            }
        }
        None => terms.extend(numbers.into_iter().map(Expr::number)),
    }

    terms.sort();
    if terms.len() == 1 {
        return terms.pop().expect("nonempty");
    }
    Expr::Add(Nary {
        terms,
        location: n.location.clone(),
    })
}

/// Simplify an n-ary product: flatten, fold constants, absorb zero, drop
/// one, order terms.
fn simplify_product(n: &Nary) -> Expr {
    let (mut terms, numbers) = flatten(n, |e| match e {
        Expr::Mul(inner) => inner.terms,
        other => vec![other],
    });

    match fold(&numbers, 1, i128::checked_mul) {
        Some(0) => return Expr::number(0),
        Some(constant) => {
            if constant != 1 || terms.is_empty() {
                terms.push(Expr::number(constant));
            }
        }
        None => terms.extend(numbers.into_iter().map(Expr::number)),
    }

    terms.sort();
    if terms.len() == 1 {
        return terms.pop().expect("nonempty");
    }
    Expr::Mul(Nary {
        terms,
        location: n.location.clone(),
    })
}

/// Simplify and flatten the terms of an associative node, splitting number
/// terms out for folding.
fn flatten(n: &Nary, unwrap: fn(Expr) -> Vec<Expr>) -> (Vec<Expr>, Vec<i128>) {
    let mut terms = Vec::new();
    let mut numbers = Vec::new();
    for term in &n.terms {
        for t in unwrap(term.simplified()) {
            match t {
                Expr::Number(num) => numbers.push(num.value),
                other => terms.push(other),
            }
        }
    }
    (terms, numbers)
}

fn fold(
    numbers: &[i128],
    neutral: i128,
    op: fn(i128, i128) -> Option<i128>,
) -> Option<i128> {
    numbers.iter().try_fold(neutral, |acc, v| op(acc, *v))
}

/// Simplify a conjunction (`neutral = true`) or disjunction
/// (`neutral = false`): flatten, drop the neutral element, short-circuit on
/// the absorbing element, order terms.
fn simplify_connective(n: &Nary, conjunction: bool) -> Expr {
    let neutral = if conjunction { Expr::True } else { Expr::False };
    let absorbing = if conjunction { Expr::False } else { Expr::True };

    let mut terms: Vec<Expr> = Vec::new();
    for term in &n.terms {
        let simplified = term.simplified();
        let flattened = match (conjunction, simplified) {
            (true, Expr::And(inner)) => inner.terms,
            (false, Expr::Or(inner)) => inner.terms,
            (_, other) => vec![other],
        };
        for t in flattened {
            if t == absorbing {
                return absorbing;
            }
            if t != neutral {
                terms.push(t);
            }
        }
    }

    if terms.is_empty() {
        return neutral;
    }
    terms.sort();
    if terms.len() == 1 {
        return terms.pop().expect("nonempty");
    }
    let nary = Nary {
        terms,
        location: n.location.clone(),
    };
    if conjunction {
        Expr::And(nary)
    } else {
        Expr::Or(nary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_folding() {
        assert_eq!(
            Expr::add(vec![Expr::number(2), Expr::number(3)]).simplified(),
            Expr::number(5)
        );
        assert_eq!(
            Expr::mul(vec![Expr::number(4), Expr::number(5)]).simplified(),
            Expr::number(20)
        );
        assert_eq!(
            Expr::sub(Expr::number(10), Expr::number(3)).simplified(),
            Expr::number(7)
        );
        assert_eq!(
            Expr::pow(Expr::number(2), Expr::number(8)).simplified(),
            Expr::number(256)
        );
        assert_eq!(
            Expr::modulo(Expr::number(18), Expr::number(8)).simplified(),
            Expr::number(2)
        );
        assert_eq!(
            Expr::div(Expr::number(16), Expr::number(4)).simplified(),
            Expr::number(4)
        );
        // Inexact division stays symbolic.
        assert_eq!(
            Expr::div(Expr::number(7), Expr::number(2)).simplified(),
            Expr::div(Expr::number(7), Expr::number(2))
        );
    }

    #[test]
    fn flattening_and_ordering() {
        let e = Expr::add(vec![
            Expr::var("B"),
            Expr::add(vec![Expr::number(1), Expr::var("A")]),
            Expr::number(2),
        ]);
        assert_eq!(
            e.simplified(),
            Expr::add(vec![Expr::number(3), Expr::var("A"), Expr::var("B")])
        );
    }

    #[test]
    fn neutral_and_absorbing_elements() {
        let cond = Expr::and(vec![
            Expr::True,
            Expr::equal(Expr::var("F"), Expr::number(1)),
        ]);
        assert_eq!(
            cond.simplified(),
            Expr::equal(Expr::var("F"), Expr::number(1))
        );

        let with_false = Expr::and(vec![
            Expr::equal(Expr::var("F"), Expr::number(1)),
            Expr::False,
        ]);
        assert_eq!(with_false.simplified(), Expr::False);

        let disj = Expr::or(vec![Expr::False, Expr::var("P")]);
        assert_eq!(disj.simplified(), Expr::var("P"));
        assert_eq!(
            Expr::or(vec![Expr::var("P"), Expr::True]).simplified(),
            Expr::True
        );

        assert_eq!(Expr::and(vec![]).simplified(), Expr::True);
        assert_eq!(Expr::or(vec![]).simplified(), Expr::False);
    }

    #[test]
    fn relations_fold_on_constants_and_identical_operands() {
        assert_eq!(
            Expr::less(Expr::number(1), Expr::number(2)).simplified(),
            Expr::True
        );
        assert_eq!(
            Expr::equal(Expr::number(2), Expr::number(3)).simplified(),
            Expr::False
        );
        assert_eq!(
            Expr::equal(Expr::var("X"), Expr::var("X")).simplified(),
            Expr::True
        );
        assert_eq!(
            Expr::less(Expr::var("X"), Expr::var("X")).simplified(),
            Expr::False
        );
        // Distinct variables stay symbolic.
        let sym = Expr::equal(Expr::var("X"), Expr::var("Y"));
        assert_eq!(sym.simplified(), sym);
    }

    #[test]
    fn negation_rules() {
        assert_eq!(Expr::not(Expr::True).simplified(), Expr::False);
        assert_eq!(
            Expr::not(Expr::not(Expr::var("P"))).simplified(),
            Expr::var("P")
        );
        assert_eq!(Expr::neg(Expr::number(5)).simplified(), Expr::number(-5));
        assert_eq!(
            Expr::neg(Expr::neg(Expr::var("X"))).simplified(),
            Expr::var("X")
        );
    }

    #[test]
    fn zero_and_one_in_products() {
        assert_eq!(
            Expr::mul(vec![Expr::var("X"), Expr::number(0)]).simplified(),
            Expr::number(0)
        );
        assert_eq!(
            Expr::mul(vec![Expr::var("X"), Expr::number(1)]).simplified(),
            Expr::var("X")
        );
        assert_eq!(
            Expr::add(vec![Expr::var("X"), Expr::number(0)]).simplified(),
            Expr::var("X")
        );
    }

    #[test]
    fn simplify_is_idempotent() {
        let exprs = vec![
            Expr::add(vec![
                Expr::var("B"),
                Expr::add(vec![Expr::number(1), Expr::var("A")]),
                Expr::number(-1),
            ]),
            Expr::and(vec![
                Expr::True,
                Expr::or(vec![Expr::var("Q"), Expr::var("P"), Expr::False]),
                Expr::less_equal(Expr::var("F"), Expr::number(100)),
            ]),
            Expr::sub(
                Expr::add(vec![Expr::first("F"), Expr::size("F")]),
                Expr::number(1),
            ),
            Expr::mul(vec![
                Expr::number(2),
                Expr::var("N"),
                Expr::number(4),
            ]),
        ];
        for e in exprs {
            let once = e.simplified();
            assert_eq!(once.simplified(), once, "not a fixpoint: {}", e);
        }
    }

    #[test]
    fn large_constants_fold_exactly() {
        let e = Expr::pow(Expr::number(2), Expr::number(64));
        assert_eq!(e.simplified(), Expr::number(1 << 64));
        let last = Expr::sub(
            Expr::pow(Expr::number(2), Expr::number(64)),
            Expr::number(1),
        );
        assert_eq!(last.simplified(), Expr::number((1_i128 << 64) - 1));
    }
}

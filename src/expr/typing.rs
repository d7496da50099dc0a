//! Lightweight expression typing.
//!
//! A small type lattice for structural checks of link conditions and
//! aspects. Variables are annotated with their model type before checking
//! (see the expression-typing phase of the verifier); inference then walks
//! the tree and reports mismatches with source locations.

use std::fmt;

use crate::diagnostics::Entry;
use crate::identifier::Id;

use super::Expr;

/// The type lattice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ty {
    /// No information; a variable that was never annotated.
    Undefined,
    /// Top: compatible with everything.
    Any,
    Boolean,
    /// The type of integer literals.
    UniversalInteger,
    /// A bounded integer type.
    Integer { id: Id, first: i128, last: i128 },
    Enumeration { id: Id, always_valid: bool },
    /// An aggregate literal; element type is universal.
    Aggregate,
    Opaque,
    Sequence { id: Id, element: Box<Ty> },
    Message(Id),
}

impl Ty {
    /// Whether a value of this type is an integer.
    pub fn is_integer(&self) -> bool {
        matches!(self, Ty::UniversalInteger | Ty::Integer { .. })
    }

    /// Whether fields of this type hold byte-sequence data.
    pub fn is_composite(&self) -> bool {
        matches!(self, Ty::Opaque | Ty::Sequence { .. })
    }

    /// The least common type, or `None` if the types are incompatible.
    pub fn common(&self, other: &Ty) -> Option<Ty> {
        match (self, other) {
            (Ty::Undefined, _) | (_, Ty::Undefined) => None,
            (Ty::Any, t) => Some(t.clone()),
            (t, Ty::Any) => Some(t.clone()),
            (Ty::UniversalInteger, t) if t.is_integer() => Some(t.clone()),
            (t, Ty::UniversalInteger) if t.is_integer() => Some(t.clone()),
            (Ty::Integer { .. }, Ty::Integer { .. }) => Some(self.clone()),
            (Ty::Boolean, Ty::Boolean) => Some(Ty::Boolean),
            (Ty::Enumeration { id: a, .. }, Ty::Enumeration { id: b, .. }) if a == b => {
                Some(self.clone())
            }
            (Ty::Opaque, Ty::Opaque) => Some(Ty::Opaque),
            (Ty::Aggregate, t) if t.is_composite() => Some(t.clone()),
            (t, Ty::Aggregate) if t.is_composite() => Some(t.clone()),
            (Ty::Sequence { id: a, .. }, Ty::Sequence { id: b, .. }) if a == b => {
                Some(self.clone())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Undefined => write!(f, "undefined type"),
            Ty::Any => write!(f, "any type"),
            Ty::Boolean => write!(f, "boolean type"),
            Ty::UniversalInteger => write!(f, "type universal integer"),
            Ty::Integer { id, .. } => write!(f, "integer type \"{}\"", id),
            Ty::Enumeration { id, .. } => write!(f, "enumeration type \"{}\"", id),
            Ty::Aggregate => write!(f, "aggregate"),
            Ty::Opaque => write!(f, "opaque type"),
            Ty::Sequence { id, .. } => write!(f, "sequence type \"{}\"", id),
            Ty::Message(id) => write!(f, "message type \"{}\"", id),
        }
    }
}

impl Expr {
    /// Structurally type-check this expression against an expected type.
    /// Returns the diagnostic entries for every mismatch found; an empty
    /// result means the expression checks.
    pub fn check_type(&self, expected: &Ty) -> Vec<Entry> {
        let mut entries = Vec::new();
        let ty = infer(self, &mut entries);
        if entries.is_empty() && ty.common(expected).is_none() {
            entries.push(Entry::error(
                format!("expected {}, found {}", expected, ty),
                self.location(),
            ));
        }
        entries
    }
}

fn infer(expr: &Expr, entries: &mut Vec<Entry>) -> Ty {
    match expr {
        Expr::Undefined => Ty::Any,
        Expr::True | Expr::False => Ty::Boolean,
        Expr::Number(_) => Ty::UniversalInteger,
        Expr::String(_) | Expr::Aggregate(_) => Ty::Aggregate,

        Expr::Variable(v) => {
            if v.ty == Ty::Undefined {
                entries.push(Entry::error(
                    format!("undefined variable \"{}\" referenced", v.id),
                    v.location.clone(),
                ));
                Ty::Any
            } else {
                v.ty.clone()
            }
        }

        Expr::First(_) | Expr::Last(_) | Expr::Size(_) => Ty::UniversalInteger,
        Expr::ValidChecksum(_) => Ty::Boolean,

        Expr::Neg(e) => integer_operand(e, entries),

        Expr::Add(n) | Expr::Mul(n) => {
            let mut result = Ty::UniversalInteger;
            for term in &n.terms {
                result = join_integer(result, integer_operand(term, entries));
            }
            result
        }

        Expr::Sub(b) | Expr::Div(b) | Expr::Mod(b) | Expr::Pow(b) => {
            let left = integer_operand(&b.left, entries);
            let right = integer_operand(&b.right, entries);
            join_integer(left, right)
        }

        Expr::Equal(b) | Expr::NotEqual(b) => {
            check_equality(b, entries);
            Ty::Boolean
        }

        Expr::Less(b) | Expr::LessEqual(b) | Expr::Greater(b) | Expr::GreaterEqual(b) => {
            check_ordering(expr, b, entries);
            Ty::Boolean
        }

        Expr::And(n) | Expr::Or(n) => {
            for term in &n.terms {
                boolean_operand(term, entries);
            }
            Ty::Boolean
        }

        Expr::Not(e) => {
            boolean_operand(e, entries);
            Ty::Boolean
        }

        Expr::ValueRange(r) => {
            integer_operand(&r.lower, entries);
            integer_operand(&r.upper, entries);
            Ty::Any
        }

        Expr::In(b) | Expr::NotIn(b) => {
            integer_operand(&b.left, entries);
            match &*b.right {
                Expr::ValueRange(r) => {
                    integer_operand(&r.lower, entries);
                    integer_operand(&r.upper, entries);
                }
                other => {
                    integer_operand(other, entries);
                }
            }
            Ty::Boolean
        }
    }
}

fn integer_operand(expr: &Expr, entries: &mut Vec<Entry>) -> Ty {
    let before = entries.len();
    let ty = infer(expr, entries);
    if entries.len() > before {
        return Ty::Any;
    }
    match ty.common(&Ty::UniversalInteger) {
        Some(t) => t,
        None => {
            entries.push(Entry::error(
                format!("expected integer expression, found {}", ty),
                expr.location(),
            ));
            Ty::Any
        }
    }
}

fn boolean_operand(expr: &Expr, entries: &mut Vec<Entry>) {
    let before = entries.len();
    let ty = infer(expr, entries);
    if entries.len() == before && ty.common(&Ty::Boolean).is_none() {
        entries.push(Entry::error(
            format!("expected boolean expression, found {}", ty),
            expr.location(),
        ));
    }
}

fn join_integer(left: Ty, right: Ty) -> Ty {
    left.common(&right).unwrap_or(Ty::Any)
}

/// Equality is the one relation that accepts aggregates, and only against a
/// composite-typed operand; element values must fit the element range.
fn check_equality(b: &super::Binary, entries: &mut Vec<Entry>) {
    let relation = (&*b.left, &*b.right);
    let (aggregate, other) = match relation {
        (Expr::Aggregate(a), o) | (o, Expr::Aggregate(a)) => (Some(a), o),
        _ => (None, &*b.left),
    };

    if let Some(aggregate) = aggregate {
        let other_ty = infer(other, entries);
        match other_ty {
            Ty::Opaque => check_aggregate_elements(aggregate, 0, 255, entries),
            Ty::Sequence { element, .. } => match *element {
                Ty::Integer { first, last, .. } => {
                    check_aggregate_elements(aggregate, first, last, entries)
                }
                Ty::Message(id) => entries.push(Entry::error(
                    format!(
                        "invalid sequence element type \"{}\" for aggregate comparison",
                        id
                    ),
                    b.location.clone(),
                )),
                _ => {}
            },
            Ty::Any => {}
            _ => entries.push(Entry::error(
                format!(
                    "invalid relation between \"{}\" and aggregate",
                    other
                ),
                b.location.clone(),
            )),
        }
        return;
    }

    let before = entries.len();
    let left = infer(&b.left, entries);
    let right = infer(&b.right, entries);
    if entries.len() == before && left.common(&right).is_none() {
        entries.push(Entry::error(
            format!("incompatible types {} and {} in relation", left, right),
            b.location.clone(),
        ));
    }
}

fn check_ordering(relation: &Expr, b: &super::Binary, entries: &mut Vec<Entry>) {
    if matches!(&*b.left, Expr::Aggregate(_)) || matches!(&*b.right, Expr::Aggregate(_)) {
        let symbol = match relation {
            Expr::Less(_) => "<",
            Expr::LessEqual(_) => "<=",
            Expr::Greater(_) => ">",
            _ => ">=",
        };
        entries.push(Entry::error(
            format!("invalid relation \" {} \" to aggregate", symbol),
            b.location.clone(),
        ));
        return;
    }
    integer_operand(&b.left, entries);
    integer_operand(&b.right, entries);
}

fn check_aggregate_elements(
    aggregate: &super::Aggregate,
    first: i128,
    last: i128,
    entries: &mut Vec<Entry>,
) {
    for element in &aggregate.elements {
        if let Expr::Number(n) = element {
            if n.value < first || n.value > last {
                entries.push(Entry::error(
                    format!("aggregate element out of range {} .. {}", first, last),
                    n.location.clone(),
                ));
            }
        }
    }
}

//! Expression algebra.
//!
//! A closed sum type over arithmetic, relational, Boolean, aggregate, and
//! attribute nodes with a uniform traversal interface: [`Expr::variables`],
//! [`Expr::find_all`], [`Expr::substituted`], [`Expr::simplified`].
//!
//! Every traversal is an exhaustive match over the variant set, so adding a
//! variant forces every operation to handle it. Nodes own their children
//! (`Box`/`Vec`); expressions are freely cloned, compared, and used as map
//! keys. Locations and variable type annotations are metadata and never
//! participate in comparisons.

mod simplify;
pub mod typing;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::identifier::Id;
use crate::location::Location;

use typing::Ty;

/// An integer literal with a display base.
#[derive(Debug, Clone)]
pub struct Number {
    pub value: i128,
    /// Display base (2, 8, 10, or 16). Presentation only.
    pub base: u32,
    pub location: Location,
}

impl Number {
    pub fn new(value: i128) -> Self {
        Number {
            value,
            base: 10,
            location: Location::NONE,
        }
    }
}

// Only the value identifies a number; base and location are presentation.
impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl Hash for Number {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

/// A string literal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StringLit {
    pub value: String,
    pub location: Location,
}

/// An aggregate literal: an ordered list of element expressions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Aggregate {
    pub elements: Vec<Expr>,
    pub location: Location,
}

/// A variable reference, optionally annotated with its model type during
/// expression typing.
#[derive(Debug, Clone)]
pub struct Variable {
    pub id: Id,
    pub ty: Ty,
    pub location: Location,
}

impl Variable {
    pub fn new(id: Id) -> Self {
        Variable {
            id,
            ty: Ty::Undefined,
            location: Location::NONE,
        }
    }
}

// The identifier alone identifies a variable; the type annotation is
// attached during verification and must not affect substitution maps.
impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Variable {}

impl PartialOrd for Variable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variable {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// An attribute reference: `prefix'First`, `prefix'Last`, `prefix'Size`,
/// `prefix'Valid_Checksum`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attr {
    pub prefix: Id,
    pub location: Location,
}

/// A binary node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binary {
    pub left: Box<Expr>,
    pub right: Box<Expr>,
    pub location: Location,
}

/// An associative n-ary node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nary {
    pub terms: Vec<Expr>,
    pub location: Location,
}

/// A value range `lower .. upper`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    pub lower: Box<Expr>,
    pub upper: Box<Expr>,
    pub location: Location,
}

/// The expression sum type.
///
/// Variant order fixes the canonical operand ordering used by
/// [`Expr::simplified`] for commutative operators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expr {
    /// Sentinel for an absent aspect ("derive").
    Undefined,
    True,
    False,
    Number(Number),
    String(StringLit),
    Aggregate(Aggregate),
    Variable(Variable),
    First(Attr),
    Last(Attr),
    Size(Attr),
    ValidChecksum(Attr),
    Neg(Box<Expr>),
    Add(Nary),
    Mul(Nary),
    Sub(Binary),
    Div(Binary),
    Mod(Binary),
    Pow(Binary),
    Equal(Binary),
    NotEqual(Binary),
    Less(Binary),
    LessEqual(Binary),
    Greater(Binary),
    GreaterEqual(Binary),
    And(Nary),
    Or(Nary),
    Not(Box<Expr>),
    ValueRange(Range),
    In(Binary),
    NotIn(Binary),
}

impl Expr {
    // Constructors

    pub fn number(value: i128) -> Expr {
        Expr::Number(Number::new(value))
    }

    pub fn number_with_base(value: i128, base: u32) -> Expr {
        Expr::Number(Number {
            value,
            base,
            location: Location::NONE,
        })
    }

    pub fn string(value: impl Into<String>) -> Expr {
        Expr::String(StringLit {
            value: value.into(),
            location: Location::NONE,
        })
    }

    pub fn aggregate(elements: Vec<Expr>) -> Expr {
        Expr::Aggregate(Aggregate {
            elements,
            location: Location::NONE,
        })
    }

    pub fn var(id: impl Into<Id>) -> Expr {
        Expr::Variable(Variable::new(id.into()))
    }

    pub fn typed_var(id: impl Into<Id>, ty: Ty) -> Expr {
        Expr::Variable(Variable {
            id: id.into(),
            ty,
            location: Location::NONE,
        })
    }

    pub fn first(prefix: impl Into<Id>) -> Expr {
        Expr::First(Attr {
            prefix: prefix.into(),
            location: Location::NONE,
        })
    }

    pub fn last(prefix: impl Into<Id>) -> Expr {
        Expr::Last(Attr {
            prefix: prefix.into(),
            location: Location::NONE,
        })
    }

    pub fn size(prefix: impl Into<Id>) -> Expr {
        Expr::Size(Attr {
            prefix: prefix.into(),
            location: Location::NONE,
        })
    }

    pub fn valid_checksum(prefix: impl Into<Id>) -> Expr {
        Expr::ValidChecksum(Attr {
            prefix: prefix.into(),
            location: Location::NONE,
        })
    }

    pub fn neg(operand: Expr) -> Expr {
        Expr::Neg(Box::new(operand))
    }

    pub fn add(terms: Vec<Expr>) -> Expr {
        Expr::Add(Nary {
            terms,
            location: Location::NONE,
        })
    }

    pub fn mul(terms: Vec<Expr>) -> Expr {
        Expr::Mul(Nary {
            terms,
            location: Location::NONE,
        })
    }

    pub fn sub(left: Expr, right: Expr) -> Expr {
        Expr::Sub(Binary::of(left, right))
    }

    pub fn div(left: Expr, right: Expr) -> Expr {
        Expr::Div(Binary::of(left, right))
    }

    pub fn modulo(left: Expr, right: Expr) -> Expr {
        Expr::Mod(Binary::of(left, right))
    }

    pub fn pow(left: Expr, right: Expr) -> Expr {
        Expr::Pow(Binary::of(left, right))
    }

    pub fn equal(left: Expr, right: Expr) -> Expr {
        Expr::Equal(Binary::of(left, right))
    }

    pub fn not_equal(left: Expr, right: Expr) -> Expr {
        Expr::NotEqual(Binary::of(left, right))
    }

    pub fn less(left: Expr, right: Expr) -> Expr {
        Expr::Less(Binary::of(left, right))
    }

    pub fn less_equal(left: Expr, right: Expr) -> Expr {
        Expr::LessEqual(Binary::of(left, right))
    }

    pub fn greater(left: Expr, right: Expr) -> Expr {
        Expr::Greater(Binary::of(left, right))
    }

    pub fn greater_equal(left: Expr, right: Expr) -> Expr {
        Expr::GreaterEqual(Binary::of(left, right))
    }

    pub fn and(terms: Vec<Expr>) -> Expr {
        Expr::And(Nary {
            terms,
            location: Location::NONE,
        })
    }

    pub fn or(terms: Vec<Expr>) -> Expr {
        Expr::Or(Nary {
            terms,
            location: Location::NONE,
        })
    }

    pub fn not(operand: Expr) -> Expr {
        Expr::Not(Box::new(operand))
    }

    pub fn value_range(lower: Expr, upper: Expr) -> Expr {
        Expr::ValueRange(Range {
            lower: Box::new(lower),
            upper: Box::new(upper),
            location: Location::NONE,
        })
    }

    pub fn in_range(left: Expr, right: Expr) -> Expr {
        Expr::In(Binary::of(left, right))
    }

    pub fn not_in_range(left: Expr, right: Expr) -> Expr {
        Expr::NotIn(Binary::of(left, right))
    }

    /// Attach a location to the outermost node.
    pub fn at(mut self, location: Location) -> Expr {
        match &mut self {
            Expr::Undefined | Expr::True | Expr::False => {}
            Expr::Number(n) => n.location = location,
            Expr::String(s) => s.location = location,
            Expr::Aggregate(a) => a.location = location,
            Expr::Variable(v) => v.location = location,
            Expr::First(a) | Expr::Last(a) | Expr::Size(a) | Expr::ValidChecksum(a) => {
                a.location = location
            }
            Expr::Neg(_) | Expr::Not(_) => {}
            Expr::Add(n) | Expr::Mul(n) | Expr::And(n) | Expr::Or(n) => n.location = location,
            Expr::Sub(b)
            | Expr::Div(b)
            | Expr::Mod(b)
            | Expr::Pow(b)
            | Expr::Equal(b)
            | Expr::NotEqual(b)
            | Expr::Less(b)
            | Expr::LessEqual(b)
            | Expr::Greater(b)
            | Expr::GreaterEqual(b)
            | Expr::In(b)
            | Expr::NotIn(b) => b.location = location,
            Expr::ValueRange(r) => r.location = location,
        }
        self
    }

    /// The location of the outermost node; empty for locationless nodes.
    pub fn location(&self) -> Location {
        match self {
            Expr::Undefined | Expr::True | Expr::False => Location::NONE,
            Expr::Number(n) => n.location.clone(),
            Expr::String(s) => s.location.clone(),
            Expr::Aggregate(a) => a.location.clone(),
            Expr::Variable(v) => v.location.clone(),
            Expr::First(a) | Expr::Last(a) | Expr::Size(a) | Expr::ValidChecksum(a) => {
                a.location.clone()
            }
            Expr::Neg(e) | Expr::Not(e) => e.location(),
            Expr::Add(n) | Expr::Mul(n) | Expr::And(n) | Expr::Or(n) => n.location.clone(),
            Expr::Sub(b)
            | Expr::Div(b)
            | Expr::Mod(b)
            | Expr::Pow(b)
            | Expr::Equal(b)
            | Expr::NotEqual(b)
            | Expr::Less(b)
            | Expr::LessEqual(b)
            | Expr::Greater(b)
            | Expr::GreaterEqual(b)
            | Expr::In(b)
            | Expr::NotIn(b) => b.location.clone(),
            Expr::ValueRange(r) => r.location.clone(),
        }
    }

    /// Direct children, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
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
            | Expr::ValidChecksum(_) => Vec::new(),
            Expr::Aggregate(a) => a.elements.iter().collect(),
            Expr::Neg(e) | Expr::Not(e) => vec![e],
            Expr::Add(n) | Expr::Mul(n) | Expr::And(n) | Expr::Or(n) => n.terms.iter().collect(),
            Expr::Sub(b)
            | Expr::Div(b)
            | Expr::Mod(b)
            | Expr::Pow(b)
            | Expr::Equal(b)
            | Expr::NotEqual(b)
            | Expr::Less(b)
            | Expr::LessEqual(b)
            | Expr::Greater(b)
            | Expr::GreaterEqual(b)
            | Expr::In(b)
            | Expr::NotIn(b) => vec![&b.left, &b.right],
            Expr::ValueRange(r) => vec![&r.lower, &r.upper],
        }
    }

    /// Free variables, including attribute prefixes.
    pub fn variables(&self) -> BTreeSet<Id> {
        let mut result = BTreeSet::new();
        self.collect_variables(&mut result);
        result
    }

    fn collect_variables(&self, into: &mut BTreeSet<Id>) {
        match self {
            Expr::Variable(v) => {
                into.insert(v.id.clone());
            }
            Expr::First(a) | Expr::Last(a) | Expr::Size(a) | Expr::ValidChecksum(a) => {
                into.insert(a.prefix.clone());
            }
            _ => {
                for child in self.children() {
                    child.collect_variables(into);
                }
            }
        }
    }

    /// Pre-order traversal yielding every subexpression satisfying `pred`.
    pub fn find_all<'a>(&'a self, pred: &dyn Fn(&Expr) -> bool) -> Vec<&'a Expr> {
        let mut result = Vec::new();
        self.find_all_into(pred, &mut result);
        result
    }

    fn find_all_into<'a>(&'a self, pred: &dyn Fn(&Expr) -> bool, into: &mut Vec<&'a Expr>) {
        if pred(self) {
            into.push(self);
        }
        for child in self.children() {
            child.find_all_into(pred, into);
        }
    }

    /// Whether `target` occurs as a subexpression.
    pub fn contains(&self, target: &Expr) -> bool {
        if self == target {
            return true;
        }
        self.children().iter().any(|c| c.contains(target))
    }

    /// Whole-tree rewrite. The function is applied pre-order; when it
    /// returns a replacement, the replacement is taken as-is (results are
    /// not re-substituted), otherwise the node is rebuilt from substituted
    /// children. Substitution is therefore simultaneous and
    /// order-independent.
    pub fn substituted(&self, func: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
        if let Some(replacement) = func(self) {
            return replacement;
        }
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
            Expr::Aggregate(a) => Expr::Aggregate(Aggregate {
                elements: a.elements.iter().map(|e| e.substituted(func)).collect(),
                location: a.location.clone(),
            }),
            Expr::Neg(e) => Expr::Neg(Box::new(e.substituted(func))),
            Expr::Not(e) => Expr::Not(Box::new(e.substituted(func))),
            Expr::Add(n) => Expr::Add(n.substituted(func)),
            Expr::Mul(n) => Expr::Mul(n.substituted(func)),
            Expr::And(n) => Expr::And(n.substituted(func)),
            Expr::Or(n) => Expr::Or(n.substituted(func)),
            Expr::Sub(b) => Expr::Sub(b.substituted(func)),
            Expr::Div(b) => Expr::Div(b.substituted(func)),
            Expr::Mod(b) => Expr::Mod(b.substituted(func)),
            Expr::Pow(b) => Expr::Pow(b.substituted(func)),
            Expr::Equal(b) => Expr::Equal(b.substituted(func)),
            Expr::NotEqual(b) => Expr::NotEqual(b.substituted(func)),
            Expr::Less(b) => Expr::Less(b.substituted(func)),
            Expr::LessEqual(b) => Expr::LessEqual(b.substituted(func)),
            Expr::Greater(b) => Expr::Greater(b.substituted(func)),
            Expr::GreaterEqual(b) => Expr::GreaterEqual(b.substituted(func)),
            Expr::In(b) => Expr::In(b.substituted(func)),
            Expr::NotIn(b) => Expr::NotIn(b.substituted(func)),
            Expr::ValueRange(r) => Expr::ValueRange(Range {
                lower: Box::new(r.lower.substituted(func)),
                upper: Box::new(r.upper.substituted(func)),
                location: r.location.clone(),
            }),
        }
    }

    /// Substitution by mapping. Keys must be names (variables or attribute
    /// references). A mapping of a variable also renames attribute prefixes
    /// referring to it: `{X -> Y}` rewrites `X'Last` to `Y'Last`.
    pub fn substituted_mapping(&self, mapping: &BTreeMap<Expr, Expr>) -> Expr {
        self.substituted(&mut |e| {
            if let Some(replacement) = mapping.get(e) {
                return Some(replacement.clone());
            }
            let attr = match e {
                Expr::First(a) | Expr::Last(a) | Expr::Size(a) | Expr::ValidChecksum(a) => a,
                _ => return None,
            };
            match mapping.get(&Expr::var(attr.prefix.clone())) {
                Some(Expr::Variable(v)) => {
                    let renamed = Attr {
                        prefix: v.id.clone(),
                        location: attr.location.clone(),
                    };
                    Some(match e {
                        Expr::First(_) => Expr::First(renamed),
                        Expr::Last(_) => Expr::Last(renamed),
                        Expr::Size(_) => Expr::Size(renamed),
                        _ => Expr::ValidChecksum(renamed),
                    })
                }
                _ => None,
            }
        })
    }

    /// The literal value, if this is a number.
    pub fn as_number(&self) -> Option<i128> {
        match self {
            Expr::Number(n) => Some(n.value),
            _ => None,
        }
    }

    /// The conjunctive terms of a condition: `And` flattens into its terms,
    /// anything else is a single fact.
    pub fn conjuncts(&self) -> Vec<Expr> {
        match self {
            Expr::And(n) => n.terms.clone(),
            _ => vec![self.clone()],
        }
    }
}

impl Binary {
    fn of(left: Expr, right: Expr) -> Self {
        Binary {
            left: Box::new(left),
            right: Box::new(right),
            location: Location::NONE,
        }
    }

    fn substituted(&self, func: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Binary {
        Binary {
            left: Box::new(self.left.substituted(func)),
            right: Box::new(self.right.substituted(func)),
            location: self.location.clone(),
        }
    }
}

impl Nary {
    fn substituted(&self, func: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Nary {
        Nary {
            terms: self.terms.iter().map(|t| t.substituted(func)).collect(),
            location: self.location.clone(),
        }
    }
}

// Rendering. The textual form is Ada-flavored and doubles as the canonical
// name of a term in solver input, so it must be deterministic.

fn precedence(expr: &Expr) -> u8 {
    match expr {
        Expr::Or(_) => 1,
        Expr::And(_) => 2,
        Expr::Not(_) => 3,
        Expr::Equal(_)
        | Expr::NotEqual(_)
        | Expr::Less(_)
        | Expr::LessEqual(_)
        | Expr::Greater(_)
        | Expr::GreaterEqual(_)
        | Expr::In(_)
        | Expr::NotIn(_)
        | Expr::ValueRange(_) => 4,
        Expr::Add(_) | Expr::Sub(_) => 5,
        Expr::Mul(_) | Expr::Div(_) | Expr::Mod(_) => 6,
        Expr::Pow(_) => 7,
        Expr::Neg(_) => 8,
        _ => 9,
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, operand: &Expr, parent: u8) -> fmt::Result {
    if precedence(operand) < parent {
        write!(f, "({})", operand)
    } else {
        write!(f, "{}", operand)
    }
}

fn write_nary(f: &mut fmt::Formatter<'_>, terms: &[Expr], op: &str, prec: u8) -> fmt::Result {
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            // Render added negative constants as subtraction.
            if op == " + " {
                if let Expr::Number(n) = term {
                    if n.value < 0 {
                        write!(f, " - {}", -n.value)?;
                        continue;
                    }
                }
                if let Expr::Neg(inner) = term {
                    write!(f, " - ")?;
                    write_operand(f, inner, prec + 1)?;
                    continue;
                }
            }
            write!(f, "{}", op)?;
        }
        write_operand(f, term, prec)?;
    }
    Ok(())
}

fn write_binary(
    f: &mut fmt::Formatter<'_>,
    b: &Binary,
    op: &str,
    prec: u8,
) -> fmt::Result {
    write_operand(f, &b.left, prec)?;
    write!(f, "{}", op)?;
    write_operand(f, &b.right, prec + 1)
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Undefined => write!(f, "Undefined"),
            Expr::True => write!(f, "True"),
            Expr::False => write!(f, "False"),
            Expr::Number(n) => match n.base {
                2 => write!(f, "2#{:b}#", n.value),
                8 => write!(f, "8#{:o}#", n.value),
                16 => write!(f, "16#{:X}#", n.value),
                _ => write!(f, "{}", n.value),
            },
            Expr::String(s) => write!(f, "\"{}\"", s.value),
            Expr::Aggregate(a) => {
                write!(f, "(")?;
                for (i, e) in a.elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            Expr::Variable(v) => write!(f, "{}", v.id),
            Expr::First(a) => write!(f, "{}'First", a.prefix),
            Expr::Last(a) => write!(f, "{}'Last", a.prefix),
            Expr::Size(a) => write!(f, "{}'Size", a.prefix),
            Expr::ValidChecksum(a) => write!(f, "{}'Valid_Checksum", a.prefix),
            Expr::Neg(e) => {
                write!(f, "-")?;
                write_operand(f, e, 8)
            }
            Expr::Add(n) => write_nary(f, &n.terms, " + ", 5),
            Expr::Mul(n) => write_nary(f, &n.terms, " * ", 6),
            Expr::Sub(b) => write_binary(f, b, " - ", 5),
            Expr::Div(b) => write_binary(f, b, " / ", 6),
            Expr::Mod(b) => write_binary(f, b, " mod ", 6),
            Expr::Pow(b) => write_binary(f, b, " ** ", 7),
            Expr::Equal(b) => write_binary(f, b, " = ", 4),
            Expr::NotEqual(b) => write_binary(f, b, " /= ", 4),
            Expr::Less(b) => write_binary(f, b, " < ", 4),
            Expr::LessEqual(b) => write_binary(f, b, " <= ", 4),
            Expr::Greater(b) => write_binary(f, b, " > ", 4),
            Expr::GreaterEqual(b) => write_binary(f, b, " >= ", 4),
            Expr::And(n) => write_nary(f, &n.terms, " and ", 2),
            Expr::Or(n) => write_nary(f, &n.terms, " or ", 1),
            Expr::Not(e) => {
                write!(f, "not ")?;
                write_operand(f, e, 4)
            }
            Expr::ValueRange(r) => {
                write_operand(f, &r.lower, 5)?;
                write!(f, " .. ")?;
                write_operand(f, &r.upper, 5)
            }
            Expr::In(b) => write_binary(f, b, " in ", 4),
            Expr::NotIn(b) => write_binary(f, b, " not in ", 4),
        }
    }
}

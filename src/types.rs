//! Scalar and composite model types.
//!
//! Each type carries its identifier, location, and a diagnostic buffer that
//! accumulates errors during construction; nothing is raised until a
//! propagation checkpoint. Scalar value constraints are produced on demand
//! as expressions for use in proof obligations.

use std::collections::BTreeMap;
use std::fmt;

use crate::diagnostics::{Diagnostics, Entry};
use crate::expr::typing::Ty;
use crate::expr::Expr;
use crate::identifier::Id;
use crate::location::Location;
use crate::message::Message;

/// Largest representable scalar: sizes above 64 bit are rejected.
pub const MAX_SCALAR_SIZE: i128 = 64;

/// Check the `package::name` shape of a top-level type identifier.
fn check_type_identifier(id: &Id, location: &Location, error: &mut Diagnostics) {
    if id.parts().len() != 2 {
        error.push(Entry::error(
            format!("unexpected format of type name \"{}\"", id),
            location.clone(),
        ));
    }
}

fn contains_variable(expr: &Expr) -> bool {
    !expr.variables().is_empty()
}

/// Number of bits needed for values `0 .. value`.
fn bits_for(value: i128) -> i128 {
    let mut bits = 0;
    let mut v = value;
    while v > 0 {
        bits += 1;
        v >>= 1;
    }
    bits.max(1)
}

/// A modular integer type: values `0 .. modulus - 1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModularInteger {
    id: Id,
    modulus: Expr,
    size: i128,
    location: Location,
    error: Diagnostics,
}

impl ModularInteger {
    pub fn new(id: impl Into<Id>, modulus: Expr) -> Self {
        Self::with_location(id, modulus, Location::NONE)
    }

    pub fn with_location(id: impl Into<Id>, modulus: Expr, location: Location) -> Self {
        let id = id.into();
        let mut error = Diagnostics::new();
        check_type_identifier(&id, &location, &mut error);

        let simplified = modulus.simplified();
        let mut size = 0;
        if contains_variable(&simplified) {
            error.push(Entry::error(
                format!("modulus of \"{}\" contains variable", id.name()),
                location.clone(),
            ));
        } else if let Some(value) = simplified.as_number() {
            if value <= 0 || value & (value - 1) != 0 {
                error.push(Entry::error(
                    format!("modulus of \"{}\" not power of two", id.name()),
                    location.clone(),
                ));
            } else if value > (1_i128 << MAX_SCALAR_SIZE) {
                error.push(Entry::error(
                    format!("modulus of \"{}\" exceeds limit (2**64)", id.name()),
                    location.clone(),
                ));
            } else {
                size = bits_for(value - 1);
            }
        }

        ModularInteger {
            id,
            modulus: simplified,
            size,
            location,
            error,
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn modulus(&self) -> &Expr {
        &self.modulus
    }

    pub fn first(&self) -> Expr {
        Expr::number(0)
    }

    pub fn last(&self) -> Expr {
        Expr::sub(self.modulus.clone(), Expr::number(1)).simplified()
    }

    pub fn size(&self) -> Expr {
        Expr::number(self.size)
    }
}

/// A bounded integer type: values `first .. last` stored in `size` bits.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RangeInteger {
    id: Id,
    first: Expr,
    last: Expr,
    size: Expr,
    location: Location,
    error: Diagnostics,
}

impl RangeInteger {
    pub fn new(id: impl Into<Id>, first: Expr, last: Expr, size: Expr) -> Self {
        Self::with_location(id, first, last, size, Location::NONE)
    }

    pub fn with_location(
        id: impl Into<Id>,
        first: Expr,
        last: Expr,
        size: Expr,
        location: Location,
    ) -> Self {
        let id = id.into();
        let mut error = Diagnostics::new();
        check_type_identifier(&id, &location, &mut error);

        let first = first.simplified();
        let last = last.simplified();
        let size = size.simplified();

        for (expr, aspect) in [(&first, "first"), (&last, "last"), (&size, "size")] {
            if contains_variable(expr) {
                error.push(Entry::error(
                    format!("{} of \"{}\" contains variable", aspect, id.name()),
                    location.clone(),
                ));
            }
        }

        if let Some(value) = first.as_number() {
            if value < 0 {
                error.push(Entry::error(
                    format!("first of \"{}\" negative", id.name()),
                    location.clone(),
                ));
            }
        }
        if let Some(value) = last.as_number() {
            if value > i128::from(i64::MAX) {
                error.push(Entry::error(
                    format!("last of \"{}\" exceeds limit (2**63 - 1)", id.name()),
                    location.clone(),
                ));
            }
        }
        if let (Some(f), Some(l)) = (first.as_number(), last.as_number()) {
            if l < f {
                error.push(Entry::error(
                    format!("range of \"{}\" negative", id.name()),
                    location.clone(),
                ));
            }
        }
        if let Some(bits) = size.as_number() {
            if bits > MAX_SCALAR_SIZE {
                error.push(Entry::error(
                    format!("size of \"{}\" exceeds limit (2**64)", id.name()),
                    location.clone(),
                ));
            } else if let Some(l) = last.as_number() {
                if l >= 0 && bits_for(l) > bits {
                    error.push(Entry::error(
                        format!("size of \"{}\" too small", id.name()),
                        location.clone(),
                    ));
                }
            }
        }

        RangeInteger {
            id,
            first,
            last,
            size,
            location,
            error,
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn first(&self) -> Expr {
        self.first.clone()
    }

    pub fn last(&self) -> Expr {
        self.last.clone()
    }

    pub fn size(&self) -> Expr {
        self.size.clone()
    }
}

/// An enumeration type mapping literals to values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Enumeration {
    id: Id,
    literals: BTreeMap<Id, i128>,
    size: Expr,
    always_valid: bool,
    location: Location,
    error: Diagnostics,
}

impl Enumeration {
    pub fn new(
        id: impl Into<Id>,
        literals: Vec<(&str, i128)>,
        size: Expr,
        always_valid: bool,
    ) -> Self {
        Self::with_location(
            id,
            literals
                .into_iter()
                .map(|(name, value)| (Id::parse(name), value))
                .collect(),
            size,
            always_valid,
            Location::NONE,
        )
    }

    pub fn with_location(
        id: impl Into<Id>,
        literals: Vec<(Id, i128)>,
        size: Expr,
        always_valid: bool,
        location: Location,
    ) -> Self {
        let id = id.into();
        let mut error = Diagnostics::new();
        check_type_identifier(&id, &location, &mut error);

        let size = size.simplified();
        if contains_variable(&size) {
            error.push(Entry::error(
                format!("size of \"{}\" contains variable", id.name()),
                location.clone(),
            ));
        }

        let mut literal_map = BTreeMap::new();
        for (literal, value) in literals {
            let name = literal.name().to_string();
            let well_formed = literal.parts().len() == 1
                && !name.is_empty()
                && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !well_formed {
                error.push(Entry::error(
                    format!("invalid literal name \"{}\" in \"{}\"", literal, id.name()),
                    location.clone(),
                ));
                continue;
            }
            if literal_map.values().any(|v| *v == value) {
                error.push(Entry::error(
                    format!("duplicate enumeration value {} in \"{}\"", value, id.name()),
                    location.clone(),
                ));
            }
            literal_map.insert(literal, value);
        }

        if let Some(bits) = size.as_number() {
            let max_value = literal_map.values().copied().max().unwrap_or(0);
            if bits > MAX_SCALAR_SIZE {
                error.push(Entry::error(
                    format!("size of \"{}\" exceeds limit (2**64)", id.name()),
                    location.clone(),
                ));
            } else if bits_for(max_value) > bits {
                error.push(Entry::error(
                    format!("size of \"{}\" too small", id.name()),
                    location.clone(),
                ));
            } else if always_valid
                && bits <= 32
                && literal_map.len() as i128 == 1_i128 << bits
            {
                error.push(Entry::error(
                    format!("unnecessary always-valid aspect on \"{}\"", id.name()),
                    location.clone(),
                ));
            }
        }

        Enumeration {
            id,
            literals: literal_map,
            size,
            always_valid,
            location,
            error,
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn literals(&self) -> &BTreeMap<Id, i128> {
        &self.literals
    }

    pub fn size(&self) -> Expr {
        self.size.clone()
    }

    pub fn always_valid(&self) -> bool {
        self.always_valid
    }
}

/// An unstructured byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Opaque {
    location: Location,
}

impl Opaque {
    pub fn new() -> Self {
        Opaque {
            location: Location::NONE,
        }
    }

    /// Size of one element in bits.
    pub fn element_size(&self) -> Expr {
        Expr::number(8)
    }
}

impl Default for Opaque {
    fn default() -> Self {
        Opaque::new()
    }
}

/// A homogeneous sequence of a scalar or message element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence {
    id: Id,
    element: Box<TypeDef>,
    location: Location,
    error: Diagnostics,
}

impl Sequence {
    pub fn new(id: impl Into<Id>, element: TypeDef) -> Self {
        Self::with_location(id, element, Location::NONE)
    }

    pub fn with_location(id: impl Into<Id>, element: TypeDef, location: Location) -> Self {
        let id = id.into();
        let mut error = Diagnostics::new();
        check_type_identifier(&id, &location, &mut error);

        if let Some(size) = element.scalar_size() {
            if size.as_number().is_some_and(|bits| bits % 8 != 0) {
                error.push(Entry::error(
                    format!(
                        "size of sequence element type \"{}\" not multiple of 8 bit",
                        element.id().name()
                    ),
                    location.clone(),
                ));
            }
        }

        Sequence {
            id,
            element: Box::new(element),
            location,
            error,
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn element(&self) -> &TypeDef {
        &self.element
    }
}

/// The closed variant of model types a message field can carry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeDef {
    Modular(ModularInteger),
    Range(RangeInteger),
    Enumeration(Enumeration),
    Opaque(Opaque),
    Sequence(Sequence),
    Message(Box<Message>),
}

impl TypeDef {
    pub fn id(&self) -> Id {
        match self {
            TypeDef::Modular(t) => t.id.clone(),
            TypeDef::Range(t) => t.id.clone(),
            TypeDef::Enumeration(t) => t.id.clone(),
            TypeDef::Opaque(_) => Id::parse("__INTERNAL__::Opaque"),
            TypeDef::Sequence(t) => t.id.clone(),
            TypeDef::Message(m) => m.identifier().clone(),
        }
    }

    pub fn location(&self) -> Location {
        match self {
            TypeDef::Modular(t) => t.location.clone(),
            TypeDef::Range(t) => t.location.clone(),
            TypeDef::Enumeration(t) => t.location.clone(),
            TypeDef::Opaque(t) => t.location.clone(),
            TypeDef::Sequence(t) => t.location.clone(),
            TypeDef::Message(m) => m.location().clone(),
        }
    }

    /// Construction-time diagnostics of this type.
    pub fn error(&self) -> Diagnostics {
        match self {
            TypeDef::Modular(t) => t.error.clone(),
            TypeDef::Range(t) => t.error.clone(),
            TypeDef::Enumeration(t) => t.error.clone(),
            TypeDef::Opaque(_) => Diagnostics::new(),
            TypeDef::Sequence(t) => t.error.clone(),
            TypeDef::Message(m) => m.diagnostics().clone(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            TypeDef::Modular(_) | TypeDef::Range(_) | TypeDef::Enumeration(_)
        )
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, TypeDef::Opaque(_) | TypeDef::Sequence(_))
    }

    pub fn is_message(&self) -> bool {
        matches!(self, TypeDef::Message(_))
    }

    /// The fixed bit size of scalar types.
    pub fn scalar_size(&self) -> Option<Expr> {
        match self {
            TypeDef::Modular(t) => Some(t.size()),
            TypeDef::Range(t) => Some(t.size()),
            TypeDef::Enumeration(t) => Some(t.size()),
            _ => None,
        }
    }

    /// Element size of composite types, in bits.
    pub fn element_size(&self) -> Option<Expr> {
        match self {
            TypeDef::Opaque(t) => Some(t.element_size()),
            TypeDef::Sequence(t) => t.element.scalar_size(),
            _ => None,
        }
    }

    /// The typing-lattice image of this type.
    pub fn ty(&self) -> Ty {
        match self {
            TypeDef::Modular(t) => Ty::Integer {
                id: t.id.clone(),
                first: 0,
                last: t.last().as_number().unwrap_or(0),
            },
            TypeDef::Range(t) => Ty::Integer {
                id: t.id.clone(),
                first: t.first.as_number().unwrap_or(0),
                last: t.last.as_number().unwrap_or(0),
            },
            TypeDef::Enumeration(t) => Ty::Enumeration {
                id: t.id.clone(),
                always_valid: t.always_valid,
            },
            TypeDef::Opaque(_) => Ty::Opaque,
            TypeDef::Sequence(t) => Ty::Sequence {
                id: t.id.clone(),
                element: Box::new(t.element.ty()),
            },
            TypeDef::Message(m) => Ty::Message(m.identifier().clone()),
        }
    }

    /// Numeric side conditions binding a scalar variable `name` to its value
    /// range and size. Enumerations additionally define their literal
    /// values; with `same_package`, unqualified literal aliases are defined
    /// as well.
    pub fn constraints(&self, name: &str, same_package: bool) -> Vec<Expr> {
        match self {
            TypeDef::Modular(t) => vec![
                Expr::greater_equal(Expr::var(name), Expr::number(0)),
                Expr::less(Expr::var(name), t.modulus.clone()),
                Expr::equal(Expr::size(name), t.size()),
            ],
            TypeDef::Range(t) => vec![
                Expr::greater_equal(Expr::var(name), t.first()),
                Expr::less_equal(Expr::var(name), t.last()),
                Expr::equal(Expr::size(name), t.size()),
            ],
            TypeDef::Enumeration(t) => {
                let mut result = Vec::new();
                if t.always_valid {
                    result.push(Expr::greater_equal(Expr::var(name), Expr::number(0)));
                    if let Some(bits) = t.size.as_number() {
                        result.push(Expr::less(
                            Expr::var(name),
                            Expr::number(1_i128 << bits.min(MAX_SCALAR_SIZE)),
                        ));
                    }
                } else if !t.literals.is_empty() {
                    result.push(
                        Expr::or(
                            t.literals
                                .values()
                                .map(|v| Expr::equal(Expr::var(name), Expr::number(*v)))
                                .collect(),
                        )
                        .simplified(),
                    );
                }
                for (literal, value) in &t.literals {
                    let qualified = t.id.package().join(literal.name());
                    result.push(Expr::equal(Expr::var(qualified), Expr::number(*value)));
                    if same_package {
                        result.push(Expr::equal(
                            Expr::var(literal.clone()),
                            Expr::number(*value),
                        ));
                    }
                }
                result.push(Expr::equal(Expr::size(name), t.size()));
                result
            }
            TypeDef::Opaque(_) | TypeDef::Sequence(_) | TypeDef::Message(_) => Vec::new(),
        }
    }

    /// Enumerations reachable from this type, including through sequences
    /// and nested messages.
    pub fn collect_enumerations<'a>(&'a self, into: &mut Vec<&'a Enumeration>) {
        match self {
            TypeDef::Enumeration(t) => into.push(t),
            TypeDef::Sequence(t) => t.element.collect_enumerations(into),
            TypeDef::Message(m) => {
                for t in m.types().values() {
                    t.collect_enumerations(into);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// The builtin boolean enumeration.
pub fn boolean() -> Enumeration {
    Enumeration::new(
        "__BUILTINS__::Boolean",
        vec![("False", 0), ("True", 1)],
        Expr::number(1),
        false,
    )
}

/// Literal names that never require package qualification.
pub fn builtin_literals() -> Vec<Id> {
    vec![Id::parse("False"), Id::parse("True")]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modular_size_and_bounds() {
        let t = ModularInteger::new("P::T", Expr::pow(Expr::number(2), Expr::number(32)));
        assert!(t.error.propagate().is_ok());
        assert_eq!(t.size(), Expr::number(32));
        assert_eq!(t.first(), Expr::number(0));
        assert_eq!(t.last(), Expr::number((1_i128 << 32) - 1));
    }

    #[test]
    fn modular_validation() {
        let bad_name = ModularInteger::with_location("X", Expr::number(256), Location::new(10, 20));
        assert!(bad_name
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("unexpected format of type name \"X\""));

        let not_power = ModularInteger::new("P::T", Expr::number(255));
        assert!(not_power
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("modulus of \"T\" not power of two"));

        let with_var = ModularInteger::new(
            "P::T",
            Expr::pow(Expr::number(2), Expr::var("X")),
        );
        assert!(with_var
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("modulus of \"T\" contains variable"));

        let too_large = ModularInteger::new(
            "P::T",
            Expr::pow(Expr::number(2), Expr::number(65)),
        );
        assert!(too_large
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("modulus of \"T\" exceeds limit (2**64)"));

        let at_limit = ModularInteger::new(
            "P::T",
            Expr::pow(Expr::number(2), Expr::number(64)),
        );
        assert!(at_limit.error.propagate().is_ok());
        assert_eq!(at_limit.size(), Expr::number(64));
    }

    #[test]
    fn range_validation() {
        let t = RangeInteger::new(
            "P::T",
            Expr::number(0),
            Expr::sub(Expr::pow(Expr::number(2), Expr::number(32)), Expr::number(1)),
            Expr::number(32),
        );
        assert!(t.error.propagate().is_ok());
        assert_eq!(t.size(), Expr::number(32));

        let negative_first = RangeInteger::new(
            "P::T",
            Expr::number(-1),
            Expr::number(0),
            Expr::number(1),
        );
        assert!(negative_first
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("first of \"T\" negative"));

        let negative_range = RangeInteger::new(
            "P::T",
            Expr::number(1),
            Expr::number(0),
            Expr::number(1),
        );
        assert!(negative_range
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("range of \"T\" negative"));

        let too_small = RangeInteger::new(
            "P::T",
            Expr::number(0),
            Expr::number(256),
            Expr::number(8),
        );
        assert!(too_small
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("size of \"T\" too small"));

        let variable_first = RangeInteger::new(
            "P::T",
            Expr::add(vec![Expr::number(1), Expr::var("X")]),
            Expr::number(15),
            Expr::number(4),
        );
        assert!(variable_first
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("first of \"T\" contains variable"));
    }

    #[test]
    fn enumeration_validation() {
        let t = Enumeration::new(
            "P::E",
            vec![("One", 1), ("Two", 2)],
            Expr::number(8),
            false,
        );
        assert!(t.error.propagate().is_ok());
        assert_eq!(t.literals().len(), 2);

        let bad_literal = Enumeration::new(
            "P::E",
            vec![("A B", 1)],
            Expr::number(8),
            false,
        );
        assert!(bad_literal
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("invalid literal name \"A B\" in \"E\""));

        let too_small = Enumeration::new(
            "P::E",
            vec![("A", 256)],
            Expr::number(8),
            false,
        );
        assert!(too_small
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("size of \"E\" too small"));

        let unnecessary = Enumeration::new(
            "P::E",
            vec![("A", 0), ("B", 1)],
            Expr::number(1),
            true,
        );
        assert!(unnecessary
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("unnecessary always-valid aspect on \"E\""));

        let duplicate = Enumeration::new(
            "P::E",
            vec![("A", 1), ("B", 1)],
            Expr::number(8),
            false,
        );
        assert!(duplicate
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("duplicate enumeration value 1 in \"E\""));
    }

    #[test]
    fn sequence_element_size_must_be_byte_aligned() {
        let element = TypeDef::Modular(ModularInteger::new("P::El", Expr::number(16)));
        let t = Sequence::new("P::Arr", element);
        assert!(t
            .error
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("not multiple of 8 bit"));

        let byte_element = TypeDef::Modular(ModularInteger::new("P::El", Expr::number(256)));
        assert!(Sequence::new("P::Arr", byte_element)
            .error
            .propagate()
            .is_ok());
    }

    #[test]
    fn scalar_constraints() {
        let t = TypeDef::Modular(ModularInteger::new("P::T", Expr::number(256)));
        let constraints = t.constraints("F1", false);
        assert!(constraints.contains(&Expr::greater_equal(Expr::var("F1"), Expr::number(0))));
        assert!(constraints.contains(&Expr::less(Expr::var("F1"), Expr::number(256))));
        assert!(constraints.contains(&Expr::equal(Expr::size("F1"), Expr::number(8))));
    }

    #[test]
    fn enumeration_constraints_define_literals() {
        let t = TypeDef::Enumeration(Enumeration::new(
            "P::E",
            vec![("ONE", 1), ("TWO", 2)],
            Expr::number(8),
            false,
        ));
        let constraints = t.constraints("Tag", true);
        assert!(constraints.contains(&Expr::equal(Expr::var("P::ONE"), Expr::number(1))));
        assert!(constraints.contains(&Expr::equal(Expr::var("ONE"), Expr::number(1))));
        assert!(constraints
            .iter()
            .any(|c| matches!(c, Expr::Or(_))));

        let always_valid = TypeDef::Enumeration(Enumeration::new(
            "P::E",
            vec![("ONE", 1)],
            Expr::number(8),
            true,
        ));
        let constraints = always_valid.constraints("Tag", false);
        assert!(constraints.contains(&Expr::less(Expr::var("Tag"), Expr::number(256))));
    }

    #[test]
    fn builtin_boolean() {
        let b = boolean();
        assert!(b.error.propagate().is_ok());
        assert_eq!(b.literals()[&Id::parse("True")], 1);
        assert_eq!(b.literals()[&Id::parse("False")], 0);
    }
}

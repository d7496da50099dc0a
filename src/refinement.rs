//! Refinements.
//!
//! A refinement declares that the opaque payload field of one message
//! carries a message of another type when a condition holds. The condition
//! is evaluated over the fields and enumeration literals of the outer
//! message.

use std::fmt;

use crate::diagnostics::{Diagnostics, Entry, ModelError};
use crate::expr::Expr;
use crate::identifier::Id;
use crate::location::Location;
use crate::message::{Field, Message};
use crate::types::{self, TypeDef};

/// A payload refinement: `for Outer use (Field => Inner) if Condition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refinement {
    identifier: Id,
    package: Id,
    outer: Message,
    field: Field,
    inner: Message,
    condition: Expr,
    location: Location,
    error: Diagnostics,
}

impl Refinement {
    pub fn new(
        package: impl Into<Id>,
        outer: &Message,
        field: Field,
        inner: &Message,
        condition: Expr,
    ) -> Self {
        Self::with_location(package, outer, field, inner, condition, Location::NONE)
    }

    pub fn with_location(
        package: impl Into<Id>,
        outer: &Message,
        field: Field,
        inner: &Message,
        condition: Expr,
        location: Location,
    ) -> Self {
        let package = package.into();
        let mut error = Diagnostics::new();

        if package.parts().len() != 1 {
            error.push(Entry::error(
                format!("unexpected format of package name \"{}\"", package),
                package.location().clone(),
            ));
        }

        match outer.types().get(&field) {
            Some(TypeDef::Opaque(_)) => {}
            Some(_) => {
                error.push(Entry::error(
                    format!(
                        "invalid type of field \"{}\" in refinement of \"{}\"",
                        field.name(),
                        outer.identifier()
                    ),
                    field.location().clone(),
                ));
                error.push(Entry::info(
                    "expected field of type Opaque",
                    field.location().clone(),
                ));
            }
            None => {
                error.push(Entry::error(
                    format!(
                        "invalid field \"{}\" in refinement of \"{}\"",
                        field.name(),
                        outer.identifier()
                    ),
                    field.location().clone(),
                ));
            }
        }

        let literals = outer.qualified_enum_literals();
        let unqualified = outer.unqualified_enum_literals();
        for variable in condition.variables() {
            let known = outer.fields().contains(&Field::new(variable.clone()))
                || literals.contains_key(&variable)
                || unqualified.contains(&variable)
                || types::builtin_literals().contains(&variable);
            if !known {
                error.push(Entry::error(
                    format!(
                        "unknown field or literal \"{}\" in refinement condition of \"{}\"",
                        variable,
                        outer.identifier()
                    ),
                    variable.location().clone(),
                ));
            }
        }

        let identifier = package.join(format!(
            "Refinement_{}_{}_{}",
            inner.identifier().flat(),
            outer.identifier().flat(),
            field.name()
        ));

        Refinement {
            identifier,
            package,
            outer: outer.clone(),
            field,
            inner: inner.clone(),
            condition,
            location,
            error,
        }
    }

    pub fn identifier(&self) -> &Id {
        &self.identifier
    }

    pub fn package(&self) -> &Id {
        &self.package
    }

    pub fn outer(&self) -> &Message {
        &self.outer
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn inner(&self) -> &Message {
        &self.inner
    }

    pub fn condition(&self) -> &Expr {
        &self.condition
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn propagate(&self) -> Result<(), ModelError> {
        self.error.propagate()
    }
}

impl fmt::Display for Refinement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "for {} use ({} => {})",
            self.outer.identifier().name(),
            self.field.name(),
            self.inner.identifier().name()
        )?;
        if self.condition != Expr::True {
            write!(f, " if {}", self.condition)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Link;
    use crate::types::{ModularInteger, Opaque};

    fn payload_message() -> Message {
        Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("Tag")),
                Link::new(Field::new("Tag"), Field::new("Payload"))
                    .with_size(Expr::number(16)),
                Link::new(Field::new("Payload"), Field::final_()),
            ],
            vec![
                (
                    Field::new("Tag"),
                    TypeDef::Modular(ModularInteger::new("P::T", Expr::number(256))),
                ),
                (Field::new("Payload"), TypeDef::Opaque(Opaque::new())),
            ],
        )
    }

    fn inner_message() -> Message {
        Message::new(
            "P::Inner",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::final_()),
            ],
            vec![(
                Field::new("A"),
                TypeDef::Modular(ModularInteger::new("P::T", Expr::number(256))),
            )],
        )
    }

    #[test]
    fn valid_refinement() {
        let refinement = Refinement::new(
            "P",
            &payload_message(),
            Field::new("Payload"),
            &inner_message(),
            Expr::equal(Expr::var("Tag"), Expr::number(1)),
        );
        assert!(refinement.propagate().is_ok());
        assert_eq!(
            refinement.to_string(),
            "for M use (Payload => Inner) if Tag = 1"
        );
    }

    #[test]
    fn multi_part_package_is_rejected() {
        let refinement = Refinement::new(
            "A::B",
            &payload_message(),
            Field::new("Payload"),
            &inner_message(),
            Expr::True,
        );
        assert!(refinement
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("unexpected format of package name \"A::B\""));
    }

    #[test]
    fn non_opaque_field_is_rejected() {
        let refinement = Refinement::new(
            "P",
            &payload_message(),
            Field::new("Tag"),
            &inner_message(),
            Expr::True,
        );
        let rendered = refinement.propagate().unwrap_err().to_string();
        assert!(rendered.contains("invalid type of field \"Tag\" in refinement of \"P::M\""));
        assert!(rendered.contains("expected field of type Opaque"));
    }

    #[test]
    fn unknown_refinement_field_is_rejected() {
        let refinement = Refinement::new(
            "P",
            &payload_message(),
            Field::new("Missing"),
            &inner_message(),
            Expr::True,
        );
        assert!(refinement
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("invalid field \"Missing\" in refinement of \"P::M\""));
    }

    #[test]
    fn unknown_condition_variable_is_rejected() {
        let refinement = Refinement::new(
            "P",
            &payload_message(),
            Field::new("Payload"),
            &inner_message(),
            Expr::equal(Expr::var("Nonexistent"), Expr::number(1)),
        );
        assert!(refinement
            .propagate()
            .unwrap_err()
            .to_string()
            .contains("unknown field or literal \"Nonexistent\" in refinement condition"));
    }
}

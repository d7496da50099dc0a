//! Message merging.
//!
//! Inlining of a message-typed field into its container: the inner fields
//! are prefixed with the field name, attribute references to the inner
//! message are rewritten relative to the new context, the links around the
//! field are rewired, and branches whose merged conditions are provably
//! unsatisfiable are dropped. The result is a new unproven message; the
//! caller is expected to re-verify it.
//!
//! Merging iterates until no message-typed field remains; every iteration
//! removes one, so the loop terminates.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::diagnostics::{Diagnostics, Entry, ModelError};
use crate::expr::Expr;
use crate::identifier::Id;
use crate::proof::{prove, Config, ProofResult};
use crate::types::TypeDef;

use super::{ByteOrder, Field, Link, Message};

/// Arguments for parameterized inner messages:
/// inner identifier → (parameter name → argument expression).
pub type MessageArguments = BTreeMap<Id, BTreeMap<Id, Expr>>;

impl Message {
    /// Expand every message-typed field, innermost references included.
    pub fn merged(
        &self,
        message_arguments: &MessageArguments,
        config: &Config,
    ) -> Result<Message, ModelError> {
        let mut message = self.clone();
        loop {
            let inner = message.types().iter().find_map(|(f, t)| match t {
                TypeDef::Message(m) => Some((f.clone(), (**m).clone())),
                _ => None,
            });
            let (field, inner_message) = match inner {
                Some(found) => found,
                None => return Ok(message),
            };
            debug!(
                outer = %message.identifier(),
                inner = %inner_message.identifier(),
                field = %field,
                "merging inner message"
            );
            message = merge_inner_message(&message, &field, &inner_message, message_arguments, config)?;
        }
    }
}

fn merge_inner_message(
    message: &Message,
    field: &Field,
    inner_message: &Message,
    message_arguments: &MessageArguments,
    config: &Config,
) -> Result<Message, ModelError> {
    let inner = replace_message_attributes(
        &inner_message.prefixed(&format!("{}_", field.name())),
    );
    inner.propagate()?;

    let mut error = Diagnostics::new();
    check_message_attributes(message, &inner, field, &mut error);
    check_name_conflicts(message, &inner, field, &mut error);
    error.propagate()?;

    let mut substitution: BTreeMap<Expr, Expr> = message_arguments
        .get(inner.identifier())
        .map(|arguments| {
            arguments
                .iter()
                .map(|(parameter, value)| (Expr::var(parameter.clone()), value.clone()))
                .collect()
        })
        .unwrap_or_default();

    let mut structure: BTreeSet<Link> = BTreeSet::new();

    for path in message.paths(&Field::final_()).iter() {
        for link in path {
            if &link.target == field {
                // Rewire into the inner initial link; the inner start is
                // anchored at the outer predecessor.
                substitution.insert(
                    Expr::var(Field::initial().id().clone()),
                    Expr::var(link.source.id().clone()),
                );
                let initial_link = inner
                    .outgoing(&Field::initial())
                    .into_iter()
                    .next()
                    .expect("validated inner message has an initial link");
                structure.insert(Link {
                    source: link.source.clone(),
                    target: initial_link.target.clone(),
                    condition: link.condition.substituted_mapping(&substitution),
                    size: initial_link.size.substituted_mapping(&substitution),
                    first: link.first.substituted_mapping(&substitution),
                    location: link.location.clone(),
                });
            } else if &link.source == field {
                for final_link in inner.incoming(&Field::final_()) {
                    let merged_condition = Expr::and(vec![
                        link.condition.clone(),
                        final_link.condition.clone(),
                    ])
                    .substituted_mapping(&substitution);

                    let mut assumptions = Message::message_constraints();
                    assumptions.extend(inner.type_constraints(&merged_condition));
                    assumptions.push(inner.path_condition(&final_link.source));
                    let proof = prove(&merged_condition, &assumptions, config);
                    if proof.result == ProofResult::Unsat {
                        continue;
                    }

                    let mut size_substitution = substitution.clone();
                    size_substitution.insert(
                        Expr::last(field.id().clone()),
                        Expr::last(final_link.source.id().clone()),
                    );
                    structure.insert(Link {
                        source: final_link.source.clone(),
                        target: link.target.clone(),
                        condition: merged_condition.simplified(),
                        size: link.size.substituted_mapping(&size_substitution),
                        first: link.first.substituted_mapping(&substitution),
                        location: link.location.clone(),
                    });
                }
            } else {
                structure.insert(link.clone());
            }
        }
    }

    let given_arguments: BTreeSet<Id> = message_arguments
        .get(inner.identifier())
        .map(|arguments| arguments.keys().cloned().collect())
        .unwrap_or_default();

    structure.extend(
        inner
            .structure()
            .iter()
            .filter(|l| !l.target.is_final() && !l.source.is_initial())
            .map(|l| Link {
                source: l.source.clone(),
                target: l.target.clone(),
                condition: l.condition.substituted_mapping(&substitution),
                size: l.size.substituted_mapping(&substitution),
                first: l.first.substituted_mapping(&substitution),
                location: l.location.clone(),
            }),
    );

    let mut types: BTreeMap<Field, TypeDef> = message
        .types()
        .iter()
        .filter(|(f, _)| *f != field)
        .map(|(f, t)| (f.clone(), t.clone()))
        .collect();
    types.extend(
        inner
            .types()
            .iter()
            .filter(|(f, _)| !given_arguments.contains(f.id()))
            .map(|(f, t)| (f.clone(), t.clone())),
    );

    let mut byte_order: BTreeMap<Field, ByteOrder> = message
        .byte_order()
        .iter()
        .filter(|(f, _)| *f != field)
        .map(|(f, o)| (f.clone(), *o))
        .collect();
    byte_order.extend(inner.byte_order().iter().map(|(f, o)| (f.clone(), *o)));

    let (structure, types, byte_order) =
        prune_dangling_fields(structure.into_iter().collect(), types, byte_order);

    if structure.is_empty() || types.is_empty() {
        let mut error = Diagnostics::new();
        error.push(Entry::error(
            format!("empty message type when merging field \"{}\"", field.name()),
            field.location().clone(),
        ));
        return Err(error.propagate().unwrap_err());
    }

    let merged = message.copy_with(structure, types, byte_order);
    merged.propagate()?;
    Ok(merged)
}

/// Rewrite attribute references to the inner message relative to the
/// enclosing context: the inner start becomes the first inner field, the
/// inner size becomes the distance to the outer predecessor, and the inner
/// end keeps denoting the end of the enclosing message.
fn replace_message_attributes(message: &Message) -> Message {
    let first_field = message
        .outgoing(&Field::initial())
        .into_iter()
        .next()
        .expect("validated message has an initial link")
        .target;

    let replace = |expression: &Expr| -> Expr {
        expression.substituted(&mut |e| match e {
            Expr::First(a) if a.prefix.name() == "Message" => Some(
                Expr::first(first_field.id().clone()).at(a.location.clone()),
            ),
            Expr::Size(a) if a.prefix.name() == "Message" => Some(
                Expr::sub(
                    Expr::last(Id::parse("Message").at(a.location.clone())),
                    Expr::last(Field::initial().id().clone()),
                ),
            ),
            _ => None,
        })
    };

    let structure = message
        .structure()
        .iter()
        .map(|l| Link {
            source: l.source.clone(),
            target: l.target.clone(),
            condition: replace(&l.condition),
            size: replace(&l.size),
            first: replace(&l.first),
            location: l.location.clone(),
        })
        .collect();

    message.copy_with(structure, message.types().clone(), message.byte_order().clone())
}

/// An inner message that still refers to the enclosing message end, or has
/// an implicit size, can only be inlined in last-field position.
fn check_message_attributes(
    message: &Message,
    inner: &Message,
    field: &Field,
    error: &mut Diagnostics,
) {
    let mid_position = message
        .outgoing(field)
        .iter()
        .any(|l| !l.target.is_final());
    if !mid_position {
        return;
    }

    fn message_reference(e: &Expr) -> bool {
        match e {
            Expr::Variable(v) => v.id.name() == "Message",
            Expr::First(a) | Expr::Last(a) | Expr::Size(a) => a.prefix.name() == "Message",
            _ => false,
        }
    }

    let conditions: Vec<_> = inner
        .structure()
        .iter()
        .flat_map(|l| l.condition.find_all(&message_reference))
        .map(Expr::location)
        .collect();
    let sizes: Vec<_> = inner
        .structure()
        .iter()
        .flat_map(|l| l.size.find_all(&message_reference))
        .map(Expr::location)
        .collect();

    for (locations, kind) in [
        (conditions, "reference to \"Message\""),
        (sizes, "implicit size"),
    ] {
        if locations.is_empty() {
            continue;
        }
        error.push(Entry::error(
            format!("messages with {} may only be used for last fields", kind),
            field.location().clone(),
        ));
        for location in locations {
            error.push(Entry::info(
                format!("message field with {} in \"{}\"", kind, inner.identifier()),
                location,
            ));
        }
    }
}

fn check_name_conflicts(
    message: &Message,
    inner: &Message,
    field: &Field,
    error: &mut Diagnostics,
) {
    for outer_field in message.fields() {
        if inner.fields().iter().any(|g| g.name() == outer_field.name()) {
            error.push(Entry::error(
                format!(
                    "name conflict for \"{}\" in \"{}\"",
                    outer_field.name(),
                    message.identifier()
                ),
                outer_field.location().clone(),
            ));
            error.push(Entry::info(
                format!("when merging message \"{}\"", inner.identifier()),
                inner.location().clone(),
            ));
            error.push(Entry::info(
                format!("into field \"{}\"", field.name()),
                field.location().clone(),
            ));
            return;
        }
    }
}

/// Drop fields from which the message end is no longer reachable: a field
/// without outgoing links is dead, and so are the links into it. Iterate to
/// a fixpoint.
fn prune_dangling_fields(
    mut structure: Vec<Link>,
    types: BTreeMap<Field, TypeDef>,
    byte_order: BTreeMap<Field, ByteOrder>,
) -> (Vec<Link>, BTreeMap<Field, TypeDef>, BTreeMap<Field, ByteOrder>) {
    let mut dangling: BTreeSet<Field> = BTreeSet::new();
    loop {
        let fields: BTreeSet<Field> = structure
            .iter()
            .flat_map(|l| [l.source.clone(), l.target.clone()])
            .filter(|f| !f.is_final())
            .collect();
        let mut progress = false;
        for field in fields {
            if structure.iter().all(|l| l.source != field) {
                dangling.insert(field);
                progress = true;
            }
        }
        if !progress {
            break;
        }
        structure.retain(|l| !dangling.contains(&l.target));
    }

    (
        structure,
        types
            .into_iter()
            .filter(|(f, _)| !dangling.contains(f))
            .collect(),
        byte_order
            .into_iter()
            .filter(|(f, _)| !dangling.contains(f))
            .collect(),
    )
}

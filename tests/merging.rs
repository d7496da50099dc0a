//! End-to-end merging of nested message types.

mod common;

use common::{byte, config, opaque};
use wireform::{Expr, Field, Link, Message, MessageArguments, TypeDef};

fn no_arguments() -> MessageArguments {
    MessageArguments::new()
}

/// A self-contained inner message with explicit sizes.
fn inner() -> Message {
    Message::new(
        "Test::Inner",
        vec![
            Link::new(Field::initial(), Field::new("Kind")),
            Link::new(Field::new("Kind"), Field::new("Data"))
                .with_size(Expr::number(16)),
            Link::new(Field::new("Data"), Field::final_()),
        ],
        vec![(Field::new("Kind"), byte()), (Field::new("Data"), opaque())],
    )
}

#[test]
fn merged_message_verifies() {
    let outer = Message::new(
        "Test::Outer",
        vec![
            Link::new(Field::initial(), Field::new("Header")),
            Link::new(Field::new("Header"), Field::new("Nested")),
            Link::new(Field::new("Nested"), Field::final_()),
        ],
        vec![
            (Field::new("Header"), byte()),
            (Field::new("Nested"), TypeDef::Message(Box::new(inner()))),
        ],
    );

    let merged = outer.merged(&no_arguments(), &config()).unwrap();
    assert_eq!(
        merged.fields(),
        &[
            Field::new("Header"),
            Field::new("Nested_Kind"),
            Field::new("Nested_Data"),
        ]
    );

    let verified = merged.verified(&config()).unwrap();
    assert_eq!(verified.max_size().unwrap(), Expr::number(8 + 8 + 16));
}

#[test]
fn merging_is_idempotent_without_nested_types() {
    let message = inner();
    let merged = message.merged(&no_arguments(), &config()).unwrap();
    assert_eq!(merged, message);
}

#[test]
fn nested_message_with_message_reference_must_be_last() {
    // The inner condition refers to the end of the enclosing message, so
    // the inner message is only meaningful in last-field position.
    let inner = Message::new(
        "Test::Tail",
        vec![
            Link::new(Field::initial(), Field::new("V")),
            Link::new(Field::new("V"), Field::final_())
                .with_condition(Expr::greater(Expr::last("Message"), Expr::number(16))),
        ],
        vec![(Field::new("V"), byte())],
    );

    let outer = Message::new(
        "Test::Outer",
        vec![
            Link::new(Field::initial(), Field::new("X")),
            Link::new(Field::new("X"), Field::new("Trailer")),
            Link::new(Field::new("Trailer"), Field::final_()),
        ],
        vec![
            (Field::new("X"), TypeDef::Message(Box::new(inner))),
            (Field::new("Trailer"), byte()),
        ],
    );

    let rendered = outer
        .merged(&no_arguments(), &config())
        .unwrap_err()
        .to_string();
    assert!(rendered
        .contains("messages with reference to \"Message\" may only be used for last fields"));
}

#[test]
fn nested_message_in_last_position_with_message_reference_is_accepted() {
    let inner = Message::new(
        "Test::Tail",
        vec![
            Link::new(Field::initial(), Field::new("V")),
            Link::new(Field::new("V"), Field::final_())
                .with_condition(Expr::greater_equal(Expr::last("Message"), Expr::number(16))),
        ],
        vec![(Field::new("V"), byte())],
    );

    let outer = Message::new(
        "Test::Outer",
        vec![
            Link::new(Field::initial(), Field::new("X")),
            Link::new(Field::new("X"), Field::final_()),
        ],
        vec![(Field::new("X"), TypeDef::Message(Box::new(inner)))],
    );

    let merged = outer.merged(&no_arguments(), &config()).unwrap();
    assert_eq!(merged.fields(), &[Field::new("X_V")]);
}

#[test]
fn doubly_nested_messages_are_flattened() {
    let middle = Message::new(
        "Test::Middle",
        vec![
            Link::new(Field::initial(), Field::new("M")),
            Link::new(Field::new("M"), Field::new("Tail")),
            Link::new(Field::new("Tail"), Field::final_()),
        ],
        vec![
            (Field::new("M"), byte()),
            (Field::new("Tail"), TypeDef::Message(Box::new(inner()))),
        ],
    );
    let outer = Message::new(
        "Test::Outer",
        vec![
            Link::new(Field::initial(), Field::new("Wrapped")),
            Link::new(Field::new("Wrapped"), Field::final_()),
        ],
        vec![(Field::new("Wrapped"), TypeDef::Message(Box::new(middle)))],
    );

    let merged = outer.merged(&no_arguments(), &config()).unwrap();
    assert!(!merged
        .types()
        .values()
        .any(|t| matches!(t, TypeDef::Message(_))));
    assert_eq!(
        merged.fields(),
        &[
            Field::new("Wrapped_M"),
            Field::new("Wrapped_Tail_Kind"),
            Field::new("Wrapped_Tail_Data"),
        ]
    );
    assert!(merged.verified(&config()).is_ok());
}

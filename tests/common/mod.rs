//! Shared builders for integration tests.
//!
//! Not every test binary uses every builder.
#![allow(dead_code)]

use wireform::{Config, Enumeration, Expr, ModularInteger, Opaque, RangeInteger, TypeDef};

pub fn config() -> Config {
    Config::default()
}

/// An 8-bit modular integer type.
pub fn byte() -> TypeDef {
    TypeDef::Modular(ModularInteger::new("Test::Byte", Expr::number(256)))
}

/// A 16-bit modular integer type.
pub fn word() -> TypeDef {
    TypeDef::Modular(ModularInteger::new("Test::Word", Expr::number(65536)))
}

/// A bounded integer type covering 0 .. 100 in 8 bit.
pub fn small_range() -> TypeDef {
    TypeDef::Range(RangeInteger::new(
        "Test::Small",
        Expr::number(0),
        Expr::number(100),
        Expr::number(8),
    ))
}

/// An 8-bit enumeration with two literals.
pub fn tag_enum() -> TypeDef {
    TypeDef::Enumeration(Enumeration::new(
        "Test::Tag",
        vec![("Msg_Data", 1), ("Msg_Error", 3)],
        Expr::number(8),
        false,
    ))
}

pub fn opaque() -> TypeDef {
    TypeDef::Opaque(Opaque::new())
}

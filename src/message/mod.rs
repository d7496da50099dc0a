//! The message graph.
//!
//! A message is a directed acyclic graph of fields linked by conditional
//! transitions with size/offset aspects, between an implicit `Initial`
//! source and a `Final` sink. Construction validates the structure, then
//! normalizes it (enumeration-literal qualification, implicit-size
//! insertion) and fixes the topological field order with Kahn's algorithm.
//!
//! A [`Message`] is unproven until [`Message::verified`] discharges the
//! proof phases (see [`verify`]); merging and prefixing operate on the
//! unproven form and invalidate any previous proof.

pub mod merge;
pub mod verify;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use crate::diagnostics::{Diagnostics, Entry, ModelError};
use crate::expr::Expr;
use crate::identifier::Id;
use crate::location::Location;
use crate::types::{Enumeration, TypeDef};

/// Transmission order of the bytes of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ByteOrder {
    HighOrderFirst,
    LowOrderFirst,
}

/// A named slot in a message.
///
/// The two sentinels [`Field::initial`] and [`Field::final_`] delimit the
/// graph and never occur in the type map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Field(Id);

impl Field {
    pub fn new(id: impl Into<Id>) -> Self {
        Field(id.into())
    }

    /// The implicit source of the first link.
    pub fn initial() -> Self {
        Field(Id::parse("Initial"))
    }

    /// The implicit sink of the last links.
    pub fn final_() -> Self {
        Field(Id::parse("Final"))
    }

    pub fn is_initial(&self) -> bool {
        self.name() == "Initial"
    }

    pub fn is_final(&self) -> bool {
        self.name() == "Final"
    }

    pub fn id(&self) -> &Id {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn location(&self) -> &Location {
        self.0.location()
    }

    /// This field's name with `prefix` prepended; sentinels are preserved.
    pub fn prefixed(&self, prefix: &str) -> Field {
        if self.is_initial() || self.is_final() {
            self.clone()
        } else {
            Field(self.0.prefixed(prefix))
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directed edge between two fields.
///
/// `condition` defaults to `True`; `size` and `first` default to
/// `Undefined`, meaning the aspect is derived. Links are immutable once the
/// owning message is validated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Link {
    pub source: Field,
    pub target: Field,
    pub condition: Expr,
    pub size: Expr,
    pub first: Expr,
    pub location: Location,
}

impl Link {
    pub fn new(source: Field, target: Field) -> Self {
        Link {
            source,
            target,
            condition: Expr::True,
            size: Expr::Undefined,
            first: Expr::Undefined,
            location: Location::NONE,
        }
    }

    pub fn with_condition(mut self, condition: Expr) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_size(mut self, size: Expr) -> Self {
        self.size = size;
        self
    }

    pub fn with_first(mut self, first: Expr) -> Self {
        self.first = first;
        self
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    /// Whether the size aspect refers to the enclosing message
    /// (`Message'Size` or `Message'Last`), i.e. can only be resolved once
    /// the end of the message is known.
    pub fn has_implicit_size(&self) -> bool {
        self.size.contains(&Expr::size("Message")) || self.size.contains(&Expr::last("Message"))
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = if self.target.is_final() {
            "null".to_string()
        } else {
            self.target.name().to_string()
        };
        write!(f, "then {}", target)?;
        let mut aspects = Vec::new();
        if self.size != Expr::Undefined {
            aspects.push(format!("Size => {}", self.size));
        }
        if self.first != Expr::Undefined {
            aspects.push(format!("First => {}", self.first));
        }
        if !aspects.is_empty() {
            write!(f, " with {}", aspects.join(", "))?;
        }
        if self.condition != Expr::True {
            write!(f, " if {}", self.condition)?;
        }
        Ok(())
    }
}

/// A sequence of links from `Initial` to some field.
pub type Path = Vec<Link>;

/// A message type: fields, links, and per-field model types.
///
/// Constructed unproven; [`Message::verified`] runs the proof phases and
/// seals the result as a [`verify::VerifiedMessage`].
#[derive(Debug, Clone)]
pub struct Message {
    identifier: Id,
    structure: Vec<Link>,
    types: BTreeMap<Field, TypeDef>,
    checksums: BTreeMap<Id, Vec<Expr>>,
    byte_order: BTreeMap<Field, ByteOrder>,
    location: Location,
    error: Diagnostics,
    base: Option<Id>,

    fields: Vec<Field>,
    parameters: Vec<Field>,
    has_unreachable: bool,

    paths_cache: RefCell<BTreeMap<Field, Rc<BTreeSet<Path>>>>,
    path_condition_cache: RefCell<BTreeMap<Field, Expr>>,
    definite_predecessor_cache: RefCell<BTreeMap<Field, Vec<Field>>>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
            && self.structure == other.structure
            && self.types == other.types
            && self.checksums == other.checksums
            && self.byte_order == other.byte_order
    }
}

impl Eq for Message {}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Message {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (
            &self.identifier,
            &self.structure,
            &self.types,
            &self.checksums,
            &self.byte_order,
        )
            .cmp(&(
                &other.identifier,
                &other.structure,
                &other.types,
                &other.checksums,
                &other.byte_order,
            ))
    }
}

impl std::hash::Hash for Message {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
        self.structure.hash(state);
        self.types.hash(state);
    }
}

impl Message {
    /// Create a message from its link structure and field types.
    pub fn new(
        identifier: impl Into<Id>,
        structure: Vec<Link>,
        types: Vec<(Field, TypeDef)>,
    ) -> Self {
        Self::with_location(identifier, structure, types, Location::NONE)
    }

    pub fn with_location(
        identifier: impl Into<Id>,
        structure: Vec<Link>,
        types: Vec<(Field, TypeDef)>,
        location: Location,
    ) -> Self {
        Self::construct(
            identifier.into(),
            structure,
            types.into_iter().collect(),
            BTreeMap::new(),
            BTreeMap::new(),
            location,
            None,
            Diagnostics::new(),
        )
    }

    /// Attach checksum definitions. Validated during verification.
    pub fn with_checksums(mut self, checksums: Vec<(Id, Vec<Expr>)>) -> Self {
        self.checksums = checksums.into_iter().collect();
        self
    }

    /// Override the byte order of individual fields; unlisted fields keep
    /// `HighOrderFirst`.
    pub fn with_byte_order(mut self, byte_order: Vec<(Field, ByteOrder)>) -> Self {
        for (field, order) in byte_order {
            self.byte_order.insert(field, order);
        }
        self
    }

    /// A message inheriting the structure of `base` under a new name.
    /// Deriving from an already-derived message is rejected.
    pub fn derived(identifier: impl Into<Id>, base: &Message) -> Self {
        Self::derived_with_location(identifier, base, base.location.clone())
    }

    pub fn derived_with_location(
        identifier: impl Into<Id>,
        base: &Message,
        location: Location,
    ) -> Self {
        let identifier = identifier.into();
        let mut error = Diagnostics::new();
        error.append(&base.error);

        if base.base.is_some() {
            error.push(Entry::error(
                format!("illegal derivation \"{}\"", identifier),
                location.clone(),
            ));
            error.push(Entry::info(
                format!("illegal base message type \"{}\"", base.identifier),
                base.location.clone(),
            ));
        }

        Self::construct(
            identifier,
            base.structure.clone(),
            base.types.clone(),
            base.checksums.clone(),
            base.byte_order.clone(),
            location,
            Some(base.identifier.clone()),
            error,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn construct(
        identifier: Id,
        structure: Vec<Link>,
        types: BTreeMap<Field, TypeDef>,
        checksums: BTreeMap<Id, Vec<Expr>>,
        byte_order: BTreeMap<Field, ByteOrder>,
        location: Location,
        base: Option<Id>,
        mut error: Diagnostics,
    ) -> Self {
        if identifier.parts().len() != 2 {
            error.push(Entry::error(
                format!("unexpected format of type name \"{}\"", identifier),
                location.clone(),
            ));
        }

        let mut structure = structure;
        structure.sort();

        let mut message = Message {
            identifier,
            structure,
            types,
            checksums,
            byte_order,
            location,
            error,
            base,
            fields: Vec::new(),
            parameters: Vec::new(),
            has_unreachable: false,
            paths_cache: RefCell::new(BTreeMap::new()),
            path_condition_cache: RefCell::new(BTreeMap::new()),
            definite_predecessor_cache: RefCell::new(BTreeMap::new()),
        };

        if !message.structure.is_empty() || !message.types.is_empty() {
            message.validate();
            if !message.error.has_errors() {
                message.normalize();
                if let Some(fields) = message.topological_sort() {
                    let structure_fields = message.structure_fields();
                    message.parameters = message
                        .types
                        .keys()
                        .filter(|f| !structure_fields.contains(f))
                        .cloned()
                        .collect();
                    message.fields = fields;
                }
            }
        }

        for field in &message.fields {
            message
                .byte_order
                .entry(field.clone())
                .or_insert(ByteOrder::HighOrderFirst);
        }

        message
    }

    /// A copy with a replaced structure, re-validated and re-normalized.
    /// Checksums, location, and derivation state carry over; any previous
    /// proof is invalidated.
    pub(crate) fn copy_with(
        &self,
        structure: Vec<Link>,
        types: BTreeMap<Field, TypeDef>,
        byte_order: BTreeMap<Field, ByteOrder>,
    ) -> Message {
        Self::construct(
            self.identifier.clone(),
            structure,
            types,
            self.checksums.clone(),
            byte_order,
            self.location.clone(),
            self.base.clone(),
            Diagnostics::new(),
        )
    }

    // Accessors

    pub fn identifier(&self) -> &Id {
        &self.identifier
    }

    pub fn package(&self) -> Id {
        self.identifier.package()
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn structure(&self) -> &[Link] {
        &self.structure
    }

    pub fn types(&self) -> &BTreeMap<Field, TypeDef> {
        &self.types
    }

    pub fn checksums(&self) -> &BTreeMap<Id, Vec<Expr>> {
        &self.checksums
    }

    pub fn byte_order(&self) -> &BTreeMap<Field, ByteOrder> {
        &self.byte_order
    }

    /// Accumulated construction diagnostics.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.error
    }

    /// The base message identifier, for derived messages.
    pub fn base(&self) -> Option<&Id> {
        self.base.as_ref()
    }

    /// Raise accumulated structural errors.
    pub fn propagate(&self) -> Result<(), ModelError> {
        self.error.propagate()
    }

    /// Non-parameter fields, topologically sorted.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Fields absent from the link structure; always scalar.
    pub fn parameters(&self) -> &[Field] {
        &self.parameters
    }

    /// `Initial`, all fields in topological order, `Final`.
    pub fn all_fields(&self) -> Vec<Field> {
        let mut result = vec![Field::initial()];
        result.extend(self.fields.iter().cloned());
        result.push(Field::final_());
        result
    }

    /// Links with the given target, in structure order.
    pub fn incoming(&self, field: &Field) -> Vec<Link> {
        self.structure
            .iter()
            .filter(|l| &l.target == field)
            .cloned()
            .collect()
    }

    /// Links with the given source, in structure order.
    pub fn outgoing(&self, field: &Field) -> Vec<Link> {
        self.structure
            .iter()
            .filter(|l| &l.source == field)
            .cloned()
            .collect()
    }

    /// All fields before `field` in topological order.
    pub fn predecessors(&self, field: &Field) -> Vec<Field> {
        if field.is_initial() {
            return Vec::new();
        }
        if field.is_final() {
            return self.fields.clone();
        }
        match self.fields.iter().position(|f| f == field) {
            Some(index) => self.fields[..index].to_vec(),
            None => Vec::new(),
        }
    }

    /// All fields after `field` in topological order.
    pub fn successors(&self, field: &Field) -> Vec<Field> {
        if field.is_initial() {
            return self.fields.clone();
        }
        if field.is_final() {
            return Vec::new();
        }
        match self.fields.iter().position(|f| f == field) {
            Some(index) => self.fields[index + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Distinct sources of incoming links, in structure order.
    pub fn direct_predecessors(&self, field: &Field) -> Vec<Field> {
        let mut result = Vec::new();
        for link in self.incoming(field) {
            if !result.contains(&link.source) {
                result.push(link.source);
            }
        }
        result
    }

    /// Distinct targets of outgoing links, in structure order.
    pub fn direct_successors(&self, field: &Field) -> Vec<Field> {
        let mut result = Vec::new();
        for link in self.outgoing(field) {
            if !result.contains(&link.target) {
                result.push(link.target);
            }
        }
        result
    }

    /// Set of link paths from `Initial` to `field`. Memoized; finite
    /// because the validated structure is acyclic.
    pub fn paths(&self, field: &Field) -> Rc<BTreeSet<Path>> {
        if field.is_initial() {
            return Rc::new(BTreeSet::new());
        }
        if let Some(cached) = self.paths_cache.borrow().get(field) {
            return Rc::clone(cached);
        }

        let mut result = BTreeSet::new();
        for link in self.incoming(field) {
            let source_paths = self.paths(&link.source);
            if source_paths.is_empty() {
                result.insert(vec![link]);
            } else {
                for path in source_paths.iter() {
                    let mut extended = path.clone();
                    extended.push(link.clone());
                    result.insert(extended);
                }
            }
        }

        let result = Rc::new(result);
        self.paths_cache
            .borrow_mut()
            .insert(field.clone(), Rc::clone(&result));
        result
    }

    /// Fields occurring on every path to `field`.
    pub fn definite_predecessors(&self, field: &Field) -> Vec<Field> {
        if let Some(cached) = self.definite_predecessor_cache.borrow().get(field) {
            return cached.clone();
        }
        let paths = self.paths(field);
        let result: Vec<Field> = self
            .fields
            .iter()
            .filter(|f| {
                !paths.is_empty()
                    && paths
                        .iter()
                        .all(|path| path.iter().any(|link| &link.source == *f))
            })
            .cloned()
            .collect();
        self.definite_predecessor_cache
            .borrow_mut()
            .insert(field.clone(), result.clone());
        result
    }

    /// Disjunction over the incoming paths of the conjunction of the link
    /// conditions along each path, simplified.
    pub fn path_condition(&self, field: &Field) -> Expr {
        if field.is_initial() {
            return Expr::True;
        }
        if let Some(cached) = self.path_condition_cache.borrow().get(field) {
            return cached.clone();
        }

        let disjuncts: Vec<Expr> = self
            .incoming(field)
            .into_iter()
            .map(|link| Expr::and(vec![self.path_condition(&link.source), link.condition]))
            .collect();
        let result = Expr::or(disjuncts).simplified();

        self.path_condition_cache
            .borrow_mut()
            .insert(field.clone(), result.clone());
        result
    }

    /// The fixed size of a field in bits, or a diagnostic if the field has
    /// no fixed size.
    pub fn field_size(&self, field: &Field) -> Result<Expr, ModelError> {
        if field.is_final() {
            return Ok(Expr::number(0));
        }

        let field_type = match self.types.get(field) {
            Some(t) => t,
            None => {
                let mut error = Diagnostics::new();
                error.push(Entry::error(
                    format!(
                        "field \"{}\" not found in \"{}\"",
                        field.name(),
                        self.identifier
                    ),
                    field.location().clone(),
                ));
                return Err(error.propagate().unwrap_err());
            }
        };

        if let Some(size) = field_type.scalar_size() {
            return Ok(size);
        }

        let mapping = to_mapping(&self.type_constraints(&Expr::True));
        let sizes: Vec<Expr> = self
            .incoming(field)
            .iter()
            .map(|l| l.size.substituted_mapping(&mapping).simplified())
            .collect();

        if let Some(first) = sizes.first() {
            if first.as_number().is_some() && sizes.iter().all(|s| s == first) {
                return Ok(first.clone());
            }
        }

        let mut error = Diagnostics::new();
        error.push(Entry::error(
            format!(
                "unable to calculate size of field \"{}\" of message \"{}\"",
                field.name(),
                self.identifier
            ),
            field.location().clone(),
        ));
        Err(error.propagate().unwrap_err())
    }

    /// Whether every instance of the message has the same size.
    pub fn has_fixed_size(&self) -> bool {
        let type_literals = self.type_literals();
        self.paths(&Field::final_()).len() <= 1
            && self
                .structure
                .iter()
                .flat_map(|l| l.size.variables())
                .all(|v| type_literals.contains_key(&v))
    }

    /// Whether any link size refers to the enclosing message.
    pub fn has_implicit_size(&self) -> bool {
        self.structure.iter().any(Link::has_implicit_size)
    }

    /// Whether the message has an explicit size, no optional fields, and no
    /// parameters. Messages with positional attributes in conditions or
    /// sizes, or with sequence-typed fields, are not definite.
    pub fn is_definite(&self) -> bool {
        let positional = |e: &Expr| matches!(e, Expr::First(_) | Expr::Last(_));
        self.paths(&Field::final_()).len() <= 1
            && !self.has_implicit_size()
            && self
                .structure
                .iter()
                .all(|l| l.condition.find_all(&positional).is_empty())
            && self
                .structure
                .iter()
                .all(|l| l.size.find_all(&positional).is_empty())
            && self.parameters.is_empty()
            && !self
                .types
                .values()
                .any(|t| matches!(t, TypeDef::Sequence(_)))
    }

    /// Return a new message with every non-parameter field, and every free
    /// variable referring to such a field, prefixed with `prefix`.
    /// Parameter names are preserved; unqualified enumeration literals are
    /// qualified against the message package.
    pub fn prefixed(&self, prefix: &str) -> Message {
        let fields: BTreeSet<Id> = self.fields.iter().map(|f| f.id().clone()).collect();
        let parameters: BTreeSet<Id> = self.parameters.iter().map(|f| f.id().clone()).collect();
        let package = self.package();

        let prefixed_expression = |expression: &Expr| -> Expr {
            let mut mapping = BTreeMap::new();
            for var in expression.variables() {
                if fields.contains(&var) {
                    mapping.insert(
                        Expr::var(var.clone()),
                        Expr::var(var.prefixed(prefix)),
                    );
                } else if var.parts().len() == 1
                    && var.name() != "Message"
                    && var.name() != "Initial"
                    && var.name() != "Final"
                    && !parameters.contains(&var)
                    && !crate::types::builtin_literals().contains(&var)
                {
                    mapping.insert(
                        Expr::var(var.clone()),
                        Expr::var(package.join(var.name())),
                    );
                }
            }
            expression.substituted_mapping(&mapping).simplified()
        };

        let structure = self
            .structure
            .iter()
            .map(|l| Link {
                source: l.source.prefixed(prefix),
                target: l.target.prefixed(prefix),
                condition: prefixed_expression(&l.condition),
                size: prefixed_expression(&l.size),
                first: prefixed_expression(&l.first),
                location: l.location.clone(),
            })
            .collect();

        let types = self
            .types
            .iter()
            .map(|(f, t)| {
                if self.parameters.contains(f) {
                    (f.clone(), t.clone())
                } else {
                    (f.prefixed(prefix), t.clone())
                }
            })
            .collect();

        let byte_order = self
            .byte_order
            .iter()
            .map(|(f, o)| (f.prefixed(prefix), *o))
            .collect();

        let checksums = self
            .checksums
            .iter()
            .map(|(name, exprs)| {
                (
                    name.prefixed(prefix),
                    exprs.iter().map(|e| prefixed_expression(e)).collect(),
                )
            })
            .collect();

        Self::construct(
            self.identifier.clone(),
            structure,
            types,
            checksums,
            byte_order,
            self.location.clone(),
            self.base.clone(),
            Diagnostics::new(),
        )
    }

    /// Numeric side conditions for the proof backend: every scalar variable
    /// in scope lies within its declared range, every aggregate equality in
    /// `expression` implies the expected composite length, and every scalar
    /// type literal denotes its size.
    pub fn type_constraints(&self, expression: &Expr) -> Vec<Expr> {
        let qualified_literals = self.qualified_enum_literals();

        let mut aggregate_constraints = Vec::new();
        for relation in expression
            .find_all(&|e| matches!(e, Expr::Equal(_) | Expr::NotEqual(_)))
        {
            let (left, right) = match relation {
                Expr::Equal(b) | Expr::NotEqual(b) => (&*b.left, &*b.right),
                _ => continue,
            };
            let (aggregate, variable) = match (left, right) {
                (Expr::Aggregate(a), Expr::Variable(v)) => (a, v),
                (Expr::Variable(v), Expr::Aggregate(a)) => (a, v),
                _ => continue,
            };
            let field = Field::new(variable.id.clone());
            let composite = match self.types.get(&field) {
                Some(t) if t.is_composite() => t,
                _ => continue,
            };
            if let Some(element_size) = composite.element_size() {
                aggregate_constraints.push(Expr::equal(
                    Expr::mul(vec![
                        Expr::number(aggregate.elements.len() as i128),
                        element_size,
                    ]),
                    Expr::size(variable.id.clone()),
                ));
            }
            if let TypeDef::Sequence(sequence) = composite {
                if sequence.element().is_scalar() {
                    aggregate_constraints.extend(
                        sequence
                            .element()
                            .constraints(sequence.element().id().name(), false),
                    );
                }
            }
        }

        let scalar_constraints: Vec<Expr> = self
            .types
            .iter()
            .filter(|(f, t)| {
                t.is_scalar()
                    && !qualified_literals.contains_key(f.id())
                    && f.name() != "Message"
                    && !f.is_final()
            })
            .flat_map(|(f, t)| t.constraints(f.name(), false))
            .collect();

        let type_size_constraints: Vec<Expr> = self
            .type_literals()
            .iter()
            .filter_map(|(id, t)| {
                t.scalar_size()
                    .map(|size| Expr::equal(Expr::size(id.clone()), size))
            })
            .collect();

        let mut result = aggregate_constraints;
        result.extend(scalar_constraints);
        result.extend(type_size_constraints);
        result
    }

    /// Facts that hold for any well-formed message: bit positions are
    /// 1-based byte streams.
    pub fn message_constraints() -> Vec<Expr> {
        vec![
            Expr::equal(
                Expr::modulo(Expr::first("Message"), Expr::number(8)),
                Expr::number(1),
            ),
            Expr::equal(
                Expr::modulo(Expr::size("Message"), Expr::number(8)),
                Expr::number(0),
            ),
        ]
    }

    // Obligation support (see `crate::proof`): the derived position facts
    // of a link.

    /// Where the target of `link` starts.
    pub(crate) fn target_first(&self, link: &Link) -> Expr {
        if link.source.is_initial() {
            return Expr::first("Message");
        }
        if link.first != Expr::Undefined {
            return link.first.clone();
        }
        Expr::add(vec![
            Expr::last(link.source.id().clone()),
            Expr::number(1),
        ])
    }

    /// How large the target of `link` is.
    pub(crate) fn target_size(&self, link: &Link) -> Result<Expr, ModelError> {
        if link.size != Expr::Undefined {
            return Ok(link.size.clone());
        }
        self.field_size(&link.target)
    }

    /// Where the target of `link` ends.
    pub(crate) fn target_last(&self, link: &Link) -> Result<Expr, ModelError> {
        Ok(Expr::sub(
            Expr::add(vec![self.target_first(link), self.target_size(link)?]),
            Expr::number(1),
        ))
    }

    // Literal environments

    /// Literals of enumerations in the message package, unqualified.
    pub fn unqualified_enum_literals(&self) -> BTreeSet<Id> {
        let package = self.package();
        self.enumerations()
            .iter()
            .filter(|e| e.id().package() == package)
            .flat_map(|e| e.literals().keys().cloned())
            .collect()
    }

    /// All enumeration literals, qualified by their package, with values.
    pub fn qualified_enum_literals(&self) -> BTreeMap<Id, i128> {
        self.enumerations()
            .iter()
            .flat_map(|e| {
                let package = e.id().package();
                e.literals()
                    .iter()
                    .map(move |(l, v)| (package.join(l.name()), *v))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Scalar type identifiers usable as variables (e.g. in `T'Size`).
    pub fn type_literals(&self) -> BTreeMap<Id, TypeDef> {
        let mut result = BTreeMap::new();
        for t in self.types.values() {
            if t.is_scalar() {
                result.insert(t.id(), t.clone());
            }
            if let TypeDef::Sequence(s) = t {
                if s.element().is_scalar() {
                    result.insert(s.element().id(), s.element().clone());
                }
            }
        }
        result
    }

    fn enumerations(&self) -> Vec<&Enumeration> {
        let mut result = Vec::new();
        for t in self.types.values() {
            t.collect_enumerations(&mut result);
        }
        result
    }

    // Construction internals

    fn structure_fields(&self) -> BTreeSet<Field> {
        self.structure
            .iter()
            .flat_map(|l| [l.source.clone(), l.target.clone()])
            .filter(|f| !f.is_initial() && !f.is_final())
            .collect()
    }

    fn validate(&mut self) {
        let mut error = Diagnostics::new();
        let structure_fields = self.structure_fields();

        self.validate_types(&structure_fields, &mut error);
        self.validate_initial_link(&mut error);
        self.validate_names(&structure_fields, &mut error);

        if error.has_errors() {
            self.error.append(&error);
            return;
        }

        self.validate_structure(&structure_fields, &mut error);
        self.validate_link_aspects(&mut error);
        self.error.append(&error);
    }

    fn validate_types(&self, structure_fields: &BTreeSet<Field>, error: &mut Diagnostics) {
        for (field, t) in &self.types {
            if structure_fields.contains(field) {
                continue;
            }
            if !t.is_scalar() {
                error.push(Entry::error(
                    "parameters must have a scalar type",
                    field.location().clone(),
                ));
            } else if let TypeDef::Enumeration(e) = t {
                if e.always_valid() {
                    error.push(Entry::error(
                        "always valid enumeration types not allowed as parameters",
                        field.location().clone(),
                    ));
                }
            }
        }

        for field in structure_fields {
            if !self.types.contains_key(field) {
                error.push(Entry::error(
                    format!(
                        "missing type for field \"{}\" in \"{}\"",
                        field.name(),
                        self.identifier
                    ),
                    field.location().clone(),
                ));
            }
        }
    }

    fn validate_initial_link(&self, error: &mut Diagnostics) {
        let initial_links = self.outgoing(&Field::initial());

        if initial_links.len() != 1 {
            error.push(Entry::error(
                format!("ambiguous first field in \"{}\"", self.identifier),
                self.location.clone(),
            ));
            for link in &initial_links {
                if link.target.location().is_present() {
                    error.push(Entry::info("duplicate", link.target.location().clone()));
                }
            }
        }

        if let Some(first_link) = initial_links.first() {
            if first_link.first != Expr::Undefined {
                error.push(Entry::error(
                    "illegal first aspect at initial link",
                    first_link.first.location(),
                ));
            }
        }
    }

    fn validate_names(&self, structure_fields: &BTreeSet<Field>, error: &mut Diagnostics) {
        let literals = self.unqualified_enum_literals();
        let mut type_fields: BTreeSet<&Field> = self.types.keys().collect();
        type_fields.extend(structure_fields.iter());

        for field in type_fields {
            if literals.contains(field.id()) {
                error.push(Entry::error(
                    format!(
                        "name conflict for field \"{}\" in \"{}\"",
                        field.name(),
                        self.identifier
                    ),
                    field.location().clone(),
                ));
                error.push(Entry::info(
                    "conflicting enumeration literal",
                    Location::NONE,
                ));
            }
        }
    }

    fn validate_structure(&mut self, structure_fields: &BTreeSet<Field>, error: &mut Diagnostics) {
        for field in structure_fields {
            if !self.structure.iter().any(|l| &l.target == field) {
                self.has_unreachable = true;
                error.push(Entry::error(
                    format!(
                        "unreachable field \"{}\" in \"{}\"",
                        field.name(),
                        self.identifier
                    ),
                    field.location().clone(),
                ));
            }
        }

        let mut groups: BTreeMap<(Field, Field, Expr), Vec<&Link>> = BTreeMap::new();
        for link in &self.structure {
            groups
                .entry((link.source.clone(), link.target.clone(), link.condition.clone()))
                .or_default()
                .push(link);
        }
        for ((source, target, _), links) in groups {
            if links.len() > 1 {
                error.push(Entry::error(
                    format!(
                        "duplicate link from \"{}\" to \"{}\"",
                        source.name(),
                        target.name()
                    ),
                    source.location().clone(),
                ));
                for link in links {
                    error.push(Entry::info("duplicate link", link.location.clone()));
                }
            }
        }
    }

    fn validate_link_aspects(&self, error: &mut Diagnostics) {
        for link in &self.structure {
            for expression in [&link.condition, &link.first, &link.size] {
                for exponentiation in
                    expression.find_all(&|e| matches!(e, Expr::Pow(_)))
                {
                    if let Expr::Pow(b) = exponentiation {
                        let variables = b.right.find_all(&|e| matches!(e, Expr::Variable(_)));
                        if !variables.is_empty() {
                            error.push(Entry::error(
                                format!("unsupported expression in \"{}\"", self.identifier),
                                b.location.clone(),
                            ));
                            for variable in variables {
                                if let Expr::Variable(v) = variable {
                                    error.push(Entry::info(
                                        format!("variable \"{}\" in exponent", v.id),
                                        v.location.clone(),
                                    ));
                                }
                            }
                        }
                    }
                }
            }

            if link.has_implicit_size() {
                if self
                    .outgoing(&link.target)
                    .iter()
                    .any(|l| !l.target.is_final())
                {
                    error.push(Entry::error(
                        "\"Message\" must not be used in size aspects",
                        link.size.location(),
                    ));
                } else {
                    let valid_definitions = if link.source.is_initial() {
                        vec![
                            Expr::size("Message"),
                            Expr::sub(Expr::last("Message"), Expr::last("Initial")),
                        ]
                    } else {
                        vec![Expr::sub(
                            Expr::last("Message"),
                            Expr::last(link.source.id().clone()),
                        )]
                    };
                    if !valid_definitions.contains(&link.size) {
                        error.push(Entry::error(
                            "invalid use of \"Message\" in size aspect",
                            link.size.location(),
                        ));
                        error.push(Entry::info(
                            "remove size aspect to define field with implicit size",
                            link.size.location(),
                        ));
                    }
                }
            }
        }
    }

    /// Qualify enumeration literals in conditions and add size expressions
    /// for fields with implicit size.
    fn normalize(&mut self) {
        let literals = self.unqualified_enum_literals();
        let package = self.package();

        // Decide implicit sizes against the unmodified structure: a missing
        // size on a link into an unconstrained composite is derived from the
        // message end, but only where every outgoing link of the target ends
        // the message.
        let implicit_sizes: Vec<Option<Expr>> = self
            .structure
            .iter()
            .map(|link| {
                if link.size != Expr::Undefined {
                    return None;
                }
                let target_type = self.types.get(&link.target)?;
                if !target_type.is_composite() {
                    return None;
                }
                if self
                    .outgoing(&link.target)
                    .iter()
                    .any(|l| !l.target.is_final())
                {
                    return None;
                }
                Some(if link.source.is_initial() {
                    Expr::size("Message").at(link.location.clone())
                } else {
                    Expr::sub(
                        Expr::last("Message"),
                        Expr::last(link.source.id().clone()),
                    )
                })
            })
            .collect();

        for (link, implicit) in self.structure.iter_mut().zip(implicit_sizes) {
            link.condition = link.condition.substituted(&mut |e| match e {
                Expr::Variable(v) if literals.contains(&v.id) => Some(
                    Expr::var(package.join(v.id.name())).at(v.location.clone()),
                ),
                _ => None,
            });
            if let Some(size) = implicit {
                link.size = size;
            }
        }
        self.structure.sort();
    }

    /// Kahn's algorithm. `None` plus a diagnostic if a cycle remains.
    fn topological_sort(&mut self) -> Option<Vec<Field>> {
        let mut result: Vec<Field> = Vec::new();
        let mut queue: VecDeque<Field> = VecDeque::from([Field::initial()]);
        let mut visited: BTreeSet<usize> = BTreeSet::new();

        while let Some(node) = queue.pop_front() {
            result.push(node.clone());
            for (index, link) in self
                .structure
                .iter()
                .enumerate()
                .filter(|(_, l)| l.source == node)
            {
                visited.insert(index);
                let incoming: Vec<usize> = self
                    .structure
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.target == link.target)
                    .map(|(i, _)| i)
                    .collect();
                if incoming.iter().all(|i| visited.contains(i)) {
                    queue.push_back(link.target.clone());
                }
            }
        }

        if !self.has_unreachable && visited.len() != self.structure.len() {
            self.error.push(Entry::error(
                format!("structure of \"{}\" contains cycle", self.identifier),
                self.location.clone(),
            ));
            return None;
        }

        Some(
            result
                .into_iter()
                .filter(|f| !f.is_initial() && !f.is_final())
                .collect(),
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.structure.is_empty() {
            return write!(f, "type {} is null message", self.identifier.name());
        }
        writeln!(f, "type {} is", self.identifier.name())?;
        writeln!(f, "   message")?;
        for field in self.all_fields() {
            if field.is_final() {
                continue;
            }
            if !field.is_initial() {
                if let Some(t) = self.types.get(&field) {
                    writeln!(f, "      {} : {};", field.name(), t.id())?;
                }
            }
            for link in self.outgoing(&field) {
                writeln!(f, "         {};", link)?;
            }
        }
        write!(f, "   end message")
    }
}

/// Mapping from equational facts: `Equal(name, value)` becomes
/// `name -> value`. Used to substitute known sizes and literal values into
/// size expressions.
pub fn to_mapping(facts: &[Expr]) -> BTreeMap<Expr, Expr> {
    facts
        .iter()
        .filter_map(|fact| match fact {
            Expr::Equal(b) => match &*b.left {
                Expr::Variable(_) | Expr::First(_) | Expr::Last(_) | Expr::Size(_) => {
                    Some(((*b.left).clone(), (*b.right).clone()))
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModularInteger;

    fn byte() -> TypeDef {
        TypeDef::Modular(ModularInteger::new("P::T", Expr::number(256)))
    }

    fn two_field_message() -> Message {
        Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::new("B")),
                Link::new(Field::new("B"), Field::final_()),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("B"), byte()),
            ],
        )
    }

    #[test]
    fn fields_are_topologically_sorted() {
        let message = two_field_message();
        assert!(message.propagate().is_ok());
        assert_eq!(message.fields(), &[Field::new("A"), Field::new("B")]);
        assert!(message.parameters().is_empty());
    }

    #[test]
    fn incoming_and_outgoing() {
        let message = two_field_message();
        let incoming = message.incoming(&Field::new("B"));
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source, Field::new("A"));
        let outgoing = message.outgoing(&Field::new("A"));
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].target, Field::new("B"));
    }

    #[test]
    fn predecessors_and_successors() {
        let message = two_field_message();
        assert_eq!(message.predecessors(&Field::new("B")), vec![Field::new("A")]);
        assert_eq!(message.successors(&Field::new("A")), vec![Field::new("B")]);
        assert_eq!(
            message.predecessors(&Field::final_()),
            vec![Field::new("A"), Field::new("B")]
        );
        assert_eq!(message.successors(&Field::final_()), Vec::<Field>::new());
    }

    #[test]
    fn paths_enumerate_all_routes() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::new("B"))
                    .with_condition(Expr::less(Expr::var("A"), Expr::number(10))),
                Link::new(Field::new("A"), Field::new("C"))
                    .with_condition(Expr::greater_equal(Expr::var("A"), Expr::number(10))),
                Link::new(Field::new("B"), Field::new("C")),
                Link::new(Field::new("C"), Field::final_()),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("B"), byte()),
                (Field::new("C"), byte()),
            ],
        );
        assert!(message.propagate().is_ok());
        assert_eq!(message.paths(&Field::new("C")).len(), 2);
        assert_eq!(message.paths(&Field::final_()).len(), 2);
        assert_eq!(
            message.definite_predecessors(&Field::final_()),
            vec![Field::new("A"), Field::new("C")]
        );
    }

    #[test]
    fn path_condition_is_disjunction_of_conjunctions() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::new("B"))
                    .with_condition(Expr::equal(Expr::var("A"), Expr::number(1))),
                Link::new(Field::new("A"), Field::final_())
                    .with_condition(Expr::equal(Expr::var("A"), Expr::number(2))),
                Link::new(Field::new("B"), Field::final_()),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("B"), byte()),
            ],
        );
        assert_eq!(
            message.path_condition(&Field::new("B")),
            Expr::equal(Expr::var("A"), Expr::number(1))
        );
        let final_condition = message.path_condition(&Field::final_());
        assert_eq!(
            final_condition,
            Expr::or(vec![
                Expr::equal(Expr::var("A"), Expr::number(1)),
                Expr::equal(Expr::var("A"), Expr::number(2)),
            ])
            .simplified()
        );
    }

    #[test]
    fn missing_type_is_reported() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("X")),
                Link::new(Field::new("X"), Field::final_()),
            ],
            vec![],
        );
        let error = message.propagate().unwrap_err();
        assert!(error
            .to_string()
            .contains("missing type for field \"X\" in \"P::M\""));
    }

    #[test]
    fn ambiguous_first_field_is_reported() {
        let message = Message::with_location(
            "P::M",
            vec![
                Link::new(
                    Field::initial(),
                    Field::new(Id::parse("X").at(Location::new(2, 6))),
                ),
                Link::new(
                    Field::initial(),
                    Field::new(Id::parse("Y").at(Location::new(3, 6))),
                ),
                Link::new(Field::new("X"), Field::final_()),
                Link::new(Field::new("Y"), Field::final_()),
            ],
            vec![
                (Field::new("X"), byte()),
                (Field::new("Y"), byte()),
            ],
            Location::new(1, 5),
        );
        let rendered = message.propagate().unwrap_err().to_string();
        assert!(rendered.contains("<stdin>:1:5: model: error: ambiguous first field in \"P::M\""));
        assert!(rendered.contains("<stdin>:2:6: model: info: duplicate"));
        assert!(rendered.contains("<stdin>:3:6: model: info: duplicate"));
    }

    #[test]
    fn duplicate_links_are_reported() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("X")),
                Link::new(Field::new("X"), Field::final_()).at(Location::new(4, 42)),
                Link::new(Field::new("X"), Field::final_()).at(Location::new(5, 42)),
            ],
            vec![(Field::new("X"), byte())],
        );
        let rendered = message.propagate().unwrap_err().to_string();
        assert!(rendered.contains("duplicate link from \"X\" to \"Final\""));
        assert!(rendered.contains("<stdin>:4:42: model: info: duplicate link"));
        assert!(rendered.contains("<stdin>:5:42: model: info: duplicate link"));
    }

    #[test]
    fn unreachable_field_is_reported() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::final_()),
                Link::new(
                    Field::new(Id::parse("B").at(Location::new(20, 3))),
                    Field::final_(),
                ),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("B"), byte()),
            ],
        );
        let rendered = message.propagate().unwrap_err().to_string();
        assert!(
            rendered.contains("<stdin>:20:3: model: error: unreachable field \"B\" in \"P::M\"")
        );
    }

    #[test]
    fn cycle_is_reported() {
        let message = Message::with_location(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("X")),
                Link::new(Field::new("X"), Field::new("Y")),
                Link::new(Field::new("Y"), Field::new("Z")),
                Link::new(Field::new("Z"), Field::new("X")),
                Link::new(Field::new("X"), Field::final_()),
            ],
            vec![
                (Field::new("X"), byte()),
                (Field::new("Y"), byte()),
                (Field::new("Z"), byte()),
            ],
            Location::new(10, 5),
        );
        let rendered = message.propagate().unwrap_err().to_string();
        assert!(rendered
            .contains("<stdin>:10:5: model: error: structure of \"P::M\" contains cycle"));
    }

    #[test]
    fn non_scalar_parameters_are_rejected() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::final_()),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("P"), TypeDef::Opaque(crate::types::Opaque::new())),
            ],
        );
        let rendered = message.propagate().unwrap_err().to_string();
        assert!(rendered.contains("parameters must have a scalar type"));
    }

    #[test]
    fn scalar_parameters_are_accepted() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::final_()),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("Par"), byte()),
            ],
        );
        assert!(message.propagate().is_ok());
        assert_eq!(message.parameters(), &[Field::new("Par")]);
        assert_eq!(message.fields(), &[Field::new("A")]);
    }

    #[test]
    fn field_size_of_scalar_and_final() {
        let message = two_field_message();
        assert_eq!(message.field_size(&Field::new("A")).unwrap(), Expr::number(8));
        assert_eq!(message.field_size(&Field::final_()).unwrap(), Expr::number(0));
        assert!(message.field_size(&Field::new("X")).is_err());
    }

    #[test]
    fn implicit_size_is_inserted_for_trailing_composites() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::new("Payload")),
                Link::new(Field::new("Payload"), Field::final_()),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("Payload"), TypeDef::Opaque(crate::types::Opaque::new())),
            ],
        );
        assert!(message.propagate().is_ok());
        let incoming = message.incoming(&Field::new("Payload"));
        assert_eq!(
            incoming[0].size,
            Expr::sub(Expr::last("Message"), Expr::last("A"))
        );
        assert!(message.has_implicit_size());
        assert!(!message.has_fixed_size());
    }

    #[test]
    fn implicit_size_from_initial_uses_message_size() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("Payload")),
                Link::new(Field::new("Payload"), Field::final_()),
            ],
            vec![(
                Field::new("Payload"),
                TypeDef::Opaque(crate::types::Opaque::new()),
            )],
        );
        assert!(message.propagate().is_ok());
        let incoming = message.incoming(&Field::new("Payload"));
        assert_eq!(incoming[0].size, Expr::size("Message"));
    }

    #[test]
    fn enum_literals_are_qualified_during_normalization() {
        let enum_type = TypeDef::Enumeration(crate::types::Enumeration::new(
            "P::E",
            vec![("ONE", 1), ("TWO", 2)],
            Expr::number(8),
            false,
        ));
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("Tag")),
                Link::new(Field::new("Tag"), Field::final_())
                    .with_condition(Expr::equal(Expr::var("Tag"), Expr::var("ONE"))),
            ],
            vec![(Field::new("Tag"), enum_type)],
        );
        assert!(message.propagate().is_ok());
        let outgoing = message.outgoing(&Field::new("Tag"));
        assert_eq!(
            outgoing[0].condition,
            Expr::equal(Expr::var("Tag"), Expr::var("P::ONE"))
        );
    }

    #[test]
    fn field_name_conflicting_with_literal_is_reported() {
        let enum_type = TypeDef::Enumeration(crate::types::Enumeration::new(
            "P::E",
            vec![("ONE", 1)],
            Expr::number(8),
            false,
        ));
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("Tag")),
                Link::new(Field::new("Tag"), Field::new("ONE")),
                Link::new(Field::new("ONE"), Field::final_()),
            ],
            vec![
                (Field::new("Tag"), enum_type),
                (Field::new("ONE"), byte()),
            ],
        );
        let rendered = message.propagate().unwrap_err().to_string();
        assert!(rendered.contains("name conflict for field \"ONE\" in \"P::M\""));
        assert!(rendered.contains("conflicting enumeration literal"));
    }

    #[test]
    fn variable_in_exponent_is_rejected() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::final_()).with_condition(Expr::less(
                    Expr::var("A"),
                    Expr::pow(Expr::number(2), Expr::var("A")),
                )),
            ],
            vec![(Field::new("A"), byte())],
        );
        let rendered = message.propagate().unwrap_err().to_string();
        assert!(rendered.contains("unsupported expression in \"P::M\""));
        assert!(rendered.contains("variable \"A\" in exponent"));
    }

    #[test]
    fn prefixed_renames_fields_and_references() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("F1")),
                Link::new(Field::new("F1"), Field::new("F2"))
                    .with_condition(Expr::less_equal(Expr::var("F1"), Expr::number(100)))
                    .with_first(Expr::first("F1")),
                Link::new(Field::new("F2"), Field::final_()),
            ],
            vec![
                (Field::new("F1"), byte()),
                (Field::new("F2"), byte()),
            ],
        );
        let prefixed = message.prefixed("X_");
        assert!(prefixed.propagate().is_ok());
        assert_eq!(prefixed.fields(), &[Field::new("X_F1"), Field::new("X_F2")]);
        let link = prefixed
            .structure()
            .iter()
            .find(|l| l.target == Field::new("X_F2"))
            .unwrap();
        assert_eq!(
            link.condition,
            Expr::less_equal(Expr::var("X_F1"), Expr::number(100))
        );
        assert_eq!(link.first, Expr::first("X_F1"));
    }

    #[test]
    fn prefixed_preserves_parameters() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::final_())
                    .with_condition(Expr::equal(Expr::var("Par"), Expr::number(1))),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("Par"), byte()),
            ],
        );
        let prefixed = message.prefixed("X_");
        assert_eq!(prefixed.parameters(), &[Field::new("Par")]);
        let link = prefixed
            .structure()
            .iter()
            .find(|l| l.target.is_final())
            .unwrap();
        assert_eq!(
            link.condition,
            Expr::equal(Expr::var("Par"), Expr::number(1))
        );
    }

    #[test]
    fn prefixed_composes() {
        let message = two_field_message();
        let double = message.prefixed("X_").prefixed("Y_");
        let composed = message.prefixed("Y_X_");
        assert_eq!(double.fields(), composed.fields());
        assert_eq!(double.structure(), composed.structure());
    }

    #[test]
    fn type_constraints_cover_scalars_and_aggregates() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::new("Data"))
                    .with_size(Expr::number(16)),
                Link::new(Field::new("Data"), Field::final_()),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("Data"), TypeDef::Opaque(crate::types::Opaque::new())),
            ],
        );
        let constraints = message.type_constraints(&Expr::equal(
            Expr::var("Data"),
            Expr::aggregate(vec![Expr::number(1), Expr::number(2)]),
        ));
        assert!(constraints.contains(&Expr::equal(
            Expr::mul(vec![Expr::number(2), Expr::number(8)]),
            Expr::size("Data"),
        )));
        assert!(constraints.contains(&Expr::greater_equal(Expr::var("A"), Expr::number(0))));
        assert!(constraints.contains(&Expr::equal(Expr::size("P::T"), Expr::number(8))));
    }

    #[test]
    fn derived_messages_copy_base_structure() {
        let base = two_field_message();
        let derived = Message::derived("P::D", &base);
        assert!(derived.propagate().is_ok());
        assert_eq!(derived.fields(), base.fields());
        assert_eq!(derived.base(), Some(&Id::parse("P::M")));

        let twice = Message::derived("P::DD", &derived);
        let rendered = twice.propagate().unwrap_err().to_string();
        assert!(rendered.contains("illegal derivation \"P::DD\""));
        assert!(rendered.contains("illegal base message type \"P::D\""));
    }

    #[test]
    fn link_display() {
        let link = Link::new(Field::new("A"), Field::new("B"))
            .with_condition(Expr::greater(Expr::var("A"), Expr::number(1)))
            .with_size(Expr::number(16));
        assert_eq!(link.to_string(), "then B with Size => 16 if A > 1");
        assert_eq!(
            Link::new(Field::new("A"), Field::final_()).to_string(),
            "then null"
        );
    }
}

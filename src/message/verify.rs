//! Message verification.
//!
//! Seven phases, strictly sequential. The first two are structural
//! (expression typing, syntactic checks including checksums) and gate the
//! proof phases behind a propagation checkpoint; the remaining phases
//! discharge obligations to the solver through the parallel driver:
//! conflicting conditions, reachability, contradictions, coverage, and the
//! positional properties (overlays, field positions, message size).
//!
//! Every phase appends diagnostics; later phases assume the structural
//! preconditions of earlier ones, not their semantic success.

use std::collections::BTreeMap;
use std::ops::Deref;

use tracing::debug;

use crate::diagnostics::{Diagnostics, Entry, ModelError};
use crate::expr::typing::Ty;
use crate::expr::Expr;
use crate::identifier::Id;
use crate::proof::{maximum, prove, Config, ProofResult, ProofSession};
use crate::types::TypeDef;

use super::{Field, Link, Message, Path};

/// A message that has passed all verification phases.
///
/// Dereferences to the underlying [`Message`] for all graph queries; the
/// projections that require proof support ([`VerifiedMessage::size`],
/// [`VerifiedMessage::max_size`], …) live here.
#[derive(Debug, Clone)]
pub struct VerifiedMessage {
    inner: Message,
    config: Config,
}

impl Deref for VerifiedMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.inner
    }
}

impl PartialEq for VerifiedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for VerifiedMessage {}

impl Message {
    /// Run all verification phases and seal the message.
    pub fn verified(&self, config: &Config) -> Result<VerifiedMessage, ModelError> {
        self.verify(config, false)
    }

    /// Like [`Message::verified`], but consult and update the cache of
    /// previously verified fingerprints: a hit skips the proof phases.
    pub fn verified_cached(
        &self,
        config: &Config,
        cache: &mut crate::cache::VerificationCache,
    ) -> Result<VerifiedMessage, ModelError> {
        let hit = cache.contains(self);
        if hit {
            debug!(message = %self.identifier(), "fingerprint cache hit");
        }
        let verified = self.verify(config, hit)?;
        cache.insert(self);
        Ok(verified)
    }

    fn verify(&self, config: &Config, skip_proofs: bool) -> Result<VerifiedMessage, ModelError> {
        self.propagate()?;

        if !self.structure().is_empty() || !self.types().is_empty() {
            let mut diagnostics = Diagnostics::new();

            debug!(message = %self.identifier(), "phase 1: expression typing");
            self.verify_expression_types(config, &mut diagnostics);
            debug!(message = %self.identifier(), "phase 2: syntactic checks");
            self.verify_expressions(&mut diagnostics);
            self.verify_checksums(&mut diagnostics);

            diagnostics.propagate()?;

            if !skip_proofs {
                debug!(message = %self.identifier(), "phase 3: conflicting conditions");
                self.prove_conflicting_conditions(config, &mut diagnostics)?;
                debug!(message = %self.identifier(), "phase 4: reachability");
                self.prove_reachability(config, &mut diagnostics)?;
                debug!(message = %self.identifier(), "phase 5: contradictions");
                self.prove_contradictions(config, &mut diagnostics)?;
                debug!(message = %self.identifier(), "phase 6: coverage");
                self.prove_coverage(config, &mut diagnostics)?;
                debug!(message = %self.identifier(), "phase 7: positions");
                self.prove_overlays(config, &mut diagnostics)?;
                self.prove_field_positions(config, &mut diagnostics)?;
                self.prove_message_size(config, &mut diagnostics)?;
            }

            diagnostics.propagate()?;
        }

        Ok(VerifiedMessage {
            inner: self.clone(),
            config: config.clone(),
        })
    }

    // Phase 1

    fn verify_expression_types(&self, config: &Config, diagnostics: &mut Diagnostics) {
        let all_fields: Vec<Id> = self.fields().iter().map(|f| f.id().clone()).collect();
        let literal_types: BTreeMap<Id, Ty> = self.literal_types();

        for path in self.paths(&Field::final_()).iter() {
            let mut known: BTreeMap<Id, Ty> = literal_types.clone();
            for parameter in self.parameters() {
                if let Some(t) = self.types().get(parameter) {
                    known.insert(parameter.id().clone(), t.ty());
                }
            }

            // Skip paths whose conditions are already unsatisfiable; their
            // expressions are never evaluated.
            if self.prove_path_property(&Expr::True, path, config).result == ProofResult::Unsat {
                continue;
            }

            let mut visited: Vec<Field> = Vec::new();
            for link in path {
                visited.push(link.target.clone());
                if let Some(t) = self.types().get(&link.source) {
                    known.insert(link.source.id().clone(), t.ty());
                }

                for expression in [&link.condition, &link.size, &link.first] {
                    if *expression == Expr::Undefined {
                        continue;
                    }
                    let mut entries = Vec::new();
                    let typed =
                        self.typed_expression(expression, &known, &all_fields, &mut entries);
                    entries.extend(typed.check_type(&Ty::Any));
                    if !entries.is_empty() {
                        let names: Vec<&str> =
                            visited.iter().map(|f| f.name()).collect();
                        let location = expression.location();
                        diagnostics.extend(entries);
                        diagnostics.push(Entry::info(
                            format!("on path {}", names.join(" -> ")),
                            location,
                        ));
                    }
                }
            }
        }
    }

    /// Annotate every variable with its type: parameters, literals, fields
    /// seen earlier on the path, and the message pseudo-variable. A
    /// reference to a field that only occurs later on the path is reported
    /// here and annotated anyway, so it is not also reported as undefined.
    fn typed_expression(
        &self,
        expression: &Expr,
        known: &BTreeMap<Id, Ty>,
        all_fields: &[Id],
        entries: &mut Vec<Entry>,
    ) -> Expr {
        expression.substituted(&mut |e| {
            let v = match e {
                Expr::Variable(v) => v,
                _ => return None,
            };
            if v.id.name() == "Message" {
                return Some(Expr::typed_var(v.id.clone(), Ty::Opaque).at(v.location.clone()));
            }
            if let Some(ty) = known.get(&v.id) {
                return Some(
                    Expr::typed_var(v.id.clone(), ty.clone()).at(v.location.clone()),
                );
            }
            if all_fields.contains(&v.id) {
                entries.push(Entry::error(
                    format!("subsequent field \"{}\" referenced", v.id),
                    v.location.clone(),
                ));
                let ty = self
                    .types()
                    .get(&Field::new(v.id.clone()))
                    .map(TypeDef::ty)
                    .unwrap_or(Ty::Any);
                return Some(Expr::typed_var(v.id.clone(), ty).at(v.location.clone()));
            }
            None
        })
    }

    fn literal_types(&self) -> BTreeMap<Id, Ty> {
        let mut result = BTreeMap::new();
        for enumeration in self.types().values() {
            let mut enums = Vec::new();
            enumeration.collect_enumerations(&mut enums);
            for e in enums {
                let ty = Ty::Enumeration {
                    id: e.id().clone(),
                    always_valid: e.always_valid(),
                };
                let package = e.id().package();
                for literal in e.literals().keys() {
                    result.insert(package.join(literal.name()), ty.clone());
                    result.insert(literal.clone(), ty.clone());
                }
            }
        }
        for (id, t) in self.type_literals() {
            result.insert(id, t.ty());
        }
        result
    }

    fn prove_path_property(
        &self,
        property: &Expr,
        path: &[Link],
        config: &Config,
    ) -> crate::proof::Proof {
        let mut facts = self.type_constraints(property);
        facts.extend(
            path.iter()
                .filter(|l| l.condition != Expr::True)
                .map(|l| l.condition.clone()),
        );
        facts.extend(path.iter().filter(|l| l.size != Expr::Undefined).map(|l| {
            Expr::equal(Expr::size(l.target.id().clone()), l.size.clone())
        }));
        prove(property, &facts, config)
    }

    // Phase 2

    fn verify_expressions(&self, diagnostics: &mut Diagnostics) {
        let mut sources = vec![Field::initial()];
        sources.extend(self.fields().iter().cloned());
        for field in sources {
            for link in self.outgoing(&field) {
                self.check_attributes(&link.condition, diagnostics);
                self.check_first_expression(&link, diagnostics);
                self.check_size_expression(&link, diagnostics);
            }
        }
    }

    fn check_attributes(&self, expression: &Expr, diagnostics: &mut Diagnostics) {
        let type_literals = self.type_literals();
        for attribute in expression.find_all(&|e| matches!(e, Expr::Size(_))) {
            if let Expr::Size(a) = attribute {
                let valid = a.prefix.name() == "Message"
                    || self.fields().contains(&Field::new(a.prefix.clone()))
                    || type_literals.contains_key(&a.prefix);
                if !valid {
                    diagnostics.push(Entry::error(
                        format!("invalid use of size attribute for \"{}\"", a.prefix),
                        expression.location(),
                    ));
                }
            }
        }
    }

    fn check_first_expression(&self, link: &Link, diagnostics: &mut Diagnostics) {
        if link.first != Expr::Undefined && !matches!(link.first, Expr::First(_)) {
            diagnostics.push(Entry::error(
                format!("invalid First for field \"{}\"", link.target.name()),
                link.first.location(),
            ));
        }
    }

    fn check_size_expression(&self, link: &Link, diagnostics: &mut Diagnostics) {
        if link.target.is_final() && link.size != Expr::Undefined {
            diagnostics.push(Entry::error(
                format!("size aspect for final field in \"{}\"", self.identifier()),
                link.size.location(),
            ));
            return;
        }
        if let Some(t) = self.types().get(&link.target) {
            let unconstrained = t.is_composite();
            if !unconstrained && link.size != Expr::Undefined {
                diagnostics.push(Entry::error(
                    format!(
                        "fixed size field \"{}\" with size aspect",
                        link.target.name()
                    ),
                    link.target.location().clone(),
                ));
            }
            if unconstrained && link.size == Expr::Undefined {
                diagnostics.push(Entry::error(
                    format!(
                        "unconstrained field \"{}\" without size aspect",
                        link.target.name()
                    ),
                    link.target.location().clone(),
                ));
            }
        }
    }

    fn verify_checksums(&self, diagnostics: &mut Diagnostics) {
        fn valid_lower(expression: &Expr) -> bool {
            match expression {
                Expr::First(_) => true,
                Expr::Add(n) => {
                    n.terms.len() == 2
                        && n.terms.iter().any(|t| matches!(t, Expr::Last(_)))
                        && n.terms.iter().any(|t| t.as_number() == Some(1))
                }
                _ => false,
            }
        }

        fn valid_upper(expression: &Expr) -> bool {
            match expression {
                Expr::Last(_) => true,
                Expr::Sub(b) => {
                    matches!(&*b.left, Expr::First(_)) && b.right.as_number() == Some(1)
                }
                _ => false,
            }
        }

        for (name, expressions) in self.checksums() {
            if !self.fields().contains(&Field::new(name.clone())) {
                diagnostics.push(Entry::error(
                    format!("checksum definition for unknown field \"{}\"", name),
                    name.location().clone(),
                ));
            }

            for expression in expressions {
                let supported = match expression {
                    Expr::Variable(_) | Expr::Size(_) => true,
                    Expr::ValueRange(r) => valid_lower(&r.lower) && valid_upper(&r.upper),
                    _ => false,
                };
                if !supported {
                    diagnostics.push(Entry::error(
                        format!(
                            "unsupported expression \"{}\" in definition of checksum \"{}\"",
                            expression, name
                        ),
                        expression.location(),
                    ));
                }

                for variable in expression.variables() {
                    if variable.name() != "Message"
                        && !self.fields().contains(&Field::new(variable.clone()))
                    {
                        diagnostics.push(Entry::error(
                            format!(
                                "unknown field \"{}\" referenced in definition of checksum \"{}\"",
                                variable, name
                            ),
                            variable.location().clone(),
                        ));
                    }
                }

                if let Expr::ValueRange(range) = expression {
                    let lower = range.lower.variables().into_iter().next();
                    let upper = range.upper.variables().into_iter().next();
                    if let (Some(lower), Some(upper)) = (lower, upper) {
                        if lower != upper {
                            let lower_field = if lower.name() == "Message" {
                                Field::initial()
                            } else {
                                Field::new(lower)
                            };
                            let upper_field = if upper.name() == "Message" {
                                Field::final_()
                            } else {
                                Field::new(upper)
                            };
                            for path in self.paths(&upper_field).iter() {
                                let covered = lower_field.is_initial()
                                    || path.iter().any(|l| l.source == lower_field);
                                if !covered {
                                    diagnostics.push(Entry::error(
                                        format!(
                                            "invalid range \"{}\" in definition of checksum \"{}\"",
                                            expression, name
                                        ),
                                        expression.location(),
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }

        let checked: Vec<Id> = self
            .path_condition(&Field::final_())
            .find_all(&|e| matches!(e, Expr::ValidChecksum(_)))
            .iter()
            .filter_map(|e| match e {
                Expr::ValidChecksum(a) => Some(a.prefix.clone()),
                _ => None,
            })
            .collect();

        for name in self.checksums().keys() {
            if !checked.contains(name) {
                diagnostics.push(Entry::error(
                    format!("no validity check of checksum \"{}\"", name),
                    name.location().clone(),
                ));
            }
        }
        for name in &checked {
            if !self.checksums().contains_key(name) {
                diagnostics.push(Entry::error(
                    format!("validity check for undefined checksum \"{}\"", name),
                    name.location().clone(),
                ));
            }
        }
    }

    // Phase 3

    fn prove_conflicting_conditions(
        &self,
        config: &Config,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ModelError> {
        let mut session = ProofSession::new(config);
        let mut sources = vec![Field::initial()];
        sources.extend(self.fields().iter().cloned());

        for field in sources {
            let outgoing = self.outgoing(&field);
            for (i, left) in outgoing.iter().enumerate() {
                for (j, right) in outgoing.iter().enumerate().skip(i + 1) {
                    let conflict =
                        Expr::and(vec![left.condition.clone(), right.condition.clone()]);
                    let error = vec![
                        Entry::error(
                            format!("conflicting conditions for field \"{}\"", field.name()),
                            field.location().clone(),
                        ),
                        Entry::info(
                            format!(
                                "condition {} ({} -> {}): {}",
                                i, field, left.target, left.condition
                            ),
                            left.condition.location(),
                        ),
                        Entry::info(
                            format!(
                                "condition {} ({} -> {}): {}",
                                j, field, right.target, right.condition
                            ),
                            right.condition.location(),
                        ),
                    ];
                    for path in self.paths(&field).iter() {
                        let mut facts = self.type_constraints(&conflict);
                        facts.extend(self.path_facts(path, false)?);
                        session.add(&conflict, &facts, ProofResult::Sat, error.clone(), true, false);
                    }
                }
            }
            session.push();
        }
        session.check(diagnostics);
        Ok(())
    }

    // Phase 4

    fn prove_reachability(
        &self,
        config: &Config,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ModelError> {
        fn has_final(message: &Message, field: &Field) -> bool {
            if field.is_final() {
                return true;
            }
            message
                .outgoing(field)
                .iter()
                .any(|l| has_final(message, &l.target))
        }

        let mut sources = vec![Field::initial()];
        sources.extend(self.fields().iter().cloned());
        for field in &sources {
            if !has_final(self, field) {
                diagnostics.push(Entry::error(
                    format!(
                        "no path to Final for field \"{}\" in \"{}\"",
                        field.name(),
                        self.identifier()
                    ),
                    field.location().clone(),
                ));
            }
        }

        let mut targets = self.fields().to_vec();
        targets.push(Field::final_());
        for field in targets {
            let mut failed: Vec<(Path, Vec<Entry>)> = Vec::new();
            let mut reachable = false;
            for path in self.paths(&field).iter() {
                let mut facts = self.path_facts(path, false)?;
                let last_field = &path.last().expect("nonempty path").target;
                let outgoing = self.outgoing(last_field);
                if !last_field.is_final() && !outgoing.is_empty() {
                    facts.push(Expr::or(
                        outgoing.iter().map(|l| l.condition.clone()).collect(),
                    ));
                }
                let proof = prove(&Expr::True, &facts, config);
                if proof.result == ProofResult::Sat {
                    reachable = true;
                    break;
                }
                failed.push((path.clone(), proof.unsatisfied_entries()));
            }

            if !reachable && !failed.is_empty() {
                diagnostics.push(Entry::error(
                    format!(
                        "unreachable field \"{}\" in \"{}\"",
                        field.name(),
                        self.identifier()
                    ),
                    field.location().clone(),
                ));
                for (index, (path, entries)) in failed.iter().enumerate() {
                    let names: Vec<&str> = path.iter().map(|l| l.target.name()).collect();
                    diagnostics.push(Entry::info(
                        format!("path {} ({}):", index, names.join(" -> ")),
                        field.location().clone(),
                    ));
                    diagnostics.extend(entries.iter().cloned());
                }
            }
        }
        Ok(())
    }

    // Phase 5

    fn prove_contradictions(
        &self,
        config: &Config,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ModelError> {
        let mut sources = vec![Field::initial()];
        sources.extend(self.fields().iter().cloned());

        for field in sources {
            let mut contradictions: Vec<(Path, Expr, Vec<Entry>)> = Vec::new();
            let mut checked = 0;
            for path in self.paths(&field).iter() {
                let facts = self.path_facts(path, false)?;
                for link in self.outgoing(&field) {
                    checked += 1;
                    let condition = link.condition.clone();
                    let mut assumptions = Self::message_constraints();
                    assumptions.extend(self.type_constraints(&condition));
                    assumptions.extend(facts.iter().cloned());
                    let proof = prove(&condition, &assumptions, config);
                    if proof.result == ProofResult::Sat {
                        continue;
                    }
                    contradictions.push((path.clone(), condition, proof.unsatisfied_entries()));
                }
            }

            if checked > 0 && checked == contradictions.len() {
                for (path, condition, entries) in contradictions {
                    diagnostics.push(Entry::error(
                        format!("contradicting condition in \"{}\"", self.identifier()),
                        condition.location(),
                    ));
                    for link in &path {
                        diagnostics.push(Entry::info(
                            format!("on path: \"{}\"", link.target.name()),
                            link.target.location().clone(),
                        ));
                    }
                    diagnostics.extend(entries);
                }
            }
        }
        Ok(())
    }

    // Phase 6

    fn prove_coverage(
        &self,
        config: &Config,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ModelError> {
        let mut session = ProofSession::new(config);
        let position = Expr::var("f");

        for full_path in self.paths(&Field::final_()).iter() {
            let path = &full_path[..full_path.len().saturating_sub(1)];
            if path.is_empty() {
                continue;
            }

            // (1) f lies within the message.
            let mut facts = vec![
                Expr::greater_equal(position.clone(), Expr::first("Message")),
                Expr::less_equal(position.clone(), Expr::last("Message")),
            ];
            // (2) f lies in none of the fields on the path.
            for link in path {
                facts.push(Expr::not(Expr::and(vec![
                    Expr::greater_equal(position.clone(), self.target_first(link)),
                    Expr::less_equal(position.clone(), self.target_last(link)?),
                ])));
            }
            // The last field ends the message.
            let last = path.last().expect("nonempty path");
            facts.push(Expr::equal(
                self.target_last(last)?,
                Expr::last("Message"),
            ));
            facts.extend(self.path_facts(path, false)?);

            let mut error = vec![Entry::error(
                "path does not cover whole message",
                self.identifier().location().clone(),
            )];
            for link in path {
                error.push(Entry::info(
                    format!("on path: \"{}\"", link.target.name()),
                    link.target.location().clone(),
                ));
            }

            // A bit claimed nowhere must not exist.
            session.add(&Expr::True, &facts, ProofResult::Sat, error, true, false);
        }
        session.check(diagnostics);
        Ok(())
    }

    // Phase 7

    fn prove_overlays(
        &self,
        config: &Config,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ModelError> {
        let mut session = ProofSession::new(config);
        let mut sources = vec![Field::initial()];
        sources.extend(self.fields().iter().cloned());

        for field in sources {
            for path in self.paths(&field).iter() {
                let link = match path.last() {
                    Some(l) => l,
                    None => continue,
                };
                let overlaid_field = match &link.first {
                    Expr::First(a) => a.prefix.clone(),
                    _ => continue,
                };
                let facts = self.path_facts(path, false)?;
                let congruent = Expr::equal(
                    self.target_last(link)?,
                    Expr::last(overlaid_field.clone()),
                );
                let error = vec![Entry::error(
                    format!(
                        "field \"{}\" not congruent with overlaid field \"{}\"",
                        field.name(),
                        overlaid_field
                    ),
                    self.identifier().location().clone(),
                )];
                session.add(&congruent, &facts, ProofResult::Sat, error, false, true);
            }
            session.push();
        }
        session.check(diagnostics);
        Ok(())
    }

    fn prove_field_positions(
        &self,
        config: &Config,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ModelError> {
        let mut session = ProofSession::new(config);
        let mut targets = self.fields().to_vec();
        targets.push(Field::final_());

        for field in targets {
            for path in self.paths(&field).iter() {
                let last = path.last().expect("nonempty path");
                let negative =
                    Expr::less(self.target_size(last)?, Expr::number(0)).at(last.size.location());
                let start = Expr::greater_equal(self.target_first(last), Expr::first("Message"));

                let mut facts = self.path_facts(path, false)?;
                let outgoing = self.outgoing(&field);
                if !field.is_final() && !outgoing.is_empty() {
                    facts.push(Expr::or(
                        outgoing.iter().map(|l| l.condition.clone()).collect(),
                    ));
                }
                facts.extend(self.type_constraints(&negative));
                facts.extend(self.type_constraints(&start));

                // Only check positions of reachable paths.
                if prove(&Expr::True, &facts, config).result != ProofResult::Sat {
                    continue;
                }

                let names: Vec<&str> = path.iter().map(|l| l.target.name()).collect();
                let path_message = names.join(" -> ");

                session.add(
                    &negative,
                    &facts,
                    ProofResult::Unsat,
                    vec![Entry::error(
                        format!(
                            "negative size for field \"{}\" ({})",
                            field.name(),
                            path_message
                        ),
                        field.location().clone(),
                    )],
                    false,
                    false,
                );

                session.add(
                    &start,
                    &facts,
                    ProofResult::Sat,
                    vec![Entry::error(
                        format!(
                            "negative start for field \"{}\" ({})",
                            field.name(),
                            path_message
                        ),
                        self.identifier().location().clone(),
                    )],
                    false,
                    true,
                );

                if let Some(TypeDef::Opaque(opaque)) = self.types().get(&field) {
                    let element_size = opaque.element_size();

                    let start_aligned = Expr::not(Expr::equal(
                        Expr::modulo(self.target_first(last), element_size.clone()),
                        Expr::number(1),
                    ));
                    let mut aligned_facts = facts.clone();
                    aligned_facts.extend(Self::message_constraints());
                    aligned_facts.extend(self.type_constraints(&start_aligned));
                    session.add(
                        &start_aligned,
                        &aligned_facts,
                        ProofResult::Unsat,
                        vec![Entry::error(
                            format!(
                                "opaque field \"{}\" not aligned to {} bit boundary ({})",
                                field.name(),
                                element_size,
                                path_message
                            ),
                            field.location().clone(),
                        )],
                        false,
                        false,
                    );

                    let size_multiple = Expr::not(Expr::equal(
                        Expr::modulo(self.target_size(last)?, element_size.clone()),
                        Expr::number(0),
                    ));
                    let mut multiple_facts = facts.clone();
                    multiple_facts.extend(Self::message_constraints());
                    multiple_facts.extend(self.type_constraints(&size_multiple));
                    session.add(
                        &size_multiple,
                        &multiple_facts,
                        ProofResult::Unsat,
                        vec![Entry::error(
                            format!(
                                "size of opaque field \"{}\" not multiple of {} bit ({})",
                                field.name(),
                                element_size,
                                path_message
                            ),
                            field.location().clone(),
                        )],
                        false,
                        false,
                    );
                }
                session.push();
            }
        }
        session.check(diagnostics);
        Ok(())
    }

    fn prove_message_size(
        &self,
        config: &Config,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ModelError> {
        let mut session = ProofSession::new(config);
        let type_constraints = self.type_constraints(&Expr::True);
        let field_size_constraints: Vec<Expr> = self
            .types()
            .iter()
            .filter(|(_, t)| t.is_composite())
            .map(|(f, _)| {
                Expr::equal(
                    Expr::modulo(Expr::size(f.id().clone()), Expr::number(8)),
                    Expr::number(0),
                )
            })
            .collect();

        for full_path in self.paths(&Field::final_()).iter() {
            let path = &full_path[..full_path.len().saturating_sub(1)];
            if path.is_empty() {
                continue;
            }
            let message_size = Expr::add(
                path.iter()
                    .filter(|l| !l.target.is_final() && l.first == Expr::Undefined)
                    .map(|l| Expr::size(l.target.id().clone()))
                    .collect(),
            );
            let mut facts = self.path_facts(path, false)?;
            facts.extend(type_constraints.iter().cloned());
            facts.extend(field_size_constraints.iter().cloned());

            let names: Vec<&str> = path.iter().map(|l| l.target.name()).collect();
            let error = vec![
                Entry::error(
                    "message size must be multiple of 8 bit",
                    self.identifier().location().clone(),
                ),
                Entry::info(
                    format!("on path {}", names.join(" -> ")),
                    self.identifier().location().clone(),
                ),
            ];

            let goal = Expr::not_equal(
                Expr::modulo(message_size, Expr::number(8)),
                Expr::number(0),
            );
            session.add(&goal, &facts, ProofResult::Sat, error, true, false);
        }
        session.check(diagnostics);
        Ok(())
    }
}

impl VerifiedMessage {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The message size given values for all fields of some complete path,
    /// proven per path and substituted into a closed form.
    pub fn size(&self, field_values: &BTreeMap<Field, Expr>) -> Result<Expr, ModelError> {
        if self.structure().is_empty() {
            return Ok(Expr::number(0));
        }

        let values: Vec<Expr> = field_values
            .iter()
            .map(|(f, v)| Expr::equal(Expr::var(f.id().clone()), v.clone()))
            .collect();
        let aggregate_sizes: Vec<Expr> = field_values
            .iter()
            .filter_map(|(f, v)| match v {
                Expr::Aggregate(a) => Some(Expr::equal(
                    Expr::size(f.id().clone()),
                    Expr::number(a.elements.len() as i128 * 8),
                )),
                _ => None,
            })
            .collect();

        let provided: Vec<Field> = field_values.keys().cloned().collect();
        let mut failures: Vec<(Path, Vec<Entry>)> = Vec::new();

        for full_path in self.paths(&Field::final_()).iter() {
            let path_fields: Vec<Field> = {
                let mut fields: Vec<Field> = self
                    .parameters()
                    .to_vec();
                fields.extend(
                    full_path
                        .iter()
                        .filter(|l| !l.target.is_final())
                        .map(|l| l.target.clone()),
                );
                fields
            };
            if !self.has_fixed_size() && {
                let mut a = provided.clone();
                let mut b = path_fields.clone();
                a.sort();
                b.sort();
                a != b
            } {
                continue;
            }

            let message_size = Expr::add(
                full_path
                    .iter()
                    .filter(|l| !l.target.is_final() && l.first == Expr::Undefined)
                    .map(|l| Expr::size(l.target.id().clone()))
                    .collect(),
            );
            let link_facts = self.path_facts(full_path, true)?;
            let mut facts = aggregate_sizes.clone();
            facts.extend(link_facts.iter().cloned());
            facts.extend(values.iter().cloned());
            facts.extend(self.type_constraints(&Expr::True));

            let goal = Expr::equal(Expr::size("Message"), message_size.clone());
            let proof = prove(&goal, &facts, &self.config);
            if proof.result == ProofResult::Sat {
                let mapping_facts: Vec<Expr> = aggregate_sizes
                    .iter()
                    .chain(link_facts.iter())
                    .chain(values.iter())
                    .chain(self.type_constraints(&Expr::True).iter())
                    .cloned()
                    .collect();
                let mapping = super::to_mapping(&mapping_facts);
                return Ok(message_size
                    .substituted_mapping(&mapping)
                    .substituted_mapping(&mapping)
                    .simplified());
            }
            failures.push(((*full_path).clone(), proof.unsatisfied_entries()));
        }

        let mut error = Diagnostics::new();
        let values_message = field_values
            .iter()
            .map(|(f, v)| format!("{} => {}", f.name(), v))
            .collect::<Vec<_>>()
            .join(", ");
        error.push(Entry::error(
            format!(
                "unable to calculate size for message \"{}'({})\"",
                self.identifier(),
                values_message
            ),
            self.location().clone(),
        ));
        for (path, entries) in failures {
            let names: Vec<&str> = path
                .iter()
                .filter(|l| !l.target.is_final())
                .map(|l| l.target.name())
                .collect();
            error.push(Entry::info(
                format!("on path {}", names.join(" -> ")),
                self.location().clone(),
            ));
            error.extend(entries);
        }
        Err(error.propagate().unwrap_err())
    }

    /// Maximum size of the message over all complete paths, in bits.
    pub fn max_size(&self) -> Result<Expr, ModelError> {
        if self.structure().is_empty() {
            return Ok(Expr::number(0));
        }
        if self.has_implicit_size() {
            let mut error = Diagnostics::new();
            error.push(Entry::error(
                "unable to calculate maximum size of message with implicit size",
                self.location().clone(),
            ));
            return Err(error.propagate().unwrap_err());
        }

        let mut result = 0;
        for path in self.paths(&Field::final_()).iter() {
            if let Some(value) = self.max_value(&Expr::size("Message"), path)? {
                result = result.max(value);
            }
        }
        Ok(Expr::number(result))
    }

    /// Maximum size of every field over all complete paths, in bits.
    pub fn max_field_sizes(&self) -> Result<BTreeMap<Field, Expr>, ModelError> {
        if self.structure().is_empty() {
            return Ok(BTreeMap::new());
        }
        if self.has_implicit_size() {
            let mut error = Diagnostics::new();
            error.push(Entry::error(
                "unable to calculate maximum field sizes of message with implicit size",
                self.location().clone(),
            ));
            return Err(error.propagate().unwrap_err());
        }

        let mut result: BTreeMap<Field, i128> =
            self.fields().iter().map(|f| (f.clone(), 0)).collect();
        for path in self.paths(&Field::final_()).iter() {
            for link in &path[..path.len().saturating_sub(1)] {
                if let Some(value) =
                    self.max_value(&Expr::size(link.target.id().clone()), path)?
                {
                    let entry = result.entry(link.target.clone()).or_insert(0);
                    *entry = (*entry).max(value);
                }
            }
        }
        Ok(result
            .into_iter()
            .map(|(f, v)| (f, Expr::number(v)))
            .collect())
    }

    fn max_value(&self, target: &Expr, path: &Path) -> Result<Option<i128>, ModelError> {
        let message_size = Expr::add(
            path.iter()
                .filter(|l| !l.target.is_final() && l.first == Expr::Undefined)
                .map(|l| Expr::size(l.target.id().clone()))
                .collect(),
        );
        let mut facts = vec![Expr::equal(Expr::size("Message"), message_size)];
        facts.extend(self.path_facts(path, false)?);
        facts.extend(self.type_constraints(&Expr::True));
        Ok(maximum(target, &facts, &self.config))
    }

    /// Whether the field can be empty on some complete path.
    pub fn is_possibly_empty(&self, field: &Field) -> bool {
        match self.types().get(field) {
            Some(t) if !t.is_scalar() => {}
            _ => return false,
        }

        for path in self.paths(&Field::final_()).iter() {
            if !path.iter().any(|l| &l.target == field) {
                continue;
            }
            let empty = Expr::equal(Expr::size(field.id().clone()), Expr::number(0));
            let mut facts = self.type_constraints(&empty);
            facts.extend(
                path.iter()
                    .filter(|l| l.condition != Expr::True)
                    .map(|l| l.condition.clone()),
            );
            facts.extend(path.iter().filter(|l| l.size != Expr::Undefined).map(|l| {
                Expr::equal(Expr::size(l.target.id().clone()), l.size.clone())
            }));
            if prove(&empty, &facts, &self.config).result == ProofResult::Sat {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use crate::types::ModularInteger;

    fn config() -> Config {
        Config::default()
    }

    fn byte() -> TypeDef {
        TypeDef::Modular(ModularInteger::new("P::T", Expr::number(256)))
    }

    #[test]
    fn two_field_message_is_proven() {
        let message = Message::new(
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
        );
        let verified = message.verified(&config()).unwrap();
        assert_eq!(verified.fields(), &[Field::new("A"), Field::new("B")]);
        assert_eq!(verified.max_size().unwrap(), Expr::number(16));
    }

    #[test]
    fn subsequent_field_reference_is_reported() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("F1")),
                Link::new(Field::new("F1"), Field::new("F2")).with_condition(Expr::equal(
                    Expr::var(Id::parse("F2").at(Location::new(1024, 57))),
                    Expr::number(42),
                )),
                Link::new(Field::new("F2"), Field::final_()),
            ],
            vec![
                (Field::new("F1"), byte()),
                (Field::new("F2"), byte()),
            ],
        );
        let rendered = message.verified(&config()).unwrap_err().to_string();
        assert!(rendered
            .contains("<stdin>:1024:57: model: error: subsequent field \"F2\" referenced"));
    }

    #[test]
    fn undefined_variable_is_reported() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("F1")),
                Link::new(Field::new("F1"), Field::new("F2")).with_condition(Expr::equal(
                    Expr::var(Id::parse("Val3").at(Location::new(444, 55))),
                    Expr::number(1),
                )),
                Link::new(Field::new("F2"), Field::final_()),
            ],
            vec![
                (Field::new("F1"), byte()),
                (Field::new("F2"), byte()),
            ],
        );
        let rendered = message.verified(&config()).unwrap_err().to_string();
        assert!(rendered
            .contains("<stdin>:444:55: model: error: undefined variable \"Val3\" referenced"));
        assert!(rendered.contains("model: info: on path F1 -> F2"));
    }

    #[test]
    fn size_aspect_on_fixed_size_field_is_rejected() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::new("B")).with_size(Expr::number(8)),
                Link::new(Field::new("B"), Field::final_()),
            ],
            vec![
                (Field::new("A"), byte()),
                (Field::new("B"), byte()),
            ],
        );
        let rendered = message.verified(&config()).unwrap_err().to_string();
        assert!(rendered.contains("fixed size field \"B\" with size aspect"));
    }

    #[test]
    fn size_aspect_on_final_link_is_rejected() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("A")),
                Link::new(Field::new("A"), Field::final_()).with_size(Expr::number(8)),
            ],
            vec![(Field::new("A"), byte())],
        );
        let rendered = message.verified(&config()).unwrap_err().to_string();
        assert!(rendered.contains("size aspect for final field in \"P::M\""));
    }

    #[test]
    fn invalid_size_attribute_prefix_is_rejected() {
        let message = Message::new(
            "P::M",
            vec![
                Link::new(Field::initial(), Field::new("F1")),
                Link::new(Field::new("F1"), Field::final_()).with_condition(Expr::equal(
                    Expr::size("F9").at(Location::new(400, 17)),
                    Expr::number(32),
                )),
            ],
            vec![(Field::new("F1"), byte())],
        );
        let rendered = message.verified(&config()).unwrap_err().to_string();
        assert!(rendered.contains("invalid use of size attribute for \"F9\""));
    }
}

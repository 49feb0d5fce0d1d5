//! Reference resolver
//!
//! Resolves each step of a reference path against the model and the query
//! environment, attaches per-step links, classifies the reference
//! (pseudo, foreign-key-only, join-relevant) and enforces the infix filter
//! rules. The rewriter consumes the attached links without ever touching the
//! model again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cqn::{RefExpr, Step};
use crate::model::{AssocDef, Definition, ElementDef, Elements, Model};

use super::elements::InferredElements;
use super::errors::InferenceError;
use super::pseudo;

/// What a single reference step resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkDef {
    /// A query source named by its alias (or a from-clause entity step).
    Entity(Arc<Definition>),
    /// An element (scalar, structured, or association).
    Element(Arc<ElementDef>),
    /// A step under a pseudo root; rendered verbatim.
    Pseudo(String),
    /// `$self.<column>`; replaced by the targeted column during rewriting.
    SelfRef(String),
    /// A subquery source named by its alias.
    Subquery(String),
}

impl LinkDef {
    pub fn as_element(&self) -> Option<&Arc<ElementDef>> {
        match self {
            LinkDef::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn as_assoc(&self) -> Option<&AssocDef> {
        self.as_element().and_then(|el| el.as_assoc())
    }
}

/// Per-step resolution: the definition, the entity in which the *next* step
/// resolves, and the table alias this step renders with. Join-tree merging
/// overwrites `alias` on merged association links.
#[derive(Debug, Clone, PartialEq)]
pub struct RefLink {
    pub def: LinkDef,
    pub target: Option<Arc<Definition>>,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedRef {
    pub links: Vec<RefLink>,
    /// Rooted in the pseudo namespace; emitted verbatim.
    pub pseudo: bool,
    /// `$self.<column>` reference.
    pub self_ref: bool,
    /// Resolved against a base link (infix filter); the table alias comes
    /// from the enclosing context at rewrite time.
    pub base_rooted: bool,
    /// First step named an alias of an outer query.
    pub outer_rooted: bool,
    /// First step named a source alias of this query.
    pub first_step_is_source: bool,
    /// Index of the deepest association link that needs a join; all
    /// association links up to it become join-tree nodes.
    pub join_cut: Option<usize>,
}

impl ResolvedRef {
    pub fn join_relevant(&self) -> bool {
        self.join_cut.is_some()
    }

    pub fn leaf(&self) -> &RefLink {
        self.links.last().expect("resolved ref has at least one link")
    }

    pub fn leaf_element(&self) -> Option<&Arc<ElementDef>> {
        self.leaf().def.as_element()
    }

    /// Alias of the table the flattened reference reads from, and the index
    /// of the first step that contributes to the flat column name.
    pub fn flat_root(&self) -> (String, usize) {
        if let Some(cut) = self.join_cut {
            return (self.links[cut].alias.clone(), cut + 1);
        }
        let skip_first = self.first_step_is_source || matches!(self.links[0].def, LinkDef::Subquery(_));
        (
            self.links[0].alias.clone(),
            if skip_first { 1 } else { 0 },
        )
    }
}

/// One source of a query (`from` entity, join arg, or subquery).
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySource {
    pub alias: String,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    Entity(Arc<Definition>),
    Subquery { name: String, elements: Elements },
}

impl QuerySource {
    pub fn name(&self) -> &str {
        match &self.kind {
            SourceKind::Entity(def) => &def.name,
            SourceKind::Subquery { name, .. } => name,
        }
    }

    pub fn elements(&self) -> &Elements {
        match &self.kind {
            SourceKind::Entity(def) => &def.elements,
            SourceKind::Subquery { elements, .. } => elements,
        }
    }

    pub fn entity(&self) -> Option<&Arc<Definition>> {
        match &self.kind {
            SourceKind::Entity(def) => Some(def),
            SourceKind::Subquery { .. } => None,
        }
    }

    /// Synthesize a subquery source from an inner query's inferred elements.
    pub fn from_subquery(alias: &str, name: &str, elements: &InferredElements) -> Self {
        QuerySource {
            alias: alias.to_string(),
            kind: SourceKind::Subquery {
                name: name.to_string(),
                elements: elements.as_model_elements(),
            },
        }
    }
}

/// Alias scope of one enclosing query, for correlated subqueries.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub sources: &'a [QuerySource],
    pub parent: Option<&'a Scope<'a>>,
}

/// Per-query resolution environment.
#[derive(Debug, Clone, Copy)]
pub struct ResolveCtx<'a> {
    pub model: &'a Model,
    pub localized: bool,
    pub sources: &'a [QuerySource],
    /// Unqualified element name → indices of contributing sources.
    pub combined: &'a HashMap<String, Vec<usize>>,
    pub outer: Option<&'a Scope<'a>>,
    /// Names registered in the first pass for `$self` references.
    pub self_names: &'a HashSet<String>,
}

/// Entity context rooting an infix filter.
#[derive(Debug, Clone)]
pub struct BaseLink {
    pub def: Arc<Definition>,
    /// The association being filtered, for foreign-key restriction messages.
    pub assoc: Option<Arc<ElementDef>>,
}

/// Flags describing where the reference being resolved sits.
#[derive(Debug, Clone, Default)]
pub struct RefContext {
    pub base: Option<BaseLink>,
    pub in_exists: bool,
    pub in_expand: bool,
    pub in_filter: bool,
    /// A filter on the final step is legal (from paths, exists paths,
    /// expand roots).
    pub terminal_filter_ok: bool,
}

impl RefContext {
    pub fn plain() -> Self {
        RefContext::default()
    }

    pub fn exists() -> Self {
        RefContext {
            in_exists: true,
            terminal_filter_ok: true,
            ..RefContext::default()
        }
    }

    pub fn expand() -> Self {
        RefContext {
            in_expand: true,
            terminal_filter_ok: true,
            ..RefContext::default()
        }
    }
}

enum Cursor {
    Def(Arc<Definition>),
    El(Arc<ElementDef>),
    Free(Elements),
    None,
}

impl Cursor {
    fn elements(&self) -> Option<&Elements> {
        match self {
            Cursor::Def(def) => Some(&def.elements),
            Cursor::El(el) => el.sub_elements(),
            Cursor::Free(els) => Some(els),
            Cursor::None => None,
        }
    }
}

/// Resolve a reference in place; `r.resolved` is populated on success.
pub fn resolve_ref(
    r: &mut RefExpr,
    ctx: &ResolveCtx,
    rctx: &RefContext,
) -> Result<(), InferenceError> {
    if r.steps.is_empty() {
        return Err(InferenceError::UnknownName(String::new()));
    }
    let first = r.steps[0].name.clone();

    // Pseudo paths bypass the model entirely.
    if pseudo::is_pseudo_root(&first) {
        let names = r.names_owned();
        if !pseudo::validate(&names.iter().map(String::as_str).collect::<Vec<_>>()) {
            return Err(InferenceError::UnknownName(r.dotted()));
        }
        if r.steps.iter().any(|s| s.filter.is_some()) {
            return Err(InferenceError::FilterOnNonAssoc {
                step: first,
                path: r.dotted(),
            });
        }
        r.resolved = Some(ResolvedRef {
            links: r
                .steps
                .iter()
                .map(|s| RefLink {
                    def: LinkDef::Pseudo(s.name.clone()),
                    target: None,
                    alias: String::new(),
                })
                .collect(),
            pseudo: true,
            ..ResolvedRef::default()
        });
        return Ok(());
    }

    if first == "$self" || first == "$projection" {
        if r.steps.len() != 2 || !ctx.self_names.contains(&r.steps[1].name) {
            return Err(InferenceError::UnknownName(r.dotted()));
        }
        r.resolved = Some(ResolvedRef {
            links: vec![
                RefLink {
                    def: LinkDef::SelfRef(r.steps[1].name.clone()),
                    target: None,
                    alias: String::new(),
                },
                RefLink {
                    def: LinkDef::SelfRef(r.steps[1].name.clone()),
                    target: None,
                    alias: String::new(),
                },
            ],
            self_ref: true,
            ..ResolvedRef::default()
        });
        return Ok(());
    }

    let mut resolved = ResolvedRef::default();
    let mut cursor;

    // Priority order for the first step: base link elements, source aliases,
    // outer aliases, combined elements.
    if let Some((link, cur)) = resolve_first(&first, ctx, rctx, &mut resolved)? {
        cursor = cur;
        resolved.links.push(link);
    } else {
        return Err(InferenceError::UnknownName(r.dotted()));
    }

    // Remaining steps resolve in the previous step's elements; crossing an
    // association continues in its (localized) target entity.
    for i in 1..r.steps.len() {
        let name = r.steps[i].name.clone();
        let els = cursor.elements().ok_or_else(|| {
            InferenceError::UnknownName(dotted_prefix(&r.steps, i + 1))
        })?;
        let el = els
            .get(&name)
            .cloned()
            .ok_or_else(|| InferenceError::UnknownName(dotted_prefix(&r.steps, i + 1)))?;
        let target = assoc_target(&el, ctx)?;
        cursor = match &target {
            Some(t) => Cursor::Def(Arc::clone(t)),
            None => Cursor::El(Arc::clone(&el)),
        };
        resolved.links.push(RefLink {
            def: LinkDef::Element(el),
            target,
            alias: name,
        });
    }

    // Infix filters only sit on associations (or from-clause entity steps).
    for (i, step) in r.steps.iter().enumerate() {
        if step.filter.is_none() {
            continue;
        }
        let on_entity = matches!(resolved.links[i].def, LinkDef::Entity(_));
        let on_assoc = resolved.links[i].def.as_assoc().is_some();
        if !on_entity && !on_assoc {
            return Err(InferenceError::FilterOnNonAssoc {
                step: step.name.clone(),
                path: r.dotted(),
            });
        }
        let terminal = i + 1 == r.steps.len();
        if terminal && !rctx.terminal_filter_ok && !rctx.in_exists && !rctx.in_expand {
            return Err(InferenceError::FilterWithoutNavigation { path: r.dotted() });
        }
    }

    classify(r, ctx, rctx, &mut resolved)?;
    r.resolved = Some(resolved);
    Ok(())
}

fn resolve_first(
    first: &str,
    ctx: &ResolveCtx,
    rctx: &RefContext,
    resolved: &mut ResolvedRef,
) -> Result<Option<(RefLink, Cursor)>, InferenceError> {
    if let Some(base) = &rctx.base {
        if let Some(el) = base.def.elements.get(first) {
            resolved.base_rooted = true;
            let target = assoc_target(el, ctx)?;
            let cursor = match &target {
                Some(t) => Cursor::Def(Arc::clone(t)),
                None => Cursor::El(Arc::clone(el)),
            };
            return Ok(Some((
                RefLink {
                    def: LinkDef::Element(Arc::clone(el)),
                    target,
                    alias: String::new(),
                },
                cursor,
            )));
        }
    }

    if let Some(source) = ctx.sources.iter().find(|s| s.alias == first) {
        resolved.first_step_is_source = true;
        return Ok(Some(source_link(source)));
    }

    let mut outer = ctx.outer;
    while let Some(scope) = outer {
        if let Some(source) = scope.sources.iter().find(|s| s.alias == first) {
            resolved.outer_rooted = true;
            resolved.first_step_is_source = true;
            return Ok(Some(source_link(source)));
        }
        outer = scope.parent;
    }

    if let Some(contributors) = ctx.combined.get(first) {
        if contributors.len() > 1 {
            return Err(InferenceError::AmbiguousName {
                name: first.to_string(),
                candidates: contributors
                    .iter()
                    .map(|&i| format!("{}.{first}", ctx.sources[i].alias))
                    .collect(),
            });
        }
        let source = &ctx.sources[contributors[0]];
        let el = source
            .elements()
            .get(first)
            .expect("combined map points at an existing element");
        let target = assoc_target(el, ctx)?;
        let cursor = match &target {
            Some(t) => Cursor::Def(Arc::clone(t)),
            None => Cursor::El(Arc::clone(el)),
        };
        return Ok(Some((
            RefLink {
                def: LinkDef::Element(Arc::clone(el)),
                target,
                alias: source.alias.clone(),
            },
            cursor,
        )));
    }

    Ok(None)
}

fn source_link(source: &QuerySource) -> (RefLink, Cursor) {
    match &source.kind {
        SourceKind::Entity(def) => (
            RefLink {
                def: LinkDef::Entity(Arc::clone(def)),
                target: Some(Arc::clone(def)),
                alias: source.alias.clone(),
            },
            Cursor::Def(Arc::clone(def)),
        ),
        SourceKind::Subquery { elements, .. } => (
            RefLink {
                def: LinkDef::Subquery(source.alias.clone()),
                target: None,
                alias: source.alias.clone(),
            },
            Cursor::Free(elements.clone()),
        ),
    }
}

/// Target of an association element (localized view applied), None otherwise.
fn assoc_target(
    el: &Arc<ElementDef>,
    ctx: &ResolveCtx,
) -> Result<Option<Arc<Definition>>, InferenceError> {
    match el.as_assoc() {
        Some(assoc) => {
            let target = ctx.model.target(assoc)?;
            Ok(Some(Arc::clone(
                ctx.model.localized_view_for(target, ctx.localized),
            )))
        }
        None => Ok(None),
    }
}

/// Foreign-key-only vs join-relevant classification, and the infix filter
/// restrictions inside non-exists filters.
fn classify(
    r: &RefExpr,
    _ctx: &ResolveCtx,
    rctx: &RefContext,
    resolved: &mut ResolvedRef,
) -> Result<(), InferenceError> {
    let names: Vec<&str> = r.steps.iter().map(|s| s.name.as_str()).collect();
    let last = r.steps.len() - 1;

    let mut cut = None;
    for i in 0..r.steps.len() {
        let Some(assoc) = resolved.links[i].def.as_assoc() else {
            continue;
        };
        if i == last {
            // A terminal association flattens to its foreign keys (columns)
            // or feeds an exists/expand; never a join by itself.
            break;
        }
        let filtered = r.steps[i].filter.is_some();
        let tail_filtered = r.steps[i + 1..].iter().any(|s| s.filter.is_some());
        if filtered || tail_filtered || !fk_access(assoc, &names[i + 1..]) {
            cut = Some(i);
        }
    }

    if rctx.in_filter && !rctx.in_exists && !rctx.in_expand {
        for link in &resolved.links {
            if let Some(assoc) = link.def.as_assoc() {
                let el = link.def.as_element().expect("association is an element");
                if !assoc.is_managed() {
                    return Err(InferenceError::UnmanagedInInfixFilter {
                        assoc: el.name.clone(),
                        path: r.dotted(),
                    });
                }
            }
        }
        if let Some(c) = cut {
            let el = resolved.links[c]
                .def
                .as_element()
                .expect("join cut sits on an association element");
            return Err(InferenceError::NonFkInInfixFilter {
                assoc: el.name.clone(),
                path: r.dotted(),
            });
        }
    }

    if resolved.outer_rooted && cut.is_some() {
        return Err(InferenceError::UnsupportedOuterNavigation(r.dotted()));
    }

    // Exists predicates and expand roots become subqueries, not joins.
    if !rctx.in_exists && !rctx.in_expand {
        resolved.join_cut = cut;
    }
    Ok(())
}

/// Whether `rest` navigates the association solely through its foreign keys.
/// Empty `rest` (the association itself) counts: it flattens to all keys.
pub fn fk_access(assoc: &AssocDef, rest: &[&str]) -> bool {
    let Some(keys) = &assoc.keys else {
        return rest.is_empty();
    };
    if rest.is_empty() {
        return true;
    }
    keys.iter().any(|fk| {
        let n = fk.path.len().min(rest.len());
        fk.path.iter().take(n).map(String::as_str).eq(rest.iter().take(n).copied())
    })
}

fn dotted_prefix(steps: &[Step], upto: usize) -> String {
    steps
        .iter()
        .take(upto)
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

// ---------------------------------------------------------------------------
// Flat name computation
// ---------------------------------------------------------------------------

/// Underscore-join the step names from `start`, replacing segments that
/// navigate a renamed foreign key with the physical column suffix.
pub fn flat_segments(links: &[RefLink], steps: &[Step], start: usize) -> String {
    let mut out: Vec<String> = vec![];
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    let mut p = start;
    while p < steps.len() {
        if let Some(assoc) = links[p].def.as_assoc() {
            if p + 1 < steps.len() {
                if let Some(keys) = &assoc.keys {
                    if let Some(fk) = keys
                        .iter()
                        .find(|fk| names[p + 1..].starts_with(
                            &fk.path.iter().map(String::as_str).collect::<Vec<_>>()[..],
                        ))
                    {
                        out.push(names[p].to_string());
                        out.push(fk.flat_suffix());
                        p += 1 + fk.path.len();
                        continue;
                    }
                }
            }
        }
        out.push(names[p].to_string());
        p += 1;
    }
    out.join("_")
}

// ---------------------------------------------------------------------------
// Leaf expansion
// ---------------------------------------------------------------------------

/// Scalar leaves of an element, as (flat suffix relative to the element, leaf)
/// pairs in declaration order. Scalars yield one pair with an empty suffix;
/// structured elements recurse; managed associations contribute their foreign
/// key columns; unmanaged associations and virtual elements are skipped.
pub fn scalar_leaves(
    el: &Arc<ElementDef>,
    model: &Model,
) -> Vec<(String, Arc<ElementDef>)> {
    if el.is_virtual {
        return vec![];
    }
    if el.is_scalar() {
        return vec![(String::new(), Arc::clone(el))];
    }
    if let Some(children) = el.sub_elements() {
        let mut out = vec![];
        for child in children.iter() {
            for (suffix, leaf) in scalar_leaves(child, model) {
                out.push((join_suffix(&child.name, &suffix), leaf));
            }
        }
        return out;
    }
    if let Some(assoc) = el.as_assoc() {
        if assoc.is_managed() {
            return fk_leaves(assoc, model);
        }
    }
    vec![]
}

/// Foreign-key columns of a managed association as (flat suffix, leaf) pairs.
pub fn fk_leaves(assoc: &AssocDef, model: &Model) -> Vec<(String, Arc<ElementDef>)> {
    let mut out = vec![];
    let Some(keys) = &assoc.keys else {
        return out;
    };
    let Ok(target) = model.target(assoc) else {
        return out;
    };
    for fk in keys {
        let Some(el) = resolve_path(&target.elements, &fk.path) else {
            log::warn!(
                "foreign key path '{}' not found in '{}'",
                fk.path.join("."),
                target.name
            );
            continue;
        };
        let base = fk.flat_suffix();
        for (suffix, leaf) in scalar_leaves(&el, model) {
            out.push((join_suffix(&base, &suffix), leaf));
        }
    }
    out
}

fn resolve_path(elements: &Elements, path: &[String]) -> Option<Arc<ElementDef>> {
    let mut els = elements;
    let mut current: Option<Arc<ElementDef>> = None;
    for seg in path {
        let el = els.get(seg)?;
        current = Some(Arc::clone(el));
        match el.sub_elements() {
            Some(children) => els = children,
            None => els = &EMPTY_ELEMENTS,
        }
    }
    current
}

lazy_static::lazy_static! {
    static ref EMPTY_ELEMENTS: Elements = Elements::new();
}

fn join_suffix(head: &str, tail: &str) -> String {
    if tail.is_empty() {
        head.to_string()
    } else {
        format!("{head}_{tail}")
    }
}

impl RefExpr {
    pub(crate) fn names_owned(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }
}

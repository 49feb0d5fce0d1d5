//! Inference phase
//!
//! Walks the input query, resolves every name against the model, attaches
//! per-step resolution links, expands wildcards and nested projections into a
//! normalized column list, detects join-relevant navigations and builds the
//! join tree, and computes the query's output elements. The rewriter runs on
//! the inferred query and never resolves a name itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cqn::{Column, ColumnExpr, From, FromRef, Select, Step, Token};
use crate::model::{Definition, ElementDef, Model};

pub mod elements;
pub mod errors;
pub mod join_tree;
pub mod pseudo;
pub mod resolver;

pub use elements::{InferredElement, InferredElements, InferredKind};
pub use errors::InferenceError;
pub use join_tree::{AliasAllocator, JoinNode, JoinTree};
pub use resolver::{
    BaseLink, LinkDef, QuerySource, RefContext, RefLink, ResolveCtx, ResolvedRef, Scope,
    SourceKind,
};

/// Inference by-products attached to a SELECT.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Inferred {
    /// Alias → source, in insertion order.
    pub sources: Vec<QuerySource>,
    /// Single source name; None when the query itself is the target.
    pub target: Option<String>,
    /// Ordered output element map.
    pub elements: InferredElements,
    pub join_tree: JoinTree,
    /// Columns after wildcard/inline expansion, with references resolved.
    pub expanded_columns: Vec<Column>,
}

impl Inferred {
    /// Alias of the first (primary) source.
    pub fn primary_alias(&self) -> &str {
        self.sources
            .first()
            .map(|s| s.alias.as_str())
            .unwrap_or_default()
    }

    pub fn source(&self, alias: &str) -> Option<&QuerySource> {
        self.sources.iter().find(|s| s.alias == alias)
    }

    /// The expanded column backing an output element name.
    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.expanded_columns
            .iter()
            .find(|c| default_column_name(c).as_deref() == Some(name))
    }
}

/// Infer a SELECT in place. `outer` is the alias scope chain of enclosing
/// queries, for correlated subqueries.
pub fn infer(
    select: &mut Select,
    model: &Model,
    outer: Option<&Scope<'_>>,
) -> Result<(), InferenceError> {
    let localized = select.localized;
    let mut join_tree = JoinTree::new();
    let mut sources: Vec<QuerySource> = vec![];

    resolve_from(
        &mut select.from,
        model,
        localized,
        outer,
        &mut sources,
        &mut join_tree,
    )?;

    let combined = combined_elements(&sources);

    // First pass of the two-pass $self scheme: register the names of plain
    // (non-ref) columns, so references may target them in the second pass.
    let mut self_names: HashSet<String> = HashSet::new();
    if let Some(columns) = &select.columns {
        for col in columns {
            if !matches!(col.expr, ColumnExpr::Ref(_) | ColumnExpr::Star) {
                if let Some(alias) = &col.alias {
                    self_names.insert(alias.clone());
                }
            }
        }
    }

    let ctx = ResolveCtx {
        model,
        localized,
        sources: &sources,
        combined: &combined,
        outer,
        self_names: &self_names,
    };

    let expanded_columns = expand_columns(select, &ctx, &mut join_tree)?;

    if let Some(where_) = &mut select.where_ {
        resolve_token_stream(where_, &ctx, &RefContext::plain(), Some(&mut join_tree))?;
    }
    if let Some(having) = &mut select.having {
        resolve_token_stream(having, &ctx, &RefContext::plain(), Some(&mut join_tree))?;
    }
    if let Some(group_by) = &mut select.group_by {
        resolve_token_stream(group_by, &ctx, &RefContext::plain(), Some(&mut join_tree))?;
    }
    if let Some(search) = &mut select.search {
        resolve_token_stream(search, &ctx, &RefContext::plain(), None)?;
    }
    if let Some(order_by) = &mut select.order_by {
        for item in order_by.iter_mut() {
            resolve_order_by_token(
                &mut item.token,
                &ctx,
                &expanded_columns,
                &mut join_tree,
            )?;
        }
    }

    let elements = elements::infer_elements(&expanded_columns, model)?;

    let target = match sources.as_slice() {
        [single] if matches!(select.from, From::Ref(_)) => Some(single.name().to_string()),
        _ => None,
    };

    log::debug!(
        "inferred query over [{}]: {} elements, join tree {}",
        sources
            .iter()
            .map(|s| format!("{} as {}", s.name(), s.alias))
            .collect::<Vec<_>>()
            .join(", "),
        elements.len(),
        if join_tree.is_initial() { "empty" } else { "non-empty" },
    );

    select.inferred = Some(Inferred {
        sources,
        target,
        elements,
        join_tree,
        expanded_columns,
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

fn resolve_from(
    from: &mut From,
    model: &Model,
    localized: bool,
    outer: Option<&Scope<'_>>,
    sources: &mut Vec<QuerySource>,
    join_tree: &mut JoinTree,
) -> Result<(), InferenceError> {
    match from {
        From::Ref(fr) => resolve_from_ref(fr, model, localized, outer, sources, join_tree),
        From::Join(join) => {
            for arg in &mut join.args {
                resolve_from(arg, model, localized, outer, sources, join_tree)?;
            }
            // The on-condition sees the sources of both sides.
            let combined = combined_elements(sources);
            let self_names = HashSet::new();
            let ctx = ResolveCtx {
                model,
                localized,
                sources: &*sources,
                combined: &combined,
                outer,
                self_names: &self_names,
            };
            resolve_token_stream(&mut join.on, &ctx, &RefContext::plain(), None)
        }
        From::Select(fs) => {
            let alias = fs
                .alias
                .clone()
                .ok_or_else(|| InferenceError::ExpectingAlias("the subquery in from".into()))?;
            infer(&mut fs.select, model, outer)?;
            if !join_tree.aliases.reserve(&alias) {
                return Err(InferenceError::DuplicateAlias(alias));
            }
            let inferred = fs.select.inferred.as_ref().expect("subquery was inferred");
            let name = inferred
                .target
                .clone()
                .unwrap_or_else(|| format!("({alias})"));
            sources.push(QuerySource::from_subquery(&alias, &name, &inferred.elements));
            Ok(())
        }
    }
}

/// Resolve a `from` reference path. The query source is the target of the
/// last step; earlier association steps become a where-exists chain during
/// rewriting.
fn resolve_from_ref(
    fr: &mut FromRef,
    model: &Model,
    localized: bool,
    outer: Option<&Scope<'_>>,
    sources: &mut Vec<QuerySource>,
    join_tree: &mut JoinTree,
) -> Result<(), InferenceError> {
    if fr.steps.is_empty() {
        return Err(InferenceError::UnknownName(String::new()));
    }

    let root_name = fr.steps[0].name.clone();
    let root = model.lookup(&root_name)?;
    let root = Arc::clone(model.localized_view_for(root, localized));

    let mut links = vec![RefLink {
        def: LinkDef::Entity(Arc::clone(&root)),
        target: Some(Arc::clone(&root)),
        alias: root.short_name().to_string(),
    }];

    let mut current: Arc<Definition> = root;
    for i in 1..fr.steps.len() {
        let name = &fr.steps[i].name;
        let el = current.elements.get(name).cloned().ok_or_else(|| {
            InferenceError::UnknownName(dotted(&fr.steps, i + 1))
        })?;
        let Some(assoc) = el.as_assoc() else {
            return Err(InferenceError::NonAssocInFromPath {
                step: name.clone(),
                path: dotted(&fr.steps, fr.steps.len()),
            });
        };
        let target = model.target(assoc)?;
        let target = Arc::clone(model.localized_view_for(target, localized));
        links.push(RefLink {
            def: LinkDef::Element(el),
            target: Some(Arc::clone(&target)),
            alias: name.clone(),
        });
        current = target;
    }

    let alias = fr
        .alias
        .clone()
        .unwrap_or_else(|| short_name(&fr.steps.last().unwrap().name).to_string());
    if !join_tree.aliases.reserve(&alias) {
        return Err(InferenceError::DuplicateAlias(alias));
    }

    // Infix filters on from steps; conditions live in the respective
    // exists level, so navigation restrictions are lifted.
    for (i, step) in fr.steps.iter_mut().enumerate() {
        if let Some(filter) = &mut step.filter {
            let base_def = links[i].target.clone().expect("from step has a target");
            let base_assoc = links[i].def.as_element().cloned();
            let combined = HashMap::new();
            let self_names = HashSet::new();
            let ctx = ResolveCtx {
                model,
                localized,
                sources: &*sources,
                combined: &combined,
                outer,
                self_names: &self_names,
            };
            let rctx = RefContext {
                base: Some(BaseLink {
                    def: base_def,
                    assoc: base_assoc,
                }),
                in_exists: true,
                in_filter: true,
                ..RefContext::default()
            };
            resolve_token_stream(filter, &ctx, &rctx, None)?;
        }
    }

    sources.push(QuerySource {
        alias: alias.clone(),
        kind: SourceKind::Entity(Arc::clone(
            links.last().unwrap().target.as_ref().unwrap(),
        )),
    });

    fr.resolved = Some(ResolvedRef {
        links,
        ..ResolvedRef::default()
    });
    Ok(())
}

pub(crate) fn combined_elements(sources: &[QuerySource]) -> HashMap<String, Vec<usize>> {
    let mut combined: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, source) in sources.iter().enumerate() {
        for name in source.elements().names() {
            combined.entry(name.to_string()).or_default().push(i);
        }
    }
    combined
}

// ---------------------------------------------------------------------------
// Column expansion
// ---------------------------------------------------------------------------

/// Normalize the column list: resolve references, splice wildcards, turn
/// `inline` and structured `expand` into sibling columns with prefixed names.
fn expand_columns(
    select: &Select,
    ctx: &ResolveCtx<'_>,
    join_tree: &mut JoinTree,
) -> Result<Vec<Column>, InferenceError> {
    let raw = select
        .columns
        .clone()
        .unwrap_or_else(|| vec![Column::star()]);

    // Pass 1: resolve and flatten nested projections, keep wildcards as
    // markers.
    let mut slots: Vec<Column> = vec![];
    let mut work: Vec<Column> = raw.into_iter().rev().collect();
    while let Some(mut col) = work.pop() {
        match &col.expr {
            ColumnExpr::Star => slots.push(col),
            ColumnExpr::Ref(_) => {
                let is_expand = col.expand.is_some();
                let rctx = if is_expand {
                    RefContext::expand()
                } else {
                    RefContext::plain()
                };
                {
                    let r = col.ref_mut().unwrap();
                    resolve_ref_deep(r, ctx, &rctx, Some(&mut *join_tree))?;
                }
                let r = col.as_ref_expr().unwrap();
                let resolved = r.resolved.as_ref().unwrap();
                let leaf = resolved.leaf_element().cloned();

                if let Some(leaf_el) = &leaf {
                    if col.expand.is_some() && leaf_el.is_scalar() {
                        return Err(InferenceError::ExpandOnScalar(r.dotted()));
                    }
                    let nested_struct = col.expand.is_some() && leaf_el.is_structured();
                    if nested_struct || col.inline.is_some() {
                        let children =
                            synthesize_nested(&col, leaf_el, ctx.model)?;
                        // Process children in order, before the remaining
                        // columns.
                        for child in children.into_iter().rev() {
                            work.push(child);
                        }
                        continue;
                    }
                } else if col.expand.is_some() || col.inline.is_some() {
                    return Err(InferenceError::ExpandOnScalar(r.dotted()));
                }
                slots.push(col);
            }
            ColumnExpr::Func(_) => {
                if let ColumnExpr::Func(f) = &mut col.expr {
                    resolve_token_stream(
                        &mut f.args,
                        ctx,
                        &RefContext::plain(),
                        Some(&mut *join_tree),
                    )?;
                }
                slots.push(col);
            }
            ColumnExpr::Xpr(_) => {
                if let ColumnExpr::Xpr(tokens) = &mut col.expr {
                    resolve_token_stream(
                        tokens,
                        ctx,
                        &RefContext::plain(),
                        Some(&mut *join_tree),
                    )?;
                }
                slots.push(col);
            }
            _ => slots.push(col),
        }
    }

    // Pass 2: splice wildcards.
    if !slots.iter().any(|c| matches!(c.expr, ColumnExpr::Star)) {
        return Ok(slots);
    }
    let star_pos = slots
        .iter()
        .position(|c| matches!(c.expr, ColumnExpr::Star))
        .unwrap();
    let excluding: HashSet<&str> = select
        .excluding
        .iter()
        .flatten()
        .map(String::as_str)
        .collect();
    let before: HashSet<String> = slots[..star_pos]
        .iter()
        .filter_map(suppression_name)
        .collect();
    let mut after: Vec<Column> = slots.split_off(star_pos + 1);
    slots.pop(); // the wildcard marker

    let mut spliced: Vec<Column> = vec![];
    for source in ctx.sources {
        for el in source.elements().iter() {
            if el.is_virtual || el.mirrors_foreign_key() {
                continue;
            }
            if let Some(assoc) = el.as_assoc() {
                if !assoc.is_managed() {
                    continue;
                }
            }
            if excluding.contains(el.name.as_str()) || before.contains(&el.name) {
                continue;
            }
            let contributors = &ctx.combined[&el.name];
            if contributors.len() > 1 {
                return Err(InferenceError::AmbiguousWildcard {
                    name: el.name.clone(),
                    candidates: contributors
                        .iter()
                        .map(|&i| format!("{}.{}", ctx.sources[i].alias, el.name))
                        .collect(),
                });
            }
            // A column listed after the wildcard replaces the entry in place.
            if let Some(pos) = after
                .iter()
                .position(|c| suppression_name(c).as_deref() == Some(&el.name))
            {
                spliced.push(after.remove(pos));
                continue;
            }
            let mut col = Column::ref_(&[source.alias.as_str(), el.name.as_str()]);
            {
                let r = col.ref_mut().unwrap();
                resolve_ref_deep(r, ctx, &RefContext::plain(), Some(&mut *join_tree))?;
            }
            spliced.push(col);
        }
    }

    slots.extend(spliced);
    slots.extend(after);
    Ok(slots)
}

/// Element-level name a column supplies, for wildcard suppression and
/// replacement. References count by their flat path, not their alias.
fn suppression_name(col: &Column) -> Option<String> {
    match &col.expr {
        ColumnExpr::Ref(r) => {
            let resolved = r.resolved.as_ref()?;
            if resolved.pseudo || resolved.self_ref {
                return None;
            }
            let (_, start) = resolved.flat_root();
            Some(resolver::flat_segments(&resolved.links, &r.steps, start))
        }
        _ => col.alias.clone(),
    }
}

/// Default output element name of an expanded column.
pub(crate) fn default_column_name(col: &Column) -> Option<String> {
    if let Some(alias) = &col.alias {
        return Some(alias.clone());
    }
    match &col.expr {
        ColumnExpr::Ref(r) => {
            let resolved = r.resolved.as_ref()?;
            if resolved.pseudo || resolved.self_ref {
                return Some(r.steps.last().unwrap().name.clone());
            }
            let (_, start) = resolved.flat_root();
            Some(resolver::flat_segments(&resolved.links, &r.steps, start))
        }
        ColumnExpr::Func(f) => Some(f.func.clone()),
        _ => None,
    }
}

/// Turn an `inline` (or an expand over a structured element) into sibling
/// columns with the parent's flat name as prefix.
fn synthesize_nested(
    col: &Column,
    leaf: &Arc<ElementDef>,
    model: &Model,
) -> Result<Vec<Column>, InferenceError> {
    let r = col.as_ref_expr().unwrap();
    let resolved = r.resolved.as_ref().unwrap();
    let (_, start) = resolved.flat_root();
    let parent_flat = resolver::flat_segments(&resolved.links, &r.steps, start);
    let prefix = col.alias.clone().unwrap_or(parent_flat);

    let body = col
        .expand
        .as_ref()
        .or(col.inline.as_ref())
        .expect("nested projection has a body");

    let children_elements = match leaf.sub_elements() {
        Some(els) => Some(els),
        None => leaf
            .as_assoc()
            .and_then(|a| model.get(&a.target))
            .map(|t| &t.elements),
    };

    let mut out = vec![];
    for child in body {
        match &child.expr {
            ColumnExpr::Star => {
                let Some(els) = children_elements else {
                    return Err(InferenceError::ExpandOnScalar(r.dotted()));
                };
                let excluding: HashSet<&str> =
                    child.excluding.iter().map(String::as_str).collect();
                for el in els.iter() {
                    if el.is_virtual || el.mirrors_foreign_key() || excluding.contains(el.name.as_str())
                    {
                        continue;
                    }
                    if let Some(assoc) = el.as_assoc() {
                        if !assoc.is_managed() {
                            continue;
                        }
                    }
                    let mut steps = r.steps.clone();
                    steps.push(Step::plain(&el.name));
                    let mut synth = Column::ref_steps(steps);
                    synth.alias = Some(format!("{prefix}_{}", el.name));
                    out.push(synth);
                }
            }
            ColumnExpr::Ref(child_ref) => {
                let mut steps = r.steps.clone();
                steps.extend(child_ref.steps.iter().cloned());
                let mut synth = Column::ref_steps(steps);
                synth.alias = Some(format!(
                    "{prefix}_{}",
                    child
                        .alias
                        .clone()
                        .unwrap_or_else(|| child_ref.names().join("_"))
                ));
                synth.cast = child.cast.clone();
                synth.key = child.key;
                synth.expand = child.expand.clone();
                synth.inline = child.inline.clone();
                synth.excluding = child.excluding.clone();
                synth.order_by = child.order_by.clone();
                synth.limit = child.limit.clone();
                synth.annotations = child.annotations.clone();
                out.push(synth);
            }
            _ => {
                let alias = child.alias.clone().ok_or_else(|| {
                    InferenceError::ExpectingAlias(format!(
                        "the computed column inside '{}'",
                        r.dotted()
                    ))
                })?;
                let mut synth = child.clone();
                synth.alias = Some(format!("{prefix}_{alias}"));
                out.push(synth);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Token streams
// ---------------------------------------------------------------------------

/// Resolve every reference in a predicate token stream. `tree` is present
/// when join-relevant navigations in this stream materialize as joins.
pub(crate) fn resolve_token_stream(
    tokens: &mut [Token],
    ctx: &ResolveCtx<'_>,
    rctx: &RefContext,
    mut tree: Option<&mut JoinTree>,
) -> Result<(), InferenceError> {
    let mut i = 0;
    while i < tokens.len() {
        let is_exists = tokens[i].is_kw("exists") || tokens[i].is_kw("not exists");
        if is_exists && i + 1 < tokens.len() {
            if let Token::Ref(r) = &mut tokens[i + 1] {
                let ectx = RefContext {
                    base: rctx.base.clone(),
                    in_exists: true,
                    in_expand: rctx.in_expand,
                    in_filter: rctx.in_filter,
                    terminal_filter_ok: true,
                };
                resolve_ref_deep(r, ctx, &ectx, None)?;
                let resolved = r.resolved.as_ref().unwrap();
                for link in resolved
                    .links
                    .iter()
                    .skip(if resolved.first_step_is_source { 1 } else { 0 })
                {
                    if link.def.as_assoc().is_none() {
                        return Err(InferenceError::ExistsRequiresAssociation(r.dotted()));
                    }
                }
                i += 2;
                continue;
            }
        }
        match &mut tokens[i] {
            Token::Ref(r) => {
                resolve_ref_deep(r, ctx, rctx, tree.as_mut().map(|t| &mut **t))?;
            }
            Token::Func(f) => {
                resolve_token_stream(&mut f.args, ctx, rctx, tree.as_mut().map(|t| &mut **t))?;
            }
            Token::Xpr { xpr } => {
                resolve_token_stream(xpr, ctx, rctx, tree.as_mut().map(|t| &mut **t))?;
            }
            Token::List { list } => {
                resolve_token_stream(list, ctx, rctx, tree.as_mut().map(|t| &mut **t))?;
            }
            // Subqueries are inferred when the rewriter recurses into them.
            Token::Select { .. } => {}
            Token::Kw(_) | Token::Val { .. } | Token::Param { .. } => {}
        }
        i += 1;
    }
    Ok(())
}

/// Resolve one reference plus its step filters, and merge join-relevant
/// prefixes into the join tree.
pub(crate) fn resolve_ref_deep(
    r: &mut crate::cqn::RefExpr,
    ctx: &ResolveCtx<'_>,
    rctx: &RefContext,
    tree: Option<&mut JoinTree>,
) -> Result<(), InferenceError> {
    resolver::resolve_ref(r, ctx, rctx)?;
    let resolved_snapshot = r.resolved.clone().unwrap();
    if resolved_snapshot.pseudo || resolved_snapshot.self_ref {
        return Ok(());
    }

    for (i, step) in r.steps.iter_mut().enumerate() {
        let Some(filter) = &mut step.filter else {
            continue;
        };
        let link = &resolved_snapshot.links[i];
        let base_def = match (&link.target, &link.def) {
            (Some(t), _) => Arc::clone(t),
            (None, LinkDef::Entity(def)) => Arc::clone(def),
            _ => continue,
        };
        let frctx = RefContext {
            base: Some(BaseLink {
                def: base_def,
                assoc: link.def.as_element().cloned(),
            }),
            in_exists: rctx.in_exists,
            in_expand: rctx.in_expand,
            in_filter: true,
            terminal_filter_ok: false,
        };
        resolve_token_stream(filter, ctx, &frctx, None)?;
    }

    if let (Some(tree), Some(cut)) = (tree, resolved_snapshot.join_cut) {
        let crate::cqn::RefExpr { steps, resolved } = r;
        let resolved = resolved.as_mut().unwrap();
        let source_alias = resolved.links[0].alias.clone();
        tree.merge(&source_alias, steps, &mut resolved.links, cut);
    }
    Ok(())
}

/// Order-by references resolve against the sources first, then fall back to
/// output element names (column aliases).
fn resolve_order_by_token(
    token: &mut Token,
    ctx: &ResolveCtx<'_>,
    expanded_columns: &[Column],
    join_tree: &mut JoinTree,
) -> Result<(), InferenceError> {
    let Token::Ref(r) = token else {
        return resolve_token_stream(
            std::slice::from_mut(token),
            ctx,
            &RefContext::plain(),
            Some(join_tree),
        );
    };

    match resolve_ref_deep(r, ctx, &RefContext::plain(), Some(join_tree)) {
        Ok(()) => Ok(()),
        Err(InferenceError::UnknownName(_)) if r.steps.len() == 1 => {
            let name = r.steps[0].name.clone();
            if let Some(col) = expanded_columns
                .iter()
                .find(|c| default_column_name(c).as_deref() == Some(name.as_str()))
            {
                if let ColumnExpr::Ref(backing) = &col.expr {
                    *r = backing.clone();
                    return Ok(());
                }
            }
            if ctx.self_names.contains(&name) {
                r.steps = vec![Step::plain("$self"), Step::plain(&name)];
                return resolver::resolve_ref(r, ctx, &RefContext::plain());
            }
            Err(InferenceError::UnknownName(name))
        }
        Err(e) => Err(e),
    }
}

fn dotted(steps: &[Step], upto: usize) -> String {
    steps
        .iter()
        .take(upto)
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

fn short_name(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

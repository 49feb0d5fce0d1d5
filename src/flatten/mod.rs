//! Rewriting phase and entry point
//!
//! Clones the inferred query and rebuilds every clause into the flat,
//! SQL-shaped form: single-step sources, flat `{alias, column}` references,
//! correlated subqueries for expansions and exists predicates, left joins for
//! the join tree. Non-SELECT kinds share the from/where rewrites only.

use crate::cqn::{
    Column, Delete, From, FromRef, Insert, Literal, Query, Select, Step, Stream, Token, Update,
};
use crate::inference::resolver::scalar_leaves;
use crate::inference::{self, AliasAllocator, Inferred, RefContext, ResolveCtx, Scope};
use crate::model::{Definition, Model};

mod column_builder;
mod errors;
mod expand_builder;
mod from_builder;
mod join_builder;
mod on_condition;
mod predicate_builder;

pub use errors::RewriteError;

use column_builder::rewrite_columns;
use from_builder::rewrite_from;
use join_builder::materialize_joins;
use predicate_builder::{lower_search, rewrite_group_by, rewrite_order_by, rewrite_tokens};

/// Computes the columns a `search` predicate applies to.
pub trait SearchProvider {
    fn searchable_columns(
        &self,
        model: &Model,
        entity: &Definition,
        alias: &str,
    ) -> Vec<crate::cqn::RefExpr>;
}

/// Default provider: elements annotated `@Search.defaultSearchElement` when
/// any are present, all string-typed scalar leaves otherwise.
pub struct DefaultSearch;

static DEFAULT_SEARCH: DefaultSearch = DefaultSearch;

impl SearchProvider for DefaultSearch {
    fn searchable_columns(
        &self,
        model: &Model,
        entity: &Definition,
        alias: &str,
    ) -> Vec<crate::cqn::RefExpr> {
        let mut annotated = vec![];
        let mut strings = vec![];
        for el in entity.elements.iter() {
            if el.is_virtual || el.is_association() {
                continue;
            }
            let flagged = el
                .annotation("@Search.defaultSearchElement")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            for (suffix, leaf) in scalar_leaves(el, model) {
                let flat = if suffix.is_empty() {
                    el.name.clone()
                } else {
                    format!("{}_{suffix}", el.name)
                };
                let is_string = leaf
                    .type_name()
                    .map(|t| t.contains("String"))
                    .unwrap_or(false);
                if flagged {
                    annotated.push(crate::cqn::RefExpr::flat(alias, &flat));
                } else if is_string {
                    strings.push(crate::cqn::RefExpr::flat(alias, &flat));
                }
            }
        }
        if annotated.is_empty() {
            strings
        } else {
            annotated
        }
    }
}

/// Collaborator seams of the rewriter.
#[derive(Default)]
pub struct RewriteOptions {
    search: Option<Box<dyn SearchProvider + Send + Sync>>,
}

impl RewriteOptions {
    pub fn with_search_provider(
        mut self,
        provider: Box<dyn SearchProvider + Send + Sync>,
    ) -> Self {
        self.search = Some(provider);
        self
    }

    fn search_provider(&self) -> &(dyn SearchProvider + Send + Sync) {
        self.search.as_deref().unwrap_or(&DEFAULT_SEARCH)
    }
}

/// Shared state of one SELECT rewrite.
pub(crate) struct Rw<'a> {
    pub model: &'a Model,
    pub opts: &'a RewriteOptions,
    pub inferred: &'a Inferred,
    /// Alias scope of this query; `scope.parent` is the outer chain.
    pub scope: &'a Scope<'a>,
    pub outer: Option<&'a Scope<'a>>,
    pub aliases: &'a mut AliasAllocator,
    pub localized: bool,
}

/// Normalize a query against the model. Deterministic for a fixed input;
/// the result carries the inference by-products on each SELECT node.
pub fn rewrite(query: Query, model: &Model) -> Result<Query, RewriteError> {
    rewrite_with(query, model, &RewriteOptions::default())
}

pub fn rewrite_with(
    query: Query,
    model: &Model,
    opts: &RewriteOptions,
) -> Result<Query, RewriteError> {
    match query {
        Query::Set(_) => Err(RewriteError::UnionNotSupported),
        Query::Select(select) => Ok(Query::Select(Box::new(rewrite_select(
            *select, model, opts, None,
        )?))),
        Query::Insert(insert) => Ok(Query::Insert(normalize_insert(insert, model)?)),
        Query::Upsert(upsert) => Ok(Query::Upsert(normalize_insert(upsert, model)?)),
        Query::Update(update) => Ok(Query::Update(rewrite_update(update, model, opts)?)),
        Query::Delete(delete) => Ok(Query::Delete(rewrite_delete(delete, model, opts)?)),
        Query::Stream(stream) => Ok(Query::Stream(rewrite_stream(stream, model, opts)?)),
    }
}

pub(crate) fn rewrite_select(
    mut select: Select,
    model: &Model,
    opts: &RewriteOptions,
    outer: Option<&Scope<'_>>,
) -> Result<Select, RewriteError> {
    inference::infer(&mut select, model, outer)?;
    let inferred = select.inferred.clone().expect("inference ran");

    // A plain join without any inferred navigation is already SQL-shaped.
    if matches!(select.from, From::Join(_)) && inferred.join_tree.is_initial() {
        return Ok(select);
    }

    let mut aliases = inferred.join_tree.aliases.clone();
    let scope = Scope {
        sources: &inferred.sources,
        parent: outer,
    };
    let mut cx = Rw {
        model,
        opts,
        inferred: &inferred,
        scope: &scope,
        outer,
        aliases: &mut aliases,
        localized: select.localized,
    };

    let user_where = match &select.where_ {
        Some(tokens) => Some(rewrite_tokens(tokens, &mut cx)?),
        None => None,
    };
    let from_rewrite = rewrite_from(&select.from, &mut cx)?;
    let columns = rewrite_columns(&mut cx)?;
    let group_by = match &select.group_by {
        Some(tokens) => Some(rewrite_group_by(tokens, &mut cx)?),
        None => None,
    };
    let having = match &select.having {
        Some(tokens) => Some(rewrite_tokens(tokens, &mut cx)?),
        None => None,
    };
    let order_by = match &select.order_by {
        Some(items) => Some(rewrite_order_by(items, &mut cx)?),
        None => None,
    };
    let search_predicate = match &select.search {
        Some(tokens) => lower_search(tokens, &mut cx)?,
        None => None,
    };

    let mut where_parts = from_rewrite.where_parts;
    if let Some(w) = user_where {
        where_parts.push(w);
    }
    if let Some(s) = search_predicate {
        where_parts.push(s);
    }
    let where_ = and_join(where_parts);

    let from = materialize_joins(from_rewrite.from, &mut cx)?;

    Ok(Select {
        from,
        columns: Some(columns),
        where_,
        group_by,
        having,
        order_by,
        limit: select.limit.clone(),
        search: None,
        excluding: None,
        distinct: select.distinct,
        one: select.one,
        localized: select.localized,
        expand: select.expand,
        inferred: Some(inferred),
    })
}

// ---------------------------------------------------------------------------
// DML
// ---------------------------------------------------------------------------

/// `INSERT.into`/`UPSERT.into` normalize to a single-step reference to the
/// (path-resolved) target, preserving an explicit alias.
fn normalize_insert(mut insert: Insert, model: &Model) -> Result<Insert, RewriteError> {
    let target = resolve_target_name(&insert.into, model)?;
    insert.into = FromRef {
        steps: vec![Step::plain(&target)],
        alias: insert.into.alias.clone(),
        resolved: None,
    };
    Ok(insert)
}

fn resolve_target_name(fr: &FromRef, model: &Model) -> Result<String, RewriteError> {
    if fr.steps.is_empty() {
        return Err(RewriteError::Inference(
            inference::InferenceError::UnknownName(String::new()),
        ));
    }
    let mut current = model
        .lookup(&fr.steps[0].name)
        .map_err(inference::InferenceError::from)?
        .clone();
    for step in &fr.steps[1..] {
        let el = current.elements.get(&step.name).cloned().ok_or_else(|| {
            inference::InferenceError::UnknownName(format!(
                "{}.{}",
                current.name, step.name
            ))
        })?;
        let Some(assoc) = el.as_assoc() else {
            return Err(RewriteError::Inference(
                inference::InferenceError::NonAssocInFromPath {
                    step: step.name.clone(),
                    path: fr
                        .steps
                        .iter()
                        .map(|s| s.name.as_str())
                        .collect::<Vec<_>>()
                        .join("."),
                },
            ));
        };
        current = model
            .target(assoc)
            .map_err(inference::InferenceError::from)?
            .clone();
    }
    Ok(current.name.clone())
}

/// UPDATE shares the from and where rewrites; each `with` value is
/// token-stream-rewritten.
fn rewrite_update(
    mut update: Update,
    model: &Model,
    opts: &RewriteOptions,
) -> Result<Update, RewriteError> {
    let probe = dml_probe(&update.entity, update.where_.clone());
    let rewritten = rewrite_select(probe, model, opts, None)?;
    let inferred = rewritten.inferred.clone().expect("probe was inferred");

    let From::Ref(entity) = rewritten.from else {
        return Err(RewriteError::JoinInDml);
    };

    // Values resolve against the update target.
    let combined = inference::combined_elements(&inferred.sources);
    let self_names = Default::default();
    let ctx = ResolveCtx {
        model,
        localized: false,
        sources: &inferred.sources,
        combined: &combined,
        outer: None,
        self_names: &self_names,
    };
    let mut with = Vec::with_capacity(update.with.len());
    for (name, value) in &update.with {
        let mut token = value.clone();
        inference::resolve_token_stream(
            std::slice::from_mut(&mut token),
            &ctx,
            &RefContext::plain(),
            None,
        )?;
        let mut aliases = inferred.join_tree.aliases.clone();
        let scope = Scope {
            sources: &inferred.sources,
            parent: None,
        };
        let mut cx = Rw {
            model,
            opts,
            inferred: &inferred,
            scope: &scope,
            outer: None,
            aliases: &mut aliases,
            localized: false,
        };
        let rewritten_value = rewrite_tokens(std::slice::from_ref(&token), &mut cx)?
            .into_iter()
            .next()
            .expect("one token in, one token out");
        with.push((name.clone(), rewritten_value));
    }

    update.entity = entity;
    update.where_ = rewritten.where_;
    update.with = with;
    Ok(update)
}

fn rewrite_delete(
    mut delete: Delete,
    model: &Model,
    opts: &RewriteOptions,
) -> Result<Delete, RewriteError> {
    let probe = dml_probe(&delete.from, delete.where_.clone());
    let rewritten = rewrite_select(probe, model, opts, None)?;
    let From::Ref(from) = rewritten.from else {
        return Err(RewriteError::JoinInDml);
    };
    delete.from = from;
    delete.where_ = rewritten.where_;
    Ok(delete)
}

/// STREAM is vestigial; it threads through the shared rewrites unchanged
/// beyond from/where normalization.
fn rewrite_stream(
    mut stream: Stream,
    model: &Model,
    opts: &RewriteOptions,
) -> Result<Stream, RewriteError> {
    let probe = dml_probe(&stream.from, stream.where_.clone());
    let rewritten = rewrite_select(probe, model, opts, None)?;
    let From::Ref(from) = rewritten.from else {
        return Err(RewriteError::JoinInDml);
    };
    stream.from = from;
    stream.where_ = rewritten.where_;
    Ok(stream)
}

/// Minimal SELECT driving the shared from/where rewrites for DML kinds.
fn dml_probe(target: &FromRef, where_: Option<Vec<Token>>) -> Select {
    let mut probe_col = Column::val(Literal::Integer(1));
    probe_col.alias = Some("one".to_string());
    Select {
        from: From::Ref(target.clone()),
        columns: Some(vec![probe_col]),
        where_,
        ..Select::default()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// AND-compose predicate parts, parenthesizing any part with a top-level OR.
pub(crate) fn and_join(parts: Vec<Vec<Token>>) -> Option<Vec<Token>> {
    let parts: Vec<Vec<Token>> = parts.into_iter().filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return None;
    }
    let mut out: Vec<Token> = vec![];
    for part in parts {
        if !out.is_empty() {
            out.push(Token::kw("and"));
        }
        if part.iter().any(|t| t.is_kw("or")) {
            out.push(Token::xpr(part));
        } else {
            out.extend(part);
        }
    }
    Some(out)
}

pub(crate) fn short_name(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

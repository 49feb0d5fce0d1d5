//! Expansion subqueries
//!
//! Turns an `expand` over an association into a correlated subquery: the
//! expansion body becomes an inner SELECT from the association target, run
//! through the full pipeline, and the inner where clause is AND-extended with
//! the correlation back to the enclosing query's table alias. Multi-step
//! expand paths chain the intermediate hops as nested EXISTS levels, exactly
//! like a reverse from-path expansion rooted at the outer row.

use crate::cqn::{Column, ColumnExpr, From, FromRef, Literal, Select, Step, Token};

use super::errors::RewriteError;
use super::on_condition::traversal_condition;
use super::predicate_builder::rewrite_tokens_with_base;
use super::{and_join, Rw};

/// Rewrite one expand column. Returns None when the target entity is not
/// persisted (the expansion is recorded in the inferred elements as skipped).
pub(crate) fn expand_column(col: &Column, cx: &mut Rw) -> Result<Option<Column>, RewriteError> {
    let r = col.as_ref_expr().expect("expand sits on a reference");
    let resolved = r
        .resolved
        .as_ref()
        .expect("expand reference resolved during inference");

    let target = resolved
        .leaf()
        .target
        .as_ref()
        .expect("expand leaf is an association")
        .clone();
    let leaf_el = resolved
        .leaf_element()
        .expect("expand leaf is an element")
        .clone();
    let assoc = leaf_el.as_assoc().expect("expand leaf is an association");

    if target.persistence_skip {
        log::debug!(
            "expand '{}' over non-persisted '{}' omitted",
            r.dotted(),
            target.name
        );
        return Ok(None);
    }

    let fresh = cx.aliases.add_alias(&r.steps.last().unwrap().name);

    // Inner query: from the target, with the leaf step's infix filter; the
    // body is normalized by recursing through the entry point.
    let inner = Select {
        from: From::Ref(FromRef {
            steps: vec![Step {
                name: target.name.clone(),
                filter: r.steps.last().unwrap().filter.clone(),
            }],
            alias: Some(fresh.clone()),
            resolved: None,
        }),
        columns: col.expand.clone(),
        order_by: col.order_by.clone(),
        limit: col.limit.clone(),
        expand: true,
        one: assoc.is_to_one(),
        localized: cx.localized,
        ..Select::default()
    };
    let mut inner = super::rewrite_select(inner, cx.model, cx.opts, Some(cx.scope))?;

    // Correlation back to the outer row.
    let start = if resolved.first_step_is_source { 1 } else { 0 };
    let assoc_idx: Vec<usize> = (start..r.steps.len())
        .filter(|&i| resolved.links[i].def.as_assoc().is_some())
        .collect();
    let origin = resolved.links[0].alias.clone();
    let last = *assoc_idx.last().expect("expand path has an association");

    let correlation: Vec<Token> = if assoc_idx.len() == 1 {
        traversal_condition(&leaf_el, &origin, &fresh, cx.model)?
    } else {
        // Chain the intermediate hops; the innermost level correlates to the
        // outer row, the outermost to the expansion alias.
        let middles = &assoc_idx[..assoc_idx.len() - 1];
        let middle_aliases: Vec<String> = middles
            .iter()
            .map(|&i| cx.aliases.add_alias(&r.steps[i].name))
            .collect();

        let mut level: Option<Select> = None;
        for (k, &i) in middles.iter().enumerate() {
            let up_assoc_idx = assoc_idx[k + 1];
            let up_el = resolved.links[up_assoc_idx]
                .def
                .as_element()
                .expect("expand path steps are associations");
            let up_alias = if up_assoc_idx == last {
                fresh.as_str()
            } else {
                middle_aliases[k + 1].as_str()
            };
            let mut parts = vec![traversal_condition(
                up_el,
                &middle_aliases[k],
                up_alias,
                cx.model,
            )?];
            if k == 0 {
                let first_el = resolved.links[i]
                    .def
                    .as_element()
                    .expect("expand path steps are associations");
                parts.push(traversal_condition(
                    first_el,
                    &origin,
                    &middle_aliases[0],
                    cx.model,
                )?);
            }
            if let Some(filter) = &r.steps[i].filter {
                parts.push(rewrite_tokens_with_base(
                    filter,
                    Some(&middle_aliases[k]),
                    cx,
                )?);
            }
            if let Some(sub) = level.take() {
                parts.push(vec![Token::kw("exists"), Token::select(sub)]);
            }
            let entity = resolved.links[i]
                .target
                .as_ref()
                .expect("association step carries a target")
                .name
                .clone();
            level = Some(Select {
                from: From::Ref(FromRef {
                    steps: vec![Step::plain(&entity)],
                    alias: Some(middle_aliases[k].clone()),
                    resolved: None,
                }),
                columns: Some(vec![Column::val(Literal::Integer(1))]),
                where_: and_join(parts),
                ..Select::default()
            });
        }
        // Levels were built from the outer row inward; the deepest hop sits
        // directly in the inner where.
        vec![
            Token::kw("exists"),
            Token::select(level.expect("multi-step path yields a chain")),
        ]
    };

    inner.where_ = and_join(
        [inner.where_.clone().unwrap_or_default(), correlation]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect(),
    );

    let alias = col
        .alias
        .clone()
        .or_else(|| crate::inference::default_column_name(col));
    let mut out = Column::ref_(&[]);
    out.expr = ColumnExpr::Select(Box::new(inner));
    out.alias = alias;
    out.key = col.key;
    out.annotations = col.annotations.clone();
    Ok(Some(out))
}

//! Column rewriting
//!
//! Produces the flat output columns from the inferred (wildcard- and
//! inline-expanded) column list: structured references become one flat column
//! per scalar leaf, foreign-key-only association references become their
//! foreign key columns, expansions over associations become correlated
//! subqueries, virtual elements are dropped.

use crate::cqn::{Column, ColumnExpr, Token};
use crate::inference::resolver::{fk_leaves, scalar_leaves};

use super::errors::RewriteError;
use super::expand_builder::expand_column;
use super::predicate_builder::{flatten_scalar_ref, rewrite_tokens};
use super::Rw;

pub(crate) fn rewrite_columns(cx: &mut Rw) -> Result<Vec<Column>, RewriteError> {
    let columns = cx.inferred.expanded_columns.clone();
    let mut out: Vec<Column> = vec![];

    for col in &columns {
        match &col.expr {
            ColumnExpr::Star => {
                // Wildcards were expanded during inference.
            }
            ColumnExpr::Ref(r) => {
                let resolved = r
                    .resolved
                    .as_ref()
                    .expect("column reference resolved during inference");

                if resolved.pseudo {
                    out.push(plain(col, col.expr.clone()));
                    continue;
                }
                if resolved.self_ref {
                    let token =
                        super::predicate_builder::rewrite_tokens(&[Token::Ref(r.clone())], cx)?
                            .remove(0);
                    out.push(plain(col, token_to_expr(token)));
                    continue;
                }
                if col.expand.is_some() {
                    if let Some(subquery) = expand_column(col, cx)? {
                        out.push(subquery);
                    }
                    continue;
                }

                let leaf = resolved
                    .leaf_element()
                    .cloned()
                    .expect("whole-source selections are rejected during inference");
                if leaf.is_virtual {
                    continue;
                }
                if leaf.is_structured() {
                    let flat = flatten_scalar_ref_base(r);
                    for (suffix, _) in scalar_leaves(&leaf, cx.model) {
                        out.push(leaf_column(col, &flat, &suffix));
                    }
                    continue;
                }
                if let Some(assoc) = leaf.as_assoc() {
                    // Unmanaged associations were rejected during inference.
                    let flat = flatten_scalar_ref_base(r);
                    for (suffix, _) in fk_leaves(assoc, cx.model) {
                        out.push(leaf_column(col, &flat, &suffix));
                    }
                    continue;
                }
                let mut rewritten = plain(col, ColumnExpr::Ref(flatten_scalar_ref(r, None)));
                rewritten.alias = col.alias.clone();
                out.push(rewritten);
            }
            ColumnExpr::Val(_) | ColumnExpr::Param(_) => out.push(col.clone()),
            ColumnExpr::Func(f) => {
                let args = rewrite_tokens(&f.args, cx)?;
                out.push(plain(
                    col,
                    ColumnExpr::Func(crate::cqn::FuncCall {
                        func: f.func.clone(),
                        args,
                    }),
                ));
            }
            ColumnExpr::Xpr(tokens) => {
                let rewritten = rewrite_tokens(tokens, cx)?;
                out.push(plain(col, ColumnExpr::Xpr(rewritten)));
            }
            ColumnExpr::Select(sub) => {
                let inner = super::rewrite_select(
                    (**sub).clone(),
                    cx.model,
                    cx.opts,
                    Some(cx.scope),
                )?;
                out.push(plain(col, ColumnExpr::Select(Box::new(inner))));
            }
        }
    }

    if out.is_empty() {
        return Err(RewriteError::EmptyProjection);
    }
    Ok(out)
}

/// `(alias, flat base)` of a reference that flattens to several leaves.
fn flatten_scalar_ref_base(r: &crate::cqn::RefExpr) -> (String, String) {
    let resolved = r.resolved.as_ref().unwrap();
    let (alias, start) = resolved.flat_root();
    let flat = crate::inference::resolver::flat_segments(&resolved.links, &r.steps, start);
    (alias, flat)
}

fn leaf_column(col: &Column, (alias, base): &(String, String), suffix: &str) -> Column {
    let flat = if suffix.is_empty() {
        base.clone()
    } else {
        format!("{base}_{suffix}")
    };
    let mut out = Column::ref_(&[alias.as_str(), flat.as_str()]);
    // An explicit rename applies per leaf: `as_<leafTail>`.
    out.alias = col.alias.as_ref().map(|a| {
        if suffix.is_empty() {
            a.clone()
        } else {
            format!("{a}_{suffix}")
        }
    });
    out.key = col.key;
    out.annotations = col.annotations.clone();
    out
}

/// Carry alias, cast, key and annotations over to a rewritten column.
fn plain(col: &Column, expr: ColumnExpr) -> Column {
    let mut out = Column::ref_(&[]);
    out.expr = expr;
    out.alias = col.alias.clone();
    out.cast = col.cast.clone();
    out.key = col.key;
    out.annotations = col.annotations.clone();
    out
}

fn token_to_expr(token: Token) -> ColumnExpr {
    match token {
        Token::Ref(r) => ColumnExpr::Ref(r),
        Token::Val { val } => ColumnExpr::Val(val),
        Token::Param { param } => ColumnExpr::Param(param),
        Token::Func(f) => ColumnExpr::Func(f),
        Token::Xpr { xpr } => ColumnExpr::Xpr(xpr),
        Token::Select { select } => ColumnExpr::Select(select),
        Token::List { list } => ColumnExpr::Xpr(list),
        Token::Kw(k) => ColumnExpr::Xpr(vec![Token::Kw(k)]),
    }
}

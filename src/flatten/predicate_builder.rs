//! Predicate rewriting
//!
//! Walks where/having/on/search token streams and order-by/group-by lists:
//! references become `{alias, flat column}` pairs, `exists <assoc>` becomes a
//! correlated `EXISTS (SELECT 1 …)`, empty IN lists normalize to null
//! comparisons, and structural comparisons expand into per-leaf conjunctions.

use std::sync::Arc;

use crate::cqn::{ColumnExpr, Literal, OrderByItem, RefExpr, Token};
use crate::inference::resolver::{fk_leaves, flat_segments, scalar_leaves};
use crate::model::ElementDef;

use super::errors::RewriteError;
use super::from_builder::exists_subquery_for_path;
use super::Rw;

pub(crate) fn rewrite_tokens(tokens: &[Token], cx: &mut Rw) -> Result<Vec<Token>, RewriteError> {
    rewrite_tokens_with_base(tokens, None, cx)
}

/// `base_alias` is the table alias base-rooted references (infix filters)
/// resolve their first step against.
pub(crate) fn rewrite_tokens_with_base(
    tokens: &[Token],
    base_alias: Option<&str>,
    cx: &mut Rw,
) -> Result<Vec<Token>, RewriteError> {
    let mut out: Vec<Token> = vec![];
    let mut i = 0;
    while i < tokens.len() {
        // Empty IN lists behave differently across databases; normalize.
        if tokens[i].is_kw("in") || tokens[i].is_kw("not in") {
            if let Some(Token::List { list }) = tokens.get(i + 1) {
                if list.is_empty() {
                    let mut negated = tokens[i].is_kw("not in");
                    if matches!(out.last(), Some(t) if t.is_kw("not")) {
                        // `field not in ()`
                        out.pop();
                        negated = !negated;
                    } else if out.len() >= 2 && out[out.len() - 2].is_kw("not") {
                        // `not field in ()`
                        out.remove(out.len() - 2);
                        negated = !negated;
                    }
                    if negated {
                        out.push(Token::kw("is not null"));
                    } else {
                        out.push(Token::kw("="));
                        out.push(Token::null());
                    }
                    i += 2;
                    continue;
                }
            }
        }

        // `exists <association path>` → correlated subquery.
        if tokens[i].is_kw("exists") || tokens[i].is_kw("not exists") {
            if let Some(Token::Ref(r)) = tokens.get(i + 1) {
                let origin = exists_origin(r, base_alias);
                let sub = exists_subquery_for_path(r, &origin, cx)?;
                out.push(tokens[i].clone());
                out.push(Token::select(sub));
                i += 2;
                continue;
            }
        }

        // `<struct> is [not] null` with the single-keyword form.
        if structured_operand(&tokens[i]).is_some() {
            if let Some(next) = tokens.get(i + 1) {
                if next.is_kw("is null") || next.is_kw("is not null") {
                    let op = if next.is_kw("is null") { "is" } else { "is not" };
                    let expansion =
                        expand_structural(&tokens[i], op, &Token::null(), base_alias, cx)?;
                    out.push(Token::xpr(expansion));
                    i += 2;
                    continue;
                }
            }
        }

        // Structural comparison: either operand structured (or a managed
        // association) expands both sides into matched leaf sequences.
        if let (Some(op), Some(rhs)) = (comparison_op(tokens.get(i + 1)), tokens.get(i + 2)) {
            let lhs_struct = structured_operand(&tokens[i]);
            let rhs_struct = structured_operand(rhs);
            if lhs_struct.is_some() || rhs_struct.is_some() {
                let expansion =
                    expand_structural(&tokens[i], &op, rhs, base_alias, cx)?;
                out.push(Token::xpr(expansion));
                i += 3;
                continue;
            }
        }

        out.push(rewrite_single(&tokens[i], base_alias, cx)?);
        i += 1;
    }
    Ok(out)
}

fn rewrite_single(
    token: &Token,
    base_alias: Option<&str>,
    cx: &mut Rw,
) -> Result<Token, RewriteError> {
    match token {
        Token::Ref(r) => {
            let resolved = r.resolved.as_ref().expect("reference resolved during inference");
            if resolved.pseudo {
                return Ok(token.clone());
            }
            if resolved.self_ref {
                return substitute_self(r, base_alias, cx);
            }
            if let Some(leaf) = resolved.leaf_element() {
                if leaf.is_structured() {
                    return Err(RewriteError::StructInExpression(r.dotted()));
                }
                if leaf.is_association() {
                    return Err(RewriteError::AssocInExpression(r.dotted()));
                }
            }
            Ok(Token::Ref(flatten_scalar_ref(r, base_alias)))
        }
        Token::Func(f) => {
            let args = rewrite_tokens_with_base(&f.args, base_alias, cx)?;
            Ok(Token::func(&f.func, args))
        }
        Token::Xpr { xpr } => {
            let inner = rewrite_tokens_with_base(xpr, base_alias, cx)?;
            Ok(Token::xpr(inner))
        }
        Token::List { list } => {
            let items = rewrite_tokens_with_base(list, base_alias, cx)?;
            Ok(Token::list(items))
        }
        Token::Select { select } => {
            let inner = super::rewrite_select(
                (**select).clone(),
                cx.model,
                cx.opts,
                Some(cx.scope),
            )?;
            Ok(Token::select(inner))
        }
        Token::Kw(_) | Token::Val { .. } | Token::Param { .. } => Ok(token.clone()),
    }
}

/// Flat `{alias, column}` form of a scalar reference.
pub(crate) fn flatten_scalar_ref(r: &RefExpr, base_alias: Option<&str>) -> RefExpr {
    let resolved = r.resolved.as_ref().expect("reference resolved during inference");
    if resolved.base_rooted {
        let alias = base_alias.expect("base-rooted reference rewritten with a base alias");
        return RefExpr::flat(alias, &flat_segments(&resolved.links, &r.steps, 0));
    }
    let (alias, start) = resolved.flat_root();
    RefExpr::flat(&alias, &flat_segments(&resolved.links, &r.steps, start))
}

/// Replace `$self.<name>` by the rewritten expression of the column it names.
fn substitute_self(
    r: &RefExpr,
    base_alias: Option<&str>,
    cx: &mut Rw,
) -> Result<Token, RewriteError> {
    let name = &r.steps.last().unwrap().name;
    let backing = cx
        .inferred
        .column_by_name(name)
        .cloned()
        .expect("$self target registered in the first pass");
    match &backing.expr {
        ColumnExpr::Val(v) => Ok(Token::val(v.clone())),
        ColumnExpr::Param(p) => Ok(Token::param(p)),
        ColumnExpr::Func(f) => {
            let args = rewrite_tokens_with_base(&f.args, base_alias, cx)?;
            Ok(Token::func(&f.func, args))
        }
        ColumnExpr::Xpr(tokens) => {
            let inner = rewrite_tokens_with_base(tokens, base_alias, cx)?;
            Ok(Token::xpr(inner))
        }
        ColumnExpr::Select(sub) => {
            let inner =
                super::rewrite_select((**sub).clone(), cx.model, cx.opts, Some(cx.scope))?;
            Ok(Token::select(inner))
        }
        ColumnExpr::Ref(_) | ColumnExpr::Star => {
            unreachable!("$self targets are plain columns by construction")
        }
    }
}

fn exists_origin(r: &RefExpr, base_alias: Option<&str>) -> String {
    let resolved = r.resolved.as_ref().expect("exists path resolved during inference");
    if resolved.base_rooted {
        return base_alias
            .expect("base-rooted exists rewritten with a base alias")
            .to_string();
    }
    resolved.links[0].alias.clone()
}

// ---------------------------------------------------------------------------
// Structural comparisons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Connective {
    And,
    Or,
}

fn comparison_op(token: Option<&Token>) -> Option<String> {
    match token {
        Some(Token::Kw(k)) => {
            let k = k.to_ascii_lowercase();
            match k.as_str() {
                "=" | "==" | "is" | "!=" | "<>" | "is not" | "<" | "<=" | ">" | ">=" | "in"
                | "not in" | "like" => Some(k),
                _ => None,
            }
        }
        _ => None,
    }
}

/// The structured leaf (structured element or managed association) behind an
/// operand, if any.
fn structured_operand(token: &Token) -> Option<&Arc<ElementDef>> {
    let Token::Ref(r) = token else { return None };
    let resolved = r.resolved.as_ref()?;
    if resolved.pseudo || resolved.self_ref {
        return None;
    }
    let leaf = resolved.leaf_element()?;
    if leaf.is_structured() || leaf.is_association() {
        Some(resolved.leaf_element().unwrap())
    } else {
        None
    }
}

/// Leaf suffix → flat column pairs of a structured operand.
fn operand_leaves(
    token: &Token,
    base_alias: Option<&str>,
    cx: &Rw,
) -> Result<(String, String, Vec<String>), RewriteError> {
    let Token::Ref(r) = token else {
        unreachable!("structured operands are references")
    };
    let resolved = r.resolved.as_ref().unwrap();
    let leaf = resolved.leaf_element().unwrap();

    let leaves: Vec<String> = if let Some(assoc) = leaf.as_assoc() {
        if !assoc.is_managed() {
            return Err(RewriteError::AssocInExpression(r.dotted()));
        }
        fk_leaves(assoc, cx.model)
            .into_iter()
            .map(|(suffix, _)| suffix)
            .collect()
    } else {
        scalar_leaves(leaf, cx.model)
            .into_iter()
            .map(|(suffix, _)| suffix)
            .collect()
    };

    let flat = flatten_scalar_like(r, base_alias);
    Ok((flat.0, flat.1, leaves))
}

/// Alias and flat base name of a reference, without the scalar-leaf check.
fn flatten_scalar_like(r: &RefExpr, base_alias: Option<&str>) -> (String, String) {
    let resolved = r.resolved.as_ref().unwrap();
    if resolved.base_rooted {
        let alias = base_alias
            .expect("base-rooted reference rewritten with a base alias")
            .to_string();
        return (alias, flat_segments(&resolved.links, &r.steps, 0));
    }
    let (alias, start) = resolved.flat_root();
    let flat = flat_segments(&resolved.links, &r.steps, start);
    (alias, flat)
}

fn expand_structural(
    lhs: &Token,
    op: &str,
    rhs: &Token,
    base_alias: Option<&str>,
    cx: &mut Rw,
) -> Result<Vec<Token>, RewriteError> {
    let (connective, negated) = match op {
        "=" | "==" | "is" => (Connective::And, false),
        "!=" | "<>" | "is not" => (Connective::Or, true),
        other => {
            let path = [lhs, rhs]
                .iter()
                .find_map(|t| t.as_ref_expr())
                .map(|r| r.dotted())
                .unwrap_or_default();
            return Err(RewriteError::UnsupportedStructuralComparison {
                op: other.to_string(),
                path,
            });
        }
    };

    let lhs_struct = structured_operand(lhs).is_some();
    let rhs_struct = structured_operand(rhs).is_some();

    match (lhs_struct, rhs_struct) {
        (true, true) => {
            let (l_alias, l_base, l_leaves) = operand_leaves(lhs, base_alias, cx)?;
            let (r_alias, r_base, r_leaves) = operand_leaves(rhs, base_alias, cx)?;
            let missing: Vec<String> = l_leaves
                .iter()
                .filter(|s| !r_leaves.contains(s))
                .chain(r_leaves.iter().filter(|s| !l_leaves.contains(s)))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(RewriteError::StructuralShapeMismatch {
                    left: lhs.as_ref_expr().unwrap().dotted(),
                    right: rhs.as_ref_expr().unwrap().dotted(),
                    unmatched: missing,
                });
            }
            let mut out = vec![];
            for suffix in &l_leaves {
                if !out.is_empty() {
                    out.push(Token::kw(connective_kw(connective)));
                }
                out.push(Token::Ref(RefExpr::flat(&l_alias, &join_flat(&l_base, suffix))));
                out.push(Token::kw(op));
                out.push(Token::Ref(RefExpr::flat(&r_alias, &join_flat(&r_base, suffix))));
            }
            Ok(out)
        }
        (true, false) | (false, true) => {
            let (struct_tok, other) = if lhs_struct { (lhs, rhs) } else { (rhs, lhs) };
            if !is_null_operand(other) {
                return Err(RewriteError::CannotCompareStructWithValue(
                    struct_tok.as_ref_expr().unwrap().dotted(),
                ));
            }
            let (alias, base, leaves) = operand_leaves(struct_tok, base_alias, cx)?;
            let null_kw = if negated { "is not null" } else { "is null" };
            let mut out = vec![];
            for suffix in &leaves {
                if !out.is_empty() {
                    out.push(Token::kw(connective_kw(connective)));
                }
                out.push(Token::Ref(RefExpr::flat(&alias, &join_flat(&base, suffix))));
                out.push(Token::kw(null_kw));
            }
            Ok(out)
        }
        (false, false) => unreachable!("one operand is structured"),
    }
}

fn connective_kw(c: Connective) -> &'static str {
    match c {
        Connective::And => "and",
        Connective::Or => "or",
    }
}

fn is_null_operand(token: &Token) -> bool {
    matches!(token, Token::Val { val: Literal::Null }) || token.is_kw("null")
}

fn join_flat(head: &str, tail: &str) -> String {
    if tail.is_empty() {
        head.to_string()
    } else {
        format!("{head}_{tail}")
    }
}

// ---------------------------------------------------------------------------
// ORDER BY / GROUP BY
// ---------------------------------------------------------------------------

pub(crate) fn rewrite_order_by(
    items: &[OrderByItem],
    cx: &mut Rw,
) -> Result<Vec<OrderByItem>, RewriteError> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let token = match &item.token {
            Token::Ref(r) => {
                let resolved = r.resolved.as_ref().expect("order-by reference resolved");
                if resolved.pseudo {
                    item.token.clone()
                } else if resolved.self_ref {
                    substitute_self(r, None, cx)?
                } else {
                    let leaf = resolved.leaf_element().cloned();
                    if let Some(l) = &leaf {
                        if l.as_assoc().map(|a| !a.is_managed()).unwrap_or(false) {
                            return Err(RewriteError::AssocInExpression(r.dotted()));
                        }
                    }
                    let multi = leaf
                        .as_ref()
                        .map(|l| leaf_count(l, cx))
                        .unwrap_or(1);
                    if multi > 1 {
                        return Err(RewriteError::AmbiguousOrderBy {
                            path: r.dotted(),
                            count: multi,
                        });
                    }
                    match leaf {
                        Some(l) if l.is_structured() || l.is_association() => {
                            // Exactly one leaf; order by it.
                            let (alias, base) = flatten_scalar_like(r, None);
                            let suffix = single_leaf_suffix(&l, cx);
                            Token::Ref(RefExpr::flat(&alias, &join_flat(&base, &suffix)))
                        }
                        _ => Token::Ref(flatten_scalar_ref(r, None)),
                    }
                }
            }
            other => rewrite_single(other, None, cx)?,
        };
        out.push(OrderByItem {
            token,
            sort: item.sort,
            nulls: item.nulls,
        });
    }
    Ok(out)
}

fn leaf_count(el: &Arc<ElementDef>, cx: &Rw) -> usize {
    if el.is_scalar() {
        return 1;
    }
    if let Some(assoc) = el.as_assoc() {
        if assoc.is_managed() {
            return fk_leaves(assoc, cx.model).len();
        }
        return usize::MAX;
    }
    scalar_leaves(el, cx.model).len()
}

fn single_leaf_suffix(el: &Arc<ElementDef>, cx: &Rw) -> String {
    if let Some(assoc) = el.as_assoc() {
        return fk_leaves(assoc, cx.model)
            .into_iter()
            .next()
            .map(|(s, _)| s)
            .unwrap_or_default();
    }
    scalar_leaves(el, cx.model)
        .into_iter()
        .next()
        .map(|(s, _)| s)
        .unwrap_or_default()
}

/// Group-by entries are a list of expressions; a structured entry splices one
/// flat reference per leaf.
pub(crate) fn rewrite_group_by(
    tokens: &[Token],
    cx: &mut Rw,
) -> Result<Vec<Token>, RewriteError> {
    let mut out = vec![];
    for token in tokens {
        match token {
            Token::Ref(r) => {
                let resolved = r.resolved.as_ref().expect("group-by reference resolved");
                if resolved.pseudo {
                    out.push(token.clone());
                    continue;
                }
                if resolved.self_ref {
                    out.push(substitute_self(r, None, cx)?);
                    continue;
                }
                match resolved.leaf_element().cloned() {
                    Some(l) if l.is_structured() => {
                        let (alias, base) = flatten_scalar_like(r, None);
                        for (suffix, _) in scalar_leaves(&l, cx.model) {
                            out.push(Token::Ref(RefExpr::flat(
                                &alias,
                                &join_flat(&base, &suffix),
                            )));
                        }
                    }
                    Some(l) if l.is_association() => {
                        let assoc = l.as_assoc().unwrap();
                        if !assoc.is_managed() {
                            return Err(RewriteError::AssocInExpression(r.dotted()));
                        }
                        let (alias, base) = flatten_scalar_like(r, None);
                        for (suffix, _) in fk_leaves(assoc, cx.model) {
                            out.push(Token::Ref(RefExpr::flat(
                                &alias,
                                &join_flat(&base, &suffix),
                            )));
                        }
                    }
                    _ => out.push(Token::Ref(flatten_scalar_ref(r, None))),
                }
            }
            other => out.push(rewrite_single(other, None, cx)?),
        }
    }
    Ok(out)
}

/// Lower a search specification into `search(<columns>, <expr>)`.
pub(crate) fn lower_search(
    search: &[Token],
    cx: &mut Rw,
) -> Result<Option<Vec<Token>>, RewriteError> {
    let Some(source) = cx.inferred.sources.first() else {
        return Ok(None);
    };
    let Some(entity) = source.entity().cloned() else {
        return Ok(None);
    };
    let columns = cx
        .opts
        .search_provider()
        .searchable_columns(cx.model, &entity, &source.alias);
    if columns.is_empty() {
        log::debug!("search: no searchable columns on '{}', dropped", entity.name);
        return Ok(None);
    }
    let expr = rewrite_tokens(search, cx)?;
    Ok(Some(vec![Token::func(
        "search",
        vec![
            Token::list(columns.into_iter().map(Token::Ref).collect()),
            Token::xpr(expr),
        ],
    )]))
}

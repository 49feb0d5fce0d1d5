//! On-condition derivation
//!
//! Produces the flat join condition for traversing one association between
//! two table aliases. Managed associations pair each foreign key column with
//! the matching target key column; unmanaged associations get their declared
//! on-condition cloned with all references rewritten to the two aliases, and
//! `$self` backlink comparisons replaced by the peer association's own
//! condition with the roles swapped.

use std::sync::Arc;

use crate::cqn::{RefExpr, Token};
use crate::inference::resolver::scalar_leaves;
use crate::model::{ElementDef, Model};

use super::errors::RewriteError;

/// Flat condition linking `src_alias` (the table the association is declared
/// on) with `tgt_alias` (the association target).
pub(crate) fn traversal_condition(
    assoc_el: &Arc<ElementDef>,
    src_alias: &str,
    tgt_alias: &str,
    model: &Model,
) -> Result<Vec<Token>, RewriteError> {
    let assoc = assoc_el
        .as_assoc()
        .expect("traversal condition derives from an association");

    if let Some(keys) = &assoc.keys {
        let target = model.target(assoc).map_err(crate::inference::InferenceError::from)?;
        let mut tokens = vec![];
        for fk in keys {
            let Some(key_el) = lookup_path(&target.elements, &fk.path) else {
                return Err(RewriteError::MalformedOnCondition(format!(
                    "foreign key '{}' not found in '{}'",
                    fk.path.join("."),
                    target.name
                )));
            };
            for (suffix, _) in scalar_leaves(&key_el, model) {
                if !tokens.is_empty() {
                    tokens.push(Token::kw("and"));
                }
                let tgt_col = join_flat(&fk.path.join("_"), &suffix);
                let src_col = join_flat(
                    &format!("{}_{}", assoc_el.name, fk.flat_suffix()),
                    &suffix,
                );
                tokens.push(Token::Ref(RefExpr::flat(tgt_alias, &tgt_col)));
                tokens.push(Token::kw("="));
                tokens.push(Token::Ref(RefExpr::flat(src_alias, &src_col)));
            }
        }
        if tokens.is_empty() {
            return Err(RewriteError::MalformedOnCondition(format!(
                "association '{}' has no usable foreign keys",
                assoc_el.name
            )));
        }
        return Ok(tokens);
    }

    let on = assoc.on.as_ref().ok_or_else(|| {
        RewriteError::MalformedOnCondition(format!(
            "association '{}' is neither managed nor carries an on-condition",
            assoc_el.name
        ))
    })?;
    rewrite_on(on, assoc_el, src_alias, tgt_alias, model)
}

/// Clone and rewrite an unmanaged on-condition: `<assoc>.x` → target side,
/// `$self.x` and bare elements → source side, `… = $self` → materialized
/// backlink condition.
fn rewrite_on(
    on: &[Token],
    assoc_el: &Arc<ElementDef>,
    src_alias: &str,
    tgt_alias: &str,
    model: &Model,
) -> Result<Vec<Token>, RewriteError> {
    let mut out = vec![];
    let mut i = 0;
    while i < on.len() {
        // `<peer> = $self` or `$self = <peer>` acts as a late-bound pointer
        // to the association on the other side.
        if i + 2 < on.len() && on[i + 1].is_kw("=") {
            let lhs_self = is_bare_self(&on[i]);
            let rhs_self = is_bare_self(&on[i + 2]);
            if lhs_self != rhs_self {
                let peer = if lhs_self { &on[i + 2] } else { &on[i] };
                let Token::Ref(peer_ref) = peer else {
                    return Err(RewriteError::MalformedOnCondition(format!(
                        "'$self' of '{}' must be compared with an association",
                        assoc_el.name
                    )));
                };
                out.extend(backlink_condition(
                    peer_ref, assoc_el, src_alias, tgt_alias, model,
                )?);
                i += 3;
                continue;
            }
        }
        match &on[i] {
            Token::Ref(r) => out.push(Token::Ref(rewrite_on_ref(
                r, assoc_el, src_alias, tgt_alias,
            ))),
            Token::Xpr { xpr } => {
                let inner = rewrite_on(xpr, assoc_el, src_alias, tgt_alias, model)?;
                out.push(Token::xpr(inner));
            }
            Token::Func(f) => {
                let args = rewrite_on(&f.args, assoc_el, src_alias, tgt_alias, model)?;
                out.push(Token::func(&f.func, args));
            }
            Token::List { list } => {
                let items = rewrite_on(list, assoc_el, src_alias, tgt_alias, model)?;
                out.push(Token::list(items));
            }
            other => out.push(other.clone()),
        }
        i += 1;
    }
    Ok(out)
}

fn rewrite_on_ref(
    r: &RefExpr,
    assoc_el: &Arc<ElementDef>,
    src_alias: &str,
    tgt_alias: &str,
) -> RefExpr {
    let names = r.names();
    if names.first() == Some(&assoc_el.name.as_str()) {
        return RefExpr::flat(tgt_alias, &names[1..].join("_"));
    }
    if names.first() == Some(&"$self") && names.len() > 1 {
        return RefExpr::flat(src_alias, &names[1..].join("_"));
    }
    RefExpr::flat(src_alias, &names.join("_"))
}

/// Materialize `<peer> = $self`: the peer association completes the edge from
/// the target side, so its condition is derived with the roles swapped.
fn backlink_condition(
    peer_ref: &RefExpr,
    assoc_el: &Arc<ElementDef>,
    src_alias: &str,
    tgt_alias: &str,
    model: &Model,
) -> Result<Vec<Token>, RewriteError> {
    let assoc = assoc_el.as_assoc().unwrap();
    let target = model.target(assoc).map_err(crate::inference::InferenceError::from)?;

    let names = peer_ref.names();
    let peer_path: Vec<&str> = if names.first() == Some(&assoc_el.name.as_str()) {
        names[1..].to_vec()
    } else {
        names.clone()
    };
    let [peer_name] = peer_path[..] else {
        return Err(RewriteError::MalformedOnCondition(format!(
            "backlink '{}' of '{}' must name one association of '{}'",
            peer_ref.dotted(),
            assoc_el.name,
            target.name
        )));
    };
    let Some(peer_el) = target.elements.get(peer_name) else {
        return Err(RewriteError::MalformedOnCondition(format!(
            "backlink '{}' not found in '{}'",
            peer_name, target.name
        )));
    };
    if !peer_el.is_association() {
        return Err(RewriteError::MalformedOnCondition(format!(
            "backlink '{}' of '{}' is not an association",
            peer_name, target.name
        )));
    }
    traversal_condition(peer_el, tgt_alias, src_alias, model)
}

fn is_bare_self(token: &Token) -> bool {
    match token {
        Token::Ref(r) => r.names() == ["$self"],
        _ => false,
    }
}

fn lookup_path(
    elements: &crate::model::Elements,
    path: &[String],
) -> Option<Arc<ElementDef>> {
    let mut current: Option<Arc<ElementDef>> = None;
    let mut els = elements;
    for seg in path {
        let el = els.get(seg)?;
        current = Some(Arc::clone(el));
        if let Some(children) = el.sub_elements() {
            els = children;
        } else if seg != path.last().unwrap() {
            return None;
        }
    }
    current
}

fn join_flat(head: &str, tail: &str) -> String {
    if tail.is_empty() {
        head.to_string()
    } else {
        format!("{head}_{tail}")
    }
}

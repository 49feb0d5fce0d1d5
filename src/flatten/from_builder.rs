//! FROM rewriting
//!
//! Reduces every source to a single-step reference plus alias. A `from` path
//! of length > 1 expands as a chain of where-exists subqueries in reverse
//! order: the last step becomes the outer entity, each earlier association
//! step an `EXISTS (SELECT 1 FROM … WHERE <join condition> [AND <filter>])`,
//! nested under AND. Where-rooted `exists <assoc path>` predicates build the
//! same chain in navigation direction.

use crate::cqn::{Column, From, FromRef, FromSelect, Literal, RefExpr, Select, Step, Token};
use crate::inference::resolver::LinkDef;

use super::errors::RewriteError;
use super::on_condition::traversal_condition;
use super::predicate_builder::rewrite_tokens_with_base;
use super::{and_join, short_name, Rw};

pub(crate) struct FromRewrite {
    pub from: From,
    /// AND-composed into the output where clause.
    pub where_parts: Vec<Vec<Token>>,
}

pub(crate) fn rewrite_from(from: &From, cx: &mut Rw) -> Result<FromRewrite, RewriteError> {
    match from {
        From::Ref(fr) => rewrite_from_ref(fr, cx),
        From::Join(join) => {
            let mut where_parts = vec![];
            let mut args = Vec::with_capacity(join.args.len());
            for arg in &join.args {
                let mut rewritten = rewrite_from(arg, cx)?;
                where_parts.append(&mut rewritten.where_parts);
                args.push(rewritten.from);
            }
            let on = rewrite_tokens_with_base(&join.on, None, cx)?;
            Ok(FromRewrite {
                from: From::Join(Box::new(crate::cqn::JoinFrom {
                    join: join.join,
                    args,
                    on,
                })),
                where_parts,
            })
        }
        From::Select(fs) => {
            let inner = super::rewrite_select(fs.select.clone(), cx.model, cx.opts, cx.outer)?;
            Ok(FromRewrite {
                from: From::Select(Box::new(FromSelect {
                    select: inner,
                    alias: fs.alias.clone(),
                })),
                where_parts: vec![],
            })
        }
    }
}

fn rewrite_from_ref(fr: &FromRef, cx: &mut Rw) -> Result<FromRewrite, RewriteError> {
    let resolved = fr
        .resolved
        .as_ref()
        .expect("from reference resolved during inference");
    let links = &resolved.links;
    let n = fr.steps.len();

    let alias = fr
        .alias
        .clone()
        .unwrap_or_else(|| short_name(&fr.steps[n - 1].name).to_string());
    let outer_entity = links[n - 1]
        .target
        .as_ref()
        .expect("from step carries a target")
        .name
        .clone();

    let mut where_parts: Vec<Vec<Token>> = vec![];
    if let Some(filter) = &fr.steps[n - 1].filter {
        where_parts.push(rewrite_tokens_with_base(filter, Some(&alias), cx)?);
    }

    if n > 1 {
        // Aliases for the chain tables at positions 0..n-2; the last step is
        // the outer entity itself.
        let chain_aliases: Vec<String> = (0..n - 1)
            .map(|i| {
                let short = match &links[i].def {
                    LinkDef::Entity(def) => def.short_name().to_string(),
                    _ => fr.steps[i].name.clone(),
                };
                cx.aliases.add_alias(&short)
            })
            .collect();

        // Innermost (position 0) outward.
        let mut inner: Option<Select> = None;
        for i in 0..n - 1 {
            let tgt = if i + 1 == n - 1 {
                alias.as_str()
            } else {
                chain_aliases[i + 1].as_str()
            };
            // The condition for traversing step i+1 lives in the level that
            // holds the near-side table.
            let condition = traversal_condition(
                links[i + 1]
                    .def
                    .as_element()
                    .expect("from path steps are associations"),
                &chain_aliases[i],
                tgt,
                cx.model,
            )?;
            let mut parts = vec![condition];
            if let Some(filter) = &fr.steps[i].filter {
                parts.push(rewrite_tokens_with_base(filter, Some(&chain_aliases[i]), cx)?);
            }
            if let Some(sub) = inner.take() {
                parts.push(vec![Token::kw("exists"), Token::select(sub)]);
            }
            let entity = match &links[i].def {
                LinkDef::Entity(def) => def.name.clone(),
                _ => links[i]
                    .target
                    .as_ref()
                    .expect("association step carries a target")
                    .name
                    .clone(),
            };
            inner = Some(exists_select(&entity, &chain_aliases[i], parts));
        }

        // n > 1 guarantees at least one chain level. The chain is built
        // inside-out, so `inner` now holds the outermost level.
        let sub = inner.expect("path of length > 1 yields a chain");
        where_parts.insert(0, vec![Token::kw("exists"), Token::select(sub)]);
    }

    Ok(FromRewrite {
        from: From::Ref(FromRef {
            steps: vec![Step::plain(&outer_entity)],
            alias: Some(alias),
            resolved: None,
        }),
        where_parts,
    })
}

/// Forward chain for `exists <assoc path>` in a predicate: each step becomes
/// one nested `EXISTS (SELECT 1 FROM <target> WHERE <condition> …)` in
/// navigation direction, rooted at `origin_alias`.
pub(crate) fn exists_subquery_for_path(
    r: &RefExpr,
    origin_alias: &str,
    cx: &mut Rw,
) -> Result<Select, RewriteError> {
    let resolved = r
        .resolved
        .as_ref()
        .expect("exists path resolved during inference");
    let start = if resolved.first_step_is_source { 1 } else { 0 };
    let assoc_idx: Vec<usize> = (start..r.steps.len()).collect();

    let aliases: Vec<String> = assoc_idx
        .iter()
        .map(|&i| cx.aliases.add_alias(&r.steps[i].name))
        .collect();

    let mut inner: Option<Select> = None;
    for (k, &i) in assoc_idx.iter().enumerate().rev() {
        let src = if k == 0 {
            origin_alias
        } else {
            aliases[k - 1].as_str()
        };
        let link = &resolved.links[i];
        let mut parts = vec![traversal_condition(
            link.def.as_element().expect("exists path steps are associations"),
            src,
            &aliases[k],
            cx.model,
        )?];
        if let Some(filter) = &r.steps[i].filter {
            parts.push(rewrite_tokens_with_base(filter, Some(&aliases[k]), cx)?);
        }
        if let Some(sub) = inner.take() {
            parts.push(vec![Token::kw("exists"), Token::select(sub)]);
        }
        let entity = link
            .target
            .as_ref()
            .expect("association step carries a target")
            .name
            .clone();
        inner = Some(exists_select(&entity, &aliases[k], parts));
    }

    Ok(inner.expect("exists path has at least one step"))
}

/// `SELECT 1 FROM <entity> AS <alias> WHERE <parts…>`
fn exists_select(entity: &str, alias: &str, parts: Vec<Vec<Token>>) -> Select {
    Select {
        from: From::Ref(FromRef {
            steps: vec![Step::plain(entity)],
            alias: Some(alias.to_string()),
            resolved: None,
        }),
        columns: Some(vec![Column::val(Literal::Integer(1))]),
        where_: and_join(parts),
        ..Select::default()
    }
}

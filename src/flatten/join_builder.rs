//! Join materialization
//!
//! Replaces the single-source `from` by a nested left-join tree when the
//! join tree is non-initial. Each node contributes one edge whose
//! on-condition is the association traversal in navigation direction, with
//! the node's infix filter AND-appended.

use crate::cqn::{From, FromRef, JoinFrom, JoinKind, Step};
use crate::inference::JoinNode;

use super::errors::RewriteError;
use super::on_condition::traversal_condition;
use super::predicate_builder::rewrite_tokens_with_base;
use super::{and_join, Rw};

pub(crate) fn materialize_joins(base: From, cx: &mut Rw) -> Result<From, RewriteError> {
    let tree = cx.inferred.join_tree.clone();
    if tree.is_initial() {
        return Ok(base);
    }
    let mut current = base;
    for root in tree.roots() {
        current = attach(current, root, cx)?;
    }
    Ok(current)
}

fn attach(current: From, node: &JoinNode, cx: &mut Rw) -> Result<From, RewriteError> {
    let condition = traversal_condition(&node.assoc, &node.source_alias, &node.alias, cx.model)?;
    let on = match &node.filter {
        Some(filter) => {
            let rewritten = rewrite_tokens_with_base(filter, Some(&node.alias), cx)?;
            and_join(vec![condition, rewritten]).expect("join edge has a condition")
        }
        None => condition,
    };
    log::debug!(
        "materializing left join {} -> {} as '{}'",
        node.source_alias,
        node.target.name,
        node.alias
    );
    let mut current = From::Join(Box::new(JoinFrom {
        join: JoinKind::Left,
        args: vec![
            current,
            From::Ref(FromRef {
                steps: vec![Step::plain(&node.target.name)],
                alias: Some(node.alias.clone()),
                resolved: None,
            }),
        ],
        on,
    }));
    for child in &node.children {
        current = attach(current, child, cx)?;
    }
    Ok(current)
}

//! Join tree
//!
//! Deduplicating forest of association traversals that must be materialized
//! as left joins. Nodes are keyed by the canonical dotted path from their
//! query source, including a fingerprint of any infix filter, so two
//! references sharing a prefix share one node (and one table alias) while
//! differently-filtered traversals of the same association get distinct
//! nodes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::cqn::{Step, Token};
use crate::model::{Definition, ElementDef};

use super::resolver::{LinkDef, RefLink};

/// Unique table aliases within one query. Collisions bump a monotonic
/// counter: `author`, `author2`, `author3`, …
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AliasAllocator {
    taken: HashSet<String>,
    counters: HashMap<String, u32>,
}

impl AliasAllocator {
    pub fn new() -> Self {
        AliasAllocator::default()
    }

    /// Register a caller-chosen alias (query sources). Returns false when the
    /// alias is already taken.
    pub fn reserve(&mut self, alias: &str) -> bool {
        self.taken.insert(alias.to_string())
    }

    pub fn is_taken(&self, alias: &str) -> bool {
        self.taken.contains(alias)
    }

    /// Allocate a unique alias derived from `short`.
    pub fn add_alias(&mut self, short: &str) -> String {
        if self.taken.insert(short.to_string()) {
            return short.to_string();
        }
        let counter = self.counters.entry(short.to_string()).or_insert(1);
        loop {
            *counter += 1;
            let candidate = format!("{short}{counter}");
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinNode {
    /// Canonical key of this traversal below its parent.
    pub key: String,
    /// Unique table alias for the joined target.
    pub alias: String,
    /// Table alias of the near side of the join edge.
    pub source_alias: String,
    /// The association element being traversed.
    pub assoc: Arc<ElementDef>,
    /// The (localized) target definition.
    pub target: Arc<Definition>,
    /// Resolved infix filter; AND-appended to the edge's on-condition.
    pub filter: Option<Vec<Token>>,
    pub children: Vec<JoinNode>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinTree {
    roots: Vec<JoinNode>,
    pub aliases: AliasAllocator,
}

impl JoinTree {
    pub fn new() -> Self {
        JoinTree::default()
    }

    pub fn is_initial(&self) -> bool {
        self.roots.is_empty()
    }

    /// Top-level nodes in insertion order.
    pub fn roots(&self) -> &[JoinNode] {
        &self.roots
    }

    /// Insert every association prefix of a join-relevant reference up to and
    /// including `cut`, reusing existing nodes, and overwrite the alias of
    /// each merged link with its node's table alias.
    pub fn merge(&mut self, source_alias: &str, steps: &[Step], links: &mut [RefLink], cut: usize) {
        let JoinTree { roots, aliases } = self;
        let mut level: &mut Vec<JoinNode> = roots;
        let mut near_alias = source_alias.to_string();
        let mut prefix = source_alias.to_string();

        for i in 0..=cut {
            let el = match &links[i].def {
                LinkDef::Element(el) if el.is_association() => Arc::clone(el),
                // Structured or source steps on the way are part of the flat
                // name, not of the join plan.
                _ => continue,
            };
            let step = &steps[i];
            prefix = format!("{prefix}.{}{}", step.name, filter_fingerprint(&step.filter));

            let pos = match level.iter().position(|n| n.key == prefix) {
                Some(pos) => pos,
                None => {
                    let alias = aliases.add_alias(&step.name);
                    log::debug!("join tree: new node '{prefix}' as '{alias}'");
                    let target = links[i]
                        .target
                        .clone()
                        .expect("association link carries its target");
                    level.push(JoinNode {
                        key: prefix.clone(),
                        alias,
                        source_alias: near_alias.clone(),
                        assoc: el,
                        target,
                        filter: step.filter.clone(),
                        children: vec![],
                    });
                    level.len() - 1
                }
            };
            links[i].alias = level[pos].alias.clone();
            near_alias = level[pos].alias.clone();
            let current = level;
            level = &mut current[pos].children;
        }
    }
}

/// Stable fingerprint of an infix filter, so differently-filtered traversals
/// of one association key different nodes.
fn filter_fingerprint(filter: &Option<Vec<Token>>) -> String {
    match filter {
        None => String::new(),
        Some(tokens) => {
            let serialized =
                serde_json::to_string(tokens).unwrap_or_else(|_| format!("{tokens:?}"));
            let digest = Sha256::digest(serialized.as_bytes());
            format!("[{}]", &hex::encode(digest)[..8])
        }
    }
}

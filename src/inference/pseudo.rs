//! Pseudo namespace
//!
//! Fixed set of reserved path roots that short-circuit resolution: a path
//! rooted here is not merged into the join tree and not prefixed with a table
//! alias; the rewriter emits it verbatim for the parameter binder to pick up.

use std::collections::HashMap;

use lazy_static::lazy_static;

#[derive(Debug, Clone)]
pub struct PseudoDef {
    pub name: &'static str,
    /// Child element names; empty for leaf pseudos like `$now`.
    pub children: &'static [&'static str],
}

lazy_static! {
    static ref PSEUDOS: HashMap<&'static str, PseudoDef> = {
        let defs = [
            PseudoDef {
                name: "$user",
                children: &["id", "locale", "tenant"],
            },
            PseudoDef {
                name: "$now",
                children: &[],
            },
            PseudoDef {
                name: "$at",
                children: &["from", "to"],
            },
            PseudoDef {
                name: "$valid",
                children: &["from", "to"],
            },
            PseudoDef {
                name: "$locale",
                children: &[],
            },
            PseudoDef {
                name: "$tenant",
                children: &[],
            },
        ];
        defs.into_iter().map(|d| (d.name, d)).collect()
    };
}

pub fn lookup(root: &str) -> Option<&'static PseudoDef> {
    PSEUDOS.get(root)
}

/// Whether `path` is rooted in the pseudo namespace. `$self`/`$projection`
/// are not pseudos; they point back into the query itself.
pub fn is_pseudo_root(name: &str) -> bool {
    PSEUDOS.contains_key(name)
}

/// Validate a pseudo path; returns false when a child step does not exist.
pub fn validate(names: &[&str]) -> bool {
    let Some(def) = names.first().and_then(|n| lookup(n)) else {
        return false;
    };
    match names.len() {
        1 => true,
        2 => def.children.contains(&names[1]),
        _ => false,
    }
}

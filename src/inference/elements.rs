//! Element inferencer
//!
//! Computes the ordered output element map of a query from its (already
//! wildcard- and inline-expanded) columns: scalar leaves, flattened
//! structures, foreign-key expansions, literal and expression typing, and
//! expansion subquery elements.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value};

use crate::cqn::{Column, ColumnExpr, Literal, Token};
use crate::model::{ElementDef, ElementKind, Elements, Model};

use super::errors::InferenceError;
use super::resolver::{fk_leaves, flat_segments, scalar_leaves};

#[derive(Debug, Clone, PartialEq)]
pub enum InferredKind {
    /// Backed by a model element.
    Declared { def: Arc<ElementDef> },
    /// Literal value column; type inferred from the value.
    Literal,
    /// Expression, function or subquery column.
    Expr,
    /// Runtime-bound or otherwise untyped.
    Opaque,
    /// Expansion subquery over an association.
    Expanded { one: bool, skipped: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferredElement {
    pub name: String,
    pub kind: InferredKind,
    /// Cast override, literal type, or expression type.
    pub type_name: Option<String>,
    pub key: bool,
    pub annotations: JsonMap<String, Value>,
}

impl InferredElement {
    /// Effective type: explicit override first, declared type second.
    pub fn effective_type(&self) -> Option<&str> {
        if let Some(t) = &self.type_name {
            return Some(t);
        }
        match &self.kind {
            InferredKind::Declared { def } => def.type_name(),
            _ => None,
        }
    }
}

/// Ordered output element map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferredElements {
    order: Vec<String>,
    map: HashMap<String, InferredElement>,
}

impl InferredElements {
    pub fn new() -> Self {
        InferredElements::default()
    }

    pub fn insert(&mut self, element: InferredElement) -> Result<(), InferenceError> {
        let name = element.name.clone();
        if self.map.contains_key(&name) {
            return Err(InferenceError::DuplicateElement(name));
        }
        self.order.push(name.clone());
        self.map.insert(name, element);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&InferredElement> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InferredElement> {
        self.order.iter().map(move |n| &self.map[n])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// View the inferred elements as model elements, so a subquery can act
    /// as a query source.
    pub fn as_model_elements(&self) -> Elements {
        let mut out = Elements::new();
        for el in self.iter() {
            let def = match &el.kind {
                InferredKind::Declared { def } => {
                    let mut renamed = (**def).clone();
                    renamed.name = el.name.clone();
                    renamed
                }
                _ => ElementDef {
                    name: el.name.clone(),
                    kind: ElementKind::Scalar {
                        type_name: el
                            .type_name
                            .clone()
                            .unwrap_or_else(|| "cds.String".to_string()),
                    },
                    key: el.key,
                    is_virtual: false,
                    annotations: el.annotations.clone(),
                },
            };
            out.insert(def);
        }
        out
    }
}

/// Type of a literal value: string, boolean, integer if it fits safely,
/// decimal otherwise; null stays untyped.
pub fn literal_type(lit: &Literal) -> Option<String> {
    match lit {
        Literal::String(_) => Some("cds.String".to_string()),
        Literal::Boolean(_) => Some("cds.Boolean".to_string()),
        Literal::Integer(_) => Some("cds.Integer".to_string()),
        Literal::Float(_) => Some("cds.Decimal".to_string()),
        Literal::Null => None,
    }
}

/// Compute the output elements for the expanded column list.
pub fn infer_elements(
    columns: &[Column],
    model: &Model,
) -> Result<InferredElements, InferenceError> {
    let mut out = InferredElements::new();
    for (position, col) in columns.iter().enumerate() {
        infer_column_elements(col, position, model, &mut out)?;
    }
    Ok(out)
}

fn infer_column_elements(
    col: &Column,
    position: usize,
    model: &Model,
    out: &mut InferredElements,
) -> Result<(), InferenceError> {
    match &col.expr {
        ColumnExpr::Star => {
            // Wildcards are expanded before element inference.
            Ok(())
        }
        ColumnExpr::Ref(r) => {
            let resolved = r
                .resolved
                .as_ref()
                .expect("column reference resolved during inference");
            if resolved.pseudo || resolved.self_ref {
                let name = col
                    .alias
                    .clone()
                    .unwrap_or_else(|| r.steps.last().unwrap().name.clone());
                return out.insert(InferredElement {
                    name,
                    kind: InferredKind::Opaque,
                    type_name: col.cast.clone(),
                    key: col.key,
                    annotations: col.annotations.clone(),
                });
            }
            let (_, start) = resolved.flat_root();
            let flat = flat_segments(&resolved.links, &r.steps, start);
            let name_base = col.alias.clone().unwrap_or(flat);
            let leaf = resolved
                .leaf_element()
                .cloned();

            if col.expand.is_some() {
                let el = leaf.expect("expand sits on an element");
                let assoc = el.as_assoc().expect("structured expands are flattened before inference");
                let target = model.target(assoc)?;
                return out.insert(InferredElement {
                    name: name_base,
                    kind: InferredKind::Expanded {
                        one: assoc.is_to_one(),
                        skipped: target.persistence_skip,
                    },
                    type_name: None,
                    key: col.key,
                    annotations: col.annotations.clone(),
                });
            }

            let Some(el) = leaf else {
                // First (and only) step named a query source; selecting a
                // whole source is not a flat column.
                return Err(InferenceError::UnknownName(r.dotted()));
            };

            if el.is_virtual {
                return Ok(());
            }
            if el.is_structured() {
                for (suffix, leaf_def) in scalar_leaves(&el, model) {
                    push_declared(out, join_name(&name_base, &suffix), &leaf_def, col)?;
                }
                return Ok(());
            }
            if let Some(assoc) = el.as_assoc() {
                if !assoc.is_managed() {
                    return Err(InferenceError::UnmanagedSelection(r.dotted()));
                }
                for (suffix, leaf_def) in fk_leaves(assoc, model) {
                    push_declared(out, join_name(&name_base, &suffix), &leaf_def, col)?;
                }
                return Ok(());
            }
            push_declared(out, name_base, &el, col)
        }
        ColumnExpr::Val(lit) => {
            let name = col
                .alias
                .clone()
                .ok_or_else(|| InferenceError::ExpectingAlias(format!("value at position {position}")))?;
            out.insert(InferredElement {
                name,
                kind: InferredKind::Literal,
                type_name: col.cast.clone().or_else(|| literal_type(lit)),
                key: col.key,
                annotations: col.annotations.clone(),
            })
        }
        ColumnExpr::Param(_) => {
            // Runtime-bound; not materialized as an element.
            Ok(())
        }
        ColumnExpr::Func(f) => {
            let name = col.alias.clone().unwrap_or_else(|| f.func.clone());
            out.insert(InferredElement {
                name,
                kind: InferredKind::Opaque,
                type_name: col.cast.clone(),
                key: col.key,
                annotations: col.annotations.clone(),
            })
        }
        ColumnExpr::Xpr(tokens) => {
            let name = col.alias.clone().ok_or_else(|| {
                InferenceError::ExpectingAlias(format!("expression at position {position}"))
            })?;
            out.insert(InferredElement {
                name,
                kind: InferredKind::Expr,
                type_name: col.cast.clone().or_else(|| first_ref_type(tokens)),
                key: col.key,
                annotations: col.annotations.clone(),
            })
        }
        ColumnExpr::Select(_) => {
            let name = col.alias.clone().ok_or_else(|| {
                InferenceError::ExpectingAlias(format!("subquery at position {position}"))
            })?;
            out.insert(InferredElement {
                name,
                kind: InferredKind::Expr,
                type_name: col.cast.clone(),
                key: col.key,
                annotations: col.annotations.clone(),
            })
        }
    }
}

fn push_declared(
    out: &mut InferredElements,
    name: String,
    def: &Arc<ElementDef>,
    col: &Column,
) -> Result<(), InferenceError> {
    let mut annotations = def.annotations.clone();
    for (k, v) in &col.annotations {
        annotations.insert(k.clone(), v.clone());
    }
    out.insert(InferredElement {
        name,
        kind: InferredKind::Declared {
            def: Arc::clone(def),
        },
        type_name: col.cast.clone(),
        key: def.key || col.key,
        annotations,
    })
}

/// Type of the first reference token, for expression columns.
fn first_ref_type(tokens: &[Token]) -> Option<String> {
    for token in tokens {
        if let Token::Ref(r) = token {
            let leaf = r.resolved.as_ref()?.leaf_element()?;
            return leaf.type_name().map(str::to_string);
        }
    }
    None
}

fn join_name(base: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        base.to_string()
    } else {
        format!("{base}_{suffix}")
    }
}

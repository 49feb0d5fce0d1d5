//! CSN definition types
//!
//! A model is a flat map from qualified name to definition. Definitions own
//! their elements; elements recursively own structured children. Everything
//! here is read-only after construction and shared via `Arc`, so a single
//! model can serve concurrent rewrites.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value};

use crate::cqn::Token;

/// Kind of a named model definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefKind {
    Entity,
    /// Reusable structured type (no persistence of its own).
    Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ToOne,
    ToMany,
}

/// One foreign key of a managed association. `path` points into the target's
/// key elements; `alias` is the optional per-key rename that determines the
/// physical column suffix.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub path: Vec<String>,
    pub alias: Option<String>,
}

impl ForeignKey {
    /// The flat column suffix this key contributes (rename wins).
    pub fn flat_suffix(&self) -> String {
        match &self.alias {
            Some(a) => a.clone(),
            None => self.path.join("_"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssocDef {
    /// Qualified name of the target entity.
    pub target: String,
    pub cardinality: Cardinality,
    /// Managed association: foreign keys into the target's keys.
    pub keys: Option<Vec<ForeignKey>>,
    /// Unmanaged association: on-condition token stream as declared.
    pub on: Option<Vec<Token>>,
}

impl AssocDef {
    pub fn is_managed(&self) -> bool {
        self.keys.is_some()
    }

    pub fn is_to_one(&self) -> bool {
        self.cardinality == Cardinality::ToOne
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    Scalar { type_name: String },
    Structured { elements: Elements },
    Association(AssocDef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementDef {
    pub name: String,
    pub kind: ElementKind,
    pub key: bool,
    pub is_virtual: bool,
    /// `@…` annotations as declared, in document order.
    pub annotations: JsonMap<String, Value>,
}

impl ElementDef {
    pub fn scalar(name: &str, type_name: &str) -> Self {
        ElementDef {
            name: name.to_string(),
            kind: ElementKind::Scalar {
                type_name: type_name.to_string(),
            },
            key: false,
            is_virtual: false,
            annotations: JsonMap::new(),
        }
    }

    pub fn as_assoc(&self) -> Option<&AssocDef> {
        match &self.kind {
            ElementKind::Association(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_association(&self) -> bool {
        matches!(self.kind, ElementKind::Association(_))
    }

    pub fn is_structured(&self) -> bool {
        matches!(self.kind, ElementKind::Structured { .. })
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, ElementKind::Scalar { .. })
    }

    /// Children of a structured element.
    pub fn sub_elements(&self) -> Option<&Elements> {
        match &self.kind {
            ElementKind::Structured { elements } => Some(elements),
            _ => None,
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Scalar { type_name } => Some(type_name),
            _ => None,
        }
    }

    pub fn annotation(&self, name: &str) -> Option<&Value> {
        self.annotations.get(name)
    }

    /// True for scalar elements that merely mirror a generated foreign key
    /// column of a sibling association. Wildcard expansion skips these so the
    /// foreign key is not selected twice.
    pub fn mirrors_foreign_key(&self) -> bool {
        self.annotations
            .get("@odata.foreignKey4")
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }
}

/// Ordered element map: declaration order drives wildcard expansion, struct
/// flattening and key pairing, lookups stay O(1).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Elements {
    order: Vec<String>,
    map: HashMap<String, Arc<ElementDef>>,
}

impl Elements {
    pub fn new() -> Self {
        Elements::default()
    }

    pub fn from_vec(elements: Vec<ElementDef>) -> Self {
        let mut out = Elements::new();
        for el in elements {
            out.insert(el);
        }
        out
    }

    pub fn insert(&mut self, element: ElementDef) {
        let name = element.name.clone();
        if self.map.insert(name.clone(), Arc::new(element)).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ElementDef>> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Iterate in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ElementDef>> {
        self.order.iter().map(move |n| &self.map[n])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|n| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    /// Qualified name, e.g. `bookshop.Books`.
    pub name: String,
    pub kind: DefKind,
    pub elements: Elements,
    /// Entity is not materialized in the database.
    pub persistence_skip: bool,
    /// A `localized.<name>` variant may exist in the model.
    pub localized: bool,
    pub annotations: JsonMap<String, Value>,
}

impl Definition {
    pub fn new_entity(name: &str, elements: Vec<ElementDef>) -> Self {
        Definition {
            name: name.to_string(),
            kind: DefKind::Entity,
            elements: Elements::from_vec(elements),
            persistence_skip: false,
            localized: false,
            annotations: JsonMap::new(),
        }
    }

    /// Key elements in declaration order.
    pub fn keys(&self) -> Vec<&Arc<ElementDef>> {
        self.elements.iter().filter(|e| e.key).collect()
    }

    pub fn key_names(&self) -> Vec<String> {
        self.keys().iter().map(|e| e.name.clone()).collect()
    }

    /// Short name: the segment after the last `.` of the qualified name.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

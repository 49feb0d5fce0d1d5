//! CSN model accessor
//!
//! Read-only view over the entity-relationship schema the normalizer resolves
//! against: named definitions, elements, keys, association metadata, and the
//! localized-variant lookup. No I/O happens here; documents are handed in as
//! already-parsed JSON.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

mod csn;
mod definitions;
mod errors;

pub use definitions::{
    AssocDef, Cardinality, DefKind, Definition, ElementDef, ElementKind, Elements, ForeignKey,
};
pub use errors::ModelError;

/// Prefix of generated localized views.
const LOCALIZED_PREFIX: &str = "localized.";

#[derive(Debug, Clone, Default)]
pub struct Model {
    definitions: HashMap<String, Arc<Definition>>,
}

impl Model {
    pub fn new() -> Self {
        Model::default()
    }

    /// Build a model from a CSN JSON document.
    pub fn from_csn(doc: &Value) -> Result<Model, ModelError> {
        csn::model_from_csn(doc)
    }

    pub fn insert(&mut self, def: Definition) {
        self.definitions.insert(def.name.clone(), Arc::new(def));
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Definition>> {
        self.definitions.get(name)
    }

    pub fn lookup(&self, name: &str) -> Result<&Arc<Definition>, ModelError> {
        self.definitions
            .get(name)
            .ok_or_else(|| ModelError::UnknownDefinition(name.to_string()))
    }

    pub fn elements<'a>(&self, def: &'a Definition) -> &'a Elements {
        &def.elements
    }

    pub fn keys<'a>(&self, def: &'a Definition) -> Vec<&'a Arc<ElementDef>> {
        def.keys()
    }

    /// Target definition of an association.
    pub fn target(&self, assoc: &AssocDef) -> Result<&Arc<Definition>, ModelError> {
        self.definitions
            .get(&assoc.target)
            .ok_or_else(|| ModelError::UnknownDefinition(assoc.target.clone()))
    }

    pub fn is_managed(&self, assoc: &AssocDef) -> bool {
        assoc.is_managed()
    }

    pub fn is_to_one(&self, assoc: &AssocDef) -> bool {
        assoc.is_to_one()
    }

    pub fn persistence_skip(&self, def: &Definition) -> bool {
        def.persistence_skip
    }

    /// The localized variant of `def` when `localized` is requested and the
    /// model carries one; the original definition otherwise.
    pub fn localized_view_for<'a>(
        &'a self,
        def: &'a Arc<Definition>,
        localized: bool,
    ) -> &'a Arc<Definition> {
        if localized && def.localized {
            if let Some(variant) = self.definitions.get(&format!("{LOCALIZED_PREFIX}{}", def.name))
            {
                return variant;
            }
        }
        def
    }

    /// Flag definitions that have a `localized.<name>` sibling. Called once
    /// after document ingestion.
    pub(crate) fn mark_localized(&mut self) {
        let localized: Vec<String> = self
            .definitions
            .keys()
            .filter_map(|n| n.strip_prefix(LOCALIZED_PREFIX))
            .map(str::to_string)
            .filter(|n| self.definitions.contains_key(n))
            .collect();
        for name in localized {
            let def = self.definitions.get(&name).unwrap();
            let mut updated = (**def).clone();
            updated.localized = true;
            self.definitions.insert(name, Arc::new(updated));
        }
    }
}

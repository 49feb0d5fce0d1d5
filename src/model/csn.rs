//! CSN document ingestion
//!
//! Builds a [`Model`](super::Model) from a CSN JSON document of the shape
//! `{ "definitions": { "<qualified name>": { "kind": "entity", "elements": { … } } } }`.
//! Element declaration order is taken from document order, which is why the
//! crate pulls `serde_json` with `preserve_order`.

use serde_json::{Map as JsonMap, Value};

use super::definitions::{
    AssocDef, Cardinality, DefKind, Definition, ElementDef, ElementKind, Elements, ForeignKey,
};
use super::errors::ModelError;
use super::Model;
use crate::cqn::token_from_csn;

pub fn model_from_csn(doc: &Value) -> Result<Model, ModelError> {
    let definitions = doc
        .get("definitions")
        .and_then(|d| d.as_object())
        .ok_or_else(|| ModelError::MalformedCsn("missing 'definitions' object".to_string()))?;

    let mut model = Model::new();
    for (name, raw) in definitions {
        let def = parse_definition(name, raw)?;
        model.insert(def);
    }
    model.mark_localized();
    log::debug!("loaded {} definitions from CSN document", model.len());
    Ok(model)
}

fn parse_definition(name: &str, raw: &Value) -> Result<Definition, ModelError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ModelError::MalformedCsn(format!("definition '{name}' is not an object")))?;

    let kind = match obj.get("kind").and_then(|k| k.as_str()) {
        Some("entity") | None => DefKind::Entity,
        Some("type") | Some("aspect") => DefKind::Type,
        Some(other) => {
            return Err(ModelError::MalformedCsn(format!(
                "definition '{name}' has unsupported kind '{other}'"
            )))
        }
    };

    let mut elements = Elements::new();
    if let Some(els) = obj.get("elements").and_then(|e| e.as_object()) {
        for (el_name, el_raw) in els {
            elements.insert(parse_element(name, el_name, el_raw)?);
        }
    }

    let annotations = collect_annotations(obj);
    let persistence_skip = annotations
        .get("@cds.persistence.skip")
        .map(|v| v.as_bool().unwrap_or(true))
        .unwrap_or(false);

    Ok(Definition {
        name: name.to_string(),
        kind,
        elements,
        persistence_skip,
        // Fixed up once the whole document is loaded and the localized
        // variants are known.
        localized: false,
        annotations,
    })
}

fn parse_element(owner: &str, name: &str, raw: &Value) -> Result<ElementDef, ModelError> {
    let obj = raw.as_object().ok_or_else(|| {
        ModelError::MalformedCsn(format!("element '{name}' of '{owner}' is not an object"))
    })?;

    let kind = if let Some(target) = obj.get("target").and_then(|t| t.as_str()) {
        ElementKind::Association(parse_association(owner, name, obj, target)?)
    } else if let Some(els) = obj.get("elements").and_then(|e| e.as_object()) {
        let mut elements = Elements::new();
        for (child_name, child_raw) in els {
            elements.insert(parse_element(owner, child_name, child_raw)?);
        }
        ElementKind::Structured { elements }
    } else if let Some(type_name) = obj.get("type").and_then(|t| t.as_str()) {
        ElementKind::Scalar {
            type_name: type_name.to_string(),
        }
    } else {
        return Err(ModelError::MalformedElement(
            name.to_string(),
            owner.to_string(),
        ));
    };

    Ok(ElementDef {
        name: name.to_string(),
        kind,
        key: obj.get("key").and_then(|k| k.as_bool()).unwrap_or(false),
        is_virtual: obj
            .get("virtual")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        annotations: collect_annotations(obj),
    })
}

fn parse_association(
    owner: &str,
    name: &str,
    obj: &JsonMap<String, Value>,
    target: &str,
) -> Result<AssocDef, ModelError> {
    let cardinality = match obj.get("cardinality") {
        Some(Value::Object(c)) => match c.get("max") {
            Some(Value::String(s)) if s == "*" => Cardinality::ToMany,
            Some(Value::Number(n)) if n.as_i64().unwrap_or(1) > 1 => Cardinality::ToMany,
            _ => Cardinality::ToOne,
        },
        _ => Cardinality::ToOne,
    };

    let keys = match obj.get("keys") {
        Some(Value::Array(items)) => {
            let mut fks = Vec::with_capacity(items.len());
            for item in items {
                let key_obj = item.as_object().ok_or_else(|| {
                    ModelError::MalformedCsn(format!(
                        "foreign key of '{owner}.{name}' is not an object"
                    ))
                })?;
                let path = key_obj
                    .get("ref")
                    .and_then(|r| r.as_array())
                    .map(|segs| {
                        segs.iter()
                            .filter_map(|s| s.as_str().map(str::to_string))
                            .collect::<Vec<_>>()
                    })
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        ModelError::MalformedCsn(format!(
                            "foreign key of '{owner}.{name}' misses a 'ref' path"
                        ))
                    })?;
                let alias = key_obj
                    .get("as")
                    .and_then(|a| a.as_str())
                    .map(str::to_string);
                fks.push(ForeignKey { path, alias });
            }
            Some(fks)
        }
        None => None,
        Some(other) => {
            return Err(ModelError::MalformedCsn(format!(
                "keys of '{owner}.{name}' must be an array, found {other}"
            )))
        }
    };

    let on = match obj.get("on") {
        Some(Value::Array(tokens)) => Some(
            tokens
                .iter()
                .map(|t| {
                    token_from_csn(t).map_err(|e| {
                        ModelError::MalformedCsn(format!(
                            "on-condition of '{owner}.{name}': {e}"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => None,
        Some(other) => {
            return Err(ModelError::MalformedCsn(format!(
                "on-condition of '{owner}.{name}' must be an array, found {other}"
            )))
        }
    };

    if keys.is_none() && on.is_none() {
        return Err(ModelError::MalformedCsn(format!(
            "association '{owner}.{name}' needs either 'keys' or 'on'"
        )));
    }

    Ok(AssocDef {
        target: target.to_string(),
        cardinality,
        keys,
        on,
    })
}

fn collect_annotations(obj: &JsonMap<String, Value>) -> JsonMap<String, Value> {
    obj.iter()
        .filter(|(k, _)| k.starts_with('@'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

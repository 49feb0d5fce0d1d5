//! Bookshop fixture model and assertion helpers shared by the unit tests.

use serde_json::json;
use sqlshape::cqn::{Column, ColumnExpr, Token};
use sqlshape::Model;

/// Books/Authors/Genres with managed and unmanaged associations, a renamed
/// foreign key, a structured element, a localized view, a virtual element,
/// a foreign-key mirror column, and a non-persisted entity.
pub fn bookshop() -> Model {
    Model::from_csn(&json!({
        "definitions": {
            "bookshop.Books": {
                "kind": "entity",
                "elements": {
                    "ID": { "key": true, "type": "cds.Integer" },
                    "title": { "type": "cds.String", "localized": true },
                    "stock": { "type": "cds.Integer" },
                    "price": { "type": "cds.Decimal" },
                    "dedication": {
                        "elements": {
                            "text": { "type": "cds.String" },
                            "addressee": { "type": "cds.String" }
                        }
                    },
                    "author_ID": { "type": "cds.Integer", "@odata.foreignKey4": "author" },
                    "author": {
                        "type": "cds.Association",
                        "target": "bookshop.Authors",
                        "keys": [{ "ref": ["ID"] }]
                    },
                    "coAuthor": {
                        "type": "cds.Association",
                        "target": "bookshop.Authors",
                        "keys": [{ "ref": ["ID"], "as": "key" }]
                    },
                    "genre": {
                        "type": "cds.Association",
                        "target": "bookshop.Genres",
                        "keys": [{ "ref": ["ID"] }]
                    },
                    "image": { "type": "cds.LargeBinary", "virtual": true },
                    "upload": {
                        "type": "cds.Association",
                        "target": "bookshop.Uploads",
                        "keys": [{ "ref": ["ID"] }]
                    }
                }
            },
            "localized.bookshop.Books": {
                "kind": "entity",
                "elements": {
                    "ID": { "key": true, "type": "cds.Integer" },
                    "title": { "type": "cds.String" },
                    "stock": { "type": "cds.Integer" },
                    "price": { "type": "cds.Decimal" },
                    "author": {
                        "type": "cds.Association",
                        "target": "bookshop.Authors",
                        "keys": [{ "ref": ["ID"] }]
                    }
                }
            },
            "bookshop.Authors": {
                "kind": "entity",
                "elements": {
                    "ID": { "key": true, "type": "cds.Integer" },
                    "name": { "type": "cds.String" },
                    "alive": { "type": "cds.Boolean" },
                    "address": {
                        "elements": {
                            "street": { "type": "cds.String" },
                            "city": { "type": "cds.String" }
                        }
                    },
                    "favorite": {
                        "type": "cds.Association",
                        "target": "bookshop.Genres",
                        "keys": [{ "ref": ["ID"] }]
                    },
                    "books": {
                        "type": "cds.Association",
                        "target": "bookshop.Books",
                        "cardinality": { "max": "*" },
                        "on": [{ "ref": ["books", "author"] }, "=", { "ref": ["$self"] }]
                    }
                }
            },
            "bookshop.Genres": {
                "kind": "entity",
                "elements": {
                    "ID": { "key": true, "type": "cds.Integer" },
                    "name": { "type": "cds.String" },
                    "parent": {
                        "type": "cds.Association",
                        "target": "bookshop.Genres",
                        "keys": [{ "ref": ["ID"] }]
                    },
                    "children": {
                        "type": "cds.Association",
                        "target": "bookshop.Genres",
                        "cardinality": { "max": "*" },
                        "on": [{ "ref": ["children", "parent"] }, "=", { "ref": ["$self"] }]
                    }
                }
            },
            "bookshop.Uploads": {
                "kind": "entity",
                "@cds.persistence.skip": true,
                "elements": {
                    "ID": { "key": true, "type": "cds.Integer" },
                    "url": { "type": "cds.String" }
                }
            }
        }
    }))
    .expect("fixture model parses")
}

/// Path names of a reference token.
pub fn ref_names(token: &Token) -> Vec<String> {
    match token {
        Token::Ref(r) => r.steps.iter().map(|s| s.name.clone()).collect(),
        other => panic!("expected a reference token, found {other:?}"),
    }
}

/// Path names of a reference column.
pub fn col_ref(col: &Column) -> Vec<String> {
    match &col.expr {
        ColumnExpr::Ref(r) => r.steps.iter().map(|s| s.name.clone()).collect(),
        other => panic!("expected a reference column, found {other:?}"),
    }
}

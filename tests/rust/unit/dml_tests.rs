//! Non-SELECT kinds: INSERT/UPSERT target normalization, UPDATE/DELETE
//! from/where rewrites, STREAM pass-through.

use serde_json::json;
use sqlshape::cqn::{Delete, FromRef, Insert, Query, Step, Stream, Token, Update};
use sqlshape::rewrite;

use super::fixtures::{bookshop, ref_names};

#[test]
fn insert_into_is_normalized_to_single_step() {
    let model = bookshop();
    let insert = Insert {
        into: FromRef::path(&["bookshop.Authors", "books"]).with_alias("b"),
        columns: None,
        entries: Some(json!([{ "title": "Kafka on the Shore" }])),
        rows: None,
        values: None,
    };
    let out = rewrite(Query::Insert(insert), &model).unwrap();
    let Query::Insert(insert) = out else {
        panic!("kind changed");
    };
    assert_eq!(insert.into.steps.len(), 1);
    assert_eq!(insert.into.steps[0].name, "bookshop.Books");
    assert_eq!(insert.into.alias.as_deref(), Some("b"));
    // The payload passes through untouched.
    assert_eq!(
        insert.entries,
        Some(json!([{ "title": "Kafka on the Shore" }]))
    );
}

#[test]
fn upsert_shares_insert_normalization() {
    let model = bookshop();
    let upsert = Insert {
        into: FromRef::entity("bookshop.Books"),
        columns: Some(vec!["ID".to_string(), "title".to_string()]),
        entries: None,
        rows: Some(json!([[1, "t"]])),
        values: None,
    };
    let out = rewrite(Query::Upsert(upsert), &model).unwrap();
    let Query::Upsert(upsert) = out else {
        panic!("kind changed");
    };
    assert_eq!(upsert.into.steps[0].name, "bookshop.Books");
}

#[test]
fn update_rewrites_where_and_values() {
    let model = bookshop();
    let update = Update {
        entity: FromRef::entity("bookshop.Books"),
        with: vec![(
            "stock".to_string(),
            Token::xpr(vec![Token::ref_(&["stock"]), Token::kw("-"), Token::int(1)]),
        )],
        where_: Some(vec![
            Token::ref_(&["author", "ID"]),
            Token::kw("="),
            Token::int(4711),
        ]),
    };
    let out = rewrite(Query::Update(update), &model).unwrap();
    let Query::Update(update) = out else {
        panic!("kind changed");
    };
    assert_eq!(update.entity.steps[0].name, "bookshop.Books");
    assert_eq!(update.entity.alias.as_deref(), Some("Books"));
    let where_ = update.where_.as_ref().unwrap();
    // Foreign-key access flattens without a join.
    assert_eq!(ref_names(&where_[0]), ["Books", "author_ID"]);
    let Token::Xpr { xpr } = &update.with[0].1 else {
        panic!("expected the rewritten value expression");
    };
    assert_eq!(ref_names(&xpr[0]), ["Books", "stock"]);
}

#[test]
fn delete_with_path_expression_target() {
    let model = bookshop();
    let delete = Delete {
        from: FromRef::path(&["bookshop.Authors", "books"]),
        where_: None,
    };
    let out = rewrite(Query::Delete(delete), &model).unwrap();
    let Query::Delete(delete) = out else {
        panic!("kind changed");
    };
    assert_eq!(delete.from.steps[0].name, "bookshop.Books");
    assert_eq!(delete.from.alias.as_deref(), Some("books"));
    // Traversal pushed into where as an exists chain.
    let where_ = delete.where_.as_ref().unwrap();
    assert!(where_[0].is_kw("exists"));
    let Token::Select { select: sub } = &where_[1] else {
        panic!("expected the chain subquery");
    };
    let sub_where = sub.where_.as_ref().unwrap();
    assert_eq!(ref_names(&sub_where[0]), ["Authors", "ID"]);
    assert_eq!(ref_names(&sub_where[2]), ["books", "author_ID"]);
}

#[test]
fn delete_with_filtered_target() {
    let model = bookshop();
    let delete = Delete {
        from: FromRef {
            steps: vec![Step::filtered(
                "bookshop.Books",
                vec![Token::ref_(&["stock"]), Token::kw("="), Token::int(0)],
            )],
            alias: None,
            resolved: None,
        },
        where_: None,
    };
    let out = rewrite(Query::Delete(delete), &model).unwrap();
    let Query::Delete(delete) = out else {
        panic!("kind changed");
    };
    let where_ = delete.where_.as_ref().unwrap();
    assert_eq!(ref_names(&where_[0]), ["Books", "stock"]);
}

#[test]
fn stream_threads_through_shared_rewrites() {
    let model = bookshop();
    let stream = Stream {
        from: FromRef::entity("bookshop.Books"),
        column: Some("image".to_string()),
        where_: Some(vec![Token::ref_(&["ID"]), Token::kw("="), Token::int(1)]),
    };
    let out = rewrite(Query::Stream(stream), &model).unwrap();
    let Query::Stream(stream) = out else {
        panic!("kind changed");
    };
    assert_eq!(stream.from.steps[0].name, "bookshop.Books");
    assert_eq!(stream.column.as_deref(), Some("image"));
    let where_ = stream.where_.as_ref().unwrap();
    assert_eq!(ref_names(&where_[0]), ["Books", "ID"]);
}

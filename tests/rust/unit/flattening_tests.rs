//! Column flattening: plain references, structured leaves, foreign keys,
//! wildcard expansion, localization.

use sqlshape::cqn::{Column, ColumnExpr, From, Query, Select};
use sqlshape::inference::InferenceError;
use sqlshape::{rewrite, RewriteError};

use super::fixtures::{bookshop, col_ref};

fn select_books(columns: Vec<Column>) -> Query {
    Query::select(Select::from_entity("bookshop.Books").with_columns(columns))
}

#[test]
fn plain_column_gets_table_alias() {
    let model = bookshop();
    let out = rewrite(select_books(vec![Column::ref_(&["title"])]), &model).unwrap();
    let sel = out.as_select().unwrap();

    match &sel.from {
        From::Ref(fr) => {
            assert_eq!(fr.steps.len(), 1);
            assert_eq!(fr.steps[0].name, "bookshop.Books");
            assert_eq!(fr.alias.as_deref(), Some("Books"));
        }
        other => panic!("expected a single-ref from, found {other:?}"),
    }
    let columns = sel.columns.as_ref().unwrap();
    assert_eq!(columns.len(), 1);
    assert_eq!(col_ref(&columns[0]), ["Books", "title"]);
}

#[test]
fn structured_reference_flattens_to_leaves() {
    let model = bookshop();
    let out = rewrite(select_books(vec![Column::ref_(&["dedication"])]), &model).unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    assert_eq!(columns.len(), 2);
    assert_eq!(col_ref(&columns[0]), ["Books", "dedication_text"]);
    assert_eq!(col_ref(&columns[1]), ["Books", "dedication_addressee"]);
}

#[test]
fn structured_reference_with_alias_renames_leaves() {
    let model = bookshop();
    let out = rewrite(
        select_books(vec![Column::ref_(&["dedication"]).with_alias("d")]),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    assert_eq!(columns[0].alias.as_deref(), Some("d_text"));
    assert_eq!(columns[1].alias.as_deref(), Some("d_addressee"));
}

#[test]
fn structured_leaf_path_resolves_directly() {
    let model = bookshop();
    let out = rewrite(
        select_books(vec![Column::ref_(&["dedication", "text"])]),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    assert_eq!(col_ref(&columns[0]), ["Books", "dedication_text"]);
}

#[test]
fn managed_association_flattens_to_foreign_keys() {
    let model = bookshop();
    let out = rewrite(select_books(vec![Column::ref_(&["author"])]), &model).unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    assert_eq!(columns.len(), 1);
    assert_eq!(col_ref(&columns[0]), ["Books", "author_ID"]);
}

#[test]
fn foreign_key_access_needs_no_join() {
    let model = bookshop();
    let out = rewrite(select_books(vec![Column::ref_(&["author", "ID"])]), &model).unwrap();
    let sel = out.as_select().unwrap();
    // Foreign-key-only: the from clause stays a single source.
    assert!(matches!(sel.from, From::Ref(_)));
    let columns = sel.columns.as_ref().unwrap();
    assert_eq!(col_ref(&columns[0]), ["Books", "author_ID"]);
}

#[test]
fn renamed_foreign_key_uses_physical_column() {
    let model = bookshop();
    let out = rewrite(
        select_books(vec![Column::ref_(&["coAuthor", "ID"])]),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    assert_eq!(col_ref(&columns[0]), ["Books", "coAuthor_key"]);
}

#[test]
fn wildcard_expands_in_declaration_order() {
    let model = bookshop();
    let out = rewrite(select_books(vec![Column::star()]), &model).unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    let flat: Vec<Vec<String>> = columns.iter().map(col_ref).collect();
    assert_eq!(
        flat,
        vec![
            vec!["Books".to_string(), "ID".to_string()],
            vec!["Books".to_string(), "title".to_string()],
            vec!["Books".to_string(), "stock".to_string()],
            vec!["Books".to_string(), "price".to_string()],
            vec!["Books".to_string(), "dedication_text".to_string()],
            vec!["Books".to_string(), "dedication_addressee".to_string()],
            // author_ID mirror skipped; the association contributes the
            // foreign key instead. The virtual image is dropped, the
            // non-persisted upload association still has a physical key.
            vec!["Books".to_string(), "author_ID".to_string()],
            vec!["Books".to_string(), "coAuthor_key".to_string()],
            vec!["Books".to_string(), "genre_ID".to_string()],
            vec!["Books".to_string(), "upload_ID".to_string()],
        ]
    );
}

#[test]
fn implicit_select_is_a_wildcard() {
    let model = bookshop();
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Genres")),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    let flat: Vec<Vec<String>> = columns.iter().map(col_ref).collect();
    assert_eq!(
        flat,
        vec![
            vec!["Genres".to_string(), "ID".to_string()],
            vec!["Genres".to_string(), "name".to_string()],
            vec!["Genres".to_string(), "parent_ID".to_string()],
        ]
    );
}

#[test]
fn wildcard_respects_excluding() {
    let model = bookshop();
    let mut select = Select::from_entity("bookshop.Genres").with_columns(vec![Column::star()]);
    select.excluding = Some(vec!["name".to_string(), "parent".to_string()]);
    let out = rewrite(Query::select(select), &model).unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    assert_eq!(columns.len(), 1);
    assert_eq!(col_ref(&columns[0]), ["Genres", "ID"]);
}

#[test]
fn column_after_wildcard_replaces_in_place() {
    let model = bookshop();
    let replacement = Column::ref_(&["name"]).with_cast("cds.LargeString");
    let out = rewrite(
        Query::select(
            Select::from_entity("bookshop.Genres")
                .with_columns(vec![Column::star(), replacement]),
        ),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    // Still three columns, with the replacement at the wildcard position.
    assert_eq!(columns.len(), 3);
    assert_eq!(col_ref(&columns[1]), ["Genres", "name"]);
    assert_eq!(columns[1].cast.as_deref(), Some("cds.LargeString"));
}

#[test]
fn explicit_column_before_wildcard_suppresses_entry() {
    let model = bookshop();
    let out = rewrite(
        Query::select(
            Select::from_entity("bookshop.Genres")
                .with_columns(vec![Column::ref_(&["name"]), Column::star()]),
        ),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    let flat: Vec<Vec<String>> = columns.iter().map(col_ref).collect();
    assert_eq!(
        flat,
        vec![
            vec!["Genres".to_string(), "name".to_string()],
            vec!["Genres".to_string(), "ID".to_string()],
            vec!["Genres".to_string(), "parent_ID".to_string()],
        ]
    );
}

#[test]
fn inline_produces_prefixed_siblings() {
    let model = bookshop();
    let out = rewrite(
        select_books(vec![Column::ref_(&["dedication"]).with_inline(vec![
            Column::ref_(&["text"]),
        ])]),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    assert_eq!(columns.len(), 1);
    assert_eq!(col_ref(&columns[0]), ["Books", "dedication_text"]);
    assert_eq!(columns[0].alias.as_deref(), Some("dedication_text"));
}

#[test]
fn localized_query_reads_localized_view() {
    let model = bookshop();
    let mut select = Select::from_entity("bookshop.Books")
        .with_columns(vec![Column::ref_(&["title"])]);
    select.localized = true;
    let out = rewrite(Query::select(select), &model).unwrap();
    match &out.as_select().unwrap().from {
        From::Ref(fr) => assert_eq!(fr.steps[0].name, "localized.bookshop.Books"),
        other => panic!("expected a single-ref from, found {other:?}"),
    }
}

#[test]
fn cast_overrides_inferred_type() {
    let model = bookshop();
    let out = rewrite(
        select_books(vec![Column::ref_(&["stock"]).with_cast("cds.String")]),
        &model,
    )
    .unwrap();
    let sel = out.as_select().unwrap();
    assert_eq!(sel.columns.as_ref().unwrap()[0].cast.as_deref(), Some("cds.String"));
    let inferred = sel.inferred.as_ref().unwrap();
    let element = inferred.elements.get("stock").unwrap();
    assert_eq!(element.effective_type(), Some("cds.String"));
}

#[test]
fn virtual_only_projection_is_rejected() {
    let model = bookshop();
    let err = rewrite(select_books(vec![Column::ref_(&["image"])]), &model).unwrap_err();
    assert_eq!(err, RewriteError::EmptyProjection);
}

#[test]
fn unknown_name_is_reported_with_path() {
    let model = bookshop();
    let err = rewrite(select_books(vec![Column::ref_(&["titel"])]), &model).unwrap_err();
    assert_eq!(
        err,
        RewriteError::Inference(InferenceError::UnknownName("titel".to_string()))
    );
}

#[test]
fn duplicate_output_names_are_rejected() {
    let model = bookshop();
    let err = rewrite(
        select_books(vec![
            Column::ref_(&["title"]),
            Column::ref_(&["stock"]).with_alias("title"),
        ]),
        &model,
    )
    .unwrap_err();
    assert_eq!(
        err,
        RewriteError::Inference(InferenceError::DuplicateElement("title".to_string()))
    );
}

#[test]
fn expression_column_requires_alias() {
    let model = bookshop();
    let err = rewrite(
        select_books(vec![Column::val(sqlshape::cqn::Literal::Integer(1))]),
        &model,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        RewriteError::Inference(InferenceError::ExpectingAlias(_))
    ));
}

#[test]
fn selecting_unmanaged_association_is_rejected() {
    let model = bookshop();
    let out = rewrite(
        Query::select(
            Select::from_entity("bookshop.Authors").with_columns(vec![Column::ref_(&["books"])]),
        ),
        &model,
    );
    assert_eq!(
        out.unwrap_err(),
        RewriteError::Inference(InferenceError::UnmanagedSelection("books".to_string()))
    );
}

#[test]
fn column_expr_shapes_survive() {
    let model = bookshop();
    let out = rewrite(
        select_books(vec![
            Column::val(sqlshape::cqn::Literal::String("x".into())).with_alias("tag"),
            Column::func("count", vec![sqlshape::cqn::Token::ref_(&["ID"])]).with_alias("n"),
        ]),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    assert!(matches!(columns[0].expr, ColumnExpr::Val(_)));
    match &columns[1].expr {
        ColumnExpr::Func(f) => {
            assert_eq!(f.func, "count");
            assert_eq!(super::fixtures::ref_names(&f.args[0]), ["Books", "ID"]);
        }
        other => panic!("expected a function column, found {other:?}"),
    }
}

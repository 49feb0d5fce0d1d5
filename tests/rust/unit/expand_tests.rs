//! Nested projections over associations: correlated expansion subqueries.

use sqlshape::cqn::{Column, ColumnExpr, From, Literal, Query, Select, Step, Token};
use sqlshape::inference::InferredKind;
use sqlshape::rewrite;

use super::fixtures::{bookshop, col_ref, ref_names};

#[test]
fn expand_to_many_becomes_correlated_subquery() {
    let model = bookshop();
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Authors").with_columns(vec![
            Column::ref_(&["books"]).with_expand(vec![Column::ref_(&["title"])]),
        ])),
        &model,
    )
    .unwrap();
    let sel = out.as_select().unwrap();
    let columns = sel.columns.as_ref().unwrap();
    assert_eq!(columns.len(), 1);
    assert_eq!(columns[0].alias.as_deref(), Some("books"));

    let ColumnExpr::Select(sub) = &columns[0].expr else {
        panic!("expected an expansion subquery, found {:?}", columns[0].expr);
    };
    assert!(sub.expand);
    assert!(!sub.one);
    match &sub.from {
        From::Ref(fr) => {
            assert_eq!(fr.steps[0].name, "bookshop.Books");
            assert_eq!(fr.alias.as_deref(), Some("books"));
        }
        other => panic!("unexpected subquery source {other:?}"),
    }
    let sub_columns = sub.columns.as_ref().unwrap();
    assert_eq!(col_ref(&sub_columns[0]), ["books", "title"]);

    // Correlation back to the outer alias.
    let sub_where = sub.where_.as_ref().unwrap();
    assert_eq!(ref_names(&sub_where[0]), ["Authors", "ID"]);
    assert!(sub_where[1].is_kw("="));
    assert_eq!(ref_names(&sub_where[2]), ["books", "author_ID"]);
}

#[test]
fn expand_to_one_sets_one_flag() {
    let model = bookshop();
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Books").with_columns(vec![
            Column::ref_(&["author"]).with_expand(vec![Column::ref_(&["name"])]),
        ])),
        &model,
    )
    .unwrap();
    let sel = out.as_select().unwrap();
    let ColumnExpr::Select(sub) = &sel.columns.as_ref().unwrap()[0].expr else {
        panic!("expected an expansion subquery");
    };
    assert!(sub.one);
    let sub_where = sub.where_.as_ref().unwrap();
    assert_eq!(ref_names(&sub_where[0]), ["author", "ID"]);
    assert_eq!(ref_names(&sub_where[2]), ["Books", "author_ID"]);
}

#[test]
fn expand_with_filter_keeps_filter_inside() {
    let model = bookshop();
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Authors").with_columns(vec![
            Column::ref_steps(vec![Step::filtered(
                "books",
                vec![Token::ref_(&["stock"]), Token::kw(">"), Token::int(0)],
            )])
            .with_expand(vec![Column::ref_(&["title"])]),
        ])),
        &model,
    )
    .unwrap();
    let sel = out.as_select().unwrap();
    let ColumnExpr::Select(sub) = &sel.columns.as_ref().unwrap()[0].expr else {
        panic!("expected an expansion subquery");
    };
    let sub_where = sub.where_.as_ref().unwrap();
    assert!(sub_where
        .iter()
        .any(|t| matches!(t, Token::Ref(r) if r.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>() == vec!["books", "stock"])));
    assert!(sub_where
        .iter()
        .any(|t| matches!(t, Token::Ref(r) if r.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>() == vec!["Authors", "ID"])));
}

#[test]
fn expand_carries_limit_and_order() {
    let model = bookshop();
    let mut expand_col =
        Column::ref_(&["books"]).with_expand(vec![Column::ref_(&["title"])]);
    expand_col.order_by = Some(vec![sqlshape::cqn::OrderByItem::by_ref(&["title"]).desc()]);
    expand_col.limit = Some(sqlshape::cqn::Limit {
        rows: Some(Token::int(5)),
        offset: None,
    });
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Authors").with_columns(vec![expand_col])),
        &model,
    )
    .unwrap();
    let ColumnExpr::Select(sub) = &out.as_select().unwrap().columns.as_ref().unwrap()[0].expr
    else {
        panic!("expected an expansion subquery");
    };
    assert!(sub.limit.is_some());
    let order = sub.order_by.as_ref().unwrap();
    assert_eq!(ref_names(&order[0].token), ["books", "title"]);
    assert_eq!(order[0].sort, Some(sqlshape::cqn::SortOrder::Desc));
}

#[test]
fn nested_expand_recurses() {
    let model = bookshop();
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Authors").with_columns(vec![
            Column::ref_(&["books"]).with_expand(vec![
                Column::ref_(&["title"]),
                Column::ref_(&["genre"]).with_expand(vec![Column::ref_(&["name"])]),
            ]),
        ])),
        &model,
    )
    .unwrap();
    let ColumnExpr::Select(books_sub) = &out.as_select().unwrap().columns.as_ref().unwrap()[0].expr
    else {
        panic!("expected an expansion subquery");
    };
    let inner_cols = books_sub.columns.as_ref().unwrap();
    assert_eq!(col_ref(&inner_cols[0]), ["books", "title"]);
    let ColumnExpr::Select(genre_sub) = &inner_cols[1].expr else {
        panic!("expected a nested expansion, found {:?}", inner_cols[1].expr);
    };
    assert!(genre_sub.one);
    let genre_where = genre_sub.where_.as_ref().unwrap();
    assert_eq!(ref_names(&genre_where[0]), ["genre", "ID"]);
    assert_eq!(ref_names(&genre_where[2]), ["books", "genre_ID"]);
}

#[test]
fn expand_over_skipped_entity_is_omitted() {
    let model = bookshop();
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Books").with_columns(vec![
            Column::ref_(&["title"]),
            Column::ref_(&["upload"]).with_expand(vec![Column::ref_(&["url"])]),
        ])),
        &model,
    )
    .unwrap();
    let sel = out.as_select().unwrap();
    // Only the title survives as a column …
    assert_eq!(sel.columns.as_ref().unwrap().len(), 1);
    // … and the element map records the skipped expansion.
    let element = sel
        .inferred
        .as_ref()
        .unwrap()
        .elements
        .get("upload")
        .unwrap();
    assert_eq!(
        element.kind,
        InferredKind::Expanded {
            one: true,
            skipped: true
        }
    );
}

#[test]
fn expand_over_struct_flattens_like_inline() {
    let model = bookshop();
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Books").with_columns(vec![
            Column::ref_(&["dedication"]).with_expand(vec![Column::ref_(&["addressee"])]),
        ])),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    assert_eq!(columns.len(), 1);
    assert_eq!(col_ref(&columns[0]), ["Books", "dedication_addressee"]);
}

#[test]
fn expand_alias_does_not_collide_with_exists_alias() {
    let model = bookshop();
    // The exists predicate grabs "books" first; the expansion must pick a
    // fresh alias for its own table and correlate with it.
    let out = rewrite(
        Query::select(
            Select::from_entity("bookshop.Authors")
                .with_columns(vec![
                    Column::ref_(&["books"]).with_expand(vec![Column::ref_(&["title"])]),
                ])
                .with_where(vec![Token::kw("exists"), Token::ref_(&["books"])]),
        ),
        &model,
    )
    .unwrap();
    let ColumnExpr::Select(sub) = &out.as_select().unwrap().columns.as_ref().unwrap()[0].expr
    else {
        panic!("expected an expansion subquery");
    };
    match &sub.from {
        From::Ref(fr) => assert_eq!(fr.alias.as_deref(), Some("books2")),
        other => panic!("unexpected subquery source {other:?}"),
    }
    let sub_where = sub.where_.as_ref().unwrap();
    assert_eq!(ref_names(&sub_where[0]), ["Authors", "ID"]);
    assert_eq!(ref_names(&sub_where[2]), ["books2", "author_ID"]);
}

#[test]
fn one_flag_survives_on_scalar_expand_subquery() {
    let model = bookshop();
    let sub = Select {
        from: From::Ref(sqlshape::cqn::FromRef::entity("bookshop.Genres")),
        columns: Some(vec![Column::ref_(&["name"])]),
        one: true,
        ..Select::default()
    };
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Books").with_columns(vec![
            Column::subquery(sub).with_alias("topGenre"),
            Column::val(Literal::Integer(1)).with_alias("tag"),
        ])),
        &model,
    )
    .unwrap();
    let columns = out.as_select().unwrap().columns.clone().unwrap();
    let ColumnExpr::Select(inner) = &columns[0].expr else {
        panic!("expected a subquery column");
    };
    assert!(inner.one);
    assert_eq!(col_ref(&inner.columns.as_ref().unwrap()[0]), ["Genres", "name"]);
}

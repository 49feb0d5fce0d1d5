//! Universal properties: determinism, reference closure, alias uniqueness,
//! no surviving association traversals, annotation preservation.

use std::collections::HashSet;

use serde_json::json;
use sqlshape::cqn::{Column, ColumnExpr, From, Query, Select, Token};
use sqlshape::rewrite;

use super::fixtures::bookshop;

fn complex_query() -> Query {
    Query::select(
        Select::from_entity("bookshop.Books")
            .with_columns(vec![
                Column::ref_(&["title"]),
                Column::ref_(&["author", "name"]),
                Column::ref_(&["dedication"]),
                Column::ref_(&["author"]),
                Column::ref_(&["genre"]).with_expand(vec![Column::ref_(&["name"])]),
            ])
            .with_where(vec![
                Token::ref_(&["author", "address", "city"]),
                Token::kw("="),
                Token::string("Prague"),
                Token::kw("and"),
                Token::kw("exists"),
                Token::ref_(&["genre"]),
            ]),
    )
}

#[test]
fn rewrite_is_deterministic() {
    let model = bookshop();
    let a = rewrite(complex_query(), &model).unwrap();
    let b = rewrite(complex_query(), &model).unwrap();
    assert_eq!(a, b);
}

/// Every ref in the output is length 1 (a source in from) or length 2 with
/// its first segment naming an alias of the enclosing from.
#[test]
fn reference_closure_holds() {
    let model = bookshop();
    let out = rewrite(complex_query(), &model).unwrap();
    let sel = out.as_select().unwrap();
    let aliases = collect_from_aliases(&sel.from);
    for col in sel.columns.as_ref().unwrap() {
        check_column(col, &aliases);
    }
    if let Some(where_) = &sel.where_ {
        for token in where_ {
            check_token(token, &aliases);
        }
    }
}

fn collect_from_aliases(from: &From) -> HashSet<String> {
    let mut out = HashSet::new();
    collect_aliases_into(from, &mut out);
    out
}

fn collect_aliases_into(from: &From, out: &mut HashSet<String>) {
    match from {
        From::Ref(fr) => {
            if let Some(alias) = &fr.alias {
                out.insert(alias.clone());
            } else if let Some(step) = fr.steps.last() {
                out.insert(step.name.rsplit('.').next().unwrap().to_string());
            }
        }
        From::Join(join) => {
            for arg in &join.args {
                collect_aliases_into(arg, out);
            }
        }
        From::Select(fs) => {
            if let Some(alias) = &fs.alias {
                out.insert(alias.clone());
            }
        }
    }
}

fn check_column(col: &Column, aliases: &HashSet<String>) {
    match &col.expr {
        ColumnExpr::Ref(r) => {
            assert_eq!(r.steps.len(), 2, "flat column has alias + name: {r:?}");
            assert!(
                aliases.contains(&r.steps[0].name),
                "column alias '{}' not in from aliases {aliases:?}",
                r.steps[0].name
            );
        }
        ColumnExpr::Select(sub) => {
            // Correlated subqueries may additionally reference the outer
            // aliases.
            let mut inner = collect_from_aliases(&sub.from);
            inner.extend(aliases.iter().cloned());
            for c in sub.columns.as_ref().unwrap() {
                check_column(c, &inner);
            }
            if let Some(where_) = &sub.where_ {
                for t in where_ {
                    check_token(t, &inner);
                }
            }
        }
        _ => {}
    }
}

fn check_token(token: &Token, aliases: &HashSet<String>) {
    match token {
        Token::Ref(r) => {
            if r.steps[0].name.starts_with('$') {
                return;
            }
            assert_eq!(r.steps.len(), 2, "flat ref has alias + name: {r:?}");
            assert!(
                aliases.contains(&r.steps[0].name),
                "ref alias '{}' not in scope {aliases:?}",
                r.steps[0].name
            );
        }
        Token::Xpr { xpr } => {
            for t in xpr {
                check_token(t, aliases);
            }
        }
        Token::List { list } => {
            for t in list {
                check_token(t, aliases);
            }
        }
        Token::Func(f) => {
            for t in &f.args {
                check_token(t, aliases);
            }
        }
        Token::Select { select } => {
            let mut inner = collect_from_aliases(&select.from);
            inner.extend(aliases.iter().cloned());
            if let Some(where_) = &select.where_ {
                for t in where_ {
                    check_token(t, &inner);
                }
            }
        }
        _ => {}
    }
}

#[test]
fn aliases_are_pairwise_distinct() {
    let model = bookshop();
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Genres").with_columns(vec![
            Column::ref_(&["parent", "name"]).with_alias("p1"),
            Column::ref_(&["parent", "parent", "name"]).with_alias("p2"),
        ])),
        &model,
    )
    .unwrap();
    let sel = out.as_select().unwrap();
    let mut seen = HashSet::new();
    let mut stack = vec![&sel.from];
    while let Some(from) = stack.pop() {
        match from {
            From::Ref(fr) => {
                let alias = fr.alias.clone().unwrap();
                assert!(seen.insert(alias.clone()), "duplicate alias '{alias}'");
            }
            From::Join(join) => stack.extend(join.args.iter()),
            From::Select(_) => {}
        }
    }
    // Self-join of Genres: base + two distinct parent hops.
    assert_eq!(seen.len(), 3);
    let columns = sel.columns.as_ref().unwrap();
    let c1 = super::fixtures::col_ref(&columns[0]);
    let c2 = super::fixtures::col_ref(&columns[1]);
    assert_eq!(c1[1], "name");
    assert_eq!(c2[1], "name");
    assert_ne!(c1[0], c2[0], "distinct hops read from distinct aliases");
}

/// No ref in the output crosses more than one step; associations are gone.
#[test]
fn no_surviving_association_traversals() {
    let model = bookshop();
    let out = rewrite(complex_query(), &model).unwrap();
    let sel = out.as_select().unwrap();
    for col in sel.columns.as_ref().unwrap() {
        if let ColumnExpr::Ref(r) = &col.expr {
            assert!(r.steps.len() <= 2);
            assert_ne!(r.steps.last().unwrap().name, "author");
            assert_ne!(r.steps.last().unwrap().name, "genre");
        }
    }
}

#[test]
fn annotations_propagate_to_elements() {
    let model = bookshop();
    let mut col = Column::ref_(&["title"]);
    col.annotations.insert("@UI.Hidden".to_string(), json!(true));
    let out = rewrite(
        Query::select(Select::from_entity("bookshop.Books").with_columns(vec![col])),
        &model,
    )
    .unwrap();
    let elements = &out.as_select().unwrap().inferred.as_ref().unwrap().elements;
    assert_eq!(
        elements.get("title").unwrap().annotations.get("@UI.Hidden"),
        Some(&json!(true))
    );
}

#[test]
fn already_flat_query_is_a_fixed_point() {
    let model = bookshop();
    let flat = Query::select(
        Select::from_entity("bookshop.Books")
            .with_columns(vec![Column::ref_(&["Books", "title"])])
            .with_where(vec![
                Token::ref_(&["Books", "stock"]),
                Token::kw(">"),
                Token::int(0),
            ]),
    );
    let once = rewrite(flat, &model).unwrap();
    let twice = rewrite(once.clone(), &model).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn inferred_metadata_is_exposed() {
    let model = bookshop();
    let out = rewrite(complex_query(), &model).unwrap();
    let inferred = out.as_select().unwrap().inferred.as_ref().unwrap();
    assert_eq!(inferred.sources.len(), 1);
    assert_eq!(inferred.sources[0].alias, "Books");
    assert_eq!(inferred.target.as_deref(), Some("bookshop.Books"));
    assert!(!inferred.join_tree.is_initial());
    assert!(inferred.elements.len() > 0);
}

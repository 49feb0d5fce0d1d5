pub mod ast;

pub use ast::{
    Column, ColumnExpr, Delete, From, FromRef, FromSelect, FuncCall, Insert, JoinFrom, JoinKind,
    Limit, Literal, NullsOrder, OrderByItem, Query, RefExpr, Select, SetOp, SortOrder, Step,
    Stream, Token, Update,
};
pub use ast::{ref_from_csn, token_from_csn};

//! CQN query AST
//!
//! Typed representation of the query object notation the normalizer consumes
//! and emits. Predicates (`where`, `having`, `on`, infix filters) are token
//! streams mixing keywords with operand nodes; everything else is a plain
//! clause struct per concept.
//!
//! Resolution metadata (`ResolvedRef`, `Inferred`) is attached in
//! non-serialized fields on the working copy during inference and consumed by
//! the rewriter; it never round-trips through serde.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::inference::{Inferred, ResolvedRef};

/// A complete query. Externally tagged, so the serde shape matches the CQN
/// convention of `{"SELECT": {…}}`, `{"UPDATE": {…}}`, etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    #[serde(rename = "SELECT")]
    Select(Box<Select>),
    #[serde(rename = "INSERT")]
    Insert(Insert),
    #[serde(rename = "UPSERT")]
    Upsert(Insert),
    #[serde(rename = "UPDATE")]
    Update(Update),
    #[serde(rename = "DELETE")]
    Delete(Delete),
    #[serde(rename = "STREAM")]
    Stream(Stream),
    /// Set operation (UNION and friends). Present only to be rejected.
    #[serde(rename = "SET")]
    Set(SetOp),
}

impl Query {
    pub fn select(select: Select) -> Self {
        Query::Select(Box::new(select))
    }

    pub fn as_select(&self) -> Option<&Select> {
        match self {
            Query::Select(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Select {
    pub from: From,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Column>>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<Vec<Token>>,
    #[serde(rename = "groupBy", skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<Token>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub having: Option<Vec<Token>>,
    #[serde(rename = "orderBy", skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Vec<OrderByItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<Token>>,
    /// Element names excluded from wildcard expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluding: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub distinct: bool,
    /// Expansion subquery returning at most one row.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub one: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub localized: bool,
    /// Marks a correlated expansion subquery in the flat output.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub expand: bool,
    /// Inference by-products; populated by the normalizer.
    #[serde(skip)]
    pub inferred: Option<Inferred>,
}

impl Select {
    /// SELECT * from a single entity.
    pub fn from_entity(name: &str) -> Self {
        Select {
            from: From::Ref(FromRef::entity(name)),
            ..Select::default()
        }
    }

    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn with_where(mut self, tokens: Vec<Token>) -> Self {
        self.where_ = Some(tokens);
        self
    }
}

// ---------------------------------------------------------------------------
// FROM
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum From {
    Ref(FromRef),
    Join(Box<JoinFrom>),
    Select(Box<FromSelect>),
}

impl Default for From {
    fn default() -> Self {
        From::Ref(FromRef {
            steps: vec![],
            alias: None,
            resolved: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromRef {
    #[serde(rename = "ref")]
    pub steps: Vec<Step>,
    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip)]
    pub resolved: Option<ResolvedRef>,
}

impl FromRef {
    pub fn entity(name: &str) -> Self {
        FromRef {
            steps: vec![Step::plain(name)],
            alias: None,
            resolved: None,
        }
    }

    pub fn path(names: &[&str]) -> Self {
        FromRef {
            steps: names.iter().map(|n| Step::plain(n)).collect(),
            alias: None,
            resolved: None,
        }
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        FromRef {
            steps,
            alias: None,
            resolved: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }
}

/// One step of a reference path, optionally with an infix filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<Token>>,
}

impl Step {
    pub fn plain(name: &str) -> Self {
        Step {
            name: name.to_string(),
            filter: None,
        }
    }

    pub fn filtered(name: &str, filter: Vec<Token>) -> Self {
        Step {
            name: name.to_string(),
            filter: Some(filter),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Left,
    Right,
    Inner,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinFrom {
    pub join: JoinKind,
    pub args: Vec<From>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromSelect {
    #[serde(rename = "SELECT")]
    pub select: Select,
    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub expr: ColumnExpr,
    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Explicit type override, e.g. `cast(… as cds.String)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cast: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub key: bool,
    /// Nested projection over an association (subquery) or a structured
    /// element (flattened in place).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expand: Option<Vec<Column>>,
    /// Nested projection flattened into sibling columns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline: Option<Vec<Column>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluding: Vec<String>,
    /// Decorations carried onto an expansion subquery.
    #[serde(rename = "orderBy", skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Vec<OrderByItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
    /// `@…` annotations; propagated onto the inferred element.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub annotations: JsonMap<String, Value>,
}

impl Column {
    fn of(expr: ColumnExpr) -> Self {
        Column {
            expr,
            alias: None,
            cast: None,
            key: false,
            expand: None,
            inline: None,
            excluding: vec![],
            order_by: None,
            limit: None,
            annotations: JsonMap::new(),
        }
    }

    pub fn star() -> Self {
        Column::of(ColumnExpr::Star)
    }

    pub fn ref_(path: &[&str]) -> Self {
        Column::of(ColumnExpr::Ref(RefExpr::from_path(path)))
    }

    pub fn ref_steps(steps: Vec<Step>) -> Self {
        Column::of(ColumnExpr::Ref(RefExpr { steps, resolved: None }))
    }

    pub fn val(val: Literal) -> Self {
        Column::of(ColumnExpr::Val(val))
    }

    pub fn param(name: &str) -> Self {
        Column::of(ColumnExpr::Param(name.to_string()))
    }

    pub fn func(name: &str, args: Vec<Token>) -> Self {
        Column::of(ColumnExpr::Func(FuncCall {
            func: name.to_string(),
            args,
        }))
    }

    pub fn xpr(tokens: Vec<Token>) -> Self {
        Column::of(ColumnExpr::Xpr(tokens))
    }

    pub fn subquery(select: Select) -> Self {
        Column::of(ColumnExpr::Select(Box::new(select)))
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn with_cast(mut self, type_name: &str) -> Self {
        self.cast = Some(type_name.to_string());
        self
    }

    pub fn with_expand(mut self, body: Vec<Column>) -> Self {
        self.expand = Some(body);
        self
    }

    pub fn with_inline(mut self, body: Vec<Column>) -> Self {
        self.inline = Some(body);
        self
    }

    pub fn as_ref_expr(&self) -> Option<&RefExpr> {
        match &self.expr {
            ColumnExpr::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn ref_mut(&mut self) -> Option<&mut RefExpr> {
        match &mut self.expr {
            ColumnExpr::Ref(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnExpr {
    Star,
    Ref(RefExpr),
    Val(Literal),
    Param(String),
    Func(FuncCall),
    Xpr(Vec<Token>),
    Select(Box<Select>),
}

/// A reference path plus the resolution attached during inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefExpr {
    #[serde(rename = "ref")]
    pub steps: Vec<Step>,
    #[serde(skip)]
    pub resolved: Option<ResolvedRef>,
}

impl RefExpr {
    pub fn from_path(path: &[&str]) -> Self {
        RefExpr {
            steps: path.iter().map(|n| Step::plain(n)).collect(),
            resolved: None,
        }
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        RefExpr {
            steps,
            resolved: None,
        }
    }

    /// Flat SQL reference `[table alias, column]`.
    pub fn flat(alias: &str, column: &str) -> Self {
        RefExpr::from_path(&[alias, column])
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Dotted path for diagnostics.
    pub fn dotted(&self) -> String {
        self.names().join(".")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncCall {
    pub func: String,
    pub args: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl Literal {
    pub fn is_null(&self) -> bool {
        matches!(self, Literal::Null)
    }
}

// ---------------------------------------------------------------------------
// Token streams
// ---------------------------------------------------------------------------

/// One token of a predicate stream. Keywords and operators are `Kw`; operands
/// are tagged nodes, so the rewriter dispatches on the tag instead of
/// sniffing strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Token {
    Ref(RefExpr),
    Func(FuncCall),
    Select {
        #[serde(rename = "SELECT")]
        select: Box<Select>,
    },
    Xpr {
        xpr: Vec<Token>,
    },
    List {
        list: Vec<Token>,
    },
    Val {
        val: Literal,
    },
    Param {
        param: String,
    },
    Kw(String),
}

impl Token {
    pub fn kw(s: &str) -> Self {
        Token::Kw(s.to_string())
    }

    pub fn ref_(path: &[&str]) -> Self {
        Token::Ref(RefExpr::from_path(path))
    }

    pub fn val(val: Literal) -> Self {
        Token::Val { val }
    }

    pub fn string(s: &str) -> Self {
        Token::Val {
            val: Literal::String(s.to_string()),
        }
    }

    pub fn int(i: i64) -> Self {
        Token::Val {
            val: Literal::Integer(i),
        }
    }

    pub fn null() -> Self {
        Token::Val { val: Literal::Null }
    }

    pub fn param(name: &str) -> Self {
        Token::Param {
            param: name.to_string(),
        }
    }

    pub fn xpr(tokens: Vec<Token>) -> Self {
        Token::Xpr { xpr: tokens }
    }

    pub fn list(items: Vec<Token>) -> Self {
        Token::List { list: items }
    }

    pub fn func(name: &str, args: Vec<Token>) -> Self {
        Token::Func(FuncCall {
            func: name.to_string(),
            args,
        })
    }

    pub fn select(select: Select) -> Self {
        Token::Select {
            select: Box::new(select),
        }
    }

    /// Case-insensitive keyword test.
    pub fn is_kw(&self, word: &str) -> bool {
        match self {
            Token::Kw(k) => k.eq_ignore_ascii_case(word),
            _ => false,
        }
    }

    pub fn as_ref_expr(&self) -> Option<&RefExpr> {
        match self {
            Token::Ref(r) => Some(r),
            _ => None,
        }
    }
}

/// Parse one token of a CSN on-condition (`string`, `{ref}`, `{val}`,
/// `{xpr}`, `{func,args}`, `{list}`, `{param}`).
pub fn token_from_csn(value: &Value) -> Result<Token, String> {
    if let Some(s) = value.as_str() {
        return Ok(Token::kw(s));
    }
    let obj = value
        .as_object()
        .ok_or_else(|| format!("expecting string or object token, found {value}"))?;
    if let Some(r) = obj.get("ref") {
        return Ok(Token::Ref(ref_from_csn(r)?));
    }
    if let Some(v) = obj.get("val") {
        return Ok(Token::val(literal_from_csn(v)?));
    }
    if let Some(x) = obj.get("xpr") {
        let tokens = x
            .as_array()
            .ok_or_else(|| format!("xpr must be an array, found {x}"))?
            .iter()
            .map(token_from_csn)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Token::xpr(tokens));
    }
    if let Some(f) = obj.get("func") {
        let name = f
            .as_str()
            .ok_or_else(|| format!("func must be a string, found {f}"))?;
        let args = match obj.get("args") {
            Some(Value::Array(items)) => items
                .iter()
                .map(token_from_csn)
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![],
            Some(other) => return Err(format!("args must be an array, found {other}")),
        };
        return Ok(Token::func(name, args));
    }
    if let Some(l) = obj.get("list") {
        let items = l
            .as_array()
            .ok_or_else(|| format!("list must be an array, found {l}"))?
            .iter()
            .map(token_from_csn)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Token::list(items));
    }
    if let Some(p) = obj.get("param") {
        if let Some(name) = p.as_str() {
            return Ok(Token::param(name));
        }
        // `{ref: ['?'], param: true}` style
        if p.as_bool() == Some(true) {
            if let Some(r) = obj.get("ref").and_then(|r| r.as_array()) {
                if let Some(name) = r.first().and_then(|v| v.as_str()) {
                    return Ok(Token::param(name));
                }
            }
        }
        return Err(format!("malformed param token: {value}"));
    }
    Err(format!("unrecognized token: {value}"))
}

pub fn ref_from_csn(value: &Value) -> Result<RefExpr, String> {
    let items = value
        .as_array()
        .ok_or_else(|| format!("ref must be an array, found {value}"))?;
    let mut steps = Vec::with_capacity(items.len());
    for item in items {
        if let Some(name) = item.as_str() {
            steps.push(Step::plain(name));
        } else if let Some(obj) = item.as_object() {
            let name = obj
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| format!("ref step object needs an 'id': {item}"))?;
            let filter = match obj.get("where") {
                Some(Value::Array(tokens)) => Some(
                    tokens
                        .iter()
                        .map(token_from_csn)
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                None => None,
                Some(other) => return Err(format!("step filter must be an array, found {other}")),
            };
            steps.push(Step {
                name: name.to_string(),
                filter,
            });
        } else {
            return Err(format!("malformed ref step: {item}"));
        }
    }
    Ok(RefExpr {
        steps,
        resolved: None,
    })
}

fn literal_from_csn(value: &Value) -> Result<Literal, String> {
    Ok(match value {
        Value::Null => Literal::Null,
        Value::Bool(b) => Literal::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Literal::Integer(i)
            } else {
                Literal::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Literal::String(s.clone()),
        other => return Err(format!("unsupported literal: {other}")),
    })
}

// ---------------------------------------------------------------------------
// ORDER BY / LIMIT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByItem {
    pub token: Token,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nulls: Option<NullsOrder>,
}

impl OrderByItem {
    pub fn by_ref(path: &[&str]) -> Self {
        OrderByItem {
            token: Token::ref_(path),
            sort: None,
            nulls: None,
        }
    }

    pub fn desc(mut self) -> Self {
        self.sort = Some(SortOrder::Desc);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Limit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<Token>,
}

// ---------------------------------------------------------------------------
// DML
// ---------------------------------------------------------------------------

/// INSERT and UPSERT. The payload is opaque to normalization and passes
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insert {
    pub into: FromRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub entity: FromRef,
    /// Element name → value expression, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub with: Vec<(String, Token)>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<Vec<Token>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub from: FromRef,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<Vec<Token>>,
}

/// Vestigial STREAM kind; threads through the shared from/where rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub from: FromRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<Vec<Token>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetOp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default)]
    pub args: Vec<Query>,
}

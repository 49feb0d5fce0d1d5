use thiserror::Error;

use crate::inference::InferenceError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RewriteError {
    #[error("Set operations (UNION, INTERSECT, EXCEPT) are not supported.")]
    UnionNotSupported,

    #[error("Queries must have at least one non-virtual column in their projection.")]
    EmptyProjection,

    #[error("Can't compare structured operands with '{op}'; only (in)equality is supported for '{path}'.")]
    UnsupportedStructuralComparison { op: String, path: String },

    #[error("Can't compare '{left}' with '{right}': the operands differ in [{}].", unmatched.join(", "))]
    StructuralShapeMismatch {
        left: String,
        right: String,
        unmatched: Vec<String>,
    },

    #[error("Can't compare structured '{0}' with a value; only null is allowed.")]
    CannotCompareStructWithValue(String),

    #[error("Can't order by '{path}': it expands to {count} columns.")]
    AmbiguousOrderBy { path: String, count: usize },

    #[error("An association can't be used as a value in an expression: '{0}'.")]
    AssocInExpression(String),

    #[error("A structured element can't be used as a value in an expression: '{0}'.")]
    StructInExpression(String),

    #[error("Malformed on-condition: {0}")]
    MalformedOnCondition(String),

    #[error("Path expressions that require a join can't be used in a DML condition; use an exists predicate.")]
    JoinInDml,

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

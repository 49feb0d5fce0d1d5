use thiserror::Error;

use crate::model::ModelError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("'{0}' not found in the model or the query sources.")]
    UnknownName(String),

    #[error("'{name}' is ambiguous; qualify it as one of: {}.", candidates.join(", "))]
    AmbiguousName {
        name: String,
        candidates: Vec<String>,
    },

    #[error("A filter can only be provided for an association or an entity; '{step}' in '{path}' is neither.")]
    FilterOnNonAssoc { step: String, path: String },

    #[error("Unexpected unmanaged association '{assoc}' in filter expression of '{path}'.")]
    UnmanagedInInfixFilter { assoc: String, path: String },

    #[error("Only foreign keys of '{assoc}' can be accessed in an infix filter, but found '{path}'.")]
    NonFkInInfixFilter { assoc: String, path: String },

    #[error("A filter on '{path}' is only possible along an `exists` predicate or an expand.")]
    FilterWithoutNavigation { path: String },

    #[error("Duplicate alias '{0}' in the query sources.")]
    DuplicateAlias(String),

    #[error("Duplicate definition of element '{0}'.")]
    DuplicateElement(String),

    #[error("Ambiguous wildcard: select '{}' explicitly.", candidates.join("' or '"))]
    AmbiguousWildcard {
        name: String,
        candidates: Vec<String>,
    },

    #[error("Expecting 'as' alias for {0}.")]
    ExpectingAlias(String),

    #[error("An expand can only be provided for an association or a structured element; '{0}' is neither.")]
    ExpandOnScalar(String),

    #[error("Can't select unmanaged association '{0}'; use an expand or an exists predicate.")]
    UnmanagedSelection(String),

    #[error("Path step '{step}' of '{path}' must be an association.")]
    NonAssocInFromPath { step: String, path: String },

    #[error("Expecting an association path after 'exists', found '{0}'.")]
    ExistsRequiresAssociation(String),

    #[error("Navigation beyond foreign keys is not supported from the outer query in '{0}'.")]
    UnsupportedOuterNavigation(String),

    #[error(transparent)]
    Model(#[from] ModelError),
}

//! sqlshape - ER-aware query normalization
//!
//! This crate flattens object-graph queries (CQN) written against an
//! entity-relationship model (CSN) into SQL-shaped queries:
//! - Name resolution and join-relevance inference over the model
//! - Association traversals as left joins or correlated EXISTS subqueries
//! - Structured values decomposed into flat scalar columns
//! - Nested projections as correlated subqueries
//!
//! The core is pure and stateless: a query and a read-only model in, a
//! rewritten query out. Execution, transport and result shaping belong to
//! the callers.

pub mod cqn;
pub mod flatten;
pub mod inference;
pub mod model;

pub use cqn::Query;
pub use flatten::{
    rewrite, rewrite_with, DefaultSearch, RewriteError, RewriteOptions, SearchProvider,
};
pub use model::{Model, ModelError};

//! Dynamic query builder: filter trees validated against a descriptor, lowered to a backend-agnostic IR.

pub mod builder;
pub mod filter;
pub mod ir;

pub use builder::QueryBuilder;
pub use filter::{parse_sort, Direction, FilterNode, ListRequest, Operator, SortSpec};
pub use ir::{Column, Lookup, Predicate, SelectQuery};

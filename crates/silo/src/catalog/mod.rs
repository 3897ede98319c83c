/// Bucket acquisition and locking discipline.
pub mod access;
/// Catalog container and lifecycle state.
#[allow(clippy::module_inception)]
pub mod catalog;
/// Catalog operations.
pub mod operations;
/// Catalog tests.
pub mod tests;

pub use catalog::{BucketCatalog, BucketState};

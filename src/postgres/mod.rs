pub mod catalog;
pub mod types;

pub use catalog::{Catalog, CatalogSnapshot, PgCatalog};
pub use types::*;

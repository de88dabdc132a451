pub mod pgvector;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use self::pgvector::{PgVectorStore, TableName};

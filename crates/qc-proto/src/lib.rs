pub mod records;
pub mod schema;
pub mod wire;

pub use records::*;
pub use schema::{FromJson, SchemaError, ValidationError};

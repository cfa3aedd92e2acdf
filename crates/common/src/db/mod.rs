mod error;
mod tree;

pub use error::DatabaseError;
pub use tree::{open, JsonTree};

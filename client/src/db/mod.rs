//! Database module for the PostgreSQL-backed remote store.

mod listener;
mod pool;
mod records;

pub use listener::*;
pub use pool::*;
pub use records::*;

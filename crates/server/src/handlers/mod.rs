//! HTTP request handlers.

pub mod health;
pub mod query;

pub use health::*;
pub use query::*;

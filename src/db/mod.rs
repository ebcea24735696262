//! Database layer - connection pooling and step outcome table DDL

pub mod pool;
pub mod schema;

pub use pool::Pool;
pub use schema::ensure_step_outcomes_table;

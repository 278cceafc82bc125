//! Durable `PolicyStore` adapters.

pub mod postgres;

pub use postgres::PostgresPolicyStore;

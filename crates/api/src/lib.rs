//! HTTP edge: filter chain, admin routes and service wiring.

pub mod app;
pub mod context;
pub mod middleware;

#[cfg(test)]
pub(crate) mod test_support;

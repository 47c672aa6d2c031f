//! HTTP facade over the core system.
//!
//! A thin adapter: handlers delegate to [`crate::system::CoreSystem`] and
//! translate the error taxonomy into the stable `{"code", "details"}`
//! envelope. Swapping the facade never touches core semantics.

pub mod handlers;
pub mod middleware;
pub mod responses;
pub mod routes;

pub use routes::create_router;

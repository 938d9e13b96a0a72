//! HTTP surface for the verification service.

pub mod handlers;
pub mod server;

pub use server::{build_router, AppContext};

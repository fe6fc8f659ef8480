pub mod auth;
pub mod context;
pub mod error;
pub mod models;
pub mod process;
pub mod queue;
pub mod registry;
pub mod routes;
pub mod setup;
pub mod store;

pub use context::Context;
pub use error::{Error, Result};

//! # skiff-api
//!
//! The HTTP front-end of the Skiff daemon: a thin adaptor translating JSON
//! requests on a unix socket into daemon operations and mapping operation
//! statuses onto HTTP codes. All semantics live in `skiff-core`.

mod error;
mod routes;
mod server;

pub use error::{ApiError, Result};
pub use routes::create_router;
pub use server::{ApiServer, ServerConfig};

pub mod balloon_socket;
pub mod error;
pub mod middleware;
pub mod routes;

pub use error::{ApiError, ErrorCode};
pub use routes::{create_router, AppState};

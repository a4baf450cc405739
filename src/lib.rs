//! Local HTTP backend exposing one directory tree for browsing, downloads,
//! streamed directory archives and preview thumbnails.

pub mod archive;
pub mod entry;
pub mod error;
pub mod listing;
pub mod natural;
pub mod paths;
pub mod routes;
pub mod thumbnail;

pub use error::AppError;
pub use paths::Root;
pub use routes::{router, AppState, SharedState};

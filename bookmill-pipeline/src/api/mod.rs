//! HTTP API handlers
//!
//! JSON in, JSON out. Handlers validate identifiers and translate requests
//! into queue and store calls; [`crate::ApiError`] maps the outcome to a
//! status code.

pub mod artifacts;
pub mod books;
pub mod health;
pub mod images;
pub mod jobs;
pub mod sse;

pub use artifacts::artifact_routes;
pub use books::book_routes;
pub use health::health_routes;
pub use images::image_routes;
pub use jobs::job_routes;
pub use sse::event_stream;

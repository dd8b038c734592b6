pub mod routes;

pub use routes::{create_thumbnail, serve_thumbnail, status};

pub mod health;

pub use health::{configure_health_routes, serve_health};

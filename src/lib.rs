pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod routing;
pub mod store;
pub mod web;
pub mod yate;

pub use error::RoutingError;
pub type Result<T> = std::result::Result<T, RoutingError>;

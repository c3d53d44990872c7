pub mod billing;
pub mod config;
pub mod error;
pub mod extractor;
pub mod metering;
pub mod plans;
pub mod routes;

pub use routes::{api_routes, app, ServiceSettings, Services};

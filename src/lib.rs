pub mod acme;
pub mod certs;
pub mod config;
pub mod oauth;
pub mod operation;
pub mod platform;
pub mod policy;
pub mod renewal;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod store;
pub mod task;
pub mod upload;
pub mod workflow;

pub use config::Settings;

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod cost;
pub mod error;
pub mod handlers;
pub mod policy;
pub mod provider;
pub mod router;
pub mod upstream;
pub mod usage;

//! DashBorg: asynchronous borgmatic job engine.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;

pub mod config;
pub mod connectors;
pub mod engine;
pub mod error;
pub mod humanize;
pub mod observability;
pub mod transport;

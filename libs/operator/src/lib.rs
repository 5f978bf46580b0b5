pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod telemetry;
pub mod worker;

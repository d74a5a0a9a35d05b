//! Device telemetry ingestion: MQTT in, history in Postgres, latest value in
//! Redis, read API over both.

pub mod cache;
pub mod config;
pub mod db;
pub mod decode;
pub mod errors;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod service;
pub mod store;

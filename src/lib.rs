//! Bouncer conversion worker
//!
//! Consumes conversion and federation jobs from the task and model queues,
//! runs the external bouncer converter, imports results into PostgreSQL,
//! optionally builds asset bundles, and reports progress on a callback queue.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;

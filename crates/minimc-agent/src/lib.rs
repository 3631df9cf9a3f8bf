//! MiniMC agent: supervises one Minecraft server process and exposes its console,
//! files and resource usage over HTTP.

pub mod config;
pub mod error;
pub mod error_payload;
pub mod files;
pub mod launch;
pub mod log_hub;
pub mod paper;
pub mod process_handle;
pub mod routes;
pub mod security;
pub mod state;
pub mod stats;
pub mod supervisor;
pub mod telemetry;

// Public API - the runner plus the seams a caller can inject
pub mod coordination;
pub mod error;
pub mod remote;
pub mod runner;
pub mod store;

// Internal modules - organized by subsystem
mod config;
mod db;
mod telemetry;

#[cfg(test)]
mod testing;

pub mod app;
pub mod cli;
pub mod config;
pub mod control;
pub mod email;
pub mod scheduler;
pub mod telemetry;
pub mod template;

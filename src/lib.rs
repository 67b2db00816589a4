//! mirrord driver - runs the mirrord CLI and turns its progress stream into
//! a launch environment.

pub mod cli;
pub mod commands;
pub mod config;
pub mod display;
pub mod supervisor;

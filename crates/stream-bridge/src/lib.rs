pub mod cli;
pub mod config;
pub mod priority;
pub mod runtime;

/// Shared helpers for driving external tools
pub mod command;
pub mod polling;

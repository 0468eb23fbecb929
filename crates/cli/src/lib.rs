//! wgreg CLI
//!
//! Command-line interface for managing the gateway server, users and
//! devices, and for applying stored state to the live interface.

pub mod commands;
pub mod context;
pub mod output;

//! CLI Commands

pub mod apply;
pub mod device;
pub mod server;
pub mod user;

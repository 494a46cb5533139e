//! Types, configuration and persisted state shared by the digfeed engine and
//! daemon.

pub mod config;
pub mod platform;
pub mod protocol;
pub mod state;

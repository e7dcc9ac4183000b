pub mod action;
pub mod config;
pub mod device;
pub mod messages;
pub mod runtime;
pub mod session;

pub mod cli;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod quota;
pub mod replica;
pub mod stats;
pub mod store;

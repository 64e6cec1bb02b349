#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod download;
pub mod extract;
pub mod hosts;
pub mod library;
pub mod logging;
pub mod model;
pub mod provider;
pub mod store;

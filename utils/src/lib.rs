pub mod alchemy;
pub mod alloy;
pub mod config;
pub mod disk_storage;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod log;
pub mod multicall;
pub mod pipeline;
pub mod planner;
pub mod reconcile;
pub mod registry;
pub mod report;
pub mod reqwest;
pub mod retry;
pub mod serde;
pub mod staging;
pub mod store;

#[cfg(test)]
pub mod testutils;

pub use error::{Result, UtilsError as Error};

pub use reqwest::Reqwest;

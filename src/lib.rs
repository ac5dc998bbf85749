pub mod api;
pub mod client;
pub mod config;
pub mod db;
pub mod engine;
pub mod indexer;
pub mod tokens;

#[cfg(test)]
pub(crate) mod test_utils;

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod mutation;
pub mod query;
pub mod search;

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod feed;
pub mod grid;
pub mod logging;
pub mod model;
pub mod notify;
pub mod persistence;
pub mod ui;

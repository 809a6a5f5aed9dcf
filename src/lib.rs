pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod generator;
pub mod latency;
pub mod model;
pub mod pipeline;
pub mod producer;
pub mod sink;
pub mod tui;
pub mod types;
pub mod web;

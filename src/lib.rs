pub mod aqi;
pub mod cascade;
pub mod cli;
pub mod config;
pub mod correction;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod payload;
pub mod pipeline;
pub mod publish;
pub mod reading;
pub mod service;
pub mod validate;

pub mod broker;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod fs_watch;
pub mod models;
pub mod mqtt_service;
pub mod persistence;
pub mod pipeline;
pub mod ports;
pub mod registry;
pub mod service_utils;
pub mod version_reader;
pub mod watch;

pub use engine::{Collaborators, Engine, EngineSettings};

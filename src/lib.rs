pub mod application;
pub mod archive;
pub mod cleanup;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod install;
pub mod integrity;
pub mod package;
pub mod planner;
pub mod progress;
pub mod resolver;
pub mod runtime;
pub mod version;

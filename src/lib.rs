pub mod app;
pub mod error;
pub mod fields;
pub mod gate;
pub mod image_processing;
pub mod mcp_server;
pub mod pipeline;
pub mod prompt;
pub mod response;
pub mod service;
pub mod settings;
pub mod store;
pub mod tools;
pub mod upload;
pub mod usage;

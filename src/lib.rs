pub mod agent;
pub mod config;
pub mod error;
pub mod http;
pub mod llm;
pub mod provider_config;
pub mod tools;

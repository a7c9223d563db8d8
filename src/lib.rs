pub mod adjudicator;
pub mod config;
pub mod constraints;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod ollama;
pub mod openai_compat;
pub mod pipeline;
pub mod retrieval;
pub mod server;

pub use config::AppConfig;
pub use pipeline::Verifier;
pub use server::run_server;

//! LLM-driven data analysis: natural-language requests become Python code,
//! executed against uploaded tabular files in an ephemeral sandbox.

pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod sandbox;
pub mod schema;
pub mod script;
pub mod workspace;

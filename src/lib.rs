pub mod ai;
pub mod auth;
pub mod channels;
pub mod config;
pub mod kb;
pub mod llm;
pub mod shared;
pub mod vector;

pub mod chat;
pub mod config;
pub mod controller;
pub mod environment;
pub mod error_payload;
pub mod local_sandbox;
pub mod logs;
pub mod manifest;
pub mod preview;
pub mod project_client;
pub mod run_state;
pub mod runtime_handle;
pub mod sandbox;
pub mod ui_server;

#[cfg(test)]
mod testing;

pub mod errors;
pub mod handlers;
pub mod index;
pub mod log;
pub mod orchestrator;
pub mod provider;
pub mod routes;
pub mod server;
pub mod settings;
pub mod transfer;
pub mod vfs;
pub mod watcher;

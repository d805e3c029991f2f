pub mod admin;
pub mod commands;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod locks;
pub mod progress;
pub mod progress_events;
pub mod repository;
pub mod settings;
pub mod state_machine;

pub use lifecycle::LifecycleOrchestrator;

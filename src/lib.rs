// src/lib.rs

// Import the top-level `taskswarm` module.
pub mod taskswarm;

// Re-export the submodules at the crate root so external code and tests can
// address them as taskswarm::<module> directly.
pub use taskswarm::aggregator;
pub use taskswarm::board;
pub use taskswarm::clients;
pub use taskswarm::config;
pub use taskswarm::event;
pub use taskswarm::executor;
pub use taskswarm::llm;
pub use taskswarm::media;
pub use taskswarm::messaging;
pub use taskswarm::model;
pub use taskswarm::orchestrator;
pub use taskswarm::review;
pub use taskswarm::roles;
pub use taskswarm::tool_parsing;
pub use taskswarm::tool_registry;
pub use taskswarm::tools;
pub use taskswarm::worker;

// Re-exporting key items for easier external access.
pub use taskswarm::board::{SubTask, TaskBoard, TaskStatus};
pub use taskswarm::executor::WaveExecutor;
pub use taskswarm::llm::{ChatMessage, ChatRole, LlmClient};
pub use taskswarm::orchestrator::Orchestrator;
pub use taskswarm::worker::WorkerAgent;

pub mod orchestrator;

pub use orchestrator::{Components, Snapshot, VoiceOrchestrator};

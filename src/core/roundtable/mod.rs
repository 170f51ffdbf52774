//! Scheduled conversations between agents, and what they remember afterwards.

pub mod distiller;
pub mod formats;
pub mod orchestrator;
pub mod sanitize;
pub mod schedule;
pub mod speakers;

pub use distiller::MemoryDistiller;
pub use orchestrator::{RoundtableOrchestrator, enqueue};
pub use schedule::check_schedule;

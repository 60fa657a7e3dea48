pub mod controller;
pub mod engine;

pub use controller::{ChatSessionController, SessionEffect};
pub use engine::{ChatEngine, EngineCommand, EngineHandle, ViewState};

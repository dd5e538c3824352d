pub mod llama;
pub mod scripted;

pub use llama::LlamaBackend;
pub use scripted::{ScriptedBackend, Script};

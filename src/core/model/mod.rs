pub mod traits;
pub mod registry;
pub mod architectures;

pub use traits::{Backend, NativeContext, NativeModel};
pub use registry::{Handle, ModelEntry, Registry, CAPACITY};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub i32);

impl TokenId {
    pub fn as_usize(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl From<i32> for TokenId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Parameters handed to [`Backend::load_model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelParams {
    pub use_memory_map: bool,
    pub gpu_layers: i32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            use_memory_map: true,
            gpu_layers: 0,
        }
    }
}

/// Execution context sizing. The defaults are the runtime's fixed policy;
/// hosts cannot change them through the boundary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub context_length: usize,
    pub batch_size: usize,
    pub threads: usize,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            context_length: 2048,
            batch_size: 512,
            threads: 4,
        }
    }
}

/// Snapshot of a registry entry, as returned by `describe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(rename = "model_id")]
    pub handle: i64,
    #[serde(rename = "path")]
    pub source_path: String,
    #[serde(rename = "n_vocab")]
    pub vocab_size: usize,
    #[serde(rename = "n_ctx")]
    pub context_length: usize,
    #[serde(rename = "ref_count")]
    pub reference_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_defaults() {
        let params = ContextParams::default();
        assert_eq!(params.context_length, 2048);
        assert_eq!(params.batch_size, 512);
        assert_eq!(params.threads, 4);
    }

    #[test]
    fn test_model_info_json_keys() {
        let info = ModelInfo {
            handle: 3,
            source_path: "tiny.gguf".to_string(),
            vocab_size: 32000,
            context_length: 2048,
            reference_count: 1,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["model_id"], 3);
        assert_eq!(json["path"], "tiny.gguf");
        assert_eq!(json["n_vocab"], 32000);
        assert_eq!(json["n_ctx"], 2048);
        assert_eq!(json["ref_count"], 1);
    }

    #[test]
    fn test_token_id_as_usize() {
        assert_eq!(TokenId(7).as_usize(), Some(7));
        assert_eq!(TokenId(-1).as_usize(), None);
    }
}

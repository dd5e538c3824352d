//! Host-facing operations over a shared registry.
//!
//! Every operation comes in two forms: a `try_*` method returning the typed
//! [`Error`](crate::core::Error), and a sentinel form for hosts that can only
//! carry plain values (`-1`, an empty vector or an empty string on failure).
//! Sentinel forms log the underlying error at `warn`.

use crate::core::model::architectures::LlamaBackend;
use crate::core::{
    generate_streaming, Backend, GenerateOptions, Generation, Handle, ModelInfo, ModelParams,
    Registry, Result, Step,
};
use crate::envconfig::EnvConfig;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Process-wide runtime backed by the candle llama backend.
pub static RUNTIME: Lazy<Runtime> =
    Lazy::new(|| Runtime::new(Box::new(LlamaBackend::new()), EnvConfig::from_env()));

pub struct Runtime {
    registry: Mutex<Registry>,
    config: EnvConfig,
}

impl Runtime {
    pub fn new(backend: Box<dyn Backend>, config: EnvConfig) -> Self {
        Self::with_registry(Registry::new(backend), config)
    }

    pub fn with_registry(registry: Registry, config: EnvConfig) -> Self {
        Self {
            registry: Mutex::new(registry),
            config,
        }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions::default().with_overflow(self.config.overflow)
    }

    pub fn try_load(&self, path: &str, params: ModelParams) -> Result<Handle> {
        let location = self.config.resolve_model_path(path);
        self.registry.lock().load_from(path, &location, params)
    }

    pub fn load(&self, path: &str, use_memory_map: bool, gpu_layers: i32) -> i64 {
        let params = ModelParams {
            use_memory_map,
            gpu_layers,
        };
        match self.try_load(path, params) {
            Ok(handle) => handle.raw(),
            Err(e) => {
                tracing::warn!("load({:?}) failed: {}", path, e);
                -1
            }
        }
    }

    pub fn try_free(&self, handle: i64) -> Result<()> {
        let handle = Handle::parse(handle)?;
        self.registry.lock().free(handle)
    }

    pub fn free(&self, handle: i64) -> i32 {
        match self.try_free(handle) {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!("free({}) failed: {}", handle, e);
                -1
            }
        }
    }

    pub fn try_tokenize(&self, handle: i64, text: &str) -> Result<Vec<i32>> {
        let handle = Handle::parse(handle)?;
        let tokens = self.registry.lock().tokenize(handle, text)?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    pub fn tokenize(&self, handle: i64, text: &str) -> Vec<i32> {
        self.try_tokenize(handle, text).unwrap_or_else(|e| {
            tracing::warn!("tokenize({}) failed: {}", handle, e);
            Vec::new()
        })
    }

    /// Streams a generation, calling `on_step` for every emitted token. The
    /// registry stays locked until the generation ends.
    pub fn try_stream<F>(
        &self,
        handle: i64,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
        options: GenerateOptions,
        on_step: F,
    ) -> Result<Generation>
    where
        F: FnMut(&Step),
    {
        let handle = Handle::parse(handle)?;
        let mut registry = self.registry.lock();
        let entry = registry.get_mut(handle)?;
        generate_streaming(entry, prompt, max_tokens, temperature, options, on_step)
    }

    pub fn try_generate(
        &self,
        handle: i64,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<Generation> {
        self.try_stream(handle, prompt, max_tokens, temperature, self.generate_options(), |_| {})
    }

    /// A negative `max_tokens` generates nothing.
    pub fn generate(&self, handle: i64, prompt: &str, max_tokens: i64, temperature: f64) -> String {
        let max_tokens = usize::try_from(max_tokens).unwrap_or(0);
        match self.try_generate(handle, prompt, max_tokens, temperature as f32) {
            Ok(generation) => generation.text,
            Err(e) => {
                tracing::warn!("generate({}) failed: {}", handle, e);
                String::new()
            }
        }
    }

    pub fn try_describe(&self, handle: i64) -> Result<ModelInfo> {
        let handle = Handle::parse(handle)?;
        self.registry.lock().describe(handle)
    }

    /// JSON object with `model_id`, `path`, `n_vocab`, `n_ctx` and `ref_count`.
    pub fn describe(&self, handle: i64) -> String {
        let info = match self.try_describe(handle) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("describe({}) failed: {}", handle, e);
                return String::new();
            }
        };
        serde_json::to_string(&info).unwrap_or_else(|e| {
            tracing::warn!("describe({}) could not serialize: {}", handle, e);
            String::new()
        })
    }

    pub fn loaded(&self) -> usize {
        self.registry.lock().len()
    }

    /// Releases every model and the backend. The runtime stays usable.
    pub fn shutdown(&self) {
        self.registry.lock().shutdown_all();
    }
}

pub fn load(path: &str, use_memory_map: bool, gpu_layers: i32) -> i64 {
    RUNTIME.load(path, use_memory_map, gpu_layers)
}

pub fn free(handle: i64) -> i32 {
    RUNTIME.free(handle)
}

pub fn tokenize(handle: i64, text: &str) -> Vec<i32> {
    RUNTIME.tokenize(handle, text)
}

pub fn generate(handle: i64, prompt: &str, max_tokens: i64, temperature: f64) -> String {
    RUNTIME.generate(handle, prompt, max_tokens, temperature)
}

pub fn describe(handle: i64) -> String {
    RUNTIME.describe(handle)
}

pub fn shutdown() {
    RUNTIME.shutdown()
}

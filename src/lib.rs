pub mod core;
pub mod api;
pub mod envconfig;

pub use crate::core::{
    Error, Result,
    Backend, Handle, ModelInfo, ModelParams, ContextParams, Registry, TokenId, CAPACITY,
    GenerateOptions, Generation, OverflowPolicy, StopReason, TokenStream,
};

pub use api::{Runtime, RUNTIME};
pub use envconfig::EnvConfig;

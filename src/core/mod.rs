pub mod error;
pub mod model;
pub mod tokenizer;
pub mod sample;
pub mod generate;

pub use error::Error;
pub use model::{
    Backend, NativeContext, NativeModel,
    ContextParams, ModelParams, ModelInfo, TokenId,
    Handle, ModelEntry, Registry, CAPACITY,
};
pub use tokenizer::{Tokenizer, TokenizerKind, Vocabulary, TOKENIZE_CAPACITY};
pub use generate::{
    generate, generate_streaming,
    CancelToken, Generation, GenerateOptions, OverflowPolicy, Step, StopReason, TokenStream,
    OUTPUT_CAPACITY,
};

pub type Result<T> = std::result::Result<T, Error>;

use super::{ContextParams, ModelParams, TokenId};
use crate::core::Result;
use std::path::Path;

/// Process-wide native execution backend.
///
/// `init` runs before the first model is loaded and `teardown` once when the
/// runtime shuts down. Implementations must tolerate `init` being called again
/// after a `teardown`.
pub trait Backend: Send {
    fn name(&self) -> &str;

    fn init(&mut self) -> Result<()>;
    fn teardown(&mut self);

    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<Box<dyn NativeModel>>;
}

/// A loaded set of weights plus its vocabulary.
pub trait NativeModel: Send {
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn NativeContext>>;

    fn vocab_size(&self) -> usize;
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Tokenizes `text`, failing with `TokenizeOverflow` rather than returning
    /// more than `capacity` ids.
    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<TokenId>>;
}

/// Mutable decode state bound to one model.
pub trait NativeContext: Send {
    /// Feeds `tokens` starting at `position`. On success the logits of the last
    /// token become available through [`NativeContext::logits`].
    fn decode(&mut self, tokens: &[TokenId], position: usize) -> Result<()>;

    fn logits(&self) -> Option<&[f32]>;

    /// Display bytes of a single token. May be empty, and may be a partial
    /// UTF-8 sequence for byte-fallback tokens.
    fn token_to_piece(&self, token: TokenId) -> Vec<u8>;

    fn context_length(&self) -> usize;

    /// Forgets every decoded position and any pending logits.
    fn clear(&mut self);
}

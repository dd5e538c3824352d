//! Deterministic in-memory backend.
//!
//! Tokens are whitespace-separated words looked up in a fixed piece table, and
//! the logits after each decode come from a [`Script`]. Every lifecycle step is
//! recorded in a shared [`Journal`] so callers can assert on ordering.

use crate::core::model::{Backend, ContextParams, ModelParams, NativeContext, NativeModel, TokenId};
use crate::core::{Error, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    /// The same logits after every decode.
    Fixed(Vec<f32>),
    /// After the n-th decode since the last clear, a one-hot vector for the
    /// n-th token; no logits once the sequence runs out.
    Sequence(Vec<TokenId>),
}

impl Script {
    pub fn always(token: TokenId, vocab_size: usize) -> Self {
        Script::Fixed(one_hot(token, vocab_size))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Init,
    Teardown,
    ModelLoaded(String),
    ContextCreated,
    Decoded { position: usize, tokens: usize },
    ContextDropped,
    ModelDropped,
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    fn record(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Event) -> bool,
    {
        self.0.lock().iter().filter(|e| predicate(e)).count()
    }
}

#[derive(Debug, Clone)]
struct Setup {
    pieces: Vec<String>,
    end_of_generation: Vec<TokenId>,
    unknown: TokenId,
    script: Script,
    context_length: Option<usize>,
    fail_load: bool,
    fail_context: bool,
    fail_decode_at: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    setup: Setup,
    journal: Journal,
}

impl ScriptedBackend {
    pub fn new<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pieces: Vec<String> = pieces.into_iter().map(Into::into).collect();
        let vocab_size = pieces.len();
        Self {
            setup: Setup {
                pieces,
                end_of_generation: Vec::new(),
                unknown: TokenId(0),
                script: Script::Fixed(vec![0.0; vocab_size]),
                context_length: None,
                fail_load: false,
                fail_context: false,
                fail_decode_at: None,
            },
            journal: Journal::default(),
        }
    }

    pub fn with_end_of_generation(mut self, token: TokenId) -> Self {
        self.setup.end_of_generation.push(token);
        self
    }

    pub fn with_unknown(mut self, token: TokenId) -> Self {
        self.setup.unknown = token;
        self
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.setup.script = script;
        self
    }

    pub fn emitting<I: IntoIterator<Item = TokenId>>(self, tokens: I) -> Self {
        self.with_script(Script::Sequence(tokens.into_iter().collect()))
    }

    /// Overrides the context length requested by the registry.
    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.setup.context_length = Some(context_length);
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.setup.fail_load = true;
        self
    }

    pub fn failing_context(mut self) -> Self {
        self.setup.fail_context = true;
        self
    }

    /// Makes the `n`-th decode call (0-based, counted from the last clear) fail.
    pub fn failing_decode_at(mut self, n: usize) -> Self {
        self.setup.fail_decode_at = Some(n);
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn vocab_size(&self) -> usize {
        self.setup.pieces.len()
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn init(&mut self) -> Result<()> {
        self.journal.record(Event::Init);
        Ok(())
    }

    fn teardown(&mut self) {
        self.journal.record(Event::Teardown);
    }

    fn load_model(&mut self, path: &Path, _params: &ModelParams) -> Result<Box<dyn NativeModel>> {
        let path = path.to_string_lossy().to_string();
        if self.setup.fail_load {
            return Err(Error::load_failed(path, "scripted load failure"));
        }
        self.journal.record(Event::ModelLoaded(path));
        Ok(Box::new(ScriptedModel {
            setup: Arc::new(self.setup.clone()),
            journal: self.journal.clone(),
        }))
    }
}

struct ScriptedModel {
    setup: Arc<Setup>,
    journal: Journal,
}

impl NativeModel for ScriptedModel {
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn NativeContext>> {
        if self.setup.fail_context {
            return Err(Error::load_failed("", "scripted context failure"));
        }
        self.journal.record(Event::ContextCreated);
        Ok(Box::new(ScriptedContext {
            setup: Arc::clone(&self.setup),
            journal: self.journal.clone(),
            context_length: self.setup.context_length.unwrap_or(params.context_length),
            decodes: 0,
            logits: None,
        }))
    }

    fn vocab_size(&self) -> usize {
        self.setup.pieces.len()
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.setup.end_of_generation.contains(&token)
    }

    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<TokenId>> {
        let tokens: Vec<TokenId> = text
            .split_whitespace()
            .map(|word| {
                self.setup
                    .pieces
                    .iter()
                    .position(|p| p == word)
                    .map(|i| TokenId(i as i32))
                    .unwrap_or(self.setup.unknown)
            })
            .collect();

        if tokens.len() > capacity {
            return Err(Error::TokenizeOverflow {
                required: tokens.len(),
                capacity,
            });
        }
        Ok(tokens)
    }
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.journal.record(Event::ModelDropped);
    }
}

struct ScriptedContext {
    setup: Arc<Setup>,
    journal: Journal,
    context_length: usize,
    decodes: usize,
    logits: Option<Vec<f32>>,
}

impl NativeContext for ScriptedContext {
    fn decode(&mut self, tokens: &[TokenId], position: usize) -> Result<()> {
        if tokens.is_empty() {
            return Err(Error::decode_failed(position, "empty batch"));
        }
        if position + tokens.len() > self.context_length {
            return Err(Error::decode_failed(position, "context window exhausted"));
        }
        if self.setup.fail_decode_at == Some(self.decodes) {
            self.logits = None;
            return Err(Error::decode_failed(position, "scripted decode failure"));
        }

        self.journal.record(Event::Decoded {
            position,
            tokens: tokens.len(),
        });
        let vocab_size = self.setup.pieces.len();
        self.logits = match &self.setup.script {
            Script::Fixed(logits) => Some(logits.clone()),
            Script::Sequence(sequence) => sequence
                .get(self.decodes)
                .map(|&token| one_hot(token, vocab_size)),
        };
        self.decodes += 1;
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        token
            .as_usize()
            .and_then(|i| self.setup.pieces.get(i))
            .map(|piece| piece.as_bytes().to_vec())
            .unwrap_or_default()
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn clear(&mut self) {
        self.decodes = 0;
        self.logits = None;
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.journal.record(Event::ContextDropped);
    }
}

fn one_hot(token: TokenId, vocab_size: usize) -> Vec<f32> {
    let mut logits = vec![0.0; vocab_size];
    if let Some(slot) = token.as_usize().and_then(|i| logits.get_mut(i)) {
        *slot = 1.0;
    }
    logits
}

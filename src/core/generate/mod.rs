//! Greedy autoregressive decode loop.
//!
//! A generation tokenizes the prompt, clears the entry's context, feeds the
//! prompt as one batch at position 0 and then repeats: read the logits of the
//! last position, take the argmax, stop on an end-of-generation token, append
//! the token's display bytes and feed the token back at the next position.
//!
//! [`TokenStream`] yields one [`Step`] per emitted token so hosts can stream
//! and cancel; [`generate`] drains a stream into a [`Generation`].

use crate::core::model::{Handle, ModelEntry, Registry};
use crate::core::sample::greedy;
use crate::core::tokenizer::{token_to_text, tokenize};
use crate::core::{Error, Result, TokenId};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Upper bound on accumulated output bytes; an append must leave the total
/// strictly below it.
pub const OUTPUT_CAPACITY: usize = 8192;

/// What to do with a token whose bytes no longer fit in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// End the generation with [`StopReason::OutputFull`].
    #[default]
    Stop,
    /// Drop the bytes and keep generating until another stop condition.
    Truncate,
}

impl FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stop" => Ok(OverflowPolicy::Stop),
            "truncate" => Ok(OverflowPolicy::Truncate),
            _ => Err(Error::InvalidArgument("overflow policy must be `stop` or `truncate`")),
        }
    }
}

/// Cooperative cancellation flag, checked once per generated token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub output_capacity: usize,
    pub overflow: OverflowPolicy,
    pub cancel: Option<CancelToken>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            output_capacity: OUTPUT_CAPACITY,
            overflow: OverflowPolicy::default(),
            cancel: None,
        }
    }
}

impl GenerateOptions {
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxTokens,
    EndOfGeneration,
    LogitsExhausted,
    OutputFull,
    DecodeFailed,
    Cancelled,
}

/// One emitted token. `bytes` is empty when the token renders as nothing or
/// its bytes were dropped by [`OverflowPolicy::Truncate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub token: TokenId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub stop_reason: StopReason,
    pub tokens_generated: usize,
    pub prompt_tokens: usize,
}

pub struct TokenStream<'a> {
    entry: &'a mut ModelEntry,
    options: GenerateOptions,
    remaining: usize,
    position: usize,
    prompt_tokens: usize,
    emitted_bytes: usize,
    generated: usize,
    stop: Option<StopReason>,
}

impl<'a> TokenStream<'a> {
    /// Tokenizes and decodes the prompt. Fails if the prompt does not fit the
    /// tokenizer buffer or the backend rejects the prompt batch.
    pub fn start(
        entry: &'a mut ModelEntry,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
        options: GenerateOptions,
    ) -> Result<Self> {
        if temperature != 0.0 {
            tracing::debug!("Temperature {} ignored, sampling is greedy", temperature);
        }

        let tokens = tokenize(entry, prompt)?;
        let context = entry.context_mut();
        context.clear();
        if !tokens.is_empty() {
            context.decode(&tokens, 0).map_err(|e| match e {
                e @ Error::DecodeFailed { .. } => e,
                other => Error::decode_failed(0, other),
            })?;
        }

        Ok(Self {
            entry,
            options,
            remaining: max_tokens,
            position: tokens.len(),
            prompt_tokens: tokens.len(),
            emitted_bytes: 0,
            generated: 0,
            stop: None,
        })
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    /// Number of tokens fed to the context so far, prompt included.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    pub fn tokens_generated(&self) -> usize {
        self.generated
    }

    fn finish(&mut self, reason: StopReason) -> Option<Step> {
        tracing::debug!(
            "Generation on handle {} stopped: {:?} after {} tokens",
            self.entry.handle(),
            reason,
            self.generated
        );
        self.stop = Some(reason);
        None
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        if self.stop.is_some() {
            return None;
        }
        if self.options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return self.finish(StopReason::Cancelled);
        }
        if self.remaining == 0 {
            return self.finish(StopReason::MaxTokens);
        }

        let Some(token) = self.entry.context().logits().and_then(greedy) else {
            return self.finish(StopReason::LogitsExhausted);
        };
        if self.entry.model().is_end_of_generation(token) {
            return self.finish(StopReason::EndOfGeneration);
        }

        let mut bytes = token_to_text(self.entry, token);
        if self.emitted_bytes + bytes.len() < self.options.output_capacity {
            self.emitted_bytes += bytes.len();
        } else {
            match self.options.overflow {
                OverflowPolicy::Stop => return self.finish(StopReason::OutputFull),
                OverflowPolicy::Truncate => bytes.clear(),
            }
        }

        self.remaining -= 1;
        self.generated += 1;
        match self.entry.context_mut().decode(&[token], self.position) {
            Ok(()) => self.position += 1,
            Err(e) => {
                tracing::warn!("Decode failed, ending generation early: {}", e);
                self.stop = Some(StopReason::DecodeFailed);
            }
        }

        Some(Step { token, bytes })
    }
}

/// Runs a full greedy generation and returns the accumulated text.
pub fn generate(
    entry: &mut ModelEntry,
    prompt: &str,
    max_tokens: usize,
    temperature: f32,
    options: GenerateOptions,
) -> Result<Generation> {
    generate_streaming(entry, prompt, max_tokens, temperature, options, |_| {})
}

/// Like [`generate`], handing every step to `on_step` as it is produced.
pub fn generate_streaming<F>(
    entry: &mut ModelEntry,
    prompt: &str,
    max_tokens: usize,
    temperature: f32,
    options: GenerateOptions,
    mut on_step: F,
) -> Result<Generation>
where
    F: FnMut(&Step),
{
    let mut stream = TokenStream::start(entry, prompt, max_tokens, temperature, options)?;
    let mut output = Vec::new();
    for step in stream.by_ref() {
        on_step(&step);
        output.extend_from_slice(&step.bytes);
    }

    Ok(Generation {
        text: String::from_utf8_lossy(&output).into_owned(),
        stop_reason: stream.stop_reason().unwrap_or(StopReason::MaxTokens),
        tokens_generated: stream.tokens_generated(),
        prompt_tokens: stream.prompt_tokens(),
    })
}

impl Registry {
    pub fn generate(
        &mut self,
        handle: Handle,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
        options: GenerateOptions,
    ) -> Result<Generation> {
        let entry = self.get_mut(handle)?;
        generate(entry, prompt, max_tokens, temperature, options)
    }

    pub fn tokenize(&self, handle: Handle, text: &str) -> Result<Vec<TokenId>> {
        tokenize(self.get(handle)?, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::architectures::scripted::{Event, Script, ScriptedBackend};
    use crate::core::model::ModelParams;

    const EOS: TokenId = TokenId(0);
    const A: TokenId = TokenId(1);
    const B: TokenId = TokenId(2);
    const C: TokenId = TokenId(3);

    fn backend() -> ScriptedBackend {
        ScriptedBackend::new(["<eos>", "A", "B", "C"]).with_end_of_generation(EOS)
    }

    fn load(backend: ScriptedBackend) -> (Registry, Handle) {
        let mut registry = Registry::new(Box::new(backend));
        let handle = registry.load("model", ModelParams::default()).unwrap();
        (registry, handle)
    }

    #[test]
    fn test_stops_at_end_of_generation() {
        let (mut registry, handle) = load(backend().emitting([A, B, C, EOS]));

        let generation = registry
            .generate(handle, "A", 10, 0.0, GenerateOptions::default())
            .unwrap();
        assert_eq!(generation.text, "ABC");
        assert_eq!(generation.stop_reason, StopReason::EndOfGeneration);
        assert_eq!(generation.tokens_generated, 3);
        assert_eq!(generation.prompt_tokens, 1);
    }

    #[test]
    fn test_zero_budget_is_empty() {
        let (mut registry, handle) = load(backend().emitting([A, B]));

        let generation = registry
            .generate(handle, "A", 0, 0.7, GenerateOptions::default())
            .unwrap();
        assert_eq!(generation.text, "");
        assert_eq!(generation.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_budget_limits_tokens() {
        let (mut registry, handle) = load(backend().with_script(Script::always(B, 4)));

        let generation = registry
            .generate(handle, "A", 3, 0.0, GenerateOptions::default())
            .unwrap();
        assert_eq!(generation.text, "BBB");
        assert_eq!(generation.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_positions_advance_one_per_token() {
        let backend = backend().emitting([A, B, EOS]);
        let journal = backend.journal();
        let (mut registry, handle) = load(backend);

        registry
            .generate(handle, "A B C", 10, 0.0, GenerateOptions::default())
            .unwrap();
        let decodes: Vec<Event> = journal
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Decoded { .. }))
            .collect();
        assert_eq!(
            decodes,
            vec![
                Event::Decoded { position: 0, tokens: 3 },
                Event::Decoded { position: 3, tokens: 1 },
                Event::Decoded { position: 4, tokens: 1 },
            ]
        );
    }

    #[test]
    fn test_each_call_starts_fresh() {
        let (mut registry, handle) = load(backend().emitting([A, B, EOS]));

        let first = registry.generate(handle, "A", 10, 0.0, GenerateOptions::default()).unwrap();
        let second = registry.generate(handle, "A", 10, 0.0, GenerateOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_logits_end_generation() {
        let (mut registry, handle) = load(backend().emitting([A]));

        let generation = registry.generate(handle, "A", 10, 0.0, GenerateOptions::default()).unwrap();
        assert_eq!(generation.text, "A");
        assert_eq!(generation.stop_reason, StopReason::LogitsExhausted);
    }

    #[test]
    fn test_empty_prompt_produces_nothing() {
        let backend = backend().emitting([A]);
        let journal = backend.journal();
        let (mut registry, handle) = load(backend);

        let generation = registry.generate(handle, "", 10, 0.0, GenerateOptions::default()).unwrap();
        assert_eq!(generation.text, "");
        assert_eq!(generation.stop_reason, StopReason::LogitsExhausted);
        assert_eq!(journal.count(|e| matches!(e, Event::Decoded { .. })), 0);
    }

    #[test]
    fn test_prompt_decode_failure_is_error() {
        let (mut registry, handle) = load(backend().emitting([A]).failing_decode_at(0));

        let err = registry.generate(handle, "A", 10, 0.0, GenerateOptions::default()).unwrap_err();
        assert!(matches!(err, Error::DecodeFailed { position: 0, .. }));
    }

    #[test]
    fn test_decode_failure_keeps_partial_output() {
        let (mut registry, handle) = load(backend().emitting([A, B, C, EOS]).failing_decode_at(2));

        let generation = registry.generate(handle, "A", 10, 0.0, GenerateOptions::default()).unwrap();
        assert_eq!(generation.text, "AB");
        assert_eq!(generation.stop_reason, StopReason::DecodeFailed);
        assert_eq!(generation.tokens_generated, 2);
    }

    #[test]
    fn test_context_exhaustion_stops_generation() {
        let (mut registry, handle) = load(backend().with_script(Script::always(A, 4)).with_context_length(4));

        let generation = registry.generate(handle, "A A", 10, 0.0, GenerateOptions::default()).unwrap();
        assert_eq!(generation.text, "AAA");
        assert_eq!(generation.stop_reason, StopReason::DecodeFailed);
    }

    #[test]
    fn test_output_full_stops_by_default() {
        let backend = ScriptedBackend::new(["<eos>", "abcd"]).with_script(Script::always(TokenId(1), 2));
        let (mut registry, handle) = load(backend);

        let options = GenerateOptions::default().with_output_capacity(10);
        let generation = registry.generate(handle, "abcd", 100, 0.0, options).unwrap();
        assert_eq!(generation.text, "abcdabcd");
        assert_eq!(generation.stop_reason, StopReason::OutputFull);
        assert_eq!(generation.tokens_generated, 2);
    }

    #[test]
    fn test_truncate_keeps_spending_budget() {
        let backend = ScriptedBackend::new(["<eos>", "abcd"]).with_script(Script::always(TokenId(1), 2));
        let (mut registry, handle) = load(backend);

        let options = GenerateOptions::default()
            .with_output_capacity(10)
            .with_overflow(OverflowPolicy::Truncate);
        let generation = registry.generate(handle, "abcd", 5, 0.0, options).unwrap();
        assert_eq!(generation.text, "abcdabcd");
        assert_eq!(generation.stop_reason, StopReason::MaxTokens);
        assert_eq!(generation.tokens_generated, 5);
    }

    #[test]
    fn test_append_reaching_capacity_is_rejected() {
        let backend = ScriptedBackend::new(["<eos>", "abcd"]).with_script(Script::always(TokenId(1), 2));
        let (mut registry, handle) = load(backend);

        let stop = GenerateOptions::default().with_output_capacity(8);
        let generation = registry.generate(handle, "abcd", 100, 0.0, stop).unwrap();
        assert_eq!(generation.text, "abcd");
        assert_eq!(generation.stop_reason, StopReason::OutputFull);
        assert_eq!(generation.tokens_generated, 1);

        let truncate = GenerateOptions::default()
            .with_output_capacity(8)
            .with_overflow(OverflowPolicy::Truncate);
        let generation = registry.generate(handle, "abcd", 3, 0.0, truncate).unwrap();
        assert_eq!(generation.text, "abcd");
        assert_eq!(generation.stop_reason, StopReason::MaxTokens);
        assert_eq!(generation.tokens_generated, 3);
    }

    #[test]
    fn test_cancellation_between_tokens() {
        let (mut registry, handle) = load(backend().with_script(Script::always(C, 4)));
        let cancel = CancelToken::new();
        let options = GenerateOptions::default().with_cancel(cancel.clone());

        let entry = registry.get_mut(handle).unwrap();
        let mut stream = TokenStream::start(entry, "A", 100, 0.0, options).unwrap();
        assert_eq!(stream.next(), Some(Step { token: C, bytes: b"C".to_vec() }));
        cancel.cancel();
        assert_eq!(stream.next(), None);
        assert_eq!(stream.stop_reason(), Some(StopReason::Cancelled));
        assert_eq!(stream.position(), 2);
        assert_eq!(stream.next(), None);
    }

    #[test]
    fn test_invalid_handle() {
        let (mut registry, handle) = load(backend());
        registry.free(handle).unwrap();

        assert_eq!(
            registry.generate(handle, "A", 1, 0.0, GenerateOptions::default()),
            Err(Error::InvalidHandle(handle.raw()))
        );
        assert_eq!(registry.tokenize(handle, "A"), Err(Error::InvalidHandle(handle.raw())));
    }

    #[test]
    fn test_streaming_sees_each_step() {
        let (mut registry, handle) = load(backend().emitting([B, A, EOS]));
        let entry = registry.get_mut(handle).unwrap();

        let mut seen = Vec::new();
        let generation = generate_streaming(entry, "C", 10, 0.0, GenerateOptions::default(), |step| {
            seen.push(step.token)
        })
        .unwrap();
        assert_eq!(seen, vec![B, A]);
        assert_eq!(generation.text, "BA");
    }

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!("stop".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Stop);
        assert_eq!(" Truncate ".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Truncate);
        assert!("grow".parse::<OverflowPolicy>().is_err());
    }
}

pub mod traits;
pub mod bpe;
pub mod sentencepiece;

pub use traits::{Tokenizer, TokenizerKind};
pub use bpe::BpeTokenizer;
pub use sentencepiece::SentencePieceTokenizer;

use crate::core::model::ModelEntry;
use crate::core::{Error, Result, TokenId};

/// Largest token sequence a single tokenize call may produce.
pub const TOKENIZE_CAPACITY: usize = 4096;

/// Tokenizes `text` with the entry's model. A text that needs more than
/// [`TOKENIZE_CAPACITY`] tokens is an error, never a truncated result.
pub fn tokenize(entry: &ModelEntry, text: &str) -> Result<Vec<TokenId>> {
    let tokens = entry.model().tokenize(text, TOKENIZE_CAPACITY)?;
    if tokens.len() > TOKENIZE_CAPACITY {
        return Err(Error::TokenizeOverflow {
            required: tokens.len(),
            capacity: TOKENIZE_CAPACITY,
        });
    }
    Ok(tokens)
}

pub fn token_to_text(entry: &ModelEntry, token: TokenId) -> Vec<u8> {
    entry.context().token_to_piece(token)
}

pub fn create_tokenizer(kind: TokenizerKind, vocab: Vocabulary) -> Box<dyn Tokenizer> {
    match kind {
        TokenizerKind::Bpe => Box::new(BpeTokenizer::new(vocab)),
        TokenizerKind::SentencePiece => Box::new(SentencePieceTokenizer::new(vocab)),
    }
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub tokens: Vec<String>,
    pub scores: Vec<f32>,
    pub types: Vec<TokenType>,
    pub merges: Vec<String>,
    pub bos_token: Option<TokenId>,
    pub eos_token: Option<TokenId>,
    pub eot_token: Option<TokenId>,
    pub unk_token: Option<TokenId>,
    pub add_bos: bool,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>) -> Self {
        let len = tokens.len();
        Self {
            tokens,
            scores: vec![0.0; len],
            types: vec![TokenType::Normal; len],
            merges: Vec::new(),
            bos_token: None,
            eos_token: None,
            eot_token: None,
            unk_token: None,
            add_bos: false,
        }
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        id.as_usize()
            .and_then(|i| self.tokens.get(i))
            .map(|s| s.as_str())
    }

    pub fn score(&self, id: TokenId) -> f32 {
        id.as_usize()
            .and_then(|i| self.scores.get(i))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn token_type(&self, id: TokenId) -> TokenType {
        id.as_usize()
            .and_then(|i| self.types.get(i))
            .copied()
            .unwrap_or(TokenType::Normal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenType {
    /// Maps the GGUF `tokenizer.ggml.token_type` encoding.
    pub fn from_gguf(value: i32) -> Self {
        match value {
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            4 => TokenType::UserDefined,
            5 => TokenType::Unused,
            6 => TokenType::Byte,
            _ => TokenType::Normal,
        }
    }
}

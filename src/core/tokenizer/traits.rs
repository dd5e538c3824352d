use super::Vocabulary;
use crate::core::{Error, Result, TokenId};

pub trait Tokenizer: Send + Sync {
    /// Encodes `text`, prepending BOS when the vocabulary asks for it.
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Like [`Tokenizer::encode`], but fails with `TokenizeOverflow` once more
    /// than `capacity` tokens are produced. Implementations may stop early, in
    /// which case `required` counts the tokens produced so far.
    fn encode_bounded(&self, text: &str, capacity: usize) -> Result<Vec<TokenId>> {
        let tokens = self.encode(text);
        if tokens.len() > capacity {
            return Err(Error::TokenizeOverflow {
                required: tokens.len(),
                capacity,
            });
        }
        Ok(tokens)
    }

    /// Display bytes for one token. Control tokens render as nothing.
    fn piece(&self, id: TokenId) -> Vec<u8>;

    fn vocabulary(&self) -> &Vocabulary;
    fn kind(&self) -> TokenizerKind;

    fn vocab_size(&self) -> usize {
        self.vocabulary().size()
    }

    fn is_end_of_generation(&self, id: TokenId) -> bool {
        let vocab = self.vocabulary();
        vocab.eos_token == Some(id) || vocab.eot_token == Some(id)
    }

    fn decode(&self, tokens: &[TokenId]) -> String {
        let bytes: Vec<u8> = tokens.iter().flat_map(|&t| self.piece(t)).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenizerKind {
    Bpe,
    SentencePiece,
}

impl TokenizerKind {
    /// Maps the GGUF `tokenizer.ggml.model` value.
    pub fn from_gguf(model: &str) -> Option<Self> {
        match model.to_lowercase().as_str() {
            "llama" | "spm" | "sentencepiece" => Some(TokenizerKind::SentencePiece),
            "gpt2" | "bpe" => Some(TokenizerKind::Bpe),
            _ => None,
        }
    }
}

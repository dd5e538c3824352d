use super::traits::{Tokenizer, TokenizerKind};
use super::{TokenType, Vocabulary};
use crate::core::{Error, Result, TokenId};
use once_cell::sync::Lazy;
use std::collections::HashMap;

static PRETOKENIZER: Lazy<fancy_regex::Regex> = Lazy::new(|| {
    fancy_regex::Regex::new(
        r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+",
    )
    .expect("GPT-2 pre-tokenizer pattern is valid")
});

/// GPT-2 style byte-level BPE driven by merge ranks.
pub struct BpeTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    bpe_ranks: HashMap<(String, String), usize>,
    byte_encoder: HashMap<u8, char>,
    byte_decoder: HashMap<char, u8>,
}

impl BpeTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let byte_encoder = Self::build_byte_encoder();
        let byte_decoder: HashMap<char, u8> = byte_encoder.iter()
            .map(|(&k, &v)| (v, k))
            .collect();

        let mut encoder = HashMap::with_capacity(vocab.size());
        for (i, token) in vocab.tokens.iter().enumerate() {
            encoder.entry(token.clone()).or_insert(TokenId(i as i32));
        }

        let mut bpe_ranks = HashMap::new();
        for (i, merge) in vocab.merges.iter().enumerate() {
            if let Some((left, right)) = merge.split_once(' ') {
                bpe_ranks.insert((left.to_string(), right.to_string()), i);
            }
        }

        Self {
            vocab,
            encoder,
            bpe_ranks,
            byte_encoder,
            byte_decoder,
        }
    }

    fn build_byte_encoder() -> HashMap<u8, char> {
        let mut mapping = HashMap::with_capacity(256);
        for b in (b'!'..=b'~').chain(0xA1..=0xAC).chain(0xAE..=0xFF) {
            mapping.insert(b, char::from(b));
        }

        let mut offset: u32 = 256;
        for b in 0..=255u8 {
            if mapping.contains_key(&b) {
                continue;
            }
            if let Some(c) = char::from_u32(offset) {
                mapping.insert(b, c);
            }
            offset += 1;
        }
        mapping
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();

        while word.len() > 1 {
            let bigram = word.windows(2)
                .filter_map(|pair| {
                    self.bpe_ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, (pair[0].clone(), pair[1].clone())))
                })
                .min_by_key(|(rank, _)| *rank)
                .map(|(_, pair)| pair);

            let Some((left, right)) = bigram else {
                break;
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == left && word[i + 1] == right {
                    merged.push(format!("{}{}", left, right));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }
        word
    }

    fn byte_encode(&self, text: &str) -> String {
        text.bytes()
            .filter_map(|b| self.byte_encoder.get(&b).copied())
            .collect()
    }

    fn byte_decode(&self, token: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(token.len());
        for c in token.chars() {
            match self.byte_decoder.get(&c) {
                Some(&b) => bytes.push(b),
                None => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        bytes
    }
}

impl BpeTokenizer {
    fn encode_until(&self, text: &str, capacity: usize) -> std::result::Result<Vec<TokenId>, usize> {
        let mut tokens = Vec::new();
        if self.vocab.add_bos {
            tokens.extend(self.vocab.bos_token);
        }

        for m in PRETOKENIZER.find_iter(text).flatten() {
            let encoded = self.byte_encode(m.as_str());
            for piece in self.bpe(&encoded) {
                match self.encoder.get(&piece) {
                    Some(&id) => tokens.push(id),
                    None => tokens.extend(self.vocab.unk_token),
                }
            }
            if tokens.len() > capacity {
                return Err(tokens.len());
            }
        }
        Ok(tokens)
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        self.encode_until(text, usize::MAX).unwrap_or_default()
    }

    fn encode_bounded(&self, text: &str, capacity: usize) -> Result<Vec<TokenId>> {
        self.encode_until(text, capacity)
            .map_err(|required| Error::TokenizeOverflow { required, capacity })
    }

    fn piece(&self, id: TokenId) -> Vec<u8> {
        let Some(token) = self.vocab.token(id) else {
            return Vec::new();
        };
        match self.vocab.token_type(id) {
            TokenType::Control | TokenType::Unused => Vec::new(),
            TokenType::UserDefined => token.as_bytes().to_vec(),
            _ => self.byte_decode(token),
        }
    }

    fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    fn kind(&self) -> TokenizerKind {
        TokenizerKind::Bpe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        let tokens: Vec<String> = ["<|endoftext|>", "h", "e", "l", "o", "Ġ", "he", "ll", "hell", "hello", "Ġhello", "Ċ"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut vocab = Vocabulary::new(tokens);
        vocab.types[0] = TokenType::Control;
        vocab.merges = vec![
            "h e".into(),
            "l l".into(),
            "he ll".into(),
            "hell o".into(),
            "Ġ hello".into(),
        ];
        vocab.eos_token = Some(TokenId(0));
        vocab
    }

    #[test]
    fn test_bpe_merges() {
        let tokenizer = BpeTokenizer::new(vocab());
        assert_eq!(tokenizer.encode("hello"), vec![TokenId(9)]);
        assert_eq!(tokenizer.encode("hello hello"), vec![TokenId(9), TokenId(10)]);
    }

    #[test]
    fn test_byte_level_pieces() {
        let tokenizer = BpeTokenizer::new(vocab());
        assert_eq!(tokenizer.piece(TokenId(10)), b" hello".to_vec());
        assert_eq!(tokenizer.piece(TokenId(11)), b"\n".to_vec());
        assert!(tokenizer.piece(TokenId(0)).is_empty());
        assert_eq!(tokenizer.decode(&tokenizer.encode("hello hello")), "hello hello");
        assert!(tokenizer.is_end_of_generation(TokenId(0)));
    }

    #[test]
    fn test_pretokenizer_splits() {
        let splits: Vec<&str> = PRETOKENIZER
            .find_iter("He'LL pay 12345, ok?\n")
            .flatten()
            .map(|m| m.as_str())
            .collect();
        assert_eq!(splits, vec!["He", "'LL", " pay", " ", "123", "45", ",", " ok", "?\n"]);
    }

    #[test]
    fn test_bounded_encode() {
        let tokenizer = BpeTokenizer::new(vocab());
        let text = "hello ".repeat(100_000);
        assert_eq!(
            tokenizer.encode_bounded(&text, 8),
            Err(Error::TokenizeOverflow { required: 9, capacity: 8 })
        );
        assert_eq!(tokenizer.encode_bounded("hello hello", 2).unwrap(), vec![TokenId(9), TokenId(10)]);
    }

    #[test]
    fn test_byte_encoder_is_bijective() {
        let encoder = BpeTokenizer::build_byte_encoder();
        assert_eq!(encoder.len(), 256);
        assert_eq!(encoder[&b' '], 'Ġ');
        assert_eq!(encoder[&b'\n'], 'Ċ');
        assert_eq!(encoder[&b'a'], 'a');
    }
}

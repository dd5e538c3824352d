use super::traits::{Tokenizer, TokenizerKind};
use super::{TokenType, Vocabulary};
use crate::core::{Error, Result, TokenId};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

const SPACE: char = '▁';

/// Score-driven SentencePiece tokenizer with byte fallback, as used by llama
/// vocabularies.
pub struct SentencePieceTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    byte_tokens: [Option<TokenId>; 256],
}

/// A live span of the word being merged. Merged-away symbols have `len == 0`.
#[derive(Debug, Clone, Copy)]
struct Symbol {
    start: usize,
    len: usize,
    next: Option<usize>,
    prev: Option<usize>,
}

/// Candidate merge of two adjacent symbols. Higher score pops first, then the
/// leftmost pair.
#[derive(Debug, PartialEq)]
struct Bigram {
    score: f32,
    left: usize,
    right: usize,
    len: usize,
}

impl Eq for Bigram {}

impl Ord for Bigram {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.left.cmp(&self.left))
    }
}

impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl SentencePieceTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let mut encoder = HashMap::with_capacity(vocab.size());
        let mut byte_tokens = [None; 256];

        for (i, token) in vocab.tokens.iter().enumerate() {
            let id = TokenId(i as i32);
            encoder.entry(token.clone()).or_insert(id);
            if let Some(byte) = byte_value(token) {
                byte_tokens[byte as usize] = Some(id);
            }
        }

        Self {
            vocab,
            encoder,
            byte_tokens,
        }
    }

    fn push_bigram(&self, word: &str, symbols: &[Symbol], queue: &mut BinaryHeap<Bigram>, left: usize, right: usize) {
        let start = symbols[left].start;
        let end = symbols[right].start + symbols[right].len;
        if let Some(&id) = self.encoder.get(&word[start..end]) {
            queue.push(Bigram {
                score: self.vocab.score(id),
                left,
                right,
                len: end - start,
            });
        }
    }

    /// Merges the characters of `word` into vocabulary pieces, best score
    /// first.
    fn merge<'w>(&self, word: &'w str) -> Vec<&'w str> {
        let count = word.chars().count();
        let mut symbols: Vec<Symbol> = word
            .char_indices()
            .enumerate()
            .map(|(i, (start, c))| Symbol {
                start,
                len: c.len_utf8(),
                prev: i.checked_sub(1),
                next: (i + 1 < count).then_some(i + 1),
            })
            .collect();

        let mut queue = BinaryHeap::new();
        for right in 1..symbols.len() {
            self.push_bigram(word, &symbols, &mut queue, right - 1, right);
        }

        while let Some(bigram) = queue.pop() {
            let (left, right) = (symbols[bigram.left], symbols[bigram.right]);
            if left.len == 0 || right.len == 0 || left.len + right.len != bigram.len {
                continue;
            }

            symbols[bigram.left].len += right.len;
            symbols[bigram.left].next = right.next;
            symbols[bigram.right].len = 0;
            if let Some(next) = right.next {
                symbols[next].prev = Some(bigram.left);
            }

            if let Some(prev) = left.prev {
                self.push_bigram(word, &symbols, &mut queue, prev, bigram.left);
            }
            if let Some(next) = right.next {
                self.push_bigram(word, &symbols, &mut queue, bigram.left, next);
            }
        }

        let mut pieces = Vec::new();
        let mut cursor = (!symbols.is_empty()).then_some(0);
        while let Some(i) = cursor {
            let symbol = symbols[i];
            pieces.push(&word[symbol.start..symbol.start + symbol.len]);
            cursor = symbol.next;
        }
        pieces
    }

    /// Encodes word by word and gives up once more than `capacity` tokens have
    /// been produced, returning how many there were at that point.
    fn encode_until(&self, text: &str, capacity: usize) -> std::result::Result<Vec<TokenId>, usize> {
        let mut tokens = Vec::new();
        if self.vocab.add_bos {
            tokens.extend(self.vocab.bos_token);
        }
        if text.is_empty() {
            return Ok(tokens);
        }

        let normalized: String = std::iter::once(SPACE)
            .chain(text.chars().map(|c| if c == ' ' { SPACE } else { c }))
            .collect();

        for word in split_words(&normalized) {
            for piece in self.merge(word) {
                if let Some(&id) = self.encoder.get(piece) {
                    tokens.push(id);
                    continue;
                }
                for byte in piece.bytes() {
                    if let Some(id) = self.byte_tokens[byte as usize].or(self.vocab.unk_token) {
                        tokens.push(id);
                    }
                }
            }
            if tokens.len() > capacity {
                return Err(tokens.len());
            }
        }
        Ok(tokens)
    }
}

impl Tokenizer for SentencePieceTokenizer {
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
            TokenType::Byte => byte_value(token).map(|b| vec![b]).unwrap_or_default(),
            _ => match byte_value(token) {
                Some(b) => vec![b],
                None => token.replace(SPACE, " ").into_bytes(),
            },
        }
    }

    fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    fn kind(&self) -> TokenizerKind {
        TokenizerKind::SentencePiece
    }
}

/// Splits normalized text before every run of `▁`, so each word carries its
/// leading spaces.
fn split_words(normalized: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut start = 0;
    let mut prev_space = false;
    for (i, c) in normalized.char_indices() {
        let space = c == SPACE;
        if space && !prev_space && i > start {
            words.push(&normalized[start..i]);
            start = i;
        }
        prev_space = space;
    }
    if start < normalized.len() {
        words.push(&normalized[start..]);
    }
    words
}

/// Parses byte-fallback pieces of the form `<0xNN>`.
fn byte_value(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

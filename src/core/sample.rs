use crate::core::TokenId;

/// Greedy argmax over the full vocabulary.
///
/// Only a strictly greater logit replaces the current best, so ties resolve to
/// the lowest index and NaN never wins over a number seen earlier.
pub fn greedy(logits: &[f32]) -> Option<TokenId> {
    let (first, rest) = logits.split_first()?;
    let mut best = 0usize;
    let mut max_logit = *first;

    for (i, &logit) in rest.iter().enumerate() {
        if logit > max_logit {
            max_logit = logit;
            best = i + 1;
        }
    }
    Some(TokenId(best as i32))
}

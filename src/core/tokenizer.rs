//! Byte-level BPE tokenizer with an atomic special-token alphabet.
//!
//! A [`Tokenizer`] owns two disjoint vocabularies: the ordinary map from
//! byte sequences to ranks (with its explicit inverse) and the special map
//! from reserved strings to ranks. Ordinary encoding splits the input with
//! the pre-tokenization pattern and byte-pair-merges each piece; special
//! strings are atomic and never produced by BPE.
//!
//! The pre-tokenization regex is the hot loop, so each instance keeps
//! [`N_SLOTS`] pre-compiled copies and a thread picks one by hashing its
//! thread id. The copies are read-only after construction, so no locking is
//! involved. Fully constructed tokenizers are immutable and can be shared
//! freely across threads.

use aho_corasick::{AhoCorasick, MatchKind};
use lru::LruCache;
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use thiserror::Error;

use super::bpe::byte_pair_encode;
use super::vocab::VocabError;

/// Token identifier. Ordinary and special ranks share this space but never
/// overlap within one tokenizer.
pub type Rank = u32;

/// Number of pre-compiled copies of the pre-tokenization regex. Bounds
/// cross-thread contention at a fixed memory cost per instance.
pub const N_SLOTS: usize = 16;

/// Default capacity of the per-piece BPE result cache.
const DEFAULT_CACHE_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("regex compilation error: {0}")]
    RegexError(#[from] Box<fancy_regex::Error>),
    #[error("special-token matcher build error: {0}")]
    AhoCorasickError(#[from] aho_corasick::BuildError),
    #[error("vocabulary error: {0}")]
    VocabError(#[from] VocabError),
    #[error("unknown token for decoding: {0}")]
    UnknownToken(Rank),
    #[error("decoded bytes are not valid UTF-8")]
    InvalidUtf8,
    #[error("tokenizer invariant violated: {0}")]
    Internal(String),
}

fn hash_slice(slice: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    slice.hash(&mut hasher);
    hasher.finish()
}

/// Slot index for the calling thread, computed once per thread.
fn current_thread_slot() -> usize {
    thread_local! {
        static SLOT: usize = {
            let mut hasher = FxHasher::default();
            std::thread::current().id().hash(&mut hasher);
            (hasher.finish() as usize) % N_SLOTS
        };
    }
    SLOT.with(|slot| *slot)
}

pub struct Tokenizer {
    encoder: FxHashMap<Vec<u8>, Rank>,
    decoder: FxHashMap<Rank, Vec<u8>>,
    special_tokens: FxHashMap<String, Rank>,
    special_tokens_decoder: FxHashMap<Rank, Vec<u8>>,
    special_token_strings: Vec<String>,
    pattern: String,
    regex_slots: Vec<fancy_regex::Regex>,
    special_matcher: Option<AhoCorasick>,
    chunk_cache: Mutex<LruCache<u64, Vec<Rank>>>,
    cache_size: usize,
}

impl Tokenizer {
    /// Build a tokenizer from an ordinary vocabulary, a special vocabulary,
    /// and the pre-tokenization pattern the ordinary vocabulary was trained
    /// under.
    ///
    /// Construction enforces the vocabulary invariants: ordinary ranks are
    /// injective, special ranks are disjoint from them, and every single
    /// byte has an ordinary token (so any byte sequence is encodable).
    pub fn new(
        encoder: FxHashMap<Vec<u8>, Rank>,
        special_tokens: FxHashMap<String, Rank>,
        pattern: &str,
    ) -> Result<Self, TokenizerError> {
        Self::with_cache_size(encoder, special_tokens, pattern, DEFAULT_CACHE_SIZE)
    }

    /// Like [`Tokenizer::new`] with a custom LRU cache capacity.
    pub fn with_cache_size(
        encoder: FxHashMap<Vec<u8>, Rank>,
        special_tokens: FxHashMap<String, Rank>,
        pattern: &str,
        cache_size: usize,
    ) -> Result<Self, TokenizerError> {
        let decoder: FxHashMap<Rank, Vec<u8>> =
            encoder.iter().map(|(k, v)| (*v, k.clone())).collect();
        if decoder.len() != encoder.len() {
            return Err(TokenizerError::Internal(
                "ordinary vocabulary maps two byte sequences to one rank".to_string(),
            ));
        }
        for byte in 0u8..=255 {
            if !encoder.contains_key([byte].as_slice()) {
                return Err(TokenizerError::Internal(format!(
                    "single-byte token {byte:#04x} missing from vocabulary"
                )));
            }
        }
        let mut special_tokens_decoder = FxHashMap::default();
        for (text, &rank) in &special_tokens {
            if decoder.contains_key(&rank) {
                return Err(TokenizerError::Internal(format!(
                    "special token {text:?} reuses ordinary rank {rank}"
                )));
            }
            if special_tokens_decoder
                .insert(rank, text.as_bytes().to_vec())
                .is_some()
            {
                return Err(TokenizerError::Internal(format!(
                    "special rank {rank} assigned twice"
                )));
            }
        }

        let regex_slots = (0..N_SLOTS)
            .map(|_| fancy_regex::Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Box::new)?;

        let special_token_strings: Vec<String> = special_tokens.keys().cloned().collect();
        let special_matcher = if special_token_strings.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .match_kind(MatchKind::LeftmostLongest)
                    .build(&special_token_strings)?,
            )
        };

        let capacity = NonZeroUsize::new(cache_size.max(1))
            .ok_or_else(|| TokenizerError::Internal("cache size underflow".to_string()))?;

        Ok(Self {
            encoder,
            decoder,
            special_tokens,
            special_tokens_decoder,
            special_token_strings,
            pattern: pattern.to_string(),
            regex_slots,
            special_matcher,
            chunk_cache: Mutex::new(LruCache::new(capacity)),
            cache_size,
        })
    }

    fn pattern_regex(&self) -> &fancy_regex::Regex {
        &self.regex_slots[current_thread_slot()]
    }

    /// BPE-encode one pre-tokenized piece, consulting the LRU cache.
    fn encode_piece(&self, bytes: &[u8]) -> Vec<Rank> {
        // Whole-piece vocabulary hits skip both the cache and the merge loop.
        if let Some(&rank) = self.encoder.get(bytes) {
            return vec![rank];
        }
        let hash = hash_slice(bytes);
        if let Ok(mut cache) = self.chunk_cache.lock() {
            if let Some(hit) = cache.get(&hash) {
                return hit.clone();
            }
        }
        let result = byte_pair_encode(bytes, &self.encoder);
        if let Ok(mut cache) = self.chunk_cache.lock() {
            cache.put(hash, result.clone());
        }
        result
    }

    /// Encode text against the ordinary vocabulary only. Special-token
    /// literals inside the text are treated as ordinary bytes.
    pub fn encode_ordinary(&self, text: &str) -> Vec<Rank> {
        let regex = self.pattern_regex();
        let mut out = Vec::new();
        for piece in regex.find_iter(text).flatten() {
            out.extend(self.encode_piece(piece.as_str().as_bytes()));
        }
        out
    }

    /// Encode text, recognizing only the special tokens in
    /// `allowed_special`. Any other substring that looks special is
    /// ordinary bytes.
    ///
    /// Returns the tokens and `last_piece_token_len`: the number of tokens
    /// produced from the final ordinary segment, or 1 when the text ends on
    /// a special token. The scan is leftmost-first; where several allowed
    /// specials match at one position the longest wins.
    pub fn encode(&self, text: &str, allowed_special: &HashSet<&str>) -> (Vec<Rank>, usize) {
        let matcher = match &self.special_matcher {
            Some(matcher) if !allowed_special.is_empty() => matcher,
            _ => {
                let tokens = self.encode_ordinary(text);
                let len = tokens.len();
                return (tokens, len);
            }
        };

        let mut out = Vec::new();
        let mut last_piece_token_len = 0;
        let mut segment_start = 0;
        let mut search_start = 0;

        while search_start < text.len() {
            let Some(found) = matcher.find(&text[search_start..]) else {
                break;
            };
            let at = search_start + found.start();
            // The automaton covers every special; the longest *allowed*
            // match at this position may be shorter than what it found, or
            // absent entirely.
            let allowed_here = self
                .special_token_strings
                .iter()
                .filter(|s| allowed_special.contains(s.as_str()) && text[at..].starts_with(*s))
                .max_by_key(|s| s.len());
            match allowed_here {
                Some(special) => {
                    let ordinary = &text[segment_start..at];
                    if !ordinary.is_empty() {
                        out.extend(self.encode_ordinary(ordinary));
                    }
                    // Constructor checks make this lookup infallible.
                    if let Some(&rank) = self.special_tokens.get(special.as_str()) {
                        out.push(rank);
                    }
                    last_piece_token_len = 1;
                    segment_start = at + special.len();
                    search_start = segment_start;
                }
                None => {
                    // A disallowed longer special may shadow an allowed one
                    // starting inside its span; resume just past its head,
                    // on a char boundary.
                    let mut next = at + 1;
                    while next < text.len() && !text.is_char_boundary(next) {
                        next += 1;
                    }
                    search_start = next;
                }
            }
        }

        let trailing = &text[segment_start..];
        if !trailing.is_empty() {
            let tokens = self.encode_ordinary(trailing);
            last_piece_token_len = tokens.len();
            out.extend(tokens);
        }
        (out, last_piece_token_len)
    }

    /// Encode text with every special token recognized.
    pub fn encode_with_special_tokens(&self, text: &str) -> Vec<Rank> {
        let allowed: HashSet<&str> = self
            .special_token_strings
            .iter()
            .map(|s| s.as_str())
            .collect();
        self.encode(text, &allowed).0
    }

    /// Decode tokens to their concatenated byte sequences.
    pub fn decode_bytes(&self, tokens: &[Rank]) -> Result<Vec<u8>, TokenizerError> {
        let mut out = Vec::with_capacity(tokens.len() * 4);
        for &token in tokens {
            let bytes = self
                .decoder
                .get(&token)
                .or_else(|| self.special_tokens_decoder.get(&token))
                .ok_or(TokenizerError::UnknownToken(token))?;
            out.extend_from_slice(bytes);
        }
        Ok(out)
    }

    /// Decode tokens to a string, failing on ill-formed UTF-8.
    pub fn decode_utf8(&self, tokens: &[Rank]) -> Result<String, TokenizerError> {
        let bytes = self.decode_bytes(tokens)?;
        String::from_utf8(bytes).map_err(|_| TokenizerError::InvalidUtf8)
    }

    /// Text forms of every special token, in construction order.
    pub fn special_tokens(&self) -> Vec<&str> {
        self.special_token_strings
            .iter()
            .map(|s| s.as_str())
            .collect()
    }

    /// Whether `token` is a special-token rank.
    pub fn is_special_token(&self, token: Rank) -> bool {
        self.special_tokens_decoder.contains_key(&token)
    }

    /// Rank of a special token by its text form.
    pub fn special_token_rank(&self, text: &str) -> Option<Rank> {
        self.special_tokens.get(text).copied()
    }

    /// Total rank-space size: the highest assigned rank plus one.
    pub fn vocab_size(&self) -> usize {
        let max_ordinary = self.decoder.keys().max().copied().unwrap_or(0);
        let max_special = self.special_tokens.values().max().copied().unwrap_or(0);
        (max_ordinary.max(max_special) + 1) as usize
    }

    /// The pre-tokenization pattern this tokenizer was built with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Drop all cached per-piece BPE results.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.chunk_cache.lock() {
            cache.clear();
        }
    }

    /// Number of cached per-piece BPE results.
    pub fn cache_len(&self) -> usize {
        self.chunk_cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Clone for Tokenizer {
    fn clone(&self) -> Self {
        // Regex slots and the matcher recompile from the stored pattern;
        // the cache starts empty (caches are not shared).
        let regex_slots = (0..N_SLOTS)
            .map(|_| fancy_regex::Regex::new(&self.pattern))
            .collect::<Result<Vec<_>, _>>()
            .unwrap_or_default();
        let special_matcher = if self.special_token_strings.is_empty() {
            None
        } else {
            AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostLongest)
                .build(&self.special_token_strings)
                .ok()
        };
        let capacity =
            NonZeroUsize::new(self.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            encoder: self.encoder.clone(),
            decoder: self.decoder.clone(),
            special_tokens: self.special_tokens.clone(),
            special_tokens_decoder: self.special_tokens_decoder.clone(),
            special_token_strings: self.special_token_strings.clone(),
            pattern: self.pattern.clone(),
            regex_slots,
            special_matcher,
            chunk_cache: Mutex::new(LruCache::new(capacity)),
            cache_size: self.cache_size,
        }
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("ordinary_tokens", &self.encoder.len())
            .field("special_tokens", &self.special_tokens.len())
            .field("pattern", &self.pattern)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_vocab() -> FxHashMap<Vec<u8>, Rank> {
        let mut encoder = FxHashMap::default();
        for b in 0u8..=255 {
            encoder.insert(vec![b], b as Rank);
        }
        encoder.insert(b"He".to_vec(), 256);
        encoder.insert(b"llo".to_vec(), 257);
        encoder.insert(b"Hello".to_vec(), 258);
        encoder.insert(b" world".to_vec(), 259);
        encoder
    }

    fn specials() -> FxHashMap<String, Rank> {
        let mut map = FxHashMap::default();
        map.insert("<|end|>".to_string(), 50000);
        map.insert("<|endoftext|>".to_string(), 50001);
        map
    }

    fn make_tokenizer() -> Tokenizer {
        Tokenizer::new(byte_vocab(), specials(), r"\S+|\s+").unwrap()
    }

    #[test]
    fn roundtrip_preserves_text() {
        let tok = make_tokenizer();
        let tokens = tok.encode_ordinary("Hello world");
        assert_eq!(tok.decode_utf8(&tokens).unwrap(), "Hello world");
    }

    #[test]
    fn whole_piece_hit_is_single_token() {
        let tok = make_tokenizer();
        assert_eq!(tok.encode_ordinary("Hello"), vec![258]);
    }

    #[test]
    fn empty_text_is_empty() {
        let tok = make_tokenizer();
        assert!(tok.encode_ordinary("").is_empty());
        assert_eq!(tok.encode("", &HashSet::new()), (vec![], 0));
    }

    #[test]
    fn encode_no_specials_matches_ordinary() {
        let tok = make_tokenizer();
        let text = "Hello <|end|> world";
        assert_eq!(tok.encode(text, &HashSet::new()).0, tok.encode_ordinary(text));
    }

    #[test]
    fn allowed_special_becomes_one_token() {
        let tok = make_tokenizer();
        let allowed: HashSet<&str> = ["<|end|>"].into();
        let (tokens, last_len) = tok.encode("Hello<|end|>", &allowed);
        assert_eq!(tokens, vec![258, 50000]);
        assert_eq!(last_len, 1);
    }

    #[test]
    fn disallowed_special_stays_ordinary() {
        let tok = make_tokenizer();
        let (tokens, _) = tok.encode("<|end|>", &HashSet::new());
        assert!(!tokens.contains(&50000));
        assert_eq!(tok.decode_utf8(&tokens).unwrap(), "<|end|>");
    }

    #[test]
    fn longest_allowed_match_wins() {
        let tok = make_tokenizer();
        let allowed: HashSet<&str> = ["<|end|>", "<|endoftext|>"].into();
        let (tokens, _) = tok.encode("<|endoftext|>", &allowed);
        assert_eq!(tokens, vec![50001]);
    }

    #[test]
    fn disallowed_longer_special_does_not_shadow_allowed_prefix() {
        let mut special = FxHashMap::default();
        special.insert("ab".to_string(), 60000);
        special.insert("abc".to_string(), 60001);
        let tok = Tokenizer::new(byte_vocab(), special, r"\S+|\s+").unwrap();
        let allowed: HashSet<&str> = ["ab"].into();
        let (tokens, _) = tok.encode("abc", &allowed);
        assert_eq!(tokens, vec![60000, b'c' as Rank]);
    }

    #[test]
    fn disallowed_match_does_not_hide_allowed_overlap() {
        let mut special = FxHashMap::default();
        special.insert("ab".to_string(), 60000);
        special.insert("ba".to_string(), 60001);
        let tok = Tokenizer::new(byte_vocab(), special, r"\S+|\s+").unwrap();
        let allowed: HashSet<&str> = ["ba"].into();
        let (tokens, _) = tok.encode("aba", &allowed);
        assert_eq!(tokens, vec![b'a' as Rank, 60001]);
    }

    #[test]
    fn last_piece_len_counts_trailing_segment() {
        let tok = make_tokenizer();
        let allowed: HashSet<&str> = ["<|end|>"].into();
        let (tokens, last_len) = tok.encode("<|end|>Hello world", &allowed);
        assert_eq!(tokens[0], 50000);
        assert_eq!(last_len, tokens.len() - 1);
    }

    #[test]
    fn decode_unknown_rank_errors() {
        let tok = make_tokenizer();
        assert!(matches!(
            tok.decode_bytes(&[999_999]),
            Err(TokenizerError::UnknownToken(999_999))
        ));
    }

    #[test]
    fn decode_invalid_utf8_errors() {
        let tok = make_tokenizer();
        // 0xFF alone is never valid UTF-8, but decodes fine as bytes.
        assert_eq!(tok.decode_bytes(&[0xFF]).unwrap(), vec![0xFF]);
        assert!(matches!(
            tok.decode_utf8(&[0xFF]),
            Err(TokenizerError::InvalidUtf8)
        ));
    }

    #[test]
    fn arbitrary_bytes_roundtrip() {
        let tok = make_tokenizer();
        let bytes: Vec<u8> = (0u8..=255).collect();
        let tokens: Vec<Rank> = bytes.iter().map(|&b| b as Rank).collect();
        assert_eq!(tok.decode_bytes(&tokens).unwrap(), bytes);
    }

    #[test]
    fn construction_rejects_missing_byte() {
        let mut encoder = byte_vocab();
        encoder.remove([7u8].as_slice());
        assert!(matches!(
            Tokenizer::new(encoder, specials(), r"\S+|\s+"),
            Err(TokenizerError::Internal(_))
        ));
    }

    #[test]
    fn construction_rejects_rank_overlap() {
        let mut special = FxHashMap::default();
        special.insert("<|end|>".to_string(), 258); // collides with "Hello"
        assert!(matches!(
            Tokenizer::new(byte_vocab(), special, r"\S+|\s+"),
            Err(TokenizerError::Internal(_))
        ));
    }

    #[test]
    fn construction_rejects_duplicate_ordinary_rank() {
        let mut encoder = byte_vocab();
        encoder.insert(b"dup".to_vec(), 256); // collides with "He"
        assert!(matches!(
            Tokenizer::new(encoder, specials(), r"\S+|\s+"),
            Err(TokenizerError::Internal(_))
        ));
    }

    #[test]
    fn cache_fills_and_clears() {
        let tok = make_tokenizer();
        tok.encode_ordinary("abcdef");
        assert!(tok.cache_len() > 0);
        tok.clear_cache();
        assert_eq!(tok.cache_len(), 0);
    }

    #[test]
    fn shared_across_threads() {
        let tok = std::sync::Arc::new(make_tokenizer());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tok = std::sync::Arc::clone(&tok);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let tokens = tok.encode_ordinary("Hello world");
                        assert_eq!(tok.decode_utf8(&tokens).unwrap(), "Hello world");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn pretokenizer_partitions_input() {
        let tok = make_tokenizer();
        let text = "one two  three\n\nfour";
        let regex = fancy_regex::Regex::new(tok.pattern()).unwrap();
        let joined: String = regex
            .find_iter(text)
            .flatten()
            .map(|m| m.as_str())
            .collect();
        assert_eq!(joined, text);
    }
}

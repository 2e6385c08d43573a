//! Named encodings.
//!
//! [`load_harmony_encoding`] builds a ready-to-use [`HarmonyEncoding`] from
//! a name alone. `HarmonyGptOss` pairs the Harmony grammar with the
//! built-in `o200k_harmony` tokenizer: the full single-byte alphabet, a
//! compact merge table of common sequences, the o200k-style
//! pre-tokenization pattern, and the Harmony special tokens at ranks
//! 199998 and up. The special-token table and the grammar are the stable
//! contract; the merge table is internal.

use rustc_hash::FxHashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::core::{Rank, Tokenizer};
use crate::encoding::HarmonyEncoding;
use crate::error::{HarmonyError, Result};

/// Pre-tokenization pattern of the o200k family.
pub const O200K_HARMONY_PATTERN: &str = r"[^\r\n\p{L}\p{N}]?[\p{Lu}\p{Lt}\p{Lm}\p{Lo}\p{M}]*[\p{Ll}\p{Lm}\p{Lo}\p{M}]+(?i:'s|'t|'re|'ve|'m|'ll|'d)?|[^\r\n\p{L}\p{N}]?[\p{Lu}\p{Lt}\p{Lm}\p{Lo}\p{M}]+[\p{Ll}\p{Lm}\p{Lo}\p{M}]*(?i:'s|'t|'re|'ve|'m|'ll|'d)?|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// Special-token table of `o200k_harmony`.
pub const O200K_HARMONY_SPECIAL_TOKENS: &[(&str, Rank)] = &[
    ("<|startoftext|>", 199_998),
    ("<|endoftext|>", 199_999),
    ("<|start|>", 200_000),
    ("<|end|>", 200_001),
    ("<|message|>", 200_002),
    ("<|channel|>", 200_003),
    ("<|constrain|>", 200_004),
    ("<|call|>", 200_005),
    ("<|return|>", 200_006),
    ("<|system|>", 200_007),
    ("<|user|>", 200_008),
    ("<|assistant|>", 200_009),
    ("<|developer|>", 200_010),
    ("<|tool|>", 200_011),
];

// Merge table entries take ranks 256 + index, after the byte alphabet.
// Ordered roughly by frequency so lower ranks merge first.
const MERGES: &[&str] = &[
    // bigrams
    "th", "he", "in", "er", "an", "re", "on", "at", "en", "nd", "ti", "es", "or", "te", "of",
    "ed", "is", "it", "al", "ar", "st", "to", "nt", "ng", "se", "ha", "as", "ou", "io", "le",
    "ve", "co", "me", "de", "hi", "ri", "ro", "ic", "ne", "ea", "ra", "ce", "li", "ch", "ll",
    "be", "ma", "si", "om", "ur",
    // common words with a leading space, the shape the pre-tokenizer yields
    " the", " and", " to", " of", " a", " in", " is", " it", " you", " that", " he", " was",
    " for", " on", " are", " with", " as", " his", " they", " be", " at", " one", " have",
    " this", " from", " or", " had", " by", " not", " what", " all", " were", " we", " when",
    " your", " can", " said",
    // frequent stems
    "the", "and", "ing", "ion", "tion", "ent", "for", "her", "ter", "hat", "tha", "ere",
    "ate", "his", "con", "res", "ver", "all",
    // whitespace runs (single bytes already have their own ranks)
    "  ", "    ", "\n\n", "\r\n", " \n", "\n\n\n",
];

/// Registered encoding names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HarmonyEncodingName {
    /// The `o200k_harmony` vocabulary paired with the Harmony grammar.
    HarmonyGptOss,
}

impl HarmonyEncodingName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarmonyEncodingName::HarmonyGptOss => "HarmonyGptOss",
        }
    }
}

impl std::fmt::Display for HarmonyEncodingName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarmonyEncodingName {
    type Err = HarmonyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "HarmonyGptOss" => Ok(HarmonyEncodingName::HarmonyGptOss),
            other => Err(HarmonyError::Internal(format!(
                "unknown encoding name: {other}"
            ))),
        }
    }
}

fn o200k_harmony_tokenizer() -> Result<Tokenizer> {
    let mut encoder: FxHashMap<Vec<u8>, Rank> = FxHashMap::default();
    for byte in 0u8..=255 {
        encoder.insert(vec![byte], byte as Rank);
    }
    for (index, merge) in MERGES.iter().enumerate() {
        encoder.insert(merge.as_bytes().to_vec(), 256 + index as Rank);
    }

    let special_tokens: FxHashMap<String, Rank> = O200K_HARMONY_SPECIAL_TOKENS
        .iter()
        .map(|&(text, rank)| (text.to_string(), rank))
        .collect();

    Ok(Tokenizer::new(
        encoder,
        special_tokens,
        O200K_HARMONY_PATTERN,
    )?)
}

/// Build the named encoding. Construction takes no other inputs.
pub fn load_harmony_encoding(name: HarmonyEncodingName) -> Result<HarmonyEncoding> {
    match name {
        HarmonyEncodingName::HarmonyGptOss => {
            let tokenizer = Arc::new(o200k_harmony_tokenizer()?);
            HarmonyEncoding::new("HarmonyGptOss", tokenizer)
        }
    }
}

//! Tokenizer engine.
//!
//! - [`Tokenizer`]: encode/decode over disjoint ordinary and special
//!   vocabularies, with thread-slot regexes, Aho-Corasick special-token
//!   scanning, and an LRU cache for per-piece BPE results
//! - [`bpe`]: the byte-pair merge itself (min-heap over a linked list)
//! - [`vocab`]: tiktoken-format vocabulary parsing
//! - [`Utf8Assembler`]: UTF-8 assembly for token-at-a-time decoding

mod bpe;
mod streaming;
mod tokenizer;
mod vocab;

pub use bpe::{byte_pair_encode, byte_pair_merge};
pub use streaming::Utf8Assembler;
pub use tokenizer::{Rank, Tokenizer, TokenizerError, N_SLOTS};
pub use vocab::{build_decoder, load_tiktoken_bpe, load_tiktoken_bpe_file, VocabError};

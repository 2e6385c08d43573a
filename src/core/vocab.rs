//! Vocabulary loading for the tiktoken text format.
//!
//! Each line is a base64-encoded byte sequence, a space, and the integer
//! rank under which that sequence merges. Lower ranks merge first. The
//! format carries no special tokens; those are supplied separately at
//! tokenizer construction.

use base64::{engine::general_purpose::STANDARD, Engine};
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::tokenizer::Rank;

#[derive(Error, Debug)]
pub enum VocabError {
    #[error("invalid base64 token: {0}")]
    Base64Error(#[from] base64::DecodeError),
    #[error("invalid vocabulary line: {0}")]
    ParseError(String),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

fn parse_line(line: &[u8]) -> Result<(Vec<u8>, Rank), VocabError> {
    let space = line
        .iter()
        .rposition(|&b| b == b' ')
        .ok_or_else(|| VocabError::ParseError("missing space separator".to_string()))?;
    let token = STANDARD.decode(&line[..space])?;
    let rank_str = std::str::from_utf8(&line[space + 1..])
        .map_err(|_| VocabError::ParseError("rank is not valid UTF-8".to_string()))?;
    let rank: Rank = rank_str
        .trim()
        .parse()
        .map_err(|_| VocabError::ParseError(format!("invalid rank: {rank_str}")))?;
    Ok((token, rank))
}

/// Parse a tiktoken vocabulary from raw file contents.
pub fn load_tiktoken_bpe(data: &[u8]) -> Result<FxHashMap<Vec<u8>, Rank>, VocabError> {
    let mut encoder = FxHashMap::default();
    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let (token, rank) = parse_line(line)?;
        encoder.insert(token, rank);
    }
    Ok(encoder)
}

/// Parse a tiktoken vocabulary from a file on disk.
pub fn load_tiktoken_bpe_file(path: &str) -> Result<FxHashMap<Vec<u8>, Rank>, VocabError> {
    let data = std::fs::read(path)?;
    load_tiktoken_bpe(&data)
}

/// Invert an encoder map into the rank → bytes decoder.
pub fn build_decoder(encoder: &FxHashMap<Vec<u8>, Rank>) -> FxHashMap<Rank, Vec<u8>> {
    encoder.iter().map(|(k, v)| (*v, k.clone())).collect()
}

//! Deterministic block generation.
//!
//! A generator is a pure function of a stream position: block `n` is always the
//! same 16 bytes. Seeds and skips are both offsets into that single stream.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const BLOCK_BYTES: usize = 16;

pub type Block = [u8; BLOCK_BYTES];

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("stream position overflows: start {start} + count {count}")]
    PositionOverflow { start: u64, count: u64 },
    #[error("generator unavailable: {0}")]
    Unavailable(String),
}

/// Position of the last block in a run of `count` blocks from `start`, or `None`
/// when the run is empty or would pass `u64::MAX`.
pub fn last_position(start: u64, count: u64) -> Option<u64> {
    count.checked_sub(1).and_then(|tail| start.checked_add(tail))
}

pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;

    fn blocks(&self, start: u64, count: usize) -> Result<Vec<Block>, GeneratorError>;
}

/// Block `n` is the first 16 bytes of `SHA-256(domain || n as big-endian u64)`.
#[derive(Clone, Debug)]
pub struct HashChainGenerator {
    domain: Vec<u8>,
}

impl Default for HashChainGenerator {
    fn default() -> Self {
        Self::new(b"goldenseed/v1".to_vec())
    }
}

impl HashChainGenerator {
    pub fn new(domain: Vec<u8>) -> Self {
        Self { domain }
    }

    fn block_at(&self, position: u64) -> Block {
        let digest = Sha256::new()
            .chain_update(&self.domain)
            .chain_update(position.to_be_bytes())
            .finalize();
        let mut block = [0u8; BLOCK_BYTES];
        block.copy_from_slice(&digest[..BLOCK_BYTES]);
        block
    }
}

impl Generator for HashChainGenerator {
    fn name(&self) -> &'static str {
        "hash-chain"
    }

    fn blocks(&self, start: u64, count: usize) -> Result<Vec<Block>, GeneratorError> {
        let count_u64 = count as u64;
        if count_u64 > 0 && last_position(start, count_u64).is_none() {
            return Err(GeneratorError::PositionOverflow {
                start,
                count: count_u64,
            });
        }
        Ok((0..count_u64).map(|offset| self.block_at(start + offset)).collect())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Hex,
    Json,
    Binary,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockData {
    Text(Vec<String>),
    Bytes(Vec<Vec<u8>>),
}

impl BlockData {
    pub fn encode(blocks: &[Block], format: OutputFormat) -> Self {
        match format {
            OutputFormat::Hex => {
                BlockData::Text(blocks.iter().map(|block| hex_block(block)).collect())
            }
            OutputFormat::Json => {
                BlockData::Bytes(blocks.iter().map(|block| block.to_vec()).collect())
            }
            OutputFormat::Binary => {
                BlockData::Text(blocks.iter().map(|block| STANDARD.encode(block)).collect())
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BlockData::Text(items) => items.len(),
            BlockData::Bytes(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn hex_block(block: &Block) -> String {
    block.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// SHA-256 hex over the concatenated blocks.
pub fn verification_hash(blocks: &[Block]) -> String {
    let mut hasher = Sha256::new();
    for block in blocks {
        hasher.update(block);
    }
    format!("{:x}", hasher.finalize())
}

pub const VERIFY_PREFIX_CHARS: usize = 16;

pub fn verification_url(base_url: &str, hash: &str) -> String {
    let prefix = hash.get(..VERIFY_PREFIX_CHARS).unwrap_or(hash);
    format!("{}/{prefix}", base_url.trim_end_matches('/'))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub message: String,
}

/// Shape check only; no record of issued hashes is kept.
pub fn verify_hash_prefix(prefix: &str) -> VerifyOutcome {
    if prefix.len() < VERIFY_PREFIX_CHARS {
        return VerifyOutcome {
            valid: false,
            message: format!("hash prefix too short (min {VERIFY_PREFIX_CHARS} chars)"),
        };
    }
    if !prefix.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return VerifyOutcome {
            valid: false,
            message: "hash prefix must be hexadecimal".to_string(),
        };
    }
    VerifyOutcome {
        valid: true,
        message: "hash prefix is well-formed".to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoinflipStats {
    pub heads: u64,
    pub tails: u64,
    pub total: u64,
    pub heads_ratio: f64,
    pub perfect_balance: bool,
    pub message: String,
}

/// One flip per block, taken from the low bit of its first byte.
pub fn coinflip_stats(blocks: &[Block]) -> CoinflipStats {
    let total = blocks.len() as u64;
    let heads = blocks.iter().filter(|block| block[0] & 1 == 1).count() as u64;
    let ratio = if total == 0 {
        0.0
    } else {
        heads as f64 / total as f64
    };
    let perfect_balance = total > 0 && (ratio - 0.5).abs() < 0.001;
    let message = if perfect_balance {
        format!("generated {total} flips within 0.1% of an even split")
    } else {
        "distribution within expected variance".to_string()
    };
    CoinflipStats {
        heads,
        tails: total - heads,
        total,
        heads_ratio: (ratio * 1_000_000.0).round() / 1_000_000.0,
        perfect_balance,
        message,
    }
}

// Perceptual hashing and the flat allow/block list files.
//
// A hash is kept as raw bytes plus its lowercase hex form. The hex length is
// what distinguishes hash sizes in the list files, so exact lookups are
// bucketed by it and nearest-neighbour search only compares hashes of the
// same length.

pub mod list;
pub mod store;

use std::fmt;

use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig};

pub use list::{ListEntry, ListIndex, ListKind, MatchMode, PhashMatch};
pub use store::PhashStore;

/// Side length of the hash grid (8x8 = 64 bits = 16 hex chars).
const HASH_SIZE: u32 = 8;

/// A perceptual hash in both byte and hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PerceptualHash {
    bytes: Vec<u8>,
    hex: String,
}

impl PerceptualHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            hex: hex::encode(bytes),
        }
    }

    /// Parse a hex string as found in list files. Case and surrounding
    /// whitespace are ignored; odd-length strings are left-padded for
    /// decoding but keep their original length for bucketing.
    pub fn from_hex(raw: &str) -> Option<Self> {
        let hex = raw.trim().to_ascii_lowercase();
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let padded = if hex.len() % 2 == 1 {
            format!("0{hex}")
        } else {
            hex.clone()
        };
        let bytes = hex::decode(padded).ok()?;
        Some(Self { bytes, hex })
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn hex_len(&self) -> usize {
        self.hex.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hamming distance, or `None` when the hashes have different lengths.
    pub fn distance(&self, other: &PerceptualHash) -> Option<u32> {
        if self.hex_len() != other.hex_len() {
            return None;
        }
        Some(
            self.bytes
                .iter()
                .zip(&other.bytes)
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

/// DCT-based perceptual hash of an image.
pub fn compute(image: &DynamicImage) -> PerceptualHash {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Median)
        .hash_size(HASH_SIZE, HASH_SIZE)
        .preproc_dct()
        .to_hasher();
    let hash = hasher.hash_image(image);
    PerceptualHash::from_bytes(hash.as_bytes())
}

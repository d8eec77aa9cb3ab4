//! Symmetric packet crypto and payload compression.
//!
//! Each direction of a peer session carries an independent cipher, MAC
//! digest, and compression level. The cipher context holds the whole IV;
//! nothing cipher-related travels in the packet.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use subtle::ConstantTimeEq;

use crate::error::CodecError;
use crate::frame::MAX_DIGEST_LEN;

/// Compression disabled.
pub const COMPRESS_NONE: u8 = 0;
/// Highest zlib level.
pub const COMPRESS_ZLIB_MAX: u8 = 9;
/// Fast single-pass compression.
pub const COMPRESS_FAST: u8 = 10;
/// Best-effort compression.
pub const COMPRESS_BEST: u8 = 11;

const FAST_LEVEL: i32 = 1;
const BEST_LEVEL: i32 = 19;

/// A symmetric packet cipher bound to one direction of one peer session.
///
/// Encrypt and decrypt are the same in-place keystream application over the
/// `(seqno || payload)` region and never enlarge the buffer.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
    nonce: [u8; 12],
}

impl Cipher {
    pub fn new(key: [u8; 32], nonce: [u8; 12]) -> Self {
        Self { key, nonce }
    }

    pub fn apply(&self, buf: &mut [u8]) {
        let mut cipher = ChaCha20::new(&self.key.into(), &self.nonce.into());
        cipher.apply_keystream(buf);
    }
}

/// Keyed MAC over the `(seqno || payload)` region, truncated to `len` bytes.
#[derive(Clone)]
pub struct Digest {
    key: [u8; 32],
    len: usize,
}

impl Digest {
    /// `len` is the tag length appended to each packet, 1..=32 bytes.
    pub fn new(key: [u8; 32], len: usize) -> Self {
        assert!((1..=MAX_DIGEST_LEN).contains(&len));
        Self { key, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Writes the tag for `region` into `tag_out` (exactly `len` bytes).
    pub fn create(&self, region: &[u8], tag_out: &mut [u8]) {
        let hash = blake3::keyed_hash(&self.key, region);
        tag_out.copy_from_slice(&hash.as_bytes()[..self.len]);
    }

    /// Constant-time check of `tag` against the tag for `region`.
    pub fn verify(&self, region: &[u8], tag: &[u8]) -> bool {
        if tag.len() != self.len {
            return false;
        }
        let hash = blake3::keyed_hash(&self.key, region);
        bool::from(hash.as_bytes()[..self.len].ct_eq(tag))
    }
}

/// Compresses `src` into `dst` and returns the compressed length.
///
/// Levels 1..=9 select zlib at that level; 10 and 11 select the fast and
/// best dictionary-free levels. Output that does not fit `dst` is an error.
pub fn compress(level: u8, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
    match level {
        1..=COMPRESS_ZLIB_MAX => {
            let mut deflate =
                flate2::Compress::new(flate2::Compression::new(u32::from(level)), true);
            match deflate.compress(src, dst, flate2::FlushCompress::Finish) {
                Ok(flate2::Status::StreamEnd) => Ok(deflate.total_out() as usize),
                _ => Err(CodecError::Compress),
            }
        }
        COMPRESS_FAST => {
            zstd::bulk::compress_to_buffer(src, dst, FAST_LEVEL).map_err(|_| CodecError::Compress)
        }
        COMPRESS_BEST => {
            zstd::bulk::compress_to_buffer(src, dst, BEST_LEVEL).map_err(|_| CodecError::Compress)
        }
        _ => Err(CodecError::UnsupportedLevel(level)),
    }
}

/// Decompresses `src` into `dst` and returns the decompressed length.
///
/// Decompression is bounded by `dst`; corrupt or oversized input fails.
pub fn decompress(level: u8, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
    if level > COMPRESS_ZLIB_MAX {
        zstd::bulk::decompress_to_buffer(src, dst).map_err(|_| CodecError::Decompress)
    } else if level >= 1 {
        let mut inflate = flate2::Decompress::new(true);
        match inflate.decompress(src, dst, flate2::FlushDecompress::Finish) {
            Ok(flate2::Status::StreamEnd) => Ok(inflate.total_out() as usize),
            _ => Err(CodecError::Decompress),
        }
    } else {
        Err(CodecError::UnsupportedLevel(level))
    }
}

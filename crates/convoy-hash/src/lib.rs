#![deny(clippy::all)]

//! Canonical serialization and stable fingerprints.
//!
//! Every hashable input in convoy is serialized through [`CanonicalEncoder`]
//! before being digested. The encoding is deliberately hand-written rather
//! than derived from a generic serializer: the byte layout is the public
//! contract of every fingerprint, and reordering a field is a cache-busting
//! breaking change that should be visible as a diff in this crate.
//!
//! Layout rules:
//! - strings are UTF-8 bytes prefixed with a little-endian u32 length
//! - integers are little-endian fixed width
//! - booleans are one byte (`0`/`1`)
//! - enums are a single frozen byte code
//! - optional values carry a one-byte presence marker, so `None` and
//!   "present but empty" digest differently
//! - sequences are prefixed with a little-endian u32 element count
//! - maps are serialized as sequences of `(key, value)` pairs and must be
//!   sorted by key before encoding
//!
//! The digest is XXH64 with seed 0, rendered as 16 lowercase hex characters.

use std::hash::Hasher;

use twox_hash::XxHash64;

/// Appends canonically-encoded values to an in-memory buffer.
#[derive(Default)]
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_len(value.len());
        self.buffer.extend_from_slice(value.as_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    /// Enum codes are frozen forever; bump the global cache key instead of
    /// renumbering.
    pub fn write_enum(&mut self, code: u8) {
        self.buffer.push(code);
    }

    pub fn write_option<T>(&mut self, value: Option<T>, mut write: impl FnMut(&mut Self, T)) {
        match value {
            None => self.buffer.push(0),
            Some(inner) => {
                self.buffer.push(1);
                write(self, inner);
            }
        }
    }

    pub fn write_str_seq<S: AsRef<str>>(&mut self, values: impl ExactSizeIterator<Item = S>) {
        self.write_len(values.len());
        for value in values {
            self.write_str(value.as_ref());
        }
    }

    /// Writes a map as a `(key, value)` sequence. Callers must pass entries
    /// already sorted by key.
    pub fn write_sorted_map<'a>(
        &mut self,
        entries: impl ExactSizeIterator<Item = (&'a str, &'a str)>,
    ) {
        self.write_len(entries.len());
        let mut previous: Option<String> = None;
        for (key, value) in entries {
            debug_assert!(
                previous.as_deref().map_or(true, |prev| prev <= key),
                "map entries must be pre-sorted by key"
            );
            previous = Some(key.to_string());
            self.write_str(key);
            self.write_str(value);
        }
    }

    fn write_len(&mut self, len: usize) {
        let len = u32::try_from(len).expect("hashable collections fit in u32");
        self.buffer.extend_from_slice(&len.to_le_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Digests the canonical encoding of a value into a 16-hex-char fingerprint.
pub trait StableHash {
    /// Writes the canonical encoding of `self` into the encoder. Field order
    /// is part of the hash contract.
    fn encode(&self, encoder: &mut CanonicalEncoder);

    fn hash(&self) -> String {
        let mut encoder = CanonicalEncoder::new();
        self.encode(&mut encoder);
        hash_bytes(&encoder.finish())
    }
}

/// XXH64 (seed 0) over raw bytes, rendered as 16 lowercase hex chars.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    format!("{:016x}", hasher.finish())
}

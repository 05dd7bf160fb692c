//! Decryption of encrypted bundle files.
//!
//! Strategies are registered by key in a [`DecryptorRegistry`] at startup and
//! selected through configuration. A strategy can open a file in one of two
//! ways ([`DecryptionMode`]):
//!
//! - `FileOffset`: the payload is stored in the clear after a prefix; the
//!   loader seeks past it without buffering the whole file
//! - `FullBuffer`: the file is read into memory and transformed

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{BundleError, BundleResult};

/// Key of the built-in prefix strategy.
pub const OFFSET_DECRYPTOR: &str = "offset";

/// Key of the built-in XOR strategy.
pub const XOR_DECRYPTOR: &str = "xor";

/// Prefix length used by the built-in offset strategy.
pub const DEFAULT_FILE_OFFSET: u64 = 32;

const DEFAULT_XOR_KEY: &[u8] = b"bundleflow";

/// How an encrypted file is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecryptionMode {
    #[default]
    FileOffset,
    FullBuffer,
}

impl fmt::Display for DecryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileOffset => write!(f, "file_offset"),
            Self::FullBuffer => write!(f, "full_buffer"),
        }
    }
}

impl FromStr for DecryptionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file_offset" | "offset" => Ok(Self::FileOffset),
            "full_buffer" | "buffer" => Ok(Self::FullBuffer),
            other => Err(format!("unknown decryption mode '{}'", other)),
        }
    }
}

/// A decryption strategy.
pub trait Decryptor: Send + Sync + fmt::Debug {
    /// Registry key of this strategy.
    fn name(&self) -> &str;

    /// Bytes to skip in `FileOffset` mode, or `None` if the strategy needs
    /// the whole buffer.
    fn file_offset(&self, bundle: &str) -> Option<u64>;

    /// Decrypt a whole file in `FullBuffer` mode.
    fn decrypt(&self, bundle: &str, data: Vec<u8>) -> BundleResult<Vec<u8>>;
}

/// Payload stored after a fixed-length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetDecryptor {
    offset: u64,
}

impl OffsetDecryptor {
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Wrap a payload the way this strategy expects it on disk.
    pub fn encrypt(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; self.offset as usize];
        out.extend_from_slice(payload);
        out
    }
}

impl Decryptor for OffsetDecryptor {
    fn name(&self) -> &str {
        OFFSET_DECRYPTOR
    }

    fn file_offset(&self, _bundle: &str) -> Option<u64> {
        Some(self.offset)
    }

    fn decrypt(&self, bundle: &str, mut data: Vec<u8>) -> BundleResult<Vec<u8>> {
        let offset = self.offset as usize;
        if data.len() < offset {
            return Err(BundleError::Decryption {
                bundle: bundle.to_string(),
                reason: format!("file shorter than {} byte prefix", offset),
            });
        }
        data.drain(..offset);
        Ok(data)
    }
}

/// Repeating-key XOR over the whole file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorDecryptor {
    key: Vec<u8>,
}

impl XorDecryptor {
    /// Create the strategy. An empty key falls back to the default key.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        Self {
            key: if key.is_empty() {
                DEFAULT_XOR_KEY.to_vec()
            } else {
                key
            },
        }
    }

    /// XOR is symmetric.
    pub fn encrypt(&self, payload: &[u8]) -> Vec<u8> {
        self.apply(payload.to_vec())
    }

    fn apply(&self, mut data: Vec<u8>) -> Vec<u8> {
        for (byte, k) in data.iter_mut().zip(self.key.iter().cycle()) {
            *byte ^= k;
        }
        data
    }
}

impl Decryptor for XorDecryptor {
    fn name(&self) -> &str {
        XOR_DECRYPTOR
    }

    fn file_offset(&self, _bundle: &str) -> Option<u64> {
        None
    }

    fn decrypt(&self, _bundle: &str, data: Vec<u8>) -> BundleResult<Vec<u8>> {
        Ok(self.apply(data))
    }
}

type Factory = Box<dyn Fn() -> Arc<dyn Decryptor> + Send + Sync>;

/// Decryption strategies by key.
pub struct DecryptorRegistry {
    factories: BTreeMap<String, Factory>,
}

impl fmt::Debug for DecryptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptorRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl Default for DecryptorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl DecryptorRegistry {
    /// A registry without any strategy.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry holding the built-in `offset` and `xor` strategies.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(OFFSET_DECRYPTOR, || {
            Arc::new(OffsetDecryptor::new(DEFAULT_FILE_OFFSET))
        });
        registry.register(XOR_DECRYPTOR, || {
            Arc::new(XorDecryptor::new(DEFAULT_XOR_KEY))
        });
        registry
    }

    /// Register a strategy, replacing any previous one under `key`.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Decryptor> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Box::new(factory));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate the strategy registered under `key`.
    pub fn create(&self, key: &str) -> BundleResult<Arc<dyn Decryptor>> {
        self.factories
            .get(key)
            .map(|factory| factory())
            .ok_or_else(|| BundleError::Config(format!("unknown decryption strategy '{}'", key)))
    }
}

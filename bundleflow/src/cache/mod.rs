//! Local bundle cache.
//!
//! The cache is a directory of bundle files named by content hash plus an
//! index of the hashes known to be fully downloaded and verified. The index
//! is stamped with the app build version; opening the cache with a different
//! build version discards everything ("dirty sandbox" recovery).

mod layout;
mod store;

pub use layout::{
    StorageLayout, CACHE_DIRNAME, CACHE_INDEX_FILENAME, MANIFEST_FILENAME, PARTIAL_SUFFIX,
    STAMP_FILENAME,
};
pub use store::{CacheRecord, CacheStats, CacheStore, ClearResult, OpenOutcome};

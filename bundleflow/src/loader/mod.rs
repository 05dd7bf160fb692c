//! Bundle loading.
//!
//! Application code opens bundles by name through the [`Registry`]. Each
//! bundle in use gets one [`LoaderRecord`] that resolves, downloads, verifies,
//! decrypts and opens it once its dependencies are loaded. Asset requests are
//! served by [`ProviderRecord`]s layered on top of a loader.
//!
//! Everything advances from [`Registry::tick`]; nothing blocks except the
//! bounded `wait_for_*` helpers.

pub mod archive;
pub mod bundle;
pub mod decrypt;
pub mod provider;
pub mod registry;
pub mod scene;
pub mod source;

pub use archive::{ArchiveEntry, AssetKind, BundleArchive};
pub use bundle::{open_bundle, LoadedAsset, LoaderId, LoaderRecord, LoaderState, OpenedBundle};
pub use decrypt::{
    DecryptionMode, Decryptor, DecryptorRegistry, OffsetDecryptor, XorDecryptor,
    OFFSET_DECRYPTOR, XOR_DECRYPTOR,
};
pub use provider::{
    AssetObject, AssetRequest, ProviderId, ProviderKey, ProviderRecord, ProviderState,
    RequestKind,
};
pub use registry::{
    AssetHandle, BundleHandle, ForceUnloadReport, Handle, LoadContext, Registry, RegistryConfig,
    DEFAULT_WAIT_CEILING,
};
pub use scene::{MemorySceneHost, SceneHost, SceneId, SceneMode, SceneRecord};
pub use source::{LoaderSource, Location};

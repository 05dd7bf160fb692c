//! Per-bundle loader.
//!
//! # State Machine
//!
//! ```text
//! None --[remote]--> Download --> CheckDownload --[verified]--> CheckDepends
//! None --[local or directory]--------------------------------> CheckDepends
//! None --[unresolved]--> Fail
//! CheckDepends --[all dependencies Success]--> LoadFile --> CheckFile --> Success
//! CheckDepends --[any dependency Fail]--> Fail
//! CheckFile --[invalid container]--> Fail
//! ```
//!
//! A loader never reaches `Success` while one of its dependencies is still
//! loading. `Fail` is left only through [`LoaderRecord::retry`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::archive::{AssetKind, BundleArchive};
use super::decrypt::{DecryptionMode, Decryptor};
use super::provider::ProviderId;
use super::source::{list_directory, Location, SIMULATED_SCENE_EXTENSION};
use crate::cache::CacheStore;
use crate::download::{BatchStatus, DownloadContext, DownloadOptions, Downloader};
use crate::error::{BundleError, BundleResult};
use crate::manifest::ManifestEntry;
use crate::verify::verify_file;

/// Identifier of a loader record. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoaderId(pub(crate) u64);

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    None,
    Download,
    CheckDownload,
    CheckDepends,
    LoadFile,
    CheckFile,
    Success,
    Fail,
}

impl LoaderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }
}

/// One asset extracted from an opened bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedAsset {
    pub path: String,
    pub kind: AssetKind,
    pub data: Vec<u8>,
}

/// An opened bundle, owned by exactly one loader.
#[derive(Debug, Clone)]
pub enum OpenedBundle {
    Archive(BundleArchive),
    Raw(Vec<u8>),
    /// Unpacked directory: relative asset path to file.
    Directory(BTreeMap<String, PathBuf>),
}

impl OpenedBundle {
    /// Look up a single asset.
    pub fn asset(&self, bundle: &str, name: &str) -> BundleResult<LoadedAsset> {
        let unknown = || BundleError::UnknownAsset {
            bundle: bundle.to_string(),
            asset: name.to_string(),
        };
        match self {
            Self::Archive(archive) => archive
                .get(name)
                .map(|e| LoadedAsset {
                    path: e.path.clone(),
                    kind: e.kind,
                    data: e.data.clone(),
                })
                .ok_or_else(unknown),
            Self::Directory(files) => {
                let (key, path) = files
                    .get_key_value(name)
                    .or_else(|| {
                        files
                            .iter()
                            .find(|(k, _)| strip_extension(k) == Some(name))
                    })
                    .ok_or_else(unknown)?;
                read_directory_asset(key, path)
            }
            Self::Raw(_) => Err(unknown()),
        }
    }

    /// All assets stored below `name/`.
    pub fn sub_assets(&self, bundle: &str, name: &str) -> BundleResult<Vec<LoadedAsset>> {
        let assets: Vec<LoadedAsset> = match self {
            Self::Archive(archive) => archive
                .sub_assets(name)
                .map(|e| LoadedAsset {
                    path: e.path.clone(),
                    kind: e.kind,
                    data: e.data.clone(),
                })
                .collect(),
            Self::Directory(files) => files
                .iter()
                .filter(|(k, _)| super::archive::is_below(k, name))
                .map(|(k, p)| read_directory_asset(k, p))
                .collect::<BundleResult<_>>()?,
            Self::Raw(_) => Vec::new(),
        };
        if assets.is_empty() {
            return Err(BundleError::UnknownAsset {
                bundle: bundle.to_string(),
                asset: name.to_string(),
            });
        }
        Ok(assets)
    }

    /// The whole payload of a raw-file bundle.
    pub fn raw(&self, bundle: &str) -> BundleResult<Vec<u8>> {
        match self {
            Self::Raw(data) => Ok(data.clone()),
            _ => Err(BundleError::InvalidContainer {
                bundle: bundle.to_string(),
                reason: "not a raw file".to_string(),
            }),
        }
    }
}

fn strip_extension(key: &str) -> Option<&str> {
    let (stem, ext) = key.rsplit_once('.')?;
    (!ext.contains('/')).then_some(stem)
}

fn read_directory_asset(key: &str, path: &Path) -> BundleResult<LoadedAsset> {
    let data = fs::read(path).map_err(|e| BundleError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    let kind = if path
        .extension()
        .is_some_and(|ext| ext == SIMULATED_SCENE_EXTENSION)
    {
        AssetKind::Scene
    } else {
        AssetKind::Object
    };
    Ok(LoadedAsset {
        path: key.to_string(),
        kind,
        data,
    })
}

/// Read a bundle file, decrypting it when the entry is encrypted.
fn read_payload(
    entry: &ManifestEntry,
    path: &Path,
    decryptor: Option<&dyn Decryptor>,
    mode: DecryptionMode,
) -> BundleResult<Vec<u8>> {
    let read_err = |e| BundleError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if !entry.flags.is_encrypted {
        return fs::read(path).map_err(read_err);
    }

    let decryptor = decryptor.ok_or_else(|| BundleError::Decryption {
        bundle: entry.name.clone(),
        reason: "no decryption strategy configured".to_string(),
    })?;

    match mode {
        DecryptionMode::FileOffset => {
            let offset =
                decryptor
                    .file_offset(&entry.name)
                    .ok_or_else(|| BundleError::Decryption {
                        bundle: entry.name.clone(),
                        reason: format!("'{}' does not support file_offset mode", decryptor.name()),
                    })?;
            let mut file = File::open(path).map_err(read_err)?;
            file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
            let mut data = Vec::new();
            file.read_to_end(&mut data).map_err(read_err)?;
            Ok(data)
        }
        DecryptionMode::FullBuffer => {
            let data = fs::read(path).map_err(read_err)?;
            decryptor.decrypt(&entry.name, data)
        }
    }
}

/// Open a bundle file as a container or raw blob.
pub fn open_bundle(
    entry: &ManifestEntry,
    path: &Path,
    decryptor: Option<&dyn Decryptor>,
    mode: DecryptionMode,
) -> BundleResult<OpenedBundle> {
    let payload = read_payload(entry, path, decryptor, mode)?;
    if entry.flags.is_raw_file {
        Ok(OpenedBundle::Raw(payload))
    } else {
        BundleArchive::from_bytes(&entry.name, &payload).map(OpenedBundle::Archive)
    }
}

/// Aggregate state of a loader's dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DependencyStatus {
    Pending,
    Ready,
    /// Name of the first failed dependency.
    Failed(String),
}

/// Collaborators a loader needs while advancing.
pub(crate) struct LoadEnv<'a> {
    pub cache: &'a mut CacheStore,
    pub download: Option<&'a DownloadContext>,
    pub download_options: DownloadOptions,
    pub decryptor: Option<&'a dyn Decryptor>,
    pub decryption_mode: DecryptionMode,
}

/// Loader for one bundle.
#[derive(Debug)]
pub struct LoaderRecord {
    id: LoaderId,
    entry: ManifestEntry,
    location: Location,
    state: LoaderState,
    pub(crate) ref_count: i32,
    pub(crate) dependencies: Vec<LoaderId>,
    pub(crate) masters: Vec<LoaderId>,
    pub(crate) providers: BTreeSet<ProviderId>,
    bundle: Option<OpenedBundle>,
    opening: Option<BundleResult<OpenedBundle>>,
    download: Option<Downloader>,
    error: Option<BundleError>,
}

impl LoaderRecord {
    pub(crate) fn new(
        id: LoaderId,
        entry: ManifestEntry,
        location: Location,
        dependencies: Vec<LoaderId>,
    ) -> Self {
        Self {
            id,
            entry,
            location,
            state: LoaderState::None,
            ref_count: 0,
            dependencies,
            masters: Vec::new(),
            providers: BTreeSet::new(),
            bundle: None,
            opening: None,
            download: None,
            error: None,
        }
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn entry(&self) -> &ManifestEntry {
        &self.entry
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    pub fn dependencies(&self) -> &[LoaderId] {
        &self.dependencies
    }

    pub fn masters(&self) -> &[LoaderId] {
        &self.masters
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn bundle(&self) -> Option<&OpenedBundle> {
        self.bundle.as_ref()
    }

    pub fn error(&self) -> Option<&BundleError> {
        self.error.as_ref()
    }

    /// Load progress in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        match self.state {
            LoaderState::None => 0.0,
            LoaderState::Download | LoaderState::CheckDownload => self
                .download
                .as_ref()
                .map(|d| d.progress().ratio() * 0.9)
                .unwrap_or(0.0),
            LoaderState::CheckDepends | LoaderState::LoadFile | LoaderState::CheckFile => 0.9,
            LoaderState::Success | LoaderState::Fail => 1.0,
        }
    }

    /// Terminal, unreferenced, and without providers. Masters are checked by
    /// the registry.
    pub(crate) fn is_idle(&self) -> bool {
        self.state.is_terminal() && self.ref_count <= 0 && self.providers.is_empty()
    }

    /// Leave `Fail` and start over from `location`.
    pub fn retry(&mut self, location: Location) {
        if self.state == LoaderState::Fail {
            debug!(bundle = %self.entry.name, "Retrying loader");
            self.location = location;
            self.state = LoaderState::None;
            self.error = None;
            self.download = None;
            self.opening = None;
        }
    }

    /// Fail the loader unless it is already terminal.
    pub(crate) fn fail(&mut self, err: BundleError) {
        if !self.state.is_terminal() {
            self.fail_with(err);
        }
    }

    fn fail_with(&mut self, err: BundleError) {
        warn!(bundle = %self.entry.name, error = %err, "Bundle load failed");
        if let Some(download) = self.download.as_mut() {
            download.cancel();
        }
        self.state = LoaderState::Fail;
        self.error = Some(err);
    }

    fn enter(&mut self, state: LoaderState) {
        debug!(bundle = %self.entry.name, from = ?self.state, to = ?state, "Loader transition");
        self.state = state;
    }

    /// Advance as far as possible this tick.
    pub(crate) fn update(&mut self, env: &mut LoadEnv<'_>, deps: &DependencyStatus) {
        loop {
            let before = self.state;
            self.step(env, deps);
            if self.state == before || self.state.is_terminal() {
                break;
            }
        }
    }

    fn step(&mut self, env: &mut LoadEnv<'_>, deps: &DependencyStatus) {
        match self.state {
            LoaderState::None => match &self.location {
                Location::Unresolved => {
                    self.fail_with(BundleError::Unresolvable(self.entry.name.clone()))
                }
                Location::Remote => self.enter(LoaderState::Download),
                Location::Local(_) | Location::Directory(_) => {
                    self.enter(LoaderState::CheckDepends)
                }
            },
            LoaderState::Download => match env.download {
                Some(context) => {
                    self.download = Some(Downloader::submit(
                        context.clone(),
                        vec![self.entry.clone()],
                        env.download_options,
                    ));
                    self.enter(LoaderState::CheckDownload);
                }
                None => self.fail_with(BundleError::Unresolvable(self.entry.name.clone())),
            },
            LoaderState::CheckDownload => {
                let Some(download) = self.download.as_mut() else {
                    self.enter(LoaderState::Download);
                    return;
                };
                if !download.poll(env.cache) {
                    return;
                }
                let status = download.status();
                let err = download.take_last_error();
                self.download = None;

                if status != BatchStatus::Succeeded {
                    self.fail_with(err.unwrap_or(BundleError::Cancelled));
                    return;
                }
                let path = env.cache.cached_path(&self.entry.content_hash);
                match verify_file(&path, &self.entry, env.download_options.verify_level) {
                    Ok(()) => {
                        self.location = Location::Local(path);
                        self.enter(LoaderState::CheckDepends);
                    }
                    Err(e) => self.fail_with(e),
                }
            }
            LoaderState::CheckDepends => match deps {
                DependencyStatus::Pending => {}
                DependencyStatus::Ready => self.enter(LoaderState::LoadFile),
                DependencyStatus::Failed(dependency) => {
                    self.fail_with(BundleError::DependencyFailed {
                        bundle: self.entry.name.clone(),
                        dependency: dependency.clone(),
                    })
                }
            },
            LoaderState::LoadFile => {
                let opened = match &self.location {
                    Location::Local(path) => {
                        open_bundle(&self.entry, path, env.decryptor, env.decryption_mode)
                    }
                    Location::Directory(dir) => {
                        list_directory(&self.entry.name, dir).map(OpenedBundle::Directory)
                    }
                    Location::Remote | Location::Unresolved => {
                        Err(BundleError::Unresolvable(self.entry.name.clone()))
                    }
                };
                self.opening = Some(opened);
                self.enter(LoaderState::CheckFile);
            }
            LoaderState::CheckFile => match self.opening.take() {
                Some(Ok(bundle)) => {
                    self.bundle = Some(bundle);
                    self.enter(LoaderState::Success);
                }
                Some(Err(e)) => self.fail_with(e),
                None => self.enter(LoaderState::LoadFile),
            },
            LoaderState::Success | LoaderState::Fail => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StorageLayout;
    use crate::loader::decrypt::{OffsetDecryptor, XorDecryptor};
    use crate::manifest::EntryFlags;
    use crate::verify::digest_bytes;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CacheStore) {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path().join("builtin"), temp.path().join("sandbox"));
        let (cache, _) = CacheStore::open(layout, "1.0").unwrap();
        (temp, cache)
    }

    fn env(cache: &mut CacheStore) -> LoadEnv<'_> {
        LoadEnv {
            cache,
            download: None,
            download_options: DownloadOptions::default(),
            decryptor: None,
            decryption_mode: DecryptionMode::FileOffset,
        }
    }

    fn write_archive(cache: &CacheStore, name: &str) -> (ManifestEntry, PathBuf) {
        let bytes = BundleArchive::new()
            .with_object("logo", b"png".to_vec())
            .to_bytes()
            .unwrap();
        let d = digest_bytes(&bytes);
        let path = cache.cached_path(&d.content_hash);
        fs::write(&path, &bytes).unwrap();
        (
            ManifestEntry::new(name, d.content_hash, d.checksum, d.size_bytes, 1),
            path,
        )
    }

    #[test]
    fn test_local_bundle_loads_when_dependencies_ready() {
        let (_temp, mut cache) = setup();
        let (entry, path) = write_archive(&cache, "ui");
        let mut loader = LoaderRecord::new(LoaderId(1), entry, Location::Local(path), vec![]);

        loader.update(&mut env(&mut cache), &DependencyStatus::Pending);
        assert_eq!(loader.state(), LoaderState::CheckDepends);

        loader.update(&mut env(&mut cache), &DependencyStatus::Ready);
        assert_eq!(loader.state(), LoaderState::Success);
        let asset = loader.bundle().unwrap().asset("ui", "logo").unwrap();
        assert_eq!(asset.data, b"png");
    }

    #[test]
    fn test_dependency_failure_propagates() {
        let (_temp, mut cache) = setup();
        let (entry, path) = write_archive(&cache, "ui");
        let mut loader = LoaderRecord::new(LoaderId(1), entry, Location::Local(path), vec![]);

        loader.update(
            &mut env(&mut cache),
            &DependencyStatus::Failed("core".to_string()),
        );
        assert_eq!(loader.state(), LoaderState::Fail);
        assert!(matches!(
            loader.error(),
            Some(BundleError::DependencyFailed { dependency, .. }) if dependency == "core"
        ));
    }

    #[test]
    fn test_unresolved_fails_and_retry_restarts() {
        let (_temp, mut cache) = setup();
        let (entry, path) = write_archive(&cache, "ui");
        let mut loader = LoaderRecord::new(LoaderId(1), entry, Location::Unresolved, vec![]);

        loader.update(&mut env(&mut cache), &DependencyStatus::Ready);
        assert_eq!(loader.state(), LoaderState::Fail);
        assert_eq!(loader.progress(), 1.0);

        loader.retry(Location::Local(path));
        assert_eq!(loader.state(), LoaderState::None);
        loader.update(&mut env(&mut cache), &DependencyStatus::Ready);
        assert_eq!(loader.state(), LoaderState::Success);
    }

    #[test]
    fn test_invalid_container_fails() {
        let (_temp, mut cache) = setup();
        let path = cache.cached_path("junk");
        fs::write(&path, b"junk").unwrap();
        let entry = ManifestEntry::new("junk", "junk", "0", 4, 1);
        let mut loader = LoaderRecord::new(LoaderId(1), entry, Location::Local(path), vec![]);

        loader.update(&mut env(&mut cache), &DependencyStatus::Ready);
        assert!(matches!(
            loader.error(),
            Some(BundleError::InvalidContainer { .. })
        ));
    }

    #[test]
    fn test_encrypted_bundle_modes() {
        let temp = TempDir::new().unwrap();
        let payload = BundleArchive::new()
            .with_object("a", b"1".to_vec())
            .to_bytes()
            .unwrap();
        let entry = ManifestEntry::new("enc", "h", "0", 0, 1).with_flags(EntryFlags {
            is_encrypted: true,
            ..EntryFlags::default()
        });

        let offset = OffsetDecryptor::new(8);
        let path = temp.path().join("offset");
        fs::write(&path, offset.encrypt(&payload)).unwrap();
        let opened = open_bundle(
            &entry,
            &path,
            Some(&offset as &dyn Decryptor),
            DecryptionMode::FileOffset,
        )
        .unwrap();
        assert_eq!(opened.asset("enc", "a").unwrap().data, b"1");

        let xor = XorDecryptor::new(b"key".to_vec());
        let path = temp.path().join("xor");
        fs::write(&path, xor.encrypt(&payload)).unwrap();
        assert!(open_bundle(
            &entry,
            &path,
            Some(&xor as &dyn Decryptor),
            DecryptionMode::FullBuffer
        )
        .is_ok());
        assert!(matches!(
            open_bundle(&entry, &path, Some(&xor as &dyn Decryptor), DecryptionMode::FileOffset),
            Err(BundleError::Decryption { .. })
        ));
        assert!(matches!(
            open_bundle(&entry, &path, None, DecryptionMode::FullBuffer),
            Err(BundleError::Decryption { .. })
        ));
    }

    #[test]
    fn test_raw_file_bundle() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("raw");
        fs::write(&path, b"{\"k\":1}").unwrap();
        let entry = ManifestEntry::new("config", "h", "0", 0, 1).with_flags(EntryFlags {
            is_raw_file: true,
            ..EntryFlags::default()
        });

        let opened = open_bundle(&entry, &path, None, DecryptionMode::FileOffset).unwrap();
        assert_eq!(opened.raw("config").unwrap(), b"{\"k\":1}");
        assert!(opened.asset("config", "k").is_err());
    }

    #[test]
    fn test_directory_lookup_ignores_extension() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("levels");
        fs::create_dir_all(dir.join("props")).unwrap();
        fs::write(dir.join("intro.scene"), b"s").unwrap();
        fs::write(dir.join("props").join("tree"), b"t").unwrap();

        let opened = OpenedBundle::Directory(list_directory("levels", &dir).unwrap());
        let scene = opened.asset("levels", "intro").unwrap();
        assert_eq!(scene.kind, AssetKind::Scene);
        assert_eq!(opened.sub_assets("levels", "props").unwrap().len(), 1);
        assert!(opened.sub_assets("levels", "nothing").is_err());
    }
}

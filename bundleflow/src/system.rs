//! Host-facing entry point.
//!
//! [`BundleSystem`] owns everything the engine keeps between ticks: the
//! cache, the app-bundled and local manifests, the loader registry and the
//! running update flow. Hosts call [`BundleSystem::tick`] once per frame.

use std::fs;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{CacheStats, CacheStore, ClearResult, OpenOutcome};
use crate::config::{PlayMode, Settings};
use crate::diff::DownloadScope;
use crate::download::{DownloadContext, HttpTransport, Transport};
use crate::error::{BundleError, BundleResult};
use crate::loader::{
    AssetHandle, BundleHandle, DecryptorRegistry, ForceUnloadReport, Handle, LoadContext,
    LoaderRecord, LoaderState, MemorySceneHost, ProviderRecord, ProviderState, Registry,
    RegistryConfig, SceneHost, SceneMode,
};
use crate::manifest::Manifest;
use crate::update::{
    FlowState, OperatorSignal, UpdateEvent, UpdateFlow, UpdateOutcome, UpdateTarget,
};

/// Assembles a [`BundleSystem`].
#[derive(Debug)]
pub struct SystemBuilder {
    settings: Settings,
    transport: Option<Arc<dyn Transport>>,
    scene_host: Option<Box<dyn SceneHost>>,
    decryptors: DecryptorRegistry,
}

impl SystemBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            transport: None,
            scene_host: None,
            decryptors: DecryptorRegistry::default(),
        }
    }

    /// Use `transport` instead of HTTP.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_scene_host(mut self, host: Box<dyn SceneHost>) -> Self {
        self.scene_host = Some(host);
        self
    }

    /// Replace the decryption strategies available to `loader.decryption`.
    pub fn with_decryptors(mut self, decryptors: DecryptorRegistry) -> Self {
        self.decryptors = decryptors;
        self
    }

    /// Open the cache, load the manifests and build the registry.
    ///
    /// Fails on structural manifest errors and unknown decryption keys. A
    /// local manifest that cannot be read falls back to the app-bundled one.
    pub fn initialize(self) -> BundleResult<BundleSystem> {
        let settings = self.settings;
        let layout = settings.layout();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::with_timeout(settings.timeout)?),
        };

        let (cache, open_outcome) = CacheStore::open(layout.clone(), &settings.app_version)?;

        let builtin_path = layout.builtin_manifest();
        let builtin = if builtin_path.is_file() {
            Manifest::load(&builtin_path)?
        } else {
            debug!(path = %builtin_path.display(), "No app-bundled manifest");
            Manifest::empty()
        };

        let local_path = layout.local_manifest();
        if matches!(open_outcome, OpenOutcome::ClearedDirty { .. }) && local_path.is_file() {
            fs::remove_file(&local_path).map_err(|e| BundleError::WriteFailed {
                path: local_path.clone(),
                source: e,
            })?;
            info!("Discarded local manifest written by another app build");
        }
        let local = if local_path.is_file() {
            match Manifest::load(&local_path) {
                Ok(manifest) => manifest,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Local manifest unreadable, using app-bundled manifest");
                    builtin.clone()
                }
            }
        } else {
            builtin.clone()
        };

        let decryptor = match &settings.decryption {
            Some(key) => Some(self.decryptors.create(key)?),
            None => None,
        };

        let download = download_context(&settings, &transport, &local);
        let config = RegistryConfig {
            source: settings.loader_source(),
            download,
            download_options: settings.download_options(),
            decryptor,
            decryption_mode: settings.decryption_mode,
            variant: settings.variant.clone(),
            wait_ceiling: settings.wait_ceiling,
        };
        let scene_host = self
            .scene_host
            .unwrap_or_else(|| Box::new(MemorySceneHost::new()));

        info!(
            mode = %settings.play_mode,
            builtin = builtin.len(),
            local_version = local.resource_version,
            cached = cache.len(),
            "Bundle system initialized"
        );

        Ok(BundleSystem {
            settings,
            transport,
            cache,
            open_outcome,
            builtin,
            local,
            registry: Registry::new(config, scene_host),
            update: None,
            events: Vec::new(),
        })
    }
}

fn download_context(
    settings: &Settings,
    transport: &Arc<dyn Transport>,
    local: &Manifest,
) -> Option<DownloadContext> {
    (settings.play_mode == PlayMode::Host).then(|| {
        DownloadContext::new(
            transport.clone(),
            settings.remote(),
            local.resource_version,
            settings.layout(),
        )
    })
}

/// The engine context.
#[derive(Debug)]
pub struct BundleSystem {
    settings: Settings,
    transport: Arc<dyn Transport>,
    cache: CacheStore,
    open_outcome: OpenOutcome,
    builtin: Manifest,
    local: Manifest,
    registry: Registry,
    update: Option<UpdateFlow>,
    events: Vec<UpdateEvent>,
}

impl BundleSystem {
    pub fn builder(settings: Settings) -> SystemBuilder {
        SystemBuilder::new(settings)
    }

    /// Initialize with HTTP transport and an in-memory scene host.
    pub fn initialize(settings: Settings) -> BundleResult<Self> {
        SystemBuilder::new(settings).initialize()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// How the cache was found at startup.
    pub fn open_outcome(&self) -> &OpenOutcome {
        &self.open_outcome
    }

    pub fn builtin_manifest(&self) -> &Manifest {
        &self.builtin
    }

    pub fn local_manifest(&self) -> &Manifest {
        &self.local
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn is_updating(&self) -> bool {
        self.update.as_ref().is_some_and(|f| !f.is_finished())
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Start an update of the local resources.
    pub fn begin_update(&mut self, scope: DownloadScope) -> BundleResult<()> {
        if self.is_updating() {
            return Err(BundleError::InvalidSignal {
                signal: "begin-update".to_string(),
                state: "an update is running".to_string(),
            });
        }
        self.update = Some(UpdateFlow::new(
            self.transport.clone(),
            self.settings.remote(),
            self.settings.download_options(),
            scope,
            self.settings.app_version.clone(),
        ));
        Ok(())
    }

    /// Forward an operator decision to the running update.
    pub fn submit_operator_signal(&mut self, signal: OperatorSignal) -> BundleResult<()> {
        match self.update.as_mut() {
            Some(flow) => flow.signal(signal),
            None => Err(BundleError::InvalidSignal {
                signal: signal.to_string(),
                state: "no update has started".to_string(),
            }),
        }
    }

    pub fn update_state(&self) -> Option<&FlowState> {
        self.update.as_ref().map(UpdateFlow::state)
    }

    pub fn update(&self) -> Option<&UpdateFlow> {
        self.update.as_ref()
    }

    /// Files and bytes the running update will download.
    pub fn download_summary(&self) -> Option<(usize, u64)> {
        self.update.as_ref().and_then(UpdateFlow::download_summary)
    }

    /// Update events since the last call.
    pub fn drain_events(&mut self) -> Vec<UpdateEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Bundles and assets
    // ------------------------------------------------------------------

    pub fn open(&mut self, bundle_name: &str) -> BundleResult<BundleHandle> {
        let mut ctx = LoadContext {
            manifest: &self.local,
            builtin: &self.builtin,
            cache: &mut self.cache,
        };
        self.registry.open(&mut ctx, bundle_name)
    }

    pub fn load_asset(&mut self, handle: &BundleHandle, asset: &str) -> BundleResult<AssetHandle> {
        self.registry.load_asset(handle, asset)
    }

    pub fn load_sub_assets(
        &mut self,
        handle: &BundleHandle,
        asset: &str,
    ) -> BundleResult<AssetHandle> {
        self.registry.load_sub_assets(handle, asset)
    }

    pub fn load_scene(
        &mut self,
        handle: &BundleHandle,
        scene: &str,
        mode: SceneMode,
        activate_on_load: bool,
    ) -> BundleResult<AssetHandle> {
        self.registry.load_scene(handle, scene, mode, activate_on_load)
    }

    pub fn load_raw_file(&mut self, handle: &BundleHandle) -> BundleResult<AssetHandle> {
        self.registry.load_raw_file(handle)
    }

    pub fn allow_scene_activation(&mut self, handle: &AssetHandle) -> BundleResult<()> {
        self.registry.allow_scene_activation(handle)
    }

    pub fn bundle(&self, handle: &BundleHandle) -> BundleResult<&LoaderRecord> {
        self.registry.loader_for(handle)
    }

    pub fn asset(&self, handle: &AssetHandle) -> BundleResult<&ProviderRecord> {
        self.registry.provider_for(handle)
    }

    pub fn release(&mut self, handle: impl Into<Handle>) -> BundleResult<()> {
        self.registry.release(handle)
    }

    /// Re-resolve a failed bundle and load it again.
    pub fn retry(&mut self, handle: &BundleHandle) -> BundleResult<()> {
        let mut ctx = LoadContext {
            manifest: &self.local,
            builtin: &self.builtin,
            cache: &mut self.cache,
        };
        self.registry.retry(&mut ctx, handle)
    }

    pub fn wait_for_bundle(&mut self, handle: &BundleHandle) -> BundleResult<LoaderState> {
        let mut ctx = LoadContext {
            manifest: &self.local,
            builtin: &self.builtin,
            cache: &mut self.cache,
        };
        self.registry.wait_for_bundle(&mut ctx, handle)
    }

    pub fn wait_for_asset(&mut self, handle: &AssetHandle) -> BundleResult<ProviderState> {
        let mut ctx = LoadContext {
            manifest: &self.local,
            builtin: &self.builtin,
            cache: &mut self.cache,
        };
        self.registry.wait_for_asset(&mut ctx, handle)
    }

    /// Destroy every loader nothing refers to. Returns the number removed.
    pub fn unload_unused(&mut self) -> usize {
        self.registry.unload_unused()
    }

    /// Tear down every loader and provider, failing in-flight requests.
    pub fn force_unload_all(&mut self) -> ForceUnloadReport {
        self.registry.force_unload_all()
    }

    /// Delete cached bundles no manifest refers to.
    pub fn clear_unused_cache(&mut self) -> BundleResult<ClearResult> {
        if self.is_updating() {
            return Err(BundleError::InvalidSignal {
                signal: "clear-unused-cache".to_string(),
                state: "an update is running".to_string(),
            });
        }
        self.cache.clear_unused(&[&self.local, &self.builtin])
    }

    /// Delete every cached bundle and fall back to the app-bundled manifest.
    ///
    /// Bundles already loaded stay open.
    pub fn clear_cache(&mut self) -> BundleResult<ClearResult> {
        if self.is_updating() {
            return Err(BundleError::InvalidSignal {
                signal: "clear-cache".to_string(),
                state: "an update is running".to_string(),
            });
        }
        let result = self.cache.clear()?;

        let local_path = self.cache.layout().local_manifest();
        if local_path.is_file() {
            fs::remove_file(&local_path).map_err(|e| BundleError::WriteFailed {
                path: local_path.clone(),
                source: e,
            })?;
        }
        self.local = self.builtin.clone();
        let download = download_context(&self.settings, &self.transport, &self.local);
        self.registry.set_download(download);
        Ok(result)
    }

    /// Advance the update flow and every loader and provider.
    pub fn tick(&mut self) {
        let mut updated = false;
        if let Some(flow) = self.update.as_mut() {
            if !flow.is_finished() {
                flow.tick(UpdateTarget {
                    builtin: &self.builtin,
                    local: &mut self.local,
                    cache: &mut self.cache,
                });
                updated = matches!(flow.outcome(), Some(UpdateOutcome::Updated { .. }));
            }
            self.events.extend(flow.drain_events());
        }
        if updated {
            let download = download_context(&self.settings, &self.transport, &self.local);
            self.registry.set_download(download);
        }

        let mut ctx = LoadContext {
            manifest: &self.local,
            builtin: &self.builtin,
            cache: &mut self.cache,
        };
        self.registry.tick(&mut ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::MemoryTransport;
    use crate::loader::{AssetObject, BundleArchive};
    use crate::manifest::ManifestEntry;
    use crate::verify::digest_bytes;
    use tempfile::TempDir;

    fn settings(temp: &TempDir) -> Settings {
        Settings::new(temp.path().join("builtin"), temp.path().join("sandbox"))
            .with_remote("http://primary", Some("http://fallback".to_string()))
            .with_app_version("1.0.0")
    }

    fn system(settings: Settings) -> BundleSystem {
        BundleSystem::builder(settings)
            .with_transport(Arc::new(MemoryTransport::new()))
            .initialize()
            .unwrap()
    }

    /// Ship an archive in the built-in root under `name`.
    fn ship(temp: &TempDir, name: &str) -> ManifestEntry {
        let bytes = BundleArchive::new()
            .with_object("logo", b"png".to_vec())
            .to_bytes()
            .unwrap();
        let d = digest_bytes(&bytes);
        let root = temp.path().join("builtin");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(&d.content_hash), &bytes).unwrap();
        ManifestEntry::new(name, d.content_hash, d.checksum, d.size_bytes, 1)
    }

    #[test]
    fn test_initialize_empty_roots() {
        let temp = TempDir::new().unwrap();
        let system = system(settings(&temp));

        assert_eq!(system.open_outcome(), &OpenOutcome::Fresh);
        assert!(system.local_manifest().is_empty());
        assert!(system.update_state().is_none());
    }

    #[test]
    fn test_local_manifest_defaults_to_builtin() {
        let temp = TempDir::new().unwrap();
        let entry = ship(&temp, "base");
        let builtin = Manifest::new(2, vec![entry]).unwrap();
        builtin
            .save(&temp.path().join("builtin").join("manifest.json"))
            .unwrap();

        let mut system = system(settings(&temp));
        assert_eq!(system.local_manifest(), &builtin);

        let handle = system.open("base").unwrap();
        let asset = system.load_asset(&handle, "logo").unwrap();
        assert_eq!(system.wait_for_asset(&asset).unwrap(), ProviderState::Success);
        match system.asset(&asset).unwrap().result() {
            Some(AssetObject::Asset(loaded)) => assert_eq!(loaded.data, b"png"),
            other => panic!("unexpected result {:?}", other),
        }

        system.release(asset).unwrap();
        system.release(handle).unwrap();
        assert_eq!(system.unload_unused(), 1);
    }

    #[test]
    fn test_unknown_decryptor_rejected() {
        let temp = TempDir::new().unwrap();
        let settings = settings(&temp).with_decryption("rot13", Default::default());
        let result = BundleSystem::builder(settings)
            .with_transport(Arc::new(MemoryTransport::new()))
            .initialize();
        assert!(matches!(result, Err(BundleError::Config(_))));
    }

    #[test]
    fn test_signal_without_update_rejected() {
        let temp = TempDir::new().unwrap();
        let mut system = system(settings(&temp));
        assert!(matches!(
            system.submit_operator_signal(OperatorSignal::BeginDownload),
            Err(BundleError::InvalidSignal { .. })
        ));
        assert_eq!(system.download_summary(), None);
    }

    #[test]
    fn test_clear_unused_cache_keeps_manifest_bundles() {
        let temp = TempDir::new().unwrap();
        let mut system = system(settings(&temp));

        let orphan = digest_bytes(b"orphan");
        fs::write(system.cache().cached_path(&orphan.content_hash), b"orphan").unwrap();
        system.cache.commit(&orphan.content_hash).unwrap();

        let cleared = system.clear_unused_cache().unwrap();
        assert_eq!(cleared.files_deleted, 1);
        assert!(!system.cache().contains(&orphan.content_hash));
    }
}

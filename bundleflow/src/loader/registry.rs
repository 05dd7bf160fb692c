//! Loader and provider registry.
//!
//! Loaders are created on demand from the active manifest, dependencies
//! first, so a loader's id is always greater than the ids of its
//! dependencies. Updating loaders in id order therefore settles a whole
//! dependency chain in a single tick.
//!
//! Reference counts move in lock-step: referencing a loader references every
//! dependency recursively, and releasing it releases them again. Each
//! provider holds exactly one reference on its owning loader.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use super::bundle::{DependencyStatus, LoadEnv, LoaderId, LoaderRecord, LoaderState};
use super::decrypt::{DecryptionMode, Decryptor};
use super::provider::{AssetRequest, ProviderId, ProviderKey, ProviderRecord, ProviderState};
use super::scene::{SceneHost, SceneMode};
use super::source::LoaderSource;
use crate::cache::CacheStore;
use crate::download::{DownloadContext, DownloadOptions};
use crate::error::{BundleError, BundleResult};
use crate::manifest::{Manifest, ManifestEntry};

/// Default iteration ceiling for blocking waits.
pub const DEFAULT_WAIT_CEILING: u64 = 1_000_000;

/// A reference on an opened bundle. Give it back with [`Registry::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct BundleHandle {
    id: LoaderId,
    name: String,
}

impl BundleHandle {
    pub fn id(&self) -> LoaderId {
        self.id
    }

    /// Resolved bundle name, including any variant suffix.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A reference on an asset request. Give it back with [`Registry::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct AssetHandle {
    id: ProviderId,
    bundle: LoaderId,
}

impl AssetHandle {
    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn bundle(&self) -> LoaderId {
        self.bundle
    }
}

/// Either kind of handle.
#[derive(Debug, PartialEq, Eq)]
pub enum Handle {
    Bundle(BundleHandle),
    Asset(AssetHandle),
}

impl From<BundleHandle> for Handle {
    fn from(handle: BundleHandle) -> Self {
        Self::Bundle(handle)
    }
}

impl From<AssetHandle> for Handle {
    fn from(handle: AssetHandle) -> Self {
        Self::Asset(handle)
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub source: LoaderSource,
    /// Where missing bundles are downloaded from; `None` disables downloads.
    pub download: Option<DownloadContext>,
    pub download_options: DownloadOptions,
    pub decryptor: Option<Arc<dyn Decryptor>>,
    pub decryption_mode: DecryptionMode,
    /// Preferred variant suffix applied when opening bundles.
    pub variant: Option<String>,
    pub wait_ceiling: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            source: LoaderSource::offline(),
            download: None,
            download_options: DownloadOptions::default(),
            decryptor: None,
            decryption_mode: DecryptionMode::default(),
            variant: None,
            wait_ceiling: DEFAULT_WAIT_CEILING,
        }
    }
}

/// Manifests and cache a registry reads while opening and advancing loaders.
pub struct LoadContext<'a> {
    /// Active manifest bundles are opened from.
    pub manifest: &'a Manifest,
    /// App-bundled manifest.
    pub builtin: &'a Manifest,
    pub cache: &'a mut CacheStore,
}

/// Outcome of [`Registry::force_unload_all`].
#[derive(Debug, Default)]
pub struct ForceUnloadReport {
    pub loaders: usize,
    pub providers: usize,
    /// Providers that were still working, each failed with
    /// [`BundleError::ForceUnloaded`] before removal.
    pub interrupted: Vec<(ProviderId, BundleError)>,
}

/// Owns every loader and provider.
#[derive(Debug)]
pub struct Registry {
    config: RegistryConfig,
    loaders: BTreeMap<LoaderId, LoaderRecord>,
    by_name: HashMap<String, LoaderId>,
    providers: BTreeMap<ProviderId, ProviderRecord>,
    by_key: HashMap<ProviderKey, ProviderId>,
    scene_host: Box<dyn SceneHost>,
    next_loader: u64,
    next_provider: u64,
}

impl Registry {
    pub fn new(config: RegistryConfig, scene_host: Box<dyn SceneHost>) -> Self {
        Self {
            config,
            loaders: BTreeMap::new(),
            by_name: HashMap::new(),
            providers: BTreeMap::new(),
            by_key: HashMap::new(),
            scene_host,
            next_loader: 0,
            next_provider: 0,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Replace the download source, e.g. after the local manifest changed.
    pub fn set_download(&mut self, download: Option<DownloadContext>) {
        self.config.download = download;
    }

    pub fn scene_host(&self) -> &dyn SceneHost {
        self.scene_host.as_ref()
    }

    pub fn loader(&self, id: LoaderId) -> Option<&LoaderRecord> {
        self.loaders.get(&id)
    }

    pub fn loader_by_name(&self, name: &str) -> Option<&LoaderRecord> {
        self.by_name.get(name).and_then(|id| self.loaders.get(id))
    }

    pub fn loaders(&self) -> impl Iterator<Item = &LoaderRecord> {
        self.loaders.values()
    }

    pub fn provider(&self, id: ProviderId) -> Option<&ProviderRecord> {
        self.providers.get(&id)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderRecord> {
        self.providers.values()
    }

    pub fn loader_count(&self) -> usize {
        self.loaders.len()
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Any loader or provider still working.
    pub fn is_busy(&self) -> bool {
        self.loaders.values().any(|l| !l.state().is_terminal())
            || self
                .providers
                .values()
                .any(|p| !p.state().is_terminal() && !p.is_holding_scene())
    }

    pub fn loader_for(&self, handle: &BundleHandle) -> BundleResult<&LoaderRecord> {
        self.loaders
            .get(&handle.id)
            .ok_or_else(|| BundleError::StaleHandle(handle.id.to_string()))
    }

    pub fn provider_for(&self, handle: &AssetHandle) -> BundleResult<&ProviderRecord> {
        self.providers
            .get(&handle.id)
            .ok_or_else(|| BundleError::StaleHandle(handle.id.to_string()))
    }

    /// Open a bundle by name and take a reference on it.
    ///
    /// The configured variant is applied when the manifest publishes it.
    /// Loaders for the bundle and its dependencies are created as needed;
    /// loading starts on the next tick.
    pub fn open(&mut self, ctx: &mut LoadContext<'_>, name: &str) -> BundleResult<BundleHandle> {
        let resolved = ctx
            .manifest
            .resolve_variant(name, self.config.variant.as_deref())
            .to_string();
        let id = self.ensure_loader(ctx, &resolved, &mut Vec::new())?;
        self.reference(id);
        debug!(bundle = %resolved, loader = %id, "Bundle opened");
        Ok(BundleHandle { id, name: resolved })
    }

    fn ensure_loader(
        &mut self,
        ctx: &mut LoadContext<'_>,
        name: &str,
        stack: &mut Vec<String>,
    ) -> BundleResult<LoaderId> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        if let Some(pos) = stack.iter().position(|n| n == name) {
            let mut path = stack[pos..].to_vec();
            path.push(name.to_string());
            return Err(BundleError::DependencyCycle { path });
        }

        let entry = match (ctx.manifest.get(name), &self.config.source) {
            (Some(entry), _) => entry.clone(),
            (None, LoaderSource::Simulated { root }) if root.join(name).is_dir() => {
                ManifestEntry::new(name, "", "", 0, 0)
            }
            (None, _) => return Err(BundleError::UnknownBundle(name.to_string())),
        };

        stack.push(name.to_string());
        let mut dependencies = Vec::with_capacity(entry.dependencies.len());
        for dep in &entry.dependencies {
            dependencies.push(self.ensure_loader(ctx, dep, stack)?);
        }
        stack.pop();

        let location = self.config.source.locate(&entry, ctx.builtin, ctx.cache);
        self.next_loader += 1;
        let id = LoaderId(self.next_loader);
        for dep in &dependencies {
            if let Some(record) = self.loaders.get_mut(dep) {
                record.masters.push(id);
            }
        }
        debug!(bundle = %name, loader = %id, ?location, "Created loader");
        self.loaders
            .insert(id, LoaderRecord::new(id, entry, location, dependencies));
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    fn reference(&mut self, id: LoaderId) {
        let deps = match self.loaders.get_mut(&id) {
            Some(record) => {
                record.ref_count += 1;
                record.dependencies.clone()
            }
            None => return,
        };
        for dep in deps {
            self.reference(dep);
        }
    }

    fn release_loader(&mut self, id: LoaderId) {
        let deps = match self.loaders.get_mut(&id) {
            Some(record) => {
                record.ref_count -= 1;
                record.dependencies.clone()
            }
            None => return,
        };
        for dep in deps {
            self.release_loader(dep);
        }
    }

    /// Request an asset from an opened bundle.
    ///
    /// Identical requests share one provider.
    pub fn load(
        &mut self,
        handle: &BundleHandle,
        request: AssetRequest,
    ) -> BundleResult<AssetHandle> {
        let bundle_name = self.loader_for(handle)?.name().to_string();
        let key = ProviderKey::new(handle.id, &request);

        if let Some(&id) = self.by_key.get(&key) {
            if let Some(provider) = self.providers.get_mut(&id) {
                provider.ref_count += 1;
                return Ok(AssetHandle {
                    id,
                    bundle: handle.id,
                });
            }
        }

        self.next_provider += 1;
        let id = ProviderId(self.next_provider);
        let mut provider = ProviderRecord::new(id, key.clone(), request, bundle_name);
        provider.ref_count = 1;
        self.providers.insert(id, provider);
        self.by_key.insert(key, id);
        if let Some(loader) = self.loaders.get_mut(&handle.id) {
            loader.providers.insert(id);
        }
        self.reference(handle.id);

        Ok(AssetHandle {
            id,
            bundle: handle.id,
        })
    }

    pub fn load_asset(&mut self, handle: &BundleHandle, asset: &str) -> BundleResult<AssetHandle> {
        self.load(handle, AssetRequest::Asset(asset.to_string()))
    }

    pub fn load_sub_assets(
        &mut self,
        handle: &BundleHandle,
        asset: &str,
    ) -> BundleResult<AssetHandle> {
        self.load(handle, AssetRequest::SubAssets(asset.to_string()))
    }

    pub fn load_scene(
        &mut self,
        handle: &BundleHandle,
        scene: &str,
        mode: SceneMode,
        activate_on_load: bool,
    ) -> BundleResult<AssetHandle> {
        self.load(
            handle,
            AssetRequest::Scene {
                name: scene.to_string(),
                mode,
                activate_on_load,
            },
        )
    }

    pub fn load_raw_file(&mut self, handle: &BundleHandle) -> BundleResult<AssetHandle> {
        self.load(handle, AssetRequest::RawFile)
    }

    /// Let a held scene activate.
    pub fn allow_scene_activation(&mut self, handle: &AssetHandle) -> BundleResult<()> {
        self.providers
            .get_mut(&handle.id)
            .map(|p| p.allow_scene_activation())
            .ok_or_else(|| BundleError::StaleHandle(handle.id.to_string()))
    }

    /// Give a reference back.
    pub fn release(&mut self, handle: impl Into<Handle>) -> BundleResult<()> {
        match handle.into() {
            Handle::Bundle(h) => {
                if !self.loaders.contains_key(&h.id) {
                    return Err(BundleError::StaleHandle(h.id.to_string()));
                }
                self.release_loader(h.id);
                Ok(())
            }
            Handle::Asset(h) => {
                let provider = self
                    .providers
                    .get_mut(&h.id)
                    .ok_or_else(|| BundleError::StaleHandle(h.id.to_string()))?;
                provider.ref_count -= 1;
                if provider.ref_count <= 0 {
                    self.destroy_provider(h.id);
                }
                Ok(())
            }
        }
    }

    fn destroy_provider(&mut self, id: ProviderId) {
        let Some(mut provider) = self.providers.remove(&id) else {
            return;
        };
        self.by_key.remove(provider.key());
        provider.destroy(self.scene_host.as_mut());

        let owner = provider.owner();
        if let Some(loader) = self.loaders.get_mut(&owner) {
            loader.providers.remove(&id);
        }
        self.release_loader(owner);
    }

    /// Whether a loader may be destroyed: terminal, unreferenced, without
    /// providers, and every live master destroyable too.
    pub fn can_destroy(&self, id: LoaderId) -> bool {
        match self.loaders.get(&id) {
            Some(record) => {
                record.is_idle() && record.masters.iter().all(|m| self.can_destroy(*m))
            }
            None => true,
        }
    }

    /// Destroy every destroyable loader. Returns how many were removed.
    pub fn unload_unused(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let doomed: Vec<LoaderId> = self
                .loaders
                .keys()
                .copied()
                .filter(|id| self.can_destroy(*id))
                .collect();
            if doomed.is_empty() {
                break;
            }
            for id in doomed {
                self.remove_loader(id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, remaining = self.loaders.len(), "Unloaded unused bundles");
        }
        removed
    }

    fn remove_loader(&mut self, id: LoaderId) {
        let Some(record) = self.loaders.remove(&id) else {
            return;
        };
        for dep in record.dependencies() {
            if let Some(dep_record) = self.loaders.get_mut(dep) {
                dep_record.masters.retain(|m| *m != id);
            }
        }
        self.by_name.remove(record.name());
        debug!(bundle = %record.name(), loader = %id, "Destroyed loader");
    }

    /// Fail everything still working, then drop all providers and loaders.
    ///
    /// Every outstanding handle becomes stale.
    pub fn force_unload_all(&mut self) -> ForceUnloadReport {
        let mut report = ForceUnloadReport {
            loaders: self.loaders.len(),
            providers: self.providers.len(),
            interrupted: Vec::new(),
        };

        for (id, provider) in self.providers.iter_mut() {
            if !provider.state().is_terminal() {
                let bundle = self
                    .loaders
                    .get(&provider.owner())
                    .map(|l| l.name().to_string())
                    .unwrap_or_default();
                provider.fail(BundleError::ForceUnloaded(bundle.clone()));
                report
                    .interrupted
                    .push((*id, BundleError::ForceUnloaded(bundle)));
            }
        }
        for (_, mut provider) in std::mem::take(&mut self.providers) {
            provider.destroy(self.scene_host.as_mut());
        }
        for loader in self.loaders.values_mut() {
            let name = loader.name().to_string();
            loader.fail(BundleError::ForceUnloaded(name));
        }

        self.loaders.clear();
        self.by_name.clear();
        self.by_key.clear();

        if report.loaders > 0 || report.providers > 0 {
            warn!(
                loaders = report.loaders,
                providers = report.providers,
                interrupted = report.interrupted.len(),
                "Force-unloaded all bundles"
            );
        }
        report
    }

    /// Put a failed loader and its failed dependencies back to their
    /// initial state, re-resolving each location.
    pub fn retry(&mut self, ctx: &mut LoadContext<'_>, handle: &BundleHandle) -> BundleResult<()> {
        self.loader_for(handle)?;
        let source = &self.config.source;
        for id in self.subgraph(handle.id) {
            if let Some(record) = self.loaders.get_mut(&id) {
                if record.state() == LoaderState::Fail {
                    let location = source.locate(record.entry(), ctx.builtin, ctx.cache);
                    record.retry(location);
                }
            }
        }
        Ok(())
    }

    fn dependency_status(&self, id: LoaderId) -> DependencyStatus {
        let Some(record) = self.loaders.get(&id) else {
            return DependencyStatus::Pending;
        };
        let mut ready = true;
        for dep in record.dependencies() {
            match self.loaders.get(dep) {
                Some(d) if d.state() == LoaderState::Fail => {
                    return DependencyStatus::Failed(d.name().to_string())
                }
                Some(d) if d.state() == LoaderState::Success => {}
                Some(_) => ready = false,
                None => return DependencyStatus::Failed(dep.to_string()),
            }
        }
        if ready {
            DependencyStatus::Ready
        } else {
            DependencyStatus::Pending
        }
    }

    fn update_loader(&mut self, ctx: &mut LoadContext<'_>, id: LoaderId) {
        let status = self.dependency_status(id);
        let mut env = LoadEnv {
            cache: &mut *ctx.cache,
            download: self.config.download.as_ref(),
            download_options: self.config.download_options,
            decryptor: self.config.decryptor.as_deref(),
            decryption_mode: self.config.decryption_mode,
        };
        if let Some(record) = self.loaders.get_mut(&id) {
            record.update(&mut env, &status);
        }
    }

    fn update_provider(&mut self, id: ProviderId) {
        let Some(provider) = self.providers.get_mut(&id) else {
            return;
        };
        let owner = self.loaders.get(&provider.owner());
        provider.update(owner, self.scene_host.as_mut());
    }

    /// Advance every loader, then every provider.
    pub fn tick(&mut self, ctx: &mut LoadContext<'_>) {
        let loader_ids: Vec<LoaderId> = self.loaders.keys().copied().collect();
        for id in loader_ids {
            self.update_loader(ctx, id);
        }
        let provider_ids: Vec<ProviderId> = self.providers.keys().copied().collect();
        for id in provider_ids {
            self.update_provider(id);
        }
    }

    /// A loader and its transitive dependencies, dependencies first.
    fn subgraph(&self, root: LoaderId) -> Vec<LoaderId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                if let Some(record) = self.loaders.get(&id) {
                    stack.extend(record.dependencies().iter().copied());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Poll a bundle and its dependencies until it is terminal.
    ///
    /// Gives up after the configured iteration ceiling, failing the loader
    /// with [`BundleError::WaitCeilingReached`].
    pub fn wait_for_bundle(
        &mut self,
        ctx: &mut LoadContext<'_>,
        handle: &BundleHandle,
    ) -> BundleResult<LoaderState> {
        self.loader_for(handle)?;
        let ids = self.subgraph(handle.id);
        let ceiling = self.config.wait_ceiling;

        let mut iterations = 0u64;
        loop {
            for id in &ids {
                self.update_loader(ctx, *id);
            }
            let state = self.loader_for(handle)?.state();
            if state.is_terminal() {
                return Ok(state);
            }
            iterations += 1;
            if iterations >= ceiling {
                let name = handle.name.clone();
                if let Some(record) = self.loaders.get_mut(&handle.id) {
                    record.fail(BundleError::WaitCeilingReached {
                        bundle: name,
                        iterations,
                    });
                }
                return Ok(LoaderState::Fail);
            }
            thread::yield_now();
        }
    }

    /// Poll an asset request and its bundle until it settles.
    ///
    /// A scene held for activation counts as settled.
    pub fn wait_for_asset(
        &mut self,
        ctx: &mut LoadContext<'_>,
        handle: &AssetHandle,
    ) -> BundleResult<ProviderState> {
        self.provider_for(handle)?;
        let ids = self.subgraph(handle.bundle);
        let ceiling = self.config.wait_ceiling;

        let mut iterations = 0u64;
        loop {
            for id in &ids {
                self.update_loader(ctx, *id);
            }
            self.update_provider(handle.id);
            let provider = self.provider_for(handle)?;
            if provider.state().is_terminal() || provider.is_holding_scene() {
                return Ok(provider.state());
            }
            iterations += 1;
            if iterations >= ceiling {
                let bundle = self
                    .loaders
                    .get(&handle.bundle)
                    .map(|l| l.name().to_string())
                    .unwrap_or_default();
                if let Some(provider) = self.providers.get_mut(&handle.id) {
                    provider.fail(BundleError::WaitCeilingReached { bundle, iterations });
                }
                return Ok(ProviderState::Fail);
            }
            thread::yield_now();
        }
    }
}

//! Per-request asset providers.
//!
//! # State Machine
//!
//! ```text
//! None --[owner Success]--> Loading --> Checking --> Success
//! None --[owner Fail]--> Fail
//! Checking --[extraction failed]--> Fail
//! Checking --[scene held]--> Checking (until activation is allowed)
//! ```

use std::fmt;

use tracing::{debug, warn};

use super::bundle::{LoadedAsset, LoaderId, LoaderRecord, LoaderState};
use super::archive::AssetKind;
use super::scene::{SceneHost, SceneId, SceneMode};
use crate::error::{BundleError, BundleResult};

/// Identifier of a provider record. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderId(pub(crate) u64);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    None,
    Loading,
    Checking,
    Success,
    Fail,
}

impl ProviderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }
}

/// Shape of a request, without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Asset,
    SubAssets,
    Scene,
    RawFile,
}

/// What a provider extracts from its bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetRequest {
    /// One named asset.
    Asset(String),
    /// Every asset stored below a name.
    SubAssets(String),
    /// A scene, optionally held inactive until activation is allowed.
    Scene {
        name: String,
        mode: SceneMode,
        activate_on_load: bool,
    },
    /// The payload of a raw-file bundle.
    RawFile,
}

impl AssetRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Asset(_) => RequestKind::Asset,
            Self::SubAssets(_) => RequestKind::SubAssets,
            Self::Scene { .. } => RequestKind::Scene,
            Self::RawFile => RequestKind::RawFile,
        }
    }

    /// Requested asset name; empty for raw files.
    pub fn asset_name(&self) -> &str {
        match self {
            Self::Asset(name) | Self::SubAssets(name) | Self::Scene { name, .. } => name,
            Self::RawFile => "",
        }
    }
}

/// Providers are shared between identical requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub bundle: LoaderId,
    pub asset: String,
    pub kind: RequestKind,
}

impl ProviderKey {
    pub fn new(bundle: LoaderId, request: &AssetRequest) -> Self {
        Self {
            bundle,
            asset: request.asset_name().to_string(),
            kind: request.kind(),
        }
    }
}

/// Result of a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetObject {
    Asset(LoadedAsset),
    SubAssets(Vec<LoadedAsset>),
    Scene(SceneId),
    Raw(Vec<u8>),
}

/// Provider for one distinct request.
///
/// Holds exactly one reference on its owning loader while it exists; the
/// registry takes it on creation and gives it back in `destroy`.
#[derive(Debug)]
pub struct ProviderRecord {
    id: ProviderId,
    key: ProviderKey,
    request: AssetRequest,
    bundle_name: String,
    state: ProviderState,
    pub(crate) ref_count: i32,
    pending: Option<BundleResult<AssetObject>>,
    result: Option<AssetObject>,
    error: Option<BundleError>,
    activation_allowed: bool,
    activated: bool,
}

impl ProviderRecord {
    pub(crate) fn new(
        id: ProviderId,
        key: ProviderKey,
        request: AssetRequest,
        bundle_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            key,
            request,
            bundle_name: bundle_name.into(),
            state: ProviderState::None,
            ref_count: 0,
            pending: None,
            result: None,
            error: None,
            activation_allowed: false,
            activated: false,
        }
    }

    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn key(&self) -> &ProviderKey {
        &self.key
    }

    pub fn owner(&self) -> LoaderId {
        self.key.bundle
    }

    pub fn request(&self) -> &AssetRequest {
        &self.request
    }

    pub fn state(&self) -> ProviderState {
        self.state
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    pub fn result(&self) -> Option<&AssetObject> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&BundleError> {
        self.error.as_ref()
    }

    /// Whether a loaded scene is waiting for activation.
    pub fn is_holding_scene(&self) -> bool {
        self.state == ProviderState::Checking
            && matches!(self.result, Some(AssetObject::Scene(_)))
            && !self.activated
    }

    pub fn progress(&self) -> f64 {
        match self.state {
            ProviderState::None => 0.0,
            ProviderState::Loading => 0.5,
            ProviderState::Checking => 0.9,
            ProviderState::Success | ProviderState::Fail => 1.0,
        }
    }

    /// Let a held scene activate on the next update.
    pub fn allow_scene_activation(&mut self) {
        self.activation_allowed = true;
    }

    fn label(&self) -> String {
        format!("{}:{}", self.bundle_name, self.request.asset_name())
    }

    pub(crate) fn fail(&mut self, err: BundleError) {
        if !self.state.is_terminal() {
            warn!(asset = %self.label(), error = %err, "Asset request failed");
            self.state = ProviderState::Fail;
            self.error = Some(err);
        }
    }

    fn enter(&mut self, state: ProviderState) {
        debug!(asset = %self.label(), from = ?self.state, to = ?state, "Provider transition");
        self.state = state;
    }

    /// Advance as far as possible this tick.
    pub(crate) fn update(&mut self, owner: Option<&LoaderRecord>, host: &mut dyn SceneHost) {
        loop {
            let before = self.state;
            self.step(owner, host);
            if self.state == before || self.state.is_terminal() {
                break;
            }
        }
    }

    fn step(&mut self, owner: Option<&LoaderRecord>, host: &mut dyn SceneHost) {
        match self.state {
            ProviderState::None => match owner.map(|o| o.state()) {
                Some(LoaderState::Success) => self.enter(ProviderState::Loading),
                Some(LoaderState::Fail) | None => self.fail(BundleError::DependencyFailed {
                    bundle: self.label(),
                    dependency: self.bundle_name.clone(),
                }),
                Some(_) => {}
            },
            ProviderState::Loading => {
                let extracted = match owner.and_then(|o| o.bundle()) {
                    Some(bundle) => self.extract(bundle, host),
                    None => Err(BundleError::UnknownBundle(self.bundle_name.clone())),
                };
                self.pending = Some(extracted);
                self.enter(ProviderState::Checking);
            }
            ProviderState::Checking => {
                match self.pending.take() {
                    Some(Ok(object)) => self.result = Some(object),
                    Some(Err(e)) => {
                        self.fail(e);
                        return;
                    }
                    None => {}
                }
                if let Some(AssetObject::Scene(id)) = self.result {
                    if !self.activated {
                        if !self.activation_allowed {
                            return;
                        }
                        host.activate(id);
                        self.activated = true;
                    }
                }
                self.enter(ProviderState::Success);
            }
            ProviderState::Success | ProviderState::Fail => {}
        }
    }

    fn extract(
        &mut self,
        bundle: &super::bundle::OpenedBundle,
        host: &mut dyn SceneHost,
    ) -> BundleResult<AssetObject> {
        let name = &self.bundle_name;
        match &self.request {
            AssetRequest::Asset(asset) => bundle.asset(name, asset).map(AssetObject::Asset),
            AssetRequest::SubAssets(asset) => {
                bundle.sub_assets(name, asset).map(AssetObject::SubAssets)
            }
            AssetRequest::RawFile => bundle.raw(name).map(AssetObject::Raw),
            AssetRequest::Scene {
                name: scene,
                mode,
                activate_on_load,
            } => {
                let asset = bundle.asset(name, scene)?;
                if asset.kind != AssetKind::Scene {
                    return Err(BundleError::UnknownAsset {
                        bundle: name.clone(),
                        asset: scene.clone(),
                    });
                }
                let id = host.load(name, scene, &asset.data, *mode)?;
                if *activate_on_load {
                    host.activate(id);
                    self.activated = true;
                }
                Ok(AssetObject::Scene(id))
            }
        }
    }

    /// Release engine-level resources. The registry releases the owner
    /// reference.
    pub(crate) fn destroy(&mut self, host: &mut dyn SceneHost) {
        let scene = match (&self.result, &self.pending) {
            (Some(AssetObject::Scene(id)), _) | (_, Some(Ok(AssetObject::Scene(id)))) => Some(*id),
            _ => None,
        };
        if let Some(id) = scene {
            debug!(asset = %self.label(), scene = ?id, "Unloading scene");
            host.unload(id);
        }
        self.result = None;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::archive::BundleArchive;
    use crate::loader::bundle::OpenedBundle;
    use crate::loader::scene::MemorySceneHost;

    fn bundle() -> OpenedBundle {
        OpenedBundle::Archive(
            BundleArchive::new()
                .with_object("logo", b"png".to_vec())
                .with_scene("intro", b"scene".to_vec()),
        )
    }

    fn provider(request: AssetRequest) -> ProviderRecord {
        let key = ProviderKey::new(LoaderId(1), &request);
        ProviderRecord::new(ProviderId(1), key, request, "ui")
    }

    fn load(provider: &mut ProviderRecord, host: &mut MemorySceneHost) {
        let opened = bundle();
        provider.state = ProviderState::Loading;
        let extracted = provider.extract(&opened, host);
        provider.pending = Some(extracted);
        provider.state = ProviderState::Checking;
        provider.update(None, host);
    }

    #[test]
    fn test_fails_without_owner() {
        let mut host = MemorySceneHost::new();
        let mut provider = provider(AssetRequest::Asset("logo".to_string()));
        assert_eq!(provider.progress(), 0.0);

        provider.update(None, &mut host);
        assert_eq!(provider.state(), ProviderState::Fail);
    }

    #[test]
    fn test_asset_success() {
        let mut host = MemorySceneHost::new();
        let mut provider = provider(AssetRequest::Asset("logo".to_string()));

        load(&mut provider, &mut host);
        assert_eq!(provider.state(), ProviderState::Success);
        assert!(matches!(provider.result(), Some(AssetObject::Asset(a)) if a.data == b"png"));
    }

    #[test]
    fn test_scene_held_until_allowed() {
        let mut host = MemorySceneHost::new();
        let mut provider = provider(AssetRequest::Scene {
            name: "intro".to_string(),
            mode: SceneMode::Single,
            activate_on_load: false,
        });

        load(&mut provider, &mut host);
        assert_eq!(provider.state(), ProviderState::Checking);
        assert!(provider.is_holding_scene());
        assert_eq!(provider.progress(), 0.9);
        assert_eq!(host.active().count(), 0);

        provider.allow_scene_activation();
        provider.update(None, &mut host);
        assert_eq!(provider.state(), ProviderState::Success);
        assert_eq!(host.active().count(), 1);

        provider.destroy(&mut host);
        assert!(host.scenes().is_empty());
    }

    #[test]
    fn test_object_is_not_a_scene() {
        let mut host = MemorySceneHost::new();
        let mut provider = provider(AssetRequest::Scene {
            name: "logo".to_string(),
            mode: SceneMode::Additive,
            activate_on_load: true,
        });

        load(&mut provider, &mut host);
        assert!(matches!(
            provider.error(),
            Some(BundleError::UnknownAsset { .. })
        ));
    }

    #[test]
    fn test_key_ignores_scene_parameters() {
        let a = AssetRequest::Scene {
            name: "intro".to_string(),
            mode: SceneMode::Single,
            activate_on_load: true,
        };
        let b = AssetRequest::Scene {
            name: "intro".to_string(),
            mode: SceneMode::Additive,
            activate_on_load: false,
        };
        assert_eq!(ProviderKey::new(LoaderId(1), &a), ProviderKey::new(LoaderId(1), &b));
        assert_ne!(
            ProviderKey::new(LoaderId(1), &a),
            ProviderKey::new(LoaderId(1), &AssetRequest::Asset("intro".to_string()))
        );
    }
}

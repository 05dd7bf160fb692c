//! Engine-side scene management.

use std::fmt;

use crate::error::BundleResult;

/// Handle of a scene instantiated by a [`SceneHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SceneId(pub u64);

/// How a scene joins the running world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SceneMode {
    /// Replace every loaded scene.
    #[default]
    Single,
    /// Load alongside the loaded scenes.
    Additive,
}

impl fmt::Display for SceneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Additive => write!(f, "additive"),
        }
    }
}

/// The engine that instantiates scenes from bundle data.
pub trait SceneHost: Send + fmt::Debug {
    /// Instantiate a scene without activating it.
    fn load(&mut self, bundle: &str, scene: &str, data: &[u8], mode: SceneMode)
        -> BundleResult<SceneId>;

    /// Make a loaded scene active.
    fn activate(&mut self, id: SceneId);

    /// Deactivate and drop a scene.
    fn unload(&mut self, id: SceneId);
}

/// A scene known to a [`MemorySceneHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneRecord {
    pub id: SceneId,
    pub bundle: String,
    pub scene: String,
    pub mode: SceneMode,
    pub active: bool,
}

/// Scene host that only keeps track of scenes.
#[derive(Debug, Default)]
pub struct MemorySceneHost {
    next_id: u64,
    scenes: Vec<SceneRecord>,
}

impl MemorySceneHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scenes(&self) -> &[SceneRecord] {
        &self.scenes
    }

    pub fn active(&self) -> impl Iterator<Item = &SceneRecord> {
        self.scenes.iter().filter(|s| s.active)
    }
}

impl SceneHost for MemorySceneHost {
    fn load(
        &mut self,
        bundle: &str,
        scene: &str,
        _data: &[u8],
        mode: SceneMode,
    ) -> BundleResult<SceneId> {
        if mode == SceneMode::Single {
            self.scenes.clear();
        }
        self.next_id += 1;
        let id = SceneId(self.next_id);
        self.scenes.push(SceneRecord {
            id,
            bundle: bundle.to_string(),
            scene: scene.to_string(),
            mode,
            active: false,
        });
        Ok(id)
    }

    fn activate(&mut self, id: SceneId) {
        if let Some(scene) = self.scenes.iter_mut().find(|s| s.id == id) {
            scene.active = true;
        }
    }

    fn unload(&mut self, id: SceneId) {
        self.scenes.retain(|s| s.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_replaces_additive_keeps() {
        let mut host = MemorySceneHost::new();
        let a = host.load("b", "a", &[], SceneMode::Single).unwrap();
        host.load("b", "c", &[], SceneMode::Additive).unwrap();
        assert_eq!(host.scenes().len(), 2);

        host.activate(a);
        assert_eq!(host.active().count(), 1);

        host.load("b", "d", &[], SceneMode::Single).unwrap();
        assert_eq!(host.scenes().len(), 1);
    }
}

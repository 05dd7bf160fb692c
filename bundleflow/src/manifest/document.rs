//! Manifest document: the authoritative list of bundles.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::entry::ManifestEntry;
use crate::error::{BundleError, BundleResult};

/// Alternate versions of one bundle, e.g. quality tiers.
///
/// A variant `v` of bundle `b` is published as the bundle named `b.v`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantGroup {
    pub bundle_name: String,
    pub variants: Vec<String>,
}

/// Ordered collection of bundle entries plus a resource version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Monotonically increasing resource version.
    pub resource_version: u32,
    /// Bundle entries in publishing order.
    #[serde(rename = "elements")]
    pub entries: Vec<ManifestEntry>,
    #[serde(default)]
    pub variants: Vec<VariantGroup>,
    /// Tags whose bundles ship in the built-in root.
    #[serde(default)]
    pub builtin_tags: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Manifest {
    /// Create a manifest from entries, validating its structure.
    pub fn new(resource_version: u32, entries: Vec<ManifestEntry>) -> BundleResult<Self> {
        let mut manifest = Self {
            resource_version,
            entries,
            variants: Vec::new(),
            builtin_tags: Vec::new(),
            index: HashMap::new(),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// An empty manifest at version 0.
    pub fn empty() -> Self {
        Self {
            resource_version: 0,
            entries: Vec::new(),
            variants: Vec::new(),
            builtin_tags: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Set the variant groups, re-validating names.
    pub fn with_variants(mut self, variants: Vec<VariantGroup>) -> BundleResult<Self> {
        self.variants = variants;
        self.validate()?;
        Ok(self)
    }

    /// Set the built-in tags.
    pub fn with_builtin_tags(mut self, tags: Vec<String>) -> Self {
        self.builtin_tags = tags;
        self
    }

    /// Parse and validate a manifest document.
    ///
    /// `source_name` is only used in error messages.
    pub fn from_json(content: &str, source_name: &str) -> BundleResult<Self> {
        let mut manifest: Manifest =
            serde_json::from_str(content).map_err(|e| BundleError::ManifestParse {
                source_name: source_name.to_string(),
                reason: e.to_string(),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize to a pretty-printed JSON document.
    pub fn to_json(&self) -> BundleResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| BundleError::ManifestParse {
            source_name: "<serialize>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Read and validate a manifest file.
    pub fn load(path: &Path) -> BundleResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| BundleError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&content, &path.display().to_string())
    }

    /// Write the manifest atomically (temp file then rename).
    pub fn save(&self, path: &Path) -> BundleResult<()> {
        let content = self.to_json()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BundleError::CreateDirFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| BundleError::WriteFailed {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, path).map_err(|e| BundleError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check names are unique, dependencies resolve and the graph is acyclic.
    ///
    /// Also rebuilds the name index used by [`Manifest::get`].
    pub fn validate(&mut self) -> BundleResult<()> {
        let mut index = HashMap::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            if index.insert(entry.name.clone(), i).is_some() {
                return Err(BundleError::ManifestInconsistency(format!(
                    "duplicate bundle name '{}'",
                    entry.name
                )));
            }
        }

        for entry in &self.entries {
            for dep in &entry.dependencies {
                if !index.contains_key(dep) {
                    return Err(BundleError::ManifestInconsistency(format!(
                        "bundle '{}' depends on unknown bundle '{}'",
                        entry.name, dep
                    )));
                }
            }
        }

        for group in &self.variants {
            for variant in &group.variants {
                let name = variant_name(&group.bundle_name, variant);
                if !index.contains_key(&name) {
                    return Err(BundleError::ManifestInconsistency(format!(
                        "variant '{}' of bundle '{}' is not in the manifest",
                        variant, group.bundle_name
                    )));
                }
            }
        }

        self.index = index;
        detect_cycles(self)
    }

    /// Look up an entry by bundle name.
    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Check whether a bundle is listed.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in publishing order.
    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    /// All content hashes referenced by this manifest.
    pub fn content_hashes(&self) -> HashSet<&str> {
        self.entries
            .iter()
            .map(|e| e.content_hash.as_str())
            .collect()
    }

    /// Entries carrying any of `tags`.
    pub fn entries_with_tags<'a>(
        &'a self,
        tags: &'a [String],
    ) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
        self.entries.iter().filter(move |e| e.has_any_tag(tags))
    }

    /// Resolve a bundle name to its preferred variant, if one is published.
    pub fn resolve_variant<'a>(&'a self, name: &'a str, preferred: Option<&str>) -> &'a str {
        let Some(preferred) = preferred else {
            return name;
        };
        let group = self.variants.iter().find(|g| g.bundle_name == name);
        match group {
            Some(g) if g.variants.iter().any(|v| v == preferred) => {
                let full = variant_name(name, preferred);
                self.index
                    .get_key_value(&full)
                    .map(|(k, _)| k.as_str())
                    .unwrap_or(name)
            }
            _ => name,
        }
    }

    /// Transitive dependency closure of `name`, dependencies first.
    ///
    /// The bundle itself is not included.
    pub fn dependency_closure(&self, name: &str) -> BundleResult<Vec<&ManifestEntry>> {
        let root = self
            .get(name)
            .ok_or_else(|| BundleError::UnknownBundle(name.to_string()))?;
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        self.collect_deps(root, &mut seen, &mut order);
        Ok(order)
    }

    fn collect_deps<'a>(
        &'a self,
        entry: &'a ManifestEntry,
        seen: &mut HashSet<&'a str>,
        order: &mut Vec<&'a ManifestEntry>,
    ) {
        for dep in &entry.dependencies {
            if let Some(dep_entry) = self.get(dep) {
                if seen.insert(dep_entry.name.as_str()) {
                    self.collect_deps(dep_entry, seen, order);
                    order.push(dep_entry);
                }
            }
        }
    }
}

/// Full bundle name of a variant.
pub fn variant_name(bundle: &str, variant: &str) -> String {
    format!("{}.{}", bundle, variant)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first cycle detection with an on-stack marker set.
fn detect_cycles(manifest: &Manifest) -> BundleResult<()> {
    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(manifest.entries.len());
    let mut stack: Vec<&str> = Vec::new();

    for entry in &manifest.entries {
        if !marks.contains_key(entry.name.as_str()) {
            visit(manifest, entry, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    manifest: &'a Manifest,
    entry: &'a ManifestEntry,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> BundleResult<()> {
    marks.insert(entry.name.as_str(), Mark::Visiting);
    stack.push(entry.name.as_str());

    for dep in &entry.dependencies {
        match marks.get(dep.as_str()) {
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(dep.clone());
                return Err(BundleError::DependencyCycle { path });
            }
            Some(Mark::Done) => {}
            None => {
                if let Some(dep_entry) = manifest.get(dep) {
                    visit(manifest, dep_entry, marks, stack)?;
                }
            }
        }
    }

    stack.pop();
    marks.insert(entry.name.as_str(), Mark::Done);
    Ok(())
}

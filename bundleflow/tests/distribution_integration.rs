//! Integration tests for bundle distribution.
//!
//! These tests drive a [`BundleSystem`] end to end against an in-memory
//! server:
//! - update flow from version document to persisted local manifest
//! - retry, integrity and concurrency behaviour of the download pool
//! - dirty-sandbox recovery across app builds
//! - on-demand loading in host, built-in and simulated modes
//!
//! Run with: `cargo test --test distribution_integration`

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use bundleflow::cache::OpenOutcome;
use bundleflow::diff::DownloadScope;
use bundleflow::download::{Fault, MemoryTransport};
use bundleflow::loader::{
    AssetObject, BundleArchive, DecryptionMode, DecryptorRegistry, LoaderState, ProviderState,
    SceneMode, XorDecryptor,
};
use bundleflow::manifest::{EntryFlags, Manifest, ManifestEntry};
use bundleflow::update::{FlowState, OperatorSignal, Suspension, UpdateEvent, UpdateOutcome};
use bundleflow::verify::digest_bytes;
use bundleflow::{BundleError, BundleSystem, PlayMode, Settings};

// ============================================================================
// Helper Functions
// ============================================================================

/// An archive holding one object named `data`.
fn archive(payload: &[u8]) -> Vec<u8> {
    BundleArchive::new()
        .with_object("data", payload.to_vec())
        .to_bytes()
        .unwrap()
}

fn entry_for(name: &str, bytes: &[u8], version: u32) -> ManifestEntry {
    let d = digest_bytes(bytes);
    ManifestEntry::new(name, d.content_hash, d.checksum, d.size_bytes, version)
}

/// In-memory server publishing versions of a manifest.
struct Server {
    transport: Arc<MemoryTransport>,
}

impl Server {
    fn new(transport: MemoryTransport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Serve `entries` (with their bytes) as resource version `version`.
    fn publish(&self, version: u32, entries: Vec<(ManifestEntry, Vec<u8>)>) -> Manifest {
        let mut published = Vec::new();
        for (entry, bytes) in entries {
            self.transport
                .serve(format!("{}/{}", version, entry.content_hash), bytes);
            published.push(entry);
        }
        let manifest = Manifest::new(version, published).unwrap();
        self.transport.serve(
            "version.json",
            format!(
                r#"{{ "resource_version": {}, "min_app_version": "1.0.0" }}"#,
                version
            ),
        );
        self.transport.serve(
            format!("{}/manifest.json", version),
            manifest.to_json().unwrap(),
        );
        manifest
    }

    fn system(&self, settings: Settings) -> BundleSystem {
        BundleSystem::builder(settings)
            .with_transport(self.transport.clone())
            .initialize()
            .unwrap()
    }
}

fn settings(root: &Path, app_version: &str) -> Settings {
    Settings::new(root.join("builtin"), root.join("sandbox"))
        .with_remote("http://primary", Some("http://fallback".to_string()))
        .with_app_version(app_version)
}

/// Write `bytes` into the built-in root and list `entry` in its manifest.
fn ship_builtin(root: &Path, entries: &[(ManifestEntry, Vec<u8>)]) -> Manifest {
    let builtin = root.join("builtin");
    fs::create_dir_all(&builtin).unwrap();
    for (entry, bytes) in entries {
        fs::write(builtin.join(&entry.content_hash), bytes).unwrap();
    }
    let manifest = Manifest::new(1, entries.iter().map(|(e, _)| e.clone()).collect()).unwrap();
    manifest.save(&builtin.join("manifest.json")).unwrap();
    manifest
}

/// Tick until the update flow stops running.
fn settle(system: &mut BundleSystem) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        system.tick();
        if !matches!(system.update_state(), Some(FlowState::Running)) {
            return;
        }
        assert!(Instant::now() < deadline, "update did not settle");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Run a full update, accepting the download list when asked.
fn run_update(system: &mut BundleSystem) -> UpdateOutcome {
    system.begin_update(DownloadScope::All).unwrap();
    settle(system);
    if matches!(
        system.update_state(),
        Some(FlowState::Suspended(Suspension::AwaitingConfirmation { .. }))
    ) {
        system
            .submit_operator_signal(OperatorSignal::BeginDownload)
            .unwrap();
        settle(system);
    }
    match system.update_state() {
        Some(FlowState::Finished(outcome)) => outcome.clone(),
        other => panic!("update did not finish: {:?}", other),
    }
}

// ============================================================================
// Update Flow
// ============================================================================

/// A bundle shipped with the app and a bundle already cached are skipped;
/// only the new one is downloaded.
#[test]
fn test_three_entry_update_downloads_one() {
    let temp = TempDir::new().unwrap();
    let server = Server::new(MemoryTransport::new());

    let base = archive(b"base");
    let shared = archive(b"shared");
    let fresh = archive(b"fresh");
    let base_entry = entry_for("base", &base, 1);
    let shared_entry = entry_for("shared", &shared, 2);
    let fresh_entry = entry_for("fresh", &fresh, 3);

    ship_builtin(temp.path(), &[(base_entry.clone(), base.clone())]);
    server.publish(
        2,
        vec![
            (base_entry.clone(), base.clone()),
            (shared_entry.clone(), shared.clone()),
        ],
    );

    let mut system = server.system(settings(temp.path(), "1.0.0"));
    assert!(matches!(
        run_update(&mut system),
        UpdateOutcome::Updated { files: 1, .. }
    ));

    server.publish(
        3,
        vec![
            (base_entry.clone(), base),
            (shared_entry.clone(), shared),
            (fresh_entry.clone(), fresh.clone()),
        ],
    );
    system.begin_update(DownloadScope::All).unwrap();
    settle(&mut system);

    assert_eq!(
        system.download_summary(),
        Some((1, fresh_entry.size_bytes))
    );
    system
        .submit_operator_signal(OperatorSignal::BeginDownload)
        .unwrap();
    settle(&mut system);

    assert_eq!(system.local_manifest().resource_version, 3);
    assert_eq!(server.transport.request_count(&base_entry.content_hash), 0);
    assert_eq!(server.transport.request_count(&shared_entry.content_hash), 1);
    assert_eq!(server.transport.request_count(&fresh_entry.content_hash), 1);
    assert!(system.cache().contains(&fresh_entry.content_hash));
}

/// Two corrupted transfers are retried; the bundle is committed once.
#[test]
fn test_integrity_failures_then_success_commit_once() {
    let temp = TempDir::new().unwrap();
    let server = Server::new(MemoryTransport::new());
    let bytes = archive(b"payload");
    let entry = entry_for("level", &bytes, 2);
    server.publish(2, vec![(entry.clone(), bytes)]);
    let key = format!("2/{}", entry.content_hash);
    server.transport.push_fault(key.clone(), Fault::Corrupt);
    server.transport.push_fault(key, Fault::Corrupt);

    let mut system = server.system(settings(temp.path(), "1.0.0").with_max_retries(3));
    let outcome = run_update(&mut system);

    assert!(matches!(outcome, UpdateOutcome::Updated { files: 1, .. }));
    assert_eq!(server.transport.request_count(&entry.content_hash), 3);
    assert_eq!(system.cache_stats().insertions, 1);
    assert!(system.cache().contains(&entry.content_hash));

    let requests = server.transport.requests();
    let bundle_requests: Vec<_> = requests
        .iter()
        .filter(|u| u.ends_with(&entry.content_hash))
        .collect();
    assert!(bundle_requests[0].starts_with("http://primary/"));
    assert!(bundle_requests[1].starts_with("http://fallback/"));
    assert!(bundle_requests[2].starts_with("http://primary/"));
}

/// Ten bundles with four transfer slots never run more than four at once.
#[test]
fn test_concurrency_bounded_by_max_concurrent() {
    let temp = TempDir::new().unwrap();
    let server = Server::new(MemoryTransport::new().with_delay(Duration::from_millis(20)));
    let entries: Vec<_> = (0..10)
        .map(|i| {
            let bytes = archive(format!("bundle-{}", i).as_bytes());
            (entry_for(&format!("b{}", i), &bytes, 2), bytes)
        })
        .collect();
    let manifest = server.publish(2, entries);

    let mut system =
        server.system(settings(temp.path(), "1.0.0").with_max_concurrent_downloads(4));
    let outcome = run_update(&mut system);

    assert!(matches!(outcome, UpdateOutcome::Updated { files: 10, .. }));
    let peak = server.transport.peak_concurrency();
    assert!(peak >= 1 && peak <= 4, "peak concurrency was {}", peak);
    assert!(manifest
        .iter()
        .all(|e| system.cache().contains(&e.content_hash)));
}

/// Download progress is reported while files transfer.
#[test]
fn test_update_reports_progress_events() {
    let temp = TempDir::new().unwrap();
    let server = Server::new(MemoryTransport::new());
    let bytes = archive(b"ui");
    server.publish(4, vec![(entry_for("ui", &bytes, 4), bytes)]);

    let mut system = server.system(settings(temp.path(), "1.0.0"));
    run_update(&mut system);

    let events = system.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, UpdateEvent::DownloadProgress(p) if p.is_complete())));
    assert!(matches!(
        events.last(),
        Some(UpdateEvent::Finished(UpdateOutcome::Updated { .. }))
    ));
    assert!(system.drain_events().is_empty());
}

// ============================================================================
// Manifest Structure
// ============================================================================

/// A cyclic app-bundled manifest stops initialization before any request.
#[test]
fn test_cycle_rejected_before_any_download() {
    let temp = TempDir::new().unwrap();
    let builtin = temp.path().join("builtin");
    fs::create_dir_all(&builtin).unwrap();
    fs::write(
        builtin.join("manifest.json"),
        r#"{ "resource_version": 1, "elements": [
            { "name": "A", "content_hash": "h1", "checksum": "00000000", "size_bytes": 1,
              "version": 1, "dependencies": ["B"] },
            { "name": "B", "content_hash": "h2", "checksum": "00000000", "size_bytes": 1,
              "version": 1, "dependencies": ["A"] } ] }"#,
    )
    .unwrap();

    let transport = Arc::new(MemoryTransport::new());
    let result = BundleSystem::builder(settings(temp.path(), "1.0.0"))
        .with_transport(transport.clone())
        .initialize();

    match result {
        Err(BundleError::DependencyCycle { path }) => {
            assert_eq!(path.first(), path.last());
        }
        other => panic!("expected dependency cycle, got {:?}", other.map(|_| ())),
    }
    assert!(transport.requests().is_empty());
}

// ============================================================================
// Sandbox Recovery
// ============================================================================

/// A cache written by build 1.0 is discarded by build 1.1.
#[test]
fn test_dirty_cache_cleared_on_new_build() {
    let temp = TempDir::new().unwrap();
    let server = Server::new(MemoryTransport::new());
    let bytes = archive(b"level");
    let entry = entry_for("level", &bytes, 2);
    server.publish(2, vec![(entry.clone(), bytes)]);

    let mut system = server.system(settings(temp.path(), "1.0.0"));
    run_update(&mut system);
    let cached = system.cache().cached_path(&entry.content_hash);
    assert!(cached.is_file());
    drop(system);

    let system = server.system(settings(temp.path(), "1.1.0"));
    assert_eq!(
        system.open_outcome(),
        &OpenOutcome::ClearedDirty {
            previous: "1.0.0".to_string()
        }
    );
    assert!(system.cache().is_empty());
    assert!(!cached.exists());
    assert_eq!(system.local_manifest().resource_version, 0);
}

// ============================================================================
// Loading
// ============================================================================

/// In host mode a bundle missing locally is downloaded with its dependency.
#[test]
fn test_host_mode_downloads_on_demand() {
    let temp = TempDir::new().unwrap();
    let server = Server::new(MemoryTransport::new());

    let core = archive(b"core");
    let ui = BundleArchive::new()
        .with_object("icons/a", b"A".to_vec())
        .with_object("icons/b", b"B".to_vec())
        .to_bytes()
        .unwrap();
    let core_entry = entry_for("core", &core, 1);
    let ui_entry = entry_for("ui", &ui, 1).with_dependencies(["core"]);

    // Listed by the app-bundled manifest but not shipped.
    let builtin = temp.path().join("builtin");
    fs::create_dir_all(&builtin).unwrap();
    Manifest::new(1, vec![core_entry.clone(), ui_entry.clone()])
        .unwrap()
        .save(&builtin.join("manifest.json"))
        .unwrap();
    server
        .transport
        .serve(format!("1/{}", core_entry.content_hash), core);
    server
        .transport
        .serve(format!("1/{}", ui_entry.content_hash), ui);

    let mut system = server.system(settings(temp.path(), "1.0.0"));
    let handle = system.open("ui").unwrap();
    assert_eq!(system.wait_for_bundle(&handle).unwrap(), LoaderState::Success);
    assert!(system.cache().contains(&core_entry.content_hash));
    assert!(system.cache().contains(&ui_entry.content_hash));

    let icons = system.load_sub_assets(&handle, "icons").unwrap();
    assert_eq!(system.wait_for_asset(&icons).unwrap(), ProviderState::Success);
    match system.asset(&icons).unwrap().result() {
        Some(AssetObject::SubAssets(assets)) => assert_eq!(assets.len(), 2),
        other => panic!("unexpected result {:?}", other),
    }

    system.release(icons).unwrap();
    system.release(handle).unwrap();
    assert_eq!(system.unload_unused(), 2);
    assert_eq!(system.registry().loader_count(), 0);
}

/// Offline mode cannot resolve bundles that are neither shipped nor cached.
#[test]
fn test_offline_mode_fails_unresolved_bundle() {
    let temp = TempDir::new().unwrap();
    let server = Server::new(MemoryTransport::new());
    let bytes = archive(b"remote only");
    let entry = entry_for("remote", &bytes, 1);
    let builtin = temp.path().join("builtin");
    fs::create_dir_all(&builtin).unwrap();
    Manifest::new(1, vec![entry])
        .unwrap()
        .save(&builtin.join("manifest.json"))
        .unwrap();

    let mut system =
        server.system(settings(temp.path(), "1.0.0").with_play_mode(PlayMode::Offline));
    let handle = system.open("remote").unwrap();

    assert_eq!(system.wait_for_bundle(&handle).unwrap(), LoaderState::Fail);
    assert!(server.transport.requests().is_empty());
}

/// Encrypted and raw bundles shipped with the app open through the
/// configured decryptor.
#[test]
fn test_builtin_encrypted_and_raw_bundles() {
    let temp = TempDir::new().unwrap();
    let server = Server::new(MemoryTransport::new());
    let xor = XorDecryptor::new(b"secret".to_vec());

    let sealed = xor.encrypt(&archive(b"classified"));
    let sealed_entry = entry_for("vault", &sealed, 1).with_flags(EntryFlags {
        is_encrypted: true,
        is_builtin: true,
        ..Default::default()
    });
    let notes = b"plain text notes".to_vec();
    let notes_entry = entry_for("notes", &notes, 1).with_flags(EntryFlags {
        is_raw_file: true,
        is_builtin: true,
        ..Default::default()
    });
    ship_builtin(
        temp.path(),
        &[(sealed_entry, sealed), (notes_entry, notes.clone())],
    );

    let mut decryptors = DecryptorRegistry::empty();
    decryptors.register("xor", || Arc::new(XorDecryptor::new(b"secret".to_vec())));
    let mut system = BundleSystem::builder(
        settings(temp.path(), "1.0.0").with_decryption("xor", DecryptionMode::FullBuffer),
    )
    .with_transport(server.transport.clone())
    .with_decryptors(decryptors)
    .initialize()
    .unwrap();

    let vault = system.open("vault").unwrap();
    let data = system.load_asset(&vault, "data").unwrap();
    assert_eq!(system.wait_for_asset(&data).unwrap(), ProviderState::Success);
    match system.asset(&data).unwrap().result() {
        Some(AssetObject::Asset(asset)) => assert_eq!(asset.data, b"classified"),
        other => panic!("unexpected result {:?}", other),
    }

    let notes_handle = system.open("notes").unwrap();
    let raw = system.load_raw_file(&notes_handle).unwrap();
    assert_eq!(system.wait_for_asset(&raw).unwrap(), ProviderState::Success);
    assert_eq!(
        system.asset(&raw).unwrap().result(),
        Some(&AssetObject::Raw(notes))
    );
    assert!(server.transport.requests().is_empty());
}

/// Simulated bundles are plain directories; scenes can be held until
/// activation is allowed.
#[test]
fn test_simulated_mode_scene_activation() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("bundles");
    let level = root.join("levels");
    fs::create_dir_all(level.join("props")).unwrap();
    fs::write(level.join("intro.scene"), b"scene data").unwrap();
    fs::write(level.join("props").join("chair.bin"), b"chair").unwrap();

    let server = Server::new(MemoryTransport::new());
    let mut system = server.system(
        settings(temp.path(), "1.0.0")
            .with_play_mode(PlayMode::Simulated)
            .with_simulation_root(&root),
    );

    let handle = system.open("levels").unwrap();
    let scene = system
        .load_scene(&handle, "intro", SceneMode::Additive, false)
        .unwrap();
    assert_eq!(system.wait_for_asset(&scene).unwrap(), ProviderState::Checking);
    assert!((system.asset(&scene).unwrap().progress() - 0.9).abs() < f64::EPSILON);

    system.allow_scene_activation(&scene).unwrap();
    system.tick();
    assert_eq!(system.asset(&scene).unwrap().state(), ProviderState::Success);

    let props = system.load_sub_assets(&handle, "props").unwrap();
    assert_eq!(system.wait_for_asset(&props).unwrap(), ProviderState::Success);

    let report = system.force_unload_all();
    assert_eq!(report.loaders, 1);
    assert_eq!(report.providers, 2);
    assert!(report.interrupted.is_empty());
}

//! Resumable upload flow against a fully wired control plane: gap maps,
//! finalize, post-upload policies, download streaming.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use fabricstream::bus::{topics, InMemoryBus};
use fabricstream::config::FabricConfig;
use fabricstream::controller::{FabricController, NodeSpec};
use fabricstream::durability::DurabilityManager;
use fabricstream::lifecycle::LifecycleManager;
use fabricstream::metadata::{MetadataStore, SessionStatus};
use fabricstream::replica::ReplicaManager;
use fabricstream::upload::{GapEntry, UploadError, UploadOrchestrator};

struct ControlPlane {
    controller: Arc<Mutex<FabricController>>,
    metadata: Arc<MetadataStore>,
    bus: Arc<InMemoryBus>,
    orchestrator: UploadOrchestrator,
}

fn control_plane() -> ControlPlane {
    let controller = Arc::new(Mutex::new(FabricController::new()));
    {
        let mut c = controller.lock();
        for id in ["n1", "n2", "n3"] {
            c.add_node(
                id,
                NodeSpec {
                    storage_gb: 100,
                    ..NodeSpec::default()
                },
            )
            .unwrap();
        }
        c.connect_nodes("n1", "n2", Some(1000), Some(1.0));
        c.connect_nodes("n2", "n3", Some(1000), Some(1.0));
        c.connect_nodes("n1", "n3", Some(1000), Some(2.0));
    }
    let config = Arc::new(FabricConfig::default());
    let bus = Arc::new(InMemoryBus::new());
    let metadata = Arc::new(MetadataStore::new().with_bus(Arc::clone(&bus)));
    let replica = Arc::new(ReplicaManager::new(
        Arc::clone(&controller),
        Arc::clone(&metadata),
        Arc::clone(&config),
    ));
    let lifecycle = Arc::new(
        LifecycleManager::new(
            Arc::clone(&controller),
            Arc::clone(&metadata),
            Arc::clone(&config),
        )
        .with_bus(Arc::clone(&bus)),
    );
    let durability = Arc::new(DurabilityManager::new(
        Arc::clone(&controller),
        Arc::clone(&metadata),
        Arc::clone(&config),
    ));
    let orchestrator = UploadOrchestrator::new(
        Arc::clone(&controller),
        Arc::clone(&metadata),
        Arc::clone(&bus),
        Arc::clone(&config),
    )
    .with_replica_manager(replica)
    .with_lifecycle_manager(lifecycle)
    .with_durability_manager(durability);
    ControlPlane {
        controller,
        metadata,
        bus,
        orchestrator,
    }
}

#[test]
fn resumable_upload_via_gap_map() {
    let plane = control_plane();
    let orch = &plane.orchestrator;

    let session = orch
        .initiate_session(
            "org-1",
            "root",
            1024,
            "alice",
            None,
            Some(512),
            BTreeMap::new(),
            None,
        )
        .unwrap();
    assert_eq!(session.chunk_size, 512);

    let first = orch
        .append_chunk(&session.session_id, "n1", "resume.bin", 512, Some(0), Some(0), None)
        .unwrap();
    assert_eq!(first.received_bytes, 512);
    assert_eq!(
        first.gap_map,
        vec![GapEntry {
            chunk_id: 1,
            offset: 512,
            length: 512
        }]
    );

    assert!(matches!(
        orch.finalize(&session.session_id),
        Err(UploadError::FinalizeBeforeReady(_))
    ));

    let second = orch
        .append_chunk(&session.session_id, "n1", "resume.bin", 512, Some(1), Some(512), None)
        .unwrap();
    assert!(second.gap_map.is_empty());
    assert_eq!(second.received_bytes, 1024);

    let manifest = orch.finalize(&session.session_id).unwrap();

    // Full download returns every byte.
    let total: usize = orch
        .stream_download(&manifest.file_id, 0, None, None)
        .unwrap()
        .map(|c| c.data.len())
        .sum();
    assert_eq!(total, 1024);

    // Partial range returns exactly the requested window.
    let partial: usize = orch
        .stream_download(&manifest.file_id, 256, Some(128), None)
        .unwrap()
        .map(|c| c.data.len())
        .sum();
    assert_eq!(partial, 128);
}

#[test]
fn append_chunk_is_idempotent_across_retries() {
    let plane = control_plane();
    let orch = &plane.orchestrator;
    let session = orch
        .initiate_session(
            "org-1",
            "root",
            2048,
            "alice",
            None,
            Some(1024),
            BTreeMap::new(),
            None,
        )
        .unwrap();

    for _ in 0..3 {
        let outcome = orch
            .append_chunk(&session.session_id, "n1", "retry.bin", 1024, Some(0), Some(0), None)
            .unwrap();
        assert_eq!(outcome.received_bytes, 1024);
    }
    let descriptor = orch.describe_session(&session.session_id).unwrap();
    assert_eq!(descriptor.committed_chunks, 1);
    assert_eq!(descriptor.received_bytes, 1024);
}

#[test]
fn finalize_runs_post_upload_pipeline() {
    let plane = control_plane();
    let orch = &plane.orchestrator;

    let replication_events = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&replication_events);
    plane.bus.subscribe(
        topics::REPLICATION_REQUESTS,
        Box::new(move |_| *sink.lock() += 1),
    );

    const CHUNK: u64 = 8 * 1024 * 1024;
    let size = 4 * CHUNK;
    let session = orch
        .initiate_session(
            "org-1",
            "root",
            size,
            "alice",
            None,
            Some(CHUNK),
            BTreeMap::new(),
            None,
        )
        .unwrap();
    for i in 0..4u32 {
        orch.append_chunk(
            &session.session_id,
            "n1",
            "report.pdf",
            CHUNK,
            Some(i),
            Some(i as u64 * CHUNK),
            None,
        )
        .unwrap();
    }
    let manifest = orch.finalize(&session.session_id).unwrap();

    // Replica policy: 2 hot + 1 cold = 3 distinct placements.
    let nodes: std::collections::BTreeSet<&str> = manifest
        .segments
        .iter()
        .filter(|s| s.storage_tier != "parity")
        .map(|s| s.node_id.as_str())
        .collect();
    assert_eq!(nodes.len(), 3);

    // Durability: checksums and an encryption envelope.
    assert!(manifest.segments.iter().all(|s| s.checksum.is_some()));
    let envelope = manifest.encryption.as_ref().unwrap();
    assert_eq!(envelope.algorithm, "AES-256-GCM");

    // Metadata: entry, version, mime type.
    let entry = plane.metadata.file(&manifest.file_id).unwrap();
    assert_eq!(entry.mime_type, "application/pdf");
    assert_eq!(plane.metadata.list_versions(&manifest.file_id).len(), 1);

    assert_eq!(*replication_events.lock(), 1);

    // The fabric holds the manifest the control plane references.
    assert!(plane
        .controller
        .lock()
        .network()
        .manifest(&manifest.manifest_id)
        .is_some());

    let descriptor = orch.describe_session(&session.session_id).unwrap();
    assert_eq!(descriptor.status, SessionStatus::Finalized);
}

#[test]
fn large_uploads_keep_exactly_one_hot_offset() {
    let plane = control_plane();
    let orch = &plane.orchestrator;

    const CHUNK: u64 = 32 * 1024 * 1024;
    let size = 100 * 1024 * 1024;
    let session = orch
        .initiate_session(
            "org-1",
            "root",
            size,
            "alice",
            None,
            Some(CHUNK),
            BTreeMap::new(),
            None,
        )
        .unwrap();
    let mut offset = 0;
    let mut chunk_id = 0;
    while offset < size {
        let len = CHUNK.min(size - offset);
        orch.append_chunk(
            &session.session_id,
            "n1",
            "huge.bin",
            len,
            Some(chunk_id),
            Some(offset),
            None,
        )
        .unwrap();
        offset += len;
        chunk_id += 1;
    }
    let manifest = orch.finalize(&session.session_id).unwrap();

    // Past the hot/cold threshold, only the first data offset stays hot.
    let hot_offsets: std::collections::BTreeSet<u64> = manifest
        .segments
        .iter()
        .filter(|s| s.storage_tier == "hot")
        .map(|s| s.offset)
        .collect();
    assert_eq!(hot_offsets.len(), 1);
    assert!(hot_offsets.contains(&0));
}

#[test]
fn new_version_reuses_preset_file_id() {
    let plane = control_plane();
    let orch = &plane.orchestrator;

    let upload = |file_id: Option<String>| {
        let session = orch
            .initiate_session(
                "org-1",
                "root",
                1024,
                "alice",
                file_id,
                Some(1024),
                BTreeMap::new(),
                None,
            )
            .unwrap();
        orch.append_chunk(&session.session_id, "n1", "doc.txt", 1024, Some(0), Some(0), None)
            .unwrap();
        orch.finalize(&session.session_id).unwrap()
    };

    let first = upload(None);
    let second = upload(Some(first.file_id.clone()));
    assert_eq!(second.file_id, first.file_id);
    let versions = plane.metadata.list_versions(&first.file_id);
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].version_number, 2);
}

#[test]
fn aborted_sessions_publish_expiry() {
    let plane = control_plane();
    let orch = &plane.orchestrator;

    let expired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&expired);
    plane.bus.subscribe(
        topics::UPLOADS_EXPIRED,
        Box::new(move |env| {
            sink.lock().push(env.payload["session_id"].as_str().unwrap().to_string())
        }),
    );

    let session = orch
        .initiate_session(
            "org-1",
            "root",
            1024,
            "alice",
            None,
            None,
            BTreeMap::new(),
            None,
        )
        .unwrap();
    orch.abort(&session.session_id);
    assert_eq!(expired.lock().as_slice(), [session.session_id.clone()]);
}

//! End-to-end controller scenarios against the stub appliance.

mod support;

use std::collections::HashMap;
use std::sync::Arc;

use zfssa_csi::types::*;
use zfssa_csi::zfssa::MASK_ALL;
use zfssa_csi::{CsiController, CsiError, CsiIdentity};

const GIB: i64 = 1 << 30;

fn block_create_request(name: &str, required: i64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_owned(),
        capacity_range: Some(CapacityRange {
            required_bytes: required,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![VolumeCapability::block(AccessMode::SingleNodeWriter)],
        parameters: HashMap::from([
            ("pool".to_owned(), support::POOL.to_owned()),
            ("project".to_owned(), support::PROJECT.to_owned()),
            ("targetGroup".to_owned(), support::TARGET_GROUP.to_owned()),
        ]),
        ..Default::default()
    }
}

fn mount_create_request(name: &str, required: i64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_owned(),
        capacity_range: Some(CapacityRange {
            required_bytes: required,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![VolumeCapability::mount(AccessMode::SingleNodeWriter)],
        parameters: HashMap::from([
            ("pool".to_owned(), support::POOL.to_owned()),
            ("project".to_owned(), support::PROJECT.to_owned()),
        ]),
        ..Default::default()
    }
}

fn publish_request(volume_id: &str, node_id: &str) -> ControllerPublishVolumeRequest {
    ControllerPublishVolumeRequest {
        volume_id: volume_id.to_owned(),
        node_id: node_id.to_owned(),
        volume_capability: Some(VolumeCapability::block(AccessMode::SingleNodeWriter)),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_block_volume_returns_canonical_id() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    let rsp = driver
        .create_volume(block_create_request("v1", 50 * GIB))
        .await
        .expect("create");

    assert_eq!(rsp.volume.volume_id, "/lun/zs1/p/j/v1");
    assert_eq!(rsp.volume.capacity_bytes, 53_687_091_200);
    assert_eq!(
        rsp.volume.volume_context.get("pool").map(String::as_str),
        Some("p")
    );
    assert_eq!(stub.state.lun_posts(), 1);
}

#[tokio::test]
async fn duplicate_create_is_idempotent() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    let first = driver
        .create_volume(block_create_request("v1", 50 * GIB))
        .await
        .expect("create");
    let second = driver
        .create_volume(block_create_request("v1", 50 * GIB))
        .await
        .expect("duplicate create");

    assert_eq!(first.volume.volume_id, second.volume.volume_id);
    assert_eq!(first.volume.capacity_bytes, second.volume.capacity_bytes);
    assert_eq!(stub.state.lun_posts(), 1);
}

#[tokio::test]
async fn duplicate_create_with_incompatible_capacity_fails() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    driver
        .create_volume(block_create_request("v1", 50 * GIB))
        .await
        .expect("create");

    let err = driver
        .create_volume(block_create_request("v1", 100 * GIB))
        .await
        .expect_err("incompatible duplicate must fail");
    match err {
        CsiError::AlreadyExists(message) => {
            assert!(
                message.contains("capacity range incompatible"),
                "unexpected message: {message}"
            );
        }
        other => panic!("expected already-exists, got {other:?}"),
    }
}

#[tokio::test]
async fn parallel_creates_issue_one_appliance_post() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);
    let driver = Arc::new(driver);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let driver = Arc::clone(&driver);
        tasks.push(tokio::spawn(async move {
            driver.create_volume(block_create_request("v1", 50 * GIB)).await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        let rsp = task.await.expect("join").expect("create");
        ids.push(rsp.volume.volume_id);
    }
    ids.dedup();
    assert_eq!(ids, vec!["/lun/zs1/p/j/v1".to_owned()]);
    assert_eq!(stub.state.lun_posts(), 1);
}

#[tokio::test]
async fn snapshot_blocks_volume_delete_until_removed() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    let created = driver
        .create_volume(block_create_request("v1", 50 * GIB))
        .await
        .expect("create");
    let volume_id = created.volume.volume_id;

    let snap = driver
        .create_snapshot(CreateSnapshotRequest {
            source_volume_id: volume_id.clone(),
            name: "s1".to_owned(),
            ..Default::default()
        })
        .await
        .expect("create snapshot");
    assert_eq!(snap.snapshot.snapshot_id, "/lun/zs1/p/j/v1/s1");
    assert_eq!(snap.snapshot.source_volume_id, volume_id);
    assert!(snap.snapshot.ready_to_use);

    let err = driver
        .delete_volume(DeleteVolumeRequest {
            volume_id: volume_id.clone(),
            ..Default::default()
        })
        .await
        .expect_err("delete must be refused while snapshots exist");
    match err {
        CsiError::FailedPrecondition(message) => {
            assert!(message.contains("snapshots"), "unexpected message: {message}");
        }
        other => panic!("expected failed-precondition, got {other:?}"),
    }

    driver
        .delete_snapshot(DeleteSnapshotRequest {
            snapshot_id: snap.snapshot.snapshot_id.clone(),
            ..Default::default()
        })
        .await
        .expect("delete snapshot");

    driver
        .delete_volume(DeleteVolumeRequest {
            volume_id: volume_id.clone(),
            ..Default::default()
        })
        .await
        .expect("delete volume");
    assert_eq!(stub.state.lun_deletes(), 1);

    // Idempotent: the volume is gone on the appliance, delete still
    // succeeds and issues no second DELETE.
    driver
        .delete_volume(DeleteVolumeRequest {
            volume_id,
            ..Default::default()
        })
        .await
        .expect("repeat delete");
    assert_eq!(stub.state.lun_deletes(), 1);
}

#[tokio::test]
async fn deleting_a_snapshot_twice_succeeds() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    driver
        .create_volume(block_create_request("v1", 50 * GIB))
        .await
        .expect("create");
    let snap = driver
        .create_snapshot(CreateSnapshotRequest {
            source_volume_id: "/lun/zs1/p/j/v1".to_owned(),
            name: "s1".to_owned(),
            ..Default::default()
        })
        .await
        .expect("create snapshot");

    for _ in 0..2 {
        driver
            .delete_snapshot(DeleteSnapshotRequest {
                snapshot_id: snap.snapshot.snapshot_id.clone(),
                ..Default::default()
            })
            .await
            .expect("delete snapshot");
    }
}

#[tokio::test]
async fn list_volumes_paginates_exhaustively() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    for i in 1..=5 {
        driver
            .create_volume(block_create_request(&format!("v{i}"), GIB))
            .await
            .expect("create");
    }

    let first = driver
        .list_volumes(ListVolumesRequest {
            max_entries: 2,
            starting_token: String::new(),
        })
        .await
        .expect("first page");
    assert_eq!(first.entries.len(), 2);
    assert_eq!(first.next_token, "2");

    let second = driver
        .list_volumes(ListVolumesRequest {
            max_entries: 2,
            starting_token: first.next_token,
        })
        .await
        .expect("second page");
    assert_eq!(second.entries.len(), 2);
    assert_eq!(second.next_token, "4");

    let last = driver
        .list_volumes(ListVolumesRequest {
            max_entries: 2,
            starting_token: second.next_token,
        })
        .await
        .expect("last page");
    assert_eq!(last.entries.len(), 1);
    assert_eq!(last.next_token, "0");

    let mut seen: Vec<String> = first
        .entries
        .iter()
        .chain(&second.entries)
        .chain(&last.entries)
        .map(|v| v.volume_id.clone())
        .collect();
    seen.dedup();
    assert_eq!(seen.len(), 5);
}

#[tokio::test]
async fn list_volumes_rejects_bad_pagination_arguments() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    let err = driver
        .list_volumes(ListVolumesRequest {
            max_entries: 0,
            starting_token: "not-a-number".to_owned(),
        })
        .await
        .expect_err("bad token");
    assert!(matches!(err, CsiError::Aborted(_)));

    let err = driver
        .list_volumes(ListVolumesRequest {
            max_entries: -1,
            starting_token: String::new(),
        })
        .await
        .expect_err("bad max_entries");
    assert!(matches!(err, CsiError::InvalidArgument(_)));
}

#[tokio::test]
async fn publish_swaps_the_mask_for_the_node_group() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    driver
        .create_volume(block_create_request("v1", 50 * GIB))
        .await
        .expect("create");
    assert_eq!(
        stub.state.initiator_group_of("v1"),
        Some(vec![MASK_ALL.to_owned()])
    );

    driver
        .controller_publish_volume(publish_request("/lun/zs1/p/j/v1", "node-1"))
        .await
        .expect("publish");
    assert_eq!(
        stub.state.initiator_group_of("v1"),
        Some(vec!["node-1".to_owned()])
    );

    // Republishing an already-published LUN reveals foreign ownership.
    let err = driver
        .controller_publish_volume(publish_request("/lun/zs1/p/j/v1", "node-2"))
        .await
        .expect_err("publish of a published lun must fail");
    assert!(matches!(err, CsiError::FailedPrecondition(_)));

    driver
        .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
            volume_id: "/lun/zs1/p/j/v1".to_owned(),
            ..Default::default()
        })
        .await
        .expect("unpublish");
    assert_eq!(
        stub.state.initiator_group_of("v1"),
        Some(vec![MASK_ALL.to_owned()])
    );
}

#[tokio::test]
async fn publish_refuses_a_lun_owned_by_somebody_else() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    stub.state
        .seed_lun("foreign", 50 * GIB, vec!["some-node-ig".to_owned()]);

    let err = driver
        .controller_publish_volume(publish_request("/lun/zs1/p/j/foreign", "node-1"))
        .await
        .expect_err("foreign lun must not be hijacked");
    match err {
        CsiError::FailedPrecondition(message) => {
            assert!(
                message.contains("already be published"),
                "unexpected message: {message}"
            );
        }
        other => panic!("expected failed-precondition, got {other:?}"),
    }
    assert_eq!(
        stub.state.initiator_group_of("foreign"),
        Some(vec!["some-node-ig".to_owned()])
    );
}

#[tokio::test]
async fn unpublish_of_a_deleted_lun_succeeds() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    driver
        .create_volume(block_create_request("v1", GIB))
        .await
        .expect("create");
    // The appliance loses the LUN behind the driver's back.
    stub.state.luns.lock().remove("v1");

    driver
        .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
            volume_id: "/lun/zs1/p/j/v1".to_owned(),
            ..Default::default()
        })
        .await
        .expect("unpublish of a deleted lun");
}

#[tokio::test]
async fn filesystem_create_exposes_the_mountpoint() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    let rsp = driver
        .create_volume(mount_create_request("fs1", 10 * GIB))
        .await
        .expect("create");
    assert_eq!(rsp.volume.volume_id, "/mnt/zs1/p/j/fs1");
    assert_eq!(
        rsp.volume.volume_context.get("mountpoint").map(String::as_str),
        Some("/export/fs1")
    );
    // The share defaults were injected.
    let record = stub
        .state
        .filesystems
        .lock()
        .get("fs1")
        .cloned()
        .expect("share exists");
    assert_eq!(record.share_nfs, "on");
    assert!(!record.restrict_chown);
}

#[tokio::test]
async fn filesystem_expands_and_block_does_not() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    driver
        .create_volume(mount_create_request("fs1", 10 * GIB))
        .await
        .expect("create filesystem");
    driver
        .create_volume(block_create_request("v1", 10 * GIB))
        .await
        .expect("create lun");

    let grown = driver
        .controller_expand_volume(ControllerExpandVolumeRequest {
            volume_id: "/mnt/zs1/p/j/fs1".to_owned(),
            capacity_range: CapacityRange {
                required_bytes: 20 * GIB,
                limit_bytes: 0,
            },
            ..Default::default()
        })
        .await
        .expect("expand filesystem");
    assert_eq!(grown.capacity_bytes, 20 * GIB);
    assert!(!grown.node_expansion_required);

    // Expanding to a size the share already satisfies is a no-op.
    let same = driver
        .controller_expand_volume(ControllerExpandVolumeRequest {
            volume_id: "/mnt/zs1/p/j/fs1".to_owned(),
            capacity_range: CapacityRange {
                required_bytes: 15 * GIB,
                limit_bytes: 0,
            },
            ..Default::default()
        })
        .await
        .expect("no-op expand");
    assert_eq!(same.capacity_bytes, 20 * GIB);

    let err = driver
        .controller_expand_volume(ControllerExpandVolumeRequest {
            volume_id: "/lun/zs1/p/j/v1".to_owned(),
            capacity_range: CapacityRange {
                required_bytes: 20 * GIB,
                limit_bytes: 0,
            },
            ..Default::default()
        })
        .await
        .expect_err("block expansion must be refused");
    assert!(matches!(err, CsiError::OutOfRange(_)));
}

#[tokio::test]
async fn clone_from_snapshot_creates_a_masked_lun() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    driver
        .create_volume(block_create_request("v1", 50 * GIB))
        .await
        .expect("create");
    let snap = driver
        .create_snapshot(CreateSnapshotRequest {
            source_volume_id: "/lun/zs1/p/j/v1".to_owned(),
            name: "s1".to_owned(),
            ..Default::default()
        })
        .await
        .expect("snapshot");

    let mut request = block_create_request("v2", 0);
    request.capacity_range = None;
    request.content_source = Some(VolumeContentSource {
        snapshot_id: snap.snapshot.snapshot_id.clone(),
    });
    let clone = driver.create_volume(request).await.expect("clone");

    assert_eq!(clone.volume.volume_id, "/lun/zs1/p/j/v2");
    assert_eq!(
        clone.volume.content_source.as_ref().map(|s| s.snapshot_id.as_str()),
        Some(snap.snapshot.snapshot_id.as_str())
    );
    assert_eq!(
        stub.state.initiator_group_of("v2"),
        Some(vec![MASK_ALL.to_owned()])
    );

    // The snapshot now has a dependent clone and refuses deletion.
    let err = driver
        .delete_snapshot(DeleteSnapshotRequest {
            snapshot_id: snap.snapshot.snapshot_id,
            ..Default::default()
        })
        .await
        .expect_err("snapshot with dependents must not be deleted");
    assert!(matches!(err, CsiError::FailedPrecondition(_)));
}

#[tokio::test]
async fn list_snapshots_filters_and_paginates() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    driver
        .create_volume(block_create_request("v1", GIB))
        .await
        .expect("create v1");
    driver
        .create_volume(mount_create_request("fs1", GIB))
        .await
        .expect("create fs1");
    for name in ["s1", "s2"] {
        driver
            .create_snapshot(CreateSnapshotRequest {
                source_volume_id: "/lun/zs1/p/j/v1".to_owned(),
                name: name.to_owned(),
                ..Default::default()
            })
            .await
            .expect("snapshot");
    }
    driver
        .create_snapshot(CreateSnapshotRequest {
            source_volume_id: "/mnt/zs1/p/j/fs1".to_owned(),
            name: "fs-snap".to_owned(),
            ..Default::default()
        })
        .await
        .expect("snapshot");

    // Exactly one snapshot by id.
    let one = driver
        .list_snapshots(ListSnapshotsRequest {
            snapshot_id: "/lun/zs1/p/j/v1/s1".to_owned(),
            ..Default::default()
        })
        .await
        .expect("list one");
    assert_eq!(one.entries.len(), 1);
    assert_eq!(one.entries[0].snapshot_id, "/lun/zs1/p/j/v1/s1");
    assert_eq!(one.next_token, "0");

    // A lookup miss is silently empty.
    let missing = driver
        .list_snapshots(ListSnapshotsRequest {
            snapshot_id: "/lun/zs1/p/j/v1/absent".to_owned(),
            ..Default::default()
        })
        .await
        .expect("list missing");
    assert!(missing.entries.is_empty());

    // Restricted to one source volume.
    let of_volume = driver
        .list_snapshots(ListSnapshotsRequest {
            source_volume_id: "/lun/zs1/p/j/v1".to_owned(),
            ..Default::default()
        })
        .await
        .expect("list by source");
    assert_eq!(of_volume.entries.len(), 2);
    assert!(of_volume
        .entries
        .iter()
        .all(|s| s.source_volume_id == "/lun/zs1/p/j/v1"));

    // The full listing sees all three.
    let all = driver
        .list_snapshots(ListSnapshotsRequest::default())
        .await
        .expect("list all");
    assert_eq!(all.entries.len(), 3);
    assert_eq!(all.next_token, "0");
}

#[tokio::test]
async fn get_capacity_reports_project_pool_and_appliance_levels() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    let project = driver
        .get_capacity(GetCapacityRequest {
            parameters: HashMap::from([
                ("pool".to_owned(), support::POOL.to_owned()),
                ("project".to_owned(), support::PROJECT.to_owned()),
            ]),
            ..Default::default()
        })
        .await
        .expect("project capacity");
    assert_eq!(project.available_capacity, support::PROJECT_AVAILABLE);

    let pool = driver
        .get_capacity(GetCapacityRequest {
            parameters: HashMap::from([("pool".to_owned(), support::POOL.to_owned())]),
            ..Default::default()
        })
        .await
        .expect("pool capacity");
    assert_eq!(pool.available_capacity, support::POOL_AVAILABLE);

    let appliance = driver
        .get_capacity(GetCapacityRequest::default())
        .await
        .expect("appliance capacity");
    assert_eq!(appliance.available_capacity, support::POOL_AVAILABLE);

    // A project without a pool is underspecified.
    let err = driver
        .get_capacity(GetCapacityRequest {
            parameters: HashMap::from([("project".to_owned(), support::PROJECT.to_owned())]),
            ..Default::default()
        })
        .await
        .expect_err("project without pool");
    assert!(matches!(err, CsiError::InvalidArgument(_)));
}

#[tokio::test]
async fn create_validation_rejects_bad_requests() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    // Missing capabilities.
    let mut request = block_create_request("v1", GIB);
    request.volume_capabilities.clear();
    assert!(matches!(
        driver.create_volume(request).await,
        Err(CsiError::InvalidArgument(_))
    ));

    // Missing name.
    let request = block_create_request("", GIB);
    assert!(matches!(
        driver.create_volume(request).await,
        Err(CsiError::InvalidArgument(_))
    ));

    // Unknown pool.
    let mut request = block_create_request("v1", GIB);
    request
        .parameters
        .insert("pool".to_owned(), "absent".to_owned());
    assert!(matches!(
        driver.create_volume(request).await,
        Err(CsiError::NotFound(_))
    ));

    // Block requests need a target group.
    let mut request = block_create_request("v1", GIB);
    request.parameters.remove("targetGroup");
    assert!(matches!(
        driver.create_volume(request).await,
        Err(CsiError::InvalidArgument(_))
    ));

    // Multi-writer block volumes are unsupported.
    let mut request = block_create_request("v1", GIB);
    request.volume_capabilities =
        vec![VolumeCapability::block(AccessMode::MultiNodeMultiWriter)];
    assert!(matches!(
        driver.create_volume(request).await,
        Err(CsiError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn probe_reports_readiness() {
    let stub = support::spawn().await;
    let (driver, _dir) = support::driver_for(&stub);

    assert!(driver.probe().await.expect("probe"));

    let info = driver.get_plugin_info().await.expect("plugin info");
    assert_eq!(info.name, "zfssa-csi-driver");

    let caps = driver
        .get_plugin_capabilities()
        .await
        .expect("plugin capabilities");
    assert!(caps.contains(&PluginCapability::ControllerService));
    assert!(caps.contains(&PluginCapability::OnlineVolumeExpansion));
}

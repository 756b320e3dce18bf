//! Cluster Map Module Tests
//!
//! ## Test Scopes
//! - **Merge**: incarnation precedence, tie rules, no topology injection, reconcile baselines.
//! - **Manager**: update idempotence, persistence failures, notifications, history, local edits.
//! - **Search**: predicate combination, randomized lookups, frozen snapshots.
//! - **Stores**: file and in-memory snapshot persistence.

#[cfg(test)]
mod tests {
    use crate::cmap::merge::{Baseline, merge, reconcile};
    use crate::cmap::{
        CMap, CMapError, CMapManager, EncodingGroup, EncodingGroupId, EncodingGroupStatus,
        FileStore, MemoryStore, Node, NodeId, NodeStatus, NodeType, SearchCall, SnapshotStore,
        StoreError, UpdateOutcome, Volume, VolumeId, VolumeSpeed, VolumeStatus,
    };
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot::error::TryRecvError;

    fn volume(id: u64, owner: u64, speed: VolumeSpeed, status: VolumeStatus) -> Volume {
        Volume {
            id: VolumeId(id),
            incarnation: 0,
            size: 1 << 30,
            speed,
            status,
            owner: NodeId(owner),
            encoding_group_ids: vec![EncodingGroupId(100)],
            max_encoding_groups: 4,
        }
    }

    /// One metadata server, two data servers and a gateway; two volumes in
    /// one encoding group.
    fn sample_cmap(version: u64) -> CMap {
        let mut cmap = CMap::new(version);
        cmap.nodes = vec![
            Node::new(NodeId(1), "mds-1", "10.0.0.1:7946", NodeType::Metadata),
            Node::new(NodeId(2), "ds-2", "10.0.0.2:7946", NodeType::Data),
            Node::new(NodeId(3), "ds-3", "10.0.0.3:7946", NodeType::Data),
            Node::new(NodeId(4), "gw-4", "10.0.0.4:7946", NodeType::Gateway),
        ];
        cmap.volumes = vec![
            volume(10, 2, VolumeSpeed::High, VolumeStatus::Active),
            volume(11, 3, VolumeSpeed::Mid, VolumeStatus::Prepared),
        ];
        cmap.encoding_groups = vec![EncodingGroup {
            id: EncodingGroupId(100),
            incarnation: 0,
            status: EncodingGroupStatus::Alive,
            size: 2 << 30,
            used: 0,
            free: 2 << 30,
            unencoded: 0,
            member_volume_ids: vec![VolumeId(10), VolumeId(11)],
        }];
        cmap
    }

    fn with_node(mut cmap: CMap, id: u64, status: NodeStatus, incarnation: u64) -> CMap {
        let node = cmap.node_mut(NodeId(id)).unwrap();
        node.status = status;
        node.incarnation = incarnation;
        cmap
    }

    fn node_state(cmap: &CMap, id: u64) -> (NodeStatus, u64) {
        let node = cmap.node(NodeId(id)).unwrap();
        (node.status, node.incarnation)
    }

    fn memory_manager(initial: CMap) -> (Arc<MemoryStore>, Arc<CMapManager>) {
        let store = Arc::new(MemoryStore::new());
        let manager = CMapManager::with_snapshot(store.clone(), initial);
        (store, manager)
    }

    // ============================================================
    // TYPE TESTS
    // ============================================================

    #[test]
    fn test_node_type_from_str() {
        assert_eq!("metadata".parse::<NodeType>(), Ok(NodeType::Metadata));
        assert_eq!("MDS".parse::<NodeType>(), Ok(NodeType::Metadata));
        assert_eq!("data".parse::<NodeType>(), Ok(NodeType::Data));
        assert_eq!("gw".parse::<NodeType>(), Ok(NodeType::Gateway));
        assert!("storage".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(NodeId(7).to_string(), "node-7");
        assert_eq!(VolumeId(3).to_string(), "vol-3");
        assert_eq!(EncodingGroupId(9).to_string(), "eg-9");
    }

    #[test]
    fn test_encoding_group_leader_is_last_member() {
        let cmap = sample_cmap(1);
        let group = cmap.encoding_group(EncodingGroupId(100)).unwrap();
        assert_eq!(group.leader(), Some(VolumeId(11)));
    }

    #[test]
    fn test_health_differs_ignores_added_entities() {
        let before = sample_cmap(1);
        let mut after = sample_cmap(2);
        after.nodes.push(Node::new(
            NodeId(5),
            "ds-5",
            "10.0.0.5:7946",
            NodeType::Data,
        ));
        assert!(!before.health_differs(&after));

        let after = with_node(sample_cmap(2), 2, NodeStatus::Suspect, 1);
        assert!(before.health_differs(&after));
    }

    #[test]
    fn test_cmap_json_serialization() {
        let cmap = sample_cmap(4);
        let json = serde_json::to_string(&cmap).unwrap();
        let decoded: CMap = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, cmap);
    }

    // ============================================================
    // MERGE TESTS
    // ============================================================

    #[test]
    fn test_merge_with_itself_is_noop() {
        let cmap = with_node(sample_cmap(3), 2, NodeStatus::Suspect, 2);
        let (merged, changed) = merge(&cmap, &cmap);

        assert!(!changed);
        assert_eq!(merged, cmap);
    }

    #[test]
    fn test_merge_higher_incarnation_wins() {
        let dst = sample_cmap(1);
        let src = with_node(sample_cmap(1), 2, NodeStatus::Suspect, 1);

        let (merged, changed) = merge(&src, &dst);

        assert!(changed);
        assert_eq!(node_state(&merged, 2), (NodeStatus::Suspect, 1));
        // untouched entities keep dst's values
        assert_eq!(node_state(&merged, 3), (NodeStatus::Alive, 0));
    }

    #[test]
    fn test_merge_lower_incarnation_ignored() {
        let dst = with_node(sample_cmap(1), 2, NodeStatus::Suspect, 3);
        let src = with_node(sample_cmap(1), 2, NodeStatus::Alive, 2);

        let (merged, changed) = merge(&src, &dst);

        assert!(!changed);
        assert_eq!(node_state(&merged, 2), (NodeStatus::Suspect, 3));
    }

    #[test]
    fn test_merge_keeps_descriptive_fields_of_dst() {
        let dst = sample_cmap(1);
        let mut src = with_node(sample_cmap(1), 2, NodeStatus::Suspect, 1);
        src.node_mut(NodeId(2)).unwrap().address = "192.168.0.2:7946".to_string();
        src.node_mut(NodeId(2)).unwrap().name = "renamed".to_string();

        let (merged, _) = merge(&src, &dst);
        let node = merged.node(NodeId(2)).unwrap();

        assert_eq!(node.address, "10.0.0.2:7946");
        assert_eq!(node.name, "ds-2");
    }

    #[test]
    fn test_merge_equal_incarnation_alive_clears_suspect() {
        let dst = with_node(sample_cmap(1), 2, NodeStatus::Suspect, 1);
        let src = with_node(sample_cmap(1), 2, NodeStatus::Alive, 1);

        let (merged, changed) = merge(&src, &dst);
        assert!(changed);
        assert_eq!(node_state(&merged, 2), (NodeStatus::Alive, 1));

        // the reverse direction keeps dst on a tie
        let (merged, changed) = merge(&dst, &src);
        assert!(!changed);
        assert_eq!(node_state(&merged, 2), (NodeStatus::Alive, 1));
    }

    #[test]
    fn test_merge_equal_incarnation_faulty_overrides() {
        let dst = with_node(sample_cmap(1), 2, NodeStatus::Alive, 1);
        let src = with_node(sample_cmap(1), 2, NodeStatus::Faulty, 1);

        let (merged, changed) = merge(&src, &dst);

        assert!(changed);
        assert_eq!(node_state(&merged, 2), (NodeStatus::Faulty, 1));
    }

    #[test]
    fn test_merge_never_downgrades_faulty() {
        let dst = with_node(sample_cmap(1), 2, NodeStatus::Faulty, 1);
        let src = with_node(sample_cmap(1), 2, NodeStatus::Alive, 5);

        let (merged, changed) = merge(&src, &dst);

        assert!(changed, "incarnation still advances");
        assert_eq!(node_state(&merged, 2), (NodeStatus::Faulty, 5));

        let (merged, changed) = merge(&merged, &merged.clone());
        assert!(!changed);
        assert_eq!(node_state(&merged, 2), (NodeStatus::Faulty, 5));
    }

    #[test]
    fn test_merge_faulty_source_beats_higher_alive() {
        let src = with_node(sample_cmap(3), 2, NodeStatus::Faulty, 1);
        let dst = with_node(sample_cmap(4), 2, NodeStatus::Alive, 2);

        let (merged, changed) = merge(&src, &dst);

        assert!(changed);
        assert_eq!(node_state(&merged, 2), (NodeStatus::Faulty, 2));
    }

    #[test]
    fn test_merge_incarnation_is_monotonic() {
        let statuses = [NodeStatus::Alive, NodeStatus::Suspect, NodeStatus::Faulty];

        for src_inc in 0..3 {
            for dst_inc in 0..3 {
                for src_status in statuses {
                    for dst_status in statuses {
                        let src = with_node(sample_cmap(1), 2, src_status, src_inc);
                        let dst = with_node(sample_cmap(1), 2, dst_status, dst_inc);

                        let (merged, _) = merge(&src, &dst);
                        let (status, incarnation) = node_state(&merged, 2);

                        assert!(incarnation >= dst_inc);
                        assert_eq!(incarnation, src_inc.max(dst_inc));
                        if dst_status == NodeStatus::Faulty || src_status == NodeStatus::Faulty {
                            assert_eq!(status, NodeStatus::Faulty);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_merge_does_not_inject_unknown_entities() {
        let dst = sample_cmap(1);
        let mut src = sample_cmap(1);
        src.nodes.push(Node::new(
            NodeId(9),
            "ds-9",
            "10.0.0.9:7946",
            NodeType::Data,
        ));
        src.volumes
            .push(volume(12, 9, VolumeSpeed::Low, VolumeStatus::Active));

        let (merged, changed) = merge(&src, &dst);

        assert!(!changed);
        assert!(merged.node(NodeId(9)).is_none());
        assert!(merged.volume(VolumeId(12)).is_none());
    }

    #[test]
    fn test_merge_volume_requires_strictly_higher_incarnation() {
        let dst = sample_cmap(1);
        let mut src = sample_cmap(1);
        src.volumes[0].status = VolumeStatus::Failed;

        let (merged, changed) = merge(&src, &dst);
        assert!(!changed, "ties keep dst for volumes");
        assert_eq!(merged.volumes[0].status, VolumeStatus::Active);

        src.volumes[0].incarnation = 1;
        src.volumes[0].size = 42;
        let (merged, changed) = merge(&src, &dst);
        assert!(changed);
        assert_eq!(merged.volumes[0].status, VolumeStatus::Failed);
        assert_eq!(merged.volumes[0].size, 42);
        assert_eq!(merged.volumes[0].owner, NodeId(2));
    }

    #[test]
    fn test_merge_encoding_group_keeps_member_order() {
        let dst = sample_cmap(1);
        let mut src = sample_cmap(1);
        let group = &mut src.encoding_groups[0];
        group.incarnation = 2;
        group.status = EncodingGroupStatus::Suspect;
        group.used = 10;
        group.member_volume_ids.reverse();

        let (merged, changed) = merge(&src, &dst);
        let group = &merged.encoding_groups[0];

        assert!(changed);
        assert_eq!(group.status, EncodingGroupStatus::Suspect);
        assert_eq!(group.used, 10);
        assert_eq!(group.leader(), Some(VolumeId(11)));
    }

    #[test]
    fn test_merge_tolerates_duplicate_ids() {
        let dst = sample_cmap(1);
        let mut src = with_node(sample_cmap(1), 2, NodeStatus::Suspect, 4);
        let mut duplicate = src.node(NodeId(2)).unwrap().clone();
        duplicate.incarnation = 9;
        src.nodes.push(duplicate);

        let (merged, _) = merge(&src, &dst);

        // first occurrence wins
        assert_eq!(node_state(&merged, 2), (NodeStatus::Suspect, 4));
    }

    #[test]
    fn test_reconcile_remote_baseline_when_newer() {
        let local = with_node(sample_cmap(1), 3, NodeStatus::Suspect, 1);
        let mut remote = sample_cmap(2);
        remote.nodes.push(Node::new(
            NodeId(5),
            "ds-5",
            "10.0.0.5:7946",
            NodeType::Data,
        ));

        let reconciled = reconcile(&local, &remote);

        assert_eq!(reconciled.baseline, Baseline::Remote);
        assert_eq!(reconciled.merged.version, 2);
        assert!(reconciled.merged.node(NodeId(5)).is_some());
        // local health knowledge survives the structural upgrade
        assert_eq!(node_state(&reconciled.merged, 3), (NodeStatus::Suspect, 1));
    }

    #[test]
    fn test_reconcile_equal_version_adds_unknown_entities() {
        let local = sample_cmap(3);
        let mut remote = sample_cmap(3);
        remote.nodes.push(Node::new(
            NodeId(5),
            "ds-5",
            "10.0.0.5:7946",
            NodeType::Data,
        ));
        remote
            .volumes
            .push(volume(12, 5, VolumeSpeed::Low, VolumeStatus::Prepared));

        let reconciled = reconcile(&local, &remote);

        assert_eq!(reconciled.baseline, Baseline::Local);
        assert!(reconciled.changed);
        assert!(reconciled.merged.node(NodeId(5)).is_some());
        assert!(reconciled.merged.volume(VolumeId(12)).is_some());
        assert_eq!(reconciled.merged.nodes.len(), 5);

        // an older peer never re-adds entities
        let mut older = remote.clone();
        older.version = 2;
        let reconciled = reconcile(&local, &older);
        assert!(!reconciled.changed);
        assert!(reconciled.merged.node(NodeId(5)).is_none());
    }

    #[test]
    fn test_reconcile_local_baseline_on_equal_or_older() {
        let local = sample_cmap(3);
        let remote = with_node(sample_cmap(3), 2, NodeStatus::Suspect, 1);

        let reconciled = reconcile(&local, &remote);
        assert_eq!(reconciled.baseline, Baseline::Local);
        assert!(reconciled.changed);
        assert_eq!(node_state(&reconciled.merged, 2), (NodeStatus::Suspect, 1));

        let older = with_node(sample_cmap(2), 2, NodeStatus::Faulty, 0);
        let reconciled = reconcile(&local, &older);
        assert_eq!(reconciled.baseline, Baseline::Local);
        assert_eq!(reconciled.merged.version, 3);
        assert_eq!(node_state(&reconciled.merged, 2), (NodeStatus::Faulty, 0));
    }

    // ============================================================
    // MANAGER: UPDATE & PERSISTENCE
    // ============================================================

    #[test]
    fn test_manager_starts_empty_without_snapshot() {
        let manager = CMapManager::new(Arc::new(MemoryStore::new())).unwrap();

        assert_eq!(manager.latest_version(), 0);
        assert!(manager.latest_snapshot().nodes.is_empty());
    }

    #[test]
    fn test_manager_loads_latest_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.save(&sample_cmap(3)).unwrap();
        store.save(&sample_cmap(7)).unwrap();
        store.save(&sample_cmap(5)).unwrap();

        let manager = CMapManager::new(store).unwrap();

        assert_eq!(manager.latest_version(), 7);
        assert_eq!(manager.latest_snapshot().nodes.len(), 4);
    }

    #[test]
    fn test_update_is_idempotent() {
        let (store, manager) = memory_manager(sample_cmap(1));

        let outcome = manager.update(sample_cmap(2)).unwrap();
        assert_eq!(outcome, UpdateOutcome::Committed(2));

        let outcome = manager.update(sample_cmap(2)).unwrap();
        assert_eq!(outcome, UpdateOutcome::Stale { current: 2 });

        let outcome = manager.update(sample_cmap(1)).unwrap();
        assert_eq!(outcome, UpdateOutcome::Stale { current: 2 });

        assert_eq!(manager.latest_version(), 2);
        assert_eq!(store.saved_versions(), vec![2]);
    }

    #[tokio::test]
    async fn test_commit_is_saved_before_it_is_published() {
        let (store, manager) = memory_manager(sample_cmap(1));
        let updated = manager.get_updated_noti(1);

        let writer = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.update(sample_cmap(2)) })
        };

        assert_eq!(updated.await, Ok(2));
        assert_eq!(store.saved_versions(), vec![2]);
        assert_eq!(writer.await.unwrap().unwrap(), UpdateOutcome::Committed(2));
    }

    #[test]
    fn test_update_persistence_failure_aborts_commit() {
        let (store, manager) = memory_manager(sample_cmap(1));
        let mut updated = manager.get_updated_noti(1);

        store.set_failing(true);
        let err = manager.update(sample_cmap(2)).unwrap_err();

        assert!(matches!(
            err,
            CMapError::Persistence {
                version: 2,
                source: StoreError::Unavailable(_)
            }
        ));
        assert_eq!(manager.latest_version(), 1);
        assert_eq!(updated.try_recv(), Err(TryRecvError::Empty));

        store.set_failing(false);
        assert_eq!(
            manager.update(sample_cmap(2)).unwrap(),
            UpdateOutcome::Committed(2)
        );
        assert_eq!(updated.try_recv(), Ok(2));
    }

    #[test]
    fn test_merge_remote_persistence_failure_leaves_state() {
        let (store, manager) = memory_manager(sample_cmap(1));
        let peer = with_node(sample_cmap(1), 2, NodeStatus::Suspect, 1);

        store.set_failing(true);
        assert!(manager.merge_remote(&peer).is_err());
        assert_eq!(node_state(&manager.latest_snapshot(), 2), (NodeStatus::Alive, 0));

        store.set_failing(false);
        let report = manager.merge_remote(&peer).unwrap();
        assert!(report.committed);
        assert_eq!(node_state(&manager.latest_snapshot(), 2), (NodeStatus::Suspect, 1));
    }

    #[test]
    fn test_latest_snapshot_is_a_deep_copy() {
        let (_, manager) = memory_manager(sample_cmap(1));

        let mut copy = manager.latest_snapshot();
        copy.nodes.clear();
        copy.volumes[0].status = VolumeStatus::Failed;

        let current = manager.latest_snapshot();
        assert_eq!(current.nodes.len(), 4);
        assert_eq!(current.volumes[0].status, VolumeStatus::Active);
    }

    // ============================================================
    // MANAGER: MERGE & LOCAL EDITS
    // ============================================================

    #[test]
    fn test_merge_remote_equal_version_commits_in_place() {
        let (_, manager) = memory_manager(sample_cmap(4));
        let peer = with_node(sample_cmap(4), 3, NodeStatus::Faulty, 0);

        let report = manager.merge_remote(&peer).unwrap();

        assert_eq!(report.baseline, Baseline::Local);
        assert!(report.committed);
        assert!(report.health_changed);
        assert_eq!(report.version, 4);
        assert_eq!(manager.latest_version(), 4);
        assert_eq!(node_state(&manager.latest_snapshot(), 3), (NodeStatus::Faulty, 0));
    }

    #[test]
    fn test_merge_remote_newer_version_keeps_faulty() {
        let (_, manager) = memory_manager(with_node(sample_cmap(3), 2, NodeStatus::Faulty, 1));
        let refuted = with_node(sample_cmap(4), 2, NodeStatus::Alive, 2);

        let report = manager.merge_remote(&refuted).unwrap();

        assert_eq!(report.baseline, Baseline::Remote);
        assert_eq!(manager.latest_version(), 4);
        assert_eq!(node_state(&manager.latest_snapshot(), 2), (NodeStatus::Faulty, 2));
    }

    #[test]
    fn test_authoritative_map_at_gossip_version_is_merged() {
        let (_, manager) = memory_manager(sample_cmap(1));
        manager
            .mutate(|cmap| {
                let node = cmap.node_mut(NodeId(3)).unwrap();
                node.status = NodeStatus::Suspect;
                node.incarnation = 1;
                true
            })
            .unwrap();
        assert_eq!(manager.latest_version(), 2);

        let mut published = sample_cmap(2);
        published.nodes.push(Node::new(
            NodeId(5),
            "ds-5",
            "10.0.0.5:7946",
            NodeType::Data,
        ));
        assert_eq!(
            manager.update(published.clone()).unwrap(),
            UpdateOutcome::Stale { current: 2 }
        );

        let report = manager.merge_remote(&published).unwrap();

        assert!(report.committed);
        assert_eq!(report.version, 2);
        let current = manager.latest_snapshot();
        assert!(current.node(NodeId(5)).is_some());
        assert_eq!(node_state(&current, 3), (NodeStatus::Suspect, 1));
    }

    #[test]
    fn test_merge_remote_without_changes_does_not_commit() {
        let (store, manager) = memory_manager(sample_cmap(4));

        let report = manager.merge_remote(&sample_cmap(3)).unwrap();

        assert!(!report.committed);
        assert_eq!(report.version, 4);
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_merge_remote_adopts_newer_version() {
        let (_, manager) = memory_manager(with_node(sample_cmap(1), 2, NodeStatus::Suspect, 1));
        let updated = manager.get_updated_noti(1);

        let report = manager.merge_remote(&sample_cmap(5)).unwrap();

        assert_eq!(report.baseline, Baseline::Remote);
        assert_eq!(report.version, 5);
        assert_eq!(manager.latest_version(), 5);
        assert_eq!(node_state(&manager.latest_snapshot(), 2), (NodeStatus::Suspect, 1));
        assert_eq!(updated.blocking_recv(), Ok(5));
    }

    #[test]
    fn test_mutate_commits_next_version() {
        let (_, manager) = memory_manager(sample_cmap(3));

        let version = manager
            .mutate(|cmap| {
                cmap.node_mut(NodeId(2)).unwrap().status = NodeStatus::Suspect;
                true
            })
            .unwrap();

        assert_eq!(version, Some(4));
        assert_eq!(manager.latest_version(), 4);
        assert_eq!(
            manager.latest_snapshot().node(NodeId(2)).unwrap().status,
            NodeStatus::Suspect
        );
    }

    #[test]
    fn test_mutate_noop_keeps_version() {
        let (store, manager) = memory_manager(sample_cmap(3));

        let version = manager.mutate(|_| false).unwrap();

        assert_eq!(version, None);
        assert_eq!(manager.latest_version(), 3);
        assert_eq!(store.save_count(), 0);
    }

    // ============================================================
    // MANAGER: NOTIFICATIONS
    // ============================================================

    #[tokio::test]
    async fn test_updated_noti_immediate_when_behind() {
        let (_, manager) = memory_manager(sample_cmap(5));

        let rx = manager.get_updated_noti(3);

        assert_eq!(rx.await, Ok(5));
        assert_eq!(manager.pending_notifications(), (0, 0));
    }

    #[tokio::test]
    async fn test_updated_noti_fires_once_on_advance() {
        let (_, manager) = memory_manager(sample_cmap(1));
        let rx = manager.get_updated_noti(1);
        assert_eq!(manager.pending_notifications(), (1, 0));

        manager.update(sample_cmap(2)).unwrap();
        manager.update(sample_cmap(3)).unwrap();

        assert_eq!(rx.await, Ok(2));
        assert_eq!(manager.pending_notifications(), (0, 0));
    }

    #[tokio::test]
    async fn test_updated_noti_ignores_same_version_merge() {
        let (_, manager) = memory_manager(sample_cmap(1));
        let mut rx = manager.get_updated_noti(1);

        let peer = with_node(sample_cmap(1), 2, NodeStatus::Suspect, 1);
        manager.merge_remote(&peer).unwrap();

        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_state_changed_noti_on_health_change() {
        let (_, manager) = memory_manager(sample_cmap(1));
        let changed = manager.get_state_changed_noti();

        let peer = with_node(sample_cmap(1), 3, NodeStatus::Suspect, 1);
        manager.merge_remote(&peer).unwrap();

        assert_eq!(changed.await, Ok(1));
        assert_eq!(manager.pending_notifications(), (0, 0));
    }

    #[tokio::test]
    async fn test_state_changed_noti_ignores_topology_only_update() {
        let (_, manager) = memory_manager(sample_cmap(1));
        let mut changed = manager.get_state_changed_noti();

        let mut next = sample_cmap(2);
        next.nodes.push(Node::new(
            NodeId(5),
            "ds-5",
            "10.0.0.5:7946",
            NodeType::Data,
        ));
        manager.update(next).unwrap();

        assert_eq!(changed.try_recv(), Err(TryRecvError::Empty));

        manager.update(with_node(sample_cmap(3), 2, NodeStatus::Faulty, 1)).unwrap();
        assert_eq!(changed.await, Ok(3));
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let (_, manager) = memory_manager(sample_cmap(1));
        drop(manager.get_updated_noti(1));
        drop(manager.get_state_changed_noti());
        assert_eq!(manager.pending_notifications(), (1, 1));

        manager.update(sample_cmap(2)).unwrap();

        assert_eq!(manager.pending_notifications(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_notify_every_subscriber() {
        const SUBSCRIBERS: u64 = 64;
        const UPDATES: u64 = 16;

        let (_, manager) = memory_manager(sample_cmap(0));
        let mut tasks = Vec::new();

        for i in 0..SUBSCRIBERS {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let since = i % UPDATES;
                let rx = manager.get_updated_noti(since);
                let version = tokio::time::timeout(Duration::from_secs(5), rx)
                    .await
                    .expect("subscriber starved")
                    .expect("sender dropped");
                assert!(version > since, "got v{} for since={}", version, since);
            }));
        }

        for version in 1..=UPDATES {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.update(sample_cmap(version)).unwrap();
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(manager.latest_version(), UPDATES);
        assert_eq!(manager.pending_notifications(), (0, 0));
    }

    // ============================================================
    // MANAGER: HISTORY
    // ============================================================

    #[test]
    fn test_snapshot_at_returns_retained_versions() {
        let (_, manager) = memory_manager(sample_cmap(1));
        manager.update(sample_cmap(2)).unwrap();
        manager
            .update(with_node(sample_cmap(3), 2, NodeStatus::Faulty, 1))
            .unwrap();

        let old = manager.snapshot_at(2).unwrap();
        assert_eq!(old.version, 2);
        assert_eq!(node_state(&old, 2), (NodeStatus::Alive, 0));
        assert!(manager.snapshot_at(3).is_some());
        assert!(manager.snapshot_at(99).is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let (_, manager) = memory_manager(sample_cmap(1));
        for version in 2..=40 {
            manager.update(sample_cmap(version)).unwrap();
        }

        assert!(manager.snapshot_at(1).is_none());
        assert!(manager.snapshot_at(24).is_none());
        assert!(manager.snapshot_at(25).is_some());
        assert!(manager.snapshot_at(40).is_some());
    }

    // ============================================================
    // SEARCH TESTS
    // ============================================================

    fn two_node_cmap() -> CMap {
        let mut cmap = CMap::new(1);
        let mut faulty = Node::new(NodeId(1), "ds-1", "10.0.0.1:7946", NodeType::Data);
        faulty.status = NodeStatus::Faulty;
        cmap.nodes = vec![
            Node::new(NodeId(0), "mds-0", "10.0.0.0:7946", NodeType::Metadata),
            faulty,
        ];
        cmap
    }

    #[test]
    fn test_search_combines_predicates() {
        let call = SearchCall::new(two_node_cmap());

        let node = call
            .node()
            .node_type(NodeType::Data)
            .status(NodeStatus::Faulty)
            .find()
            .unwrap();
        assert_eq!(node.id, NodeId(1));

        let missing = call
            .node()
            .node_type(NodeType::Metadata)
            .status(NodeStatus::Faulty)
            .find();
        assert!(matches!(missing, Err(CMapError::NotFound("node"))));
    }

    #[test]
    fn test_search_by_name_not_found() {
        let call = SearchCall::new(two_node_cmap());

        assert!(matches!(
            call.node().name("missing").find(),
            Err(CMapError::NotFound(_))
        ));
        assert_eq!(call.node().name("mds-0").find().unwrap().id, NodeId(0));
    }

    #[test]
    fn test_search_without_predicates_returns_first() {
        let call = SearchCall::new(sample_cmap(1));

        assert_eq!(call.node().find().unwrap().id, NodeId(1));
        assert_eq!(call.volume().find().unwrap().id, VolumeId(10));
        assert_eq!(call.version(), 1);
    }

    #[test]
    fn test_search_random_spreads_over_matches() {
        let call = SearchCall::new(sample_cmap(1));

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let node = call.node().node_type(NodeType::Data).random().find().unwrap();
            assert_eq!(node.node_type, NodeType::Data);
            seen.insert(node.id);
        }

        assert_eq!(seen.len(), 2, "both data servers should be picked");
    }

    #[test]
    fn test_search_volumes_and_groups() {
        let call = SearchCall::new(sample_cmap(1));

        let volume = call
            .volume()
            .owner(NodeId(3))
            .speed(VolumeSpeed::Mid)
            .find()
            .unwrap();
        assert_eq!(volume.id, VolumeId(11));
        assert!(call.volume().status(VolumeStatus::Failed).find().is_err());

        let group = call.encoding_group().member(VolumeId(10)).find().unwrap();
        assert_eq!(group.id, EncodingGroupId(100));
        assert!(call.encoding_group().member(VolumeId(12)).find().is_err());
        assert!(
            call.encoding_group()
                .status(EncodingGroupStatus::Alive)
                .random()
                .find()
                .is_ok()
        );
    }

    #[test]
    fn test_search_call_sees_frozen_snapshot() {
        let (_, manager) = memory_manager(sample_cmap(1));
        let call = manager.search_call();

        manager
            .update(with_node(sample_cmap(2), 2, NodeStatus::Faulty, 1))
            .unwrap();

        assert_eq!(call.version(), 1);
        assert_eq!(
            call.node().id(NodeId(2)).find().unwrap().status,
            NodeStatus::Alive
        );
        assert_eq!(
            manager.search_call().node().id(NodeId(2)).find().unwrap().status,
            NodeStatus::Faulty
        );
    }

    // ============================================================
    // STORE TESTS
    // ============================================================

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert!(store.load_latest().unwrap().is_none());

        store.save(&sample_cmap(1)).unwrap();
        store.save(&with_node(sample_cmap(2), 2, NodeStatus::Suspect, 1)).unwrap();

        let loaded = store.load_latest().unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(node_state(&loaded, 2), (NodeStatus::Suspect, 1));
    }

    #[test]
    fn test_file_store_prunes_old_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap().with_keep(3);

        for version in 1..=6 {
            store.save(&sample_cmap(version)).unwrap();
        }

        let files = std::fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(files, 3);
        assert_eq!(store.load_latest().unwrap().unwrap().version, 6);
    }

    #[test]
    fn test_file_store_save_survives_prune_failure() {
        let dir = tempfile::tempdir().unwrap();
        // a directory under a snapshot name cannot be removed by prune
        std::fs::create_dir(dir.path().join(format!("cmap.{:020}.json", 1))).unwrap();
        let store = FileStore::open(dir.path()).unwrap().with_keep(1);

        store.save(&sample_cmap(2)).unwrap();
        store.save(&sample_cmap(3)).unwrap();

        assert_eq!(store.load_latest().unwrap().unwrap().version, 3);
    }

    #[test]
    fn test_manager_persists_through_file_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Arc::new(FileStore::open(dir.path()).unwrap());
            let manager = CMapManager::new(store).unwrap();
            manager.update(sample_cmap(9)).unwrap();
        }

        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = CMapManager::new(store).unwrap();
        assert_eq!(manager.latest_version(), 9);
    }

    #[test]
    fn test_memory_store_failing_mode() {
        let store = MemoryStore::with_snapshot(sample_cmap(1));
        store.set_failing(true);

        assert!(matches!(
            store.save(&sample_cmap(2)),
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.saved_versions(), vec![1]);
        assert_eq!(store.load_latest().unwrap().unwrap().version, 1);
    }
}

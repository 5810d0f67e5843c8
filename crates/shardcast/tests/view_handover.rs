// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! View handover: pending sender-local work survives a view change with no
//! loss and no duplicate delivery, at any crash point.

mod common;

use std::sync::Arc;
use std::time::Duration;

use shardcast::{
    FullMembershipLayout, GroupConfig, MulticastGroup, NodeSst, SharedStateTable, SstLayout, View,
};

use common::{payload, send_with_retry, wait_until, Cluster};

fn test_config() -> GroupConfig {
    GroupConfig {
        max_payload_size: 1024,
        block_size: 4096,
        window_size: 4,
        timeout_ms: 1,
        ..GroupConfig::default()
    }
}

/// Run the crash-and-handover sequence, wedging the old view after
/// `pre_wedge_delay`. Whatever the crash point, the survivor must end up
/// having delivered every payload exactly once, in sender order.
fn crash_and_recover(pre_wedge_delay: Duration) {
    let members = [1u32, 2];
    let layout: Arc<FullMembershipLayout> =
        Arc::new(FullMembershipLayout::with_senders(vec![1]));
    let mut cluster = Cluster::start_uniform(&members, Arc::clone(&layout) as Arc<dyn shardcast::SubgroupLayout>, &test_config());

    let payloads: Vec<Vec<u8>> = (0..5).map(|i| payload(b'v', i, 96)).collect();
    for p in &payloads {
        send_with_retry(cluster.group(1), 0, p, 0, 5000);
    }
    std::thread::sleep(pre_wedge_delay);

    // Node 2 crashes; the membership service wedges the survivor's group and
    // installs a new view containing node 1 alone.
    drop(cluster.nodes[1].group.take());
    let old = cluster.nodes[0].group.take().expect("survivor group");

    let delivered_before: Vec<Vec<u8>> = cluster.node(1).deliveries.lock()
        .iter()
        .map(|d| d.payload.clone())
        .collect();
    // Deliveries before the crash are a prefix of the send order.
    assert!(delivered_before.len() <= payloads.len());
    for (seen, sent) in delivered_before.iter().zip(&payloads) {
        assert_eq!(seen, sent);
    }

    let solo = [1u32];
    let table = SharedStateTable::new(SstLayout::derive(&solo, &*layout), 1);
    let sst = Arc::new(NodeSst::start(table, 0));
    let group = MulticastGroup::from_previous(
        View::new(1, solo.to_vec(), 1).expect("member view"),
        sst,
        old,
        &[],
    )
    .expect("handover");
    assert!(group.transport_groups_created());

    // Every message the old view had not delivered is re-attempted and
    // delivered in the new view; nothing is delivered twice.
    assert!(
        cluster.wait_for_deliveries(1, payloads.len(), 10_000),
        "redelivery incomplete: {} of {}",
        cluster.node(1).deliveries.lock().len(),
        payloads.len()
    );
    std::thread::sleep(Duration::from_millis(50));
    let seen: Vec<Vec<u8>> = cluster.node(1).deliveries.lock()
        .iter()
        .map(|d| d.payload.clone())
        .collect();
    assert_eq!(
        seen, payloads,
        "survivor must deliver every payload exactly once, in order"
    );
}

#[test]
fn test_handover_immediately_after_send() {
    crash_and_recover(Duration::ZERO);
}

#[test]
fn test_handover_mid_delivery() {
    crash_and_recover(Duration::from_millis(3));
}

#[test]
fn test_handover_after_quiescence_adds_nothing() {
    let members = [1u32, 2];
    let layout: Arc<FullMembershipLayout> =
        Arc::new(FullMembershipLayout::with_senders(vec![1]));
    let mut cluster = Cluster::start_uniform(&members, Arc::clone(&layout) as Arc<dyn shardcast::SubgroupLayout>, &test_config());

    let payloads: Vec<Vec<u8>> = (0..5).map(|i| payload(b'q', i, 64)).collect();
    for p in &payloads {
        send_with_retry(cluster.group(1), 0, p, 0, 5000);
    }
    assert!(cluster.wait_for_deliveries(1, 5, 5000));

    drop(cluster.nodes[1].group.take());
    let old = cluster.nodes[0].group.take().expect("survivor group");
    let solo = [1u32];
    let table = SharedStateTable::new(SstLayout::derive(&solo, &*layout), 1);
    let sst = Arc::new(NodeSst::start(table, 0));
    let group = MulticastGroup::from_previous(
        View::new(1, solo.to_vec(), 1).expect("member view"),
        sst,
        old,
        &[],
    )
    .expect("handover");

    // Nothing was pending, so nothing is redelivered.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(cluster.node(1).deliveries.lock().len(), 5);

    // The new view is fully functional and numbers its stream from zero.
    send_with_retry(&group, 0, &payload(b'q', 5, 64), 0, 5000);
    send_with_retry(&group, 0, &payload(b'q', 6, 64), 0, 5000);
    assert!(cluster.wait_for_deliveries(1, 7, 5000));
    let seen = cluster.node(1).deliveries.lock();
    assert_eq!(seen[5].index, 0);
    assert_eq!(seen[6].index, 1);
    assert_eq!(seen[5].payload, payload(b'q', 5, 64));
    assert_eq!(seen[6].payload, payload(b'q', 6, 64));
}

#[test]
fn test_wedge_stops_delivery_progress() {
    let members = [1u32, 2];
    let layout: Arc<FullMembershipLayout> =
        Arc::new(FullMembershipLayout::with_senders(vec![1]));
    let mut cluster = Cluster::start_uniform(&members, Arc::clone(&layout) as Arc<dyn shardcast::SubgroupLayout>, &test_config());

    send_with_retry(cluster.group(1), 0, &payload(b'x', 0, 32), 0, 5000);
    assert!(cluster.wait_for_deliveries(2, 1, 5000));

    let mut group = cluster.nodes[1].group.take().expect("node 2 group");
    group.wedge();
    assert!(group.is_wedged());
    group.wedge(); // idempotent under repeated calls
    assert!(group.is_wedged());

    // A wedged member stops receiving, and its frozen row blocks shard-wide
    // delivery progress until a new view is installed.
    send_with_retry(cluster.group(1), 0, &payload(b'x', 1, 32), 0, 5000);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(cluster.node(2).deliveries.lock().len(), 1);
    assert_eq!(cluster.node(1).deliveries.lock().len(), 1);
    assert!(wait_until(100, || cluster.table.delivered_num(0, 0) == 0));
}

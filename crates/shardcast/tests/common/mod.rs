// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process cluster harness: N multicast groups over one shared state
//! table and one loopback fabric, with recording callbacks per node.

#![allow(dead_code)] // each test binary uses a subset of the harness

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use shardcast::{
    CallbackSet, GroupConfig, LoopbackNetwork, MulticastGroup, NodeId, NodeSst, SharedStateTable,
    SstLayout, SubgroupLayout, View,
};

/// One recorded delivery or persistence notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subgroup: u32,
    pub sender_rank: u32,
    pub index: i64,
    pub payload: Vec<u8>,
}

/// Per-node build options.
#[derive(Clone)]
pub struct NodeSpec {
    pub config: GroupConfig,
    /// Artificial latency injected into the stability callback, to model a
    /// receiver that processes deliveries slowly.
    pub delivery_delay: Duration,
}

impl NodeSpec {
    pub fn with_config(config: GroupConfig) -> Self {
        Self {
            config,
            delivery_delay: Duration::ZERO,
        }
    }
}

pub struct Node {
    pub id: NodeId,
    pub rank: usize,
    pub group: Option<MulticastGroup>,
    pub deliveries: Arc<Mutex<Vec<Delivery>>>,
    pub persisted: Arc<Mutex<Vec<Delivery>>>,
    /// Interleaved ('s' = stability, 'p' = persistence) event tags keyed by
    /// message index, for ordering assertions.
    pub events: Arc<Mutex<Vec<(char, i64)>>>,
}

pub struct Cluster {
    pub table: Arc<SharedStateTable>,
    pub network: Arc<LoopbackNetwork>,
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// Build and start one group per member, all in view 0.
    pub fn start(
        members: &[NodeId],
        layout: Arc<dyn SubgroupLayout>,
        specs: Vec<NodeSpec>,
    ) -> Cluster {
        assert_eq!(members.len(), specs.len());
        let table = SharedStateTable::new(SstLayout::derive(members, &*layout), members.len());
        let network = LoopbackNetwork::new();

        let mut nodes = Vec::new();
        for (rank, (&id, spec)) in members.iter().zip(specs).enumerate() {
            let deliveries: Arc<Mutex<Vec<Delivery>>> = Arc::new(Mutex::new(Vec::new()));
            let persisted: Arc<Mutex<Vec<Delivery>>> = Arc::new(Mutex::new(Vec::new()));
            let events: Arc<Mutex<Vec<(char, i64)>>> = Arc::new(Mutex::new(Vec::new()));

            let deliveries_cb = Arc::clone(&deliveries);
            let events_cb = Arc::clone(&events);
            let delay = spec.delivery_delay;
            let mut callbacks =
                CallbackSet::new(Arc::new(move |subgroup, sender_rank, index, payload: &[u8]| {
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    events_cb.lock().push(('s', index));
                    deliveries_cb.lock().push(Delivery {
                        subgroup,
                        sender_rank,
                        index,
                        payload: payload.to_vec(),
                    });
                }));
            if spec.config.persistence_enabled() {
                let persisted_cb = Arc::clone(&persisted);
                let events_cb = Arc::clone(&events);
                callbacks = callbacks.with_persistence(Arc::new(
                    move |subgroup, sender_rank, index, payload: &[u8]| {
                        events_cb.lock().push(('p', index));
                        persisted_cb.lock().push(Delivery {
                            subgroup,
                            sender_rank,
                            index,
                            payload: payload.to_vec(),
                        });
                    },
                ));
            }

            let sst = Arc::new(NodeSst::start(Arc::clone(&table), rank));
            let group = MulticastGroup::new(
                View::new(0, members.to_vec(), id).expect("member view"),
                Arc::clone(&layout),
                sst,
                network.endpoint(id),
                callbacks,
                spec.config,
                &[],
            )
            .expect("group construction");

            nodes.push(Node {
                id,
                rank,
                group: Some(group),
                deliveries,
                persisted,
                events,
            });
        }

        Cluster {
            table,
            network,
            nodes,
        }
    }

    /// Same configuration for every node.
    pub fn start_uniform(
        members: &[NodeId],
        layout: Arc<dyn SubgroupLayout>,
        config: &GroupConfig,
    ) -> Cluster {
        let specs = members
            .iter()
            .map(|_| NodeSpec::with_config(config.clone()))
            .collect();
        Self::start(members, layout, specs)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .expect("node id present in cluster")
    }

    pub fn group(&self, id: NodeId) -> &MulticastGroup {
        self.node(id).group.as_ref().expect("group still installed")
    }

    /// Block until `id` has recorded `count` deliveries or `timeout_ms`
    /// elapses; returns whether the target was reached.
    pub fn wait_for_deliveries(&self, id: NodeId, count: usize, timeout_ms: u64) -> bool {
        let node = self.node(id);
        wait_until(timeout_ms, || node.deliveries.lock().len() >= count)
    }
}

/// Poll `cond` every millisecond up to `timeout_ms`.
pub fn wait_until(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Deterministic per-message payload: `len` bytes derived from (tag, i).
pub fn payload(tag: u8, i: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|b| tag.wrapping_mul(31).wrapping_add((i * 7 + b) as u8))
        .collect()
}

/// Stage, fill, and submit one message, retrying through back-pressure.
/// Panics if the group refuses it for the whole deadline.
pub fn send_with_retry(
    group: &MulticastGroup,
    subgroup: u32,
    payload: &[u8],
    pause_sending_turns: u32,
    timeout_ms: u64,
) {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Some(mut buf) = group.get_send_buffer(subgroup, payload.len(), pause_sending_turns, false)
        {
            buf.write(payload);
            assert!(group.send(subgroup), "send() after successful staging");
            return;
        }
        assert!(
            Instant::now() < deadline,
            "send_with_retry timed out on subgroup {}",
            subgroup
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

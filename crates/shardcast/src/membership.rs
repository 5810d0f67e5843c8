// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Membership inputs consumed at group construction.
//!
//! The membership service owns view installation; this module only defines
//! the snapshot a [`crate::group::MulticastGroup`] is built from and the
//! membership function that maps a view onto subgroups and shards.
//!
//! A shard distinguishes *members* (who receive, order, and deliver) from
//! *senders* (the subset whose streams interleave into the total order).
//! Sequence numbers are dealt round-robin over sender slots, so a member
//! that never sends must not occupy one.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Globally unique node identifier assigned by the membership service.
pub type NodeId = u32;

/// Index of a logical replication group within a view.
pub type SubgroupId = u32;

/// A membership snapshot. A new multicast group is constructed per view.
#[derive(Debug, Clone)]
pub struct View {
    /// View id, monotonically increasing across installations.
    pub vid: u32,
    /// Member node ids, in rank order. Rank doubles as the SST row index.
    pub members: Vec<NodeId>,
    /// This node's rank within `members`.
    pub my_rank: usize,
}

impl View {
    /// Build a view snapshot for `my_id`.
    ///
    /// Fails if `my_id` is not listed in `members`.
    pub fn new(vid: u32, members: Vec<NodeId>, my_id: NodeId) -> Result<Self> {
        let my_rank = members
            .iter()
            .position(|&m| m == my_id)
            .ok_or(Error::UnknownMember(my_id))?;
        Ok(Self {
            vid,
            members,
            my_rank,
        })
    }

    /// This node's id.
    #[must_use]
    pub fn my_id(&self) -> NodeId {
        self.members[self.my_rank]
    }

    /// Number of members (and SST rows) in the view.
    #[must_use]
    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Rank (SST row) of a member, if present.
    #[must_use]
    pub fn rank_of(&self, id: NodeId) -> Option<usize> {
        self.members.iter().position(|&m| m == id)
    }
}

/// The membership function: how a view decomposes into subgroups and shards.
///
/// Implementations must be deterministic in their arguments so that every
/// member of a view computes identical shard assignments, sender slots, and
/// transport-group numbering.
pub trait SubgroupLayout: Send + Sync {
    /// Number of subgroups this view supports.
    fn num_subgroups(&self, num_members: usize) -> u32;

    /// Number of shards within a subgroup.
    fn num_shards(&self, num_members: usize, subgroup: SubgroupId) -> u32;

    /// Members of one shard.
    fn shard_members(&self, members: &[NodeId], subgroup: SubgroupId, shard: u32) -> Vec<NodeId>;

    /// Members that send in this shard, in sender-slot order. Must be a
    /// subset of [`SubgroupLayout::shard_members`]. Defaults to every
    /// member sending.
    fn shard_senders(&self, members: &[NodeId], subgroup: SubgroupId, shard: u32) -> Vec<NodeId> {
        self.shard_members(members, subgroup, shard)
    }
}

/// Simplest layout: `subgroups` subgroups, each a single shard spanning the
/// whole view. Senders are every member, or a designated subset.
#[derive(Debug, Clone)]
pub struct FullMembershipLayout {
    /// Number of subgroups to expose.
    pub subgroups: u32,
    /// Designated senders; `None` means every member sends.
    pub senders: Option<Vec<NodeId>>,
}

impl FullMembershipLayout {
    /// One subgroup, one shard, everyone a sender.
    #[must_use]
    pub fn single() -> Self {
        Self {
            subgroups: 1,
            senders: None,
        }
    }

    /// One subgroup, one shard, only `senders` send (slot order as given).
    #[must_use]
    pub fn with_senders(senders: Vec<NodeId>) -> Self {
        Self {
            subgroups: 1,
            senders: Some(senders),
        }
    }
}

impl SubgroupLayout for FullMembershipLayout {
    fn num_subgroups(&self, _num_members: usize) -> u32 {
        self.subgroups
    }

    fn num_shards(&self, _num_members: usize, _subgroup: SubgroupId) -> u32 {
        1
    }

    fn shard_members(&self, members: &[NodeId], _subgroup: SubgroupId, _shard: u32) -> Vec<NodeId> {
        members.to_vec()
    }

    fn shard_senders(&self, members: &[NodeId], _subgroup: SubgroupId, _shard: u32) -> Vec<NodeId> {
        match &self.senders {
            Some(senders) => senders.clone(),
            None => members.to_vec(),
        }
    }
}

/// This node's binding to one shard it belongs to, fixed for a view's life.
#[derive(Debug, Clone)]
pub struct SubgroupBinding {
    /// Subgroup this binding is for.
    pub subgroup: SubgroupId,
    /// Shard number within the subgroup.
    pub shard: u32,
    /// Shard members.
    pub shard_members: Vec<NodeId>,
    /// SST row index of each shard member, parallel to `shard_members`.
    pub shard_rows: Vec<usize>,
    /// Shard senders, in sender-slot order.
    pub senders: Vec<NodeId>,
    /// This node's sender slot, `None` when it only receives.
    pub sender_slot: Option<u32>,
    /// First `num_received` slot of this subgroup in the SST row.
    pub slot_base: usize,
    /// Flat index of this shard's first sender slot across the whole view;
    /// transport group ids are `view_offset + slot_flat_base + sender_slot`.
    pub slot_flat_base: u32,
}

impl SubgroupBinding {
    /// Number of senders `S` whose streams interleave into the total order.
    #[must_use]
    pub fn num_senders(&self) -> usize {
        self.senders.len()
    }

    /// SST `num_received` slot of this node's own sender stream, when it
    /// has one.
    #[must_use]
    pub fn my_slot(&self) -> Option<usize> {
        self.sender_slot.map(|slot| self.slot_base + slot as usize)
    }
}

/// Everything the view and membership function determine about this node:
/// its shard bindings plus the geometry shared by all members.
#[derive(Debug, Clone)]
pub struct ViewGeometry {
    /// Total subgroup count in the view.
    pub num_subgroups: u32,
    /// Width of the SST `num_received` segment: the sum over subgroups of
    /// the largest sender count of any shard.
    pub receive_slots: usize,
    /// Total sender-slot count across every (subgroup, shard) of the view.
    /// The next view's transport-group offset advances by this much, so
    /// group ids never collide across views.
    pub total_slots: u32,
    /// Bindings for the shards this node belongs to, keyed by subgroup.
    pub bindings: BTreeMap<SubgroupId, SubgroupBinding>,
}

impl ViewGeometry {
    /// Compute the geometry of `view` under `layout`.
    ///
    /// Every member runs the same computation and arrives at the same slot
    /// bases and flat numbering; only `bindings` differs per node. Fails
    /// when a shard names a node outside the view or a sender outside its
    /// shard.
    pub fn compute(view: &View, layout: &dyn SubgroupLayout) -> Result<Self> {
        let n = view.num_members();
        let num_subgroups = layout.num_subgroups(n);
        let mut bindings = BTreeMap::new();
        let mut slot_base = 0usize;
        let mut flat = 0u32;

        for subgroup in 0..num_subgroups {
            let mut max_senders = 0usize;
            for shard in 0..layout.num_shards(n, subgroup) {
                let shard_members = layout.shard_members(&view.members, subgroup, shard);
                let senders = layout.shard_senders(&view.members, subgroup, shard);
                for &s in &senders {
                    if !shard_members.contains(&s) {
                        return Err(Error::UnknownMember(s));
                    }
                }
                max_senders = max_senders.max(senders.len());

                if shard_members.contains(&view.my_id()) {
                    let mut shard_rows = Vec::with_capacity(shard_members.len());
                    for &m in &shard_members {
                        shard_rows.push(view.rank_of(m).ok_or(Error::UnknownMember(m))?);
                    }
                    let sender_slot = senders
                        .iter()
                        .position(|&s| s == view.my_id())
                        .map(|slot| slot as u32);
                    bindings.insert(
                        subgroup,
                        SubgroupBinding {
                            subgroup,
                            shard,
                            shard_members: shard_members.clone(),
                            shard_rows,
                            senders: senders.clone(),
                            sender_slot,
                            slot_base,
                            slot_flat_base: flat,
                        },
                    );
                }
                flat += senders.len() as u32;
            }
            slot_base += max_senders;
        }

        Ok(Self {
            num_subgroups,
            receive_slots: slot_base,
            total_slots: flat,
            bindings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_requires_self_membership() {
        assert!(View::new(0, vec![1, 2, 3], 9).is_err());
        let view = View::new(0, vec![1, 2, 3], 2).expect("member view");
        assert_eq!(view.my_rank, 1);
        assert_eq!(view.my_id(), 2);
        assert_eq!(view.rank_of(3), Some(2));
        assert_eq!(view.rank_of(7), None);
    }

    #[test]
    fn test_full_membership_geometry() {
        let view = View::new(1, vec![10, 20, 30], 20).expect("member view");
        let layout = FullMembershipLayout {
            subgroups: 2,
            senders: None,
        };
        let geo = ViewGeometry::compute(&view, &layout).expect("geometry");

        assert_eq!(geo.num_subgroups, 2);
        // Two subgroups, each one shard of 3 senders.
        assert_eq!(geo.receive_slots, 6);
        assert_eq!(geo.total_slots, 6);
        assert_eq!(geo.bindings.len(), 2);

        let b0 = &geo.bindings[&0];
        assert_eq!(b0.sender_slot, Some(1));
        assert_eq!(b0.num_senders(), 3);
        assert_eq!(b0.slot_base, 0);
        assert_eq!(b0.slot_flat_base, 0);
        assert_eq!(b0.my_slot(), Some(1));
        assert_eq!(b0.shard_rows, vec![0, 1, 2]);

        let b1 = &geo.bindings[&1];
        assert_eq!(b1.slot_base, 3);
        assert_eq!(b1.slot_flat_base, 3);
        assert_eq!(b1.my_slot(), Some(4));
    }

    #[test]
    fn test_designated_sender_geometry() {
        let members = vec![10, 20, 30];
        let layout = FullMembershipLayout::with_senders(vec![10]);

        // The sender's view.
        let view = View::new(0, members.clone(), 10).expect("member view");
        let geo = ViewGeometry::compute(&view, &layout).expect("geometry");
        assert_eq!(geo.receive_slots, 1);
        assert_eq!(geo.total_slots, 1);
        let b = &geo.bindings[&0];
        assert_eq!(b.num_senders(), 1);
        assert_eq!(b.sender_slot, Some(0));
        assert_eq!(b.shard_members.len(), 3);

        // A receive-only member still binds, without a sender slot.
        let view = View::new(0, members, 30).expect("member view");
        let geo = ViewGeometry::compute(&view, &layout).expect("geometry");
        let b = &geo.bindings[&0];
        assert_eq!(b.sender_slot, None);
        assert_eq!(b.my_slot(), None);
        assert_eq!(b.shard_rows, vec![0, 1, 2]);
    }

    #[test]
    fn test_sender_outside_shard_rejected() {
        let view = View::new(0, vec![1, 2], 1).expect("member view");
        let layout = FullMembershipLayout::with_senders(vec![9]);
        assert!(matches!(
            ViewGeometry::compute(&view, &layout),
            Err(Error::UnknownMember(9))
        ));
    }

    #[test]
    fn test_geometry_identical_across_members() {
        let layout = FullMembershipLayout::single();
        let members = vec![5, 6, 7, 8];
        let geos: Vec<_> = members
            .iter()
            .map(|&id| {
                let view = View::new(3, members.clone(), id).expect("member view");
                ViewGeometry::compute(&view, &layout).expect("geometry")
            })
            .collect();

        for geo in &geos {
            assert_eq!(geo.receive_slots, geos[0].receive_slots);
            assert_eq!(geo.total_slots, geos[0].total_slots);
            assert_eq!(
                geo.bindings[&0].slot_flat_base,
                geos[0].bindings[&0].slot_flat_base
            );
        }
        // Slots differ per node, bases do not.
        assert_eq!(geos[2].bindings[&0].sender_slot, Some(2));
    }
}

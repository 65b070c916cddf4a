//! The view model: an immutable-per-epoch description of group membership,
//! its partition into subgroups and shards, and the handles to the state
//! table and multicast bound to the epoch.

pub mod wire;

use {
	crate::{multicast::Multicast, sst::StateTable},
	derive_more::Display,
	serde::{Deserialize, Serialize},
	std::{collections::BTreeMap, sync::Arc},
};

/// Globally unique identifier of a node within a group incarnation.
#[derive(
	Debug,
	Display,
	Clone,
	Copy,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
)]
pub struct NodeId(pub u32);

/// Dense identifier assigned to a subgroup by the allocator, stable within
/// a view.
pub type SubgroupId = u32;

/// Delivery mode of a shard's multicast traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
	/// Totally ordered delivery with a persistence barrier at epoch
	/// termination.
	Ordered,
	/// Unordered delivery; excluded from the persistence barrier.
	Unordered,
}

/// The slice of a view that one shard of one subgroup sees: its members,
/// which of them send, and the membership deltas against the previous
/// epoch's same shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubView {
	pub members: Vec<NodeId>,
	pub is_sender: Vec<bool>,
	pub mode: Mode,
	/// This node's rank within the shard, `None` when it is not a member.
	pub my_rank: Option<usize>,
	pub joined: Vec<NodeId>,
	pub departed: Vec<NodeId>,
}

impl SubView {
	pub fn new(members: Vec<NodeId>, is_sender: Vec<bool>, mode: Mode) -> Self {
		debug_assert_eq!(members.len(), is_sender.len());
		Self {
			members,
			is_sender,
			mode,
			my_rank: None,
			joined: Vec::new(),
			departed: Vec::new(),
		}
	}

	/// A shard in which every member sends.
	pub fn all_senders(members: Vec<NodeId>, mode: Mode) -> Self {
		let is_sender = vec![true; members.len()];
		Self::new(members, is_sender, mode)
	}

	pub fn rank_of(&self, node: NodeId) -> Option<usize> {
		self.members.iter().position(|m| *m == node)
	}

	pub fn num_senders(&self) -> usize {
		self.is_sender.iter().filter(|s| **s).count()
	}

	/// The index of `rank` among the shard's senders, `None` when that
	/// member does not send.
	pub fn sender_rank_of(&self, rank: usize) -> Option<usize> {
		if !self.is_sender.get(rank).copied().unwrap_or(false) {
			return None;
		}
		Some(self.is_sender[..rank].iter().filter(|s| **s).count())
	}
}

/// The membership snapshot installed atomically across the group for one
/// epoch. Everything is fixed at install time except `failed`/`num_failed`
/// (updated as suspicions harden) and the bound state-table and multicast
/// handles (attached on install, released on retirement).
pub struct View {
	pub vid: u32,
	/// Ordered members; the index of a node is its rank.
	pub members: Vec<NodeId>,
	/// Member addresses, indexed by rank.
	pub member_ips: Vec<String>,
	/// Failure flags, indexed by rank.
	pub failed: Vec<bool>,
	pub num_failed: usize,
	/// Nodes present here but not in the previous view.
	pub joined: Vec<NodeId>,
	/// Nodes present in the previous view but not here.
	pub departed: Vec<NodeId>,
	pub my_rank: Option<usize>,
	pub num_members: usize,
	/// Subgroup ids grouped by the allocator entry that produced them, in
	/// allocation order.
	pub subgroup_ids_by_type: BTreeMap<String, Vec<SubgroupId>>,
	/// `subgroup_shard_views[subgroup_id][shard]`.
	pub subgroup_shard_views: Vec<Vec<SubView>>,
	/// Subgroup id to shard index, for the shards this node belongs to.
	pub my_subgroups: BTreeMap<SubgroupId, usize>,
	/// Watermark used by allocators that assign members in rank order.
	pub next_unassigned_rank: i32,
	pub is_adequately_provisioned: bool,
	/// Sticky leadership flag surviving view changes and recoveries.
	pub i_know_i_am_leader: bool,
	/// State table bound to this epoch; attached on install.
	pub sst: Option<Arc<StateTable>>,
	/// Multicast datapath bound to this epoch; attached on install, taken
	/// when its sender state moves to the next epoch's instance.
	pub multicast: Option<Arc<dyn Multicast>>,
}

impl View {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		vid: u32,
		members: Vec<NodeId>,
		member_ips: Vec<String>,
		failed: Vec<bool>,
		joined: Vec<NodeId>,
		departed: Vec<NodeId>,
		my_rank: Option<usize>,
		next_unassigned_rank: i32,
	) -> Self {
		debug_assert_eq!(members.len(), member_ips.len());
		debug_assert_eq!(members.len(), failed.len());
		debug_assert!(
			joined.iter().all(|j| !departed.contains(j)),
			"a node cannot both join and depart in the same view"
		);
		debug_assert!(
			members
				.iter()
				.enumerate()
				.all(|(i, m)| !members[..i].contains(m)),
			"duplicate node id in member vector"
		);
		let num_members = members.len();
		let num_failed = failed.iter().filter(|f| **f).count();
		Self {
			vid,
			members,
			member_ips,
			failed,
			num_failed,
			joined,
			departed,
			my_rank,
			num_members,
			subgroup_ids_by_type: BTreeMap::new(),
			subgroup_shard_views: Vec::new(),
			my_subgroups: BTreeMap::new(),
			next_unassigned_rank,
			is_adequately_provisioned: false,
			i_know_i_am_leader: false,
			sst: None,
			multicast: None,
		}
	}

	/// The degenerate first view of a group started fresh: this node alone.
	pub fn initial(my_id: NodeId, my_ip: String) -> Self {
		let mut view = Self::new(
			0,
			vec![my_id],
			vec![my_ip],
			vec![false],
			Vec::new(),
			Vec::new(),
			Some(0),
			0,
		);
		view.i_know_i_am_leader = true;
		view
	}

	pub fn rank_of(&self, node: NodeId) -> Option<usize> {
		self.members.iter().position(|m| *m == node)
	}

	pub fn my_id(&self) -> NodeId {
		self.members[self.my_rank.expect("view installed without a local rank")]
	}

	/// The rank of the current leader: the lowest-ranked member that has
	/// not failed.
	pub fn rank_of_leader(&self) -> usize {
		self
			.failed
			.iter()
			.position(|f| !*f)
			.expect("every member of the view has failed")
	}

	pub fn leader_id(&self) -> NodeId {
		self.members[self.rank_of_leader()]
	}

	pub fn i_am_leader(&self) -> bool {
		self.my_rank == Some(self.rank_of_leader())
	}

	/// True exactly once: when this node has just become leader through
	/// failures of every lower-ranked member. Sets the sticky flag so
	/// subsequent views (and recoveries) do not re-trigger new-leader work.
	pub fn i_am_new_leader(&mut self) -> bool {
		if self.i_know_i_am_leader || !self.i_am_leader() {
			return false;
		}
		self.i_know_i_am_leader = true;
		true
	}

	/// Marks a member failed, keeping `num_failed` consistent.
	pub fn mark_failed(&mut self, rank: usize) {
		if !self.failed[rank] {
			self.failed[rank] = true;
			self.num_failed += 1;
		}
	}

	/// The rank (within the whole view) of a shard's leader: the
	/// lowest-ranked shard member that has not failed. `None` when the
	/// entire shard has failed.
	pub fn rank_of_shard_leader(
		&self,
		subgroup_id: SubgroupId,
		shard: usize,
	) -> Option<usize> {
		let shard_view = &self.subgroup_shard_views[subgroup_id as usize][shard];
		shard_view
			.members
			.iter()
			.filter_map(|m| self.rank_of(*m))
			.find(|rank| !self.failed[*rank])
	}

	/// The rank *within the shard* of the shard's leader.
	pub fn subview_rank_of_shard_leader(
		&self,
		subgroup_id: SubgroupId,
		shard: usize,
	) -> Option<usize> {
		let shard_view = &self.subgroup_shard_views[subgroup_id as usize][shard];
		shard_view.members.iter().position(|m| {
			self
				.rank_of(*m)
				.map(|rank| !self.failed[rank])
				.unwrap_or(false)
		})
	}

	/// Wedges this epoch: the multicast stops accepting sends and receives
	/// and the local wedged flag is published to the group.
	pub fn wedge(&self) {
		if let Some(multicast) = &self.multicast {
			multicast.wedge();
		}
		if let Some(sst) = &self.sst {
			sst.set_wedged_local(true);
			sst.publish_wedged();
		}
	}

	/// Capacity of the pending-changes ring in this view's state table.
	pub fn changes_capacity(&self, slack: usize) -> usize {
		self.num_members + slack
	}
}

impl core::fmt::Debug for View {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("View")
			.field("vid", &self.vid)
			.field("members", &self.members)
			.field("failed", &self.failed)
			.field("joined", &self.joined)
			.field("departed", &self.departed)
			.field("my_rank", &self.my_rank)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ids(raw: &[u32]) -> Vec<NodeId> {
		raw.iter().copied().map(NodeId).collect()
	}

	fn view(members: &[u32], failed: &[bool], my_rank: usize) -> View {
		let ips = members.iter().map(|m| format!("10.0.0.{m}")).collect();
		View::new(
			1,
			ids(members),
			ips,
			failed.to_vec(),
			Vec::new(),
			Vec::new(),
			Some(my_rank),
			0,
		)
	}

	#[test]
	fn leader_is_lowest_unfailed_rank() {
		let v = view(&[1, 2, 3], &[false, false, false], 0);
		assert_eq!(v.rank_of_leader(), 0);
		assert!(v.i_am_leader());

		let v = view(&[1, 2, 3], &[true, false, false], 1);
		assert_eq!(v.rank_of_leader(), 1);
		assert_eq!(v.leader_id(), NodeId(2));
	}

	#[test]
	fn new_leader_flag_fires_once() {
		let mut v = view(&[1, 2], &[true, false], 1);
		assert!(v.i_am_new_leader());
		assert!(!v.i_am_new_leader());
	}

	#[test]
	fn mark_failed_tracks_count() {
		let mut v = view(&[1, 2, 3], &[false, false, false], 0);
		v.mark_failed(2);
		v.mark_failed(2);
		assert_eq!(v.num_failed, 1);
		assert!(v.failed[2]);
	}

	#[test]
	fn sender_ranks_skip_non_senders() {
		let sub = SubView::new(
			ids(&[1, 2, 3]),
			vec![true, false, true],
			Mode::Ordered,
		);
		assert_eq!(sub.num_senders(), 2);
		assert_eq!(sub.sender_rank_of(0), Some(0));
		assert_eq!(sub.sender_rank_of(1), None);
		assert_eq!(sub.sender_rank_of(2), Some(1));
	}

	#[test]
	fn shard_leader_skips_failed_members() {
		let mut v = view(&[1, 2, 3], &[false, false, false], 0);
		v.subgroup_shard_views =
			vec![vec![SubView::all_senders(ids(&[2, 3]), Mode::Ordered)]];
		assert_eq!(v.rank_of_shard_leader(0, 0), Some(1));
		assert_eq!(v.subview_rank_of_shard_leader(0, 0), Some(0));

		v.mark_failed(1);
		assert_eq!(v.rank_of_shard_leader(0, 0), Some(2));
		assert_eq!(v.subview_rank_of_shard_leader(0, 0), Some(1));
	}
}

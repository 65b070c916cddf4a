//! The multicast datapath as seen by the membership core.
//!
//! The core never looks inside the datapath; it only wedges it at epoch
//! termination, pumps its in-flight messages into the shared-table
//! counters, and directs the final in-order delivery agreed by the
//! ragged-edge cleanup. Everything else about how messages move is the
//! datapath's business, reached through [`Multicast`].

pub mod window;

pub use window::WindowMulticast;

use {
	crate::view::{Mode, NodeId, SubgroupId},
	std::collections::BTreeMap,
};

/// Per-shard datapath settings derived from the view layout for every
/// shard this node belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgroupSettings {
	pub shard_num: usize,
	/// This node's rank within the shard.
	pub shard_rank: usize,
	pub members: Vec<NodeId>,
	pub is_sender: Vec<bool>,
	/// This node's index among the shard's senders, `None` for receivers.
	pub sender_rank: Option<usize>,
	/// First slot of this subgroup's per-sender counters in the
	/// `num_received`/`global_min` arrays.
	pub num_received_offset: usize,
	pub mode: Mode,
}

impl SubgroupSettings {
	pub fn num_senders(&self) -> usize {
		self.is_sender.iter().filter(|s| **s).count()
	}
}

/// The datapath surface the membership core consumes.
pub trait Multicast: Send + Sync {
	/// Enters the terminal wedged state: no new sends or receives.
	fn wedge(&self);

	fn is_wedged(&self) -> bool;

	/// Accepts a payload for multicast in `subgroup`. Returns `false`
	/// without accepting while wedged; the caller retries after the next
	/// view installs.
	fn send(&self, subgroup: SubgroupId, payload: &[u8]) -> bool;

	/// True while sends accepted before the wedge are still draining into
	/// the shared table.
	fn check_pending_sst_sends(&self, subgroup: SubgroupId) -> bool;

	/// Runs one pump iteration folding in-flight datapath messages into
	/// the `num_received` counters. Returns `true` while there is more to
	/// fold.
	fn flush_in_flight(&self, subgroup: SubgroupId) -> bool;

	/// Delivers every undelivered message `s@i` with
	/// `i <= max_received_by_sender[s]`, sender-major by index, then
	/// discards the remainder of the epoch's traffic.
	fn deliver_messages_upto(
		&self,
		max_received_by_sender: &[i32],
		subgroup: SubgroupId,
		num_senders: usize,
	);

	/// The version of the latest message stable at every live shard
	/// member.
	fn compute_global_stability_frontier(&self, subgroup: SubgroupId) -> u64;

	/// The shard settings this instance was built from.
	fn settings(&self) -> &BTreeMap<SubgroupId, SubgroupSettings>;
}

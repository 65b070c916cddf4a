//! The replication transport beneath the state table.
//!
//! A [`Fabric`] stands in for the one-sided RDMA layer: it owns the row
//! mirrors of every attached member and moves published byte ranges of a
//! member's local row into its peers' mirrors. The table never sees how the
//! bytes travel; the in-process [`memory::Hub`](super::memory::Hub) is the
//! stock implementation and a verbs-backed one would slot behind the same
//! trait.
//!
//! Sessions are keyed by view id: during a view change the old and new
//! tables coexist on the same fabric, which is what lets the new epoch
//! handshake while peers may still read the old region.

use {
	crate::view::NodeId,
	core::{ops::Range, time::Duration},
	std::{io, sync::Arc},
};

/// One attachment of one member to one epoch's shared table.
pub trait FabricSession: Send + Sync + 'static {
	fn my_rank(&self) -> usize;

	fn num_rows(&self) -> usize;

	/// Copies `buf.len()` bytes of row `rank` starting at `offset` into
	/// `buf`. Rows other than the local one are read-only mirrors.
	fn read(&self, rank: usize, offset: usize, buf: &mut [u8]);

	/// Writes into the local row only. Peers do not observe the write until
	/// a publish covers its range.
	fn write_local(&self, offset: usize, bytes: &[u8]);

	/// Pushes a byte range of the local row to every live peer.
	fn publish(&self, range: Range<usize>);

	/// Like [`publish`](Self::publish), but returns only once every live
	/// peer has acknowledged the write.
	fn publish_acked(&self, range: Range<usize>);

	/// Barrier over all members that are attached and not frozen from this
	/// member's perspective.
	fn barrier(&self);

	/// Silences subsequent updates from `rank`: its mirror keeps its last
	/// contents and the barrier stops counting it.
	fn freeze(&self, rank: usize);

	fn is_frozen(&self, rank: usize) -> bool;

	/// Monotonic counter bumped on every local write and every incoming
	/// remote update.
	fn update_version(&self) -> u64;

	/// Blocks until the update version exceeds `last_seen` or `timeout`
	/// elapses; returns the current version either way.
	fn wait_for_update(&self, last_seen: u64, timeout: Duration) -> u64;

	/// Detaches this member from the session. Peers stop receiving its
	/// publishes and stop waiting for it in barriers.
	fn detach(&self);
}

/// Factory for sessions plus the connection bookkeeping the install path
/// drives (new members are added in rank order before the new epoch's
/// table is created).
pub trait Fabric: Send + Sync + 'static {
	/// Attaches `my_id` to the session of view `vid`, creating it on first
	/// attach. `members` and `row_len` must be identical across attaching
	/// members.
	fn attach(
		&self,
		vid: u32,
		members: &[NodeId],
		my_id: NodeId,
		row_len: usize,
	) -> io::Result<Arc<dyn FabricSession>>;

	/// Registers the address of a node about to participate in a new
	/// session.
	fn add_node(&self, node: NodeId, addr: &str);
}

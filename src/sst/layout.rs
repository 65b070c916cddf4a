//! Fixed-offset layout of one state-table row.
//!
//! A row is a plain byte record; every field lives at an offset computed
//! from the group dimensions, exactly like the pinned RDMA buffer it stands
//! in for. All multi-byte fields are little-endian. Field order matters:
//! the change-proposal fields (`changes` through `num_installed`) are
//! contiguous so a proposal acknowledgement can publish them as one range.

use core::ops::Range;

/// The dimensions a row layout is computed from. Every member of a view
/// must derive identical dimensions or the remote writes would land on the
/// wrong offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
	pub num_members: usize,
	/// Capacity of the pending-changes ring.
	pub changes_capacity: usize,
	pub num_subgroups: usize,
	/// Total per-sender counter slots across all subgroups.
	pub num_received_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLayout {
	dims: Dimensions,
	suspected: usize,
	wedged: usize,
	changes: usize,
	joiner_ips: usize,
	num_changes: usize,
	num_committed: usize,
	num_acked: usize,
	num_installed: usize,
	num_received: usize,
	global_min: usize,
	global_min_ready: usize,
	delivered_num: usize,
	persisted_num: usize,
	vid: usize,
	row_len: usize,
}

impl RowLayout {
	pub fn new(dims: Dimensions) -> Self {
		let suspected = 0;
		let wedged = suspected + dims.num_members;
		let changes = wedged + 1;
		let joiner_ips = changes + dims.changes_capacity * 4;
		let num_changes = joiner_ips + dims.changes_capacity * 4;
		let num_committed = num_changes + 4;
		let num_acked = num_committed + 4;
		let num_installed = num_acked + 4;
		let num_received = num_installed + 4;
		let global_min = num_received + dims.num_received_size * 4;
		let global_min_ready = global_min + dims.num_received_size * 4;
		let delivered_num = global_min_ready + dims.num_subgroups;
		let persisted_num = delivered_num + dims.num_subgroups * 4;
		let vid = persisted_num + dims.num_subgroups * 8;
		let row_len = vid + 4;
		Self {
			dims,
			suspected,
			wedged,
			changes,
			joiner_ips,
			num_changes,
			num_committed,
			num_acked,
			num_installed,
			num_received,
			global_min,
			global_min_ready,
			delivered_num,
			persisted_num,
			vid,
			row_len,
		}
	}

	pub const fn dims(&self) -> &Dimensions {
		&self.dims
	}

	pub const fn row_len(&self) -> usize {
		self.row_len
	}

	pub fn suspected_at(&self, who: usize) -> usize {
		debug_assert!(who < self.dims.num_members);
		self.suspected + who
	}

	pub fn suspected_range(&self) -> Range<usize> {
		self.suspected..self.suspected + self.dims.num_members
	}

	pub const fn wedged_at(&self) -> usize {
		self.wedged
	}

	pub fn change_at(&self, index: usize) -> usize {
		debug_assert!(index < self.dims.changes_capacity);
		self.changes + index * 4
	}

	pub fn joiner_ip_at(&self, index: usize) -> usize {
		debug_assert!(index < self.dims.changes_capacity);
		self.joiner_ips + index * 4
	}

	pub const fn num_changes_at(&self) -> usize {
		self.num_changes
	}

	pub const fn num_committed_at(&self) -> usize {
		self.num_committed
	}

	pub const fn num_acked_at(&self) -> usize {
		self.num_acked
	}

	pub const fn num_installed_at(&self) -> usize {
		self.num_installed
	}

	/// The whole change-proposal block: the ring, the joiner addresses and
	/// the four counters. Published as one range when echoing a proposal.
	pub fn changes_block(&self) -> Range<usize> {
		self.changes..self.num_received
	}

	pub fn num_received_at(&self, slot: usize) -> usize {
		debug_assert!(slot < self.dims.num_received_size);
		self.num_received + slot * 4
	}

	pub fn num_received_range(&self, offset: usize, count: usize) -> Range<usize> {
		self.num_received_at(offset)..self.num_received + (offset + count) * 4
	}

	pub fn global_min_at(&self, slot: usize) -> usize {
		debug_assert!(slot < self.dims.num_received_size);
		self.global_min + slot * 4
	}

	pub fn global_min_range(&self, offset: usize, count: usize) -> Range<usize> {
		self.global_min_at(offset)..self.global_min + (offset + count) * 4
	}

	pub fn global_min_ready_at(&self, subgroup: usize) -> usize {
		debug_assert!(subgroup < self.dims.num_subgroups);
		self.global_min_ready + subgroup
	}

	pub fn delivered_num_at(&self, subgroup: usize) -> usize {
		debug_assert!(subgroup < self.dims.num_subgroups);
		self.delivered_num + subgroup * 4
	}

	pub fn persisted_num_at(&self, subgroup: usize) -> usize {
		debug_assert!(subgroup < self.dims.num_subgroups);
		self.persisted_num + subgroup * 8
	}

	pub const fn vid_at(&self) -> usize {
		self.vid
	}

	pub fn whole_row(&self) -> Range<usize> {
		0..self.row_len
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fields_are_disjoint_and_cover_the_row() {
		let layout = RowLayout::new(Dimensions {
			num_members: 3,
			changes_capacity: 5,
			num_subgroups: 2,
			num_received_size: 4,
		});
		// suspected (3) + wedged (1) + changes (20) + joiner_ips (20)
		// + counters (16) + num_received (16) + global_min (16)
		// + global_min_ready (2) + delivered (8) + persisted (16) + vid (4)
		assert_eq!(layout.row_len(), 3 + 1 + 20 + 20 + 16 + 16 + 16 + 2 + 8 + 16 + 4);
		assert_eq!(layout.suspected_at(0), 0);
		assert_eq!(layout.wedged_at(), 3);
		assert_eq!(layout.change_at(0), 4);
		assert_eq!(layout.changes_block(),  4..4 + 20 + 20 + 16);
		assert_eq!(layout.vid_at(), layout.row_len() - 4);
	}

	#[test]
	fn ranges_scale_with_offsets() {
		let layout = RowLayout::new(Dimensions {
			num_members: 2,
			changes_capacity: 2,
			num_subgroups: 1,
			num_received_size: 3,
		});
		let range = layout.num_received_range(1, 2);
		assert_eq!(range.len(), 8);
		assert_eq!(range.start, layout.num_received_at(1));
	}
}

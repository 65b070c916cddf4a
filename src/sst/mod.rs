//! The shared state table (SST): one row per group member, replicated by a
//! fabric, with a typed façade over the fixed-offset row layout and the
//! predicate engine that reacts to remote updates.
//!
//! Only the local row is writable; everything else is a read-only mirror
//! that peers advance through one-sided publishes. Writes become visible to
//! peers only when an explicit publish covers their byte range, so every
//! protocol counter is treated as an independent monotonic signal, never as
//! part of an atomically-updated compound.

pub mod fabric;
pub mod layout;
pub mod memory;
pub mod predicates;

pub use {
	fabric::{Fabric, FabricSession},
	layout::{Dimensions, RowLayout},
	predicates::{Handle, Kind, Predicates},
};

use {
	crate::view::NodeId,
	core::time::Duration,
	parking_lot::Mutex,
	std::{
		io,
		sync::{
			Arc,
			atomic::{AtomicBool, Ordering},
		},
		thread::{self, JoinHandle},
	},
};

/// Typed view over the replicated rows of one epoch.
pub struct StateTable {
	layout: RowLayout,
	members: Vec<NodeId>,
	my_rank: usize,
	session: Arc<dyn FabricSession>,
	/// The predicate registry scanned by the evaluation thread.
	pub predicates: Predicates,
	poll: Duration,
	shutdown: Arc<AtomicBool>,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl StateTable {
	/// Attaches to the fabric session of view `vid` and initializes the
	/// local row to its sentinel state (no messages received, nothing
	/// delivered, all counters zero).
	pub fn new(
		fabric: &dyn Fabric,
		vid: u32,
		members: Vec<NodeId>,
		my_id: NodeId,
		dims: Dimensions,
		poll: Duration,
	) -> io::Result<Arc<Self>> {
		debug_assert_eq!(dims.num_members, members.len());
		let layout = RowLayout::new(dims);
		let session = fabric.attach(vid, &members, my_id, layout.row_len())?;
		let my_rank = session.my_rank();
		let table = Self {
			layout,
			members,
			my_rank,
			session,
			predicates: Predicates::default(),
			poll,
			shutdown: Arc::new(AtomicBool::new(false)),
			worker: Mutex::new(None),
		};
		for slot in 0..dims.num_received_size {
			table.set_num_received_local(slot, -1);
			table.set_global_min_local(slot, -1);
		}
		for subgroup in 0..dims.num_subgroups {
			table.set_delivered_num_local(subgroup, -1);
		}
		Ok(Arc::new(table))
	}

	pub const fn layout(&self) -> &RowLayout {
		&self.layout
	}

	pub fn members(&self) -> &[NodeId] {
		&self.members
	}

	pub const fn my_rank(&self) -> usize {
		self.my_rank
	}

	pub fn num_rows(&self) -> usize {
		self.members.len()
	}

	/// Silences updates from a suspected member's row.
	pub fn freeze(&self, rank: usize) {
		self.session.freeze(rank);
	}

	pub fn is_frozen(&self, rank: usize) -> bool {
		self.session.is_frozen(rank)
	}

	/// Barrier over all attached, non-frozen members.
	pub fn sync_with_members(&self) {
		self.session.barrier();
	}
}

/// Raw cell access
impl StateTable {
	fn read_u8(&self, rank: usize, offset: usize) -> u8 {
		let mut buf = [0u8; 1];
		self.session.read(rank, offset, &mut buf);
		buf[0]
	}

	fn read_u32(&self, rank: usize, offset: usize) -> u32 {
		let mut buf = [0u8; 4];
		self.session.read(rank, offset, &mut buf);
		u32::from_le_bytes(buf)
	}

	fn read_i32(&self, rank: usize, offset: usize) -> i32 {
		let mut buf = [0u8; 4];
		self.session.read(rank, offset, &mut buf);
		i32::from_le_bytes(buf)
	}

	fn read_u64(&self, rank: usize, offset: usize) -> u64 {
		let mut buf = [0u8; 8];
		self.session.read(rank, offset, &mut buf);
		u64::from_le_bytes(buf)
	}

	fn write_u8(&self, offset: usize, value: u8) {
		self.session.write_local(offset, &[value]);
	}

	fn write_u32(&self, offset: usize, value: u32) {
		self.session.write_local(offset, &value.to_le_bytes());
	}

	fn write_i32(&self, offset: usize, value: i32) {
		self.session.write_local(offset, &value.to_le_bytes());
	}

	fn write_u64(&self, offset: usize, value: u64) {
		self.session.write_local(offset, &value.to_le_bytes());
	}
}

/// Typed accessors. Getters take a row rank; setters write the local row.
impl StateTable {
	pub fn suspected(&self, rank: usize, who: usize) -> bool {
		self.read_u8(rank, self.layout.suspected_at(who)) != 0
	}

	pub fn set_suspected_local(&self, who: usize, value: bool) {
		self.write_u8(self.layout.suspected_at(who), value as u8);
	}

	pub fn wedged(&self, rank: usize) -> bool {
		self.read_u8(rank, self.layout.wedged_at()) != 0
	}

	pub fn set_wedged_local(&self, value: bool) {
		self.write_u8(self.layout.wedged_at(), value as u8);
	}

	pub fn change_at(&self, rank: usize, index: usize) -> NodeId {
		NodeId(self.read_u32(rank, self.layout.change_at(index)))
	}

	pub fn set_change_local(&self, index: usize, node: NodeId) {
		self.write_u32(self.layout.change_at(index), node.0);
	}

	pub fn joiner_ip_at(&self, rank: usize, index: usize) -> u32 {
		self.read_u32(rank, self.layout.joiner_ip_at(index))
	}

	pub fn set_joiner_ip_local(&self, index: usize, packed: u32) {
		self.write_u32(self.layout.joiner_ip_at(index), packed);
	}

	pub fn num_changes(&self, rank: usize) -> u32 {
		self.read_u32(rank, self.layout.num_changes_at())
	}

	pub fn set_num_changes_local(&self, value: u32) {
		self.write_u32(self.layout.num_changes_at(), value);
	}

	pub fn num_committed(&self, rank: usize) -> u32 {
		self.read_u32(rank, self.layout.num_committed_at())
	}

	pub fn set_num_committed_local(&self, value: u32) {
		self.write_u32(self.layout.num_committed_at(), value);
	}

	pub fn num_acked(&self, rank: usize) -> u32 {
		self.read_u32(rank, self.layout.num_acked_at())
	}

	pub fn set_num_acked_local(&self, value: u32) {
		self.write_u32(self.layout.num_acked_at(), value);
	}

	pub fn num_installed(&self, rank: usize) -> u32 {
		self.read_u32(rank, self.layout.num_installed_at())
	}

	pub fn set_num_installed_local(&self, value: u32) {
		self.write_u32(self.layout.num_installed_at(), value);
	}

	pub fn num_received(&self, rank: usize, slot: usize) -> i32 {
		self.read_i32(rank, self.layout.num_received_at(slot))
	}

	pub fn set_num_received_local(&self, slot: usize, value: i32) {
		self.write_i32(self.layout.num_received_at(slot), value);
	}

	pub fn global_min(&self, rank: usize, slot: usize) -> i32 {
		self.read_i32(rank, self.layout.global_min_at(slot))
	}

	pub fn set_global_min_local(&self, slot: usize, value: i32) {
		self.write_i32(self.layout.global_min_at(slot), value);
	}

	pub fn global_min_ready(&self, rank: usize, subgroup: usize) -> bool {
		self.read_u8(rank, self.layout.global_min_ready_at(subgroup)) != 0
	}

	pub fn set_global_min_ready_local(&self, subgroup: usize, value: bool) {
		self.write_u8(self.layout.global_min_ready_at(subgroup), value as u8);
	}

	pub fn delivered_num(&self, rank: usize, subgroup: usize) -> i32 {
		self.read_i32(rank, self.layout.delivered_num_at(subgroup))
	}

	pub fn set_delivered_num_local(&self, subgroup: usize, value: i32) {
		self.write_i32(self.layout.delivered_num_at(subgroup), value);
	}

	pub fn persisted_num(&self, rank: usize, subgroup: usize) -> u64 {
		self.read_u64(rank, self.layout.persisted_num_at(subgroup))
	}

	pub fn set_persisted_num_local(&self, subgroup: usize, version: u64) {
		self.write_u64(self.layout.persisted_num_at(subgroup), version);
	}

	pub fn vid(&self, rank: usize) -> u32 {
		self.read_u32(rank, self.layout.vid_at())
	}

	pub fn set_vid_local(&self, vid: u32) {
		self.write_u32(self.layout.vid_at(), vid);
	}
}

/// Bulk operations used by the protocol triggers.
impl StateTable {
	/// Echoes the leader's proposal state into the local row: the change
	/// ring, the joiner addresses and the `num_changes`/`num_committed`
	/// counters. `num_acked` and `num_installed` stay local.
	pub fn copy_changes_from(&self, leader_rank: usize) {
		let capacity = self.layout.dims().changes_capacity;
		for index in 0..capacity {
			self.set_change_local(index, self.change_at(leader_rank, index));
			self.set_joiner_ip_local(
				index,
				self.joiner_ip_at(leader_rank, index),
			);
		}
		self.set_num_changes_local(self.num_changes(leader_rank));
		self.set_num_committed_local(self.num_committed(leader_rank));
	}

	/// Copies the leader's full proposal state including `num_acked`. Run
	/// once by a freshly joined member so it does not mistake the counters
	/// it missed for a new proposal.
	pub fn init_from_leader(&self, leader_rank: usize) {
		self.copy_changes_from(leader_rank);
		self.set_num_acked_local(self.num_acked(leader_rank));
	}

	/// Seeds the local row of a new epoch's table from the previous one,
	/// rebasing the proposal counters past the `installed` changes the new
	/// view consumed.
	pub fn init_from_previous(&self, previous: &StateTable, installed: u32) {
		let prev_rank = previous.my_rank();
		self.set_num_changes_local(
			previous.num_changes(prev_rank).saturating_sub(installed),
		);
		self.set_num_committed_local(
			previous.num_committed(prev_rank).saturating_sub(installed),
		);
		self.set_num_acked_local(
			previous.num_acked(prev_rank).saturating_sub(installed),
		);
		self.set_num_installed_local(0);
		// surviving uncommitted ring entries move to the front
		let capacity = self.layout.dims().changes_capacity;
		let prev_capacity = previous.layout.dims().changes_capacity;
		let carried = (previous.num_changes(prev_rank)
			- previous.num_installed(prev_rank)) as usize;
		for (new_index, old_index) in
			(installed as usize..carried.min(prev_capacity)).enumerate()
		{
			if new_index >= capacity {
				break;
			}
			self.set_change_local(
				new_index,
				previous.change_at(prev_rank, old_index),
			);
			self.set_joiner_ip_local(
				new_index,
				previous.joiner_ip_at(prev_rank, old_index),
			);
		}
	}

	/// Copies a span of another row's `global_min` into the local row.
	pub fn copy_global_min_from(
		&self,
		rank: usize,
		offset: usize,
		count: usize,
	) {
		for slot in offset..offset + count {
			self.set_global_min_local(slot, self.global_min(rank, slot));
		}
	}

	/// OR-folds every row's suspicion vector into the local row. Returns
	/// the set of members suspected anywhere. This is the gossip
	/// convergence step of the failure detector.
	pub fn fold_suspicions(&self) -> Vec<bool> {
		let n = self.layout.dims().num_members;
		let mut folded = vec![false; n];
		for rank in 0..self.num_rows() {
			for (who, flag) in folded.iter_mut().enumerate() {
				*flag |= self.suspected(rank, who);
			}
		}
		for (who, flag) in folded.iter().enumerate() {
			if *flag {
				self.set_suspected_local(who, true);
			}
		}
		folded
	}
}

/// Publish helpers, one per protocol signal.
impl StateTable {
	pub fn publish_suspected(&self) {
		self.session.publish(self.layout.suspected_range());
	}

	pub fn publish_wedged(&self) {
		let offset = self.layout.wedged_at();
		self.session.publish(offset..offset + 1);
	}

	pub fn publish_changes_block(&self) {
		self.session.publish(self.layout.changes_block());
	}

	pub fn publish_num_changes(&self) {
		let offset = self.layout.num_changes_at();
		self.session.publish(offset..offset + 4);
	}

	pub fn publish_num_committed(&self) {
		let offset = self.layout.num_committed_at();
		self.session.publish(offset..offset + 4);
	}

	pub fn publish_num_received(&self, offset: usize, count: usize) {
		self
			.session
			.publish(self.layout.num_received_range(offset, count));
	}

	pub fn publish_global_min(&self, offset: usize, count: usize) {
		self
			.session
			.publish(self.layout.global_min_range(offset, count));
	}

	pub fn publish_global_min_ready(&self, subgroup: usize) {
		let offset = self.layout.global_min_ready_at(subgroup);
		self.session.publish(offset..offset + 1);
	}

	pub fn publish_delivered_num(&self, subgroup: usize) {
		let offset = self.layout.delivered_num_at(subgroup);
		self.session.publish(offset..offset + 4);
	}

	pub fn publish_persisted_num(&self, subgroup: usize) {
		let offset = self.layout.persisted_num_at(subgroup);
		self.session.publish(offset..offset + 8);
	}

	pub fn publish_row(&self) {
		self.session.publish(self.layout.whole_row());
	}

	pub fn publish_row_acked(&self) {
		self.session.publish_acked(self.layout.whole_row());
	}
}

/// Predicate evaluation.
impl StateTable {
	/// Runs one predicate evaluation pass. Exposed so tests can drive the
	/// state machine deterministically without the worker thread.
	pub fn tick(self: &Arc<Self>) -> usize {
		self.predicates.tick(self)
	}

	/// Spawns the evaluation thread. Idempotent.
	pub fn start_predicate_evaluation(self: &Arc<Self>) {
		let mut worker = self.worker.lock();
		if worker.is_some() {
			return;
		}
		let table = Arc::clone(self);
		let shutdown = Arc::clone(&self.shutdown);
		let handle = thread::Builder::new()
			.name("sst-predicates".into())
			.spawn(move || {
				let mut seen = 0;
				while !shutdown.load(Ordering::Acquire) {
					table.predicates.tick(&table);
					seen = table.session.wait_for_update(seen, table.poll);
				}
			})
			.expect("failed to spawn the predicate evaluation thread");
		*worker = Some(handle);
	}

	/// Stops the evaluation thread and clears every registration. Called
	/// when the epoch's table is retired.
	pub fn stop(&self) {
		self.shutdown.store(true, Ordering::Release);
		self.predicates.clear();
		let handle = self.worker.lock().take();
		if let Some(handle) = handle {
			if handle.thread().id() != thread::current().id() {
				let _ = handle.join();
			}
		}
	}
}

impl Drop for StateTable {
	fn drop(&mut self) {
		self.shutdown.store(true, Ordering::Release);
		self.predicates.clear();
		let handle = self.worker.lock().take();
		if let Some(handle) = handle {
			if handle.thread().id() != thread::current().id() {
				let _ = handle.join();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::*, crate::sst::memory::Hub};

	fn dims(n: usize) -> Dimensions {
		Dimensions {
			num_members: n,
			changes_capacity: n + 2,
			num_subgroups: 1,
			num_received_size: n,
		}
	}

	fn pair() -> (Arc<StateTable>, Arc<StateTable>) {
		let hub = Hub::new();
		let members = vec![NodeId(1), NodeId(2)];
		let a = StateTable::new(
			&*hub,
			0,
			members.clone(),
			NodeId(1),
			dims(2),
			Duration::from_millis(1),
		)
		.unwrap();
		let b = StateTable::new(
			&*hub,
			0,
			members,
			NodeId(2),
			dims(2),
			Duration::from_millis(1),
		)
		.unwrap();
		(a, b)
	}

	#[test]
	fn counters_travel_only_when_published() {
		let (a, b) = pair();
		a.set_num_changes_local(3);
		assert_eq!(b.num_changes(0), 0);
		a.publish_changes_block();
		assert_eq!(b.num_changes(0), 3);
	}

	#[test]
	fn sentinel_initialization() {
		let (a, _b) = pair();
		assert_eq!(a.num_received(a.my_rank(), 0), -1);
		assert_eq!(a.global_min(a.my_rank(), 1), -1);
		assert_eq!(a.delivered_num(a.my_rank(), 0), -1);
		assert_eq!(a.persisted_num(a.my_rank(), 0), 0);
	}

	#[test]
	fn suspicion_fold_converges_across_rows() {
		let (a, b) = pair();
		a.set_suspected_local(1, true);
		a.publish_suspected();
		let folded = b.fold_suspicions();
		assert_eq!(folded, vec![false, true]);
		assert!(b.suspected(b.my_rank(), 1));
	}

	#[test]
	fn echo_copies_ring_and_counters() {
		let (a, b) = pair();
		a.set_change_local(0, NodeId(9));
		a.set_joiner_ip_local(0, 0x0A00_0001);
		a.set_num_changes_local(1);
		a.set_num_committed_local(0);
		a.publish_changes_block();

		b.copy_changes_from(0);
		assert_eq!(b.change_at(1, 0), NodeId(9));
		assert_eq!(b.joiner_ip_at(1, 0), 0x0A00_0001);
		assert_eq!(b.num_changes(1), 1);
	}

	#[test]
	fn rebase_from_previous_carries_uninstalled_entries() {
		let hub = Hub::new();
		let members = vec![NodeId(1), NodeId(2)];
		let prev = StateTable::new(
			&*hub,
			0,
			members.clone(),
			NodeId(1),
			dims(2),
			Duration::from_millis(1),
		)
		.unwrap();
		prev.set_change_local(0, NodeId(5));
		prev.set_change_local(1, NodeId(6));
		prev.set_num_changes_local(2);
		prev.set_num_committed_local(2);
		prev.set_num_acked_local(2);

		let next = StateTable::new(
			&*hub,
			1,
			members,
			NodeId(1),
			dims(2),
			Duration::from_millis(1),
		)
		.unwrap();
		next.init_from_previous(&prev, 1);
		assert_eq!(next.num_changes(0), 1);
		assert_eq!(next.num_committed(0), 1);
		assert_eq!(next.num_acked(0), 1);
		assert_eq!(next.num_installed(0), 0);
		assert_eq!(next.change_at(0, 0), NodeId(6));
	}

	#[test]
	fn one_time_predicates_unregister_on_fire() {
		let (a, _b) = pair();
		let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let count = Arc::clone(&fired);
		a.predicates.insert(
			Box::new(|_| true),
			Box::new(move |_| {
				count.fetch_add(1, Ordering::SeqCst);
			}),
			Kind::OneTime,
		);
		assert_eq!(a.tick(), 1);
		assert_eq!(a.tick(), 0);
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn recurrent_predicates_persist_until_removed() {
		let (a, _b) = pair();
		let handle = a.predicates.insert(
			Box::new(|_| true),
			Box::new(|_| {}),
			Kind::Recurrent,
		);
		assert_eq!(a.tick(), 1);
		assert_eq!(a.tick(), 1);
		a.predicates.remove(handle);
		assert_eq!(a.tick(), 0);
	}

	#[test]
	fn triggers_may_register_continuations() {
		let (a, _b) = pair();
		let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let count = Arc::clone(&fired);
		a.predicates.insert(
			Box::new(|_| true),
			Box::new(move |table: &StateTable| {
				let count = Arc::clone(&count);
				table.predicates.insert(
					Box::new(|_| true),
					Box::new(move |_| {
						count.fetch_add(1, Ordering::SeqCst);
					}),
					Kind::OneTime,
				);
			}),
			Kind::OneTime,
		);
		a.tick(); // fires the outer trigger, registering the continuation
		assert_eq!(fired.load(Ordering::SeqCst), 0);
		a.tick(); // the continuation takes effect on the next pass
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}
}

//! A minimal windowed datapath over the shared-table counters.
//!
//! This implementation keeps the epoch-termination machinery honest — it
//! maintains the `num_received` counters, honors the wedge, and performs
//! the sender-major in-order delivery the ragged-edge cleanup directs —
//! without implementing a wire transport for payloads. Local groups and
//! tests run on it; a production datapath implements [`Multicast`] over
//! its own transport.

use {
	super::{Multicast, SubgroupSettings},
	crate::{
		persistence::{Version, combine},
		sst::StateTable,
		view::{NodeId, SubgroupId},
	},
	parking_lot::Mutex,
	std::{
		collections::BTreeMap,
		sync::{
			Arc,
			atomic::{AtomicBool, Ordering},
		},
	},
	tracing::{debug, trace},
};

/// Invoked for every delivered message: subgroup, sender, per-sender
/// index, assigned version, payload.
pub type DeliveryFn =
	Arc<dyn Fn(SubgroupId, NodeId, i32, Version, &[u8]) + Send + Sync>;

#[derive(Default)]
struct ShardState {
	/// Undelivered messages keyed by (per-sender index, sender rank); the
	/// key order is exactly the delivery order.
	pending: BTreeMap<(i32, usize), Vec<u8>>,
	/// Highest delivery sequence handed to the application.
	delivered_seq: i32,
}

pub struct WindowMulticast {
	sst: Arc<StateTable>,
	vid: u32,
	window: u32,
	settings: BTreeMap<SubgroupId, SubgroupSettings>,
	wedged: AtomicBool,
	shards: Mutex<BTreeMap<SubgroupId, ShardState>>,
	delivery: DeliveryFn,
}

impl WindowMulticast {
	pub fn new(
		sst: Arc<StateTable>,
		vid: u32,
		settings: BTreeMap<SubgroupId, SubgroupSettings>,
		window: u32,
		delivery: DeliveryFn,
	) -> Arc<Self> {
		let shards = settings
			.keys()
			.map(|id| (*id, ShardState::default()))
			.collect();
		Arc::new(Self {
			sst,
			vid,
			window,
			settings,
			wedged: AtomicBool::new(false),
			shards: Mutex::new(shards),
			delivery,
		})
	}

	pub const fn vid(&self) -> u32 {
		self.vid
	}

	/// Records a message received from a shard peer, advancing this node's
	/// receive counter for that sender. The wire transport that would
	/// normally do this is out of scope; tests and local loopback use this
	/// entry point.
	pub fn receive(
		&self,
		subgroup: SubgroupId,
		sender_rank: usize,
		index: i32,
		payload: Vec<u8>,
	) {
		let Some(settings) = self.settings.get(&subgroup) else {
			return;
		};
		let slot = settings.num_received_offset + sender_rank;
		{
			let mut shards = self.shards.lock();
			if let Some(shard) = shards.get_mut(&subgroup) {
				shard.pending.insert((index, sender_rank), payload);
			}
		}
		if index > self.sst.num_received(self.sst.my_rank(), slot) {
			self.sst.set_num_received_local(slot, index);
			self.sst.publish_num_received(slot, 1);
		}
	}

	fn deliver(
		&self,
		subgroup: SubgroupId,
		settings: &SubgroupSettings,
		shard: &mut ShardState,
		bounds: &[i32],
	) {
		let num_senders = bounds.len() as i32;
		let deliverable: Vec<((i32, usize), Vec<u8>)> = shard
			.pending
			.iter()
			.filter(|((index, sender), _)| *index <= bounds[*sender])
			.map(|(key, payload)| (*key, payload.clone()))
			.collect();
		for ((index, sender), payload) in deliverable {
			shard.pending.remove(&(index, sender));
			let seq = index * num_senders + sender as i32;
			if seq <= shard.delivered_seq {
				continue;
			}
			let sender_id = settings.members[Self::member_rank_of_sender(
				settings, sender,
			)];
			let version = combine(self.vid, seq.max(0) as u32);
			trace!(
				subgroup,
				sender = %sender_id,
				index,
				version,
				"delivering multicast message",
			);
			(self.delivery)(subgroup, sender_id, index, version, &payload);
			shard.delivered_seq = seq;
		}
		let my_rank = self.sst.my_rank();
		if shard.delivered_seq > self.sst.delivered_num(my_rank, subgroup as usize)
		{
			self
				.sst
				.set_delivered_num_local(subgroup as usize, shard.delivered_seq);
			self.sst.publish_delivered_num(subgroup as usize);
		}
		// this datapath has no durability pipeline of its own: a delivered
		// message is as persistent as it will ever get, so the persistence
		// counter tracks delivery. A durable datapath advances it from its
		// own persistence completions instead.
		if shard.delivered_seq >= 0 {
			let version = combine(self.vid, shard.delivered_seq as u32);
			if version > self.sst.persisted_num(my_rank, subgroup as usize) {
				self
					.sst
					.set_persisted_num_local(subgroup as usize, version);
				self.sst.publish_persisted_num(subgroup as usize);
			}
		}
	}

	/// Translates a sender rank back to the member's rank within the
	/// shard.
	fn member_rank_of_sender(
		settings: &SubgroupSettings,
		sender_rank: usize,
	) -> usize {
		settings
			.is_sender
			.iter()
			.enumerate()
			.filter(|(_, s)| **s)
			.map(|(rank, _)| rank)
			.nth(sender_rank)
			.expect("sender rank out of range for shard")
	}

	/// Per-sender stable frontier: the minimum receive counter across all
	/// live shard members.
	fn stable_mins(&self, settings: &SubgroupSettings) -> Vec<i32> {
		let num_senders = settings.num_senders();
		(0..num_senders)
			.map(|sender| {
				let slot = settings.num_received_offset + sender;
				settings
					.members
					.iter()
					.filter_map(|member| {
						let rank = self
							.sst
							.members()
							.iter()
							.position(|m| m == member)?;
						(!self.sst.is_frozen(rank))
							.then(|| self.sst.num_received(rank, slot))
					})
					.min()
					.unwrap_or(-1)
			})
			.collect()
	}
}

impl Multicast for WindowMulticast {
	fn wedge(&self) {
		if !self.wedged.swap(true, Ordering::AcqRel) {
			debug!(vid = self.vid, "multicast wedged");
		}
	}

	fn is_wedged(&self) -> bool {
		self.wedged.load(Ordering::Acquire)
	}

	fn send(&self, subgroup: SubgroupId, payload: &[u8]) -> bool {
		if self.is_wedged() {
			return false;
		}
		let Some(settings) = self.settings.get(&subgroup) else {
			return false;
		};
		let Some(sender_rank) = settings.sender_rank else {
			return false;
		};
		let slot = settings.num_received_offset + sender_rank;
		let my_rank = self.sst.my_rank();
		let next_index = self.sst.num_received(my_rank, slot) + 1;

		// respect the send window against the slowest live member
		let stable = self.stable_mins(settings)[sender_rank];
		if next_index - stable > self.window as i32 {
			return false;
		}

		{
			let mut shards = self.shards.lock();
			if let Some(shard) = shards.get_mut(&subgroup) {
				shard
					.pending
					.insert((next_index, sender_rank), payload.to_vec());
			}
		}
		self.sst.set_num_received_local(slot, next_index);
		self.sst.publish_num_received(slot, 1);
		true
	}

	fn check_pending_sst_sends(&self, _subgroup: SubgroupId) -> bool {
		// counter pushes complete synchronously in this datapath
		false
	}

	fn flush_in_flight(&self, subgroup: SubgroupId) -> bool {
		// every accepted message is already reflected in `num_received`;
		// one pump delivers whatever has since become stable
		let Some(settings) = self.settings.get(&subgroup) else {
			return false;
		};
		let bounds = self.stable_mins(settings);
		let mut shards = self.shards.lock();
		if let Some(shard) = shards.get_mut(&subgroup) {
			self.deliver(subgroup, settings, shard, &bounds);
		}
		false
	}

	fn deliver_messages_upto(
		&self,
		max_received_by_sender: &[i32],
		subgroup: SubgroupId,
		num_senders: usize,
	) {
		debug_assert_eq!(max_received_by_sender.len(), num_senders);
		let Some(settings) = self.settings.get(&subgroup) else {
			return;
		};
		let mut shards = self.shards.lock();
		if let Some(shard) = shards.get_mut(&subgroup) {
			self.deliver(subgroup, settings, shard, max_received_by_sender);
			// traffic beyond the agreed bound is discarded with the epoch
			shard.pending.clear();
		}
	}

	fn compute_global_stability_frontier(&self, subgroup: SubgroupId) -> u64 {
		let Some(settings) = self.settings.get(&subgroup) else {
			return combine(self.vid, 0);
		};
		let mins = self.stable_mins(settings);
		let num_senders = mins.len() as i32;
		let seq = mins
			.iter()
			.enumerate()
			.map(|(sender, min)| *min * num_senders + sender as i32)
			.min()
			.unwrap_or(0)
			.max(0);
		combine(self.vid, seq as u32)
	}

	fn settings(&self) -> &BTreeMap<SubgroupId, SubgroupSettings> {
		&self.settings
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			sst::{Dimensions, memory::Hub},
			view::Mode,
		},
		core::time::Duration,
		parking_lot::Mutex as PlMutex,
	};

	fn table(hub: &Arc<Hub>, members: &[NodeId], me: NodeId) -> Arc<StateTable> {
		StateTable::new(
			&**hub,
			5,
			members.to_vec(),
			me,
			Dimensions {
				num_members: members.len(),
				changes_capacity: members.len() + 2,
				num_subgroups: 1,
				num_received_size: members.len(),
			},
			Duration::from_millis(1),
		)
		.unwrap()
	}

	fn shard_settings(members: &[NodeId], me: NodeId) -> SubgroupSettings {
		let shard_rank = members.iter().position(|m| *m == me).unwrap();
		SubgroupSettings {
			shard_num: 0,
			shard_rank,
			members: members.to_vec(),
			is_sender: vec![true; members.len()],
			sender_rank: Some(shard_rank),
			num_received_offset: 0,
			mode: Mode::Ordered,
		}
	}

	type Delivered = Arc<PlMutex<Vec<(NodeId, i32, Version)>>>;

	fn multicast(
		sst: Arc<StateTable>,
		members: &[NodeId],
		me: NodeId,
	) -> (Arc<WindowMulticast>, Delivered) {
		let delivered: Delivered = Arc::default();
		let sink = Arc::clone(&delivered);
		let delivery: DeliveryFn =
			Arc::new(move |_sg, sender, index, version, _payload| {
				sink.lock().push((sender, index, version));
			});
		let settings =
			BTreeMap::from([(0, shard_settings(members, me))]);
		(WindowMulticast::new(sst, 5, settings, 16, delivery), delivered)
	}

	#[test]
	fn wedged_multicast_rejects_sends() {
		let hub = Hub::new();
		let members = [NodeId(1)];
		let sst = table(&hub, &members, NodeId(1));
		let (mc, _) = multicast(sst, &members, NodeId(1));
		assert!(mc.send(0, b"m"));
		mc.wedge();
		assert!(!mc.send(0, b"m"));
	}

	#[test]
	fn delivery_is_sender_major_in_index_order() {
		let hub = Hub::new();
		let members = [NodeId(1), NodeId(2), NodeId(3)];
		let sst = table(&hub, &members, NodeId(1));
		let (mc, delivered) = multicast(sst, &members, NodeId(1));

		// three senders with a ragged tail: A sent 0..=1, B 0, C 0..=1
		mc.receive(0, 1, 0, b"b0".to_vec());
		mc.receive(0, 2, 0, b"c0".to_vec());
		mc.receive(0, 2, 1, b"c1".to_vec());
		assert!(mc.send(0, b"a0"));
		assert!(mc.send(0, b"a1"));

		mc.deliver_messages_upto(&[1, 0, 1], 0, 3);

		let log = delivered.lock();
		let order: Vec<(NodeId, i32)> =
			log.iter().map(|(s, i, _)| (*s, *i)).collect();
		assert_eq!(
			order,
			vec![
				(NodeId(1), 0),
				(NodeId(2), 0),
				(NodeId(3), 0),
				(NodeId(1), 1),
				(NodeId(3), 1),
			]
		);
		// versions follow seq = index * num_senders + sender
		assert_eq!(log[0].2, combine(5, 0));
		assert_eq!(log[4].2, combine(5, 5));
	}

	#[test]
	fn delivery_never_exceeds_the_agreed_bound() {
		let hub = Hub::new();
		let members = [NodeId(1), NodeId(2)];
		let sst = table(&hub, &members, NodeId(1));
		let (mc, delivered) = multicast(sst, &members, NodeId(1));

		assert!(mc.send(0, b"a0"));
		assert!(mc.send(0, b"a1"));
		mc.receive(0, 1, 0, b"b0".to_vec());

		mc.deliver_messages_upto(&[0, 0], 0, 2);
		assert_eq!(delivered.lock().len(), 2);

		// the bound was agreed; a1 is discarded with the epoch
		mc.deliver_messages_upto(&[1, 0], 0, 2);
		assert_eq!(delivered.lock().len(), 2);
	}

	#[test]
	fn delivered_counter_tracks_the_sequence() {
		let hub = Hub::new();
		let members = [NodeId(1), NodeId(2)];
		let sst = table(&hub, &members, NodeId(1));
		let (mc, _) = multicast(Arc::clone(&sst), &members, NodeId(1));

		assert!(mc.send(0, b"a0"));
		mc.receive(0, 1, 0, b"b0".to_vec());
		mc.deliver_messages_upto(&[0, 0], 0, 2);
		// last delivered is b@0 with seq 0*2+1
		assert_eq!(sst.delivered_num(0, 0), 1);
	}
}

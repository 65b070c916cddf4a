//! Epoch termination and view installation: the continuation chain that
//! runs from the leader's commit to the next view going live.
//!
//! The chain is a sequence of one-shot predicates, each registering the
//! next: committed changes -> meta-wedge -> ragged-edge cleanup ->
//! persistence barrier -> installation. An inadequately provisioned
//! candidate rewinds the chain and re-opens join admission until enough
//! members commit.

use {
	super::{Error, Inner, protocol::ShardLeaders},
	crate::{
		layout,
		multicast::Multicast,
		persistence::{RaggedTrim, Storage, seq_of},
		primitives::unpack_ipv4,
		sst::{Kind, StateTable},
		view::{Mode, NodeId, SubgroupId, View, wire},
	},
	std::{collections::BTreeSet, sync::Arc},
	tracing::{debug, info, warn},
};

impl Inner {
	/// Trigger for the one-shot `leader_committed_changes` predicate:
	/// close join admission for this epoch, wedge locally, and wait for
	/// the whole group to wedge.
	pub(super) fn start_meta_wedge(self: &Arc<Self>, sst: &StateTable) {
		{
			let view = self.curr_view.read();
			info!(vid = view.vid, "meta-wedging the current view");
			view.wedge();
		}
		// the fired one-shot is already unregistered; its slot is cleared
		// when the install completes
		self.drop_join_and_commit_predicates(sst);

		let weak = Arc::downgrade(self);
		let predicate = Box::new(move |sst: &StateTable| {
			let Some(inner) = weak.upgrade() else {
				return false;
			};
			let view = inner.curr_view.read();
			(0..sst.num_rows())
				.all(|rank| view.failed[rank] || sst.wedged(rank))
		});
		let weak = Arc::downgrade(self);
		let trigger = Box::new(move |sst: &StateTable| {
			if let Some(inner) = weak.upgrade() {
				inner.terminate_epoch(sst);
			}
		});
		sst.predicates.insert(predicate, trigger, Kind::OneTime);
	}

	/// Runs once the group is meta-wedged: computes the candidate next
	/// view, flushes the dying epoch's datapath, runs ragged-edge cleanup
	/// and chains into the persistence barrier.
	pub(super) fn terminate_epoch(self: &Arc<Self>, sst: &StateTable) {
		debug!("group is meta-wedged; terminating the epoch");
		let mut view = self.curr_view.write();

		let mut next = match self.make_next_view_locked(&view, sst) {
			Ok(next) => next,
			Err(error) => {
				sst.predicates.clear();
				self.fail(&error);
				return;
			}
		};
		let provisioned =
			layout::provision(&self.spec, Some(&*view), &mut next);

		if !next.is_adequately_provisioned {
			debug!(
				vid = next.vid,
				"next view would be inadequate; waiting for more changes",
			);
			let first_call = {
				let mut slot = self.next_view.lock();
				let first = slot.is_none();
				*slot = Some(next);
				first
			};
			let leader = view.rank_of_leader();
			let committed_now = sst.num_committed(leader);
			drop(view);

			if first_call {
				// re-open join admission, but keep epoch termination armed
				// through the bespoke retry predicate below rather than
				// the ordinary one-shot
				self.register_predicates();
				let mut handles = self.handles.lock();
				if let Some(handle) = handles.leader_committed.take() {
					sst.predicates.remove(handle);
				}
			}

			let weak = Arc::downgrade(self);
			let predicate = Box::new(move |sst: &StateTable| {
				let Some(inner) = weak.upgrade() else {
					return false;
				};
				let leader = inner.curr_view.read().rank_of_leader();
				sst.num_committed(leader) > committed_now
			});
			let weak = Arc::downgrade(self);
			let trigger = Box::new(move |sst: &StateTable| {
				if let Some(inner) = weak.upgrade() {
					inner.terminate_epoch(sst);
				}
			});
			sst.predicates.insert(predicate, trigger, Kind::OneTime);
			return;
		}

		*self.next_view.lock() = Some(next);
		*self.next_provision.lock() = provisioned;

		// flush in-flight datapath traffic into the shared counters so the
		// ragged edge is computed over everything that was actually sent
		let multicast = view.multicast.clone().expect("epoch is bound");
		let subgroups: Vec<SubgroupId> =
			multicast.settings().keys().copied().collect();
		for subgroup in &subgroups {
			while multicast.check_pending_sst_sends(*subgroup) {}
		}
		sst.publish_row_acked();
		sst.sync_with_members();
		for subgroup in &subgroups {
			while multicast.flush_in_flight(*subgroup) {}
		}
		sst.publish_row_acked();
		sst.sync_with_members();

		// shards I lead settle their ragged edge now; the rest wait for
		// their leaders' verdicts
		let mut follower_shards: Vec<(SubgroupId, usize)> = Vec::new();
		let my_subgroups: Vec<(SubgroupId, usize)> = view
			.my_subgroups
			.iter()
			.map(|(sg, shard)| (*sg, *shard))
			.collect();
		for (subgroup, shard_num) in my_subgroups {
			let shard =
				&view.subgroup_shard_views[subgroup as usize][shard_num];
			let num_senders = shard.num_senders();
			let offset = multicast.settings()[&subgroup].num_received_offset;
			let shard_members = shard.members.clone();
			if view.subview_rank_of_shard_leader(subgroup, shard_num)
				== shard.my_rank
			{
				self.leader_ragged_edge_cleanup(
					&view,
					sst,
					subgroup,
					offset,
					&shard_members,
					num_senders,
				);
			} else {
				follower_shards.push((subgroup, shard_num));
			}
		}
		drop(view);

		let weak = Arc::downgrade(self);
		let shards = follower_shards.clone();
		let ready_predicate = Box::new(move |sst: &StateTable| {
			let Some(inner) = weak.upgrade() else {
				return false;
			};
			let view = inner.curr_view.read();
			shards.iter().all(|(subgroup, shard_num)| {
				view
					.rank_of_shard_leader(*subgroup, *shard_num)
					.map(|leader| {
						sst.global_min_ready(leader, *subgroup as usize)
					})
					.unwrap_or(false)
			})
		});
		let weak = Arc::downgrade(self);
		let ready_trigger = Box::new(move |sst: &StateTable| {
			let Some(inner) = weak.upgrade() else {
				return;
			};
			inner.follower_cleanup_and_persistence(sst, &follower_shards);
		});
		sst.predicates.insert(ready_predicate, ready_trigger, Kind::OneTime);
	}

	/// Continuation once every awaited shard leader has posted its
	/// `global_min`: settle the follower shards, then wait for the
	/// persistence barrier before installing.
	fn follower_cleanup_and_persistence(
		self: &Arc<Self>,
		sst: &StateTable,
		follower_shards: &[(SubgroupId, usize)],
	) {
		debug!(
			shards = follower_shards.len(),
			"shard leaders posted their ragged-edge verdicts",
		);
		{
			let view = self.curr_view.read();
			let multicast = view.multicast.clone().expect("epoch is bound");
			for (subgroup, shard_num) in follower_shards {
				let shard =
					&view.subgroup_shard_views[*subgroup as usize][*shard_num];
				let Some(leader_rank) =
					view.rank_of_shard_leader(*subgroup, *shard_num)
				else {
					continue;
				};
				let offset =
					multicast.settings()[subgroup].num_received_offset;
				self.follower_ragged_edge_cleanup(
					&view,
					sst,
					*subgroup,
					leader_rank,
					offset,
					shard.num_senders(),
				);
			}
		}

		let weak = Arc::downgrade(self);
		let persisted_predicate = Box::new(move |sst: &StateTable| {
			let Some(inner) = weak.upgrade() else {
				return false;
			};
			inner.persistence_finished(sst)
		});
		let weak = Arc::downgrade(self);
		let persisted_trigger = Box::new(move |sst: &StateTable| {
			if let Some(inner) = weak.upgrade() {
				inner.finish_view_change(sst);
			}
		});
		sst
			.predicates
			.insert(persisted_predicate, persisted_trigger, Kind::OneTime);
	}

	/// The persistence barrier: every live member of every ordered shard
	/// this node belongs to must have persisted what this node delivered.
	fn persistence_finished(&self, sst: &StateTable) -> bool {
		let view = self.curr_view.read();
		let my_rank = sst.my_rank();
		for (&subgroup, &shard_num) in &view.my_subgroups {
			let shard =
				&view.subgroup_shard_views[subgroup as usize][shard_num];
			if shard.mode == Mode::Unordered {
				continue;
			}
			let last_delivered = sst.delivered_num(my_rank, subgroup as usize);
			for member in &shard.members {
				let Some(rank) = view.rank_of(*member) else {
					continue;
				};
				if view.failed[rank] {
					continue;
				}
				let persisted =
					seq_of(sst.persisted_num(rank, subgroup as usize));
				if persisted < last_delivered {
					return false;
				}
			}
		}
		true
	}

	/// Shard-leader side of ragged-edge cleanup: adopt an existing
	/// verdict if any member already posted one, otherwise decide
	/// sender-wise minima over the live shard members, then publish and
	/// deliver.
	fn leader_ragged_edge_cleanup(
		&self,
		view: &View,
		sst: &StateTable,
		subgroup: SubgroupId,
		offset: usize,
		shard_members: &[NodeId],
		num_senders: usize,
	) {
		debug!(subgroup, "running leader ragged-edge cleanup");
		let my_rank = sst.my_rank();
		let mut adopted = false;
		for member in shard_members {
			let Some(rank) = view.rank_of(*member) else {
				continue;
			};
			if sst.global_min_ready(rank, subgroup as usize) {
				sst.copy_global_min_from(rank, offset, num_senders);
				adopted = true;
				break;
			}
		}
		if !adopted {
			for sender in 0..num_senders {
				let slot = offset + sender;
				let mut min = sst.num_received(my_rank, slot);
				for member in shard_members {
					let Some(rank) = view.rank_of(*member) else {
						continue;
					};
					if !view.failed[rank] && sst.num_received(rank, slot) < min
					{
						min = sst.num_received(rank, slot);
					}
				}
				sst.set_global_min_local(slot, min);
			}
		}
		debug!(subgroup, "shard leader finished computing global_min");
		sst.set_global_min_ready_local(subgroup as usize, true);
		sst.publish_global_min(offset, num_senders);
		sst.publish_global_min_ready(subgroup as usize);

		self.deliver_in_order(view, sst, my_rank, subgroup, offset, num_senders);
	}

	/// Follower side: echo the leader's verdict, publish it, deliver.
	fn follower_ragged_edge_cleanup(
		&self,
		view: &View,
		sst: &StateTable,
		subgroup: SubgroupId,
		leader_rank: usize,
		offset: usize,
		num_senders: usize,
	) {
		debug!(
			subgroup,
			leader_rank, "echoing shard leader's ragged-edge verdict",
		);
		sst.copy_global_min_from(leader_rank, offset, num_senders);
		sst.set_global_min_ready_local(subgroup as usize, true);
		sst.publish_global_min(offset, num_senders);
		sst.publish_global_min_ready(subgroup as usize);

		self.deliver_in_order(
			view,
			sst,
			leader_rank,
			subgroup,
			offset,
			num_senders,
		);
	}

	/// Persists the agreed trim, then delivers the ragged edge in
	/// sender-major order. The trim is durable before the first delivery
	/// so recovery replays the identical cut.
	fn deliver_in_order(
		&self,
		view: &View,
		sst: &StateTable,
		decider_rank: usize,
		subgroup: SubgroupId,
		offset: usize,
		num_senders: usize,
	) {
		let max_received_indices: Vec<i32> = (0..num_senders)
			.map(|sender| sst.global_min(decider_rank, offset + sender))
			.collect();
		let trim = RaggedTrim {
			subgroup_id: subgroup,
			vid: view.vid,
			leader_id: view.leader_id(),
			max_received_by_sender: max_received_indices.clone(),
		};
		if let Err(e) = self.storage.save_ragged_trim(&trim) {
			// delivering without a durable trim would make recovery
			// disagree with this cut
			sst.predicates.clear();
			self.fail(&Error::Io(e));
			return;
		}
		info!(
			subgroup,
			bounds = ?max_received_indices,
			"delivering ragged-edge messages in order",
		);
		if let Some(multicast) = &view.multicast {
			multicast.deliver_messages_upto(
				&max_received_indices,
				subgroup,
				num_senders,
			);
		}
	}

	/// Installs the next view: hand the committed joiners their
	/// configuration, bind the new epoch, retire the old one, and restart
	/// the protocol machinery on the new table.
	pub(super) fn finish_view_change(self: &Arc<Self>, sst: &StateTable) {
		let mut view = self.curr_view.write();
		self.drop_all_predicates(sst);

		let mut next = self
			.next_view
			.lock()
			.take()
			.expect("finish_view_change without a candidate view");
		let provisioned = core::mem::take(&mut *self.next_provision.lock());

		info!(
			old_vid = view.vid,
			new_vid = next.vid,
			members = ?next.members,
			joined = ?next.joined,
			departed = ?next.departed,
			"installing the next view",
		);

		// committed joiners get the view before the group commits RDMA
		// resources to them
		let mut joiner_sockets = Vec::new();
		if view.i_am_leader() && !next.joined.is_empty() {
			for _ in 0..next.joined.len() {
				let Some(socket) = self.proposed_join_sockets.lock().pop_front()
				else {
					break;
				};
				match self.commit_join(&next, &socket) {
					Ok(()) => joiner_sockets.push(socket),
					Err(e) => {
						// the joiner is in the committed view regardless;
						// it will be suspected and evicted like any member
						warn!(error = %e, "joiner died during install");
					}
				}
			}
		}

		// connections for the joiners, in rank order
		for joiner in &next.joined {
			if let Some(rank) = next.rank_of(*joiner) {
				self
					.fabric
					.add_node(*joiner, &next.member_ips[rank]);
			}
		}

		if let Err(e) = self.bind_epoch_locked(&mut next, provisioned) {
			sst.predicates.clear();
			self.fail(&e);
			return;
		}
		let new_sst = next.sst.clone().expect("epoch was just bound");
		let installed = (next.joined.len() + next.departed.len()) as u32;
		new_sst.init_from_previous(sst, installed);
		new_sst.set_vid_local(next.vid);

		let shard_leaders = shard_leaders_by_id(&view, &next);
		for socket in &joiner_sockets {
			if let Err(e) =
				super::protocol::write_shard_leaders(socket, &shard_leaders)
			{
				warn!(error = %e, "failed to send shard leaders to a joiner");
			}
		}

		// joiners proceed to their own setup barrier once they hold the
		// shard leaders; this blocks until every next-view member arrives
		new_sst.publish_row();
		new_sst.sync_with_members();

		// retire the old epoch; its table and datapath are released off
		// this thread because peers may still be reading the old region
		view.multicast = None;
		let old_view = core::mem::replace(&mut *view, next);
		{
			let mut old_views = self.old_views.lock();
			old_views.push_back(old_view);
		}
		self.old_views_cv.notify_all();

		if let Err(e) = self
			.storage
			.save_bytes(Storage::view_slot(), &wire::encode_full(&view))
		{
			warn!(error = %e, "failed to persist the installed view");
		}

		*self.last_suspected.lock() = vec![false; view.num_members];
		self.register_predicates_on(&new_sst);

		if view.i_am_new_leader() {
			self.merge_changes(&view, &new_sst);
		}

		for upcall in self.upcalls.lock().iter() {
			upcall(&view);
		}

		self.refresh_mesh(&view);
		self.send_objects_to_new_members(&view, &shard_leaders);

		new_sst.start_predicate_evaluation();
		drop(view);

		*self.install_epoch.lock() += 1;
		self.install_cv.notify_all();
	}

	/// Computes the candidate next view from the leader-committed change
	/// prefix: leavers compacted out, joiners appended at the tail.
	fn make_next_view_locked(
		&self,
		view: &View,
		sst: &StateTable,
	) -> Result<View, Error> {
		let my_rank = sst.my_rank();
		let leader = view.rank_of_leader();
		let committed_count =
			(sst.num_committed(leader) - sst.num_installed(leader)) as usize;

		let mut leave_ranks = BTreeSet::new();
		let mut joins: Vec<(NodeId, String)> = Vec::new();
		for index in 0..committed_count {
			let change = sst.change_at(my_rank, index);
			match view.rank_of(change) {
				Some(rank) => {
					leave_ranks.insert(rank);
				}
				None => {
					let ip = unpack_ipv4(sst.joiner_ip_at(my_rank, index));
					joins.push((change, ip));
				}
			}
		}

		let next_num = view.num_members - leave_ranks.len() + joins.len();
		let mut members = vec![NodeId(0); next_num];
		let mut member_ips = vec![String::new(); next_num];
		let mut failed = vec![false; next_num];
		let mut joined = Vec::with_capacity(joins.len());
		let mut departed = Vec::with_capacity(leave_ranks.len());

		for (index, (joiner, ip)) in joins.into_iter().enumerate() {
			let rank = view.num_members - leave_ranks.len() + index;
			debug!(joiner = %joiner, rank, "next view adds a member");
			members[rank] = joiner;
			member_ips[rank] = ip;
			joined.push(joiner);
		}

		let mut next_unassigned_rank = view.next_unassigned_rank;
		for leaver_rank in &leave_ranks {
			departed.push(view.members[*leaver_rank]);
			if (*leaver_rank as i32) <= view.next_unassigned_rank {
				next_unassigned_rank -= 1;
			}
		}
		debug!(
			excluded = leave_ranks.len(),
			"next view excludes failed members",
		);

		let mut new_rank = 0;
		for old_rank in 0..view.num_members {
			if leave_ranks.contains(&old_rank) {
				continue;
			}
			members[new_rank] = view.members[old_rank];
			member_ips[new_rank] = view.member_ips[old_rank].clone();
			failed[new_rank] = view.failed[old_rank];
			new_rank += 1;
		}

		let my_id = view.my_id();
		let my_new_rank = members.iter().position(|m| *m == my_id);
		if my_new_rank.is_none() {
			return Err(Error::SelfExcluded);
		}

		let mut next = View::new(
			view.vid + 1,
			members,
			member_ips,
			failed,
			joined,
			departed,
			my_new_rank,
			next_unassigned_rank,
		);
		next.i_know_i_am_leader = view.i_know_i_am_leader;
		Ok(next)
	}

	/// Run by a node that just became leader: fold every surviving row's
	/// pending changes into its own ring so no committed-but-uninstalled
	/// change is lost with the old leader.
	fn merge_changes(self: &Arc<Self>, view: &View, sst: &StateTable) {
		let my_rank = sst.my_rank();
		let capacity = sst.layout().dims().changes_capacity;
		let mut count =
			(sst.num_changes(my_rank) - sst.num_installed(my_rank)) as usize;
		let mut known: Vec<NodeId> =
			(0..count).map(|i| sst.change_at(my_rank, i)).collect();
		let mut appended = false;

		for rank in 0..sst.num_rows() {
			if rank == my_rank || view.failed[rank] {
				continue;
			}
			let pending = (sst.num_changes(rank) - sst.num_installed(rank))
				as usize;
			for index in 0..pending.min(capacity) {
				let change = sst.change_at(rank, index);
				if known.contains(&change) {
					continue;
				}
				if count == capacity {
					sst.predicates.clear();
					self.fail(&Error::ChangesOverflow);
					return;
				}
				sst.set_change_local(count, change);
				sst.set_joiner_ip_local(count, sst.joiner_ip_at(rank, index));
				known.push(change);
				count += 1;
				appended = true;
			}
		}
		if appended {
			info!(
				merged = count,
				"new leader merged the surviving change ring",
			);
			sst.set_num_changes_local(count as u32 + sst.num_installed(my_rank));
			sst.publish_changes_block();
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			config::Config,
			layout::{SubgroupSpec, sharded::ShardedAllocator},
			multicast::window::DeliveryFn,
			sst::{Dimensions, memory::Hub},
		},
		core::time::Duration,
		std::sync::Arc,
		tempfile::TempDir,
	};

	const MEMBERS: [NodeId; 3] = [NodeId(1), NodeId(2), NodeId(3)];

	fn test_inner(hub: &Arc<Hub>, dir: &TempDir) -> Arc<Inner> {
		let config = Config::builder()
			.with_gms_port(0)
			.with_object_port(0)
			.with_storage_dir(dir.path().to_path_buf())
			.build()
			.unwrap();
		let spec = SubgroupSpec::new()
			.with("shard", ShardedAllocator::spanning(3, Mode::Ordered));
		let delivery: DeliveryFn = Arc::new(|_, _, _, _, _| {});
		Inner::bootstrap(config, NodeId(1), spec, hub.clone(), delivery)
			.unwrap()
	}

	/// Installs a three-member vid-5 view on the inner manager and returns
	/// its bound table.
	fn bind_three_member_view(inner: &Arc<Inner>) -> Arc<StateTable> {
		let mut view = View::new(
			5,
			MEMBERS.to_vec(),
			MEMBERS.iter().map(|m| format!("10.0.0.{m}")).collect(),
			vec![false; 3],
			Vec::new(),
			Vec::new(),
			Some(0),
			0,
		);
		view.i_know_i_am_leader = true;
		let provisioned = layout::provision(&inner.spec, None, &mut view);
		*inner.curr_view.write() = view;
		inner.bind_epoch(provisioned).unwrap();
		inner.curr_view.read().sst.clone().unwrap()
	}

	/// A peer's table in the same session; dimensions must line up with
	/// what `bind_epoch` derives (three members, default changes slack,
	/// one spanning subgroup of three senders).
	fn peer_table(hub: &Arc<Hub>, me: NodeId) -> Arc<StateTable> {
		StateTable::new(
			&**hub,
			5,
			MEMBERS.to_vec(),
			me,
			Dimensions {
				num_members: 3,
				changes_capacity: 3 + 8,
				num_subgroups: 1,
				num_received_size: 3,
			},
			Duration::from_millis(1),
		)
		.unwrap()
	}

	#[test]
	fn leader_decides_sender_wise_minima() {
		let hub = Hub::new();
		let dir = TempDir::new().unwrap();
		let inner = test_inner(&hub, &dir);
		let sst = bind_three_member_view(&inner);
		let peer2 = peer_table(&hub, NodeId(2));
		let peer3 = peer_table(&hub, NodeId(3));

		for (slot, count) in [7, 5, 6].into_iter().enumerate() {
			sst.set_num_received_local(slot, count);
		}
		for (slot, count) in [6, 5, 6].into_iter().enumerate() {
			peer2.set_num_received_local(slot, count);
		}
		peer2.publish_num_received(0, 3);
		for (slot, count) in [7, 4, 6].into_iter().enumerate() {
			peer3.set_num_received_local(slot, count);
		}
		peer3.publish_num_received(0, 3);

		{
			let view = inner.curr_view.read();
			inner.leader_ragged_edge_cleanup(&view, &sst, 0, 0, &MEMBERS, 3);
		}

		let my_rank = sst.my_rank();
		let decided: Vec<i32> =
			(0..3).map(|slot| sst.global_min(my_rank, slot)).collect();
		assert_eq!(decided, vec![6, 4, 6]);
		assert!(sst.global_min_ready(my_rank, 0));

		// the trim was durable before delivery began
		let trim = inner.storage.load_ragged_trim(0).unwrap().unwrap();
		assert_eq!(
			trim,
			RaggedTrim {
				subgroup_id: 0,
				vid: 5,
				leader_id: NodeId(1),
				max_received_by_sender: vec![6, 4, 6],
			}
		);
	}

	#[test]
	fn leader_adopts_an_existing_verdict() {
		let hub = Hub::new();
		let dir = TempDir::new().unwrap();
		let inner = test_inner(&hub, &dir);
		let sst = bind_three_member_view(&inner);
		let peer2 = peer_table(&hub, NodeId(2));

		// a prior leader already decided and published before failing over
		for slot in 0..3 {
			peer2.set_global_min_local(slot, 2);
		}
		peer2.set_global_min_ready_local(0, true);
		peer2.publish_global_min(0, 3);
		peer2.publish_global_min_ready(0);

		sst.set_num_received_local(0, 9);
		{
			let view = inner.curr_view.read();
			inner.leader_ragged_edge_cleanup(&view, &sst, 0, 0, &MEMBERS, 3);
		}

		let my_rank = sst.my_rank();
		let decided: Vec<i32> =
			(0..3).map(|slot| sst.global_min(my_rank, slot)).collect();
		assert_eq!(decided, vec![2, 2, 2], "the posted verdict wins");
	}

	#[test]
	fn follower_echoes_the_leader_verdict() {
		let hub = Hub::new();
		let dir = TempDir::new().unwrap();
		let inner = test_inner(&hub, &dir);
		let sst = bind_three_member_view(&inner);
		let peer2 = peer_table(&hub, NodeId(2));

		for (slot, bound) in [3, 0, 1].into_iter().enumerate() {
			peer2.set_global_min_local(slot, bound);
		}
		peer2.set_global_min_ready_local(0, true);
		peer2.publish_global_min(0, 3);
		peer2.publish_global_min_ready(0);

		{
			let view = inner.curr_view.read();
			inner.follower_ragged_edge_cleanup(&view, &sst, 0, 1, 0, 3);
		}

		let my_rank = sst.my_rank();
		let echoed: Vec<i32> =
			(0..3).map(|slot| sst.global_min(my_rank, slot)).collect();
		assert_eq!(echoed, vec![3, 0, 1]);
		assert!(sst.global_min_ready(my_rank, 0));
		let trim = inner.storage.load_ragged_trim(0).unwrap().unwrap();
		assert_eq!(trim.max_received_by_sender, vec![3, 0, 1]);
	}

	#[test]
	fn persistence_barrier_waits_for_lagging_members() {
		let hub = Hub::new();
		let dir = TempDir::new().unwrap();
		let inner = test_inner(&hub, &dir);
		let sst = bind_three_member_view(&inner);
		let peer2 = peer_table(&hub, NodeId(2));
		let peer3 = peer_table(&hub, NodeId(3));

		// this node delivered up to sequence 5 in the ordered shard
		sst.set_delivered_num_local(0, 5);
		sst.set_persisted_num_local(0, crate::persistence::combine(5, 5));

		// peer 2 persisted everything, peer 3 lags behind
		peer2.set_persisted_num_local(0, crate::persistence::combine(5, 5));
		peer2.publish_persisted_num(0);
		peer3.set_persisted_num_local(0, crate::persistence::combine(5, 3));
		peer3.publish_persisted_num(0);
		assert!(!inner.persistence_finished(&sst));

		peer3.set_persisted_num_local(0, crate::persistence::combine(5, 5));
		peer3.publish_persisted_num(0);
		assert!(inner.persistence_finished(&sst));
	}

	#[test]
	fn persistence_barrier_skips_failed_members() {
		let hub = Hub::new();
		let dir = TempDir::new().unwrap();
		let inner = test_inner(&hub, &dir);
		let sst = bind_three_member_view(&inner);
		let _peer2 = peer_table(&hub, NodeId(2));
		let _peer3 = peer_table(&hub, NodeId(3));

		sst.set_delivered_num_local(0, 2);
		sst.set_persisted_num_local(0, crate::persistence::combine(5, 2));
		// peers never persisted anything, but a failed peer does not gate
		// the barrier
		assert!(!inner.persistence_finished(&sst));
		inner.curr_view.write().mark_failed(1);
		assert!(!inner.persistence_finished(&sst));
		inner.curr_view.write().mark_failed(2);
		assert!(inner.persistence_finished(&sst));
	}

	#[test]
	fn next_view_applies_the_committed_prefix() {
		let hub = Hub::new();
		let dir = TempDir::new().unwrap();
		let inner = test_inner(&hub, &dir);
		let sst = bind_three_member_view(&inner);

		// one committed leave (node 2) and one committed join (node 9)
		sst.set_change_local(0, NodeId(2));
		sst.set_change_local(1, NodeId(9));
		sst.set_joiner_ip_local(1, u32::from_be_bytes([10, 0, 0, 9]));
		sst.set_num_changes_local(2);
		sst.set_num_committed_local(2);
		sst.set_num_acked_local(2);

		let view = inner.curr_view.read();
		let next = inner.make_next_view_locked(&view, &sst).unwrap();
		assert_eq!(next.vid, 6);
		assert_eq!(next.members, vec![NodeId(1), NodeId(3), NodeId(9)]);
		assert_eq!(next.member_ips[2], "10.0.0.9");
		assert_eq!(next.joined, vec![NodeId(9)]);
		assert_eq!(next.departed, vec![NodeId(2)]);
		assert_eq!(next.my_rank, Some(0));
		assert!(next.i_know_i_am_leader);
	}
}

/// `result[new_subgroup_id][shard]` is the node that led the shard in the
/// old view (`-1` when the whole shard had failed), matched across views
/// by allocator type and position.
pub(super) fn shard_leaders_by_id(old: &View, new: &View) -> ShardLeaders {
	let mut leaders: ShardLeaders =
		vec![Vec::new(); new.subgroup_shard_views.len()];
	for (type_name, new_ids) in &new.subgroup_ids_by_type {
		let Some(old_ids) = old.subgroup_ids_by_type.get(type_name) else {
			continue;
		};
		for (subgroup_index, new_id) in new_ids.iter().enumerate() {
			let Some(old_id) = old_ids.get(subgroup_index) else {
				continue;
			};
			let num_shards =
				old.subgroup_shard_views[*old_id as usize].len();
			leaders[*new_id as usize] = (0..num_shards)
				.map(|shard| {
					old
						.rank_of_shard_leader(*old_id, shard)
						.map(|rank| old.members[rank].0 as i64)
						.unwrap_or(-1)
				})
				.collect();
		}
	}
	leaders
}

//! The six membership predicates and the triggers that implement the
//! failure-suspicion, join-admission and change-commit protocol steps.
//!
//! Every predicate compares monotonic counters across rows; none of them
//! inspects compound state, because row publishes are not atomic across
//! fields. Triggers publish an increase only after the local row is
//! consistent with it.

use {
	super::{Error, Inner},
	crate::{
		multicast::Multicast,
		sst::{Kind, StateTable},
		view::NodeId,
	},
	std::sync::Arc,
	tracing::{debug, info},
};

/// The minimum `num_acked` across all rows that have not failed; the
/// leader can commit proposals up to this point.
pub(super) fn min_acked(sst: &StateTable, failed: &[bool]) -> u32 {
	(0..sst.num_rows())
		.filter(|rank| !failed.get(*rank).copied().unwrap_or(false))
		.map(|rank| sst.num_acked(rank))
		.min()
		.unwrap_or(0)
}

/// True when the local row's un-installed change prefix already names
/// `node`.
pub(super) fn changes_contains(sst: &StateTable, node: NodeId) -> bool {
	let my_rank = sst.my_rank();
	let pending =
		(sst.num_changes(my_rank) - sst.num_installed(my_rank)) as usize;
	(0..pending).any(|index| sst.change_at(my_rank, index) == node)
}

impl Inner {
	/// Registers every membership predicate that is not currently
	/// registered on the current view's table.
	pub(super) fn register_predicates(self: &Arc<Self>) {
		let sst = {
			let view = self.curr_view.read();
			view.sst.clone().expect("epoch is bound")
		};
		self.register_predicates_on(&sst);
	}

	/// Same, against an explicit table; used during installation while the
	/// view lock is already held exclusively.
	pub(super) fn register_predicates_on(
		self: &Arc<Self>,
		sst: &Arc<StateTable>,
	) {
		let mut handles = self.handles.lock();

		if handles.suspected.is_none() {
			let weak = Arc::downgrade(self);
			let predicate = Box::new(move |sst: &StateTable| {
				let Some(inner) = weak.upgrade() else {
					return false;
				};
				let last = inner.last_suspected.lock();
				(0..sst.num_rows()).any(|rank| {
					(0..last.len()).any(|who| {
						sst.suspected(rank, who) && !last[who]
					})
				})
			});
			let weak = Arc::downgrade(self);
			let trigger = Box::new(move |sst: &StateTable| {
				if let Some(inner) = weak.upgrade() {
					inner.new_suspicion(sst);
				}
			});
			handles.suspected =
				Some(sst.predicates.insert(predicate, trigger, Kind::Recurrent));
		}

		if handles.start_join.is_none() {
			let weak = Arc::downgrade(self);
			let predicate = Box::new(move |_: &StateTable| {
				weak.upgrade().is_some_and(|inner| {
					inner.has_pending_join()
						&& inner.curr_view.read().i_am_leader()
				})
			});
			let weak = Arc::downgrade(self);
			let trigger = Box::new(move |sst: &StateTable| {
				if let Some(inner) = weak.upgrade() {
					inner.leader_start_join(sst);
				}
			});
			handles.start_join =
				Some(sst.predicates.insert(predicate, trigger, Kind::Recurrent));
		}

		if handles.reject_join.is_none() {
			let weak = Arc::downgrade(self);
			let predicate = Box::new(move |_: &StateTable| {
				weak.upgrade().is_some_and(|inner| {
					inner.has_pending_join()
						&& !inner.curr_view.read().i_am_leader()
				})
			});
			let weak = Arc::downgrade(self);
			let trigger = Box::new(move |_: &StateTable| {
				if let Some(inner) = weak.upgrade() {
					inner.redirect_join_attempt();
				}
			});
			handles.reject_join =
				Some(sst.predicates.insert(predicate, trigger, Kind::Recurrent));
		}

		if handles.change_commit.is_none() {
			let weak = Arc::downgrade(self);
			let predicate = Box::new(move |sst: &StateTable| {
				weak.upgrade().is_some_and(|inner| {
					let view = inner.curr_view.read();
					view.i_am_leader()
						&& min_acked(sst, &view.failed)
							> sst.num_committed(sst.my_rank())
				})
			});
			let weak = Arc::downgrade(self);
			let trigger = Box::new(move |sst: &StateTable| {
				if let Some(inner) = weak.upgrade() {
					inner.leader_commit_change(sst);
				}
			});
			handles.change_commit =
				Some(sst.predicates.insert(predicate, trigger, Kind::Recurrent));
		}

		if handles.leader_proposed.is_none() {
			let weak = Arc::downgrade(self);
			let predicate = Box::new(move |sst: &StateTable| {
				weak.upgrade().is_some_and(|inner| {
					let leader = inner.curr_view.read().rank_of_leader();
					sst.num_changes(leader) > sst.num_acked(sst.my_rank())
				})
			});
			let weak = Arc::downgrade(self);
			let trigger = Box::new(move |sst: &StateTable| {
				if let Some(inner) = weak.upgrade() {
					inner.acknowledge_proposed_change(sst);
				}
			});
			handles.leader_proposed =
				Some(sst.predicates.insert(predicate, trigger, Kind::Recurrent));
		}

		if handles.leader_committed.is_none() {
			let weak = Arc::downgrade(self);
			let predicate = Box::new(move |sst: &StateTable| {
				weak.upgrade().is_some_and(|inner| {
					let leader = inner.curr_view.read().rank_of_leader();
					sst.num_committed(leader) > sst.num_installed(sst.my_rank())
				})
			});
			let weak = Arc::downgrade(self);
			let trigger = Box::new(move |sst: &StateTable| {
				if let Some(inner) = weak.upgrade() {
					inner.start_meta_wedge(sst);
				}
			});
			handles.leader_committed =
				Some(sst.predicates.insert(predicate, trigger, Kind::OneTime));
		}
	}

	/// Trigger for `suspected_changed`: folds remote suspicions into the
	/// local row and hardens every new one into a failure, freezing the
	/// row, wedging the epoch, and (on the leader) proposing the eviction.
	pub(super) fn new_suspicion(self: &Arc<Self>, sst: &StateTable) {
		let mut view = self.curr_view.write();
		let my_rank = sst.my_rank();
		let folded = sst.fold_suspicions();

		for suspect in 0..view.num_members {
			if !folded[suspect] || view.failed[suspect] {
				continue;
			}
			let suspect_id = view.members[suspect];
			info!(
				vid = view.vid,
				node = %suspect_id,
				rank = suspect,
				"new suspicion hardening into a failure",
			);
			self.last_suspected.lock()[suspect] = true;

			// the minority side of a partition must not install views
			if view.num_failed >= view.num_members.div_ceil(2) {
				sst.predicates.clear();
				self.fail(&Error::PartitionedMinority);
				return;
			}

			sst.freeze(suspect);
			if let Some(multicast) = &view.multicast {
				multicast.wedge();
			}
			sst.set_wedged_local(true);
			view.mark_failed(suspect);

			if view.num_failed >= view.num_members.div_ceil(2) {
				sst.predicates.clear();
				self.fail(&Error::PartitionedMinority);
				return;
			}

			sst.publish_suspected();
			sst.publish_wedged();

			if view.i_am_leader() && !changes_contains(sst, suspect_id) {
				let next_index = (sst.num_changes(my_rank)
					- sst.num_installed(my_rank)) as usize;
				if next_index == sst.layout().dims().changes_capacity {
					sst.predicates.clear();
					self.fail(&Error::ChangesOverflow);
					return;
				}
				sst.set_change_local(next_index, suspect_id);
				sst.set_num_changes_local(sst.num_changes(my_rank) + 1);
				debug!(
					node = %suspect_id,
					proposal = sst.num_changes(my_rank),
					"leader proposed eviction of a failed member",
				);
				sst.publish_changes_block();
			}
		}
	}

	/// Trigger for `start_join` (leader only): admits one queued join
	/// attempt into the proposed set and proposes the membership change.
	pub(super) fn leader_start_join(self: &Arc<Self>, sst: &StateTable) {
		let socket = {
			let mut pending = self.pending_join_sockets.lock();
			match pending.pop_front() {
				Some(socket) => socket,
				None => return,
			}
		};
		match self.receive_join(sst, &socket) {
			Ok(true) => {
				self.proposed_join_sockets.lock().push_back(socket);
			}
			Ok(false) => {
				// rejected (id collision); the socket is simply dropped
			}
			Err(e) => {
				// a joiner dying mid-handshake is the joiner's failure
				debug!(error = %e, "join admission aborted");
			}
		}
	}

	/// Trigger for `reject_join` (non-leader): answers a queued join
	/// attempt with a redirect to the current leader.
	pub(super) fn redirect_join_attempt(self: &Arc<Self>) {
		let socket = {
			let mut pending = self.pending_join_sockets.lock();
			match pending.pop_front() {
				Some(socket) => socket,
				None => return,
			}
		};
		let (leader_ip, my_id) = {
			let view = self.curr_view.read();
			(view.member_ips[view.rank_of_leader()].clone(), self.my_id)
		};
		let redirect = || -> Result<(), Error> {
			let joiner = socket.read_node_id()?;
			debug!(joiner = %joiner, leader = %leader_ip, "redirecting join attempt");
			super::protocol::JoinResponse {
				code: super::protocol::JoinResponseCode::LeaderRedirect,
				leader_id: my_id,
			}
			.write(&socket)?;
			socket.write_frame(leader_ip.as_bytes())?;
			Ok(())
		};
		if let Err(e) = redirect() {
			debug!(error = %e, "failed to redirect a join attempt");
		}
	}

	/// Trigger for `change_commit_ready` (leader only): commits every
	/// proposal acknowledged by all live members.
	pub(super) fn leader_commit_change(self: &Arc<Self>, sst: &StateTable) {
		let committed = {
			let view = self.curr_view.read();
			min_acked(sst, &view.failed)
		};
		debug!(committed, "leader committing acknowledged changes");
		sst.set_num_committed_local(committed);
		sst.publish_num_committed();
	}

	/// Trigger for `leader_proposed_change`: echoes the leader's proposal
	/// state, acknowledges it and wedges the current epoch.
	pub(super) fn acknowledge_proposed_change(self: &Arc<Self>, sst: &StateTable) {
		let view = self.curr_view.read();
		let leader = view.rank_of_leader();
		let my_rank = sst.my_rank();
		debug!(
			proposal = sst.num_changes(leader),
			"acknowledging proposed change",
		);
		if my_rank != leader {
			sst.copy_changes_from(leader);
		}
		sst.set_num_acked_local(sst.num_changes(my_rank));
		sst.publish_changes_block();
		view.wedge();
	}

	/// Unregisters the join-admission and change predicates, closing this
	/// epoch to new proposals. Tolerates repeats.
	pub(super) fn drop_join_and_commit_predicates(&self, sst: &StateTable) {
		let mut handles = self.handles.lock();
		let handles = &mut *handles;
		for slot in [
			&mut handles.start_join,
			&mut handles.reject_join,
			&mut handles.change_commit,
			&mut handles.leader_proposed,
		] {
			if let Some(handle) = slot.take() {
				sst.predicates.remove(handle);
			}
		}
	}

	pub(super) fn drop_all_predicates(&self, sst: &StateTable) {
		self.drop_join_and_commit_predicates(sst);
		let mut handles = self.handles.lock();
		let handles = &mut *handles;
		for slot in [&mut handles.leader_committed, &mut handles.suspected] {
			if let Some(handle) = slot.take() {
				sst.predicates.remove(handle);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			sst::{Dimensions, memory::Hub},
			view::NodeId,
		},
		core::time::Duration,
		std::sync::Arc,
	};

	fn table(members: &[NodeId], me: NodeId) -> Arc<StateTable> {
		StateTable::new(
			&*Hub::new(),
			0,
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

	#[test]
	fn min_acked_ignores_failed_rows() {
		let members = [NodeId(1), NodeId(2), NodeId(3)];
		let sst = table(&members, NodeId(1));
		sst.set_num_acked_local(5);
		// remote rows still read 0; a failed row must not hold commits back
		assert_eq!(min_acked(&sst, &[false, false, false]), 0);
		assert_eq!(min_acked(&sst, &[false, true, true]), 5);
	}

	#[test]
	fn changes_contains_scans_only_the_pending_prefix() {
		let members = [NodeId(1), NodeId(2)];
		let sst = table(&members, NodeId(1));
		sst.set_change_local(0, NodeId(7));
		sst.set_change_local(1, NodeId(8));
		sst.set_num_changes_local(1);
		assert!(changes_contains(&sst, NodeId(7)));
		// entry 1 is beyond num_changes and must be invisible
		assert!(!changes_contains(&sst, NodeId(8)));
	}
}

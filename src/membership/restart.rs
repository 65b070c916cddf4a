//! Total restart: the surviving leader reconstitutes a quorum of the last
//! persisted view, adopts the newest state any rejoiner brings, and
//! installs a fresh view that unfails the returners and drops the
//! absentees.

use {
	super::{
		Error, Inner,
		epoch::shard_leaders_by_id,
		protocol::{self, JoinResponse, JoinResponseCode},
	},
	crate::{
		layout::{self, Provisioned},
		transport::Socket,
		view::{NodeId, View, wire},
	},
	std::{
		collections::{BTreeMap, BTreeSet},
		time::Instant,
	},
	tracing::{debug, info, warn},
};

impl Inner {
	/// The restart leader's accept loop. Returns the provisioning of the
	/// restart view, which is installed as the current view on return.
	pub(super) fn await_rejoining_nodes(&self) -> Result<Provisioned, Error> {
		let mut waiting: BTreeMap<NodeId, Socket> = BTreeMap::new();
		let mut rejoined: BTreeSet<NodeId> = BTreeSet::from([self.my_id]);
		let mut checked: BTreeSet<NodeId> = BTreeSet::new();
		let mut last_known: BTreeSet<NodeId> = {
			let view = self.curr_view.read();
			view.members.iter().copied().collect()
		};
		let mut restart: Option<(View, Provisioned)> = None;
		let mut ready = false;
		let mut time_remaining = self.config.restart_timeout;

		while !time_remaining.is_zero() {
			let accept_started = Instant::now();
			let client = self.listener.try_accept(time_remaining)?;
			time_remaining =
				time_remaining.saturating_sub(accept_started.elapsed());

			let Some(socket) = client else {
				if !ready {
					// no quorum yet; the timeout only bounds the wait for
					// stragglers once a restart is possible
					time_remaining = self.config.restart_timeout;
				}
				continue;
			};

			let joiner = match self.admit_rejoiner(&socket, &mut last_known) {
				Ok(joiner) => joiner,
				Err(e) => {
					debug!(error = %e, "rejoiner dropped during admission");
					continue;
				}
			};
			info!(node = %joiner, "node rejoined for total restart");
			rejoined.insert(joiner);
			waiting.insert(joiner, socket);

			let quorum: BTreeSet<NodeId> =
				rejoined.intersection(&last_known).copied().collect();
			if quorum.len() >= last_known.len() / 2 + 1 {
				let candidate =
					self.update_curr_and_next_restart_view(&waiting, &rejoined)?;
				ready = candidate.0.is_adequately_provisioned;
				restart = Some(candidate);
			}

			if ready {
				// a silent failure among the queued rejoiners would stall
				// the whole install; heartbeat everything not yet checked
				let unchecked: Vec<NodeId> = waiting
					.keys()
					.filter(|id| !checked.contains(id))
					.copied()
					.collect();
				for id in unchecked {
					match waiting[&id].exchange_ids(self.my_id) {
						Ok(_) => {
							checked.insert(id);
						}
						Err(_) => {
							info!(node = %id, "rejoiner died while waiting");
							waiting.remove(&id);
							rejoined.remove(&id);
							ready = false;
							break;
						}
					}
				}
			}

			// once every last-known member is back there is nothing to
			// wait for
			let quorum: BTreeSet<NodeId> =
				rejoined.intersection(&last_known).copied().collect();
			if ready && quorum.len() == last_known.len() {
				break;
			}
		}

		let (restart_view, provisioned) = match restart {
			Some(candidate) if ready => candidate,
			_ => {
				return Err(Error::Io(std::io::Error::new(
					std::io::ErrorKind::TimedOut,
					"restart window closed without an adequate quorum",
				)));
			}
		};

		let (view_bytes, shard_leaders) = {
			let mut view = self.curr_view.write();
			let leaders = shard_leaders_by_id(&view, &restart_view);
			info!(
				old_vid = view.vid,
				new_vid = restart_view.vid,
				members = ?restart_view.members,
				"restart quorum reached, installing the recovery view",
			);
			*view = restart_view;
			(wire::encode_full(&view), leaders)
		};

		let trims: Vec<_> = self.trims.lock().values().cloned().collect();
		let params = self.params.lock().clone();
		for (joiner, socket) in waiting {
			let send = || -> Result<(), Error> {
				debug!(node = %joiner, "sending the post-recovery view");
				socket.write_frame(&view_bytes)?;
				protocol::write_object(&socket, &params)?;
				protocol::write_trims(&socket, trims.iter())?;
				protocol::write_shard_leaders(&socket, &shard_leaders)?;
				Ok(())
			};
			if let Err(e) = send() {
				// too late to rebuild; the member will be evicted through
				// the ordinary failure path after the install
				warn!(node = %joiner, error = %e, "recovery view send failed");
			}
		}
		*self.old_shard_leaders.lock() = shard_leaders;
		Ok(provisioned)
	}

	/// Handshakes one rejoining node: announce restart mode, receive its
	/// persisted view, and adopt that view (and its trims) when it is
	/// newer than anything seen so far.
	fn admit_rejoiner(
		&self,
		socket: &Socket,
		last_known: &mut BTreeSet<NodeId>,
	) -> Result<NodeId, Error> {
		let joiner = socket.read_node_id()?;
		JoinResponse {
			code: JoinResponseCode::TotalRestart,
			leader_id: self.my_id,
		}
		.write(socket)?;

		let view_bytes = socket.read_frame()?;
		let client_view = wire::decode_full(&view_bytes, self.my_id)?;
		let newer = client_view.vid > self.curr_view.read().vid;
		let trims = protocol::read_trims(socket)?;

		if newer {
			info!(
				node = %joiner,
				vid = client_view.vid,
				"rejoiner has a newer persisted view, adopting it",
			);
			*last_known = client_view.members.iter().copied().collect();
			*self.curr_view.write() = client_view;
			let mut stored = self.trims.lock();
			stored.clear();
			for trim in trims {
				stored.insert(trim.subgroup_id, trim);
			}
		}
		Ok(joiner)
	}

	/// Folds the rejoined set into the last known view — unfailing
	/// returners, failing absentees — and computes the candidate restart
	/// view with fresh nodes appended.
	fn update_curr_and_next_restart_view(
		&self,
		waiting: &BTreeMap<NodeId, Socket>,
		rejoined: &BTreeSet<NodeId>,
	) -> Result<(View, Provisioned), Error> {
		let mut view = self.curr_view.write();

		let mut fresh: Vec<(NodeId, String)> = Vec::new();
		for (joiner, socket) in waiting {
			match view.rank_of(*joiner) {
				None => fresh.push((*joiner, socket.remote_ip())),
				Some(rank) => {
					if view.failed[rank] {
						view.failed[rank] = false;
						view.num_failed -= 1;
					}
				}
			}
		}
		for rank in 0..view.num_members {
			if !rejoined.contains(&view.members[rank]) && !view.failed[rank] {
				view.failed[rank] = true;
				view.num_failed += 1;
			}
		}

		let mut candidate = make_restart_view(&view, fresh)?;
		let provisioned =
			layout::provision(&self.spec, Some(&*view), &mut candidate);
		Ok((candidate, provisioned))
	}
}

/// The restart flavor of next-view computation: every member still marked
/// failed is dropped, every fresh rejoiner is appended at the tail.
fn make_restart_view(
	view: &View,
	fresh: Vec<(NodeId, String)>,
) -> Result<View, Error> {
	let leave_ranks: BTreeSet<usize> = (0..view.num_members)
		.filter(|rank| view.failed[*rank])
		.collect();

	let next_num = view.num_members - leave_ranks.len() + fresh.len();
	let mut members = vec![NodeId(0); next_num];
	let mut member_ips = vec![String::new(); next_num];
	let mut joined = Vec::with_capacity(fresh.len());
	let mut departed = Vec::with_capacity(leave_ranks.len());

	for (index, (joiner, ip)) in fresh.into_iter().enumerate() {
		let rank = view.num_members - leave_ranks.len() + index;
		debug!(joiner = %joiner, rank, "restart view adds a fresh member");
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

	let mut new_rank = 0;
	for old_rank in 0..view.num_members {
		if leave_ranks.contains(&old_rank) {
			continue;
		}
		members[new_rank] = view.members[old_rank];
		member_ips[new_rank] = view.member_ips[old_rank].clone();
		new_rank += 1;
	}

	// an adopted view from a rejoiner may not even contain this node
	let Some(my_id) = view.my_rank.map(|rank| view.members[rank]) else {
		return Err(Error::SelfExcluded);
	};
	let my_new_rank = members.iter().position(|m| *m == my_id);
	if my_new_rank.is_none() {
		// the recovery leader cannot exclude itself from the view it is
		// computing
		return Err(Error::SelfExcluded);
	}

	let mut next = View::new(
		view.vid + 1,
		members,
		member_ips,
		vec![false; next_num],
		joined,
		departed,
		my_new_rank,
		next_unassigned_rank,
	);
	next.i_know_i_am_leader = view.i_know_i_am_leader;
	Ok(next)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn view(members: &[u32], failed: &[bool], my_rank: usize) -> View {
		let ips = members.iter().map(|m| format!("10.0.0.{m}")).collect();
		View::new(
			4,
			members.iter().copied().map(NodeId).collect(),
			ips,
			failed.to_vec(),
			Vec::new(),
			Vec::new(),
			Some(my_rank),
			0,
		)
	}

	#[test]
	fn restart_view_drops_absentees_and_bumps_vid() {
		// five members, nodes 4 and 5 never came back
		let v = view(
			&[1, 2, 3, 4, 5],
			&[false, false, false, true, true],
			0,
		);
		let next = make_restart_view(&v, Vec::new()).unwrap();
		assert_eq!(next.vid, 5);
		assert_eq!(
			next.members,
			vec![NodeId(1), NodeId(2), NodeId(3)]
		);
		assert_eq!(next.failed, vec![false, false, false]);
		assert_eq!(next.departed, vec![NodeId(4), NodeId(5)]);
		assert!(next.joined.is_empty());
		assert_eq!(next.my_rank, Some(0));
	}

	#[test]
	fn restart_view_appends_fresh_nodes_at_the_tail() {
		let v = view(&[1, 2, 3], &[false, true, false], 0);
		let next = make_restart_view(
			&v,
			vec![(NodeId(9), "10.0.0.9".into())],
		)
		.unwrap();
		assert_eq!(next.members, vec![NodeId(1), NodeId(3), NodeId(9)]);
		assert_eq!(next.joined, vec![NodeId(9)]);
		assert_eq!(next.departed, vec![NodeId(2)]);
		assert_eq!(next.member_ips[2], "10.0.0.9");
	}

	#[test]
	fn excluded_recovery_leader_is_fatal() {
		let v = view(&[1, 2], &[true, false], 0);
		let result = make_restart_view(&v, Vec::new());
		assert!(matches!(result, Err(Error::SelfExcluded)));
	}
}

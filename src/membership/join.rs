//! Join admission: the founding leader's bootstrap loop, the running
//! leader's admission trigger, and the joiner side of the configuration
//! exchange.

use {
	super::{
		Error, Inner,
		protocol::{
			self, JoinResponse, JoinResponseCode, ShardLeaders,
		},
	},
	crate::{
		config::GroupParams,
		layout::{self, Provisioned},
		persistence::{RaggedTrim, Storage},
		primitives::pack_ipv4,
		sst::StateTable,
		transport::Socket,
		view::{NodeId, View, wire},
	},
	std::io,
	tracing::{debug, info, warn},
};

/// Everything the joiner learns from the leader before it can bind its
/// first epoch.
pub(super) struct JoinOutcome {
	pub view: View,
	pub params: GroupParams,
	pub trims: Vec<RaggedTrim>,
	pub shard_leaders: ShardLeaders,
	pub restart: bool,
}

impl Inner {
	/// The founding leader's bootstrap loop: accumulate joiners until the
	/// layout is adequate, heartbeat-check the queue, rebuild the
	/// candidate (vid stays 0) whenever a queued joiner died, and finally
	/// send everyone the initial view.
	pub(super) fn await_first_view(&self) -> Result<Provisioned, Error> {
		let my_ip = {
			let view = self.curr_view.read();
			view.member_ips[0].clone()
		};
		let mut waiting: Vec<(NodeId, String, Socket)> = Vec::new();
		let mut checked = 0usize;

		let provisioned = loop {
			let mut provisioned = {
				let mut view = self.curr_view.write();
				layout::provision(&self.spec, None, &mut view)
			};

			while !self.curr_view.read().is_adequately_provisioned {
				let socket = self.listener.accept()?;
				let joiner_id = match socket.read_node_id() {
					Ok(id) => id,
					Err(_) => continue, // died before identifying itself
				};
				let taken = joiner_id == self.my_id
					|| waiting.iter().any(|(id, _, _)| *id == joiner_id);
				if taken {
					warn!(
						joiner = %joiner_id,
						"rejecting bootstrap join with an id already in use",
					);
					let _ = JoinResponse {
						code: JoinResponseCode::IdInUse,
						leader_id: self.my_id,
					}
					.write(&socket);
					continue;
				}
				if (JoinResponse {
					code: JoinResponseCode::Ok,
					leader_id: self.my_id,
				})
				.write(&socket)
				.is_err()
				{
					continue;
				}
				info!(joiner = %joiner_id, "queued a bootstrap joiner");
				waiting.push((joiner_id, socket.remote_ip(), socket));
				provisioned =
					self.rebuild_bootstrap_view(&my_ip, &waiting);
			}

			// enough joiners are queued for an adequate view; make sure
			// none of them died while waiting
			let mut lost = None;
			for index in checked..waiting.len() {
				match waiting[index].2.exchange_ids(self.my_id) {
					Ok(_) => checked = index + 1,
					Err(_) => {
						lost = Some(index);
						break;
					}
				}
			}
			match lost {
				Some(index) => {
					let (dead, _, _) = waiting.remove(index);
					info!(joiner = %dead, "bootstrap joiner died while waiting");
					self.rebuild_bootstrap_view(&my_ip, &waiting);
					// the loop re-tests adequacy and accepts replacements
				}
				None => break provisioned,
			}
		};

		// every queued joiner is alive and the view is adequate; ship it
		let (view_bytes, params) = {
			let view = self.curr_view.read();
			(wire::encode_streamlined(&view), self.params.lock().clone())
		};
		for (joiner_id, _, socket) in waiting.drain(..) {
			let send = || -> Result<(), Error> {
				socket.write_frame(&view_bytes)?;
				protocol::write_object(&socket, &params)?;
				protocol::write_shard_leaders(&socket, &ShardLeaders::new())?;
				Ok(())
			};
			if let Err(e) = send() {
				// too late to rebuild: the member will be suspected and
				// evicted through the ordinary failure path
				warn!(joiner = %joiner_id, error = %e, "initial view send failed");
			}
		}
		Ok(provisioned)
	}

	/// Replaces the bootstrap candidate with vid 0 and the given joiner
	/// queue, and re-provisions it.
	fn rebuild_bootstrap_view(
		&self,
		my_ip: &str,
		waiting: &[(NodeId, String, Socket)],
	) -> Provisioned {
		let mut members = vec![self.my_id];
		let mut ips = vec![my_ip.to_string()];
		let mut joined = Vec::new();
		for (id, ip, _) in waiting {
			members.push(*id);
			ips.push(ip.clone());
			joined.push(*id);
		}
		let count = members.len();
		let mut candidate = View::new(
			0,
			members,
			ips,
			vec![false; count],
			joined,
			Vec::new(),
			Some(0),
			0,
		);
		candidate.i_know_i_am_leader = true;
		let provisioned = {
			let mut view = self.curr_view.write();
			let provisioned =
				layout::provision(&self.spec, None, &mut candidate);
			*view = candidate;
			provisioned
		};
		provisioned
	}

	/// Leader-side admission of one queued join attempt. Returns
	/// `Ok(true)` when a change was proposed and the socket should be kept
	/// for the install hand-off, `Ok(false)` when the joiner was rejected.
	pub(super) fn receive_join(
		self: &std::sync::Arc<Self>,
		sst: &StateTable,
		socket: &Socket,
	) -> Result<bool, Error> {
		let my_rank = sst.my_rank();
		let capacity = sst.layout().dims().changes_capacity;
		if (sst.num_changes(my_rank) - sst.num_committed(my_rank)) as usize
			== capacity
		{
			sst.predicates.clear();
			self.fail(&Error::ChangesOverflow);
			return Err(Error::ChangesOverflow);
		}

		let joiner_id = socket.read_node_id()?;
		let view = self.curr_view.read();
		if view.rank_of(joiner_id).is_some() {
			warn!(
				joiner = %joiner_id,
				remote = %socket.remote_ip(),
				"joining node announced an id that is already in the view",
			);
			JoinResponse {
				code: JoinResponseCode::IdInUse,
				leader_id: self.my_id,
			}
			.write(socket)?;
			return Ok(false);
		}
		JoinResponse {
			code: JoinResponseCode::Ok,
			leader_id: self.my_id,
		}
		.write(socket)?;

		let joiner_ip = socket.remote_ip();
		let packed = pack_ipv4(&joiner_ip).ok_or_else(|| {
			io::Error::new(
				io::ErrorKind::InvalidData,
				format!("joiner address {joiner_ip} is not IPv4"),
			)
		})?;

		info!(joiner = %joiner_id, ip = %joiner_ip, "proposing join");
		let next_change =
			(sst.num_changes(my_rank) - sst.num_installed(my_rank)) as usize;
		sst.set_change_local(next_change, joiner_id);
		sst.set_joiner_ip_local(next_change, packed);
		sst.set_num_changes_local(sst.num_changes(my_rank) + 1);

		debug!(vid = view.vid, "wedging the current view for the join");
		view.wedge();
		sst.publish_changes_block();
		Ok(true)
	}

	/// Sends one committed joiner the new view and the group parameters,
	/// preceded by the heartbeat exchange that proves the joiner survived
	/// admission.
	pub(super) fn commit_join(
		&self,
		next_view: &View,
		socket: &Socket,
	) -> Result<(), Error> {
		socket.exchange_ids(self.my_id)?;
		debug!(vid = next_view.vid, "sending the new view to a joiner");
		socket.write_frame(&wire::encode_streamlined(next_view))?;
		protocol::write_object(socket, &self.params.lock().clone())?;
		Ok(())
	}

	/// The joiner side of the configuration exchange, redirect loop
	/// included.
	pub(super) fn receive_configuration(
		&self,
		leader_addr: &str,
	) -> Result<JoinOutcome, Error> {
		let mut socket =
			Socket::connect_addr(leader_addr, self.config.gms_port)?;
		let mut redirects = 0usize;
		let response = loop {
			socket.write_node_id(self.my_id)?;
			let response = JoinResponse::read(&socket)?;
			match response.code {
				JoinResponseCode::Ok | JoinResponseCode::TotalRestart => {
					break response;
				}
				JoinResponseCode::IdInUse => {
					return Err(Error::IdCollision(self.my_id));
				}
				JoinResponseCode::LeaderRedirect => {
					let addr_bytes = socket.read_frame()?;
					let addr =
						String::from_utf8_lossy(&addr_bytes).into_owned();
					redirects += 1;
					if redirects > self.config.max_redirects {
						return Err(Error::RedirectLoop(
							self.config.max_redirects,
						));
					}
					info!(leader = %addr, "redirected to the group leader");
					socket = Socket::connect(&addr, self.config.gms_port)?;
				}
			}
		};

		let restart = response.code == JoinResponseCode::TotalRestart;
		if restart {
			self.upload_restart_state(&socket)?;
		}

		// heartbeat: prove we are still alive before the leader commits
		// resources to us
		socket.exchange_ids(self.my_id)?;

		let view_bytes = socket.read_frame()?;
		let view = if restart {
			wire::decode_full(&view_bytes, self.my_id)?
		} else {
			wire::decode_streamlined(&view_bytes, self.my_id)?
		};
		let params: GroupParams = protocol::read_object(&socket)?;
		let trims = if restart {
			protocol::read_trims(&socket)?
		} else {
			Vec::new()
		};
		let shard_leaders = protocol::read_shard_leaders(&socket)?;

		info!(
			vid = view.vid,
			members = view.num_members,
			restart,
			"received group configuration",
		);
		Ok(JoinOutcome {
			view,
			params,
			trims,
			shard_leaders,
			restart,
		})
	}

	/// Uploads this node's persisted view and ragged trims to a restart
	/// leader. A node with no persisted state presents itself as brand
	/// new.
	fn upload_restart_state(&self, socket: &Socket) -> Result<(), Error> {
		match self.storage.load_bytes(Storage::view_slot())? {
			Some(view_bytes) => {
				let persisted = wire::decode_full(&view_bytes, self.my_id)?;
				debug!(
					vid = persisted.vid,
					"uploading persisted view to the restart leader",
				);
				socket.write_frame(&wire::encode_full(&persisted))?;
				let mut trims = Vec::new();
				for &subgroup_id in persisted.my_subgroups.keys() {
					match self.storage.load_ragged_trim(subgroup_id)? {
						Some(trim) => trims.push(trim),
						None => {
							return Err(Error::MissingRaggedTrim(subgroup_id));
						}
					}
				}
				protocol::write_trims(socket, trims.iter())?;
			}
			None => {
				let fresh = View::initial(self.my_id, String::new());
				socket.write_frame(&wire::encode_full(&fresh))?;
				protocol::write_trims(socket, core::iter::empty())?;
			}
		}
		Ok(())
	}

	/// Loads the ragged trims of every subgroup this node hosts; restart
	/// cannot proceed with partial logs.
	pub(super) fn load_ragged_trims(&self) -> Result<(), Error> {
		let subgroups: Vec<_> = {
			let view = self.curr_view.read();
			view.my_subgroups.keys().copied().collect()
		};
		let mut trims = self.trims.lock();
		for subgroup_id in subgroups {
			match self.storage.load_ragged_trim(subgroup_id)? {
				Some(trim) => {
					trims.insert(subgroup_id, trim);
				}
				None => return Err(Error::MissingRaggedTrim(subgroup_id)),
			}
		}
		Ok(())
	}
}

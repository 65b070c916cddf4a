//! The view manager: join admission, failure suspicion aggregation, change
//! proposal and commit, epoch termination and view installation, and
//! total-restart recovery.
//!
//! One long-lived listener thread feeds join attempts into a queue; a
//! cleanup thread retires old views off the critical path; the state
//! table's predicate thread drives everything else by scanning the six
//! registered predicates and firing their triggers.

mod epoch;
mod error;
mod join;
mod predicates;
mod protocol;
mod restart;

pub use error::Error;

use {
	crate::{
		config::{Config, GroupParams},
		layout::{self, Provisioned, SubgroupSpec},
		multicast::{Multicast, WindowMulticast, window::DeliveryFn},
		persistence::{PersistentObject, RaggedTrim, Storage},
		sst::{Dimensions, Fabric, Handle, StateTable},
		transport::{Listener, Mesh, Socket},
		view::{NodeId, SubgroupId, View, wire},
	},
	parking_lot::{Condvar, Mutex, RwLock},
	std::{
		collections::{BTreeMap, VecDeque},
		sync::{
			Arc,
			atomic::{AtomicBool, Ordering},
		},
		thread::{self, JoinHandle},
		time::{Duration, Instant},
	},
	tracing::{debug, error, info, warn},
};

/// Invoked synchronously with every installed view, under the shared view
/// lock. Upcalls must not call back into the manager.
pub type ViewUpcall = Box<dyn Fn(&View) + Send + Sync>;

/// Handles of the registered membership predicates.
#[derive(Default)]
struct Handles {
	suspected: Option<Handle>,
	start_join: Option<Handle>,
	reject_join: Option<Handle>,
	change_commit: Option<Handle>,
	leader_proposed: Option<Handle>,
	leader_committed: Option<Handle>,
}

pub(crate) struct Inner {
	config: Config,
	/// The group-wide parameters every member must agree on; a joiner
	/// adopts the leader's copy, since row layouts are computed from them.
	params: Mutex<GroupParams>,
	my_id: NodeId,
	fabric: Arc<dyn Fabric>,
	spec: SubgroupSpec,
	storage: Storage,
	delivery: DeliveryFn,

	/// `view_mutex`: shared for every public read path, exclusive around
	/// the `curr_view`/`next_view` swap.
	curr_view: RwLock<View>,
	next_view: Mutex<Option<View>>,
	next_provision: Mutex<Provisioned>,

	/// Bumped after every install; `send` suspends on it while wedged.
	install_epoch: Mutex<u64>,
	install_cv: Condvar,

	listener: Listener,
	gms_port: u16,
	mesh: Option<Mesh>,

	pending_join_sockets: Mutex<VecDeque<Socket>>,
	proposed_join_sockets: Mutex<VecDeque<Socket>>,

	old_views: Mutex<VecDeque<View>>,
	old_views_cv: Condvar,

	last_suspected: Mutex<Vec<bool>>,
	handles: Mutex<Handles>,
	upcalls: Mutex<Vec<ViewUpcall>>,
	objects: Mutex<BTreeMap<SubgroupId, Box<dyn PersistentObject>>>,
	trims: Mutex<BTreeMap<SubgroupId, RaggedTrim>>,
	old_shard_leaders: Mutex<protocol::ShardLeaders>,

	thread_shutdown: AtomicBool,
	fatal: Mutex<Option<String>>,
	threads: Mutex<Vec<JoinHandle<()>>>,
}

/// The public handle to the membership core.
pub struct ViewManager {
	inner: Arc<Inner>,
}

impl ViewManager {
	/// Starts a group as its founding leader, or — when a persisted view
	/// slot exists in the configured storage directory — coordinates a
	/// total restart of the previous group.
	pub fn start_group(
		config: Config,
		my_id: NodeId,
		my_ip: &str,
		spec: SubgroupSpec,
		fabric: Arc<dyn Fabric>,
		delivery: DeliveryFn,
	) -> Result<Self, Error> {
		let storage = Storage::new(config.storage_dir.clone());
		let saved_view = storage.load_bytes(Storage::view_slot())?;

		let inner = Inner::bootstrap(config, my_id, spec, fabric, delivery)?;

		let provisioned = match saved_view {
			Some(bytes) => {
				let persisted = wire::decode_full(&bytes, my_id)?;
				info!(
					node = %my_id,
					vid = persisted.vid,
					"found a persisted view on disk, attempting total restart",
				);
				*inner.curr_view.write() = persisted;
				inner.load_ragged_trims()?;
				inner.await_rejoining_nodes()?
			}
			None => {
				*inner.curr_view.write() =
					View::initial(my_id, my_ip.to_string());
				inner.await_first_view()?
			}
		};

		inner.persist_current_view()?;
		inner.bind_epoch(provisioned)?;
		inner.finish_setup()?;
		Ok(Self { inner })
	}

	/// Joins an existing group through any member. Redirects to the
	/// current leader are followed up to the configured cap; a total
	/// restart in progress is joined transparently.
	pub fn join_group(
		config: Config,
		my_id: NodeId,
		leader_addr: &str,
		spec: SubgroupSpec,
		fabric: Arc<dyn Fabric>,
		delivery: DeliveryFn,
	) -> Result<Self, Error> {
		let inner = Inner::bootstrap(config, my_id, spec, fabric, delivery)?;
		let outcome = inner.receive_configuration(leader_addr)?;
		*inner.params.lock() = outcome.params.clone();

		let provisioned = if outcome.restart {
			*inner.trims.lock() = outcome
				.trims
				.into_iter()
				.map(|trim| (trim.subgroup_id, trim))
				.collect();
			let derived = layout::derive_settings(&outcome.view);
			*inner.curr_view.write() = outcome.view;
			derived
		} else {
			let mut view = outcome.view;
			let provisioned =
				layout::provision(&inner.spec, None, &mut view);
			*inner.curr_view.write() = view;
			provisioned
		};
		*inner.old_shard_leaders.lock() = outcome.shard_leaders;

		inner.persist_current_view()?;
		inner.bind_epoch(provisioned)?;
		inner.finish_setup()?;
		Ok(Self { inner })
	}

	/// Registers a replicated object for a subgroup. Must be called before
	/// [`start`](Self::start) so restart truncation and object transfer
	/// can find it.
	pub fn register_object(
		&self,
		subgroup: SubgroupId,
		object: Box<dyn PersistentObject>,
	) {
		self.inner.objects.lock().insert(subgroup, object);
	}

	/// Registers an upcall invoked with every installed view.
	pub fn add_view_upcall(&self, upcall: ViewUpcall) {
		self.inner.upcalls.lock().push(upcall);
	}

	/// Completes startup: applies any recovered ragged trims to the
	/// registered objects, exchanges object state with restarted or newly
	/// joined members, fires the initial view upcall and starts predicate
	/// evaluation.
	pub fn start(&self) -> Result<(), Error> {
		let inner = &self.inner;
		let trims: Vec<RaggedTrim> =
			inner.trims.lock().values().cloned().collect();
		if !trims.is_empty() {
			inner.truncate_persistent_logs(&trims)?;
		}
		{
			let view = inner.curr_view.read();
			let leaders = inner.old_shard_leaders.lock().clone();
			inner.refresh_mesh(&view);
			inner.receive_objects(&view, &leaders);
			inner.send_objects_to_new_members(&view, &leaders);
			for upcall in inner.upcalls.lock().iter() {
				upcall(&view);
			}
			if let Some(sst) = &view.sst {
				sst.start_predicate_evaluation();
			}
		}
		inner.trims.lock().clear();
		inner.old_shard_leaders.lock().clear();
		Ok(())
	}
}

/// Datapath and introspection surface.
impl ViewManager {
	pub fn my_id(&self) -> NodeId {
		self.inner.my_id
	}

	/// The port join attempts should be directed to.
	pub fn gms_port(&self) -> u16 {
		self.inner.gms_port
	}

	/// Reports a suspected failure observed by the local failure detector
	/// (or the application). The suspicion is published and hardens into a
	/// membership change once the group converges on it.
	pub fn report_failure(&self, who: NodeId) -> Result<(), Error> {
		self.inner.check_fatal()?;
		let view = self.inner.curr_view.read();
		let Some(rank) = view.rank_of(who) else {
			warn!(node = %who, "failure reported for a non-member");
			return Ok(());
		};
		let Some(sst) = &view.sst else {
			return Ok(());
		};
		debug!(node = %who, rank, "marking local suspicion");
		sst.set_suspected_local(rank, true);

		let suspected_count = (0..view.num_members)
			.filter(|r| sst.suspected(sst.my_rank(), *r))
			.count();
		if suspected_count >= view.num_members.div_ceil(2) {
			drop(view);
			self.inner.fail(&Error::PartitionedMinority);
			return Err(Error::PartitionedMinority);
		}
		sst.publish_suspected();
		Ok(())
	}

	/// Cleanly leaves the group: the node marks itself suspected so the
	/// survivors evict it through the ordinary failure path.
	pub fn leave(&self) -> Result<(), Error> {
		self.inner.check_fatal()?;
		{
			let view = self.inner.curr_view.read();
			info!(vid = view.vid, "leaving the group");
			if let Some(multicast) = &view.multicast {
				multicast.wedge();
			}
			if let (Some(sst), Some(my_rank)) = (&view.sst, view.my_rank) {
				sst.predicates.clear();
				sst.set_suspected_local(my_rank, true);
				sst.publish_suspected();
			}
		}
		self.inner.thread_shutdown.store(true, Ordering::Release);
		Ok(())
	}

	/// Submits a payload for total-order multicast in `subgroup`,
	/// suspending while a view change has the datapath wedged.
	pub fn send(&self, subgroup: SubgroupId, payload: &[u8]) -> Result<(), Error> {
		loop {
			self.inner.check_fatal()?;
			if self.inner.thread_shutdown.load(Ordering::Acquire) {
				return Err(Error::Poisoned("shutting down".into()));
			}
			{
				let view = self.inner.curr_view.read();
				if let Some(multicast) = &view.multicast {
					if multicast.send(subgroup, payload) {
						return Ok(());
					}
				}
			}
			// wedged or window-blocked: wait for the next install (or a
			// short tick, for the window case)
			let mut epoch = self.inner.install_epoch.lock();
			self
				.inner
				.install_cv
				.wait_for(&mut epoch, Duration::from_millis(10));
		}
	}

	pub fn get_members(&self) -> Vec<NodeId> {
		self.inner.curr_view.read().members.clone()
	}

	/// Runs `f` against the current view under the shared lock.
	pub fn with_current_view<R>(&self, f: impl FnOnce(&View) -> R) -> R {
		f(&self.inner.curr_view.read())
	}

	/// Barrier over the live members of the current view.
	pub fn barrier_sync(&self) -> Result<(), Error> {
		self.inner.check_fatal()?;
		let view = self.inner.curr_view.read();
		if let Some(sst) = &view.sst {
			sst.sync_with_members();
		}
		Ok(())
	}

	pub fn compute_global_stability_frontier(&self, subgroup: SubgroupId) -> u64 {
		let view = self.inner.curr_view.read();
		view
			.multicast
			.as_ref()
			.map(|mc| mc.compute_global_stability_frontier(subgroup))
			.unwrap_or_default()
	}

	/// The fatal error that poisoned this manager, if any.
	pub fn fatal_error(&self) -> Option<String> {
		self.inner.fatal.lock().clone()
	}
}

impl Drop for ViewManager {
	fn drop(&mut self) {
		self.inner.shutdown();
	}
}

impl Inner {
	fn bootstrap(
		config: Config,
		my_id: NodeId,
		spec: SubgroupSpec,
		fabric: Arc<dyn Fabric>,
		delivery: DeliveryFn,
	) -> Result<Arc<Self>, Error> {
		let listener = Listener::bind(config.gms_port)?;
		let gms_port = listener.local_port()?;
		let mesh = match Mesh::new(my_id, config.object_port) {
			Ok(mesh) => Some(mesh),
			Err(e) => {
				warn!(
					error = %e,
					"object mesh unavailable; replicated-object transfer disabled",
				);
				None
			}
		};
		let storage = Storage::new(config.storage_dir.clone());
		let params = GroupParams::from_config(&config);
		Ok(Arc::new(Self {
			config,
			params: Mutex::new(params),
			my_id,
			fabric,
			spec,
			storage,
			delivery,
			curr_view: RwLock::new(View::initial(my_id, String::new())),
			next_view: Mutex::new(None),
			next_provision: Mutex::new(Provisioned::default()),
			install_epoch: Mutex::new(0),
			install_cv: Condvar::new(),
			listener,
			gms_port,
			mesh,
			pending_join_sockets: Mutex::new(VecDeque::new()),
			proposed_join_sockets: Mutex::new(VecDeque::new()),
			old_views: Mutex::new(VecDeque::new()),
			old_views_cv: Condvar::new(),
			last_suspected: Mutex::new(Vec::new()),
			handles: Mutex::new(Handles::default()),
			upcalls: Mutex::new(Vec::new()),
			objects: Mutex::new(BTreeMap::new()),
			trims: Mutex::new(BTreeMap::new()),
			old_shard_leaders: Mutex::new(Vec::new()),
			thread_shutdown: AtomicBool::new(false),
			fatal: Mutex::new(None),
			threads: Mutex::new(Vec::new()),
		}))
	}

	/// Creates the state table and multicast for the current view and
	/// attaches them. The delivery sink carries over from epoch to epoch,
	/// which is all the sender state the counter datapath has to move.
	fn bind_epoch(&self, provisioned: Provisioned) -> Result<(), Error> {
		let mut view = self.curr_view.write();
		self.bind_epoch_locked(&mut view, provisioned)
	}

	fn bind_epoch_locked(
		&self,
		view: &mut View,
		provisioned: Provisioned,
	) -> Result<(), Error> {
		let params = self.params.lock().clone();
		let dims = Dimensions {
			num_members: view.num_members,
			changes_capacity: view
				.changes_capacity(params.changes_slack as usize),
			num_subgroups: view.subgroup_shard_views.len(),
			num_received_size: provisioned.num_received_size,
		};
		let sst = StateTable::new(
			self.fabric.as_ref(),
			view.vid,
			view.members.clone(),
			self.my_id,
			dims,
			self.config.predicate_poll,
		)?;
		for (rank, failed) in view.failed.iter().enumerate() {
			if *failed {
				sst.freeze(rank);
			}
		}
		let multicast = WindowMulticast::new(
			Arc::clone(&sst),
			view.vid,
			provisioned.settings,
			params.window_size,
			Arc::clone(&self.delivery),
		);
		sst.set_vid_local(view.vid);
		view.sst = Some(sst);
		view.multicast = Some(multicast);
		Ok(())
	}

	/// First-time setup after the initial view is bound: synchronize the
	/// table, seed a joiner's row from the leader, start the service
	/// threads and register the membership predicates.
	fn finish_setup(self: &Arc<Self>) -> Result<(), Error> {
		{
			let view = self.curr_view.read();
			let sst = view.sst.as_ref().expect("epoch is bound");
			sst.publish_row();
			sst.sync_with_members();
			if view.vid != 0 {
				// without the leader's counters a fresh row would read as a
				// brand-new change proposal
				sst.init_from_leader(view.rank_of_leader());
				sst.publish_row();
			}
			*self.last_suspected.lock() = vec![false; view.num_members];
		}
		self.create_threads();
		self.register_predicates();
		Ok(())
	}

	fn create_threads(self: &Arc<Self>) {
		let mut threads = self.threads.lock();

		let listener_inner = Arc::clone(self);
		threads.push(
			thread::Builder::new()
				.name("gms-listener".into())
				.spawn(move || listener_inner.run_listener())
				.expect("failed to spawn the join listener thread"),
		);

		let cleanup_inner = Arc::clone(self);
		threads.push(
			thread::Builder::new()
				.name("old-view-cleanup".into())
				.spawn(move || cleanup_inner.run_cleanup())
				.expect("failed to spawn the view cleanup thread"),
		);
	}

	fn run_listener(&self) {
		loop {
			let socket = match self.listener.accept() {
				Ok(socket) => socket,
				Err(e) => {
					if self.thread_shutdown.load(Ordering::Acquire) {
						break;
					}
					warn!(error = %e, "join listener accept failed");
					continue;
				}
			};
			if self.thread_shutdown.load(Ordering::Acquire) {
				break;
			}
			debug!(
				remote = %socket.remote_ip(),
				"listener queued a join attempt",
			);
			self.pending_join_sockets.lock().push_back(socket);
		}
		debug!("join listener thread shutting down");
	}

	fn run_cleanup(&self) {
		loop {
			let retired = {
				let mut old_views = self.old_views.lock();
				while old_views.is_empty()
					&& !self.thread_shutdown.load(Ordering::Acquire)
				{
					self.old_views_cv.wait(&mut old_views);
				}
				old_views.pop_front()
			};
			match retired {
				Some(view) => {
					debug!(vid = view.vid, "releasing retired view");
					if let Some(sst) = &view.sst {
						sst.stop();
					}
					drop(view);
				}
				None => break, // shutdown with an empty queue
			}
		}
		debug!("old-view cleanup thread shutting down");
	}

	fn persist_current_view(&self) -> Result<(), Error> {
		let view = self.curr_view.read();
		self
			.storage
			.save_bytes(Storage::view_slot(), &wire::encode_full(&view))?;
		Ok(())
	}

	fn has_pending_join(&self) -> bool {
		!self.pending_join_sockets.lock().is_empty()
	}

	/// Records a fatal protocol failure: the manager is poisoned and the
	/// service threads wind down. The caller decides whether to abort the
	/// process.
	fn fail(&self, error: &Error) {
		error!(%error, "fatal membership failure");
		self.fatal.lock().get_or_insert_with(|| error.to_string());
		self.thread_shutdown.store(true, Ordering::Release);
		self.install_cv.notify_all();
	}

	fn check_fatal(&self) -> Result<(), Error> {
		match &*self.fatal.lock() {
			Some(message) => Err(Error::Poisoned(message.clone())),
			None => Ok(()),
		}
	}

	fn shutdown(&self) {
		self.thread_shutdown.store(true, Ordering::Release);
		// unblock the blocking accept with a throwaway connection
		let _ = Socket::connect("127.0.0.1", self.gms_port);
		self.old_views_cv.notify_all();
		self.install_cv.notify_all();
		{
			let view = self.curr_view.read();
			if let Some(sst) = &view.sst {
				sst.stop();
			}
		}
		let threads = {
			let mut threads = self.threads.lock();
			core::mem::take(&mut *threads)
		};
		for handle in threads {
			let _ = handle.join();
		}
		if let Some(mesh) = &self.mesh {
			mesh.shutdown();
		}
	}
}

/// Replicated-object transfer between epochs.
impl Inner {
	/// Opens mesh sockets to any members this node is not yet connected
	/// to. The higher id of each pair dials.
	fn refresh_mesh(&self, view: &View) {
		let Some(mesh) = &self.mesh else {
			return;
		};
		if self.config.object_port == 0 {
			// an ephemeral port cannot be dialed from a config-derived
			// address; incoming connections still work
			return;
		}
		for (rank, member) in view.members.iter().enumerate() {
			if *member == self.my_id
				|| view.failed[rank]
				|| self.my_id.0 <= member.0
				|| mesh.get(*member).is_some()
			{
				continue;
			}
			if let Err(e) = mesh.connect(
				*member,
				&view.member_ips[rank],
				self.config.object_port,
			) {
				warn!(
					peer = %member,
					error = %e,
					"failed to open an object mesh connection",
				);
			}
		}
	}

	fn mesh_socket(&self, peer: NodeId) -> Option<Arc<Socket>> {
		let mesh = self.mesh.as_ref()?;
		let deadline = Instant::now() + Duration::from_secs(5);
		loop {
			if let Some(socket) = mesh.get(peer) {
				return Some(socket);
			}
			if Instant::now() >= deadline {
				warn!(peer = %peer, "no object mesh connection to peer");
				return None;
			}
			thread::sleep(Duration::from_millis(5));
		}
	}

	/// Applies recovered ragged trims to the registered objects.
	fn truncate_persistent_logs(
		&self,
		trims: &[RaggedTrim],
	) -> Result<(), Error> {
		let mut objects = self.objects.lock();
		for trim in trims {
			if let Some(object) = objects.get_mut(&trim.subgroup_id) {
				let version = trim.max_version();
				info!(
					subgroup = trim.subgroup_id,
					version,
					"truncating persistent log to the recovered trim",
				);
				object.truncate(version);
			}
		}
		Ok(())
	}

	/// Old-shard-leader side of object transfer: streams each object this
	/// node led to the members that newly joined its shard.
	fn send_objects_to_new_members(
		&self,
		view: &View,
		old_shard_leaders: &protocol::ShardLeaders,
	) {
		for (subgroup_id, shards) in old_shard_leaders.iter().enumerate() {
			for (shard_num, leader) in shards.iter().enumerate() {
				if *leader != self.my_id.0 as i64 {
					continue;
				}
				let joined = view.subgroup_shard_views[subgroup_id][shard_num]
					.joined
					.clone();
				for joiner in joined {
					if joiner != self.my_id {
						self.send_subgroup_object(
							subgroup_id as SubgroupId,
							joiner,
						);
					}
				}
			}
		}
	}

	/// Streams one subgroup's object state to one new shard member: the
	/// receiver announces its log tail, the sender serializes everything
	/// past it.
	fn send_subgroup_object(&self, subgroup: SubgroupId, new_member: NodeId) {
		if !self.objects.lock().contains_key(&subgroup) {
			return;
		}
		let Some(socket) = self.mesh_socket(new_member) else {
			return;
		};
		let mut objects = self.objects.lock();
		let Some(object) = objects.get_mut(&subgroup) else {
			return;
		};
		let mut transfer = || -> Result<(), Error> {
			let earliest = socket.read_u64()?;
			debug!(
				subgroup,
				peer = %new_member,
				earliest,
				"sending replicated object state",
			);
			object.send_object(&socket, earliest)?;
			Ok(())
		};
		if let Err(e) = transfer() {
			// a joiner dying mid-transfer is its own failure, not ours
			warn!(
				subgroup,
				peer = %new_member,
				error = %e,
				"object transfer to new member failed",
			);
		}
	}

	/// New-member side of object transfer: fetches the object state of
	/// every shard this node just joined from that shard's old leader.
	fn receive_objects(
		&self,
		view: &View,
		old_shard_leaders: &protocol::ShardLeaders,
	) {
		for (&subgroup_id, &shard_num) in &view.my_subgroups {
			let shard =
				&view.subgroup_shard_views[subgroup_id as usize][shard_num];
			// a node fetches state when it is new to the group (its locally
			// provisioned shard deltas are empty in that case) or new to
			// this particular shard
			let newly_here = view.joined.contains(&self.my_id)
				|| shard.joined.contains(&self.my_id);
			if !newly_here {
				continue;
			}
			let Some(leader) = old_shard_leaders
				.get(subgroup_id as usize)
				.and_then(|shards| shards.get(shard_num))
				.copied()
				.filter(|leader| *leader >= 0)
			else {
				continue;
			};
			let leader = NodeId(leader as u32);
			if leader == self.my_id
				|| !self.objects.lock().contains_key(&subgroup_id)
			{
				continue;
			}
			let Some(socket) = self.mesh_socket(leader) else {
				continue;
			};
			let mut objects = self.objects.lock();
			let Some(object) = objects.get_mut(&subgroup_id) else {
				continue;
			};
			let mut transfer = || -> Result<(), Error> {
				socket.write_u64(object.tail_version())?;
				object.receive_object(&socket)?;
				Ok(())
			};
			match transfer() {
				Ok(()) => info!(
					subgroup = subgroup_id,
					leader = %leader,
					"received replicated object state",
				),
				Err(e) => warn!(
					subgroup = subgroup_id,
					leader = %leader,
					error = %e,
					"object transfer from old shard leader failed",
				),
			}
		}
	}
}

//! In-process fabric: every member's row mirrors live in one shared hub
//! and publishes are plain memcpys into the peers' mirrors.
//!
//! This is the fabric used by tests and by single-host groups. It
//! implements the full session semantics — per-member mirrors, freeze,
//! barrier, update versioning — so the protocol above it cannot tell it
//! apart from a wire transport.

use {
	super::fabric::{Fabric, FabricSession},
	crate::view::NodeId,
	core::{ops::Range, time::Duration},
	parking_lot::{Condvar, Mutex, RwLock},
	std::{
		collections::HashMap,
		io,
		sync::{
			Arc,
			atomic::{AtomicBool, Ordering},
		},
	},
};

/// One member's local copy of every row in one session.
struct Mirror {
	rows: RwLock<Vec<Vec<u8>>>,
	frozen: Vec<AtomicBool>,
	version: Mutex<u64>,
	version_cv: Condvar,
}

impl Mirror {
	fn new(num_rows: usize, row_len: usize) -> Self {
		Self {
			rows: RwLock::new(vec![vec![0; row_len]; num_rows]),
			frozen: (0..num_rows).map(|_| AtomicBool::new(false)).collect(),
			version: Mutex::new(0),
			version_cv: Condvar::new(),
		}
	}

	fn bump(&self) {
		*self.version.lock() += 1;
		self.version_cv.notify_all();
	}
}

struct Session {
	members: Vec<NodeId>,
	row_len: usize,
	nodes: Mutex<HashMap<NodeId, Arc<Mirror>>>,
	/// Barrier arrival counters, one per member, monotone.
	sync: Mutex<HashMap<NodeId, u64>>,
	sync_cv: Condvar,
}

/// The shared hub all in-process members attach to.
#[derive(Default)]
pub struct Hub {
	sessions: Mutex<HashMap<u32, Arc<Session>>>,
	addrs: Mutex<HashMap<NodeId, String>>,
}

impl Hub {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

impl Fabric for Hub {
	fn attach(
		&self,
		vid: u32,
		members: &[NodeId],
		my_id: NodeId,
		row_len: usize,
	) -> io::Result<Arc<dyn FabricSession>> {
		let my_rank = members
			.iter()
			.position(|m| *m == my_id)
			.ok_or_else(|| {
				io::Error::new(
					io::ErrorKind::InvalidInput,
					format!("node {my_id} is not a member of view {vid}"),
				)
			})?;

		let session = {
			let mut sessions = self.sessions.lock();
			// sessions whose members have all detached are dead epochs
			sessions.retain(|_, s| !s.nodes.lock().is_empty());
			let session = sessions.entry(vid).or_insert_with(|| {
				Arc::new(Session {
					members: members.to_vec(),
					row_len,
					nodes: Mutex::new(HashMap::new()),
					sync: Mutex::new(HashMap::new()),
					sync_cv: Condvar::new(),
				})
			});
			if session.members != members || session.row_len != row_len {
				return Err(io::Error::new(
					io::ErrorKind::InvalidInput,
					format!("conflicting attach parameters for view {vid}"),
				));
			}
			Arc::clone(session)
		};

		let mirror = Arc::new(Mirror::new(members.len(), row_len));
		session.nodes.lock().insert(my_id, Arc::clone(&mirror));
		// wake peers blocked waiting for this member to appear
		session.sync_cv.notify_all();

		Ok(Arc::new(MemorySession {
			my_id,
			my_rank,
			session,
			mirror,
		}))
	}

	fn add_node(&self, node: NodeId, addr: &str) {
		self.addrs.lock().insert(node, addr.to_string());
	}
}

struct MemorySession {
	my_id: NodeId,
	my_rank: usize,
	session: Arc<Session>,
	mirror: Arc<Mirror>,
}

impl MemorySession {
	fn fan_out(&self, range: Range<usize>) {
		let bytes = {
			let rows = self.mirror.rows.read();
			rows[self.my_rank][range.clone()].to_vec()
		};
		let peers: Vec<Arc<Mirror>> = {
			let nodes = self.session.nodes.lock();
			self
				.session
				.members
				.iter()
				.filter(|m| **m != self.my_id)
				.filter_map(|m| nodes.get(m).cloned())
				.collect()
		};
		for peer in peers {
			if peer.frozen[self.my_rank].load(Ordering::Acquire) {
				continue;
			}
			peer.rows.write()[self.my_rank][range.clone()]
				.copy_from_slice(&bytes);
			peer.bump();
		}
	}
}

impl FabricSession for MemorySession {
	fn my_rank(&self) -> usize {
		self.my_rank
	}

	fn num_rows(&self) -> usize {
		self.session.members.len()
	}

	fn read(&self, rank: usize, offset: usize, buf: &mut [u8]) {
		let rows = self.mirror.rows.read();
		buf.copy_from_slice(&rows[rank][offset..offset + buf.len()]);
	}

	fn write_local(&self, offset: usize, bytes: &[u8]) {
		{
			let mut rows = self.mirror.rows.write();
			rows[self.my_rank][offset..offset + bytes.len()]
				.copy_from_slice(bytes);
		}
		self.mirror.bump();
	}

	fn publish(&self, range: Range<usize>) {
		self.fan_out(range);
	}

	fn publish_acked(&self, range: Range<usize>) {
		// in-process copies complete synchronously; an acknowledged publish
		// degenerates to a plain one
		self.fan_out(range);
	}

	fn barrier(&self) {
		let target = {
			let mut sync = self.session.sync.lock();
			let counter = sync.entry(self.my_id).or_insert(0);
			*counter += 1;
			*counter
		};
		self.session.sync_cv.notify_all();

		let mut sync = self.session.sync.lock();
		loop {
			let attached = self.session.nodes.lock();
			let all_arrived =
				self.session.members.iter().enumerate().all(|(rank, m)| {
					*m == self.my_id
						|| self.mirror.frozen[rank].load(Ordering::Acquire)
						|| (attached.contains_key(m)
							&& sync.get(m).copied().unwrap_or(0) >= target)
				});
			drop(attached);
			if all_arrived {
				return;
			}
			self.session.sync_cv.wait(&mut sync);
		}
	}

	fn freeze(&self, rank: usize) {
		self.mirror.frozen[rank].store(true, Ordering::Release);
		self.mirror.bump();
		// a barrier may be waiting on the member that just got frozen
		self.session.sync_cv.notify_all();
	}

	fn is_frozen(&self, rank: usize) -> bool {
		self.mirror.frozen[rank].load(Ordering::Acquire)
	}

	fn update_version(&self) -> u64 {
		*self.mirror.version.lock()
	}

	fn wait_for_update(&self, last_seen: u64, timeout: Duration) -> u64 {
		let mut version = self.mirror.version.lock();
		if *version <= last_seen {
			self
				.mirror
				.version_cv
				.wait_for(&mut version, timeout);
		}
		*version
	}

	fn detach(&self) {
		self.session.nodes.lock().remove(&self.my_id);
		self.session.sync_cv.notify_all();
	}
}

impl Drop for MemorySession {
	fn drop(&mut self) {
		self.detach();
	}
}

//! The member-to-member socket mesh used for replicated-object transfer.
//!
//! Each member listens on the object port; connections are initiated by
//! the higher-id endpoint of every pair so that exactly one socket exists
//! per pair. Sockets are stored by peer id and handed out for one blocking
//! conversation at a time (the install path serializes its use).

use {
	super::{Listener, Socket},
	crate::view::NodeId,
	parking_lot::Mutex,
	std::{
		collections::HashMap,
		io,
		sync::{
			Arc,
			atomic::{AtomicBool, Ordering},
		},
		thread::{self, JoinHandle},
	},
	tracing::{debug, warn},
};

struct Shared {
	my_id: NodeId,
	sockets: Mutex<HashMap<NodeId, Arc<Socket>>>,
	shutdown: AtomicBool,
}

pub struct Mesh {
	shared: Arc<Shared>,
	port: u16,
	acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Mesh {
	/// Binds the object port and starts accepting peer connections. Each
	/// accepted stream identifies itself with an id exchange before being
	/// stored.
	pub fn new(my_id: NodeId, port: u16) -> io::Result<Self> {
		let listener = Listener::bind(port)?;
		let port = listener.local_port()?;
		let shared = Arc::new(Shared {
			my_id,
			sockets: Mutex::new(HashMap::new()),
			shutdown: AtomicBool::new(false),
		});

		let acceptor_shared = Arc::clone(&shared);
		let acceptor = thread::Builder::new()
			.name("object-mesh".into())
			.spawn(move || {
				loop {
					let socket = match listener.accept() {
						Ok(socket) => socket,
						Err(e) => {
							if !acceptor_shared.shutdown.load(Ordering::Acquire) {
								warn!(error = %e, "object mesh accept failed");
							}
							continue;
						}
					};
					if acceptor_shared.shutdown.load(Ordering::Acquire) {
						break;
					}
					match socket.exchange_ids(acceptor_shared.my_id) {
						Ok(peer) => {
							debug!(peer = %peer, "object mesh connection accepted");
							acceptor_shared
								.sockets
								.lock()
								.insert(peer, Arc::new(socket));
						}
						Err(e) => {
							debug!(error = %e, "object mesh handshake failed");
						}
					}
				}
			})
			.expect("failed to spawn the object mesh acceptor");

		Ok(Self {
			shared,
			port,
			acceptor: Mutex::new(Some(acceptor)),
		})
	}

	pub const fn port(&self) -> u16 {
		self.port
	}

	/// Connects to a peer's object port and stores the socket. Pairs agree
	/// that the higher id dials, so this is only called for lower-id peers.
	pub fn connect(&self, peer: NodeId, addr: &str, port: u16) -> io::Result<()> {
		let socket = Socket::connect(addr, port)?;
		let confirmed = socket.exchange_ids(self.shared.my_id)?;
		if confirmed != peer {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("expected peer {peer} on the object port, got {confirmed}"),
			));
		}
		self.shared.sockets.lock().insert(peer, Arc::new(socket));
		Ok(())
	}

	pub fn get(&self, peer: NodeId) -> Option<Arc<Socket>> {
		self.shared.sockets.lock().get(&peer).cloned()
	}

	/// Drops the socket of a departed or failed peer.
	pub fn disconnect(&self, peer: NodeId) {
		self.shared.sockets.lock().remove(&peer);
	}

	pub fn shutdown(&self) {
		self.shared.shutdown.store(true, Ordering::Release);
		// unblock the acceptor with a throwaway connection
		let _ = Socket::connect("127.0.0.1", self.port);
		if let Some(handle) = self.acceptor.lock().take() {
			let _ = handle.join();
		}
		self.shared.sockets.lock().clear();
	}
}

impl Drop for Mesh {
	fn drop(&mut self) {
		if !self.shared.shutdown.load(Ordering::Acquire) {
			self.shutdown();
		}
	}
}

//! Blocking point-to-point byte streams.
//!
//! Every multi-byte integer on the wire is little-endian. Variable-length
//! payloads travel as a `u64` length prefix followed by the bytes.

pub mod mesh;

pub use mesh::Mesh;

use {
	crate::view::NodeId,
	core::time::Duration,
	std::{
		io::{self, Read, Write},
		net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
		time::Instant,
	},
};

/// Frames larger than this are treated as protocol corruption rather than
/// honored with an allocation.
const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

/// A connected byte stream with the framing helpers the membership
/// protocol speaks.
pub struct Socket {
	stream: TcpStream,
	remote: SocketAddr,
}

impl Socket {
	pub fn connect(addr: &str, port: u16) -> io::Result<Self> {
		let remote = (addr, port)
			.to_socket_addrs()?
			.next()
			.ok_or_else(|| {
				io::Error::new(
					io::ErrorKind::InvalidInput,
					format!("address {addr} did not resolve"),
				)
			})?;
		let stream = TcpStream::connect(remote)?;
		stream.set_nodelay(true)?;
		Ok(Self { stream, remote })
	}

	/// Like [`connect`](Self::connect), but honors an explicit `host:port`
	/// in the address, falling back to `default_port` for a bare host.
	pub fn connect_addr(addr: &str, default_port: u16) -> io::Result<Self> {
		match addr.rsplit_once(':') {
			Some((host, port)) => match port.parse() {
				Ok(port) => Self::connect(host, port),
				Err(_) => Self::connect(addr, default_port),
			},
			None => Self::connect(addr, default_port),
		}
	}

	pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
		stream.set_nodelay(true)?;
		let remote = stream.peer_addr()?;
		Ok(Self { stream, remote })
	}

	/// The peer's address without the port.
	pub fn remote_ip(&self) -> String {
		self.remote.ip().to_string()
	}

	pub fn local_ip(&self) -> io::Result<String> {
		Ok(self.stream.local_addr()?.ip().to_string())
	}

	pub fn read_u8(&self) -> io::Result<u8> {
		let mut buf = [0u8; 1];
		(&self.stream).read_exact(&mut buf)?;
		Ok(buf[0])
	}

	pub fn write_u8(&self, value: u8) -> io::Result<()> {
		(&self.stream).write_all(&[value])
	}

	pub fn read_u32(&self) -> io::Result<u32> {
		let mut buf = [0u8; 4];
		(&self.stream).read_exact(&mut buf)?;
		Ok(u32::from_le_bytes(buf))
	}

	pub fn write_u32(&self, value: u32) -> io::Result<()> {
		(&self.stream).write_all(&value.to_le_bytes())
	}

	pub fn read_u64(&self) -> io::Result<u64> {
		let mut buf = [0u8; 8];
		(&self.stream).read_exact(&mut buf)?;
		Ok(u64::from_le_bytes(buf))
	}

	pub fn write_u64(&self, value: u64) -> io::Result<()> {
		(&self.stream).write_all(&value.to_le_bytes())
	}

	pub fn read_i64(&self) -> io::Result<i64> {
		Ok(self.read_u64()? as i64)
	}

	pub fn write_i64(&self, value: i64) -> io::Result<()> {
		self.write_u64(value as u64)
	}

	pub fn read_node_id(&self) -> io::Result<NodeId> {
		Ok(NodeId(self.read_u32()?))
	}

	pub fn write_node_id(&self, node: NodeId) -> io::Result<()> {
		self.write_u32(node.0)
	}

	/// Writes a `u64` length prefix followed by the payload.
	pub fn write_frame(&self, bytes: &[u8]) -> io::Result<()> {
		self.write_u64(bytes.len() as u64)?;
		(&self.stream).write_all(bytes)
	}

	pub fn read_frame(&self) -> io::Result<Vec<u8>> {
		let len = self.read_u64()?;
		if len > MAX_FRAME_LEN {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("frame length {len} exceeds the protocol maximum"),
			));
		}
		let mut buf = vec![0u8; len as usize];
		(&self.stream).read_exact(&mut buf)?;
		Ok(buf)
	}

	/// The heartbeat primitive: sends our id, reads the peer's. A transport
	/// error here means the peer is gone.
	pub fn exchange_ids(&self, my_id: NodeId) -> io::Result<NodeId> {
		self.write_node_id(my_id)?;
		self.read_node_id()
	}
}

impl core::fmt::Debug for Socket {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Socket").field("remote", &self.remote).finish()
	}
}

/// A listening endpoint with both blocking and bounded accepts.
pub struct Listener {
	inner: TcpListener,
}

impl Listener {
	pub fn bind(port: u16) -> io::Result<Self> {
		let inner = TcpListener::bind(("0.0.0.0", port))?;
		Ok(Self { inner })
	}

	pub fn local_port(&self) -> io::Result<u16> {
		Ok(self.inner.local_addr()?.port())
	}

	/// Blocks until a connection arrives.
	pub fn accept(&self) -> io::Result<Socket> {
		self.inner.set_nonblocking(false)?;
		let (stream, _) = self.inner.accept()?;
		Socket::from_stream(stream)
	}

	/// Accepts a connection if one arrives within `timeout`.
	pub fn try_accept(&self, timeout: Duration) -> io::Result<Option<Socket>> {
		self.inner.set_nonblocking(true)?;
		let deadline = Instant::now() + timeout;
		loop {
			match self.inner.accept() {
				Ok((stream, _)) => {
					self.inner.set_nonblocking(false)?;
					return Ok(Some(Socket::from_stream(stream)?));
				}
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
					if Instant::now() >= deadline {
						self.inner.set_nonblocking(false)?;
						return Ok(None);
					}
					std::thread::sleep(Duration::from_millis(2));
				}
				Err(e) => {
					self.inner.set_nonblocking(false)?;
					return Err(e);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::*, std::thread};

	#[test]
	fn framing_round_trip() {
		let listener = Listener::bind(0).unwrap();
		let port = listener.local_port().unwrap();

		let client = thread::spawn(move || {
			let socket = Socket::connect("127.0.0.1", port).unwrap();
			socket.write_node_id(NodeId(42)).unwrap();
			socket.write_frame(b"hello").unwrap();
			socket.read_frame().unwrap()
		});

		let socket = listener.accept().unwrap();
		assert_eq!(socket.read_node_id().unwrap(), NodeId(42));
		assert_eq!(socket.read_frame().unwrap(), b"hello");
		socket.write_frame(b"world").unwrap();
		assert_eq!(client.join().unwrap(), b"world");
	}

	#[test]
	fn try_accept_times_out_without_peers() {
		let listener = Listener::bind(0).unwrap();
		let accepted = listener
			.try_accept(Duration::from_millis(20))
			.unwrap();
		assert!(accepted.is_none());
	}

	#[test]
	fn try_accept_picks_up_a_waiting_peer() {
		let listener = Listener::bind(0).unwrap();
		let port = listener.local_port().unwrap();
		let client = thread::spawn(move || {
			Socket::connect("127.0.0.1", port).unwrap()
		});
		let accepted = listener
			.try_accept(Duration::from_secs(5))
			.unwrap();
		assert!(accepted.is_some());
		client.join().unwrap();
	}

	#[test]
	fn id_exchange_is_symmetric() {
		let listener = Listener::bind(0).unwrap();
		let port = listener.local_port().unwrap();
		let client = thread::spawn(move || {
			let socket = Socket::connect("127.0.0.1", port).unwrap();
			socket.exchange_ids(NodeId(2)).unwrap()
		});
		let socket = listener.accept().unwrap();
		let peer = socket.exchange_ids(NodeId(1)).unwrap();
		assert_eq!(peer, NodeId(2));
		assert_eq!(client.join().unwrap(), NodeId(1));
	}
}

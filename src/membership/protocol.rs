//! The byte protocol spoken over a join socket.
//!
//! 1. Joiner -> leader: its `NodeId` (4 bytes LE).
//! 2. Leader -> joiner: a [`JoinResponse`].
//! 3. On `LeaderRedirect`: a length-prefixed address string follows and the
//!    joiner reconnects there.
//! 4. On `TotalRestart`: the joiner uploads its persisted view and ragged
//!    trims before the normal flow resumes.
//! 5. A second id exchange serves as a heartbeat proving the joiner is
//!    still alive when the leader is ready to send the view.
//! 6. Leader -> joiner: the view frame (full in restart mode, streamlined
//!    otherwise), the group parameters, (restart only) the trim set, and
//!    the old-shard-leaders vector.

use {
	super::error::Error,
	crate::{
		persistence::RaggedTrim,
		primitives::encoding,
		transport::Socket,
		view::NodeId,
	},
	serde::{Deserialize, Serialize},
	std::io,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JoinResponseCode {
	Ok = 0,
	IdInUse = 1,
	LeaderRedirect = 2,
	TotalRestart = 3,
}

impl TryFrom<u8> for JoinResponseCode {
	type Error = io::Error;

	fn try_from(raw: u8) -> io::Result<Self> {
		match raw {
			0 => Ok(Self::Ok),
			1 => Ok(Self::IdInUse),
			2 => Ok(Self::LeaderRedirect),
			3 => Ok(Self::TotalRestart),
			other => Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("unknown join response code {other}"),
			)),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinResponse {
	pub code: JoinResponseCode,
	pub leader_id: NodeId,
}

impl JoinResponse {
	pub fn write(&self, socket: &Socket) -> io::Result<()> {
		socket.write_u8(self.code as u8)?;
		socket.write_node_id(self.leader_id)
	}

	pub fn read(socket: &Socket) -> io::Result<Self> {
		let code = JoinResponseCode::try_from(socket.read_u8()?)?;
		let leader_id = socket.read_node_id()?;
		Ok(Self { code, leader_id })
	}
}

/// `shard_leaders[subgroup_id][shard]` is the node that led the shard in
/// the previous epoch (`-1` when it had none), the source replicas new
/// shard members fetch object state from.
pub type ShardLeaders = Vec<Vec<i64>>;

pub fn write_shard_leaders(
	socket: &Socket,
	leaders: &ShardLeaders,
) -> Result<(), Error> {
	socket.write_frame(&encoding::try_serialize(leaders)?)?;
	Ok(())
}

pub fn read_shard_leaders(socket: &Socket) -> Result<ShardLeaders, Error> {
	Ok(encoding::deserialize(socket.read_frame()?)?)
}

/// Sends the trim set as a count followed by one frame per trim.
pub fn write_trims<'a>(
	socket: &Socket,
	trims: impl ExactSizeIterator<Item = &'a RaggedTrim>,
) -> Result<(), Error> {
	socket.write_u64(trims.len() as u64)?;
	for trim in trims {
		socket.write_frame(&encoding::try_serialize(trim)?)?;
	}
	Ok(())
}

pub fn read_trims(socket: &Socket) -> Result<Vec<RaggedTrim>, Error> {
	let count = socket.read_u64()?;
	let mut trims = Vec::with_capacity(count.min(1024) as usize);
	for _ in 0..count {
		trims.push(encoding::deserialize(socket.read_frame()?)?);
	}
	Ok(trims)
}

/// Writes any serializable value as one length-prefixed frame.
pub fn write_object<T: Serialize>(
	socket: &Socket,
	value: &T,
) -> Result<(), Error> {
	socket.write_frame(&encoding::try_serialize(value)?)?;
	Ok(())
}

pub fn read_object<T: for<'de> Deserialize<'de>>(
	socket: &Socket,
) -> Result<T, Error> {
	Ok(encoding::deserialize(socket.read_frame()?)?)
}

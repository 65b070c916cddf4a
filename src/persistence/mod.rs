//! Durable state: the per-node view slot, the per-subgroup ragged-trim
//! slots, version arithmetic, and the collaborator trait for replicated
//! objects with persistent logs.

use {
	crate::{
		primitives::encoding,
		transport::Socket,
		view::{NodeId, SubgroupId},
	},
	serde::{Deserialize, Serialize, de::DeserializeOwned},
	std::{fs, io, path::PathBuf},
};

/// A 64-bit log version: the view id in the high half, the per-shard
/// delivery sequence in the low half.
pub type Version = u64;

pub const fn combine(vid: u32, seq: u32) -> Version {
	((vid as u64) << 32) | seq as u64
}

pub const fn unpack(version: Version) -> (u32, u32) {
	((version >> 32) as u32, version as u32)
}

/// The sequence half of a version, as the signed counter the delivery
/// bookkeeping uses.
pub const fn seq_of(version: Version) -> i32 {
	version as u32 as i32
}

/// The durable record of a shard's ragged-edge agreement: the last
/// deliverable message index per sender, written before delivery begins so
/// recovery can replay the identical trim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaggedTrim {
	pub subgroup_id: SubgroupId,
	pub vid: u32,
	pub leader_id: NodeId,
	pub max_received_by_sender: Vec<i32>,
}

impl RaggedTrim {
	/// The highest version this trim allows to survive, using the same
	/// sender-major sequencing as delivery: message `s@i` carries sequence
	/// `i * num_senders + s`.
	pub fn max_version(&self) -> Version {
		let num_senders = self.max_received_by_sender.len() as i32;
		let max_seq = self
			.max_received_by_sender
			.iter()
			.enumerate()
			.map(|(sender, max)| *max * num_senders + sender as i32)
			.max()
			.unwrap_or(0)
			.max(0);
		combine(self.vid, max_seq as u32)
	}
}

/// One named durable slot per object, replaced atomically.
pub struct Storage {
	root: PathBuf,
}

impl Storage {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn save<T: Serialize>(&self, name: &str, value: &T) -> io::Result<()> {
		fs::create_dir_all(&self.root)?;
		let bytes = encoding::try_serialize(value)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		let tmp = self.root.join(format!("{name}.tmp"));
		fs::write(&tmp, &bytes)?;
		fs::rename(&tmp, self.root.join(name))
	}

	/// Saves pre-encoded bytes into a slot.
	pub fn save_bytes(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
		fs::create_dir_all(&self.root)?;
		let tmp = self.root.join(format!("{name}.tmp"));
		fs::write(&tmp, bytes)?;
		fs::rename(&tmp, self.root.join(name))
	}

	pub fn load<T: DeserializeOwned>(&self, name: &str) -> io::Result<Option<T>> {
		let bytes = match self.load_bytes(name)? {
			Some(bytes) => bytes,
			None => return Ok(None),
		};
		encoding::deserialize(&bytes)
			.map(Some)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
	}

	pub fn load_bytes(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
		match fs::read(self.root.join(name)) {
			Ok(bytes) => Ok(Some(bytes)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// The single per-node slot holding the last installed view.
	pub const fn view_slot() -> &'static str {
		"view"
	}

	pub fn ragged_trim_slot(subgroup_id: SubgroupId) -> String {
		format!("RaggedTrim_{subgroup_id}")
	}

	pub fn save_ragged_trim(&self, trim: &RaggedTrim) -> io::Result<()> {
		self.save(&Self::ragged_trim_slot(trim.subgroup_id), trim)
	}

	pub fn load_ragged_trim(
		&self,
		subgroup_id: SubgroupId,
	) -> io::Result<Option<RaggedTrim>> {
		self.load(&Self::ragged_trim_slot(subgroup_id))
	}
}

/// A replicated object with a persistent log, owned by the embedding
/// application. The core only drives log truncation at recovery and whole
/// object transfer to members that newly joined its shard.
pub trait PersistentObject: Send {
	/// Discards every log entry with a version greater than `version`.
	fn truncate(&mut self, version: Version);

	/// The version up to which this replica's log is already populated;
	/// sent to the shard leader so it can skip the prefix the receiver
	/// already has.
	fn tail_version(&self) -> Version;

	/// Streams the object state (from `earliest` onward) to a new shard
	/// member.
	fn send_object(&mut self, socket: &Socket, earliest: Version)
	-> io::Result<()>;

	/// Receives the object state streamed by [`send_object`](Self::send_object).
	fn receive_object(&mut self, socket: &Socket) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn version_halves() {
		let version = combine(5, 19);
		assert_eq!(unpack(version), (5, 19));
		assert_eq!(seq_of(version), 19);
	}

	#[test]
	fn trim_version_uses_sender_major_sequencing() {
		let trim = RaggedTrim {
			subgroup_id: 0,
			vid: 5,
			leader_id: NodeId(1),
			max_received_by_sender: vec![6, 4, 6],
		};
		// the largest surviving sequence is sender 2 at index 6: 6*3+2
		assert_eq!(trim.max_version(), combine(5, 20));
	}

	#[test]
	fn trim_version_clamps_empty_senders() {
		let trim = RaggedTrim {
			subgroup_id: 1,
			vid: 2,
			leader_id: NodeId(1),
			max_received_by_sender: vec![-1, -1],
		};
		assert_eq!(trim.max_version(), combine(2, 0));
	}

	#[test]
	fn slots_replace_atomically() {
		let dir = tempfile::tempdir().unwrap();
		let storage = Storage::new(dir.path());
		let trim = RaggedTrim {
			subgroup_id: 3,
			vid: 1,
			leader_id: NodeId(9),
			max_received_by_sender: vec![0, 1],
		};
		storage.save_ragged_trim(&trim).unwrap();
		let loaded = storage.load_ragged_trim(3).unwrap().unwrap();
		assert_eq!(loaded, trim);

		let newer = RaggedTrim {
			vid: 2,
			..trim.clone()
		};
		storage.save_ragged_trim(&newer).unwrap();
		assert_eq!(storage.load_ragged_trim(3).unwrap().unwrap(), newer);
		assert!(storage.load_ragged_trim(4).unwrap().is_none());
	}
}

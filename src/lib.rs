//! Group membership and view-change core for a replicated state machine
//! built over a shared state table (SST).
//!
//! The crate decides, in a partition-tolerant fashion, which processes
//! currently constitute the group; installs a totally-ordered sequence of
//! *views*; cleanly terminates one epoch of multicast traffic and commences
//! the next without message loss, duplication or reordering; and coordinates
//! total-restart recovery after a full group crash.
//!
//! The replication transport below the state table, the per-subgroup
//! multicast datapath and the durable replicated objects are collaborators
//! reached through the [`sst::Fabric`], [`multicast::Multicast`] and
//! [`persistence::PersistentObject`] traits.

pub mod config;
pub mod layout;
pub mod membership;
pub mod multicast;
pub mod persistence;
pub mod primitives;
pub mod sst;
pub mod transport;
pub mod view;

pub use {
	config::Config,
	layout::{Inadequate, SubgroupSpec},
	membership::{Error, ViewManager},
	view::{NodeId, SubgroupId, View},
};

pub mod prelude {
	pub use super::{
		config::Config,
		layout::{SubgroupSpec, sharded::ShardedAllocator},
		membership::ViewManager,
		multicast::Multicast,
		persistence::{RaggedTrim, Version},
		sst::{Fabric, memory::Hub},
		view::{Mode, NodeId, SubView, View},
	};
}

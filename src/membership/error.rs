use {
	crate::view::{NodeId, SubgroupId},
	std::io,
};

/// Failures of the membership core. The fatal variants poison the manager:
/// the protocol threads stop and every subsequent public operation returns
/// [`Error::Poisoned`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Half or more of the group has failed simultaneously. Continuing
	/// would risk split-brain, so the minority side shuts down. Never
	/// retried.
	#[error(
		"a majority of the group failed simultaneously; this node is in a \
		 minority partition and must shut down"
	)]
	PartitionedMinority,

	/// A joiner announced an id that already names a member. The joiner is
	/// rejected; group state is unchanged.
	#[error("node id {0} is already in use by a group member")]
	IdCollision(NodeId),

	/// The pending-changes ring filled up. The design assumes the caller
	/// bounds outstanding proposals, so this is fatal.
	#[error("the pending-changes ring is full")]
	ChangesOverflow,

	/// Total restart found no ragged trim for a subgroup this node hosts.
	/// Recovery with partial logs is impossible.
	#[error(
		"no ragged trim recorded for subgroup {0}; cannot recover with \
		 partial logs"
	)]
	MissingRaggedTrim(SubgroupId),

	/// The next view this node helped compute does not contain it.
	#[error("this node is not a member of the view it helped install")]
	SelfExcluded,

	/// The joiner followed more leader redirects than the configured cap
	/// allows; the redirects are assumed circular.
	#[error("exceeded {0} leader redirects while joining; redirect loop suspected")]
	RedirectLoop(usize),

	/// A previous fatal failure already stopped the manager.
	#[error("the group manager failed fatally: {0}")]
	Poisoned(String),

	#[error(transparent)]
	Io(#[from] io::Error),

	#[error("encoding error: {0}")]
	Encoding(#[from] postcard::Error),
}

impl Error {
	/// Fatal errors stop the protocol threads and poison the manager.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			Self::PartitionedMinority
				| Self::ChangesOverflow
				| Self::MissingRaggedTrim(_)
				| Self::SelfExcluded
		)
	}
}

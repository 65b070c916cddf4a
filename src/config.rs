use {
	core::time::Duration,
	derive_builder::Builder,
	std::path::PathBuf,
};

/// Configuration options for the membership core.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(prefix = "with"))]
#[builder_struct_attr(doc(hidden))]
pub struct Config {
	/// The TCP port the membership service listens on for join attempts.
	#[builder(default = "23580")]
	pub gms_port: u16,

	/// The TCP port used for the member-to-member object transfer mesh.
	#[builder(default = "23581")]
	pub object_port: u16,

	/// How long the restart leader keeps accepting rejoining nodes after the
	/// last quorum-changing event before giving up on absentees. The correct
	/// value for slow links is deployment-specific, which is why it lives in
	/// configuration rather than in the protocol.
	#[builder(default = "Duration::from_secs(10)")]
	pub restart_timeout: Duration,

	/// Upper bound on consecutive `LEADER_REDIRECT` hops a joiner will
	/// follow before treating the redirects as circular and failing the
	/// join.
	#[builder(default = "8")]
	pub max_redirects: usize,

	/// The interval at which the predicate thread re-scans registered
	/// predicates when no state-table update has woken it.
	#[builder(default = "Duration::from_millis(1)")]
	pub predicate_poll: Duration,

	/// Extra slots in the pending-changes ring beyond the member count.
	/// The ring holds proposals that are committed but not yet installed;
	/// overflowing it is fatal.
	#[builder(default = "8")]
	pub changes_slack: usize,

	/// Multicast window size handed to the datapath for each subgroup.
	#[builder(default = "16")]
	pub window_size: u32,

	/// Maximum multicast payload size in bytes.
	#[builder(default = "1024 * 1024")]
	pub max_payload_size: usize,

	/// Directory holding the persisted view slot and the per-subgroup
	/// ragged-trim slots.
	#[builder(default = "PathBuf::from(\".\")")]
	pub storage_dir: PathBuf,
}

impl Config {
	/// Creates a new config builder with default values.
	pub fn builder() -> ConfigBuilder {
		ConfigBuilder::default()
	}
}

impl Default for Config {
	fn default() -> Self {
		Self::builder().build().expect("all fields are defaulted")
	}
}

/// The parameter block the leader ships to every joiner alongside the view.
/// Both sides must agree on these for the shared row layout to line up.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GroupParams {
	pub window_size: u32,
	pub max_payload_size: u64,
	pub changes_slack: u64,
}

impl GroupParams {
	pub fn from_config(config: &Config) -> Self {
		Self {
			window_size: config.window_size,
			max_payload_size: config.max_payload_size as u64,
			changes_slack: config.changes_slack as u64,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builder_defaults() {
		let config = Config::default();
		assert_eq!(config.gms_port, 23580);
		assert_eq!(config.max_redirects, 8);
		assert!(config.changes_slack > 0);
	}

	#[test]
	fn builder_overrides() {
		let config = Config::builder()
			.with_gms_port(9000)
			.with_restart_timeout(Duration::from_secs(1))
			.build()
			.unwrap();
		assert_eq!(config.gms_port, 9000);
		assert_eq!(config.restart_timeout, Duration::from_secs(1));
	}
}

#![allow(unused)]

use {
	std::{
		net::TcpListener,
		sync::Arc,
		time::{Duration, Instant},
	},
	stele::{
		Config, NodeId, SubgroupSpec,
		multicast::window::DeliveryFn,
		prelude::{Mode, ShardedAllocator},
	},
	tempfile::TempDir,
};

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "warn".into()),
		)
		.with_test_writer()
		.try_init();
}

/// A config with ephemeral ports and its own storage directory.
pub fn node_config(storage: &TempDir) -> Config {
	Config::builder()
		.with_gms_port(0)
		.with_object_port(0)
		.with_storage_dir(storage.path().to_path_buf())
		.build()
		.unwrap()
}

/// One spanning ordered subgroup over every live member.
pub fn spanning_spec(min_nodes: usize) -> SubgroupSpec {
	SubgroupSpec::new()
		.with("main", ShardedAllocator::spanning(min_nodes, Mode::Ordered))
}

pub fn discard_deliveries() -> DeliveryFn {
	Arc::new(|_, _, _, _, _| {})
}

/// Polls `condition` until it holds or the deadline passes.
pub fn wait_until(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
	let deadline = Instant::now() + timeout;
	while !condition() {
		assert!(
			Instant::now() < deadline,
			"timed out waiting for: {what}",
		);
		std::thread::sleep(Duration::from_millis(10));
	}
}

/// Reserves a port that is free right now. Racy by nature, good enough for
/// tests that need a dialable address before the listener exists.
pub fn pick_port() -> u16 {
	let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
	listener.local_addr().unwrap().port()
}

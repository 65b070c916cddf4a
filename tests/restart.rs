//! Total restart: a majority of the last persisted view reconstitutes the
//! group, absentees are dropped, and the recovered ragged trims drive log
//! truncation before the first post-restart send.

mod utils;

use {
	core::time::Duration,
	parking_lot::Mutex,
	std::{sync::Arc, thread},
	stele::{
		Config, NodeId, ViewManager,
		layout::provision,
		persistence::{
			PersistentObject, RaggedTrim, Storage, Version, combine,
		},
		prelude::Hub,
		transport::Socket,
		view::{View, wire},
	},
	tempfile::{TempDir, tempdir},
	utils::*,
};

/// Records the truncation the restart applies.
struct MockLog {
	truncated: Arc<Mutex<Option<Version>>>,
}

impl PersistentObject for MockLog {
	fn truncate(&mut self, version: Version) {
		*self.truncated.lock() = Some(version);
	}

	fn tail_version(&self) -> Version {
		0
	}

	fn send_object(
		&mut self,
		_socket: &Socket,
		_earliest: Version,
	) -> std::io::Result<()> {
		Ok(())
	}

	fn receive_object(&mut self, _socket: &Socket) -> std::io::Result<()> {
		Ok(())
	}
}

/// Fabricates the durable state a node of the crashed group would hold:
/// the persisted five-member view and the ragged trim of its subgroup.
fn seed_storage(dir: &TempDir, view_bytes: &[u8], trim: &RaggedTrim) {
	let storage = Storage::new(dir.path());
	storage.save_bytes(Storage::view_slot(), view_bytes).unwrap();
	storage.save_ragged_trim(trim).unwrap();
}

fn restart_config(storage: &TempDir, gms_port: u16) -> Config {
	Config::builder()
		.with_gms_port(gms_port)
		.with_object_port(0)
		.with_restart_timeout(Duration::from_millis(700))
		.with_storage_dir(storage.path().to_path_buf())
		.build()
		.unwrap()
}

#[test]
fn majority_restart_installs_recovery_view() {
	init_tracing();

	// the crashed group: five members, one spanning ordered subgroup
	let last_members: Vec<NodeId> = (1..=5).map(NodeId).collect();
	let mut last_view = View::new(
		7,
		last_members.clone(),
		last_members
			.iter()
			.map(|m| format!("10.0.0.{m}"))
			.collect(),
		vec![false; 5],
		Vec::new(),
		Vec::new(),
		None,
		0,
	);
	provision(&spanning_spec(2), None, &mut last_view);
	let view_bytes = wire::encode_full(&last_view);

	let trim = RaggedTrim {
		subgroup_id: 0,
		vid: 7,
		leader_id: NodeId(1),
		max_received_by_sender: vec![2, 1, 0, 1, 2],
	};
	// the deepest surviving message is sender 4 at index 2: seq 2*5+4
	let expected_truncation = combine(7, 14);

	let dirs: Vec<TempDir> = (0..3).map(|_| tempdir().unwrap()).collect();
	for dir in &dirs {
		seed_storage(dir, &view_bytes, &trim);
	}

	let hub = Hub::new();
	let leader_port = pick_port();

	// nodes 1, 2 and 3 restart; 4 and 5 never come back
	let leader_hub = hub.clone();
	let leader_config = restart_config(&dirs[0], leader_port);
	let leader_handle = thread::spawn(move || {
		ViewManager::start_group(
			leader_config,
			NodeId(1),
			"127.0.0.1",
			spanning_spec(2),
			leader_hub,
			discard_deliveries(),
		)
		.unwrap()
	});

	let mut rejoiner_handles = Vec::new();
	for (index, node) in [NodeId(2), NodeId(3)].into_iter().enumerate() {
		let config = restart_config(&dirs[index + 1], 0);
		let hub = hub.clone();
		rejoiner_handles.push(thread::spawn(move || {
			let leader_addr = format!("127.0.0.1:{leader_port}");
			let mut attempts = 0;
			loop {
				match ViewManager::join_group(
					config.clone(),
					node,
					&leader_addr,
					spanning_spec(2),
					hub.clone(),
					discard_deliveries(),
				) {
					Ok(manager) => break manager,
					Err(e) => {
						attempts += 1;
						assert!(
							attempts < 100,
							"node {node} could not rejoin: {e}",
						);
						thread::sleep(Duration::from_millis(50));
					}
				}
			}
		}));
	}

	let managers: Vec<ViewManager> = std::iter::once(leader_handle)
		.chain(rejoiner_handles)
		.map(|handle| handle.join().unwrap())
		.collect();

	let truncations: Vec<Arc<Mutex<Option<Version>>>> = managers
		.iter()
		.map(|manager| {
			let truncated = Arc::new(Mutex::new(None));
			manager.register_object(
				0,
				Box::new(MockLog {
					truncated: Arc::clone(&truncated),
				}),
			);
			truncated
		})
		.collect();
	for manager in &managers {
		manager.start().unwrap();
	}

	let expected_members: Vec<NodeId> = (1..=3).map(NodeId).collect();
	for manager in &managers {
		assert_eq!(manager.get_members(), expected_members);
		manager.with_current_view(|view| {
			assert_eq!(view.vid, 8);
			assert_eq!(view.failed, vec![false, false, false]);
			assert_eq!(view.departed, vec![NodeId(4), NodeId(5)]);
			assert!(view.joined.is_empty());
		});
	}

	// ragged-trim-driven truncation ran before the first post-restart send
	for truncated in &truncations {
		assert_eq!(*truncated.lock(), Some(expected_truncation));
	}

	// the recovery view is durable on every node
	for dir in &dirs {
		let storage = Storage::new(dir.path());
		let bytes = storage
			.load_bytes(Storage::view_slot())
			.unwrap()
			.expect("the installed view must be persisted");
		let persisted = wire::decode_full(&bytes, NodeId(1)).unwrap();
		assert_eq!(persisted.vid, 8);
	}
}

//! Membership protocol scenarios: joins, duplicate ids, redirects and
//! failure-driven view changes, run over real sockets and the in-process
//! fabric.

mod utils;

use {
	core::time::Duration,
	stele::{NodeId, ViewManager, prelude::Hub, transport::Socket},
	tempfile::tempdir,
	utils::*,
};

/// A node starts alone, a second node joins through the wire protocol, and
/// both install the two-member view.
#[test]
fn single_join_installs_next_view() {
	init_tracing();
	let hub = Hub::new();

	let dir1 = tempdir().unwrap();
	let leader = ViewManager::start_group(
		node_config(&dir1),
		NodeId(1),
		"127.0.0.1",
		spanning_spec(1),
		hub.clone(),
		discard_deliveries(),
	)
	.unwrap();
	leader.start().unwrap();
	assert_eq!(leader.get_members(), vec![NodeId(1)]);
	leader.with_current_view(|view| assert_eq!(view.vid, 0));

	let dir2 = tempdir().unwrap();
	let joiner = ViewManager::join_group(
		node_config(&dir2),
		NodeId(2),
		&format!("127.0.0.1:{}", leader.gms_port()),
		spanning_spec(1),
		hub.clone(),
		discard_deliveries(),
	)
	.unwrap();
	joiner.start().unwrap();

	wait_until("both nodes install the two-member view", Duration::from_secs(20), || {
		leader.get_members() == vec![NodeId(1), NodeId(2)]
			&& joiner.get_members() == vec![NodeId(1), NodeId(2)]
	});

	leader.with_current_view(|view| {
		assert_eq!(view.vid, 1);
		assert_eq!(view.joined, vec![NodeId(2)]);
		assert!(view.departed.is_empty());
	});
	joiner.with_current_view(|view| {
		assert_eq!(view.vid, 1);
		assert_eq!(view.my_rank, Some(1));
	});
}

/// A joiner announcing an id that is already a member is rejected without
/// disturbing the group.
#[test]
fn duplicate_id_is_rejected() {
	init_tracing();
	let hub = Hub::new();

	let dir = tempdir().unwrap();
	let leader = ViewManager::start_group(
		node_config(&dir),
		NodeId(1),
		"127.0.0.1",
		spanning_spec(1),
		hub.clone(),
		discard_deliveries(),
	)
	.unwrap();
	leader.start().unwrap();

	let socket = Socket::connect("127.0.0.1", leader.gms_port()).unwrap();
	socket.write_node_id(NodeId(1)).unwrap();
	// code 1 = ID_IN_USE, followed by the responder's id
	assert_eq!(socket.read_u8().unwrap(), 1);
	assert_eq!(socket.read_node_id().unwrap(), NodeId(1));

	// no membership change may result
	std::thread::sleep(Duration::from_millis(100));
	assert_eq!(leader.get_members(), vec![NodeId(1)]);
	leader.with_current_view(|view| assert_eq!(view.vid, 0));
}

/// A join attempt sent to a non-leader is answered with a redirect naming
/// the leader's address.
#[test]
fn non_leader_redirects_join_attempts() {
	init_tracing();
	let hub = Hub::new();

	let dir1 = tempdir().unwrap();
	let leader = ViewManager::start_group(
		node_config(&dir1),
		NodeId(1),
		"127.0.0.1",
		spanning_spec(1),
		hub.clone(),
		discard_deliveries(),
	)
	.unwrap();
	leader.start().unwrap();

	let dir2 = tempdir().unwrap();
	let follower = ViewManager::join_group(
		node_config(&dir2),
		NodeId(2),
		&format!("127.0.0.1:{}", leader.gms_port()),
		spanning_spec(1),
		hub.clone(),
		discard_deliveries(),
	)
	.unwrap();
	follower.start().unwrap();
	wait_until("two-member view installs", Duration::from_secs(20), || {
		follower.get_members().len() == 2
	});

	let socket = Socket::connect("127.0.0.1", follower.gms_port()).unwrap();
	socket.write_node_id(NodeId(9)).unwrap();
	// code 2 = LEADER_REDIRECT from the responder, then the leader address
	assert_eq!(socket.read_u8().unwrap(), 2);
	assert_eq!(socket.read_node_id().unwrap(), NodeId(2));
	let addr = socket.read_frame().unwrap();
	assert_eq!(addr, b"127.0.0.1");

	// the redirected attempt must not have changed anything
	std::thread::sleep(Duration::from_millis(100));
	follower.with_current_view(|view| {
		assert_eq!(view.vid, 1);
		assert_eq!(view.members, vec![NodeId(1), NodeId(2)]);
	});
}

/// A reported failure hardens into an eviction: the survivors install the
/// smaller view and the evicted node's manager poisons itself.
#[test]
fn failure_report_evicts_the_member() {
	init_tracing();
	let hub = Hub::new();

	let dir1 = tempdir().unwrap();
	let node1 = ViewManager::start_group(
		node_config(&dir1),
		NodeId(1),
		"127.0.0.1",
		spanning_spec(1),
		hub.clone(),
		discard_deliveries(),
	)
	.unwrap();
	node1.start().unwrap();

	let dir2 = tempdir().unwrap();
	let node2 = ViewManager::join_group(
		node_config(&dir2),
		NodeId(2),
		&format!("127.0.0.1:{}", node1.gms_port()),
		spanning_spec(1),
		hub.clone(),
		discard_deliveries(),
	)
	.unwrap();
	node2.start().unwrap();
	wait_until("second member joins", Duration::from_secs(20), || {
		node1.get_members().len() == 2 && node2.get_members().len() == 2
	});

	let dir3 = tempdir().unwrap();
	let node3 = ViewManager::join_group(
		node_config(&dir3),
		NodeId(3),
		&format!("127.0.0.1:{}", node1.gms_port()),
		spanning_spec(1),
		hub.clone(),
		discard_deliveries(),
	)
	.unwrap();
	node3.start().unwrap();
	wait_until("third member joins", Duration::from_secs(20), || {
		node1.get_members().len() == 3
			&& node2.get_members().len() == 3
			&& node3.get_members().len() == 3
	});
	node1.with_current_view(|view| assert_eq!(view.vid, 2));

	node1.report_failure(NodeId(3)).unwrap();

	wait_until("survivors install the eviction view", Duration::from_secs(20), || {
		node1.get_members() == vec![NodeId(1), NodeId(2)]
			&& node2.get_members() == vec![NodeId(1), NodeId(2)]
	});
	node1.with_current_view(|view| {
		assert_eq!(view.vid, 3);
		assert_eq!(view.departed, vec![NodeId(3)]);
		assert_eq!(view.failed, vec![false, false]);
	});

	// the evicted node computed a view without itself, which is fatal there
	wait_until("evicted node poisons itself", Duration::from_secs(20), || {
		node3.fatal_error().is_some()
	});

	drop(node3);
}

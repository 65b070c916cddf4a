//! Serialized forms of a view.
//!
//! Two encodings exist. The *full* form carries the complete subgroup and
//! shard layout and is used for persistence and for total restart, where
//! the receiver must not re-run the allocators against a membership it has
//! no context for. The *streamlined* form omits the layout; an ordinary
//! joiner recomputes it locally from the same allocator list.
//!
//! Local-only fields (`my_rank`, `my_subgroups`, the bound table and
//! multicast handles) never travel.

use {
	super::{Mode, NodeId, SubView, SubgroupId, View},
	crate::primitives::encoding,
	bytes::Bytes,
	serde::{Deserialize, Serialize},
	std::collections::BTreeMap,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SubViewFrame {
	members: Vec<NodeId>,
	is_sender: Vec<bool>,
	mode: Mode,
	joined: Vec<NodeId>,
	departed: Vec<NodeId>,
}

impl From<&SubView> for SubViewFrame {
	fn from(sub: &SubView) -> Self {
		Self {
			members: sub.members.clone(),
			is_sender: sub.is_sender.clone(),
			mode: sub.mode,
			joined: sub.joined.clone(),
			departed: sub.departed.clone(),
		}
	}
}

/// The full encoding, layout included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewFrame {
	vid: u32,
	members: Vec<NodeId>,
	member_ips: Vec<String>,
	failed: Vec<bool>,
	joined: Vec<NodeId>,
	departed: Vec<NodeId>,
	next_unassigned_rank: i32,
	subgroup_ids_by_type: BTreeMap<String, Vec<SubgroupId>>,
	subgroup_shard_views: Vec<Vec<SubViewFrame>>,
}

/// The streamlined encoding: membership only, the receiver recomputes the
/// layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamlinedViewFrame {
	vid: u32,
	members: Vec<NodeId>,
	member_ips: Vec<String>,
	failed: Vec<bool>,
	joined: Vec<NodeId>,
	departed: Vec<NodeId>,
	next_unassigned_rank: i32,
}

impl From<&View> for ViewFrame {
	fn from(view: &View) -> Self {
		Self {
			vid: view.vid,
			members: view.members.clone(),
			member_ips: view.member_ips.clone(),
			failed: view.failed.clone(),
			joined: view.joined.clone(),
			departed: view.departed.clone(),
			next_unassigned_rank: view.next_unassigned_rank,
			subgroup_ids_by_type: view.subgroup_ids_by_type.clone(),
			subgroup_shard_views: view
				.subgroup_shard_views
				.iter()
				.map(|shards| shards.iter().map(SubViewFrame::from).collect())
				.collect(),
		}
	}
}

impl From<&View> for StreamlinedViewFrame {
	fn from(view: &View) -> Self {
		Self {
			vid: view.vid,
			members: view.members.clone(),
			member_ips: view.member_ips.clone(),
			failed: view.failed.clone(),
			joined: view.joined.clone(),
			departed: view.departed.clone(),
			next_unassigned_rank: view.next_unassigned_rank,
		}
	}
}

/// Encodes a view with its complete subgroup layout.
pub fn encode_full(view: &View) -> Bytes {
	encoding::serialize(&ViewFrame::from(view))
}

/// Encodes a view without its subgroup layout.
pub fn encode_streamlined(view: &View) -> Bytes {
	encoding::serialize(&StreamlinedViewFrame::from(view))
}

/// Decodes a full frame. `my_id` localizes the view: `my_rank`,
/// `my_subgroups` and each shard's `my_rank` are derived, not transmitted.
pub fn decode_full(
	bytes: &[u8],
	my_id: NodeId,
) -> Result<View, postcard::Error> {
	let frame: ViewFrame = encoding::deserialize(bytes)?;
	let mut view = View::new(
		frame.vid,
		frame.members,
		frame.member_ips,
		frame.failed,
		frame.joined,
		frame.departed,
		None,
		frame.next_unassigned_rank,
	);
	view.my_rank = view.rank_of(my_id);
	view.subgroup_ids_by_type = frame.subgroup_ids_by_type;
	view.subgroup_shard_views = frame
		.subgroup_shard_views
		.into_iter()
		.map(|shards| {
			shards
				.into_iter()
				.map(|frame| {
					let mut sub =
						SubView::new(frame.members, frame.is_sender, frame.mode);
					sub.joined = frame.joined;
					sub.departed = frame.departed;
					sub.my_rank = sub.rank_of(my_id);
					sub
				})
				.collect()
		})
		.collect();
	for (subgroup_id, shards) in view.subgroup_shard_views.iter().enumerate() {
		for (shard, sub) in shards.iter().enumerate() {
			if sub.my_rank.is_some() {
				view.my_subgroups.insert(subgroup_id as SubgroupId, shard);
			}
		}
	}
	view.is_adequately_provisioned = true;
	Ok(view)
}

/// Decodes a streamlined frame. The caller is responsible for running the
/// subgroup allocators before the view is usable.
pub fn decode_streamlined(
	bytes: &[u8],
	my_id: NodeId,
) -> Result<View, postcard::Error> {
	let frame: StreamlinedViewFrame = encoding::deserialize(bytes)?;
	let mut view = View::new(
		frame.vid,
		frame.members,
		frame.member_ips,
		frame.failed,
		frame.joined,
		frame.departed,
		None,
		frame.next_unassigned_rank,
	);
	view.my_rank = view.rank_of(my_id);
	Ok(view)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_view() -> View {
		let mut view = View::new(
			7,
			vec![NodeId(1), NodeId(2), NodeId(4)],
			vec!["10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.4".into()],
			vec![false, false, false],
			vec![NodeId(4)],
			vec![NodeId(3)],
			Some(1),
			2,
		);
		let mut shard = SubView::new(
			vec![NodeId(1), NodeId(2)],
			vec![true, true],
			Mode::Ordered,
		);
		shard.my_rank = Some(1);
		shard.joined = vec![NodeId(2)];
		view.subgroup_shard_views = vec![vec![shard]];
		view.subgroup_ids_by_type.insert("cache".into(), vec![0]);
		view.my_subgroups.insert(0, 0);
		view
	}

	#[test]
	fn full_round_trip_is_stable() {
		let view = sample_view();
		let bytes = encode_full(&view);
		let decoded = decode_full(&bytes, NodeId(2)).unwrap();
		assert_eq!(encode_full(&decoded), bytes);
		assert_eq!(decoded.my_rank, Some(1));
		assert_eq!(decoded.my_subgroups.get(&0), Some(&0));
		assert_eq!(decoded.subgroup_shard_views[0][0].my_rank, Some(1));
	}

	#[test]
	fn streamlined_round_trip_is_stable() {
		let view = sample_view();
		let bytes = encode_streamlined(&view);
		let decoded = decode_streamlined(&bytes, NodeId(1)).unwrap();
		assert_eq!(encode_streamlined(&decoded), bytes);
		assert_eq!(decoded.my_rank, Some(0));
		// layout is not transmitted in the streamlined form
		assert!(decoded.subgroup_shard_views.is_empty());
	}

	#[test]
	fn decode_localizes_to_non_member_as_unranked() {
		let view = sample_view();
		let bytes = encode_streamlined(&view);
		let decoded = decode_streamlined(&bytes, NodeId(99)).unwrap();
		assert_eq!(decoded.my_rank, None);
	}
}

//! Subgroup allocation: a pure function from a candidate membership to the
//! layout of subgroups and shards, with the inadequacy rollback that makes
//! view changes wait for more members instead of installing a view the
//! application could not run in.

pub mod sharded;

use {
	crate::{
		multicast::SubgroupSettings,
		view::{SubView, SubgroupId, View},
	},
	std::{collections::BTreeMap, sync::Arc},
	tracing::debug,
};

/// Returned by an allocator that cannot produce a usable layout from the
/// candidate membership. Recoverable: the view change waits for further
/// committed changes and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("candidate membership cannot adequately provision the subgroup layout")]
pub struct Inadequate;

/// A membership function for one subgroup type. Implementations must be
/// pure: the same view and watermark always produce the same layout, since
/// every member runs them independently and must agree.
pub trait Allocator: Send + Sync {
	/// Produces the shard layout of every subgroup of this type, advancing
	/// `next_unassigned_rank` past any members it consumed.
	fn allocate(
		&self,
		view: &View,
		next_unassigned_rank: &mut i32,
	) -> Result<Vec<Vec<SubView>>, Inadequate>;
}

/// The ordered list of named allocators a group is configured with. The
/// order is the allocation order and therefore part of the group contract.
#[derive(Clone, Default)]
pub struct SubgroupSpec {
	entries: Vec<(String, Arc<dyn Allocator>)>,
}

impl SubgroupSpec {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with(
		mut self,
		name: impl Into<String>,
		allocator: impl Allocator + 'static,
	) -> Self {
		self.entries.push((name.into(), Arc::new(allocator)));
		self
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn entries(&self) -> &[(String, Arc<dyn Allocator>)] {
		&self.entries
	}
}

/// The outcome of provisioning a view: the datapath settings for every
/// shard this node belongs to, and the total width of the per-sender
/// counter arrays.
#[derive(Debug, Default)]
pub struct Provisioned {
	pub settings: BTreeMap<SubgroupId, SubgroupSettings>,
	pub num_received_size: usize,
}

/// Runs the allocators against `view`, filling in its subgroup layout and
/// localized shard state. On inadequacy every piece of layout state is
/// rolled back and the view is left marked not adequately provisioned.
pub fn provision(
	spec: &SubgroupSpec,
	prev: Option<&View>,
	view: &mut View,
) -> Provisioned {
	let initial_watermark = view.next_unassigned_rank;
	view.subgroup_ids_by_type.clear();
	view.subgroup_shard_views.clear();
	view.my_subgroups.clear();
	view.is_adequately_provisioned = false;

	let my_id = view.my_rank.map(|rank| view.members[rank]);
	// allocation always consumes ranks from zero: the layout must be a
	// pure function of the membership, because a view travels with the
	// watermark its sender had *after* provisioning and every receiver
	// re-runs the allocators independently
	let mut watermark = 0;
	let mut provisioned = Provisioned::default();
	let mut num_received_offset = 0usize;

	for (type_name, allocator) in &spec.entries {
		let subgroups = match allocator.allocate(view, &mut watermark) {
			Ok(subgroups) => subgroups,
			Err(Inadequate) => {
				debug!(
					vid = view.vid,
					subgroup_type = %type_name,
					"candidate view is not adequately provisioned",
				);
				view.subgroup_ids_by_type.clear();
				view.subgroup_shard_views.clear();
				view.my_subgroups.clear();
				view.next_unassigned_rank = initial_watermark;
				return Provisioned::default();
			}
		};

		let mut type_ids = Vec::with_capacity(subgroups.len());
		for (subgroup_index, mut shards) in subgroups.into_iter().enumerate() {
			let subgroup_id = view.subgroup_shard_views.len() as SubgroupId;
			type_ids.push(subgroup_id);

			let max_shard_senders = shards
				.iter()
				.map(SubView::num_senders)
				.max()
				.unwrap_or(0);

			for (shard_num, shard) in shards.iter_mut().enumerate() {
				shard.my_rank =
					my_id.and_then(|my_id| shard.rank_of(my_id));

				if let Some(prev) = prev {
					fill_shard_deltas(prev, type_name, subgroup_index, shard_num, shard);
				}

				if let Some(shard_rank) = shard.my_rank {
					view.my_subgroups.insert(subgroup_id, shard_num);
					provisioned.settings.insert(subgroup_id, SubgroupSettings {
						shard_num,
						shard_rank,
						members: shard.members.clone(),
						is_sender: shard.is_sender.clone(),
						sender_rank: shard.sender_rank_of(shard_rank),
						num_received_offset,
						mode: shard.mode,
					});
				}
			}

			view.subgroup_shard_views.push(shards);
			num_received_offset += max_shard_senders;
		}
		view.subgroup_ids_by_type.insert(type_name.clone(), type_ids);
	}

	view.next_unassigned_rank = watermark;
	view.is_adequately_provisioned = true;
	provisioned.num_received_size = num_received_offset;
	provisioned
}

/// Recomputes datapath settings from a view whose layout was received
/// over the wire (total restart) instead of produced by the allocators.
/// Offsets accumulate in subgroup-id order, matching what every other
/// member derives.
pub fn derive_settings(view: &View) -> Provisioned {
	let mut provisioned = Provisioned::default();
	let mut num_received_offset = 0usize;
	for (subgroup_id, shards) in view.subgroup_shard_views.iter().enumerate() {
		let max_shard_senders =
			shards.iter().map(SubView::num_senders).max().unwrap_or(0);
		for (shard_num, shard) in shards.iter().enumerate() {
			if let Some(shard_rank) = shard.my_rank {
				provisioned.settings.insert(
					subgroup_id as SubgroupId,
					SubgroupSettings {
						shard_num,
						shard_rank,
						members: shard.members.clone(),
						is_sender: shard.is_sender.clone(),
						sender_rank: shard.sender_rank_of(shard_rank),
						num_received_offset,
						mode: shard.mode,
					},
				);
			}
		}
		num_received_offset += max_shard_senders;
	}
	provisioned.num_received_size = num_received_offset;
	provisioned
}

/// Initializes a shard's joined/departed deltas against the same shard of
/// the previous view, matched by allocator type and position.
fn fill_shard_deltas(
	prev: &View,
	type_name: &str,
	subgroup_index: usize,
	shard_num: usize,
	shard: &mut SubView,
) {
	let Some(prev_subgroup_id) = prev
		.subgroup_ids_by_type
		.get(type_name)
		.and_then(|ids| ids.get(subgroup_index))
	else {
		return;
	};
	let Some(prev_shard) = prev
		.subgroup_shard_views
		.get(*prev_subgroup_id as usize)
		.and_then(|shards| shards.get(shard_num))
	else {
		return;
	};
	shard.joined = shard
		.members
		.iter()
		.filter(|m| !prev_shard.members.contains(m))
		.copied()
		.collect();
	shard.departed = prev_shard
		.members
		.iter()
		.filter(|m| !shard.members.contains(m))
		.copied()
		.collect();
}

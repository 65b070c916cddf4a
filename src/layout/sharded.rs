//! The stock allocator: fixed-size shards assigned in rank order, plus a
//! spanning variant that puts every live member in one shard.

use {
	super::{Allocator, Inadequate},
	crate::view::{Mode, SubView, View},
};

/// Allocates one subgroup whose shards are filled with consecutive
/// unassigned ranks, or one spanning shard over all live members.
#[derive(Debug, Clone)]
pub struct ShardedAllocator {
	shape: Shape,
	mode: Mode,
}

#[derive(Debug, Clone)]
enum Shape {
	/// One shard per entry, each of a fixed size, consuming the rank
	/// watermark.
	Fixed(Vec<usize>),
	/// A single shard over every live member; inadequate below the
	/// minimum. Does not consume the watermark.
	Spanning(usize),
}

impl ShardedAllocator {
	pub fn fixed(shard_sizes: Vec<usize>, mode: Mode) -> Self {
		debug_assert!(!shard_sizes.is_empty());
		debug_assert!(shard_sizes.iter().all(|s| *s > 0));
		Self {
			shape: Shape::Fixed(shard_sizes),
			mode,
		}
	}

	pub fn spanning(min_nodes: usize, mode: Mode) -> Self {
		Self {
			shape: Shape::Spanning(min_nodes),
			mode,
		}
	}
}

impl Allocator for ShardedAllocator {
	fn allocate(
		&self,
		view: &View,
		next_unassigned_rank: &mut i32,
	) -> Result<Vec<Vec<SubView>>, Inadequate> {
		match &self.shape {
			Shape::Spanning(min_nodes) => {
				let members: Vec<_> = view
					.members
					.iter()
					.zip(&view.failed)
					.filter(|(_, failed)| !**failed)
					.map(|(m, _)| *m)
					.collect();
				if members.len() < *min_nodes {
					return Err(Inadequate);
				}
				Ok(vec![vec![SubView::all_senders(members, self.mode)]])
			}
			Shape::Fixed(shard_sizes) => {
				let mut shards = Vec::with_capacity(shard_sizes.len());
				let mut rank = (*next_unassigned_rank).max(0) as usize;
				for size in shard_sizes {
					let mut members = Vec::with_capacity(*size);
					while members.len() < *size && rank < view.num_members {
						if !view.failed[rank] {
							members.push(view.members[rank]);
						}
						rank += 1;
					}
					if members.len() < *size {
						return Err(Inadequate);
					}
					shards.push(SubView::all_senders(members, self.mode));
				}
				*next_unassigned_rank = rank as i32;
				Ok(vec![shards])
			}
		}
	}
}

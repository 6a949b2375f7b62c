//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use thin_vec::ThinVec;

use crate::scope::Scope;
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;
use crate::{ErrExtra, ErrPack, define_index_type};

pub mod algorithms;

//--------------------------------------------------------------------------------------------------

define_index_type!(RegionId);
define_index_type!(PartitionId);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegionGraphError {
	RegionIndexOutOfBounds,
	EmptyScope,
	TooFewParts,
	NotDisjoint,
	ScopeMismatch,
	OrderViolation,
}

/// A set of variables, decomposed by zero or more partitions.
pub struct RegionNode {
	scope: Scope,
	inputs: ThinVec<PartitionId>,
	consumers: usize,
}

impl RegionNode {
	pub fn scope(&self) -> &Scope {
		&self.scope
	}

	/// The alternative partitionings that produce this region.
	pub fn inputs(&self) -> &[PartitionId] {
		&self.inputs
	}

	pub fn is_leaf(&self) -> bool {
		self.inputs.is_empty()
	}
}

/// One way of splitting a region into disjoint sub-regions.
pub struct PartitionNode {
	inputs: ThinVec<RegionId>,
	output: RegionId,
}

impl PartitionNode {
	pub fn inputs(&self) -> &[RegionId] {
		&self.inputs
	}

	pub fn output(&self) -> RegionId {
		self.output
	}
}

/// Bipartite DAG of regions and partitions.
///
/// The graph is append-only and partitions may only reference regions with
/// smaller ids, so the arena order of regions is a topological order
/// (children always come before the regions they compose).
pub struct RegionGraph {
	regions: IndexVec<RegionId, RegionNode>,
	partitions: IndexVec<PartitionId, PartitionNode>,
}

impl Default for RegionGraph {
	fn default() -> Self {
		Self::new()
	}
}

impl RegionGraph {
	pub fn new() -> Self {
		Self {
			regions: IndexVec::new(),
			partitions: IndexVec::new(),
		}
	}

	pub fn add_region(&mut self, scope: Scope) -> Result<RegionId, ErrPack<RegionGraphError>> {
		if scope.is_empty() {
			cold_path();
			return Err(ErrPack {
				code: RegionGraphError::EmptyScope,
				extra: Some(Box::new(ErrExtra {
					message: "Cannot add a region with an empty scope".into(),
					nested: None,
				})),
			});
		}
		Ok(self.regions.push(RegionNode {
			scope,
			inputs: ThinVec::new(),
			consumers: 0,
		}))
	}

	fn check_region(&self, region: RegionId) -> Result<&RegionNode, ErrPack<RegionGraphError>> {
		let Some(node) = self.regions.get(region) else {
			cold_path();
			return Err(ErrPack {
				code: RegionGraphError::RegionIndexOutOfBounds,
				extra: Some(Box::new(ErrExtra {
					message: format!("Region index {} not found", region.raw).into(),
					nested: None,
				})),
			});
		};
		Ok(node)
	}

	/// Adds one partitioning of `region` into the disjoint sub-regions
	/// `parts`. The scopes of `parts` must exactly cover the scope of
	/// `region`, and all parts must have been created before `region`.
	pub fn add_partition(
		&mut self,
		region: RegionId,
		parts: &[RegionId],
	) -> Result<PartitionId, ErrPack<RegionGraphError>> {
		let region_scope = self.check_region(region)?.scope.clone();
		if parts.len() < 2 {
			cold_path();
			return Err(ErrPack {
				code: RegionGraphError::TooFewParts,
				extra: Some(Box::new(ErrExtra {
					message: format!(
						"A partition needs at least 2 parts, got {}",
						parts.len()
					)
					.into(),
					nested: None,
				})),
			});
		}

		let mut covered = Scope::empty();
		for &part in parts {
			let part_node = self.check_region(part)?;
			if part >= region {
				cold_path();
				return Err(ErrPack {
					code: RegionGraphError::OrderViolation,
					extra: Some(Box::new(ErrExtra {
						message: format!(
							"Partition parts must be created before the region they compose (part {} >= region {})",
							part.raw, region.raw
						)
						.into(),
						nested: None,
					})),
				});
			}
			if !covered.is_disjoint(&part_node.scope) {
				cold_path();
				return Err(ErrPack {
					code: RegionGraphError::NotDisjoint,
					extra: Some(Box::new(ErrExtra {
						message: format!(
							"Partition parts must have disjoint scopes, part {} overlaps {}",
							part_node.scope, covered
						)
						.into(),
						nested: None,
					})),
				});
			}
			covered.union_with(&part_node.scope);
		}
		if covered != region_scope {
			cold_path();
			return Err(ErrPack {
				code: RegionGraphError::ScopeMismatch,
				extra: Some(Box::new(ErrExtra {
					message: format!(
						"Partition covers {covered} but the region scope is {region_scope}"
					)
					.into(),
					nested: None,
				})),
			});
		}

		let partition = self.partitions.push(PartitionNode {
			inputs: parts.iter().copied().collect(),
			output: region,
		});
		#[allow(clippy::indexing_slicing)]
		{
			self.regions[region].inputs.push(partition);
			for &part in parts {
				self.regions[part].consumers += 1;
			}
		}
		Ok(partition)
	}

	pub fn num_regions(&self) -> usize {
		self.regions.len()
	}

	pub fn num_partitions(&self) -> usize {
		self.partitions.len()
	}

	/// Region ids in topological order (children before parents).
	pub fn region_ids(&self) -> impl DoubleEndedIterator<Item = RegionId> + use<> {
		self.regions.indexes()
	}

	#[allow(clippy::indexing_slicing)]
	pub fn leaves(&self) -> Vec<RegionId> {
		self.region_ids().filter(|&r| self.regions[r].is_leaf()).collect()
	}

	/// Regions that no partition consumes.
	#[allow(clippy::indexing_slicing)]
	pub fn roots(&self) -> Vec<RegionId> {
		self.region_ids().filter(|&r| self.regions[r].consumers == 0).collect()
	}

	#[allow(clippy::indexing_slicing)]
	pub fn is_root(&self, region: RegionId) -> bool {
		self.regions[region].consumers == 0
	}

	/// Union of the scopes of all root regions.
	#[allow(clippy::indexing_slicing)]
	pub fn scope(&self) -> Scope {
		let mut scope = Scope::empty();
		for root in self.roots() {
			scope.union_with(&self.regions[root].scope);
		}
		scope
	}

	pub fn num_variables(&self) -> usize {
		self.scope().max_var().map_or(0, |v| v + 1)
	}

	pub fn print_graphviz(&self) -> String {
		let mut s = String::new();
		let _ = self.__print_graphviz(&mut s);
		s
	}

	#[allow(clippy::indexing_slicing)]
	pub fn __print_graphviz<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
		writeln!(w, "digraph G {{")?;
		writeln!(w, "\trankdir=LR;")?;
		writeln!(w, "\tnewrank=true;")?;

		for i in self.regions.indexes() {
			let region = &self.regions[i];
			writeln!(w, "\tregion_{} [shape=box, label=\"{}\"];", i.raw, region.scope)?;
		}
		for i in self.partitions.indexes() {
			let partition = &self.partitions[i];
			writeln!(w, "\tpartition_{} [shape=point];", i.raw)?;
			for &part in &partition.inputs {
				writeln!(w, "\tregion_{} -> partition_{};", part.raw, i.raw)?;
			}
			writeln!(w, "\tpartition_{} -> region_{};", i.raw, partition.output.raw)?;
		}

		writeln!(w, "}}")?;
		Ok(())
	}
}

#[allow(clippy::indexing_slicing)]
impl std::ops::Index<RegionId> for RegionGraph {
	type Output = RegionNode;

	fn index(&self, index: RegionId) -> &RegionNode {
		&self.regions[index]
	}
}

#[allow(clippy::indexing_slicing)]
impl std::ops::Index<PartitionId> for RegionGraph {
	type Output = PartitionNode;

	fn index(&self, index: PartitionId) -> &PartitionNode {
		&self.partitions[index]
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_add_partition_checks() {
		let mut rg = RegionGraph::new();
		let a = rg.add_region(Scope::singleton(0)).unwrap();
		let b = rg.add_region(Scope::singleton(1)).unwrap();
		let ab = rg.add_region([0, 1].into_iter().collect()).unwrap();

		let err = rg.add_partition(ab, &[a]).unwrap_err();
		assert_eq!(err.code, RegionGraphError::TooFewParts);

		let err = rg.add_partition(ab, &[a, a]).unwrap_err();
		assert_eq!(err.code, RegionGraphError::NotDisjoint);

		let err = rg.add_partition(a, &[a, b]).unwrap_err();
		assert_eq!(err.code, RegionGraphError::OrderViolation);

		let err = rg.add_partition(ab, &[a, RegionId::new(99)]).unwrap_err();
		assert_eq!(err.code, RegionGraphError::RegionIndexOutOfBounds);

		rg.add_partition(ab, &[a, b]).unwrap();
		assert_eq!(rg.num_partitions(), 1);
		assert_eq!(rg.roots(), vec![ab]);
		assert_eq!(rg.leaves(), vec![a, b]);
		assert_eq!(rg.num_variables(), 2);
	}

	#[test]
	fn test_partition_must_cover_region() {
		let mut rg = RegionGraph::new();
		let a = rg.add_region(Scope::singleton(0)).unwrap();
		let b = rg.add_region(Scope::singleton(1)).unwrap();
		let abc = rg.add_region([0, 1, 2].into_iter().collect()).unwrap();

		let err = rg.add_partition(abc, &[a, b]).unwrap_err();
		assert_eq!(err.code, RegionGraphError::ScopeMismatch);
	}

	#[test]
	fn test_empty_scope_rejected() {
		let mut rg = RegionGraph::new();
		let err = rg.add_region(Scope::empty()).unwrap_err();
		assert_eq!(err.code, RegionGraphError::EmptyScope);
	}

	#[test]
	fn test_graphviz_dump() {
		let mut rg = RegionGraph::new();
		let a = rg.add_region(Scope::singleton(0)).unwrap();
		let b = rg.add_region(Scope::singleton(1)).unwrap();
		let ab = rg.add_region([0, 1].into_iter().collect()).unwrap();
		rg.add_partition(ab, &[a, b]).unwrap();

		let dot = rg.print_graphviz();
		assert!(dot.starts_with("digraph G {"));
		assert!(dot.contains("region_2 [shape=box, label=\"{0, 1}\"];"));
		assert!(dot.contains("partition_0 -> region_2;"));
	}
}

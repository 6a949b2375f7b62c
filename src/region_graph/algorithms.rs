//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Standard region graph templates.

use arrayvec::ArrayVec;

use super::{RegionGraph, RegionGraphError, RegionId};
use crate::ErrPack;
use crate::rng::Rng;
use crate::scope::Scope;
use crate::util::cold_path;

//--------------------------------------------------------------------------------------------------

fn check_num_vars(num_vars: usize) -> Result<(), ErrPack<RegionGraphError>> {
	if num_vars == 0 {
		cold_path();
		return Err(ErrPack::new(
			RegionGraphError::EmptyScope,
			"Cannot build a region graph over 0 variables",
		));
	}
	Ok(())
}

/// One region per variable, all joined by a single partition.
pub fn fully_factorized(num_vars: usize) -> Result<RegionGraph, ErrPack<RegionGraphError>> {
	check_num_vars(num_vars)?;
	let mut rg = RegionGraph::new();
	let leaves: Vec<RegionId> = (0..num_vars)
		.map(|v| rg.add_region(Scope::singleton(v)))
		.collect::<Result<_, _>>()?;
	if num_vars > 1 {
		let root = rg.add_region((0..num_vars).collect())?;
		rg.add_partition(root, &leaves)?;
	}
	Ok(rg)
}

/// A chain: variables are folded in one at a time.
pub fn linear_tree(num_vars: usize) -> Result<RegionGraph, ErrPack<RegionGraphError>> {
	check_num_vars(num_vars)?;
	let mut rg = RegionGraph::new();
	let mut acc = rg.add_region(Scope::singleton(0))?;
	for v in 1..num_vars {
		let leaf = rg.add_region(Scope::singleton(v))?;
		let parent = rg.add_region((0..=v).collect())?;
		rg.add_partition(parent, &[acc, leaf])?;
		acc = parent;
	}
	Ok(rg)
}

#[allow(clippy::indexing_slicing)]
fn split_balanced(
	rg: &mut RegionGraph,
	leaves: &[RegionId],
	vars: &[usize],
) -> Result<RegionId, ErrPack<RegionGraphError>> {
	if let &[v] = vars {
		return Ok(leaves[v]);
	}
	let mid = vars.len() / 2;
	let lhs = split_balanced(rg, leaves, &vars[..mid])?;
	let rhs = split_balanced(rg, leaves, &vars[mid..])?;
	let region = rg.add_region(vars.iter().copied().collect())?;
	rg.add_partition(region, &[lhs, rhs])?;
	Ok(region)
}

/// Balanced binary trees over random permutations of the variables.
///
/// All repetitions share the leaf regions and the root. The root ends up
/// with one partition per repetition, so circuits built from this graph
/// mix the repetitions at the top.
#[allow(clippy::indexing_slicing)]
pub fn random_binary_tree(
	num_vars: usize,
	num_repetitions: usize,
	rng: &mut Rng,
) -> Result<RegionGraph, ErrPack<RegionGraphError>> {
	check_num_vars(num_vars)?;
	if num_repetitions == 0 {
		cold_path();
		return Err(ErrPack::new(
			RegionGraphError::TooFewParts,
			"num_repetitions must be at least 1",
		));
	}
	let mut rg = RegionGraph::new();
	let leaves: Vec<RegionId> = (0..num_vars)
		.map(|v| rg.add_region(Scope::singleton(v)))
		.collect::<Result<_, _>>()?;
	if num_vars == 1 {
		return Ok(rg);
	}

	let mut perm: Vec<usize> = (0..num_vars).collect();
	let mut pairs = Vec::with_capacity(num_repetitions);
	for _ in 0..num_repetitions {
		rng.shuffle(&mut perm);
		let mid = num_vars / 2;
		let lhs = split_balanced(&mut rg, &leaves, &perm[..mid])?;
		let rhs = split_balanced(&mut rg, &leaves, &perm[mid..])?;
		pairs.push((lhs, rhs));
	}
	let root = rg.add_region((0..num_vars).collect())?;
	for (lhs, rhs) in pairs {
		rg.add_partition(root, &[lhs, rhs])?;
	}
	Ok(rg)
}

fn block_scope(r0: usize, r1: usize, c0: usize, c1: usize, width: usize) -> Scope {
	let mut scope = Scope::empty();
	for r in r0..r1 {
		for c in c0..c1 {
			scope.insert(r * width + c);
		}
	}
	scope
}

fn split_block(
	rg: &mut RegionGraph,
	(r0, r1): (usize, usize),
	(c0, c1): (usize, usize),
	width: usize,
	struct_decomp: bool,
) -> Result<RegionId, ErrPack<RegionGraphError>> {
	let rows = r1 - r0;
	let cols = c1 - c0;
	if rows == 1 && cols == 1 {
		return rg.add_region(Scope::singleton(r0 * width + c0));
	}
	if rows > 1 && cols > 1 {
		let rm = r0 + rows / 2;
		let cm = c0 + cols / 2;
		let tl = split_block(rg, (r0, rm), (c0, cm), width, struct_decomp)?;
		let tr = split_block(rg, (r0, rm), (cm, c1), width, struct_decomp)?;
		let bl = split_block(rg, (rm, r1), (c0, cm), width, struct_decomp)?;
		let br = split_block(rg, (rm, r1), (cm, c1), width, struct_decomp)?;
		if struct_decomp {
			let mut quads = ArrayVec::<RegionId, 4>::new();
			quads.extend([tl, tr, bl, br]);
			let region = rg.add_region(block_scope(r0, r1, c0, c1, width))?;
			rg.add_partition(region, &quads)?;
			Ok(region)
		} else {
			// Two alternative binary splits of the block. The quadrant
			// regions are shared between them.
			let top = rg.add_region(block_scope(r0, rm, c0, c1, width))?;
			rg.add_partition(top, &[tl, tr])?;
			let bottom = rg.add_region(block_scope(rm, r1, c0, c1, width))?;
			rg.add_partition(bottom, &[bl, br])?;
			let left = rg.add_region(block_scope(r0, r1, c0, cm, width))?;
			rg.add_partition(left, &[tl, bl])?;
			let right = rg.add_region(block_scope(r0, r1, cm, c1, width))?;
			rg.add_partition(right, &[tr, br])?;
			let region = rg.add_region(block_scope(r0, r1, c0, c1, width))?;
			rg.add_partition(region, &[top, bottom])?;
			rg.add_partition(region, &[left, right])?;
			Ok(region)
		}
	} else if rows > 1 {
		let rm = r0 + rows / 2;
		let top = split_block(rg, (r0, rm), (c0, c1), width, struct_decomp)?;
		let bottom = split_block(rg, (rm, r1), (c0, c1), width, struct_decomp)?;
		let region = rg.add_region(block_scope(r0, r1, c0, c1, width))?;
		rg.add_partition(region, &[top, bottom])?;
		Ok(region)
	} else {
		let cm = c0 + cols / 2;
		let left = split_block(rg, (r0, r1), (c0, cm), width, struct_decomp)?;
		let right = split_block(rg, (r0, r1), (cm, c1), width, struct_decomp)?;
		let region = rg.add_region(block_scope(r0, r1, c0, c1, width))?;
		rg.add_partition(region, &[left, right])?;
		Ok(region)
	}
}

/// Recursive quadrant splits of a `height` x `width` grid of variables.
/// Variable `v` sits at row `v / width`, column `v % width`.
///
/// With `struct_decomp` each block is split once into its four quadrants,
/// which keeps the graph structured-decomposable. Without it each block is
/// split both horizontally and vertically, with the quadrants shared
/// between the two alternatives.
pub fn quad_tree(
	height: usize,
	width: usize,
	struct_decomp: bool,
) -> Result<RegionGraph, ErrPack<RegionGraphError>> {
	check_num_vars(height * width)?;
	let mut rg = RegionGraph::new();
	split_block(&mut rg, (0, height), (0, width), width, struct_decomp)?;
	Ok(rg)
}

//--------------------------------------------------------------------------------------------------

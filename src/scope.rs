//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use bit_set::BitSet;

//--------------------------------------------------------------------------------------------------

/// Set of variable indexes carried by regions and circuit layers.
///
/// Iteration order is always ascending, so scopes can be compared and used
/// as map keys with deterministic results.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Scope {
	vars: BitSet,
}

impl Scope {
	pub fn empty() -> Self {
		Self { vars: BitSet::new() }
	}

	pub fn singleton(var: usize) -> Self {
		let mut vars = BitSet::new();
		vars.insert(var);
		Self { vars }
	}

	pub fn insert(&mut self, var: usize) -> bool {
		self.vars.insert(var)
	}

	pub fn contains(&self, var: usize) -> bool {
		self.vars.contains(var)
	}

	pub fn len(&self) -> usize {
		self.vars.len()
	}

	pub fn is_empty(&self) -> bool {
		self.vars.is_empty()
	}

	pub fn union(&self, other: &Self) -> Self {
		let mut vars = self.vars.clone();
		vars.union_with(&other.vars);
		Self { vars }
	}

	pub fn union_with(&mut self, other: &Self) {
		self.vars.union_with(&other.vars);
	}

	pub fn intersection(&self, other: &Self) -> Self {
		let mut vars = self.vars.clone();
		vars.intersect_with(&other.vars);
		Self { vars }
	}

	pub fn difference(&self, other: &Self) -> Self {
		let mut vars = self.vars.clone();
		vars.difference_with(&other.vars);
		Self { vars }
	}

	pub fn is_subset_of(&self, other: &Self) -> bool {
		self.vars.is_subset(&other.vars)
	}

	pub fn is_disjoint(&self, other: &Self) -> bool {
		self.vars.is_disjoint(&other.vars)
	}

	/// Ascending iteration over the variable indexes.
	pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
		self.vars.iter()
	}

	pub fn max_var(&self) -> Option<usize> {
		self.vars.iter().last()
	}

	/// Position of `var` within the ascending iteration, if present.
	pub fn position(&self, var: usize) -> Option<usize> {
		if !self.contains(var) {
			return None;
		}
		Some(self.vars.iter().take_while(|&v| v < var).count())
	}
}

impl FromIterator<usize> for Scope {
	fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
		Self { vars: BitSet::from_iter(iter) }
	}
}

impl std::hash::Hash for Scope {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		state.write_usize(self.vars.len());
		for v in self.vars.iter() {
			state.write_usize(v);
		}
	}
}

// Lexicographic over the ascending variable indexes.
impl Ord for Scope {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.vars.iter().cmp(other.vars.iter())
	}
}

impl PartialOrd for Scope {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl std::fmt::Display for Scope {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{{")?;
		for (i, v) in self.vars.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{v}")?;
		}
		write!(f, "}}")
	}
}

impl std::fmt::Debug for Scope {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		std::fmt::Display::fmt(self, f)
	}
}

//--------------------------------------------------------------------------------------------------

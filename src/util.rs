//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

pub mod index_vec;

/// Marks the enclosing branch as unlikely.
#[cold]
pub fn cold_path() {}

pub trait LossyInto<T> {
	fn lossy_into(self) -> T;
}

#[allow(clippy::cast_precision_loss)]
impl LossyInto<f64> for usize {
	fn lossy_into(self) -> f64 {
		self as f64
	}
}

#[allow(clippy::cast_precision_loss)]
impl LossyInto<f64> for u64 {
	fn lossy_into(self) -> f64 {
		self as f64
	}
}

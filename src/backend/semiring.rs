//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Evaluation semirings.
//!
//! A compiled circuit carries its values either as plain probabilities
//! ([`Semiring::SumProduct`]) or as log probabilities ([`Semiring::LogSumExp`]).
//! Sum layer weights are in linear space in both cases; log-space weighted
//! sums shift by the running maximum before exponentiating, so one batch
//! entry hitting `-inf` stays `-inf` instead of turning into a `NaN`.

use ndarray::{Array2, ArrayD};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Semiring {
	/// Values are probabilities. Fast and exact on small circuits, underflows
	/// on long products.
	SumProduct,
	/// Values are log probabilities.
	LogSumExp,
}

impl Semiring {
	/// The multiplicative unit.
	pub fn one(self) -> f64 {
		match self {
			Self::SumProduct => 1.0,
			Self::LogSumExp => 0.0,
		}
	}

	/// The additive unit, i.e. the value of an impossible event.
	pub fn zero(self) -> f64 {
		match self {
			Self::SumProduct => 0.0,
			Self::LogSumExp => f64::NEG_INFINITY,
		}
	}

	/// Maps a log-space scalar into the semiring.
	pub fn from_log(self, x: f64) -> f64 {
		match self {
			Self::SumProduct => x.exp(),
			Self::LogSumExp => x,
		}
	}

	pub fn mul(self, a: f64, b: f64) -> f64 {
		match self {
			Self::SumProduct => a * b,
			Self::LogSumExp => a + b,
		}
	}

	pub fn add(self, a: f64, b: f64) -> f64 {
		match self {
			Self::SumProduct => a + b,
			Self::LogSumExp => {
				let m = a.max(b);
				if m == f64::NEG_INFINITY {
					return f64::NEG_INFINITY;
				}
				m + ((a - m).exp() + (b - m).exp()).ln()
			},
		}
	}

	/// Semiring sum of a sequence of scalars.
	pub fn sum<I: IntoIterator<Item = f64>>(self, xs: I) -> f64 {
		match self {
			Self::SumProduct => xs.into_iter().sum(),
			Self::LogSumExp => {
				let xs: Vec<f64> = xs.into_iter().collect();
				let m = xs.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
				if m == f64::NEG_INFINITY {
					return f64::NEG_INFINITY;
				}
				m + xs.iter().map(|&x| (x - m).exp()).sum::<f64>().ln()
			},
		}
	}

	/// Elementwise semiring product of equally shaped `(batch, units)` values.
	#[allow(clippy::indexing_slicing)]
	pub fn prod(self, xs: &[&Array2<f64>]) -> Array2<f64> {
		debug_assert!(!xs.is_empty());
		let mut acc = xs[0].clone();
		for x in &xs[1..] {
			match self {
				Self::SumProduct => acc *= *x,
				Self::LogSumExp => acc += *x,
			}
		}
		acc
	}

	/// All-pairs product, lhs-major: `out[b, i * R + j] = lhs[b, i] * rhs[b, j]`.
	#[allow(clippy::indexing_slicing)]
	pub fn outer_mul(self, lhs: &Array2<f64>, rhs: &Array2<f64>) -> Array2<f64> {
		let (batch, l) = lhs.dim();
		let r = rhs.dim().1;
		let mut out = Array2::zeros((batch, l * r));
		for b in 0..batch {
			for i in 0..l {
				for j in 0..r {
					out[[b, i * r + j]] = self.mul(lhs[[b, i]], rhs[[b, j]]);
				}
			}
		}
		out
	}

	/// Dense sum layer: `out[b, o] = sum_i weight[o, i] * x[b, i]`, with
	/// `x` in the semiring and `weight` in linear space.
	#[allow(clippy::indexing_slicing)]
	pub fn weighted_sum(self, x: &Array2<f64>, weight: &ArrayD<f64>) -> Array2<f64> {
		let (batch, num_in) = x.dim();
		let num_out = weight.shape()[0];
		debug_assert_eq!(weight.shape(), &[num_out, num_in]);
		let mut out = Array2::zeros((batch, num_out));
		match self {
			Self::SumProduct => {
				for b in 0..batch {
					for o in 0..num_out {
						let mut acc = 0.0;
						for i in 0..num_in {
							acc += weight[[o, i]] * x[[b, i]];
						}
						out[[b, o]] = acc;
					}
				}
			},
			Self::LogSumExp => {
				for b in 0..batch {
					let mut m = f64::NEG_INFINITY;
					for i in 0..num_in {
						m = m.max(x[[b, i]]);
					}
					for o in 0..num_out {
						out[[b, o]] = if m == f64::NEG_INFINITY {
							f64::NEG_INFINITY
						} else {
							let mut acc = 0.0;
							for i in 0..num_in {
								acc += weight[[o, i]] * (x[[b, i]] - m).exp();
							}
							acc.ln() + m
						};
					}
				}
			},
		}
		out
	}

	/// Mixing sum layer: `out[b, k] = sum_h weight[k, h] * xs[h][b, k]`,
	/// with the children in the semiring and `weight` in linear space.
	#[allow(clippy::indexing_slicing)]
	pub fn mixing_sum(self, xs: &[&Array2<f64>], weight: &ArrayD<f64>) -> Array2<f64> {
		debug_assert!(!xs.is_empty());
		let (batch, units) = xs[0].dim();
		debug_assert_eq!(weight.shape(), &[units, xs.len()]);
		let mut out = Array2::zeros((batch, units));
		match self {
			Self::SumProduct => {
				for b in 0..batch {
					for k in 0..units {
						let mut acc = 0.0;
						for (h, x) in xs.iter().enumerate() {
							acc += weight[[k, h]] * x[[b, k]];
						}
						out[[b, k]] = acc;
					}
				}
			},
			Self::LogSumExp => {
				for b in 0..batch {
					for k in 0..units {
						let mut m = f64::NEG_INFINITY;
						for x in xs {
							m = m.max(x[[b, k]]);
						}
						out[[b, k]] = if m == f64::NEG_INFINITY {
							f64::NEG_INFINITY
						} else {
							let mut acc = 0.0;
							for (h, x) in xs.iter().enumerate() {
								acc += weight[[k, h]] * (x[[b, k]] - m).exp();
							}
							acc.ln() + m
						};
					}
				}
			},
		}
		out
	}
}

//--------------------------------------------------------------------------------------------------

//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Compiled layers.
//!
//! A [`TensorLayer`] evaluates one batch at a time: children come in as
//! `(batch, units)` matrices in the semiring's domain and the layer produces
//! its own `(batch, units)` matrix. Input layers read the circuit input
//! `(batch, channels, variables)` at their variable instead.
//!
//! The backward pass works in log space only. Each layer returns the
//! gradients w.r.t. its children's outputs and queues the gradients of its
//! parameters on the shared [`Autograd`] worklist.

use ndarray::{Array2, Array3, ArrayD, Axis, IxDyn};
use smallvec::{SmallVec, smallvec};

use super::EvalError;
use super::parameters::{Autograd, TensorParam, logsumexp, softmax_lanes};
use super::semiring::Semiring;
use crate::ErrPack;
use crate::util::LossyInto;

//--------------------------------------------------------------------------------------------------

#[cold]
#[inline(never)]
fn missing_input() -> ErrPack<EvalError> {
	ErrPack::new(
		EvalError::InvalidInputShape,
		"The circuit reads input variables but no input was given",
	)
}

#[cold]
#[inline(never)]
fn category_out_of_bounds(value: f64, num_categories: usize) -> ErrPack<EvalError> {
	ErrPack::new(
		EvalError::CategoryOutOfBounds,
		format!("Categorical input {value} is outside 0..{num_categories}"),
	)
}

#[cold]
#[inline(never)]
fn backward_unsupported(message: &'static str) -> ErrPack<EvalError> {
	ErrPack::new(EvalError::BackwardUnsupported, message)
}

//--------------------------------------------------------------------------------------------------

/// Categorical table, either probabilities or logits.
#[derive(Debug)]
pub enum CategoricalSource {
	Probs(TensorParam),
	Logits(TensorParam),
}

impl CategoricalSource {
	pub fn param(&self) -> &TensorParam {
		match self {
			Self::Probs(p) | Self::Logits(p) => p,
		}
	}

	/// Normalized log probabilities, shape `(units, channels, categories)`.
	fn log_probs(&self) -> ArrayD<f64> {
		match self {
			Self::Probs(p) => p.value().mapv(f64::ln),
			Self::Logits(l) => {
				let x = l.value();
				let mut out = (*x).clone();
				for mut lane in out.lanes_mut(Axis(2)) {
					let lse = logsumexp(lane.view());
					for v in lane.iter_mut() {
						*v -= lse;
					}
				}
				out
			},
		}
	}
}

#[derive(Debug)]
pub enum TensorLayer {
	Categorical {
		var: usize,
		num_units: usize,
		num_channels: usize,
		num_categories: usize,
		param: CategoricalSource,
	},
	Gaussian {
		var: usize,
		num_units: usize,
		num_channels: usize,
		mean: TensorParam,
		stddev: TensorParam,
		log_partition: Option<TensorParam>,
	},
	Polynomial {
		var: usize,
		num_units: usize,
		coeff: TensorParam,
	},
	LogPartition {
		num_units: usize,
		value: TensorParam,
	},
	Evidence {
		inner: Box<TensorLayer>,
		observation: Vec<f64>,
	},
	Dense {
		num_units: usize,
		num_input_units: usize,
		weight: TensorParam,
	},
	Mixing {
		num_units: usize,
		arity: usize,
		weight: TensorParam,
	},
	Hadamard {
		num_units: usize,
		arity: usize,
	},
	Kronecker {
		lhs_units: usize,
		rhs_units: usize,
	},
}

/// Extracts the per-channel values of one variable: `(batch, channels)`.
fn input_vals(
	x: Option<&Array3<f64>>,
	var: usize,
	num_channels: usize,
	batch: usize,
) -> Result<Array2<f64>, ErrPack<EvalError>> {
	let Some(x) = x else {
		return Err(missing_input());
	};
	debug_assert!(var < x.dim().2);
	#[allow(clippy::indexing_slicing)]
	Ok(Array2::from_shape_fn((batch, num_channels), |(b, ch)| x[[b, ch, var]]))
}

#[allow(clippy::indexing_slicing)]
fn broadcast_observation(observation: &[f64], batch: usize) -> Array2<f64> {
	Array2::from_shape_fn((batch, observation.len()), |(_, ch)| observation[ch])
}

impl TensorLayer {
	pub fn num_units(&self) -> usize {
		match self {
			Self::Categorical { num_units, .. }
			| Self::Gaussian { num_units, .. }
			| Self::Polynomial { num_units, .. }
			| Self::LogPartition { num_units, .. }
			| Self::Dense { num_units, .. }
			| Self::Mixing { num_units, .. }
			| Self::Hadamard { num_units, .. } => *num_units,
			Self::Evidence { inner, .. } => inner.num_units(),
			Self::Kronecker { lhs_units, rhs_units } => lhs_units * rhs_units,
		}
	}

	/// Evaluates the layer for one batch. `children` are the outputs of the
	/// layer's inputs in order, `x` is the circuit input for input layers.
	#[allow(clippy::indexing_slicing)]
	pub fn forward(
		&self,
		children: &[&Array2<f64>],
		x: Option<&Array3<f64>>,
		batch: usize,
		semiring: Semiring,
	) -> Result<Array2<f64>, ErrPack<EvalError>> {
		match self {
			Self::Categorical { var, num_channels, .. }
			| Self::Gaussian { var, num_channels, .. } => {
				let vals = input_vals(x, *var, *num_channels, batch)?;
				self.forward_input(&vals, semiring)
			},
			Self::Polynomial { var, .. } => {
				let vals = input_vals(x, *var, 1, batch)?;
				self.forward_input(&vals, semiring)
			},
			Self::LogPartition { num_units, value } => {
				let v = value.value();
				let mut out = Array2::zeros((batch, *num_units));
				for b in 0..batch {
					for u in 0..*num_units {
						out[[b, u]] = semiring.from_log(v[[u]]);
					}
				}
				Ok(out)
			},
			Self::Evidence { inner, observation } => {
				let vals = broadcast_observation(observation, batch);
				inner.forward_input(&vals, semiring)
			},
			Self::Dense { weight, .. } => {
				debug_assert_eq!(children.len(), 1);
				let w = weight.value();
				Ok(semiring.weighted_sum(children[0], &w))
			},
			Self::Mixing { weight, .. } => {
				let w = weight.value();
				Ok(semiring.mixing_sum(children, &w))
			},
			Self::Hadamard { .. } => Ok(semiring.prod(children)),
			Self::Kronecker { .. } => {
				debug_assert_eq!(children.len(), 2);
				Ok(semiring.outer_mul(children[0], children[1]))
			},
		}
	}

	/// Distribution layers evaluated at explicit per-channel values.
	#[allow(clippy::indexing_slicing, clippy::panic_in_result_fn)]
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	fn forward_input(
		&self,
		vals: &Array2<f64>,
		semiring: Semiring,
	) -> Result<Array2<f64>, ErrPack<EvalError>> {
		let batch = vals.dim().0;
		match self {
			Self::Categorical { num_units, num_channels, num_categories, param, .. } => {
				let upper: f64 = (*num_categories).lossy_into();
				for &v in vals {
					if !(v >= 0.0 && v < upper) {
						return Err(category_out_of_bounds(v, *num_categories));
					}
				}
				let log_probs = param.log_probs();
				let mut out = Array2::zeros((batch, *num_units));
				for b in 0..batch {
					for u in 0..*num_units {
						let mut ll = 0.0;
						for ch in 0..*num_channels {
							let cat = vals[[b, ch]] as usize;
							ll += log_probs[[u, ch, cat]];
						}
						out[[b, u]] = semiring.from_log(ll);
					}
				}
				Ok(out)
			},
			Self::Gaussian { num_units, num_channels, mean, stddev, log_partition, .. } => {
				let m = mean.value();
				let s = stddev.value();
				let lp = log_partition.as_ref().map(TensorParam::value);
				let ln_2pi = (2.0 * std::f64::consts::PI).ln();
				let mut out = Array2::zeros((batch, *num_units));
				for b in 0..batch {
					for u in 0..*num_units {
						let mut ll = 0.0;
						for ch in 0..*num_channels {
							let z = (vals[[b, ch]] - m[[u, ch]]) / s[[u, ch]];
							ll -= 0.5 * z * z + s[[u, ch]].ln() + 0.5 * ln_2pi;
							if let Some(lp) = &lp {
								ll += lp[[u, ch]];
							}
						}
						out[[b, u]] = semiring.from_log(ll);
					}
				}
				Ok(out)
			},
			Self::Polynomial { num_units, coeff, .. } => {
				// Polynomials only compile under the linear semiring; the
				// output is the raw polynomial value, not a log density.
				debug_assert_eq!(semiring, Semiring::SumProduct);
				let c = coeff.value();
				let n_coeff = c.shape()[1];
				let mut out = Array2::zeros((batch, *num_units));
				for b in 0..batch {
					let xv = vals[[b, 0]];
					for u in 0..*num_units {
						let mut acc = 0.0;
						for k in (0..n_coeff).rev() {
							acc = acc * xv + c[[u, k]];
						}
						out[[b, u]] = acc;
					}
				}
				Ok(out)
			},
			_ => unreachable!(), // `Evidence` wraps distribution layers only
		}
	}

	/// Pushes `d_output` down to the children and queues parameter gradients.
	/// `output` is this layer's forward value from the same trace. Log space
	/// only.
	#[allow(clippy::indexing_slicing, clippy::too_many_lines)]
	pub fn backward(
		&self,
		autograd: &mut Autograd,
		children: &[&Array2<f64>],
		x: Option<&Array3<f64>>,
		output: &Array2<f64>,
		d_output: &Array2<f64>,
	) -> Result<SmallVec<[Array2<f64>; 4]>, ErrPack<EvalError>> {
		let batch = d_output.dim().0;
		match self {
			Self::Categorical { var, num_channels, .. }
			| Self::Gaussian { var, num_channels, .. } => {
				let vals = input_vals(x, *var, *num_channels, batch)?;
				self.backward_input(autograd, &vals, d_output)?;
				Ok(SmallVec::new())
			},
			Self::Polynomial { .. } => {
				Err(backward_unsupported("Polynomial layers are forward-only"))
			},
			Self::LogPartition { num_units, value } => {
				let mut g = ArrayD::zeros(IxDyn(&[*num_units]));
				for b in 0..batch {
					for u in 0..*num_units {
						g[[u]] += d_output[[b, u]];
					}
				}
				autograd.set_grad(value, g);
				Ok(SmallVec::new())
			},
			Self::Evidence { inner, observation } => {
				let vals = broadcast_observation(observation, batch);
				inner.backward_input(autograd, &vals, d_output)?;
				Ok(SmallVec::new())
			},
			Self::Dense { num_units, num_input_units, weight } => {
				debug_assert_eq!(children.len(), 1);
				let c = children[0];
				let w = weight.value();
				let mut d_child = Array2::zeros((batch, *num_input_units));
				let mut d_w = ArrayD::zeros(w.raw_dim());
				for b in 0..batch {
					for o in 0..*num_units {
						let d = d_output[[b, o]];
						let y = output[[b, o]];
						if d == 0.0 || !y.is_finite() {
							continue;
						}
						for i in 0..*num_input_units {
							let e = (c[[b, i]] - y).exp();
							d_child[[b, i]] += d * w[[o, i]] * e;
							d_w[[o, i]] += d * e;
						}
					}
				}
				autograd.set_grad(weight, d_w);
				Ok(smallvec![d_child])
			},
			Self::Mixing { num_units, arity, weight } => {
				debug_assert_eq!(children.len(), *arity);
				let w = weight.value();
				let mut grads: SmallVec<[Array2<f64>; 4]> =
					children.iter().map(|_| Array2::zeros((batch, *num_units))).collect();
				let mut d_w = ArrayD::zeros(w.raw_dim());
				for b in 0..batch {
					for k in 0..*num_units {
						let d = d_output[[b, k]];
						let y = output[[b, k]];
						if d == 0.0 || !y.is_finite() {
							continue;
						}
						for h in 0..*arity {
							let e = (children[h][[b, k]] - y).exp();
							grads[h][[b, k]] += d * w[[k, h]] * e;
							d_w[[k, h]] += d * e;
						}
					}
				}
				autograd.set_grad(weight, d_w);
				Ok(grads)
			},
			Self::Hadamard { .. } => {
				// log space: the output is the plain sum of the children
				Ok(children.iter().map(|_| d_output.clone()).collect())
			},
			Self::Kronecker { lhs_units, rhs_units } => {
				let mut d_l = Array2::zeros((batch, *lhs_units));
				let mut d_r = Array2::zeros((batch, *rhs_units));
				for b in 0..batch {
					for i in 0..*lhs_units {
						for j in 0..*rhs_units {
							let d = d_output[[b, i * rhs_units + j]];
							d_l[[b, i]] += d;
							d_r[[b, j]] += d;
						}
					}
				}
				Ok(smallvec![d_l, d_r])
			},
		}
	}

	/// Queues the log-density gradients of a distribution layer's parameters.
	#[allow(clippy::indexing_slicing, clippy::panic_in_result_fn)]
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	fn backward_input(
		&self,
		autograd: &mut Autograd,
		vals: &Array2<f64>,
		d_output: &Array2<f64>,
	) -> Result<(), ErrPack<EvalError>> {
		let batch = vals.dim().0;
		match self {
			Self::Categorical { num_units, num_channels, num_categories, param, .. } => {
				match param {
					CategoricalSource::Probs(p) => {
						let pv = p.value();
						let mut g = ArrayD::zeros(pv.raw_dim());
						for b in 0..batch {
							for u in 0..*num_units {
								let d = d_output[[b, u]];
								if d == 0.0 {
									continue;
								}
								for ch in 0..*num_channels {
									let cat = vals[[b, ch]] as usize;
									g[[u, ch, cat]] += d / pv[[u, ch, cat]];
								}
							}
						}
						autograd.set_grad(p, g);
					},
					CategoricalSource::Logits(l) => {
						let sm = softmax_lanes(&l.value(), 2);
						let mut g = ArrayD::zeros(sm.raw_dim());
						for b in 0..batch {
							for u in 0..*num_units {
								let d = d_output[[b, u]];
								if d == 0.0 {
									continue;
								}
								for ch in 0..*num_channels {
									let cat = vals[[b, ch]] as usize;
									g[[u, ch, cat]] += d;
									for c in 0..*num_categories {
										g[[u, ch, c]] -= d * sm[[u, ch, c]];
									}
								}
							}
						}
						autograd.set_grad(l, g);
					},
				}
				Ok(())
			},
			Self::Gaussian { num_units, num_channels, mean, stddev, log_partition, .. } => {
				let m = mean.value();
				let s = stddev.value();
				let mut d_m = ArrayD::zeros(m.raw_dim());
				let mut d_s = ArrayD::zeros(s.raw_dim());
				let mut d_lp =
					log_partition.as_ref().map(|lp| ArrayD::zeros(IxDyn(lp.shape())));
				for b in 0..batch {
					for u in 0..*num_units {
						let d = d_output[[b, u]];
						if d == 0.0 {
							continue;
						}
						for ch in 0..*num_channels {
							let sd = s[[u, ch]];
							let z = (vals[[b, ch]] - m[[u, ch]]) / sd;
							d_m[[u, ch]] += d * z / sd;
							d_s[[u, ch]] += d * (z * z - 1.0) / sd;
							if let Some(d_lp) = &mut d_lp {
								d_lp[[u, ch]] += d;
							}
						}
					}
				}
				autograd.set_grad(mean, d_m);
				autograd.set_grad(stddev, d_s);
				if let (Some(lp), Some(d_lp)) = (log_partition, d_lp) {
					autograd.set_grad(lp, d_lp);
				}
				Ok(())
			},
			Self::Polynomial { .. } => {
				Err(backward_unsupported("Polynomial layers are forward-only"))
			},
			_ => unreachable!(), // `Evidence` wraps distribution layers only
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::rc::Rc;

	use assert_approx_eq::assert_approx_eq;
	use ndarray::arr2;

	use super::super::parameters::TensorParamOp;
	use super::*;
	use crate::opt;

	fn leaf(shape: &[usize], values: &[f64]) -> (TensorParam, Rc<RefCell<opt::Param>>) {
		let value = ArrayD::from_shape_vec(IxDyn(shape), values.to_vec()).unwrap();
		let storage = Rc::new(RefCell::new(opt::Param::new(value, true)));
		let param = TensorParam::new(shape, TensorParamOp::Leaf { storage: Rc::clone(&storage) });
		(param, storage)
	}

	fn input(batch_vals: &[[f64; 1]]) -> Array3<f64> {
		// one channel, one variable
		let batch = batch_vals.len();
		Array3::from_shape_fn((batch, 1, 1), |(b, _, _)| batch_vals[b][0])
	}

	#[test]
	fn test_categorical_probs_and_logits_agree() {
		let probs: [f64; 6] = [0.2, 0.3, 0.5, 0.6, 0.1, 0.3];
		let logits: Vec<f64> = probs.iter().map(|p| p.ln() + 7.0).collect();
		let (p, _) = leaf(&[2, 1, 3], &probs);
		let (l, _) = leaf(&[2, 1, 3], &logits);

		let with_probs = TensorLayer::Categorical {
			var: 0,
			num_units: 2,
			num_channels: 1,
			num_categories: 3,
			param: CategoricalSource::Probs(p),
		};
		let with_logits = TensorLayer::Categorical {
			var: 0,
			num_units: 2,
			num_channels: 1,
			num_categories: 3,
			param: CategoricalSource::Logits(l),
		};

		let x = input(&[[0.0], [1.0], [2.0]]);
		for semiring in [Semiring::SumProduct, Semiring::LogSumExp] {
			let a = with_probs.forward(&[], Some(&x), 3, semiring).unwrap();
			let b = with_logits.forward(&[], Some(&x), 3, semiring).unwrap();
			for (a, b) in a.iter().zip(b.iter()) {
				assert_approx_eq!(a, b, 1e-12);
			}
		}
		let out = with_probs.forward(&[], Some(&x), 3, Semiring::SumProduct).unwrap();
		assert_approx_eq!(out[[0, 0]], 0.2, 1e-12);
		assert_approx_eq!(out[[2, 1]], 0.3, 1e-12);
	}

	#[test]
	fn test_categorical_rejects_bad_category() {
		let (p, _) = leaf(&[1, 1, 2], &[0.4, 0.6]);
		let layer = TensorLayer::Categorical {
			var: 0,
			num_units: 1,
			num_channels: 1,
			num_categories: 2,
			param: CategoricalSource::Probs(p),
		};
		let x = input(&[[2.0]]);
		let err = layer.forward(&[], Some(&x), 1, Semiring::LogSumExp).unwrap_err();
		assert_eq!(err.code, EvalError::CategoryOutOfBounds);

		let x = input(&[[-1.0]]);
		let err = layer.forward(&[], Some(&x), 1, Semiring::LogSumExp).unwrap_err();
		assert_eq!(err.code, EvalError::CategoryOutOfBounds);
	}

	#[test]
	fn test_gaussian_forward_density() {
		let (m, _) = leaf(&[1, 1], &[0.0]);
		let (s, _) = leaf(&[1, 1], &[1.0]);
		let layer = TensorLayer::Gaussian {
			var: 0,
			num_units: 1,
			num_channels: 1,
			mean: m,
			stddev: s,
			log_partition: None,
		};
		let x = input(&[[0.0], [1.0]]);
		let out = layer.forward(&[], Some(&x), 2, Semiring::LogSumExp).unwrap();
		let ln_norm = -0.5 * (2.0 * std::f64::consts::PI).ln();
		assert_approx_eq!(out[[0, 0]], ln_norm, 1e-12);
		assert_approx_eq!(out[[1, 0]], ln_norm - 0.5, 1e-12);
	}

	#[test]
	fn test_polynomial_forward_horner() {
		let (c, _) = leaf(&[2, 3], &[1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
		let layer = TensorLayer::Polynomial { var: 0, num_units: 2, coeff: c };
		let x = input(&[[2.0]]);
		let out = layer.forward(&[], Some(&x), 1, Semiring::SumProduct).unwrap();
		// 1 + 2*2 + 3*4 = 17, -1 + 0 + 4 = 3
		assert_approx_eq!(out[[0, 0]], 17.0, 1e-12);
		assert_approx_eq!(out[[0, 1]], 3.0, 1e-12);
	}

	#[test]
	fn test_evidence_broadcasts_observation() {
		let (p, _) = leaf(&[2, 1, 3], &[0.2, 0.3, 0.5, 0.6, 0.1, 0.3]);
		let inner = TensorLayer::Categorical {
			var: 0,
			num_units: 2,
			num_channels: 1,
			num_categories: 3,
			param: CategoricalSource::Probs(p),
		};
		let layer = TensorLayer::Evidence { inner: Box::new(inner), observation: vec![1.0] };
		let out = layer.forward(&[], None, 3, Semiring::SumProduct).unwrap();
		for b in 0..3 {
			assert_approx_eq!(out[[b, 0]], 0.3, 1e-12);
			assert_approx_eq!(out[[b, 1]], 0.1, 1e-12);
		}
	}

	#[test]
	fn test_log_partition_forward() {
		let (v, _) = leaf(&[2], &[0.0, -1.0]);
		let layer = TensorLayer::LogPartition { num_units: 2, value: v };
		let out = layer.forward(&[], None, 2, Semiring::SumProduct).unwrap();
		assert_approx_eq!(out[[0, 0]], 1.0, 1e-12);
		assert_approx_eq!(out[[1, 1]], (-1.0_f64).exp(), 1e-12);
	}

	#[test]
	fn test_dense_backward_matches_finite_diff() {
		let (w, sw) = leaf(&[2, 3], &[0.5, 0.2, 0.3, 0.1, 0.8, 0.1]);
		let layer = TensorLayer::Dense { num_units: 2, num_input_units: 3, weight: w.clone() };

		let child = arr2(&[[-0.1_f64, -1.2, -0.7], [-2.0, -0.3, -0.9]]);
		let d_out = arr2(&[[1.0, 0.5], [-0.3, 0.7]]);
		let loss = |child: &Array2<f64>| -> f64 {
			w.invalidate();
			let out = layer.forward(&[child], None, 2, Semiring::LogSumExp).unwrap();
			(&out * &d_out).sum()
		};

		let out = layer.forward(&[&child], None, 2, Semiring::LogSumExp).unwrap();
		let mut autograd = Autograd::new();
		let grads = layer.backward(&mut autograd, &[&child], None, &out, &d_out).unwrap();
		autograd.run().unwrap();

		let h = 1e-6;
		for b in 0..2 {
			for i in 0..3 {
				let mut c = child.clone();
				c[[b, i]] += h;
				let up = loss(&c);
				c[[b, i]] -= 2.0 * h;
				let down = loss(&c);
				assert_approx_eq!(grads[0][[b, i]], (up - down) / (2.0 * h), 1e-5);
			}
		}
		let analytic = sw.borrow().grad().unwrap().clone();
		for o in 0..2 {
			for i in 0..3 {
				let orig = sw.borrow().value()[[o, i]];
				sw.borrow_mut().value_mut()[[o, i]] = orig + h;
				let up = loss(&child);
				sw.borrow_mut().value_mut()[[o, i]] = orig - h;
				let down = loss(&child);
				sw.borrow_mut().value_mut()[[o, i]] = orig;
				assert_approx_eq!(analytic[[o, i]], (up - down) / (2.0 * h), 1e-5);
			}
		}
	}

	#[test]
	fn test_mixing_backward_matches_finite_diff() {
		let (w, sw) = leaf(&[2, 2], &[0.7, 0.3, 0.4, 0.6]);
		let layer = TensorLayer::Mixing { num_units: 2, arity: 2, weight: w.clone() };

		let c0 = arr2(&[[-0.1_f64, -1.2], [-2.0, -0.3]]);
		let c1 = arr2(&[[-0.8_f64, -0.4], [-0.6, -1.5]]);
		let d_out = arr2(&[[1.0, -0.5], [0.3, 0.7]]);
		let loss = |c0: &Array2<f64>, c1: &Array2<f64>| -> f64 {
			w.invalidate();
			let out = layer.forward(&[c0, c1], None, 2, Semiring::LogSumExp).unwrap();
			(&out * &d_out).sum()
		};

		let out = layer.forward(&[&c0, &c1], None, 2, Semiring::LogSumExp).unwrap();
		let mut autograd = Autograd::new();
		let grads = layer.backward(&mut autograd, &[&c0, &c1], None, &out, &d_out).unwrap();
		autograd.run().unwrap();

		let h = 1e-6;
		for b in 0..2 {
			for k in 0..2 {
				let mut c = c0.clone();
				c[[b, k]] += h;
				let up = loss(&c, &c1);
				c[[b, k]] -= 2.0 * h;
				let down = loss(&c, &c1);
				assert_approx_eq!(grads[0][[b, k]], (up - down) / (2.0 * h), 1e-5);
			}
		}
		let analytic = sw.borrow().grad().unwrap().clone();
		for k in 0..2 {
			for hh in 0..2 {
				let orig = sw.borrow().value()[[k, hh]];
				sw.borrow_mut().value_mut()[[k, hh]] = orig + h;
				let up = loss(&c0, &c1);
				sw.borrow_mut().value_mut()[[k, hh]] = orig - h;
				let down = loss(&c0, &c1);
				sw.borrow_mut().value_mut()[[k, hh]] = orig;
				assert_approx_eq!(analytic[[k, hh]], (up - down) / (2.0 * h), 1e-5);
			}
		}
	}

	#[test]
	fn test_product_backward() {
		let d_out = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
		let hadamard = TensorLayer::Hadamard { num_units: 2, arity: 3 };
		let c = arr2(&[[-0.5_f64, -1.0], [-2.0, -0.1]]);
		let out = hadamard.forward(&[&c, &c, &c], None, 2, Semiring::LogSumExp).unwrap();
		let mut autograd = Autograd::new();
		let grads =
			hadamard.backward(&mut autograd, &[&c, &c, &c], None, &out, &d_out).unwrap();
		assert_eq!(grads.len(), 3);
		for g in &grads {
			assert_eq!(g, &d_out);
		}

		let kron = TensorLayer::Kronecker { lhs_units: 2, rhs_units: 2 };
		let l = arr2(&[[-0.5_f64, -1.0]]);
		let r = arr2(&[[-0.2_f64, -0.8]]);
		let out = kron.forward(&[&l, &r], None, 1, Semiring::LogSumExp).unwrap();
		let d_out = arr2(&[[1.0, 2.0, 4.0, 8.0]]);
		let grads = kron.backward(&mut autograd, &[&l, &r], None, &out, &d_out).unwrap();
		assert_approx_eq!(grads[0][[0, 0]], 3.0, 1e-12);
		assert_approx_eq!(grads[0][[0, 1]], 12.0, 1e-12);
		assert_approx_eq!(grads[1][[0, 0]], 5.0, 1e-12);
		assert_approx_eq!(grads[1][[0, 1]], 10.0, 1e-12);
	}

	#[test]
	fn test_gaussian_backward_matches_finite_diff() {
		let (m, sm) = leaf(&[2, 1], &[0.3, -0.5]);
		let (s, ss) = leaf(&[2, 1], &[0.9, 1.4]);
		let layer = TensorLayer::Gaussian {
			var: 0,
			num_units: 2,
			num_channels: 1,
			mean: m.clone(),
			stddev: s.clone(),
			log_partition: None,
		};
		let x = input(&[[0.1], [-1.0]]);
		let d_out = arr2(&[[1.0, 0.4], [-0.2, 0.6]]);
		let loss = || -> f64 {
			m.invalidate();
			s.invalidate();
			let out = layer.forward(&[], Some(&x), 2, Semiring::LogSumExp).unwrap();
			(&out * &d_out).sum()
		};

		let out = layer.forward(&[], Some(&x), 2, Semiring::LogSumExp).unwrap();
		let mut autograd = Autograd::new();
		layer.backward(&mut autograd, &[], Some(&x), &out, &d_out).unwrap();
		autograd.run().unwrap();

		let h = 1e-6;
		for (storage, analytic) in [(&sm, sm.borrow().grad().unwrap().clone()),
			(&ss, ss.borrow().grad().unwrap().clone())]
		{
			for u in 0..2 {
				let orig = storage.borrow().value()[[u, 0]];
				storage.borrow_mut().value_mut()[[u, 0]] = orig + h;
				let up = loss();
				storage.borrow_mut().value_mut()[[u, 0]] = orig - h;
				let down = loss();
				storage.borrow_mut().value_mut()[[u, 0]] = orig;
				assert_approx_eq!(analytic[[u, 0]], (up - down) / (2.0 * h), 1e-5);
			}
		}
	}

	#[test]
	fn test_categorical_logits_backward_matches_finite_diff() {
		let (l, sl) = leaf(&[1, 1, 3], &[0.2, -0.4, 0.9]);
		let layer = TensorLayer::Categorical {
			var: 0,
			num_units: 1,
			num_channels: 1,
			num_categories: 3,
			param: CategoricalSource::Logits(l.clone()),
		};
		let x = input(&[[2.0], [0.0]]);
		let d_out = arr2(&[[1.0], [0.7]]);
		let loss = || -> f64 {
			l.invalidate();
			let out = layer.forward(&[], Some(&x), 2, Semiring::LogSumExp).unwrap();
			(&out * &d_out).sum()
		};

		let out = layer.forward(&[], Some(&x), 2, Semiring::LogSumExp).unwrap();
		let mut autograd = Autograd::new();
		layer.backward(&mut autograd, &[], Some(&x), &out, &d_out).unwrap();
		autograd.run().unwrap();

		let analytic = sl.borrow().grad().unwrap().clone();
		let h = 1e-6;
		for c in 0..3 {
			let orig = sl.borrow().value()[[0, 0, c]];
			sl.borrow_mut().value_mut()[[0, 0, c]] = orig + h;
			let up = loss();
			sl.borrow_mut().value_mut()[[0, 0, c]] = orig - h;
			let down = loss();
			sl.borrow_mut().value_mut()[[0, 0, c]] = orig;
			assert_approx_eq!(analytic[[0, 0, c]], (up - down) / (2.0 * h), 1e-5);
		}
	}
}

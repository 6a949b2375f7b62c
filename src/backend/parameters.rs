//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Compiled parameter graphs.
//!
//! The compiler lowers every symbolic [`crate::symbolic::parameters::Param`]
//! onto a [`TensorParam`]. Leaves own their storage through a shared
//! [`crate::opt::Param`]; everything else computes from its inputs and caches
//! the result until [`TensorParam::invalidate`] is called. Since tied symbolic
//! nodes compile to one `TensorParam`, a leaf trained through one circuit
//! moves in every circuit that shares it.
//!
//! The backward pass is a worklist ([`Autograd`]): layers queue gradients on
//! their parameter roots, [`Autograd::run`] pushes them down to the leaves.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use ndarray::{ArrayD, ArrayView1, Axis, IxDyn, Zip};
use smallvec::{SmallVec, smallvec};

use super::EvalError;
use crate::ErrPack;
use crate::opt;
use crate::symbolic::parameters::Shape;
use crate::util::LossyInto;

//--------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub enum TensorParamOp {
	/// Materialized tensor. The storage is shared with every other circuit
	/// compiled from the same symbolic leaf.
	Leaf { storage: Rc<RefCell<opt::Param>> },
	Constant { value: f64 },

	Exp(TensorParam),
	Log(TensorParam),
	Softplus(TensorParam),
	Sigmoid(TensorParam),
	ScaledSigmoid { input: TensorParam, vmin: f64, vmax: f64 },
	Softmax { input: TensorParam, axis: usize },
	LogSoftmax { input: TensorParam, axis: usize },
	ReduceSum { input: TensorParam, axis: usize },
	ReduceLogSumExp { input: TensorParam, axis: usize },
	PolynomialDifferential(TensorParam),

	Add(TensorParam, TensorParam),
	Kronecker(TensorParam, TensorParam),
	OuterProduct { lhs: TensorParam, rhs: TensorParam, axis: usize },
	OuterSum { lhs: TensorParam, rhs: TensorParam, axis: usize },
	PolynomialProduct(TensorParam, TensorParam),

	GaussianProductMean {
		mean1: TensorParam,
		stddev1: TensorParam,
		mean2: TensorParam,
		stddev2: TensorParam,
	},
	GaussianProductStddev {
		stddev1: TensorParam,
		stddev2: TensorParam,
	},
	GaussianProductLogPartition {
		mean1: TensorParam,
		stddev1: TensorParam,
		mean2: TensorParam,
		stddev2: TensorParam,
	},
}

#[derive(Debug)]
pub struct TensorParamNode {
	shape: Shape,
	op: TensorParamOp,
	cache: RefCell<Option<Rc<ArrayD<f64>>>>,
}

/// Shared handle to a compiled parameter node. `Clone` shares the node and
/// its cache.
#[derive(Debug, Clone)]
pub struct TensorParam {
	node: Rc<TensorParamNode>,
}

impl TensorParam {
	pub fn new(shape: &[usize], op: TensorParamOp) -> Self {
		debug_assert!(!shape.is_empty() && !shape.contains(&0));
		Self {
			node: Rc::new(TensorParamNode {
				shape: Shape::from_slice(shape),
				op,
				cache: RefCell::new(None),
			}),
		}
	}

	pub fn shape(&self) -> &[usize] {
		&self.node.shape
	}

	pub fn op(&self) -> &TensorParamOp {
		&self.node.op
	}

	pub fn node_addr(&self) -> usize {
		Rc::as_ptr(&self.node) as usize
	}

	/// Computes the value, reusing the cached result when there is one.
	pub fn value(&self) -> Rc<ArrayD<f64>> {
		if let Some(v) = self.node.cache.borrow().as_ref() {
			return Rc::clone(v);
		}
		let v = Rc::new(compute(&self.node.shape, &self.node.op));
		*self.node.cache.borrow_mut() = Some(Rc::clone(&v));
		v
	}

	/// Drops the cached value. Must run on every node above a leaf whose
	/// storage changed (optimizer step, parameter load).
	pub fn invalidate(&self) {
		*self.node.cache.borrow_mut() = None;
	}

	/// Walks the graph below this node, recording every distinct node and
	/// every distinct leaf storage in first-visit order.
	pub fn collect(
		&self,
		seen: &mut HashSet<usize>,
		nodes: &mut Vec<Self>,
		leaves: &mut Vec<Rc<RefCell<opt::Param>>>,
	) {
		if !seen.insert(self.node_addr()) {
			return;
		}
		nodes.push(self.clone());
		if let TensorParamOp::Leaf { storage } = &self.node.op {
			leaves.push(Rc::clone(storage));
		}
		for input in self.inputs() {
			input.collect(seen, nodes, leaves);
		}
	}

	fn inputs(&self) -> SmallVec<[&Self; 4]> {
		use TensorParamOp as Op;
		match &self.node.op {
			Op::Leaf { .. } | Op::Constant { .. } => SmallVec::new(),
			Op::Exp(a)
			| Op::Log(a)
			| Op::Softplus(a)
			| Op::Sigmoid(a)
			| Op::PolynomialDifferential(a) => smallvec![a],
			Op::ScaledSigmoid { input, .. }
			| Op::Softmax { input, .. }
			| Op::LogSoftmax { input, .. }
			| Op::ReduceSum { input, .. }
			| Op::ReduceLogSumExp { input, .. } => smallvec![input],
			Op::Add(a, b) | Op::Kronecker(a, b) | Op::PolynomialProduct(a, b) => {
				smallvec![a, b]
			},
			Op::OuterProduct { lhs, rhs, .. } | Op::OuterSum { lhs, rhs, .. } => {
				smallvec![lhs, rhs]
			},
			Op::GaussianProductMean { mean1, stddev1, mean2, stddev2 }
			| Op::GaussianProductLogPartition { mean1, stddev1, mean2, stddev2 } => {
				smallvec![mean1, stddev1, mean2, stddev2]
			},
			Op::GaussianProductStddev { stddev1, stddev2 } => smallvec![stddev1, stddev2],
		}
	}
}

//--------------------------------------------------------------------------------------------------

pub(crate) fn sigmoid(x: f64) -> f64 {
	if x >= 0.0 {
		1.0 / (1.0 + (-x).exp())
	} else {
		let e = x.exp();
		e / (1.0 + e)
	}
}

fn softplus(x: f64) -> f64 {
	if x > 0.0 { x + (-x).exp().ln_1p() } else { x.exp().ln_1p() }
}

pub(crate) fn logsumexp(lane: ArrayView1<'_, f64>) -> f64 {
	let m = lane.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
	if m == f64::NEG_INFINITY {
		return f64::NEG_INFINITY;
	}
	m + lane.iter().map(|&v| (v - m).exp()).sum::<f64>().ln()
}

pub(crate) fn softmax_lanes(x: &ArrayD<f64>, axis: usize) -> ArrayD<f64> {
	let mut out = x.clone();
	for mut lane in out.lanes_mut(Axis(axis)) {
		let m = lane.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
		let mut total = 0.0;
		for v in lane.iter_mut() {
			*v = (*v - m).exp();
			total += *v;
		}
		for v in lane.iter_mut() {
			*v /= total;
		}
	}
	out
}

/// Row-major odometer over a dense index space.
fn for_each_index(shape: &[usize], mut f: impl FnMut(&[usize])) {
	if shape.iter().any(|&s| s == 0) {
		return;
	}
	let mut idx = vec![0_usize; shape.len()];
	'outer: loop {
		f(&idx);
		#[allow(clippy::indexing_slicing)]
		for k in (0..shape.len()).rev() {
			idx[k] += 1;
			if idx[k] < shape[k] {
				continue 'outer;
			}
			idx[k] = 0;
		}
		return;
	}
}

#[allow(clippy::indexing_slicing)]
fn outer_pairwise(
	a: &ArrayD<f64>,
	b: &ArrayD<f64>,
	axis: usize,
	shape: &[usize],
	f: impl Fn(f64, f64) -> f64,
) -> ArrayD<f64> {
	let r = b.shape()[axis];
	let mut out = ArrayD::zeros(IxDyn(shape));
	let mut ai = vec![0_usize; shape.len()];
	let mut bi = vec![0_usize; shape.len()];
	for_each_index(shape, |idx| {
		ai.copy_from_slice(idx);
		bi.copy_from_slice(idx);
		ai[axis] = idx[axis] / r;
		bi[axis] = idx[axis] % r;
		out[idx] = f(a[&ai[..]], b[&bi[..]]);
	});
	out
}

#[allow(clippy::indexing_slicing, clippy::too_many_lines)]
fn compute(shape: &[usize], op: &TensorParamOp) -> ArrayD<f64> {
	use TensorParamOp as Op;
	match op {
		Op::Leaf { storage } => storage.borrow().value().clone(),
		Op::Constant { value } => ArrayD::from_elem(IxDyn(shape), *value),

		Op::Exp(a) => a.value().mapv(f64::exp),
		Op::Log(a) => a.value().mapv(f64::ln),
		Op::Softplus(a) => a.value().mapv(softplus),
		Op::Sigmoid(a) => a.value().mapv(sigmoid),
		Op::ScaledSigmoid { input, vmin, vmax } => {
			input.value().mapv(|v| vmin + sigmoid(v) * (vmax - vmin))
		},
		Op::Softmax { input, axis } => softmax_lanes(&input.value(), *axis),
		Op::LogSoftmax { input, axis } => {
			let x = input.value();
			let mut out = (*x).clone();
			for mut lane in out.lanes_mut(Axis(*axis)) {
				let lse = logsumexp(lane.view());
				for v in lane.iter_mut() {
					*v -= lse;
				}
			}
			out
		},
		Op::ReduceSum { input, axis } => input.value().sum_axis(Axis(*axis)),
		Op::ReduceLogSumExp { input, axis } => {
			input.value().map_axis(Axis(*axis), logsumexp)
		},
		Op::PolynomialDifferential(a) => {
			let x = a.value();
			let units = x.shape()[0];
			let in_coeffs = x.shape()[1];
			let mut out = ArrayD::zeros(IxDyn(shape));
			if in_coeffs >= 2 {
				for u in 0..units {
					for k in 0..in_coeffs - 1 {
						let factor: f64 = (k + 1).lossy_into();
						out[[u, k]] = factor * x[[u, k + 1]];
					}
				}
			}
			out
		},

		Op::Add(a, b) => &*a.value() + &*b.value(),
		Op::Kronecker(a, b) => {
			let a = a.value();
			let b = b.value();
			let bshape = b.shape().to_vec();
			let n = bshape.len();
			let mut out = ArrayD::zeros(IxDyn(shape));
			let mut ai = vec![0_usize; n];
			let mut bi = vec![0_usize; n];
			for_each_index(shape, |idx| {
				for k in 0..n {
					ai[k] = idx[k] / bshape[k];
					bi[k] = idx[k] % bshape[k];
				}
				out[idx] = a[&ai[..]] * b[&bi[..]];
			});
			out
		},
		Op::OuterProduct { lhs, rhs, axis } => {
			outer_pairwise(&lhs.value(), &rhs.value(), *axis, shape, |a, b| a * b)
		},
		Op::OuterSum { lhs, rhs, axis } => {
			outer_pairwise(&lhs.value(), &rhs.value(), *axis, shape, |a, b| a + b)
		},
		Op::PolynomialProduct(a, b) => {
			let a = a.value();
			let b = b.value();
			let (u1, c1) = (a.shape()[0], a.shape()[1]);
			let (u2, c2) = (b.shape()[0], b.shape()[1]);
			let mut out = ArrayD::zeros(IxDyn(shape));
			for i1 in 0..u1 {
				for i2 in 0..u2 {
					let row = i1 * u2 + i2;
					for k1 in 0..c1 {
						for k2 in 0..c2 {
							out[[row, k1 + k2]] += a[[i1, k1]] * b[[i2, k2]];
						}
					}
				}
			}
			out
		},

		Op::GaussianProductMean { mean1, stddev1, mean2, stddev2 } => {
			let m1 = mean1.value();
			let s1 = stddev1.value();
			let m2 = mean2.value();
			let s2 = stddev2.value();
			let (u1, channels) = (m1.shape()[0], m1.shape()[1]);
			let u2 = m2.shape()[0];
			let mut out = ArrayD::zeros(IxDyn(shape));
			for i1 in 0..u1 {
				for i2 in 0..u2 {
					for ch in 0..channels {
						let v1 = s1[[i1, ch]] * s1[[i1, ch]];
						let v2 = s2[[i2, ch]] * s2[[i2, ch]];
						out[[i1 * u2 + i2, ch]] =
							(m1[[i1, ch]] * v2 + m2[[i2, ch]] * v1) / (v1 + v2);
					}
				}
			}
			out
		},
		Op::GaussianProductStddev { stddev1, stddev2 } => {
			let s1 = stddev1.value();
			let s2 = stddev2.value();
			let (u1, channels) = (s1.shape()[0], s1.shape()[1]);
			let u2 = s2.shape()[0];
			let mut out = ArrayD::zeros(IxDyn(shape));
			for i1 in 0..u1 {
				for i2 in 0..u2 {
					for ch in 0..channels {
						let v1 = s1[[i1, ch]] * s1[[i1, ch]];
						let v2 = s2[[i2, ch]] * s2[[i2, ch]];
						out[[i1 * u2 + i2, ch]] =
							s1[[i1, ch]] * s2[[i2, ch]] / (v1 + v2).sqrt();
					}
				}
			}
			out
		},
		Op::GaussianProductLogPartition { mean1, stddev1, mean2, stddev2 } => {
			let m1 = mean1.value();
			let s1 = stddev1.value();
			let m2 = mean2.value();
			let s2 = stddev2.value();
			let (u1, channels) = (m1.shape()[0], m1.shape()[1]);
			let u2 = m2.shape()[0];
			let ln_2pi = (2.0 * std::f64::consts::PI).ln();
			let mut out = ArrayD::zeros(IxDyn(shape));
			for i1 in 0..u1 {
				for i2 in 0..u2 {
					for ch in 0..channels {
						let var = s1[[i1, ch]] * s1[[i1, ch]] + s2[[i2, ch]] * s2[[i2, ch]];
						let diff = m1[[i1, ch]] - m2[[i2, ch]];
						out[[i1 * u2 + i2, ch]] =
							-0.5 * (diff * diff / var + ln_2pi + var.ln());
					}
				}
			}
			out
		},
	}
}

//--------------------------------------------------------------------------------------------------

/// Worklist backward over compiled parameter graphs. Every queued entry is
/// one gradient contribution; contributions to a shared node are pushed down
/// separately and add up at the leaves.
#[derive(Default)]
pub struct Autograd {
	entries: Vec<(TensorParam, ArrayD<f64>)>,
}

impl Autograd {
	pub fn new() -> Self {
		Self { entries: Vec::new() }
	}

	/// Queues `grad` as a pending contribution to `param`'s output.
	pub fn set_grad(&mut self, param: &TensorParam, grad: ArrayD<f64>) {
		debug_assert_eq!(grad.shape(), param.shape());
		self.entries.push((param.clone(), grad));
	}

	/// Drains the queue, pushing every contribution down to the leaves.
	pub fn run(&mut self) -> crate::Result<()> {
		while let Some((param, grad)) = self.entries.pop() {
			self.backward_step(&param, grad)?;
		}
		Ok(())
	}

	#[allow(clippy::indexing_slicing, clippy::too_many_lines)]
	fn backward_step(&mut self, param: &TensorParam, d: ArrayD<f64>) -> crate::Result<()> {
		use TensorParamOp as Op;
		match param.op() {
			Op::Leaf { storage } => storage.borrow_mut().acc_grad(d.view())?,
			Op::Constant { .. } => {},

			Op::Exp(a) => {
				let y = param.value();
				self.set_grad(a, &d * &*y);
			},
			Op::Log(a) => {
				let x = a.value();
				self.set_grad(a, &d / &*x);
			},
			Op::Softplus(a) => {
				let x = a.value();
				let mut g = d;
				Zip::from(&mut g).and(&*x).for_each(|g, &x| *g *= sigmoid(x));
				self.set_grad(a, g);
			},
			Op::Sigmoid(a) => {
				let y = param.value();
				let mut g = d;
				Zip::from(&mut g).and(&*y).for_each(|g, &y| *g *= y * (1.0 - y));
				self.set_grad(a, g);
			},
			Op::ScaledSigmoid { input, vmin, vmax } => {
				let y = param.value();
				let scale = vmax - vmin;
				let mut g = d;
				Zip::from(&mut g).and(&*y).for_each(|g, &y| {
					let s = (y - vmin) / scale;
					*g *= s * (1.0 - s) * scale;
				});
				self.set_grad(input, g);
			},
			Op::Softmax { input, axis } => {
				let y = param.value();
				let ax = Axis(*axis);
				let mut g = ArrayD::zeros(d.raw_dim());
				Zip::from(g.lanes_mut(ax)).and(y.lanes(ax)).and(d.lanes(ax)).for_each(
					|mut g, y, d| {
						let dot: f64 = y.iter().zip(d.iter()).map(|(a, b)| a * b).sum();
						for ((g, &y), &d) in g.iter_mut().zip(y.iter()).zip(d.iter()) {
							*g = y * (d - dot);
						}
					},
				);
				self.set_grad(input, g);
			},
			Op::LogSoftmax { input, axis } => {
				let y = param.value();
				let ax = Axis(*axis);
				let mut g = d;
				Zip::from(g.lanes_mut(ax)).and(y.lanes(ax)).for_each(|mut g, y| {
					let sum_d: f64 = g.iter().sum();
					for (g, &y) in g.iter_mut().zip(y.iter()) {
						*g -= y.exp() * sum_d;
					}
				});
				self.set_grad(input, g);
			},
			Op::ReduceSum { input, axis } => {
				let mut g = ArrayD::zeros(IxDyn(input.shape()));
				Zip::from(g.lanes_mut(Axis(*axis)))
					.and(&d)
					.for_each(|mut lane, &d| lane.fill(d));
				self.set_grad(input, g);
			},
			Op::ReduceLogSumExp { input, axis } => {
				let x = input.value();
				let y = param.value();
				let ax = Axis(*axis);
				let mut g = ArrayD::zeros(IxDyn(input.shape()));
				Zip::from(g.lanes_mut(ax)).and(x.lanes(ax)).and(&d).and(&*y).for_each(
					|mut g, x, &d, &y| {
						for (g, &x) in g.iter_mut().zip(x.iter()) {
							*g = d * (x - y).exp();
						}
					},
				);
				self.set_grad(input, g);
			},
			Op::PolynomialDifferential(a) => {
				let units = a.shape()[0];
				let in_coeffs = a.shape()[1];
				let mut g = ArrayD::zeros(IxDyn(a.shape()));
				if in_coeffs >= 2 {
					for u in 0..units {
						for k in 0..in_coeffs - 1 {
							let factor: f64 = (k + 1).lossy_into();
							g[[u, k + 1]] = factor * d[[u, k]];
						}
					}
				}
				self.set_grad(a, g);
			},

			Op::Add(a, b) => {
				self.set_grad(a, d.clone());
				self.set_grad(b, d);
			},
			Op::Kronecker(a, b) => {
				let av = a.value();
				let bv = b.value();
				let bshape = bv.shape().to_vec();
				let n = bshape.len();
				let mut ga = ArrayD::zeros(av.raw_dim());
				let mut gb = ArrayD::zeros(bv.raw_dim());
				let mut ai = vec![0_usize; n];
				let mut bi = vec![0_usize; n];
				for_each_index(param.shape(), |idx| {
					for k in 0..n {
						ai[k] = idx[k] / bshape[k];
						bi[k] = idx[k] % bshape[k];
					}
					let dv = d[idx];
					ga[&ai[..]] += dv * bv[&bi[..]];
					gb[&bi[..]] += dv * av[&ai[..]];
				});
				self.set_grad(a, ga);
				self.set_grad(b, gb);
			},
			Op::OuterProduct { lhs, rhs, axis } => {
				let av = lhs.value();
				let bv = rhs.value();
				let r = bv.shape()[*axis];
				let n = param.shape().len();
				let mut ga = ArrayD::zeros(av.raw_dim());
				let mut gb = ArrayD::zeros(bv.raw_dim());
				let mut ai = vec![0_usize; n];
				let mut bi = vec![0_usize; n];
				for_each_index(param.shape(), |idx| {
					ai.copy_from_slice(idx);
					bi.copy_from_slice(idx);
					ai[*axis] = idx[*axis] / r;
					bi[*axis] = idx[*axis] % r;
					let dv = d[idx];
					ga[&ai[..]] += dv * bv[&bi[..]];
					gb[&bi[..]] += dv * av[&ai[..]];
				});
				self.set_grad(lhs, ga);
				self.set_grad(rhs, gb);
			},
			Op::OuterSum { lhs, rhs, axis } => {
				let r = rhs.shape()[*axis];
				let n = param.shape().len();
				let mut ga = ArrayD::zeros(IxDyn(lhs.shape()));
				let mut gb = ArrayD::zeros(IxDyn(rhs.shape()));
				let mut ai = vec![0_usize; n];
				let mut bi = vec![0_usize; n];
				for_each_index(param.shape(), |idx| {
					ai.copy_from_slice(idx);
					bi.copy_from_slice(idx);
					ai[*axis] = idx[*axis] / r;
					bi[*axis] = idx[*axis] % r;
					let dv = d[idx];
					ga[&ai[..]] += dv;
					gb[&bi[..]] += dv;
				});
				self.set_grad(lhs, ga);
				self.set_grad(rhs, gb);
			},
			Op::PolynomialProduct(a, b) => {
				let av = a.value();
				let bv = b.value();
				let (u1, c1) = (av.shape()[0], av.shape()[1]);
				let (u2, c2) = (bv.shape()[0], bv.shape()[1]);
				let mut ga = ArrayD::zeros(av.raw_dim());
				let mut gb = ArrayD::zeros(bv.raw_dim());
				for i1 in 0..u1 {
					for i2 in 0..u2 {
						let row = i1 * u2 + i2;
						for k1 in 0..c1 {
							for k2 in 0..c2 {
								let dv = d[[row, k1 + k2]];
								ga[[i1, k1]] += dv * bv[[i2, k2]];
								gb[[i2, k2]] += dv * av[[i1, k1]];
							}
						}
					}
				}
				self.set_grad(a, ga);
				self.set_grad(b, gb);
			},

			Op::GaussianProductMean { .. }
			| Op::GaussianProductStddev { .. }
			| Op::GaussianProductLogPartition { .. } => {
				return Err(ErrPack::new(
					EvalError::BackwardUnsupported,
					"Gaussian product parameters are forward-only",
				)
				.into());
			},
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Symbolic parameters.
//!
//! A [`Param`] is a shared handle to an immutable node in a parameter DAG.
//! Cloning the handle shares the node, which is how parameter tying works:
//! circuits produced by the operators in [`crate::symbolic::functional`]
//! reference the same leaf nodes as their operands, and the compiler
//! materializes each leaf exactly once.
//!
//! Shapes are inferred eagerly, so an invalid combination fails when the
//! node is created, not when some circuit using it is compiled.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::util::cold_path;
use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

pub type Shape = SmallVec<[usize; 4]>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParamError {
	EmptyShape,
	AxisOutOfBounds,
	ShapeMismatch,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Initializer {
	Normal { mean: f64, stddev: f64 },
	Uniform { lo: f64, hi: f64 },
	Constant(f64),
}

#[derive(Debug)]
pub enum ParamOp {
	/// Materialized tensor with its own storage.
	Leaf { init: Initializer, learnable: bool },
	/// Constant fill. No storage, never serialized.
	Constant { value: f64 },

	Exp(Param),
	Log(Param),
	Softplus(Param),
	Sigmoid(Param),
	ScaledSigmoid { input: Param, vmin: f64, vmax: f64 },
	Softmax { input: Param, axis: usize },
	LogSoftmax { input: Param, axis: usize },
	ReduceSum { input: Param, axis: usize },
	ReduceLogSumExp { input: Param, axis: usize },
	/// `(units, degree + 1)` polynomial coefficients -> coefficients of the
	/// derivative, `(units, max(degree, 1))`.
	PolynomialDifferential(Param),

	Add(Param, Param),
	/// Kronecker product over all axes. Output dims are elementwise products.
	Kronecker(Param, Param),
	/// Outer (all pairs) product along `axis`, elementwise everywhere else.
	OuterProduct { lhs: Param, rhs: Param, axis: usize },
	/// Outer sum along `axis`, elementwise everywhere else.
	OuterSum { lhs: Param, rhs: Param, axis: usize },
	/// Coefficient convolution, outer on the unit axis:
	/// `(k1, d1 + 1) x (k2, d2 + 1) -> (k1 * k2, d1 + d2 + 1)`.
	PolynomialProduct(Param, Param),

	// Closed-form product of two Gaussian densities, outer-paired on the
	// unit axis. Forward-only: the backend has no backward rule for these.
	GaussianProductMean { mean1: Param, stddev1: Param, mean2: Param, stddev2: Param },
	GaussianProductStddev { stddev1: Param, stddev2: Param },
	GaussianProductLogPartition { mean1: Param, stddev1: Param, mean2: Param, stddev2: Param },
}

#[derive(Debug)]
pub struct ParamNode {
	shape: Shape,
	op: ParamOp,
}

impl ParamNode {
	pub fn shape(&self) -> &[usize] {
		&self.shape
	}

	pub fn op(&self) -> &ParamOp {
		&self.op
	}
}

/// Shared handle to a parameter node. `Clone` ties, it does not copy.
#[derive(Debug, Clone)]
pub struct Param {
	node: Rc<ParamNode>,
}

//--------------------------------------------------------------------------------------------------

fn check_shape(shape: &[usize]) -> Result<Shape, ErrPack<ParamError>> {
	if shape.is_empty() || shape.contains(&0) {
		cold_path();
		return Err(ErrPack {
			code: ParamError::EmptyShape,
			extra: Some(Box::new(ErrExtra {
				message: format!("Parameter shape {shape:?} has no elements").into(),
				nested: None,
			})),
		});
	}
	Ok(Shape::from_slice(shape))
}

fn check_axis(shape: &[usize], axis: usize) -> Result<(), ErrPack<ParamError>> {
	if axis >= shape.len() {
		cold_path();
		return Err(ErrPack {
			code: ParamError::AxisOutOfBounds,
			extra: Some(Box::new(ErrExtra {
				message: format!("Axis {axis} out of bounds for shape {shape:?}").into(),
				nested: None,
			})),
		});
	}
	Ok(())
}

#[cold]
#[inline(never)]
fn shape_mismatch(context: &str, lhs: &[usize], rhs: &[usize]) -> ErrPack<ParamError> {
	ErrPack {
		code: ParamError::ShapeMismatch,
		extra: Some(Box::new(ErrExtra {
			message: format!("{context}: shapes {lhs:?} and {rhs:?} do not fit").into(),
			nested: None,
		})),
	}
}

fn check_matrix(param: &Param) -> Result<(usize, usize), ErrPack<ParamError>> {
	if let &[rows, cols] = param.shape() {
		Ok((rows, cols))
	} else {
		cold_path();
		Err(shape_mismatch("expected a 2-D parameter", param.shape(), &[]))
	}
}

impl Param {
	fn from_op(shape: Shape, op: ParamOp) -> Self {
		Self { node: Rc::new(ParamNode { shape, op }) }
	}

	pub fn leaf(
		shape: &[usize],
		init: Initializer,
		learnable: bool,
	) -> Result<Self, ErrPack<ParamError>> {
		let shape = check_shape(shape)?;
		Ok(Self::from_op(shape, ParamOp::Leaf { init, learnable }))
	}

	pub fn constant(shape: &[usize], value: f64) -> Result<Self, ErrPack<ParamError>> {
		let shape = check_shape(shape)?;
		Ok(Self::from_op(shape, ParamOp::Constant { value }))
	}

	pub fn shape(&self) -> &[usize] {
		&self.node.shape
	}

	pub fn ndim(&self) -> usize {
		self.node.shape.len()
	}

	pub fn num_elements(&self) -> usize {
		self.node.shape.iter().product()
	}

	pub fn op(&self) -> &ParamOp {
		&self.node.op
	}

	/// Stable identity of the underlying node, used to memoize
	/// materialization. Two tied handles report the same address.
	pub fn node_addr(&self) -> usize {
		Rc::as_ptr(&self.node) as usize
	}

	pub fn is_same_node(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.node, &other.node)
	}

	pub fn exp(&self) -> Self {
		Self::from_op(self.node.shape.clone(), ParamOp::Exp(self.clone()))
	}

	pub fn log(&self) -> Self {
		Self::from_op(self.node.shape.clone(), ParamOp::Log(self.clone()))
	}

	pub fn softplus(&self) -> Self {
		Self::from_op(self.node.shape.clone(), ParamOp::Softplus(self.clone()))
	}

	pub fn sigmoid(&self) -> Self {
		Self::from_op(self.node.shape.clone(), ParamOp::Sigmoid(self.clone()))
	}

	/// `vmin + sigmoid(x) * (vmax - vmin)`. Requires `vmin < vmax`.
	pub fn scaled_sigmoid(&self, vmin: f64, vmax: f64) -> Self {
		debug_assert!(vmin < vmax);
		Self::from_op(
			self.node.shape.clone(),
			ParamOp::ScaledSigmoid { input: self.clone(), vmin, vmax },
		)
	}

	pub fn softmax(&self, axis: usize) -> Result<Self, ErrPack<ParamError>> {
		check_axis(self.shape(), axis)?;
		Ok(Self::from_op(
			self.node.shape.clone(),
			ParamOp::Softmax { input: self.clone(), axis },
		))
	}

	pub fn log_softmax(&self, axis: usize) -> Result<Self, ErrPack<ParamError>> {
		check_axis(self.shape(), axis)?;
		Ok(Self::from_op(
			self.node.shape.clone(),
			ParamOp::LogSoftmax { input: self.clone(), axis },
		))
	}

	fn reduced_shape(&self, axis: usize) -> Result<Shape, ErrPack<ParamError>> {
		check_axis(self.shape(), axis)?;
		if self.ndim() == 1 {
			cold_path();
			return Err(ErrPack {
				code: ParamError::EmptyShape,
				extra: Some(Box::new(ErrExtra {
					message: "Reducing the only axis would produce a scalar".into(),
					nested: None,
				})),
			});
		}
		let mut shape = self.node.shape.clone();
		shape.remove(axis);
		Ok(shape)
	}

	pub fn reduce_sum(&self, axis: usize) -> Result<Self, ErrPack<ParamError>> {
		let shape = self.reduced_shape(axis)?;
		Ok(Self::from_op(shape, ParamOp::ReduceSum { input: self.clone(), axis }))
	}

	pub fn reduce_log_sum_exp(&self, axis: usize) -> Result<Self, ErrPack<ParamError>> {
		let shape = self.reduced_shape(axis)?;
		Ok(Self::from_op(shape, ParamOp::ReduceLogSumExp { input: self.clone(), axis }))
	}

	pub fn polynomial_differential(&self) -> Result<Self, ErrPack<ParamError>> {
		let (units, num_coeffs) = check_matrix(self)?;
		let shape = Shape::from_slice(&[units, (num_coeffs - 1).max(1)]);
		Ok(Self::from_op(shape, ParamOp::PolynomialDifferential(self.clone())))
	}

	pub fn add(&self, rhs: &Self) -> Result<Self, ErrPack<ParamError>> {
		if self.shape() != rhs.shape() {
			cold_path();
			return Err(shape_mismatch("add", self.shape(), rhs.shape()));
		}
		Ok(Self::from_op(self.node.shape.clone(), ParamOp::Add(self.clone(), rhs.clone())))
	}

	pub fn kronecker(&self, rhs: &Self) -> Result<Self, ErrPack<ParamError>> {
		if self.ndim() != rhs.ndim() {
			cold_path();
			return Err(shape_mismatch("kronecker", self.shape(), rhs.shape()));
		}
		let shape: Shape =
			self.shape().iter().zip(rhs.shape()).map(|(&a, &b)| a * b).collect();
		Ok(Self::from_op(shape, ParamOp::Kronecker(self.clone(), rhs.clone())))
	}

	fn outer_shape(&self, rhs: &Self, axis: usize) -> Result<Shape, ErrPack<ParamError>> {
		check_axis(self.shape(), axis)?;
		check_axis(rhs.shape(), axis)?;
		let compatible = self.ndim() == rhs.ndim()
			&& self
				.shape()
				.iter()
				.zip(rhs.shape())
				.enumerate()
				.all(|(i, (&a, &b))| i == axis || a == b);
		if !compatible {
			cold_path();
			return Err(shape_mismatch("outer pairing", self.shape(), rhs.shape()));
		}
		let mut shape = self.node.shape.clone();
		#[allow(clippy::indexing_slicing)]
		{
			shape[axis] *= rhs.shape()[axis];
		}
		Ok(shape)
	}

	pub fn outer_product(&self, rhs: &Self, axis: usize) -> Result<Self, ErrPack<ParamError>> {
		let shape = self.outer_shape(rhs, axis)?;
		Ok(Self::from_op(
			shape,
			ParamOp::OuterProduct { lhs: self.clone(), rhs: rhs.clone(), axis },
		))
	}

	pub fn outer_sum(&self, rhs: &Self, axis: usize) -> Result<Self, ErrPack<ParamError>> {
		let shape = self.outer_shape(rhs, axis)?;
		Ok(Self::from_op(
			shape,
			ParamOp::OuterSum { lhs: self.clone(), rhs: rhs.clone(), axis },
		))
	}

	pub fn polynomial_product(&self, rhs: &Self) -> Result<Self, ErrPack<ParamError>> {
		let (units1, num_coeffs1) = check_matrix(self)?;
		let (units2, num_coeffs2) = check_matrix(rhs)?;
		let shape = Shape::from_slice(&[units1 * units2, num_coeffs1 + num_coeffs2 - 1]);
		Ok(Self::from_op(shape, ParamOp::PolynomialProduct(self.clone(), rhs.clone())))
	}

	fn gaussian_product_shape(
		mean1: &Self,
		stddev1: &Self,
		mean2: &Self,
		stddev2: &Self,
	) -> Result<Shape, ErrPack<ParamError>> {
		let (units1, channels1) = check_matrix(mean1)?;
		let (units2, channels2) = check_matrix(mean2)?;
		if mean1.shape() != stddev1.shape()
			|| mean2.shape() != stddev2.shape()
			|| channels1 != channels2
		{
			cold_path();
			return Err(shape_mismatch("gaussian product", mean1.shape(), mean2.shape()));
		}
		Ok(Shape::from_slice(&[units1 * units2, channels1]))
	}

	pub fn gaussian_product_mean(
		mean1: &Self,
		stddev1: &Self,
		mean2: &Self,
		stddev2: &Self,
	) -> Result<Self, ErrPack<ParamError>> {
		let shape = Self::gaussian_product_shape(mean1, stddev1, mean2, stddev2)?;
		Ok(Self::from_op(
			shape,
			ParamOp::GaussianProductMean {
				mean1: mean1.clone(),
				stddev1: stddev1.clone(),
				mean2: mean2.clone(),
				stddev2: stddev2.clone(),
			},
		))
	}

	pub fn gaussian_product_stddev(
		stddev1: &Self,
		stddev2: &Self,
	) -> Result<Self, ErrPack<ParamError>> {
		let shape = Self::gaussian_product_shape(stddev1, stddev1, stddev2, stddev2)?;
		Ok(Self::from_op(
			shape,
			ParamOp::GaussianProductStddev {
				stddev1: stddev1.clone(),
				stddev2: stddev2.clone(),
			},
		))
	}

	pub fn gaussian_product_log_partition(
		mean1: &Self,
		stddev1: &Self,
		mean2: &Self,
		stddev2: &Self,
	) -> Result<Self, ErrPack<ParamError>> {
		let shape = Self::gaussian_product_shape(mean1, stddev1, mean2, stddev2)?;
		Ok(Self::from_op(
			shape,
			ParamOp::GaussianProductLogPartition {
				mean1: mean1.clone(),
				stddev1: stddev1.clone(),
				mean2: mean2.clone(),
				stddev2: stddev2.clone(),
			},
		))
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	fn normal() -> Initializer {
		Initializer::Normal { mean: 0.0, stddev: 1.0 }
	}

	#[test]
	fn test_shape_inference() {
		let p = Param::leaf(&[3, 2, 5], normal(), true).unwrap();
		assert_eq!(p.softmax(2).unwrap().shape(), &[3, 2, 5]);
		assert_eq!(p.reduce_sum(2).unwrap().shape(), &[3, 2]);
		assert_eq!(p.reduce_sum(2).unwrap().reduce_sum(1).unwrap().shape(), &[3]);
		assert!(p.softmax(3).is_err());
		assert!(Param::leaf(&[], normal(), true).is_err());
		assert!(Param::leaf(&[2, 0], normal(), true).is_err());
	}

	#[test]
	fn test_pairing_shapes() {
		let a = Param::leaf(&[4, 3], normal(), true).unwrap();
		let b = Param::leaf(&[5, 3], normal(), true).unwrap();
		assert_eq!(a.kronecker(&b).unwrap().shape(), &[20, 9]);
		assert_eq!(a.outer_product(&b, 0).unwrap().shape(), &[20, 3]);
		assert_eq!(a.outer_sum(&b, 0).unwrap().shape(), &[20, 3]);
		// outer pairing on axis 0 needs the other axes to match
		let c = Param::leaf(&[5, 4], normal(), true).unwrap();
		assert!(a.outer_product(&c, 0).is_err());
	}

	#[test]
	fn test_polynomial_shapes() {
		// degree 2 and degree 3
		let a = Param::leaf(&[2, 3], normal(), true).unwrap();
		let b = Param::leaf(&[3, 4], normal(), true).unwrap();
		assert_eq!(a.polynomial_product(&b).unwrap().shape(), &[6, 6]);
		assert_eq!(a.polynomial_differential().unwrap().shape(), &[2, 2]);
		// the differential of a constant is still one (zero) coefficient
		let c = Param::leaf(&[2, 1], normal(), true).unwrap();
		assert_eq!(c.polynomial_differential().unwrap().shape(), &[2, 1]);
	}

	#[test]
	fn test_gaussian_product_shapes() {
		let m1 = Param::leaf(&[2, 3], normal(), true).unwrap();
		let s1 = Param::leaf(&[2, 3], normal(), true).unwrap();
		let m2 = Param::leaf(&[4, 3], normal(), true).unwrap();
		let s2 = Param::leaf(&[4, 3], normal(), true).unwrap();
		let mean = Param::gaussian_product_mean(&m1, &s1, &m2, &s2).unwrap();
		assert_eq!(mean.shape(), &[8, 3]);
		let bad = Param::leaf(&[4, 2], normal(), true).unwrap();
		assert!(Param::gaussian_product_mean(&m1, &s1, &m2, &bad).is_err());
	}

	#[test]
	fn test_clone_ties() {
		let p = Param::leaf(&[2, 2], normal(), true).unwrap();
		let q = p.clone();
		assert!(p.is_same_node(&q));
		assert_eq!(p.node_addr(), q.node_addr());
		// a fresh leaf with the same settings is a different node
		let r = Param::leaf(&[2, 2], normal(), true).unwrap();
		assert!(!p.is_same_node(&r));
	}
}

//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Adam optimizer: https://arxiv.org/abs/1412.6980

use ndarray::{ArrayD, ArrayViewD, Zip};

use crate::util::cold_path;
use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

pub struct OptCoef {
	pub m_decay: f64,       // beta1
	pub v_decay: f64,       // beta2
	pub eps: f64,           // epsilon
	pub learning_rate: f64, // alpha
}

impl Default for OptCoef {
	fn default() -> Self {
		Self {
			m_decay: 0.9,
			v_decay: 0.99,
			eps: 1e-8,
			learning_rate: 0.001,
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct GradShapeError;

impl GradShapeError {
	#[cold]
	#[inline(never)]
	pub fn new(expected: &[usize], got: &[usize]) -> ErrPack<Self> {
		let message = format!(
			"Gradient shape {got:?} does not match the parameter shape {expected:?}"
		);
		ErrPack {
			code: Self,
			extra: Some(Box::new(ErrExtra { message: message.into(), nested: None })),
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// A materialized parameter tensor with its accumulated gradient and the
/// Adam moment estimates. Moments are allocated lazily on the first step,
/// so parameters that are never trained cost nothing extra.
#[derive(Debug)]
pub struct Param {
	value: ArrayD<f64>,
	learnable: bool,

	grad: Option<ArrayD<f64>>,
	m: Option<ArrayD<f64>>,
	v: Option<ArrayD<f64>>,
}

impl Param {
	pub fn new(value: ArrayD<f64>, learnable: bool) -> Self {
		Self { value, learnable, grad: None, m: None, v: None }
	}

	pub fn value(&self) -> &ArrayD<f64> {
		&self.value
	}

	pub fn value_mut(&mut self) -> &mut ArrayD<f64> {
		&mut self.value
	}

	pub fn set_value(&mut self, value: ArrayD<f64>) -> Result<(), ErrPack<GradShapeError>> {
		if value.shape() != self.value.shape() {
			cold_path();
			return Err(GradShapeError::new(self.value.shape(), value.shape()));
		}
		self.value = value;
		Ok(())
	}

	pub fn shape(&self) -> &[usize] {
		self.value.shape()
	}

	pub fn learnable(&self) -> bool {
		self.learnable
	}

	pub fn grad(&self) -> Option<&ArrayD<f64>> {
		self.grad.as_ref()
	}

	pub fn zero_grad(&mut self) {
		self.grad = None;
	}

	/// Adds `grad` to the accumulated gradient. Backward passes of several
	/// circuits sharing this parameter all land here.
	pub fn acc_grad(&mut self, grad: ArrayViewD<f64>) -> Result<(), ErrPack<GradShapeError>> {
		if grad.shape() != self.value.shape() {
			cold_path();
			return Err(GradShapeError::new(self.value.shape(), grad.shape()));
		}
		if let Some(acc) = &mut self.grad {
			*acc += &grad;
		} else {
			self.grad = Some(grad.to_owned());
		}
		Ok(())
	}

	/// One Adam update from the accumulated gradient. Does nothing when the
	/// parameter is frozen or no gradient has been accumulated.
	pub fn step(&mut self, coef: &OptCoef) -> Result<(), ErrPack<GradShapeError>> {
		if !self.learnable {
			return Ok(());
		}
		let Some(grad) = &self.grad else {
			return Ok(());
		};
		if grad.shape() != self.value.shape() {
			cold_path();
			return Err(GradShapeError::new(self.value.shape(), grad.shape()));
		}

		let m = self
			.m
			.get_or_insert_with(|| ArrayD::zeros(self.value.raw_dim()));
		let v = self
			.v
			.get_or_insert_with(|| ArrayD::zeros(self.value.raw_dim()));

		// Update the first moment estimate
		Zip::from(&mut *m).and(grad).for_each(|m, &g| {
			*m = coef.m_decay * *m + (1.0 - coef.m_decay) * g;
		});

		// Update the second moment estimate
		Zip::from(&mut *v).and(grad).for_each(|v, &g| {
			*v = coef.v_decay * *v + (1.0 - coef.v_decay) * g * g;
		});

		// Update value
		Zip::from(&mut self.value).and(&*m).and(&*v).for_each(|value, &m, &v| {
			*value -= coef.learning_rate * m / (v.sqrt() + coef.eps);
		});

		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use ndarray::IxDyn;

	use super::*;

	fn param(values: &[f64], learnable: bool) -> Param {
		let value = ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap();
		Param::new(value, learnable)
	}

	#[test]
	fn test_acc_grad_accumulates() {
		let mut p = param(&[1.0, 2.0], true);
		let g = ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.5, -1.0]).unwrap();
		p.acc_grad(g.view()).unwrap();
		p.acc_grad(g.view()).unwrap();
		let acc = p.grad().unwrap();
		assert_eq!(acc[[0]], 1.0);
		assert_eq!(acc[[1]], -2.0);

		p.zero_grad();
		assert!(p.grad().is_none());
	}

	#[test]
	fn test_acc_grad_shape_mismatch() {
		let mut p = param(&[1.0, 2.0], true);
		let g = ArrayD::from_shape_vec(IxDyn(&[3]), vec![0.0; 3]).unwrap();
		let err = p.acc_grad(g.view()).unwrap_err();
		assert_eq!(err.code, GradShapeError);
	}

	#[test]
	fn test_step_moves_against_gradient() {
		let mut p = param(&[0.0, 0.0], true);
		let g = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, -1.0]).unwrap();
		let coef = OptCoef::default();
		p.acc_grad(g.view()).unwrap();
		p.step(&coef).unwrap();
		assert!(p.value()[[0]] < 0.0);
		assert!(p.value()[[1]] > 0.0);
		// with a constant gradient, repeated steps keep moving the same way
		for _ in 0..5 {
			p.step(&coef).unwrap();
		}
		assert!(p.value()[[0]] < -0.001);
	}

	#[test]
	fn test_step_skips_frozen_and_empty() {
		let mut frozen = param(&[1.0], false);
		let g = ArrayD::from_shape_vec(IxDyn(&[1]), vec![10.0]).unwrap();
		frozen.acc_grad(g.view()).unwrap();
		frozen.step(&OptCoef::default()).unwrap();
		assert_eq!(frozen.value()[[0]], 1.0);

		let mut empty = param(&[1.0], true);
		empty.step(&OptCoef::default()).unwrap();
		assert_eq!(empty.value()[[0]], 1.0);
	}
}

//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Compiled circuits.
//!
//! A [`TensorCircuit`] mirrors its symbolic circuit layer by layer, so the
//! symbolic [`LayerId`]s still address the compiled layers. The forward pass
//! keeps every layer's output in a [`Trace`]; the backward pass replays the
//! trace in reverse and accumulates leaf gradients through the parameter
//! graphs.

use std::cell::RefCell;
use std::rc::Rc;

use ndarray::{Array2, Array3, ArrayView3, s};
use smallvec::SmallVec;
use thin_vec::ThinVec;

use super::EvalError;
use super::layers::TensorLayer;
use super::parameters::{Autograd, TensorParam};
use super::semiring::Semiring;
use crate::ErrPack;
use crate::opt;
use crate::symbolic::circuit::LayerId;
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;

//--------------------------------------------------------------------------------------------------

#[cold]
#[inline(never)]
fn bad_input_shape(message: String) -> ErrPack<EvalError> {
	ErrPack::new(EvalError::InvalidInputShape, message)
}

/// The layer outputs of one forward pass. Holds a copy of the input so the
/// backward pass can re-derive input layer gradients.
pub struct Trace {
	x: Option<Array3<f64>>,
	values: IndexVec<LayerId, Array2<f64>>,
	batch: usize,
}

impl Trace {
	pub fn batch(&self) -> usize {
		self.batch
	}

	/// Output of one layer, `(batch, units)` in the semiring's domain.
	pub fn value(&self, id: LayerId) -> Option<&Array2<f64>> {
		self.values.get(id)
	}
}

#[derive(Debug)]
pub struct TensorCircuit {
	layers: IndexVec<LayerId, TensorLayer>,
	inputs: IndexVec<LayerId, ThinVec<LayerId>>,
	outputs: Vec<LayerId>,
	semiring: Semiring,
	num_variables: usize,
	num_channels: usize,
	/// Every parameter node of the circuit, for cache invalidation.
	nodes: Vec<TensorParam>,
	/// Leaf storages in discovery order. Shared with every other circuit
	/// compiled from the same symbolic leaves.
	params: Vec<Rc<RefCell<opt::Param>>>,
}

impl TensorCircuit {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		layers: IndexVec<LayerId, TensorLayer>,
		inputs: IndexVec<LayerId, ThinVec<LayerId>>,
		outputs: Vec<LayerId>,
		semiring: Semiring,
		num_variables: usize,
		num_channels: usize,
		nodes: Vec<TensorParam>,
		params: Vec<Rc<RefCell<opt::Param>>>,
	) -> Self {
		Self { layers, inputs, outputs, semiring, num_variables, num_channels, nodes, params }
	}

	pub fn semiring(&self) -> Semiring {
		self.semiring
	}

	pub fn num_layers(&self) -> usize {
		self.layers.len()
	}

	/// Variables the circuit reads; inputs must provide at least this many.
	pub fn num_variables(&self) -> usize {
		self.num_variables
	}

	pub fn num_channels(&self) -> usize {
		self.num_channels
	}

	pub fn outputs(&self) -> &[LayerId] {
		&self.outputs
	}

	/// Leaf parameter storages in discovery order. The same storages back
	/// every circuit compiled by the same compiler, so training one circuit
	/// moves the parameters of all of them.
	pub fn params(&self) -> &[Rc<RefCell<opt::Param>>] {
		&self.params
	}

	/// Drops every cached parameter tensor of this circuit. Needed when leaf
	/// values change outside the compiler, e.g. after a parameter load.
	/// Other circuits sharing the leaves must be invalidated as well;
	/// [`super::Compiler::invalidate`] covers all of them at once.
	pub fn invalidate_params(&self) {
		for node in &self.nodes {
			node.invalidate();
		}
	}

	fn check_input(&self, x: &ArrayView3<'_, f64>) -> Result<(), ErrPack<EvalError>> {
		let (batch, channels, width) = x.dim();
		if batch == 0 || channels != self.num_channels || width < self.num_variables {
			cold_path();
			return Err(bad_input_shape(format!(
				"Expected input (batch > 0, {}, >= {}), got ({batch}, {channels}, {width})",
				self.num_channels, self.num_variables
			)));
		}
		Ok(())
	}

	#[allow(clippy::indexing_slicing)]
	fn forward_impl(&self, x: Option<Array3<f64>>, batch: usize) -> crate::Result<Trace> {
		let mut values: IndexVec<LayerId, Array2<f64>> =
			IndexVec::with_capacity(self.layers.len());
		for id in self.layers.indexes() {
			let children: SmallVec<[&Array2<f64>; 4]> =
				self.inputs[id].iter().map(|&c| &values[c]).collect();
			let out = self.layers[id].forward(&children, x.as_ref(), batch, self.semiring)?;
			drop(children);
			values.push(out);
		}
		Ok(Trace { x, values, batch })
	}

	/// Runs the circuit on `x` of shape `(batch, channels, variables)` and
	/// keeps all layer outputs.
	pub fn forward_trace(&self, x: ArrayView3<'_, f64>) -> crate::Result<Trace> {
		self.check_input(&x)?;
		let batch = x.dim().0;
		self.forward_impl(Some(x.to_owned()), batch)
	}

	/// Forward pass of a circuit with an empty scope (fully integrated or
	/// all-evidence circuits), single row output.
	pub fn forward_trace_constant(&self) -> crate::Result<Trace> {
		if self.num_variables != 0 {
			cold_path();
			return Err(bad_input_shape(format!(
				"The circuit reads {} variables and needs an input",
				self.num_variables
			))
			.into());
		}
		self.forward_impl(None, 1)
	}

	/// Output values of a trace, stacked as `(batch, outputs, units)`.
	#[allow(clippy::indexing_slicing)]
	pub fn stacked_outputs(&self, trace: &Trace) -> Array3<f64> {
		let units = self.outputs.first().map_or(0, |&id| self.layers[id].num_units());
		let mut out = Array3::zeros((trace.batch, self.outputs.len(), units));
		for (k, &id) in self.outputs.iter().enumerate() {
			out.slice_mut(s![.., k, ..]).assign(&trace.values[id]);
		}
		out
	}

	/// `forward_trace` + `stacked_outputs` without keeping the trace.
	pub fn evaluate(&self, x: ArrayView3<'_, f64>) -> crate::Result<Array3<f64>> {
		let trace = self.forward_trace(x)?;
		Ok(self.stacked_outputs(&trace))
	}

	/// Evaluates a constant circuit, `(outputs, units)`.
	#[allow(clippy::indexing_slicing)]
	pub fn evaluate_constant(&self) -> crate::Result<Array2<f64>> {
		let trace = self.forward_trace_constant()?;
		let units = self.outputs.first().map_or(0, |&id| self.layers[id].num_units());
		let mut out = Array2::zeros((self.outputs.len(), units));
		for (k, &id) in self.outputs.iter().enumerate() {
			out.row_mut(k).assign(&trace.values[id].row(0));
		}
		Ok(out)
	}

	/// Accumulates leaf gradients for `d_outputs` of shape
	/// `(batch, outputs, units)`, matching [`Self::stacked_outputs`]. Only
	/// the log semiring has a backward pass.
	#[allow(clippy::indexing_slicing)]
	pub fn backward(&self, trace: &Trace, d_outputs: ArrayView3<'_, f64>) -> crate::Result<()> {
		if self.semiring != Semiring::LogSumExp {
			cold_path();
			return Err(ErrPack::new(
				EvalError::BackwardUnsupported,
				"The backward pass is only defined in the log semiring",
			)
			.into());
		}
		debug_assert_eq!(trace.values.len(), self.layers.len());
		let units = self.outputs.first().map_or(0, |&id| self.layers[id].num_units());
		if d_outputs.dim() != (trace.batch, self.outputs.len(), units) {
			cold_path();
			return Err(bad_input_shape(format!(
				"Expected output gradients ({}, {}, {units}), got {:?}",
				trace.batch,
				self.outputs.len(),
				d_outputs.dim()
			))
			.into());
		}

		let mut d_values: IndexVec<LayerId, Option<Array2<f64>>> =
			IndexVec::from_vec(vec![None; self.layers.len()]);
		for (k, &id) in self.outputs.iter().enumerate() {
			d_values[id] = Some(d_outputs.slice(s![.., k, ..]).to_owned());
		}

		let mut autograd = Autograd::new();
		for id in self.layers.indexes().rev() {
			let Some(d) = d_values[id].take() else {
				continue;
			};
			let children: SmallVec<[&Array2<f64>; 4]> =
				self.inputs[id].iter().map(|&c| &trace.values[c]).collect();
			let child_grads = self.layers[id].backward(
				&mut autograd,
				&children,
				trace.x.as_ref(),
				&trace.values[id],
				&d,
			)?;
			debug_assert_eq!(child_grads.len(), children.len());
			for (&c, g) in self.inputs[id].iter().zip(child_grads) {
				match &mut d_values[c] {
					Some(acc) => *acc += &g,
					slot => *slot = Some(g),
				}
			}
		}
		autograd.run()
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;
	use ndarray::{ArrayD, IxDyn};
	use thin_vec::thin_vec;

	use super::super::layers::CategoricalSource;
	use super::super::parameters::TensorParamOp;
	use super::*;
	use crate::CircuitOpError;

	fn leaf(shape: &[usize], values: &[f64]) -> (TensorParam, Rc<RefCell<opt::Param>>) {
		let value = ArrayD::from_shape_vec(IxDyn(shape), values.to_vec()).unwrap();
		let storage = Rc::new(RefCell::new(opt::Param::new(value, true)));
		let param = TensorParam::new(shape, TensorParamOp::Leaf { storage: Rc::clone(&storage) });
		(param, storage)
	}

	/// categorical(var 0, 2 units, 3 categories) -> dense(1 unit)
	fn chain(semiring: Semiring) -> (TensorCircuit, Rc<RefCell<opt::Param>>) {
		let (table, table_storage) = leaf(&[2, 1, 3], &[0.2, 0.3, 0.5, 0.6, 0.1, 0.3]);
		let (weight, _) = leaf(&[1, 2], &[0.25, 0.75]);

		let mut layers: IndexVec<LayerId, TensorLayer> = IndexVec::new();
		let mut inputs: IndexVec<LayerId, ThinVec<LayerId>> = IndexVec::new();
		let cat = layers.push(TensorLayer::Categorical {
			var: 0,
			num_units: 2,
			num_channels: 1,
			num_categories: 3,
			param: CategoricalSource::Probs(table.clone()),
		});
		inputs.push(thin_vec![]);
		let dense =
			layers.push(TensorLayer::Dense { num_units: 1, num_input_units: 2, weight: weight.clone() });
		inputs.push(thin_vec![cat]);

		let mut seen = std::collections::HashSet::new();
		let mut nodes = Vec::new();
		let mut params = Vec::new();
		table.collect(&mut seen, &mut nodes, &mut params);
		weight.collect(&mut seen, &mut nodes, &mut params);

		let tc =
			TensorCircuit::new(layers, inputs, vec![dense], semiring, 1, 1, nodes, params);
		(tc, table_storage)
	}

	#[test]
	fn test_forward_chain() {
		let (tc, _) = chain(Semiring::SumProduct);
		let x = Array3::from_shape_vec((2, 1, 1), vec![0.0, 2.0]).unwrap();
		let out = tc.evaluate(x.view()).unwrap();
		assert_eq!(out.dim(), (2, 1, 1));
		assert_approx_eq!(out[[0, 0, 0]], 0.25 * 0.2 + 0.75 * 0.6, 1e-12);
		assert_approx_eq!(out[[1, 0, 0]], 0.25 * 0.5 + 0.75 * 0.3, 1e-12);

		// the log semiring computes the same values in log space
		let (tc_log, _) = chain(Semiring::LogSumExp);
		let out_log = tc_log.evaluate(x.view()).unwrap();
		assert_approx_eq!(out_log[[0, 0, 0]].exp(), out[[0, 0, 0]], 1e-12);
		assert_approx_eq!(out_log[[1, 0, 0]].exp(), out[[1, 0, 0]], 1e-12);
	}

	#[test]
	fn test_input_shape_validation() {
		let (tc, _) = chain(Semiring::SumProduct);

		// zero batch
		let x = Array3::zeros((0, 1, 1));
		let err = tc.evaluate(x.view()).unwrap_err();
		assert_eq!(err.code, CircuitOpError::InvalidInputShape);

		// wrong channel count
		let x = Array3::zeros((1, 2, 1));
		let err = tc.evaluate(x.view()).unwrap_err();
		assert_eq!(err.code, CircuitOpError::InvalidInputShape);

		// too few variables
		let x = Array3::zeros((1, 1, 0));
		let err = tc.evaluate(x.view()).unwrap_err();
		assert_eq!(err.code, CircuitOpError::InvalidInputShape);

		// extra variables are allowed
		let x = Array3::zeros((1, 1, 5));
		assert!(tc.evaluate(x.view()).is_ok());
	}

	#[test]
	fn test_constant_eval_needs_empty_scope() {
		let (tc, _) = chain(Semiring::SumProduct);
		let err = tc.evaluate_constant().unwrap_err();
		assert_eq!(err.code, CircuitOpError::InvalidInputShape);
	}

	#[test]
	fn test_backward_needs_log_semiring() {
		let (tc, _) = chain(Semiring::SumProduct);
		let x = Array3::zeros((1, 1, 1));
		let trace = tc.forward_trace(x.view()).unwrap();
		let d = Array3::from_elem((1, 1, 1), 1.0);
		let err = tc.backward(&trace, d.view()).unwrap_err();
		assert_eq!(err.code, CircuitOpError::BackwardUnsupported);
	}

	#[test]
	fn test_backward_gradient_shape_validation() {
		let (tc, _) = chain(Semiring::LogSumExp);
		let x = Array3::zeros((2, 1, 1));
		let trace = tc.forward_trace(x.view()).unwrap();
		let d = Array3::from_elem((1, 1, 1), 1.0);
		let err = tc.backward(&trace, d.view()).unwrap_err();
		assert_eq!(err.code, CircuitOpError::InvalidInputShape);
	}

	#[test]
	fn test_backward_reaches_leaves() {
		let (tc, table_storage) = chain(Semiring::LogSumExp);
		let x = Array3::from_shape_vec((1, 1, 1), vec![0.0]).unwrap();
		let trace = tc.forward_trace(x.view()).unwrap();
		let d = Array3::from_elem((1, 1, 1), 1.0);
		tc.backward(&trace, d.view()).unwrap();

		// d ln(w0 p[u0,cat0] + w1 p[u1,cat0]) / d p[u,0] = w_u / total
		let total = 0.25 * 0.2 + 0.75 * 0.6;
		let grad = table_storage.borrow().grad().unwrap().clone();
		assert_approx_eq!(grad[[0, 0, 0]], 0.25 / total, 1e-12);
		assert_approx_eq!(grad[[1, 0, 0]], 0.75 / total, 1e-12);
		assert_approx_eq!(grad[[0, 0, 1]], 0.0, 1e-12);
	}
}

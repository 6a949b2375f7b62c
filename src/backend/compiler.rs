//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Lowering symbolic circuits onto evaluable ones.
//!
//! The compiler owns what the compiled circuits share: one storage per
//! symbolic leaf, the optimizer settings, and the RNG that materializes the
//! initializers. Compiling several circuits with the same compiler ties
//! them together wherever they reference the same symbolic parameter nodes,
//! so a circuit and the integral circuit derived from it train as one model.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use ndarray::{ArrayD, IxDyn};
use thin_vec::ThinVec;

use super::CompileError;
use super::circuit::TensorCircuit;
use super::layers::{CategoricalSource, TensorLayer};
use super::parameters::{TensorParam, TensorParamOp};
use super::semiring::Semiring;
use crate::ErrPack;
use crate::opt::{self, OptCoef};
use crate::rng::Rng;
use crate::symbolic::circuit::{Circuit, LayerId};
use crate::symbolic::layers::{CategoricalParam, Layer};
use crate::symbolic::parameters::{Initializer, Param, ParamOp};
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;

//--------------------------------------------------------------------------------------------------

#[cold]
#[inline(never)]
fn polynomial_in_log() -> ErrPack<CompileError> {
	ErrPack::new(
		CompileError::PolynomialInLogSemiring,
		"Polynomial layers have no log-space form; compile with Semiring::SumProduct",
	)
}

#[cold]
#[inline(never)]
fn non_uniform_outputs(units: &[usize]) -> ErrPack<CompileError> {
	ErrPack::new(
		CompileError::NonUniformOutputs,
		format!("Output layers disagree on unit counts: {units:?}"),
	)
}

fn has_polynomial(layer: &Layer) -> bool {
	match layer {
		Layer::Polynomial { .. } => true,
		Layer::Evidence { layer, .. } => has_polynomial(layer),
		_ => false,
	}
}

//--------------------------------------------------------------------------------------------------

pub struct Compiler {
	semiring: Semiring,
	rng: Rng,
	pub opt_coef: OptCoef,
	/// Symbolic node address -> compiled node. The symbolic handle is kept
	/// alive alongside, so the address cannot be reused by a new node.
	compiled: HashMap<usize, (Param, TensorParam)>,
	/// Every compiled parameter node, for invalidation after a step.
	registry: Vec<TensorParam>,
	/// Every leaf storage, in first-compile order.
	leaves: Vec<Rc<RefCell<opt::Param>>>,
}

impl Compiler {
	/// A compiler with the default RNG seed, so parameter initialization is
	/// reproducible run to run.
	pub fn new(semiring: Semiring) -> Self {
		Self::with_rng(semiring, Rng::default())
	}

	pub fn with_rng(semiring: Semiring, rng: Rng) -> Self {
		Self {
			semiring,
			rng,
			opt_coef: OptCoef::default(),
			compiled: HashMap::new(),
			registry: Vec::new(),
			leaves: Vec::new(),
		}
	}

	pub fn semiring(&self) -> Semiring {
		self.semiring
	}

	/// Lowers `circuit` onto a [`TensorCircuit`] with the same layer ids.
	/// Parameters shared with previously compiled circuits stay shared.
	pub fn compile(&mut self, circuit: &Circuit) -> crate::Result<TensorCircuit> {
		if self.semiring == Semiring::LogSumExp
			&& circuit.layer_ids().any(|id| has_polynomial(&circuit[id]))
		{
			cold_path();
			return Err(polynomial_in_log().into());
		}
		let outputs = circuit.outputs().to_vec();
		let units: Vec<usize> = outputs.iter().map(|&id| circuit[id].num_units()).collect();
		if let Some((&first, rest)) = units.split_first()
			&& rest.iter().any(|&u| u != first)
		{
			cold_path();
			return Err(non_uniform_outputs(&units).into());
		}

		let mut layers: IndexVec<LayerId, TensorLayer> =
			IndexVec::with_capacity(circuit.num_layers());
		let mut inputs: IndexVec<LayerId, ThinVec<LayerId>> =
			IndexVec::with_capacity(circuit.num_layers());
		let mut roots: Vec<TensorParam> = Vec::new();
		for id in circuit.layer_ids() {
			layers.push(self.compile_layer(&circuit[id], &mut roots));
			inputs.push(circuit.layer_inputs(id).iter().copied().collect());
		}

		// Collect this circuit's parameter nodes and leaf storages. The
		// first-visit order is determined by the circuit structure alone,
		// which is what gives the leaves stable serialization names.
		let mut seen = HashSet::new();
		let mut nodes = Vec::new();
		let mut leaves = Vec::new();
		for root in &roots {
			root.collect(&mut seen, &mut nodes, &mut leaves);
		}

		Ok(TensorCircuit::new(
			layers,
			inputs,
			outputs,
			self.semiring,
			circuit.num_variables(),
			circuit.num_channels(),
			nodes,
			leaves,
		))
	}

	fn compile_layer(&mut self, layer: &Layer, roots: &mut Vec<TensorParam>) -> TensorLayer {
		match layer {
			Layer::Categorical { scope, num_units, num_channels, num_categories, param } => {
				#[allow(clippy::unwrap_used)] // input layers are univariate by construction
				let var = scope.iter().next().unwrap();
				let table = self.compile_param(param.param());
				roots.push(table.clone());
				let param = match param {
					CategoricalParam::Probs(_) => CategoricalSource::Probs(table),
					CategoricalParam::Logits(_) => CategoricalSource::Logits(table),
				};
				TensorLayer::Categorical {
					var,
					num_units: *num_units,
					num_channels: *num_channels,
					num_categories: *num_categories,
					param,
				}
			},
			Layer::Gaussian { scope, num_units, num_channels, mean, stddev, log_partition } => {
				#[allow(clippy::unwrap_used)] // input layers are univariate by construction
				let var = scope.iter().next().unwrap();
				let mean = self.compile_param(mean);
				let stddev = self.compile_param(stddev);
				let log_partition = log_partition.as_ref().map(|lp| self.compile_param(lp));
				roots.push(mean.clone());
				roots.push(stddev.clone());
				if let Some(lp) = &log_partition {
					roots.push(lp.clone());
				}
				TensorLayer::Gaussian {
					var,
					num_units: *num_units,
					num_channels: *num_channels,
					mean,
					stddev,
					log_partition,
				}
			},
			Layer::Polynomial { scope, num_units, coeff, .. } => {
				#[allow(clippy::unwrap_used)] // input layers are univariate by construction
				let var = scope.iter().next().unwrap();
				let coeff = self.compile_param(coeff);
				roots.push(coeff.clone());
				TensorLayer::Polynomial { var, num_units: *num_units, coeff }
			},
			Layer::LogPartition { num_units, value, .. } => {
				let value = self.compile_param(value);
				roots.push(value.clone());
				TensorLayer::LogPartition { num_units: *num_units, value }
			},
			Layer::Evidence { layer, observation } => {
				let inner = self.compile_layer(layer, roots);
				TensorLayer::Evidence {
					inner: Box::new(inner),
					observation: observation.clone(),
				}
			},
			Layer::Dense { num_units, num_input_units, weight } => {
				let weight = self.compile_param(weight);
				roots.push(weight.clone());
				TensorLayer::Dense {
					num_units: *num_units,
					num_input_units: *num_input_units,
					weight,
				}
			},
			Layer::Mixing { num_units, arity, weight } => {
				let weight = self.compile_param(weight);
				roots.push(weight.clone());
				TensorLayer::Mixing { num_units: *num_units, arity: *arity, weight }
			},
			Layer::Hadamard { num_units, arity } => {
				TensorLayer::Hadamard { num_units: *num_units, arity: *arity }
			},
			Layer::Kronecker { lhs_units, rhs_units } => {
				TensorLayer::Kronecker { lhs_units: *lhs_units, rhs_units: *rhs_units }
			},
		}
	}

	#[allow(clippy::too_many_lines)]
	fn compile_param(&mut self, param: &Param) -> TensorParam {
		if let Some((_, compiled)) = self.compiled.get(&param.node_addr()) {
			return compiled.clone();
		}
		let op = match param.op() {
			ParamOp::Leaf { init, learnable } => {
				let storage = self.materialize_leaf(param.shape(), init, *learnable);
				TensorParamOp::Leaf { storage }
			},
			ParamOp::Constant { value } => TensorParamOp::Constant { value: *value },
			ParamOp::Exp(a) => TensorParamOp::Exp(self.compile_param(a)),
			ParamOp::Log(a) => TensorParamOp::Log(self.compile_param(a)),
			ParamOp::Softplus(a) => TensorParamOp::Softplus(self.compile_param(a)),
			ParamOp::Sigmoid(a) => TensorParamOp::Sigmoid(self.compile_param(a)),
			ParamOp::ScaledSigmoid { input, vmin, vmax } => TensorParamOp::ScaledSigmoid {
				input: self.compile_param(input),
				vmin: *vmin,
				vmax: *vmax,
			},
			ParamOp::Softmax { input, axis } => TensorParamOp::Softmax {
				input: self.compile_param(input),
				axis: *axis,
			},
			ParamOp::LogSoftmax { input, axis } => TensorParamOp::LogSoftmax {
				input: self.compile_param(input),
				axis: *axis,
			},
			ParamOp::ReduceSum { input, axis } => TensorParamOp::ReduceSum {
				input: self.compile_param(input),
				axis: *axis,
			},
			ParamOp::ReduceLogSumExp { input, axis } => TensorParamOp::ReduceLogSumExp {
				input: self.compile_param(input),
				axis: *axis,
			},
			ParamOp::PolynomialDifferential(a) => {
				TensorParamOp::PolynomialDifferential(self.compile_param(a))
			},
			ParamOp::Add(a, b) => {
				TensorParamOp::Add(self.compile_param(a), self.compile_param(b))
			},
			ParamOp::Kronecker(a, b) => {
				TensorParamOp::Kronecker(self.compile_param(a), self.compile_param(b))
			},
			ParamOp::OuterProduct { lhs, rhs, axis } => TensorParamOp::OuterProduct {
				lhs: self.compile_param(lhs),
				rhs: self.compile_param(rhs),
				axis: *axis,
			},
			ParamOp::OuterSum { lhs, rhs, axis } => TensorParamOp::OuterSum {
				lhs: self.compile_param(lhs),
				rhs: self.compile_param(rhs),
				axis: *axis,
			},
			ParamOp::PolynomialProduct(a, b) => {
				TensorParamOp::PolynomialProduct(self.compile_param(a), self.compile_param(b))
			},
			ParamOp::GaussianProductMean { mean1, stddev1, mean2, stddev2 } => {
				TensorParamOp::GaussianProductMean {
					mean1: self.compile_param(mean1),
					stddev1: self.compile_param(stddev1),
					mean2: self.compile_param(mean2),
					stddev2: self.compile_param(stddev2),
				}
			},
			ParamOp::GaussianProductStddev { stddev1, stddev2 } => {
				TensorParamOp::GaussianProductStddev {
					stddev1: self.compile_param(stddev1),
					stddev2: self.compile_param(stddev2),
				}
			},
			ParamOp::GaussianProductLogPartition { mean1, stddev1, mean2, stddev2 } => {
				TensorParamOp::GaussianProductLogPartition {
					mean1: self.compile_param(mean1),
					stddev1: self.compile_param(stddev1),
					mean2: self.compile_param(mean2),
					stddev2: self.compile_param(stddev2),
				}
			},
		};
		let compiled = TensorParam::new(param.shape(), op);
		self.registry.push(compiled.clone());
		self.compiled.insert(param.node_addr(), (param.clone(), compiled.clone()));
		compiled
	}

	fn materialize_leaf(
		&mut self,
		shape: &[usize],
		init: &Initializer,
		learnable: bool,
	) -> Rc<RefCell<opt::Param>> {
		let mut data = vec![0.0_f64; shape.iter().product()];
		match init {
			Initializer::Normal { mean, stddev } => {
				self.rng.randn(&mut data);
				if *mean != 0.0 || *stddev != 1.0 {
					for v in &mut data {
						*v = mean + stddev * *v;
					}
				}
			},
			Initializer::Uniform { lo, hi } => self.rng.rand_uniform(&mut data, *lo, *hi),
			Initializer::Constant(c) => data.fill(*c),
		}
		#[allow(clippy::unwrap_used)] // the element count matches the shape
		let value = ArrayD::from_shape_vec(IxDyn(shape), data).unwrap();
		let storage = Rc::new(RefCell::new(opt::Param::new(value, learnable)));
		self.leaves.push(Rc::clone(&storage));
		storage
	}

	//----------------------------------------------------------------------------------------------
	// Training. The compiler owns the leaves, so one call covers every
	// circuit it compiled.

	/// Clears the gradient accumulators of all compiled leaves.
	pub fn zero_grad(&mut self) {
		for leaf in &self.leaves {
			leaf.borrow_mut().zero_grad();
		}
	}

	/// One Adam step over all learnable leaves with accumulated gradients,
	/// then drops every cached parameter tensor.
	pub fn step(&mut self) -> crate::Result<()> {
		for leaf in &self.leaves {
			leaf.borrow_mut().step(&self.opt_coef)?;
		}
		self.invalidate();
		Ok(())
	}

	/// Drops the cached tensors of every parameter node compiled so far.
	pub fn invalidate(&self) {
		for node in &self.registry {
			node.invalidate();
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;
	use ndarray::Array3;

	use super::*;
	use crate::CircuitOpError;
	use crate::region_graph::algorithms::fully_factorized;
	use crate::scope::Scope;
	use crate::symbolic::circuit::{
		CircuitBuilder, LayerFactories, RegionGraphSettings, from_region_graph,
	};

	fn categorical_circuit(num_variables: usize) -> Rc<Circuit> {
		let rg = fully_factorized(num_variables).unwrap();
		let settings = RegionGraphSettings {
			num_input_units: 2,
			num_sum_units: 2,
			..Default::default()
		};
		from_region_graph(&rg, &settings, &LayerFactories::monotonic_categorical(3)).unwrap()
	}

	#[test]
	fn test_compile_mirrors_layers() {
		let sc = categorical_circuit(3);
		let mut compiler = Compiler::new(Semiring::LogSumExp);
		let tc = compiler.compile(&sc).unwrap();

		assert_eq!(tc.num_layers(), sc.num_layers());
		assert_eq!(tc.num_variables(), 3);
		assert_eq!(tc.num_channels(), 1);
		assert_eq!(tc.outputs(), sc.outputs());
		// one table per variable plus one weight per sum layer
		assert_eq!(tc.params().len(), 3 + 4);

		let x = Array3::from_shape_fn((4, 1, 3), |(b, _, v)| ((b + v) % 3) as f64);
		let out = tc.evaluate(x.view()).unwrap();
		assert_eq!(out.dim(), (4, 1, 1));
		for v in &out {
			assert!(v.is_finite());
			// log probabilities of a normalized circuit
			assert!(*v < 0.0);
		}
	}

	#[test]
	fn test_polynomial_only_compiles_linear() {
		let rg = fully_factorized(2).unwrap();
		let sc = from_region_graph(
			&rg,
			&RegionGraphSettings::default(),
			&LayerFactories::polynomial(2),
		)
		.unwrap();

		let err = Compiler::new(Semiring::LogSumExp).compile(&sc).unwrap_err();
		assert_eq!(err.code, CircuitOpError::PolynomialInLogSemiring);

		let tc = Compiler::new(Semiring::SumProduct).compile(&sc).unwrap();
		let x = Array3::from_shape_fn((2, 1, 2), |(b, _, v)| 0.5 * ((b + v) as f64));
		assert!(tc.evaluate(x.view()).is_ok());
	}

	#[test]
	fn test_non_uniform_outputs_rejected() {
		let mut builder = CircuitBuilder::new();
		let t2 = Param::leaf(&[2, 1, 3], Initializer::Constant(0.25), true).unwrap();
		let t3 = Param::leaf(&[3, 1, 3], Initializer::Constant(0.25), true).unwrap();
		builder
			.add_layer(
				Layer::categorical(Scope::singleton(0), 2, 1, 3, Some(t2), None).unwrap(),
				&[],
			)
			.unwrap();
		builder
			.add_layer(
				Layer::categorical(Scope::singleton(1), 3, 1, 3, Some(t3), None).unwrap(),
				&[],
			)
			.unwrap();
		let sc = builder.build(None).unwrap();

		let err = Compiler::new(Semiring::SumProduct).compile(&sc).unwrap_err();
		assert_eq!(err.code, CircuitOpError::NonUniformOutputs);
	}

	#[test]
	fn test_recompilation_shares_leaves() {
		let sc = categorical_circuit(2);
		let mut compiler = Compiler::new(Semiring::LogSumExp);
		let a = compiler.compile(&sc).unwrap();
		let b = compiler.compile(&sc).unwrap();

		assert_eq!(a.params().len(), b.params().len());
		for (pa, pb) in a.params().iter().zip(b.params()) {
			assert!(Rc::ptr_eq(pa, pb));
		}

		// a fresh compiler materializes its own leaves
		let c = Compiler::new(Semiring::LogSumExp).compile(&sc).unwrap();
		assert!(!Rc::ptr_eq(&a.params()[0], &c.params()[0]));
	}

	#[test]
	fn test_deterministic_initialization() {
		let sc = categorical_circuit(2);
		let a = Compiler::new(Semiring::LogSumExp).compile(&sc).unwrap();
		let b = Compiler::new(Semiring::LogSumExp).compile(&sc).unwrap();

		let x = Array3::from_shape_fn((3, 1, 2), |(b, _, v)| ((b + v) % 3) as f64);
		let out_a = a.evaluate(x.view()).unwrap();
		let out_b = b.evaluate(x.view()).unwrap();
		for (va, vb) in out_a.iter().zip(out_b.iter()) {
			assert_approx_eq!(va, vb, 1e-15);
		}
	}

	#[test]
	fn test_step_updates_compiled_values() {
		let sc = categorical_circuit(2);
		let mut compiler = Compiler::new(Semiring::LogSumExp);
		let tc = compiler.compile(&sc).unwrap();

		let x = Array3::from_shape_fn((2, 1, 2), |(b, _, v)| ((b + v) % 3) as f64);
		let before = tc.evaluate(x.view()).unwrap();

		compiler.zero_grad();
		let trace = tc.forward_trace(x.view()).unwrap();
		// descending along -score raises the likelihood of the batch
		let d = Array3::from_elem((2, 1, 1), -1.0);
		tc.backward(&trace, d.view()).unwrap();
		compiler.step().unwrap();

		// caches were invalidated, so the new values show up
		let after = tc.evaluate(x.view()).unwrap();
		let moved = before.iter().zip(after.iter()).any(|(a, b)| (a - b).abs() > 1e-9);
		assert!(moved);
		let total_before: f64 = before.iter().sum();
		let total_after: f64 = after.iter().sum();
		assert!(total_after > total_before);
	}
}

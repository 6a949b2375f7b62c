//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Circuit operators.
//!
//! Every operator builds a new circuit and ties its parameters to the
//! operand circuits by sharing the symbolic parameter nodes. The operand
//! handles are kept in the result's [`CircuitOperation`], so compiling a
//! pipeline of circuits materializes each shared leaf once.

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::{SmallVec, smallvec};

use crate::ErrPack;
use crate::scope::Scope;
use crate::symbolic::circuit::{
	Circuit, CircuitBuilder, CircuitOperation, CircuitOperator, LayerId,
};
use crate::symbolic::layers::{CategoricalParam, Layer};
use crate::symbolic::parameters::Param;
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum OperatorError {
	NotSmooth,
	NotDecomposable,
	NotCompatible,
	ScopeNotInCircuit,
	ScopeMismatch,
	MultipleOutputs,
	MisalignedProducts,
	ObservationOutOfScope,
	NoIntegrationRule,
	NoProductRule,
	NoDifferentiationRule,
}

fn check_smooth_decomposable(sc: &Circuit, op: &str) -> crate::Result<()> {
	if !sc.is_smooth() {
		cold_path();
		return Err(ErrPack::new(
			OperatorError::NotSmooth,
			format!("Only smooth circuits can be {op}"),
		)
		.into());
	}
	if !sc.is_decomposable() {
		cold_path();
		return Err(ErrPack::new(
			OperatorError::NotDecomposable,
			format!("Only decomposable circuits can be {op}"),
		)
		.into());
	}
	Ok(())
}

fn single_output(sc: &Circuit) -> crate::Result<LayerId> {
	if let &[out] = sc.outputs() {
		Ok(out)
	} else {
		cold_path();
		Err(ErrPack::new(
			OperatorError::MultipleOutputs,
			format!("Expected a single output layer, the circuit has {}", sc.outputs().len()),
		)
		.into())
	}
}

//--------------------------------------------------------------------------------------------------

/// Fixes the observed variables to the given per-channel values.
///
/// Each observed input layer is wrapped in an [`Layer::Evidence`] layer,
/// which removes its variables from the circuit scope. Everything else is
/// copied with shared parameters.
#[allow(clippy::indexing_slicing)]
pub fn evidence(
	sc: &Rc<Circuit>,
	observations: &HashMap<usize, Vec<f64>>,
) -> crate::Result<Rc<Circuit>> {
	let circuit_scope = sc.scope();
	for &var in observations.keys() {
		if !circuit_scope.contains(var) {
			cold_path();
			return Err(ErrPack::new(
				OperatorError::ObservationOutOfScope,
				format!("Variable {var} is not in the circuit scope {circuit_scope}"),
			)
			.into());
		}
	}

	let mut builder = CircuitBuilder::new();
	let mut map: IndexVec<LayerId, LayerId> = IndexVec::new();
	for id in sc.layer_ids() {
		let layer = &sc[id];
		let new_id = if layer.is_input() {
			let observed = layer
				.intrinsic_scope()
				.and_then(|scope| scope.iter().next())
				.and_then(|var| observations.get(&var));
			match observed {
				Some(values) => builder.add_layer(Layer::evidence(layer.clone(), values)?, &[])?,
				None => builder.add_layer(layer.clone(), &[])?,
			}
		} else {
			let children: SmallVec<[LayerId; 4]> =
				sc.layer_inputs(id).iter().map(|&c| map[c]).collect();
			builder.add_layer(layer.clone(), &children)?
		};
		map.push(new_id);
	}

	let operation = CircuitOperation {
		operator: CircuitOperator::Evidence,
		operands: smallvec![Rc::clone(sc)],
	};
	Ok(Rc::new(builder.build(Some(operation))?))
}

//--------------------------------------------------------------------------------------------------

fn integrate_input_layer(layer: &Layer) -> crate::Result<Layer> {
	let integral = match layer {
		Layer::Categorical { num_units, num_channels, param, .. } => {
			let value = match param {
				CategoricalParam::Probs(probs) => {
					// per-unit mass of each channel, multiplied over channels
					probs.reduce_sum(2)?.log().reduce_sum(1)?
				},
				// softmax logits are normalized per channel
				CategoricalParam::Logits(_) => Param::constant(&[*num_units], 0.0)?,
			};
			Layer::log_partition(*num_units, *num_channels, value)?
		},
		Layer::Gaussian { num_units, num_channels, log_partition, .. } => {
			let value = match log_partition {
				Some(lp) => lp.reduce_sum(1)?,
				None => Param::constant(&[*num_units], 0.0)?,
			};
			Layer::log_partition(*num_units, *num_channels, value)?
		},
		_ => {
			cold_path();
			return Err(ErrPack::new(
				OperatorError::NoIntegrationRule,
				format!("No integration rule for `{}` layers", layer.name()),
			)
			.into());
		},
	};
	Ok(integral)
}

/// Integrates the circuit over `scope` (default: the whole circuit scope).
///
/// Input layers inside the scope become [`Layer::LogPartition`] constants;
/// inner layers are copied with shared parameters. Integrating everything
/// yields the partition function circuit.
#[allow(clippy::indexing_slicing)]
pub fn integrate(sc: &Rc<Circuit>, scope: Option<&Scope>) -> crate::Result<Rc<Circuit>> {
	check_smooth_decomposable(sc, "integrated")?;
	let circuit_scope = sc.scope();
	let int_scope = scope.cloned().unwrap_or_else(|| circuit_scope.clone());
	if !int_scope.is_subset_of(&circuit_scope) {
		cold_path();
		return Err(ErrPack::new(
			OperatorError::ScopeNotInCircuit,
			format!(
				"Integration scope {int_scope} is not a subset of the circuit scope {circuit_scope}"
			),
		)
		.into());
	}

	let mut builder = CircuitBuilder::new();
	let mut map: IndexVec<LayerId, LayerId> = IndexVec::new();
	for id in sc.layer_ids() {
		let layer = &sc[id];
		let layer_scope = sc.layer_scope(id);
		let new_id = if layer.is_input() {
			if !layer_scope.is_empty() && layer_scope.is_subset_of(&int_scope) {
				builder.add_layer(integrate_input_layer(layer)?, &[])?
			} else {
				builder.add_layer(layer.clone(), &[])?
			}
		} else {
			let children: SmallVec<[LayerId; 4]> =
				sc.layer_inputs(id).iter().map(|&c| map[c]).collect();
			builder.add_layer(layer.clone(), &children)?
		};
		map.push(new_id);
	}

	let operation = CircuitOperation {
		operator: CircuitOperator::Integration,
		operands: smallvec![Rc::clone(sc)],
	};
	Ok(Rc::new(builder.build(Some(operation))?))
}

//--------------------------------------------------------------------------------------------------

fn mul_input_layers(lhs: &Layer, rhs: &Layer) -> crate::Result<Layer> {
	let product = match (lhs, rhs) {
		(
			Layer::Categorical {
				scope,
				num_units: kl,
				num_channels,
				num_categories: nl,
				param: pl,
			},
			Layer::Categorical { num_units: kr, num_categories: nr, param: pr, .. },
		) => {
			if nl != nr {
				cold_path();
				return Err(ErrPack::new(
					OperatorError::NoProductRule,
					format!(
						"Cannot multiply categorical layers with {nl} and {nr} categories"
					),
				)
				.into());
			}
			let (CategoricalParam::Probs(pl), CategoricalParam::Probs(pr)) = (pl, pr) else {
				cold_path();
				return Err(ErrPack::new(
					OperatorError::NoProductRule,
					"Categorical products need the probs parameterization",
				)
				.into());
			};
			let probs = pl.outer_product(pr, 0)?;
			Layer::categorical(scope.clone(), kl * kr, *num_channels, *nl, Some(probs), None)?
		},
		(
			Layer::Gaussian {
				scope,
				num_units: kl,
				num_channels,
				mean: ml,
				stddev: sl,
				log_partition: lpl,
			},
			Layer::Gaussian {
				num_units: kr, mean: mr, stddev: sr, log_partition: lpr, ..
			},
		) => {
			let mean = Param::gaussian_product_mean(ml, sl, mr, sr)?;
			let stddev = Param::gaussian_product_stddev(sl, sr)?;
			// the product of two normalized Gaussians is itself unnormalized
			let mut log_partition = Param::gaussian_product_log_partition(ml, sl, mr, sr)?;
			let carried = match (lpl, lpr) {
				(None, None) => None,
				(Some(a), None) => Some(a.outer_sum(&Param::constant(sr.shape(), 0.0)?, 0)?),
				(None, Some(b)) => Some(Param::constant(sl.shape(), 0.0)?.outer_sum(b, 0)?),
				(Some(a), Some(b)) => Some(a.outer_sum(b, 0)?),
			};
			if let Some(carried) = carried {
				log_partition = log_partition.add(&carried)?;
			}
			Layer::gaussian(
				scope.clone(),
				kl * kr,
				*num_channels,
				mean,
				stddev,
				Some(log_partition),
			)?
		},
		(
			Layer::Polynomial { scope, num_units: kl, degree: dl, coeff: cl },
			Layer::Polynomial { num_units: kr, degree: dr, coeff: cr, .. },
		) => {
			let coeff = cl.polynomial_product(cr)?;
			Layer::polynomial(scope.clone(), kl * kr, 1, dl + dr, coeff)?
		},
		(
			Layer::Evidence { layer: il, observation: ol },
			Layer::Evidence { layer: ir, observation: or },
		) => {
			if ol != or {
				cold_path();
				return Err(ErrPack::new(
					OperatorError::NoProductRule,
					"Cannot multiply evidence layers with different observations",
				)
				.into());
			}
			Layer::evidence(mul_input_layers(il, ir)?, ol)?
		},
		(lhs, rhs) => {
			cold_path();
			return Err(ErrPack::new(
				OperatorError::NoProductRule,
				format!("No product rule for `{}` x `{}`", lhs.name(), rhs.name()),
			)
			.into());
		},
	};
	Ok(product)
}

struct ProductCtx<'a> {
	lhs: &'a Circuit,
	rhs: &'a Circuit,
	builder: CircuitBuilder,
	memo: HashMap<(LayerId, LayerId), LayerId>,
}

#[cold]
#[inline(never)]
fn misaligned(lhs: &Layer, rhs: &Layer) -> ErrPack<OperatorError> {
	ErrPack::new(
		OperatorError::MisalignedProducts,
		format!("Cannot align `{}` with `{}`", lhs.name(), rhs.name()),
	)
}

#[allow(clippy::indexing_slicing)]
fn mul_layers(ctx: &mut ProductCtx<'_>, l: LayerId, r: LayerId) -> crate::Result<LayerId> {
	if let Some(&id) = ctx.memo.get(&(l, r)) {
		return Ok(id);
	}
	let lhs = ctx.lhs;
	let rhs = ctx.rhs;
	let new_id = match (&lhs[l], &rhs[r]) {
		(
			Layer::Dense { num_units: kl, num_input_units: il, weight: wl },
			Layer::Dense { num_units: kr, num_input_units: ir, weight: wr },
		) => {
			let child = mul_layers(ctx, lhs.layer_inputs(l)[0], rhs.layer_inputs(r)[0])?;
			let layer = Layer::dense(kl * kr, il * ir, wl.kronecker(wr)?)?;
			ctx.builder.add_layer(layer, &[child])?
		},
		(
			Layer::Mixing { num_units: kl, arity: al, weight: wl },
			Layer::Mixing { num_units: kr, arity: ar, weight: wr },
		) => {
			// all pairs of partitionings, lhs-major to match the Kronecker
			// weight layout
			let mut children: SmallVec<[LayerId; 4]> = SmallVec::new();
			for &cl in lhs.layer_inputs(l) {
				for &cr in rhs.layer_inputs(r) {
					children.push(mul_layers(ctx, cl, cr)?);
				}
			}
			let layer = Layer::mixing(kl * kr, al * ar, wl.kronecker(wr)?)?;
			ctx.builder.add_layer(layer, &children)?
		},
		(
			hl @ Layer::Hadamard { num_units: kl, arity: al },
			hr @ Layer::Hadamard { num_units: kr, arity: ar },
		) => {
			if al != ar {
				cold_path();
				return Err(misaligned(hl, hr).into());
			}
			let mut left: SmallVec<[LayerId; 4]> =
				lhs.layer_inputs(l).iter().copied().collect();
			let mut right: SmallVec<[LayerId; 4]> =
				rhs.layer_inputs(r).iter().copied().collect();
			left.sort_by(|&a, &b| lhs.layer_scope(a).cmp(lhs.layer_scope(b)));
			right.sort_by(|&a, &b| rhs.layer_scope(a).cmp(rhs.layer_scope(b)));
			let mut children: SmallVec<[LayerId; 4]> = SmallVec::new();
			for (&cl, &cr) in left.iter().zip(&right) {
				if lhs.layer_scope(cl) != rhs.layer_scope(cr) {
					cold_path();
					return Err(misaligned(hl, hr).into());
				}
				children.push(mul_layers(ctx, cl, cr)?);
			}
			ctx.builder.add_layer(Layer::hadamard(kl * kr, *al)?, &children)?
		},
		(kl @ Layer::Kronecker { .. }, kr @ Layer::Kronecker { .. }) => {
			cold_path();
			// would need an output permutation on top of the kronecker
			return Err(ErrPack::new(
				OperatorError::NoProductRule,
				format!("No product rule for `{}` x `{}`", kl.name(), kr.name()),
			)
			.into());
		},
		(
			Layer::LogPartition { num_units: kl, num_channels, value: vl },
			Layer::LogPartition { num_units: kr, value: vr, .. },
		) => {
			let layer = Layer::log_partition(kl * kr, *num_channels, vl.outer_sum(vr, 0)?)?;
			ctx.builder.add_layer(layer, &[])?
		},
		(ll, lr) if ll.is_input() && lr.is_input() => {
			if ll.intrinsic_scope() != lr.intrinsic_scope() {
				cold_path();
				return Err(misaligned(ll, lr).into());
			}
			ctx.builder.add_layer(mul_input_layers(ll, lr)?, &[])?
		},
		(ll, lr) => {
			cold_path();
			return Err(misaligned(ll, lr).into());
		},
	};
	ctx.memo.insert((l, r), new_id);
	Ok(new_id)
}

/// Multiplies two compatible circuits over the same scope.
///
/// The result computes the pointwise product of the operands' outputs; its
/// unit counts are the products of the operands' unit counts. Layer pairs
/// are aligned recursively from the outputs and memoized, so shared
/// sub-structure is multiplied once.
pub fn multiply(lhs: &Rc<Circuit>, rhs: &Rc<Circuit>) -> crate::Result<Rc<Circuit>> {
	let lhs_scope = lhs.scope();
	let rhs_scope = rhs.scope();
	if lhs_scope != rhs_scope {
		cold_path();
		return Err(ErrPack::new(
			OperatorError::ScopeMismatch,
			format!("Cannot multiply circuits over scopes {lhs_scope} and {rhs_scope}"),
		)
		.into());
	}
	if lhs.num_channels() != rhs.num_channels() {
		cold_path();
		return Err(ErrPack::new(
			OperatorError::NotCompatible,
			format!(
				"Operands have {} and {} channels",
				lhs.num_channels(),
				rhs.num_channels()
			),
		)
		.into());
	}
	let lhs_out = single_output(lhs)?;
	let rhs_out = single_output(rhs)?;
	if !lhs.is_compatible(rhs, None) {
		cold_path();
		return Err(ErrPack::new(
			OperatorError::NotCompatible,
			"Only compatible circuits can be multiplied into a decomposable circuit",
		)
		.into());
	}

	let mut ctx =
		ProductCtx { lhs, rhs, builder: CircuitBuilder::new(), memo: HashMap::new() };
	mul_layers(&mut ctx, lhs_out, rhs_out)?;

	let operation = CircuitOperation {
		operator: CircuitOperator::Multiplication,
		operands: smallvec![Rc::clone(lhs), Rc::clone(rhs)],
	};
	Ok(Rc::new(ctx.builder.build(Some(operation))?))
}

//--------------------------------------------------------------------------------------------------

struct DiffEntry {
	/// One derivative layer per variable of the layer's scope, ascending.
	derivs: Vec<LayerId>,
	copy: LayerId,
}

#[allow(clippy::indexing_slicing)]
fn product_rule_children(
	sc: &Circuit,
	map: &IndexVec<LayerId, DiffEntry>,
	children: &[LayerId],
	var: usize,
) -> crate::Result<SmallVec<[LayerId; 4]>> {
	let mut out = SmallVec::new();
	let mut found = false;
	for &child in children {
		let entry = &map[child];
		if let Some(position) = sc.layer_scope(child).position(var) {
			out.push(entry.derivs[position]);
			found = true;
		} else {
			out.push(entry.copy);
		}
	}
	if !found {
		cold_path();
		return Err(ErrPack::new(
			OperatorError::ScopeMismatch,
			format!("Variable {var} is not covered by the product children"),
		)
		.into());
	}
	Ok(out)
}

/// Differentiates the circuit with respect to every variable of its scope.
///
/// The result has `|scope| + 1` outputs: the partial derivative for each
/// variable in ascending order, followed by a copy of the circuit itself.
/// All parameters are shared with the operand.
#[allow(clippy::indexing_slicing)]
pub fn differentiate(sc: &Rc<Circuit>) -> crate::Result<Rc<Circuit>> {
	check_smooth_decomposable(sc, "differentiated")?;
	single_output(sc)?;

	let mut builder = CircuitBuilder::new();
	let mut map: IndexVec<LayerId, DiffEntry> = IndexVec::new();

	for id in sc.layer_ids() {
		let layer = &sc[id];
		let scope = sc.layer_scope(id);
		let children = sc.layer_inputs(id);
		let mut derivs: Vec<LayerId> = Vec::with_capacity(scope.len());

		match layer {
			Layer::Polynomial { scope: var_scope, num_units, degree, coeff } => {
				let deriv = Layer::polynomial(
					var_scope.clone(),
					*num_units,
					1,
					degree.saturating_sub(1),
					coeff.polynomial_differential()?,
				)?;
				derivs.push(builder.add_layer(deriv, &[])?);
			},
			Layer::Categorical { .. } | Layer::Gaussian { .. } => {
				cold_path();
				return Err(ErrPack::new(
					OperatorError::NoDifferentiationRule,
					format!("No differentiation rule for `{}` layers", layer.name()),
				)
				.into());
			},
			// empty scope, nothing to differentiate
			Layer::LogPartition { .. } | Layer::Evidence { .. } => {},
			Layer::Dense { num_units, num_input_units, weight } => {
				// smoothness: the child's scope equals the layer's scope
				for position in 0..scope.len() {
					let deriv_child = map[children[0]].derivs[position];
					let deriv =
						Layer::dense(*num_units, *num_input_units, weight.clone())?;
					derivs.push(builder.add_layer(deriv, &[deriv_child])?);
				}
			},
			Layer::Mixing { num_units, arity, weight } => {
				for position in 0..scope.len() {
					let deriv_children: SmallVec<[LayerId; 4]> =
						children.iter().map(|&c| map[c].derivs[position]).collect();
					let deriv = Layer::mixing(*num_units, *arity, weight.clone())?;
					derivs.push(builder.add_layer(deriv, &deriv_children)?);
				}
			},
			Layer::Hadamard { num_units, arity } => {
				for var in scope.iter() {
					let deriv_children = product_rule_children(sc, &map, children, var)?;
					let deriv = Layer::hadamard(*num_units, *arity)?;
					derivs.push(builder.add_layer(deriv, &deriv_children)?);
				}
			},
			Layer::Kronecker { lhs_units, rhs_units } => {
				for var in scope.iter() {
					let deriv_children = product_rule_children(sc, &map, children, var)?;
					let deriv = Layer::kronecker(*lhs_units, *rhs_units);
					derivs.push(builder.add_layer(deriv, &deriv_children)?);
				}
			},
		}

		let copy_children: SmallVec<[LayerId; 4]> =
			children.iter().map(|&c| map[c].copy).collect();
		let copy = builder.add_layer(layer.clone(), &copy_children)?;
		map.push(DiffEntry { derivs, copy });
	}

	let operation = CircuitOperation {
		operator: CircuitOperator::Differentiation,
		operands: smallvec![Rc::clone(sc)],
	};
	Ok(Rc::new(builder.build(Some(operation))?))
}

//--------------------------------------------------------------------------------------------------

//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Symbolic circuits.
//!
//! A [`Circuit`] is an arena of layers plus the DAG structure over them.
//! Construction goes through [`CircuitBuilder`], which keeps the arena in
//! topological order: a layer may only have inputs with smaller ids. All
//! structural queries rely on that order.

use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use smallvec::SmallVec;
use thin_vec::ThinVec;

use crate::region_graph::{RegionGraph, RegionId};
use crate::scope::Scope;
use crate::symbolic::layers::{Layer, LayerError};
use crate::symbolic::parameters::{Initializer, Param};
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;
use crate::{ErrExtra, ErrPack, define_index_type};

//--------------------------------------------------------------------------------------------------

define_index_type!(LayerId);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CircuitBuildError {
	LayerIndexOutOfBounds,
	InputLayerWithInputs,
	ArityMismatch,
	UnitCountMismatch,
	ChannelCountMismatch,
	EmptyCircuit,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitOperator {
	Evidence,
	Integration,
	Differentiation,
	Multiplication,
}

/// Provenance of a circuit produced by an operator. Keeping the operands
/// alive keeps the shared parameter nodes alive as well.
#[derive(Debug)]
pub struct CircuitOperation {
	pub operator: CircuitOperator,
	pub operands: SmallVec<[Rc<Circuit>; 2]>,
}

#[derive(Debug, Clone, Copy)]
struct StructuralProps {
	smooth: bool,
	decomposable: bool,
}

#[derive(Debug)]
pub struct Circuit {
	layers: IndexVec<LayerId, Layer>,
	inputs: IndexVec<LayerId, ThinVec<LayerId>>,
	scopes: IndexVec<LayerId, Scope>,
	outputs: Vec<LayerId>,
	num_channels: usize,
	operation: Option<CircuitOperation>,
	props: OnceCell<StructuralProps>,
}

impl Circuit {
	pub fn num_layers(&self) -> usize {
		self.layers.len()
	}

	/// Layer ids in topological order (children before parents).
	pub fn layer_ids(&self) -> impl DoubleEndedIterator<Item = LayerId> + use<> {
		self.layers.indexes()
	}

	#[allow(clippy::indexing_slicing)]
	pub fn layer_inputs(&self, id: LayerId) -> &[LayerId] {
		&self.inputs[id]
	}

	#[allow(clippy::indexing_slicing)]
	pub fn layer_scope(&self, id: LayerId) -> &Scope {
		&self.scopes[id]
	}

	/// Layers no other layer consumes, in topological order.
	pub fn outputs(&self) -> &[LayerId] {
		&self.outputs
	}

	pub fn num_channels(&self) -> usize {
		self.num_channels
	}

	pub fn operation(&self) -> Option<&CircuitOperation> {
		self.operation.as_ref()
	}

	/// Union of the scopes of all output layers.
	pub fn scope(&self) -> Scope {
		let mut scope = Scope::empty();
		for &id in &self.outputs {
			scope.union_with(self.layer_scope(id));
		}
		scope
	}

	pub fn num_variables(&self) -> usize {
		self.scope().max_var().map_or(0, |v| v + 1)
	}

	#[allow(clippy::indexing_slicing)]
	pub fn input_layers(&self) -> impl Iterator<Item = LayerId> + '_ {
		self.layer_ids().filter(|&id| self.layers[id].is_input())
	}

	#[allow(clippy::indexing_slicing)]
	pub fn sum_layers(&self) -> impl Iterator<Item = LayerId> + '_ {
		self.layer_ids().filter(|&id| self.layers[id].is_sum())
	}

	#[allow(clippy::indexing_slicing)]
	pub fn product_layers(&self) -> impl Iterator<Item = LayerId> + '_ {
		self.layer_ids().filter(|&id| self.layers[id].is_product())
	}

	#[allow(clippy::indexing_slicing)]
	pub fn inner_layers(&self) -> impl Iterator<Item = LayerId> + '_ {
		self.layer_ids().filter(|&id| !self.layers[id].is_input())
	}

	//----------------------------------------------------------------------------------------------
	// Structural properties

	fn props(&self) -> StructuralProps {
		*self.props.get_or_init(|| {
			let smooth = self.sum_layers().all(|id| {
				let scope = self.layer_scope(id);
				self.layer_inputs(id).iter().all(|&c| self.layer_scope(c) == scope)
			});
			let decomposable = self.product_layers().all(|id| {
				let children = self.layer_inputs(id);
				children.iter().enumerate().all(|(i, &lhs)| {
					children.iter().skip(i + 1).all(|&rhs| {
						self.layer_scope(lhs).is_disjoint(self.layer_scope(rhs))
					})
				})
			});
			StructuralProps { smooth, decomposable }
		})
	}

	/// Every sum layer's children all have the sum layer's scope.
	pub fn is_smooth(&self) -> bool {
		self.props().smooth
	}

	/// Every product layer's children have pairwise disjoint scopes.
	pub fn is_decomposable(&self) -> bool {
		self.props().decomposable
	}

	/// The ways product layers split scopes, restricted to `restrict`.
	/// Maps a restricted scope with at least 2 variables to the set of
	/// restricted partitions used for it.
	fn scope_partitions(&self, restrict: &Scope) -> HashMap<Scope, HashSet<Vec<Scope>>> {
		let mut map: HashMap<Scope, HashSet<Vec<Scope>>> = HashMap::new();
		for id in self.product_layers() {
			let key = self.layer_scope(id).intersection(restrict);
			if key.len() < 2 {
				continue;
			}
			let mut parts: Vec<Scope> = self
				.layer_inputs(id)
				.iter()
				.map(|&c| self.layer_scope(c).intersection(restrict))
				.filter(|s| !s.is_empty())
				.collect();
			if parts.len() < 2 {
				continue;
			}
			parts.sort();
			map.entry(key).or_default().insert(parts);
		}
		map
	}

	/// Smooth, decomposable, and every scope is decomposed in one way only.
	pub fn is_structured_decomposable(&self) -> bool {
		if !self.is_smooth() || !self.is_decomposable() {
			return false;
		}
		let scope = self.scope();
		self.scope_partitions(&scope).values().all(|ways| ways.len() == 1)
	}

	/// Smooth, decomposable, and products only combine singleton scopes.
	/// Such a circuit is compatible with any other circuit over its scope.
	pub fn is_omni_compatible(&self) -> bool {
		if !self.is_smooth() || !self.is_decomposable() {
			return false;
		}
		self.product_layers().all(|id| {
			self.layer_inputs(id).iter().all(|&c| self.layer_scope(c).len() <= 1)
		})
	}

	/// Checks whether products can be aligned between the two circuits:
	/// wherever both decompose the same (restricted) scope, one partition
	/// must refine the other. `scope` defaults to the shared scope.
	pub fn is_compatible(&self, other: &Self, scope: Option<&Scope>) -> bool {
		fn refines(finer: &[Scope], coarser: &[Scope]) -> bool {
			finer.iter().all(|part| coarser.iter().any(|sup| part.is_subset_of(sup)))
		}

		if !self.is_smooth()
			|| !self.is_decomposable()
			|| !other.is_smooth()
			|| !other.is_decomposable()
		{
			return false;
		}
		let shared = scope.map_or_else(
			|| self.scope().intersection(&other.scope()),
			std::clone::Clone::clone,
		);
		let lhs = self.scope_partitions(&shared);
		let rhs = other.scope_partitions(&shared);
		lhs.iter().all(|(key, ways)| {
			rhs.get(key).is_none_or(|other_ways| {
				ways.iter().all(|a| {
					other_ways.iter().all(|b| refines(a, b) || refines(b, a))
				})
			})
		})
	}

	//----------------------------------------------------------------------------------------------

	pub fn print_graphviz(&self) -> String {
		let mut s = String::new();
		let _ = self.__print_graphviz(&mut s);
		s
	}

	#[allow(clippy::indexing_slicing)]
	pub fn __print_graphviz<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
		writeln!(w, "digraph G {{")?;
		writeln!(w, "\trankdir=LR;")?;
		writeln!(w, "\tnewrank=true;")?;

		for id in self.layer_ids() {
			let layer = &self.layers[id];
			writeln!(
				w,
				"\tlayer_{} [label=\"{} [{}] {}\"];",
				id.raw,
				layer.name(),
				layer.num_units(),
				self.scopes[id],
			)?;
			for &child in &self.inputs[id] {
				writeln!(w, "\tlayer_{} -> layer_{};", child.raw, id.raw)?;
			}
		}

		writeln!(w, "}}")?;
		Ok(())
	}
}

#[allow(clippy::indexing_slicing)]
impl std::ops::Index<LayerId> for Circuit {
	type Output = Layer;

	fn index(&self, index: LayerId) -> &Layer {
		&self.layers[index]
	}
}

//--------------------------------------------------------------------------------------------------

pub struct CircuitBuilder {
	layers: IndexVec<LayerId, Layer>,
	inputs: IndexVec<LayerId, ThinVec<LayerId>>,
	scopes: IndexVec<LayerId, Scope>,
	consumers: IndexVec<LayerId, usize>,
}

impl Default for CircuitBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl CircuitBuilder {
	pub fn new() -> Self {
		Self {
			layers: IndexVec::new(),
			inputs: IndexVec::new(),
			scopes: IndexVec::new(),
			consumers: IndexVec::new(),
		}
	}

	pub fn num_layers(&self) -> usize {
		self.layers.len()
	}

	pub fn layer(&self, id: LayerId) -> Option<&Layer> {
		self.layers.get(id)
	}

	/// Appends a layer. Its inputs must already be in the arena, so the
	/// arena stays topologically ordered.
	pub fn add_layer(
		&mut self,
		layer: Layer,
		inputs: &[LayerId],
	) -> Result<LayerId, ErrPack<CircuitBuildError>> {
		let id = self.layers.next_index();
		for &child in inputs {
			if child >= id {
				cold_path();
				return Err(ErrPack {
					code: CircuitBuildError::LayerIndexOutOfBounds,
					extra: Some(Box::new(ErrExtra {
						message: format!(
							"Layer input {} does not exist yet (adding layer {})",
							child.raw, id.raw
						)
						.into(),
						nested: None,
					})),
				});
			}
		}
		if layer.is_input() {
			if !inputs.is_empty() {
				cold_path();
				return Err(ErrPack {
					code: CircuitBuildError::InputLayerWithInputs,
					extra: Some(Box::new(ErrExtra {
						message: format!(
							"`{}` is an input layer and takes no inputs",
							layer.name()
						)
						.into(),
						nested: None,
					})),
				});
			}
		} else if inputs.len() != layer.arity() {
			cold_path();
			return Err(ErrPack {
				code: CircuitBuildError::ArityMismatch,
				extra: Some(Box::new(ErrExtra {
					message: format!(
						"`{}` expects {} inputs, got {}",
						layer.name(),
						layer.arity(),
						inputs.len()
					)
					.into(),
					nested: None,
				})),
			});
		}
		#[allow(clippy::indexing_slicing)]
		for (position, &child) in inputs.iter().enumerate() {
			let expected = layer.expected_input_units(position);
			let got = self.layers[child].num_units();
			if got != expected {
				cold_path();
				return Err(ErrPack {
					code: CircuitBuildError::UnitCountMismatch,
					extra: Some(Box::new(ErrExtra {
						message: format!(
							"`{}` expects input {position} to have {expected} units, got {got}",
							layer.name()
						)
						.into(),
						nested: None,
					})),
				});
			}
		}

		let scope = layer.intrinsic_scope().unwrap_or_else(|| {
			let mut scope = Scope::empty();
			#[allow(clippy::indexing_slicing)]
			for &child in inputs {
				scope.union_with(&self.scopes[child]);
			}
			scope
		});

		self.layers.push(layer);
		self.inputs.push(inputs.iter().copied().collect());
		self.scopes.push(scope);
		self.consumers.push(0);
		#[allow(clippy::indexing_slicing)]
		for &child in inputs {
			self.consumers[child] += 1;
		}
		Ok(id)
	}

	pub fn build(
		self,
		operation: Option<CircuitOperation>,
	) -> Result<Circuit, ErrPack<CircuitBuildError>> {
		if self.layers.is_empty() {
			cold_path();
			return Err(ErrPack {
				code: CircuitBuildError::EmptyCircuit,
				extra: Some(Box::new(ErrExtra {
					message: "A circuit needs at least one layer".into(),
					nested: None,
				})),
			});
		}

		let mut num_channels = None;
		for id in self.layers.indexes() {
			#[allow(clippy::indexing_slicing)]
			let Some(channels) = self.layers[id].num_channels() else {
				continue;
			};
			match num_channels {
				None => num_channels = Some(channels),
				Some(expected) if expected != channels => {
					cold_path();
					return Err(ErrPack {
						code: CircuitBuildError::ChannelCountMismatch,
						extra: Some(Box::new(ErrExtra {
							message: format!(
								"Input layers disagree on channels: {expected} vs {channels}"
							)
							.into(),
							nested: None,
						})),
					});
				},
				Some(_) => {},
			}
		}

		#[allow(clippy::indexing_slicing)]
		let outputs =
			self.layers.indexes().filter(|&id| self.consumers[id] == 0).collect();
		Ok(Circuit {
			layers: self.layers,
			inputs: self.inputs,
			scopes: self.scopes,
			outputs,
			num_channels: num_channels.unwrap_or(1),
			operation,
			props: OnceCell::new(),
		})
	}
}

//--------------------------------------------------------------------------------------------------

/// Unit counts used when instantiating a circuit from a region graph.
#[derive(Debug, Copy, Clone)]
pub struct RegionGraphSettings {
	pub num_channels: usize,
	pub num_input_units: usize,
	pub num_sum_units: usize,
	pub num_classes: usize,
}

impl Default for RegionGraphSettings {
	fn default() -> Self {
		Self { num_channels: 1, num_input_units: 1, num_sum_units: 1, num_classes: 1 }
	}
}

/// Constructors for the layers a region graph instantiation needs.
///
/// `input` gets `(scope, num_units, num_channels)`, `sum` gets
/// `(num_units, num_input_units)`, `product` gets the unit counts of its
/// children, `mixing` gets `(num_units, arity)`.
pub struct LayerFactories {
	pub input: Box<dyn Fn(&Scope, usize, usize) -> crate::Result<Layer>>,
	pub sum: Box<dyn Fn(usize, usize) -> crate::Result<Layer>>,
	pub product: Box<dyn Fn(&[usize]) -> crate::Result<Layer>>,
	pub mixing: Box<dyn Fn(usize, usize) -> crate::Result<Layer>>,
}

fn normal_init() -> Initializer {
	Initializer::Normal { mean: 0.0, stddev: 1.0 }
}

fn softmax_dense(num_units: usize, num_input_units: usize) -> crate::Result<Layer> {
	let weight = Param::leaf(&[num_units, num_input_units], normal_init(), true)?;
	Ok(Layer::dense(num_units, num_input_units, weight.softmax(1)?)?)
}

fn softmax_mixing(num_units: usize, arity: usize) -> crate::Result<Layer> {
	let weight = Param::leaf(&[num_units, arity], normal_init(), true)?;
	Ok(Layer::mixing(num_units, arity, weight.softmax(1)?)?)
}

fn softplus_dense(num_units: usize, num_input_units: usize) -> crate::Result<Layer> {
	let weight = Param::leaf(&[num_units, num_input_units], normal_init(), true)?;
	Ok(Layer::dense(num_units, num_input_units, weight.softplus())?)
}

fn softplus_mixing(num_units: usize, arity: usize) -> crate::Result<Layer> {
	let weight = Param::leaf(&[num_units, arity], normal_init(), true)?;
	Ok(Layer::mixing(num_units, arity, weight.softplus())?)
}

fn hadamard_or_kronecker(child_units: &[usize]) -> crate::Result<Layer> {
	if let Some((&first, rest)) = child_units.split_first()
		&& rest.iter().all(|&u| u == first)
	{
		return Ok(Layer::hadamard(first, child_units.len())?);
	}
	if let &[lhs, rhs] = child_units {
		return Ok(Layer::kronecker(lhs, rhs));
	}
	cold_path();
	Err(ErrPack::new(
		LayerError::WrongArity,
		format!("No product layer over children with units {child_units:?}"),
	)
	.into())
}

impl LayerFactories {
	/// Categorical tables normalized by a softmax, softmax sum weights.
	/// Circuits built from this are monotonic and normalized.
	pub fn monotonic_categorical(num_categories: usize) -> Self {
		Self {
			input: Box::new(move |scope, num_units, num_channels| {
				let table = Param::leaf(
					&[num_units, num_channels, num_categories],
					normal_init(),
					true,
				)?;
				Ok(Layer::categorical(
					scope.clone(),
					num_units,
					num_channels,
					num_categories,
					Some(table.softmax(2)?),
					None,
				)?)
			}),
			sum: Box::new(softmax_dense),
			product: Box::new(hadamard_or_kronecker),
			mixing: Box::new(softmax_mixing),
		}
	}

	/// Normalized Gaussians; the stddev is kept in `(1e-5, 10)` by a scaled
	/// sigmoid. Softmax sum weights.
	pub fn monotonic_gaussian() -> Self {
		Self {
			input: Box::new(|scope, num_units, num_channels| {
				let mean = Param::leaf(&[num_units, num_channels], normal_init(), true)?;
				let stddev = Param::leaf(&[num_units, num_channels], normal_init(), true)?;
				Ok(Layer::gaussian(
					scope.clone(),
					num_units,
					num_channels,
					mean,
					stddev.scaled_sigmoid(1e-5, 10.0),
					None,
				)?)
			}),
			sum: Box::new(softmax_dense),
			product: Box::new(hadamard_or_kronecker),
			mixing: Box::new(softmax_mixing),
		}
	}

	/// Polynomial inputs of the given degree, softplus-positive sum weights.
	/// Only evaluable in the linear semiring.
	pub fn polynomial(degree: usize) -> Self {
		Self {
			input: Box::new(move |scope, num_units, num_channels| {
				let coeff = Param::leaf(&[num_units, degree + 1], normal_init(), true)?;
				Ok(Layer::polynomial(scope.clone(), num_units, num_channels, degree, coeff)?)
			}),
			sum: Box::new(softplus_dense),
			product: Box::new(hadamard_or_kronecker),
			mixing: Box::new(softplus_mixing),
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// Instantiates a circuit over a region graph: an input layer plus a sum
/// head per leaf region, a product layer per partition, and a sum (or, for
/// multiple partitionings, mixing) layer per inner region. Output regions
/// get `num_classes` units, all other regions `num_sum_units`.
pub fn from_region_graph(
	rg: &RegionGraph,
	settings: &RegionGraphSettings,
	factories: &LayerFactories,
) -> crate::Result<Rc<Circuit>> {
	let mut builder = CircuitBuilder::new();
	let mut region_layer: IndexVec<RegionId, LayerId> = IndexVec::new();
	let mut region_units: IndexVec<RegionId, usize> = IndexVec::new();

	#[allow(clippy::indexing_slicing)]
	for r in rg.region_ids() {
		let node = &rg[r];
		let units =
			if rg.is_root(r) { settings.num_classes } else { settings.num_sum_units };

		let layer_id = if node.is_leaf() {
			let input =
				(factories.input)(node.scope(), settings.num_input_units, settings.num_channels)?;
			let input_id = builder.add_layer(input, &[])?;
			let sum = (factories.sum)(units, settings.num_input_units)?;
			builder.add_layer(sum, &[input_id])?
		} else {
			let mut products: SmallVec<[(LayerId, usize); 2]> = SmallVec::new();
			for &p in node.inputs() {
				let children: SmallVec<[LayerId; 4]> =
					rg[p].inputs().iter().map(|&part| region_layer[part]).collect();
				let child_units: SmallVec<[usize; 4]> =
					rg[p].inputs().iter().map(|&part| region_units[part]).collect();
				let product = (factories.product)(&child_units)?;
				let product_units = product.num_units();
				let product_id = builder.add_layer(product, &children)?;
				products.push((product_id, product_units));
			}
			if let &[(product_id, product_units)] = products.as_slice() {
				let sum = (factories.sum)(units, product_units)?;
				builder.add_layer(sum, &[product_id])?
			} else {
				let mixing = (factories.mixing)(units, products.len())?;
				let children: SmallVec<[LayerId; 2]> =
					products.iter().map(|&(id, _)| id).collect();
				builder.add_layer(mixing, &children)?
			}
		};
		region_layer.push(layer_id);
		region_units.push(units);
	}

	Ok(Rc::new(builder.build(None)?))
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::region_graph::algorithms::{fully_factorized, linear_tree, quad_tree};

	fn leaf(shape: &[usize]) -> Param {
		Param::leaf(shape, normal_init(), true).unwrap()
	}

	fn categorical(var: usize, num_units: usize) -> Layer {
		let table = leaf(&[num_units, 1, 3]);
		Layer::categorical(Scope::singleton(var), num_units, 1, 3, Some(table), None).unwrap()
	}

	#[test]
	fn test_builder_checks() {
		let mut builder = CircuitBuilder::new();
		let a = builder.add_layer(categorical(0, 2), &[]).unwrap();

		let err = builder.add_layer(categorical(1, 2), &[a]).unwrap_err();
		assert_eq!(err.code, CircuitBuildError::InputLayerWithInputs);

		let err = builder
			.add_layer(Layer::hadamard(2, 2).unwrap(), &[a])
			.unwrap_err();
		assert_eq!(err.code, CircuitBuildError::ArityMismatch);

		let err = builder
			.add_layer(Layer::hadamard(2, 2).unwrap(), &[a, LayerId::new(7)])
			.unwrap_err();
		assert_eq!(err.code, CircuitBuildError::LayerIndexOutOfBounds);

		let b = builder.add_layer(categorical(1, 3), &[]).unwrap();
		let err = builder
			.add_layer(Layer::hadamard(2, 2).unwrap(), &[a, b])
			.unwrap_err();
		assert_eq!(err.code, CircuitBuildError::UnitCountMismatch);

		let err = CircuitBuilder::new().build(None).unwrap_err();
		assert_eq!(err.code, CircuitBuildError::EmptyCircuit);
	}

	#[test]
	fn test_channel_agreement() {
		let mut builder = CircuitBuilder::new();
		let t0 = leaf(&[2, 1, 3]);
		builder
			.add_layer(
				Layer::categorical(Scope::singleton(0), 2, 1, 3, Some(t0), None).unwrap(),
				&[],
			)
			.unwrap();
		let t1 = leaf(&[2, 2, 3]);
		builder
			.add_layer(
				Layer::categorical(Scope::singleton(1), 2, 2, 3, Some(t1), None).unwrap(),
				&[],
			)
			.unwrap();
		let err = builder.build(None).unwrap_err();
		assert_eq!(err.code, CircuitBuildError::ChannelCountMismatch);
	}

	#[test]
	fn test_from_fully_factorized() {
		let rg = fully_factorized(3).unwrap();
		let settings = RegionGraphSettings {
			num_input_units: 2,
			num_sum_units: 2,
			..Default::default()
		};
		let sc =
			from_region_graph(&rg, &settings, &LayerFactories::monotonic_categorical(4))
				.unwrap();

		// per leaf region: input + dense; root region: product + dense
		assert_eq!(sc.num_layers(), 8);
		assert_eq!(sc.input_layers().count(), 3);
		assert_eq!(sc.sum_layers().count(), 4);
		assert_eq!(sc.product_layers().count(), 1);
		assert_eq!(sc.outputs().len(), 1);
		assert_eq!(sc.num_variables(), 3);
		assert_eq!(sc.num_channels(), 1);

		assert!(sc.is_smooth());
		assert!(sc.is_decomposable());
		assert!(sc.is_structured_decomposable());
		assert!(sc.is_omni_compatible());

		let out = sc.outputs()[0];
		assert_eq!(sc[out].num_units(), 1);
	}

	#[test]
	fn test_from_quad_tree_mixing() {
		let rg = quad_tree(2, 2, false).unwrap();
		let settings = RegionGraphSettings {
			num_input_units: 2,
			num_sum_units: 3,
			num_classes: 3,
			..Default::default()
		};
		let sc =
			from_region_graph(&rg, &settings, &LayerFactories::monotonic_categorical(2))
				.unwrap();

		// 4 leaf regions: input + dense each; 4 half regions: product + dense
		// each; the root: 2 products + 1 mixing
		assert_eq!(sc.num_layers(), 8 + 8 + 3);
		assert_eq!(sc.input_layers().count(), 4);
		assert_eq!(sc.sum_layers().count(), 9);
		assert_eq!(sc.product_layers().count(), 6);

		assert!(sc.is_smooth());
		assert!(sc.is_decomposable());
		// the root is split both ways, so no single decomposition exists
		assert!(!sc.is_structured_decomposable());
		assert!(!sc.is_omni_compatible());
		// the two split directions cannot be aligned, not even with itself
		assert!(!sc.is_compatible(&sc, None));
	}

	#[test]
	fn test_compatibility() {
		let settings = RegionGraphSettings::default();
		let factories = LayerFactories::monotonic_categorical(2);

		let a = from_region_graph(&linear_tree(3).unwrap(), &settings, &factories).unwrap();
		let b = from_region_graph(&linear_tree(3).unwrap(), &settings, &factories).unwrap();
		assert!(a.is_compatible(&b, None));
		assert!(a.is_structured_decomposable());

		// {0,1},{2} vs {0},{1,2} decompositions of {0,1,2}
		let mut rg = crate::region_graph::RegionGraph::new();
		let v0 = rg.add_region(Scope::singleton(0)).unwrap();
		let v1 = rg.add_region(Scope::singleton(1)).unwrap();
		let v2 = rg.add_region(Scope::singleton(2)).unwrap();
		let v12 = rg.add_region([1, 2].into_iter().collect()).unwrap();
		rg.add_partition(v12, &[v1, v2]).unwrap();
		let root = rg.add_region([0, 1, 2].into_iter().collect()).unwrap();
		rg.add_partition(root, &[v0, v12]).unwrap();
		let c = from_region_graph(&rg, &settings, &factories).unwrap();
		assert!(!a.is_compatible(&c, None));

		// a fully factorized circuit is compatible with anything
		let ff = from_region_graph(&fully_factorized(3).unwrap(), &settings, &factories)
			.unwrap();
		assert!(ff.is_omni_compatible());
		assert!(ff.is_compatible(&a, None));
		assert!(ff.is_compatible(&c, None));
	}

	#[test]
	fn test_non_smooth_detected() {
		let mut builder = CircuitBuilder::new();
		let a = builder.add_layer(categorical(0, 2), &[]).unwrap();
		let b = builder.add_layer(categorical(1, 2), &[]).unwrap();
		let mixing = Layer::mixing(2, 2, leaf(&[2, 2]).softmax(1).unwrap()).unwrap();
		builder.add_layer(mixing, &[a, b]).unwrap();
		let sc = builder.build(None).unwrap();
		assert!(!sc.is_smooth());
		assert!(sc.is_decomposable());
		assert!(!sc.is_structured_decomposable());
	}

	#[test]
	fn test_non_decomposable_detected() {
		let mut builder = CircuitBuilder::new();
		let a = builder.add_layer(categorical(0, 2), &[]).unwrap();
		let b = builder.add_layer(categorical(0, 2), &[]).unwrap();
		builder.add_layer(Layer::hadamard(2, 2).unwrap(), &[a, b]).unwrap();
		let sc = builder.build(None).unwrap();
		assert!(sc.is_smooth());
		assert!(!sc.is_decomposable());
	}

	#[test]
	fn test_graphviz_dump() {
		let rg = fully_factorized(2).unwrap();
		let sc = from_region_graph(
			&rg,
			&RegionGraphSettings::default(),
			&LayerFactories::monotonic_categorical(2),
		)
		.unwrap();
		let dot = sc.print_graphviz();
		assert!(dot.starts_with("digraph G {"));
		assert!(dot.contains("categorical"));
		assert!(dot.contains("->"));
	}
}

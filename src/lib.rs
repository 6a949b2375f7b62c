//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

#![allow(non_snake_case)]
// clippy
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::cast_lossless)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::indexing_slicing)]
#![warn(clippy::panic_in_result_fn)]
#![warn(clippy::panic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::elidable_lifetime_names)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::comparison_chain)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::inconsistent_digit_grouping)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::let_and_return)]
#![allow(clippy::inline_always)]
#![allow(clippy::needless_lifetimes)]
#![allow(unused_parens)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::range_plus_one)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::if_not_else)]
#![allow(clippy::useless_format)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::useless_let_if_seq)]

use std::borrow::Cow;
use std::convert::Infallible;

pub mod backend;
pub mod io;
pub mod opt;
pub mod region_graph;
pub mod rng;
pub mod scope;
pub mod symbolic;
pub mod util;

#[cfg(test)]
mod tests;

#[derive(Debug)]
pub struct ErrExtra {
	pub message: Cow<'static, str>,
	pub nested: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ErrPack<Code: Copy + std::fmt::Debug> {
	pub code: Code,
	pub extra: Option<Box<ErrExtra>>,
}

impl<Code: Copy + std::fmt::Debug> ErrPack<Code> {
	#[cold]
	#[inline(never)]
	pub fn new<M: Into<Cow<'static, str>>>(code: Code, message: M) -> Self {
		Self {
			code,
			extra: Some(Box::new(ErrExtra { message: message.into(), nested: None })),
		}
	}
}

#[cold]
#[inline(never)]
#[allow(clippy::panic)]
fn panic_infallible_to_err_conversion<Code: Copy + std::fmt::Debug>() -> ErrPack<Code> {
	panic!("Infallible should never be converted to ErrPack");
}

impl<Code: Copy + std::fmt::Debug> From<Infallible> for ErrPack<Code> {
	fn from(_: Infallible) -> Self {
		panic_infallible_to_err_conversion()
	}
}

impl<Code: Copy + std::fmt::Debug> std::error::Error for ErrPack<Code> {
}

impl<Code: Copy + std::fmt::Debug> std::fmt::Display for ErrPack<Code> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let code = self.code;
		write!(f, "(ErrPack: code={code:?}")?;
		if let Some(ref extra) = self.extra {
			let msg = extra.message.as_ref();
			if !msg.is_empty() {
				write!(f, ", message={msg}")?;
			}
			if let Some(nested) = &extra.nested {
				write!(f, ", nested={nested:?}")?;
			}
		}
		write!(f, ")")
	}
}

//--------------------------------------------------------------------------------------------------

/// Crate-wide error code. Every module error converts into it, so public
/// operations can be chained with `?` across module boundaries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CircuitOpError {
	// region graphs
	RegionIndexOutOfBounds,
	RegionScopeEmpty,
	PartitionTooSmall,
	PartitionNotDisjoint,
	PartitionScopeMismatch,
	PartitionOrderViolation,
	// symbolic parameters
	ParamShapeEmpty,
	ParamAxisOutOfBounds,
	ParamShapeMismatch,
	// symbolic layers
	LayerNotUnivariate,
	TooFewCategories,
	ProbsXorLogits,
	WrongParamShape,
	WrongArity,
	NotAnInputLayer,
	MultiChannelPolynomial,
	// circuit building
	LayerIndexOutOfBounds,
	InputLayerWithInputs,
	ArityMismatch,
	UnitCountMismatch,
	ChannelCountMismatch,
	EmptyCircuit,
	// circuit operators
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
	// compilation and evaluation
	PolynomialInLogSemiring,
	NonUniformOutputs,
	InvalidInputShape,
	CategoryOutOfBounds,
	BackwardUnsupported,
	GradShapeMismatch,
	// parameter io
	IoError,
	MalformedFile,
	MissingTensor,
	DTypeMismatch,
	TensorShapeMismatch,
}

pub type Result<T, E = ErrPack<CircuitOpError>> = std::result::Result<T, E>;

impl From<region_graph::RegionGraphError> for CircuitOpError {
	#[cold]
	#[inline(never)]
	fn from(err: region_graph::RegionGraphError) -> Self {
		use region_graph::RegionGraphError as E;
		match err {
			E::RegionIndexOutOfBounds => Self::RegionIndexOutOfBounds,
			E::EmptyScope => Self::RegionScopeEmpty,
			E::TooFewParts => Self::PartitionTooSmall,
			E::NotDisjoint => Self::PartitionNotDisjoint,
			E::ScopeMismatch => Self::PartitionScopeMismatch,
			E::OrderViolation => Self::PartitionOrderViolation,
		}
	}
}

impl From<symbolic::parameters::ParamError> for CircuitOpError {
	#[cold]
	#[inline(never)]
	fn from(err: symbolic::parameters::ParamError) -> Self {
		use symbolic::parameters::ParamError as E;
		match err {
			E::EmptyShape => Self::ParamShapeEmpty,
			E::AxisOutOfBounds => Self::ParamAxisOutOfBounds,
			E::ShapeMismatch => Self::ParamShapeMismatch,
		}
	}
}

impl From<symbolic::layers::LayerError> for CircuitOpError {
	#[cold]
	#[inline(never)]
	fn from(err: symbolic::layers::LayerError) -> Self {
		use symbolic::layers::LayerError as E;
		match err {
			E::NotUnivariate => Self::LayerNotUnivariate,
			E::TooFewCategories => Self::TooFewCategories,
			E::ProbsXorLogits => Self::ProbsXorLogits,
			E::WrongParamShape => Self::WrongParamShape,
			E::WrongArity => Self::WrongArity,
			E::NotAnInputLayer => Self::NotAnInputLayer,
			E::MultiChannelPolynomial => Self::MultiChannelPolynomial,
		}
	}
}

impl From<symbolic::circuit::CircuitBuildError> for CircuitOpError {
	#[cold]
	#[inline(never)]
	fn from(err: symbolic::circuit::CircuitBuildError) -> Self {
		use symbolic::circuit::CircuitBuildError as E;
		match err {
			E::LayerIndexOutOfBounds => Self::LayerIndexOutOfBounds,
			E::InputLayerWithInputs => Self::InputLayerWithInputs,
			E::ArityMismatch => Self::ArityMismatch,
			E::UnitCountMismatch => Self::UnitCountMismatch,
			E::ChannelCountMismatch => Self::ChannelCountMismatch,
			E::EmptyCircuit => Self::EmptyCircuit,
		}
	}
}

impl From<symbolic::functional::OperatorError> for CircuitOpError {
	#[cold]
	#[inline(never)]
	fn from(err: symbolic::functional::OperatorError) -> Self {
		use symbolic::functional::OperatorError as E;
		match err {
			E::NotSmooth => Self::NotSmooth,
			E::NotDecomposable => Self::NotDecomposable,
			E::NotCompatible => Self::NotCompatible,
			E::ScopeNotInCircuit => Self::ScopeNotInCircuit,
			E::ScopeMismatch => Self::ScopeMismatch,
			E::MultipleOutputs => Self::MultipleOutputs,
			E::MisalignedProducts => Self::MisalignedProducts,
			E::ObservationOutOfScope => Self::ObservationOutOfScope,
			E::NoIntegrationRule => Self::NoIntegrationRule,
			E::NoProductRule => Self::NoProductRule,
			E::NoDifferentiationRule => Self::NoDifferentiationRule,
		}
	}
}

impl From<backend::CompileError> for CircuitOpError {
	#[cold]
	#[inline(never)]
	fn from(err: backend::CompileError) -> Self {
		use backend::CompileError as E;
		match err {
			E::PolynomialInLogSemiring => Self::PolynomialInLogSemiring,
			E::NonUniformOutputs => Self::NonUniformOutputs,
		}
	}
}

impl From<backend::EvalError> for CircuitOpError {
	#[cold]
	#[inline(never)]
	fn from(err: backend::EvalError) -> Self {
		use backend::EvalError as E;
		match err {
			E::InvalidInputShape => Self::InvalidInputShape,
			E::CategoryOutOfBounds => Self::CategoryOutOfBounds,
			E::BackwardUnsupported => Self::BackwardUnsupported,
		}
	}
}

impl From<opt::GradShapeError> for CircuitOpError {
	#[cold]
	#[inline(never)]
	fn from(_: opt::GradShapeError) -> Self {
		Self::GradShapeMismatch
	}
}

impl From<io::ParamIoError> for CircuitOpError {
	#[cold]
	#[inline(never)]
	fn from(err: io::ParamIoError) -> Self {
		use io::ParamIoError as E;
		match err {
			E::Io => Self::IoError,
			E::Malformed => Self::MalformedFile,
			E::MissingTensor => Self::MissingTensor,
			E::DTypeMismatch => Self::DTypeMismatch,
			E::ShapeMismatch => Self::TensorShapeMismatch,
		}
	}
}

macro_rules! errpack_conversion {
	($err:ty) => {
		impl From<$err> for ErrPack<CircuitOpError> {
			#[cold]
			#[inline(never)]
			fn from(err: $err) -> Self {
				Self { code: err.into(), extra: None }
			}
		}

		impl From<ErrPack<$err>> for ErrPack<CircuitOpError> {
			#[cold]
			#[inline(never)]
			fn from(err: ErrPack<$err>) -> Self {
				Self { code: err.code.into(), extra: err.extra }
			}
		}
	};
}

errpack_conversion!(region_graph::RegionGraphError);
errpack_conversion!(symbolic::parameters::ParamError);
errpack_conversion!(symbolic::layers::LayerError);
errpack_conversion!(symbolic::circuit::CircuitBuildError);
errpack_conversion!(symbolic::functional::OperatorError);
errpack_conversion!(backend::CompileError);
errpack_conversion!(backend::EvalError);
errpack_conversion!(opt::GradShapeError);
errpack_conversion!(io::ParamIoError);

//--------------------------------------------------------------------------------------------------

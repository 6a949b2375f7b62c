// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.

pub mod circuit;
pub mod compiler;
pub mod layers;
pub mod parameters;
pub mod semiring;

pub use circuit::{TensorCircuit, Trace};
pub use compiler::Compiler;
pub use semiring::Semiring;

/// Rejections when lowering a symbolic circuit onto a semiring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompileError {
	/// Polynomial layers can output negative values, which have no
	/// representation in log space.
	PolynomialInLogSemiring,
	/// The output layers disagree on their unit counts, so the scores of
	/// one batch cannot be stacked into a single tensor.
	NonUniformOutputs,
}

/// Failures while running a compiled circuit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvalError {
	InvalidInputShape,
	CategoryOutOfBounds,
	BackwardUnsupported,
}

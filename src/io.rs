//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Parameter serialization.
//!
//! Leaf parameters of a compiled circuit are stored in a `safetensors` file
//! as `F64` tensors named `p0`, `p1`, ... after their position in
//! [`TensorCircuit::params`]. The position is stable for circuits built the
//! same way, so a file written by one run can be loaded by the next.
//!
//! Loading is all-or-nothing: every tensor is validated and decoded before
//! the first parameter is overwritten.

use std::borrow::Cow;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensorError, SafeTensors, serialize_to_file};

use crate::backend::TensorCircuit;
use crate::util::cold_path;
use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParamIoError {
	Io,
	Malformed,
	MissingTensor,
	DTypeMismatch,
	ShapeMismatch,
}

impl From<std::io::Error> for ErrPack<ParamIoError> {
	#[cold]
	#[inline(never)]
	fn from(err: std::io::Error) -> Self {
		Self {
			code: ParamIoError::Io,
			extra: Some(Box::new(ErrExtra {
				message: Cow::Borrowed("IO error occurred"),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

impl From<SafeTensorError> for ErrPack<ParamIoError> {
	#[cold]
	#[inline(never)]
	fn from(err: SafeTensorError) -> Self {
		let code = match &err {
			SafeTensorError::IoError(_) => ParamIoError::Io,
			SafeTensorError::TensorNotFound(_) => ParamIoError::MissingTensor,
			_ => ParamIoError::Malformed,
		};
		Self {
			code,
			extra: Some(Box::new(ErrExtra {
				message: Cow::Borrowed("safetensors error"),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

//--------------------------------------------------------------------------------------------------

fn tensor_name(index: usize) -> String {
	format!("p{index}")
}

/// Writes the leaf parameters of `circuit` to a `safetensors` file.
///
/// Frozen parameters are written as well, so a load restores the circuit
/// exactly even when constants were folded into leaves.
pub fn save_params(circuit: &TensorCircuit, path: &Path) -> Result<(), ErrPack<ParamIoError>> {
	let params = circuit.params();

	// (shape, little-endian bytes) per parameter; the views borrow from here
	let mut buffers = Vec::with_capacity(params.len());
	for param in params {
		let param = param.borrow();
		let value = param.value();
		let mut bytes = Vec::with_capacity(value.len() * 8);
		for &v in value.iter() {
			bytes.extend_from_slice(&v.to_le_bytes());
		}
		buffers.push((param.shape().to_vec(), bytes));
	}

	let mut tensors = Vec::with_capacity(buffers.len());
	for (index, (shape, bytes)) in buffers.iter().enumerate() {
		let view = TensorView::new(Dtype::F64, shape.clone(), bytes)?;
		tensors.push((tensor_name(index), view));
	}
	serialize_to_file(tensors, &None, path)?;
	Ok(())
}

/// Reads a file written by [`save_params`] back into the leaf parameters
/// of `circuit` and refreshes the circuit's cached parameter tensors.
///
/// The file must contain exactly one `F64` tensor per parameter, named and
/// shaped like the parameters of `circuit`. On error the circuit is left
/// untouched. Other circuits sharing the leaves still hold stale caches;
/// [`crate::backend::Compiler::invalidate`] refreshes all of them.
pub fn load_params(circuit: &TensorCircuit, path: &Path) -> Result<(), ErrPack<ParamIoError>> {
	let buf = std::fs::read(path)?;
	let st = SafeTensors::deserialize(&buf)?;
	let params = circuit.params();
	if st.len() != params.len() {
		cold_path();
		return Err(ErrPack::new(
			ParamIoError::Malformed,
			format!(
				"The file stores {} tensors, the circuit has {} parameters",
				st.len(),
				params.len()
			),
		));
	}

	let mut values = Vec::with_capacity(params.len());
	for (index, param) in params.iter().enumerate() {
		let name = tensor_name(index);
		let view = st.tensor(&name)?;
		if view.dtype() != Dtype::F64 {
			cold_path();
			return Err(ErrPack::new(
				ParamIoError::DTypeMismatch,
				format!("Tensor `{name}` has dtype {:?}, expected F64", view.dtype()),
			));
		}
		let shape = param.borrow().shape().to_vec();
		if view.shape() != shape {
			cold_path();
			return Err(ErrPack::new(
				ParamIoError::ShapeMismatch,
				format!(
					"Tensor `{name}` has shape {:?}, the parameter has shape {:?}",
					view.shape(),
					shape
				),
			));
		}
		values.push(decode_f64(&name, view.data(), &shape)?);
	}

	for (param, value) in params.iter().zip(values) {
		// shapes were checked above, so `set_value` cannot fail
		param.borrow_mut().set_value(value).map_err(|err| ErrPack {
			code: ParamIoError::ShapeMismatch,
			extra: err.extra,
		})?;
	}
	circuit.invalidate_params();
	Ok(())
}

fn decode_f64(
	name: &str,
	data: &[u8],
	shape: &[usize],
) -> Result<ArrayD<f64>, ErrPack<ParamIoError>> {
	let count: usize = shape.iter().product();
	if data.len() != count * 8 {
		cold_path();
		return Err(ErrPack::new(
			ParamIoError::Malformed,
			format!("Tensor `{name}` stores {} bytes, expected {}", data.len(), count * 8),
		));
	}
	let mut values = Vec::with_capacity(count);
	for chunk in data.chunks_exact(8) {
		let mut le = [0_u8; 8];
		le.copy_from_slice(chunk);
		values.push(f64::from_le_bytes(le));
	}
	ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
		ErrPack::new(
			ParamIoError::Malformed,
			format!("Tensor `{name}` does not match its shape {shape:?}"),
		)
	})
}

//--------------------------------------------------------------------------------------------------

//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Symbolic layers.
//!
//! A layer describes one vectorized circuit node: `num_units` scalar units
//! computed from the units of the layer's children. Input layers carry their
//! own scope; the scope of an inner layer is computed by the circuit as the
//! union of its children's scopes.

use crate::scope::Scope;
use crate::symbolic::parameters::Param;
use crate::util::cold_path;
use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LayerError {
	NotUnivariate,
	TooFewCategories,
	ProbsXorLogits,
	WrongParamShape,
	WrongArity,
	NotAnInputLayer,
	MultiChannelPolynomial,
}

/// Categorical tables are kept either as probabilities or as logits.
/// The distinction matters to the operators: products need probabilities,
/// while logits are normalized by definition.
#[derive(Debug, Clone)]
pub enum CategoricalParam {
	Probs(Param),
	Logits(Param),
}

impl CategoricalParam {
	pub fn param(&self) -> &Param {
		match self {
			Self::Probs(p) | Self::Logits(p) => p,
		}
	}
}

#[derive(Debug, Clone)]
pub enum Layer {
	/// Univariate categorical distribution. Table shape is
	/// `(units, channels, categories)`.
	Categorical {
		scope: Scope,
		num_units: usize,
		num_channels: usize,
		num_categories: usize,
		param: CategoricalParam,
	},
	/// Univariate Gaussian. `mean` and `stddev` have shape
	/// `(units, channels)`. A missing `log_partition` means the density is
	/// normalized.
	Gaussian {
		scope: Scope,
		num_units: usize,
		num_channels: usize,
		mean: Param,
		stddev: Param,
		log_partition: Option<Param>,
	},
	/// Univariate polynomial in the input value, single channel only.
	/// `coeff` has shape `(units, degree + 1)`, constant term first.
	Polynomial {
		scope: Scope,
		num_units: usize,
		degree: usize,
		coeff: Param,
	},
	/// Constant vector output, shape `(units,)` in log space. Produced by
	/// integration; has an empty scope.
	LogPartition {
		num_units: usize,
		num_channels: usize,
		value: Param,
	},
	/// An input layer evaluated at a fixed observation, one value per
	/// channel. Has an empty scope.
	Evidence {
		layer: Box<Layer>,
		observation: Vec<f64>,
	},
	/// Weighted sum, one child: `out = weight @ child`.
	Dense {
		num_units: usize,
		num_input_units: usize,
		weight: Param,
	},
	/// Weighted elementwise sum of `arity` children with equal unit counts.
	/// `weight` has shape `(units, arity)`.
	Mixing {
		num_units: usize,
		arity: usize,
		weight: Param,
	},
	/// Elementwise product of `arity` children with equal unit counts.
	Hadamard {
		num_units: usize,
		arity: usize,
	},
	/// All-pairs product of two children, `lhs_units * rhs_units` outputs,
	/// lhs-major.
	Kronecker {
		lhs_units: usize,
		rhs_units: usize,
	},
}

//--------------------------------------------------------------------------------------------------

fn check_univariate(scope: &Scope) -> Result<(), ErrPack<LayerError>> {
	if scope.len() != 1 {
		cold_path();
		return Err(ErrPack {
			code: LayerError::NotUnivariate,
			extra: Some(Box::new(ErrExtra {
				message: format!("Input layers are univariate, got scope {scope}").into(),
				nested: None,
			})),
		});
	}
	Ok(())
}

fn check_param_shape(
	name: &str,
	param: &Param,
	expected: &[usize],
) -> Result<(), ErrPack<LayerError>> {
	if param.shape() != expected {
		cold_path();
		return Err(ErrPack {
			code: LayerError::WrongParamShape,
			extra: Some(Box::new(ErrExtra {
				message: format!(
					"Parameter `{name}` has shape {:?}, expected {expected:?}",
					param.shape()
				)
				.into(),
				nested: None,
			})),
		});
	}
	Ok(())
}

impl Layer {
	pub fn categorical(
		scope: Scope,
		num_units: usize,
		num_channels: usize,
		num_categories: usize,
		probs: Option<Param>,
		logits: Option<Param>,
	) -> Result<Self, ErrPack<LayerError>> {
		check_univariate(&scope)?;
		if num_categories < 2 {
			cold_path();
			return Err(ErrPack {
				code: LayerError::TooFewCategories,
				extra: Some(Box::new(ErrExtra {
					message: format!(
						"A categorical layer needs at least 2 categories, got {num_categories}"
					)
					.into(),
					nested: None,
				})),
			});
		}
		let param = match (probs, logits) {
			(Some(p), None) => CategoricalParam::Probs(p),
			(None, Some(p)) => CategoricalParam::Logits(p),
			_ => {
				cold_path();
				return Err(ErrPack {
					code: LayerError::ProbsXorLogits,
					extra: Some(Box::new(ErrExtra {
						message: "Exactly one of `probs` and `logits` must be given".into(),
						nested: None,
					})),
				});
			},
		};
		check_param_shape(
			"table",
			param.param(),
			&[num_units, num_channels, num_categories],
		)?;
		Ok(Self::Categorical { scope, num_units, num_channels, num_categories, param })
	}

	pub fn gaussian(
		scope: Scope,
		num_units: usize,
		num_channels: usize,
		mean: Param,
		stddev: Param,
		log_partition: Option<Param>,
	) -> Result<Self, ErrPack<LayerError>> {
		check_univariate(&scope)?;
		check_param_shape("mean", &mean, &[num_units, num_channels])?;
		check_param_shape("stddev", &stddev, &[num_units, num_channels])?;
		if let Some(lp) = &log_partition {
			check_param_shape("log_partition", lp, &[num_units, num_channels])?;
		}
		Ok(Self::Gaussian { scope, num_units, num_channels, mean, stddev, log_partition })
	}

	pub fn polynomial(
		scope: Scope,
		num_units: usize,
		num_channels: usize,
		degree: usize,
		coeff: Param,
	) -> Result<Self, ErrPack<LayerError>> {
		check_univariate(&scope)?;
		if num_channels != 1 {
			cold_path();
			return Err(ErrPack {
				code: LayerError::MultiChannelPolynomial,
				extra: Some(Box::new(ErrExtra {
					message: format!(
						"Polynomial layers are single-channel, got {num_channels} channels"
					)
					.into(),
					nested: None,
				})),
			});
		}
		check_param_shape("coeff", &coeff, &[num_units, degree + 1])?;
		Ok(Self::Polynomial { scope, num_units, degree, coeff })
	}

	pub fn log_partition(
		num_units: usize,
		num_channels: usize,
		value: Param,
	) -> Result<Self, ErrPack<LayerError>> {
		check_param_shape("value", &value, &[num_units])?;
		Ok(Self::LogPartition { num_units, num_channels, value })
	}

	pub fn evidence(layer: Self, observation: &[f64]) -> Result<Self, ErrPack<LayerError>> {
		if !matches!(
			layer,
			Self::Categorical { .. } | Self::Gaussian { .. } | Self::Polynomial { .. }
		) {
			cold_path();
			return Err(ErrPack {
				code: LayerError::NotAnInputLayer,
				extra: Some(Box::new(ErrExtra {
					message: format!(
						"Evidence wraps a distribution input layer, got `{}`",
						layer.name()
					)
					.into(),
					nested: None,
				})),
			});
		}
		let num_channels = layer.num_channels().unwrap_or(1);
		if observation.len() != num_channels {
			cold_path();
			return Err(ErrPack {
				code: LayerError::WrongParamShape,
				extra: Some(Box::new(ErrExtra {
					message: format!(
						"Observation has {} values, the layer has {num_channels} channels",
						observation.len()
					)
					.into(),
					nested: None,
				})),
			});
		}
		Ok(Self::Evidence { layer: Box::new(layer), observation: observation.to_vec() })
	}

	pub fn dense(
		num_units: usize,
		num_input_units: usize,
		weight: Param,
	) -> Result<Self, ErrPack<LayerError>> {
		check_param_shape("weight", &weight, &[num_units, num_input_units])?;
		Ok(Self::Dense { num_units, num_input_units, weight })
	}

	pub fn mixing(
		num_units: usize,
		arity: usize,
		weight: Param,
	) -> Result<Self, ErrPack<LayerError>> {
		check_param_shape("weight", &weight, &[num_units, arity])?;
		Ok(Self::Mixing { num_units, arity, weight })
	}

	pub fn hadamard(num_units: usize, arity: usize) -> Result<Self, ErrPack<LayerError>> {
		if arity < 2 {
			cold_path();
			return Err(ErrPack {
				code: LayerError::WrongArity,
				extra: Some(Box::new(ErrExtra {
					message: format!("A product layer needs at least 2 children, got {arity}")
						.into(),
					nested: None,
				})),
			});
		}
		Ok(Self::Hadamard { num_units, arity })
	}

	pub fn kronecker(lhs_units: usize, rhs_units: usize) -> Self {
		Self::Kronecker { lhs_units, rhs_units }
	}

	//----------------------------------------------------------------------------------------------

	pub fn name(&self) -> &'static str {
		match self {
			Self::Categorical { .. } => "categorical",
			Self::Gaussian { .. } => "gaussian",
			Self::Polynomial { .. } => "polynomial",
			Self::LogPartition { .. } => "log_partition",
			Self::Evidence { .. } => "evidence",
			Self::Dense { .. } => "dense",
			Self::Mixing { .. } => "mixing",
			Self::Hadamard { .. } => "hadamard",
			Self::Kronecker { .. } => "kronecker",
		}
	}

	pub fn num_units(&self) -> usize {
		match self {
			Self::Categorical { num_units, .. }
			| Self::Gaussian { num_units, .. }
			| Self::Polynomial { num_units, .. }
			| Self::LogPartition { num_units, .. }
			| Self::Dense { num_units, .. }
			| Self::Mixing { num_units, .. }
			| Self::Hadamard { num_units, .. } => *num_units,
			Self::Evidence { layer, .. } => layer.num_units(),
			Self::Kronecker { lhs_units, rhs_units } => lhs_units * rhs_units,
		}
	}

	/// Number of children the layer expects. Zero exactly for input layers.
	pub fn arity(&self) -> usize {
		match self {
			Self::Categorical { .. }
			| Self::Gaussian { .. }
			| Self::Polynomial { .. }
			| Self::LogPartition { .. }
			| Self::Evidence { .. } => 0,
			Self::Dense { .. } => 1,
			Self::Mixing { arity, .. } | Self::Hadamard { arity, .. } => *arity,
			Self::Kronecker { .. } => 2,
		}
	}

	pub fn is_input(&self) -> bool {
		self.arity() == 0
	}

	pub fn is_sum(&self) -> bool {
		matches!(self, Self::Dense { .. } | Self::Mixing { .. })
	}

	pub fn is_product(&self) -> bool {
		matches!(self, Self::Hadamard { .. } | Self::Kronecker { .. })
	}

	/// The scope an input layer brings in by itself. `None` for inner layers,
	/// whose scope is the union over their children.
	pub fn intrinsic_scope(&self) -> Option<Scope> {
		match self {
			Self::Categorical { scope, .. }
			| Self::Gaussian { scope, .. }
			| Self::Polynomial { scope, .. } => Some(scope.clone()),
			Self::LogPartition { .. } | Self::Evidence { .. } => Some(Scope::empty()),
			_ => None,
		}
	}

	/// Channel count for input layers, `None` for inner layers.
	pub fn num_channels(&self) -> Option<usize> {
		match self {
			Self::Categorical { num_channels, .. }
			| Self::Gaussian { num_channels, .. }
			| Self::LogPartition { num_channels, .. } => Some(*num_channels),
			Self::Polynomial { .. } => Some(1),
			Self::Evidence { layer, .. } => layer.num_channels(),
			_ => None,
		}
	}

	/// Unit count the child at `position` must have.
	pub fn expected_input_units(&self, position: usize) -> usize {
		match self {
			Self::Dense { num_input_units, .. } => *num_input_units,
			Self::Mixing { num_units, .. } | Self::Hadamard { num_units, .. } => *num_units,
			Self::Kronecker { lhs_units, rhs_units } => {
				if position == 0 { *lhs_units } else { *rhs_units }
			},
			_ => 0,
		}
	}
}

//--------------------------------------------------------------------------------------------------

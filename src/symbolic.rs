// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.

pub mod circuit;
pub mod functional;
pub mod layers;
pub mod parameters;

pub use circuit::{Circuit, CircuitBuilder, LayerFactories, LayerId};
pub use layers::Layer;
pub use parameters::Param;

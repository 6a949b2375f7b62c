// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.

//! Trains a categorical circuit on a synthetic clustered dataset by
//! mini-batch NLL and saves the parameters.

use std::path::Path;

use ndarray::{Array3, s};

use cirkit::backend::{Compiler, Semiring};
use cirkit::io;
use cirkit::region_graph::algorithms::random_binary_tree;
use cirkit::rng::Rng;
use cirkit::symbolic::circuit::{LayerFactories, RegionGraphSettings, from_region_graph};
use cirkit::symbolic::functional::integrate;

const NUM_VARS: usize = 8;
const NUM_CATEGORIES: usize = 4;
const NUM_SAMPLES: usize = 256;
const BATCH_SIZE: usize = 32;
const NUM_EPOCHS: usize = 20;

/// Two noisy cluster prototypes over `NUM_VARS` categorical variables.
fn sample_dataset(rng: &mut Rng) -> Array3<f64> {
	let mut x = Array3::zeros((NUM_SAMPLES, 1, NUM_VARS));
	for sample in 0..NUM_SAMPLES {
		let proto = 2 * rng.get_below(2);
		for v in 0..NUM_VARS {
			let cat = if rng.get_below(4) == 0 {
				rng.get_below(NUM_CATEGORIES)
			} else {
				(proto + v) % NUM_CATEGORIES
			};
			x[[sample, 0, v]] = cat as f64;
		}
	}
	x
}

fn main() -> cirkit::Result<()> {
	stderrlog::new().verbosity(log::LevelFilter::Info).init().unwrap();

	let mut rng = Rng::default();
	let rg = random_binary_tree(NUM_VARS, 2, &mut rng)?;
	let settings = RegionGraphSettings {
		num_input_units: 8,
		num_sum_units: 8,
		..Default::default()
	};
	let factories = LayerFactories::monotonic_categorical(NUM_CATEGORIES);
	let sc = from_region_graph(&rg, &settings, &factories)?;
	let int = integrate(&sc, None)?;
	log::info!(
		"circuit: {} layers over {} variables (smooth: {}, decomposable: {})",
		sc.num_layers(),
		sc.num_variables(),
		sc.is_smooth(),
		sc.is_decomposable()
	);

	let mut compiler = Compiler::new(Semiring::LogSumExp);
	let tc = compiler.compile(&sc)?;
	let tz = compiler.compile(&int)?;

	let data = sample_dataset(&mut rng);
	let mut indexes: Vec<usize> = (0..NUM_SAMPLES).collect();
	let d_z = Array3::from_elem((1, 1, 1), 1.0);
	for epoch in 0..NUM_EPOCHS {
		rng.shuffle(&mut indexes);
		for chunk in indexes.chunks(BATCH_SIZE) {
			let mut batch = Array3::zeros((chunk.len(), 1, NUM_VARS));
			for (row, &sample) in chunk.iter().enumerate() {
				batch.slice_mut(s![row, .., ..]).assign(&data.slice(s![sample, .., ..]));
			}

			// NLL = log Z - mean score
			compiler.zero_grad();
			let trace = tc.forward_trace(batch.view())?;
			let d_score = Array3::from_elem((chunk.len(), 1, 1), -1.0 / chunk.len() as f64);
			tc.backward(&trace, d_score.view())?;
			let z_trace = tz.forward_trace_constant()?;
			tz.backward(&z_trace, d_z.view())?;
			compiler.step()?;
		}

		let scores = tc.evaluate(data.view())?;
		let log_z = tz.evaluate_constant()?[[0, 0]];
		let nll = log_z - scores.iter().sum::<f64>() / NUM_SAMPLES as f64;
		log::info!("epoch {epoch}: nll = {nll:.4}");
	}

	let path = Path::new("circuit_params.safetensors");
	io::save_params(&tc, path)?;
	log::info!("saved parameters to {}", path.display());
	Ok(())
}

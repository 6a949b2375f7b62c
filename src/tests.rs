//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! End-to-end properties: symbolic operators composed with the compiled
//! backend. Structural behavior of the individual pieces is tested next to
//! the pieces; this module checks that the numbers come out right.

use std::collections::HashMap;
use std::rc::Rc;

use assert_approx_eq::assert_approx_eq;
use ndarray::Array3;

use crate::backend::{Compiler, Semiring, TensorCircuit};
use crate::io;
use crate::region_graph::algorithms::{fully_factorized, linear_tree, random_binary_tree};
use crate::rng::Rng;
use crate::scope::Scope;
use crate::symbolic::circuit::{
	Circuit, CircuitBuilder, LayerFactories, RegionGraphSettings, from_region_graph,
};
use crate::symbolic::functional::{differentiate, evidence, integrate, multiply};
use crate::symbolic::layers::Layer;
use crate::symbolic::parameters::{Initializer, Param};

const NUM_CATEGORIES: usize = 3;

/// An unnormalized categorical circuit over two variables:
/// per-variable tables -> hadamard -> dense head.
fn unnormalized_circuit() -> Rc<Circuit> {
	fn table(var: usize) -> Layer {
		let probs = Param::leaf(
			&[2, 1, NUM_CATEGORIES],
			Initializer::Uniform { lo: 0.1, hi: 1.0 },
			true,
		)
		.unwrap();
		Layer::categorical(Scope::singleton(var), 2, 1, NUM_CATEGORIES, Some(probs), None)
			.unwrap()
	}

	let mut builder = CircuitBuilder::new();
	let c0 = builder.add_layer(table(0), &[]).unwrap();
	let c1 = builder.add_layer(table(1), &[]).unwrap();
	let h = builder.add_layer(Layer::hadamard(2, 2).unwrap(), &[c0, c1]).unwrap();
	let weight =
		Param::leaf(&[1, 2], Initializer::Uniform { lo: 0.1, hi: 1.0 }, true).unwrap();
	builder.add_layer(Layer::dense(1, 2, weight).unwrap(), &[h]).unwrap();
	Rc::new(builder.build(None).unwrap())
}

fn normalized_circuit(num_vars: usize) -> Rc<Circuit> {
	let rg = linear_tree(num_vars).unwrap();
	let settings = RegionGraphSettings {
		num_input_units: 2,
		num_sum_units: 2,
		..Default::default()
	};
	from_region_graph(&rg, &settings, &LayerFactories::monotonic_categorical(NUM_CATEGORIES))
		.unwrap()
}

/// All category assignments of `num_vars` variables, one batch row each.
fn all_assignments(num_vars: usize) -> Array3<f64> {
	let rows = NUM_CATEGORIES.pow(num_vars as u32);
	Array3::from_shape_fn((rows, 1, num_vars), |(row, _, var)| {
		((row / NUM_CATEGORIES.pow(var as u32)) % NUM_CATEGORIES) as f64
	})
}

#[test]
fn test_integral_matches_brute_force() {
	let sc = unnormalized_circuit();
	let int = integrate(&sc, None).unwrap();
	let x = all_assignments(2);

	let mut lin = Compiler::new(Semiring::SumProduct);
	let tc = lin.compile(&sc).unwrap();
	let tz = lin.compile(&int).unwrap();
	let scores = tc.evaluate(x.view()).unwrap();
	let brute: f64 = scores.iter().sum();
	let z = tz.evaluate_constant().unwrap()[[0, 0]];
	assert_approx_eq!(z, brute, 1e-9);

	// both compilers use the default seed, so the leaves hold the same values
	let mut log = Compiler::new(Semiring::LogSumExp);
	let tc_log = log.compile(&sc).unwrap();
	let tz_log = log.compile(&int).unwrap();
	let log_scores = tc_log.evaluate(x.view()).unwrap();
	for (l, s) in log_scores.iter().zip(scores.iter()) {
		assert_approx_eq!(l.exp(), *s, 1e-9);
	}
	let log_z = tz_log.evaluate_constant().unwrap()[[0, 0]];
	assert_approx_eq!(log_z, brute.ln(), 1e-9);
}

#[test]
fn test_normalized_circuit_has_unit_partition() {
	// random repetitions share their leaf regions, so the root is a mixing
	// layer and the normalization has to hold across repetitions
	let mut rng = Rng::default();
	let rg = random_binary_tree(4, 2, &mut rng).unwrap();
	let settings = RegionGraphSettings {
		num_input_units: 2,
		num_sum_units: 2,
		..Default::default()
	};
	let sc =
		from_region_graph(&rg, &settings, &LayerFactories::monotonic_categorical(NUM_CATEGORIES))
			.unwrap();
	let int = integrate(&sc, None).unwrap();

	let mut compiler = Compiler::new(Semiring::LogSumExp);
	let tc = compiler.compile(&sc).unwrap();
	let tz = compiler.compile(&int).unwrap();
	let log_z = tz.evaluate_constant().unwrap()[[0, 0]];
	assert_approx_eq!(log_z, 0.0, 1e-12);

	// the integral really is the sum over all assignments
	let scores = tc.evaluate(all_assignments(4).view()).unwrap();
	let total: f64 = scores.iter().map(|v| v.exp()).sum();
	assert_approx_eq!(total, 1.0, 1e-9);

	let mut lin = Compiler::new(Semiring::SumProduct);
	let z = lin.compile(&int).unwrap().evaluate_constant().unwrap()[[0, 0]];
	assert_approx_eq!(z, 1.0, 1e-12);
}

#[test]
fn test_product_scores_multiply() {
	let a = normalized_circuit(2);
	let b = normalized_circuit(2);
	let prod = multiply(&a, &b).unwrap();

	let mut compiler = Compiler::new(Semiring::LogSumExp);
	let ta = compiler.compile(&a).unwrap();
	let tb = compiler.compile(&b).unwrap();
	let tp = compiler.compile(&prod).unwrap();

	let x = all_assignments(2);
	let sa = ta.evaluate(x.view()).unwrap();
	let sb = tb.evaluate(x.view()).unwrap();
	let sp = tp.evaluate(x.view()).unwrap();
	for ((pa, pb), pp) in sa.iter().zip(sb.iter()).zip(sp.iter()) {
		assert_approx_eq!(*pp, pa + pb, 1e-9);
	}

	let mut lin = Compiler::new(Semiring::SumProduct);
	let la = lin.compile(&a).unwrap().evaluate(x.view()).unwrap();
	let lb = lin.compile(&b).unwrap().evaluate(x.view()).unwrap();
	let lp = lin.compile(&prod).unwrap().evaluate(x.view()).unwrap();
	for ((pa, pb), pp) in la.iter().zip(lb.iter()).zip(lp.iter()) {
		assert_approx_eq!(*pp, pa * pb, 1e-9);
	}
}

#[test]
fn test_evidence_matches_full_scores() {
	let sc = normalized_circuit(2);
	let ev = evidence(&sc, &HashMap::from([(0usize, vec![2.0])])).unwrap();
	assert_eq!(ev.scope(), Scope::singleton(1));

	let mut compiler = Compiler::new(Semiring::LogSumExp);
	let tc = compiler.compile(&sc).unwrap();
	let te = compiler.compile(&ev).unwrap();

	for cat in 0..NUM_CATEGORIES {
		let full = Array3::from_shape_vec((1, 1, 2), vec![2.0, cat as f64]).unwrap();
		// the observed column of the evidence circuit is ignored
		let masked = Array3::from_shape_vec((1, 1, 2), vec![0.0, cat as f64]).unwrap();
		let s_full = tc.evaluate(full.view()).unwrap()[[0, 0, 0]];
		let s_ev = te.evaluate(masked.view()).unwrap()[[0, 0, 0]];
		assert_approx_eq!(s_ev, s_full, 1e-12);
	}

	// observing every variable leaves a constant circuit
	let all =
		evidence(&sc, &HashMap::from([(0usize, vec![2.0]), (1usize, vec![1.0])])).unwrap();
	assert!(all.scope().is_empty());
	let t_all = compiler.compile(&all).unwrap();
	let s_all = t_all.evaluate_constant().unwrap()[[0, 0]];
	let x = Array3::from_shape_vec((1, 1, 2), vec![2.0, 1.0]).unwrap();
	assert_approx_eq!(s_all, tc.evaluate(x.view()).unwrap()[[0, 0, 0]], 1e-12);
}

#[test]
fn test_derivative_matches_finite_differences() {
	let rg = fully_factorized(2).unwrap();
	let settings = RegionGraphSettings {
		num_input_units: 2,
		num_sum_units: 2,
		..Default::default()
	};
	let sc = from_region_graph(&rg, &settings, &LayerFactories::polynomial(3)).unwrap();
	let diff = differentiate(&sc).unwrap();

	let mut compiler = Compiler::new(Semiring::SumProduct);
	let td = compiler.compile(&diff).unwrap();
	// outputs: d/d0, d/d1 and a copy of the original circuit
	assert_eq!(td.outputs().len(), 3);

	let x0 = [0.3, -0.7];
	let x = Array3::from_shape_vec((1, 1, 2), x0.to_vec()).unwrap();
	let out = td.evaluate(x.view()).unwrap();

	let h = 1e-5;
	for var in 0..2 {
		let mut plus = x0;
		plus[var] += h;
		let mut minus = x0;
		minus[var] -= h;
		let xp = Array3::from_shape_vec((1, 1, 2), plus.to_vec()).unwrap();
		let xm = Array3::from_shape_vec((1, 1, 2), minus.to_vec()).unwrap();
		let fp = td.evaluate(xp.view()).unwrap()[[0, 2, 0]];
		let fm = td.evaluate(xm.view()).unwrap()[[0, 2, 0]];
		assert_approx_eq!(out[[0, var, 0]], (fp - fm) / (2.0 * h), 1e-5);
	}
}

#[test]
fn test_shared_leaves_accumulate_across_circuits() {
	let sc = normalized_circuit(2);
	let int = integrate(&sc, None).unwrap();

	let mut compiler = Compiler::new(Semiring::LogSumExp);
	let tc = compiler.compile(&sc).unwrap();
	let tz = compiler.compile(&int).unwrap();

	// the integral reuses every leaf of the original circuit
	for p in tc.params() {
		assert!(tz.params().iter().any(|q| Rc::ptr_eq(p, q)));
	}

	let x = all_assignments(2);
	let d = Array3::from_elem((x.dim().0, 1, 1), 1.0);
	let dz = Array3::from_elem((1, 1, 1), 1.0);

	compiler.zero_grad();
	let trace = tc.forward_trace(x.view()).unwrap();
	tc.backward(&trace, d.view()).unwrap();
	let g_score: Vec<_> =
		tc.params().iter().map(|p| p.borrow().grad().unwrap().clone()).collect();

	compiler.zero_grad();
	let zt = tz.forward_trace_constant().unwrap();
	tz.backward(&zt, dz.view()).unwrap();
	let g_z: Vec<_> =
		tc.params().iter().map(|p| p.borrow().grad().unwrap().clone()).collect();

	// both backward passes land in the same accumulators
	compiler.zero_grad();
	let trace = tc.forward_trace(x.view()).unwrap();
	tc.backward(&trace, d.view()).unwrap();
	let zt = tz.forward_trace_constant().unwrap();
	tz.backward(&zt, dz.view()).unwrap();

	for ((p, a), b) in tc.params().iter().zip(&g_score).zip(&g_z) {
		let p = p.borrow();
		let acc = p.grad().unwrap();
		for ((acc, a), b) in acc.iter().zip(a.iter()).zip(b.iter()) {
			assert_approx_eq!(*acc, a + b, 1e-12);
		}
	}
}

#[test]
fn test_training_decreases_nll() {
	let sc = normalized_circuit(2);
	let int = integrate(&sc, None).unwrap();

	let mut compiler = Compiler::new(Semiring::LogSumExp);
	let tc = compiler.compile(&sc).unwrap();
	let tz = compiler.compile(&int).unwrap();

	// a biased toy dataset: (0, 1) three times as often as (2, 0)
	let rows: Vec<[f64; 2]> = vec![
		[0.0, 1.0],
		[0.0, 1.0],
		[0.0, 1.0],
		[2.0, 0.0],
		[0.0, 1.0],
		[0.0, 1.0],
		[0.0, 1.0],
		[2.0, 0.0],
	];
	let batch = rows.len();
	let mut x = Array3::zeros((batch, 1, 2));
	for (b, row) in rows.iter().enumerate() {
		x[[b, 0, 0]] = row[0];
		x[[b, 0, 1]] = row[1];
	}

	let nll = |tc: &TensorCircuit, tz: &TensorCircuit| -> f64 {
		let scores = tc.evaluate(x.view()).unwrap();
		let log_z = tz.evaluate_constant().unwrap()[[0, 0]];
		log_z - scores.iter().sum::<f64>() / batch as f64
	};

	let initial = nll(&tc, &tz);
	let d_score = Array3::from_elem((batch, 1, 1), -1.0 / batch as f64);
	let d_z = Array3::from_elem((1, 1, 1), 1.0);
	for _ in 0..30 {
		compiler.zero_grad();
		let trace = tc.forward_trace(x.view()).unwrap();
		tc.backward(&trace, d_score.view()).unwrap();
		let zt = tz.forward_trace_constant().unwrap();
		tz.backward(&zt, d_z.view()).unwrap();
		compiler.step().unwrap();
	}
	let trained = nll(&tc, &tz);
	assert!(trained < initial);
	// softmax parameters keep the circuit normalized while it trains
	assert_approx_eq!(tz.evaluate_constant().unwrap()[[0, 0]], 0.0, 1e-12);
}

#[test]
fn test_param_save_load_round_trip() {
	let sc = normalized_circuit(2);
	let mut compiler = Compiler::new(Semiring::LogSumExp);
	let tc = compiler.compile(&sc).unwrap();

	let x = all_assignments(2);
	let saved_scores = tc.evaluate(x.view()).unwrap();

	let path = std::env::temp_dir()
		.join(format!("cirkit_tests_{}_round_trip.safetensors", std::process::id()));
	io::save_params(&tc, &path).unwrap();

	// train a few steps so the live values move away from the file
	let d = Array3::from_elem((x.dim().0, 1, 1), 1.0);
	for _ in 0..5 {
		compiler.zero_grad();
		let trace = tc.forward_trace(x.view()).unwrap();
		tc.backward(&trace, d.view()).unwrap();
		compiler.step().unwrap();
	}
	let moved = tc.evaluate(x.view()).unwrap();
	assert!(saved_scores.iter().zip(moved.iter()).any(|(a, b)| (a - b).abs() > 1e-9));

	io::load_params(&tc, &path).unwrap();
	let restored = tc.evaluate(x.view()).unwrap();
	for (a, b) in saved_scores.iter().zip(restored.iter()) {
		assert_approx_eq!(*a, *b, 1e-15);
	}
	std::fs::remove_file(&path).unwrap();
}

//! Projected Gauss-Seidel convergence scenarios
//!
//! Small synthetic friction problems with known behavior, plus the solver
//! bookkeeping contracts: best-iterate monotonicity, callbacks, coloring
//! determinism and the freezing heuristic.

use blockgs::{
    ColoringStrategy, Flags, GaussSeidel, NonSmoothLaw, SocLaw3, SparseBlockMatrix, Strategy,
};
use nalgebra::Matrix3;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Decoupled three-contact problem: unit Delassus blocks, unit normal
/// pull, friction coefficient one half.
fn three_contact_identity() -> (SparseBlockMatrix<Matrix3<f64>>, Vec<f64>) {
    let mut w = SparseBlockMatrix::with_flags(Flags::SYMMETRIC);
    w.set_rows(&[3, 3, 3]);
    for i in 0..3 {
        *w.insert_back(i, i).unwrap() = Matrix3::identity();
    }
    w.finalize();
    let b = vec![-1.0, 0.0, 0.0, -1.0, 0.0, 0.0, -1.0, 0.0, 0.0];
    (w, b)
}

/// Coupled chain of contacts, diagonally dominant.
fn coupled_chain(n: usize) -> (SparseBlockMatrix<Matrix3<f64>>, Vec<f64>) {
    let mut w = SparseBlockMatrix::with_flags(Flags::SYMMETRIC);
    w.set_rows(&vec![3; n]);
    for i in 0..n {
        if i > 0 {
            *w.insert_back(i, i - 1).unwrap() = Matrix3::from_element(0.1);
        }
        *w.insert_back(i, i).unwrap() = Matrix3::identity() * 2.0;
    }
    w.finalize();
    let mut b = vec![0.0; 3 * n];
    for i in 0..n {
        b[3 * i] = -1.0 - 0.1 * i as f64;
        b[3 * i + 1] = 0.05 * i as f64;
    }
    (w, b)
}

#[test]
fn three_contacts_converge_within_fifty_sweeps() {
    init_logging();
    let (w, b) = three_contact_identity();
    let law = SocLaw3::coulomb(vec![0.5; 3]);
    let mut gs = GaussSeidel::with_matrix(&w).unwrap();
    gs.set_deterministic(true);
    gs.set_max_iters(50);
    gs.set_eval_every(5);

    let mut r = vec![0.0; 9];
    let res = gs.solve(&law, &b, &mut r).unwrap();
    assert!(res <= 1e-6, "residual {res}");

    // Each contact sticks: r = (1, 0, 0), u = 0.
    for i in 0..3 {
        approx::assert_relative_eq!(r[3 * i], 1.0, epsilon = 1e-5);
        approx::assert_relative_eq!(r[3 * i + 1], 0.0, epsilon = 1e-5);
        approx::assert_relative_eq!(r[3 * i + 2], 0.0, epsilon = 1e-5);
        // The law accepts the converged pair.
        let u = [
            r[3 * i] - 1.0,
            r[3 * i + 1],
            r[3 * i + 2],
        ];
        let err = law.eval_local(i, &r[3 * i..3 * i + 3], &u);
        assert!(err < 1e-8);
    }
}

#[test]
fn coupled_chain_converges() {
    let (w, b) = coupled_chain(8);
    let law = SocLaw3::coulomb(vec![0.6; 8]);
    let mut gs = GaussSeidel::with_matrix(&w).unwrap();
    gs.set_deterministic(true);
    let mut r = vec![0.0; 24];
    let res = gs.solve(&law, &b, &mut r).unwrap();
    assert!(res < 1e-6, "residual {res}");
}

#[test]
fn returned_residual_is_best_seen() {
    let (w, b) = coupled_chain(6);
    let law = SocLaw3::coulomb(vec![0.9; 6]).with_strategy(Strategy::Hybrid);
    let mut gs = GaussSeidel::with_matrix(&w).unwrap();
    gs.set_deterministic(true);
    gs.set_eval_every(2);
    gs.set_max_iters(40);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    gs.set_callback(Box::new(move |iter, res| {
        sink.lock().unwrap().push((iter, res));
    }));

    let mut r = vec![0.0; 18];
    let best = gs.solve(&law, &b, &mut r).unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    for &(_, res) in seen.iter() {
        assert!(best <= res + 1e-15, "best {best} above visited {res}");
    }
}

#[test]
fn deterministic_sweeps_are_reproducible() {
    let (w, b) = coupled_chain(10);
    let law = SocLaw3::coulomb(vec![0.4; 10]);

    let mut results = Vec::new();
    for _ in 0..2 {
        let mut gs = GaussSeidel::with_matrix(&w).unwrap();
        gs.set_deterministic(true);
        gs.set_max_iters(30);
        let mut r = vec![0.0; 30];
        gs.solve(&law, &b, &mut r).unwrap();
        results.push(r);
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn coloring_strategies_reach_the_same_fixed_point() {
    let (w, b) = coupled_chain(6);
    let law = SocLaw3::coulomb(vec![0.5; 6]);

    let mut reference = vec![0.0; 18];
    {
        let mut gs = GaussSeidel::with_matrix(&w).unwrap();
        gs.set_deterministic(true);
        gs.set_coloring(ColoringStrategy::None);
        let res = gs.solve(&law, &b, &mut reference).unwrap();
        assert!(res < 1e-6);
    }
    for coloring in [
        ColoringStrategy::Auto,
        ColoringStrategy::Custom(vec![0, 1, 0, 1, 0, 1]),
    ] {
        let mut gs = GaussSeidel::with_matrix(&w).unwrap();
        gs.set_deterministic(true);
        gs.set_coloring(coloring);
        let mut r = vec![0.0; 18];
        let res = gs.solve(&law, &b, &mut r).unwrap();
        assert!(res < 1e-6);
        for (a, c) in r.iter().zip(&reference) {
            approx::assert_relative_eq!(a, c, epsilon = 1e-4);
        }
    }
}

#[test]
fn non_deterministic_mode_converges() {
    let (w, b) = coupled_chain(12);
    let law = SocLaw3::coulomb(vec![0.5; 12]);
    let mut gs = GaussSeidel::with_matrix(&w).unwrap();
    gs.set_deterministic(false);
    let mut r = vec![0.0; 36];
    let res = gs.solve(&law, &b, &mut r).unwrap();
    assert!(res < 1e-6, "residual {res}");
}

#[test]
fn abort_flag_stops_early() {
    let (w, b) = coupled_chain(6);
    let law = SocLaw3::coulomb(vec![0.5; 6]);
    let mut gs = GaussSeidel::with_matrix(&w).unwrap();
    gs.set_deterministic(true);
    let flag = Arc::new(AtomicBool::new(true));
    gs.set_abort_flag(Arc::clone(&flag));

    let seen = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&seen);
    gs.set_callback(Box::new(move |_, _| {
        *sink.lock().unwrap() += 1;
    }));

    let mut r = vec![0.0; 18];
    // Aborted before the first sweep: no residual evaluations happen
    // beyond the initial one, and the warm start is preserved.
    let res = gs.solve(&law, &b, &mut r).unwrap();
    assert!(res.is_finite());
    assert_eq!(*seen.lock().unwrap(), 0);
    assert_eq!(r, vec![0.0; 18]);
    assert!(flag.load(Ordering::Relaxed));
}

#[test]
fn missing_diagonal_rows_are_left_unchanged() {
    // Row 1 has no diagonal block: its local solve cannot make progress
    // and the sweep must treat it as a no-op.
    let mut w: SparseBlockMatrix<Matrix3<f64>> = SparseBlockMatrix::with_flags(Flags::SYMMETRIC);
    w.set_rows(&[3, 3]);
    *w.insert_back(0, 0).unwrap() = Matrix3::identity();
    w.finalize();
    let law = SocLaw3::coulomb(vec![0.5; 2]);
    let mut gs = GaussSeidel::with_matrix(&w).unwrap();
    gs.set_deterministic(true);
    gs.set_max_iters(10);
    let b = vec![-1.0, 0.0, 0.0, 0.5, 0.0, 0.0];
    let mut r = vec![0.0; 6];
    let res = gs.solve(&law, &b, &mut r).unwrap();
    assert!(res.is_finite());
    // Contact 0 still solves normally.
    approx::assert_relative_eq!(r[0], 1.0, epsilon = 1e-5);
}

#[test]
fn auto_regularization_lifts_singular_diagonal() {
    // A singular diagonal block stalls the plain solver; with
    // regularization the sweep still produces finite iterates.
    let mut w: SparseBlockMatrix<Matrix3<f64>> = SparseBlockMatrix::with_flags(Flags::SYMMETRIC);
    w.set_rows(&[3, 3]);
    let mut singular = Matrix3::identity();
    singular[(2, 2)] = 0.0;
    *w.insert_back(0, 0).unwrap() = singular;
    *w.insert_back(1, 1).unwrap() = Matrix3::identity();
    w.finalize();

    let law = SocLaw3::coulomb(vec![0.7; 2]);
    let mut gs = GaussSeidel::new();
    gs.set_auto_regularization(1e-3);
    gs.set_matrix(&w).unwrap();
    gs.set_deterministic(true);
    let b = vec![-1.0, 0.2, 0.0, -0.5, 0.0, 0.1];
    let mut r = vec![0.0; 6];
    let res = gs.solve(&law, &b, &mut r).unwrap();
    assert!(res.is_finite());
    assert!(r.iter().all(|v| v.is_finite()));
}

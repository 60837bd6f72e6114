extern crate dkalman;

use approx::assert_relative_eq;
use dkalman::{GradientMaps, StateSpace};
use nalgebra::{DMatrix, DVector, Normed};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Two-variable VAR with two lags in companion form, stable coefficients
/// drawn from a seeded generator, simulated data, and a parameter vector
/// touching every system matrix. The analytic score must agree with central
/// finite differences.
#[test]
fn val_var2_gradient_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(42);

    // Draw lag matrices and rescale until the companion form is stable.
    let mut phi1 = DMatrix::from_fn(2, 2, |_, _| rng.gen_range(-0.5..0.5));
    let mut phi2 = DMatrix::from_fn(2, 2, |_, _| rng.gen_range(-0.3..0.3));
    let companion = |p1: &DMatrix<f64>, p2: &DMatrix<f64>| {
        let mut t = DMatrix::zeros(4, 4);
        t.slice_mut((0, 0), (2, 2)).copy_from(p1);
        t.slice_mut((0, 2), (2, 2)).copy_from(p2);
        t.slice_mut((2, 0), (2, 2)).copy_from(&DMatrix::identity(2, 2));
        t
    };
    let radius = |t: &DMatrix<f64>| {
        t.clone()
            .complex_eigenvalues()
            .iter()
            .map(|z| z.norm())
            .fold(0.0f64, f64::max)
    };
    let rho = radius(&companion(&phi1, &phi2));
    if rho >= 0.9 {
        let s = 0.85 / rho;
        phi1 *= s;
        phi2 *= s * s;
    }
    assert!(radius(&companion(&phi1, &phi2)) < 1.0);

    // Perturbations: (block, row, col, base matrix is symmetric)
    // expressed through the Jacobian maps below.
    let t0 = companion(&phi1, &phi2);
    let build = |delta: &DVector<f64>| -> StateSpace<f64> {
        let mut t = t0.clone();
        t[(0, 0)] += delta[0];
        t[(1, 2)] += delta[1];
        let mut c = DVector::from_row_slice(&[0.1, -0.05, 0.0, 0.0]);
        c[0] += delta[2];
        let mut q = DMatrix::from_row_slice(2, 2, &[0.8, 0.1, 0.1, 0.5]);
        q[(0, 0)] += delta[3];
        q[(0, 1)] += delta[4];
        q[(1, 0)] += delta[4];
        let mut h = DMatrix::from_row_slice(2, 2, &[0.3, 0.0, 0.0, 0.4]);
        h[(0, 0)] += delta[5];
        h[(0, 1)] += delta[6];
        h[(1, 0)] += delta[6];
        let mut z = DMatrix::zeros(2, 4);
        z[(0, 0)] = 1.0;
        z[(1, 1)] = 1.0;
        z[(0, 0)] += delta[7];
        let mut d = DVector::zeros(2);
        d[1] += delta[8];
        let mut r = DMatrix::zeros(4, 2);
        r[(0, 0)] = 1.0;
        r[(1, 1)] = 1.0;
        r[(0, 1)] += delta[9];
        let mut a0 = DVector::zeros(4);
        a0[0] += delta[10];
        let mut p0 = DMatrix::identity(4, 4) * 2.0;
        p0[(0, 0)] += delta[11];
        StateSpace::new_invariant(z, d, h, t, c, r, q)
            .unwrap()
            .with_initial(Some(a0), Some(p0))
    };

    // Simulate 100 observations from the unperturbed model.
    let base = build(&DVector::zeros(12));
    let q_chol = DMatrix::from_row_slice(2, 2, &[0.8, 0.1, 0.1, 0.5])
        .cholesky()
        .unwrap();
    let mut x = DVector::<f64>::zeros(4);
    let mut y = DMatrix::<f64>::zeros(2, 100);
    for t in 0..100 {
        let e: DVector<f64> =
            q_chol.l() * DVector::from_fn(2, |_, _| rng.sample::<f64, _>(StandardNormal));
        x = base.T(0) * &x + base.c(0) + base.R(0) * e;
        let noise = DVector::from_fn(2, |i, _| {
            let s: f64 = rng.sample(StandardNormal);
            s * if i == 0 { 0.3f64.sqrt() } else { 0.4f64.sqrt() }
        });
        y.set_column(t, &(base.Z(0) * &x + noise));
    }
    // Drop a couple of entries so the missing-data path is exercised too.
    y[(0, 17)] = f64::NAN;
    y[(1, 53)] = f64::NAN;

    // Jacobian maps mirroring `build` (column-major vec of each block).
    let (p, m, g) = (2usize, 4usize, 2usize);
    let mut maps = GradientMaps::zeros(12, p, m, g);
    maps.T[(0, 0)] = 1.0; // T(0,0)
    maps.T[(1, 2 * m + 1)] = 1.0; // T(1,2)
    maps.c[(2, 0)] = 1.0;
    maps.Q[(3, 0)] = 1.0; // Q(0,0)
    maps.Q[(4, g)] = 1.0; // Q(0,1)
    maps.Q[(4, 1)] = 1.0; // Q(1,0)
    maps.H[(5, 0)] = 1.0; // H(0,0)
    maps.H[(6, p)] = 1.0; // H(0,1)
    maps.H[(6, 1)] = 1.0; // H(1,0)
    maps.Z[(7, 0)] = 1.0; // Z(0,0)
    maps.d[(8, 1)] = 1.0;
    maps.R[(9, m)] = 1.0; // R(0,1)
    maps.a0[(10, 0)] = 1.0;
    maps.P0[(11, 0)] = 1.0; // P0(0,0)

    let (loglik, grad) = base.gradient(&y, &maps).unwrap();
    assert!(loglik.is_finite());

    let step = 1e-5;
    for k in 0..12 {
        let mut up = DVector::zeros(12);
        up[k] = step;
        let lup = build(&up).filter(&y).unwrap().log_likelihood;
        let mut dn = DVector::zeros(12);
        dn[k] = -step;
        let ldn = build(&dn).filter(&y).unwrap().log_likelihood;
        let fd = (lup - ldn) / (2.0 * step);
        assert_relative_eq!(grad[k], fd, max_relative = 1e-6, epsilon = 1e-6);
    }
}

/// Diffuse local level: the variance scores must stay exact through the
/// exact-initial phase.
#[test]
fn val_diffuse_gradient_matches_finite_differences() {
    let nile_like = DMatrix::from_row_slice(
        1,
        12,
        &[11.2, 11.6, 9.6, 12.1, 11.6, 11.6, 8.1, 12.3, 13.7, 11.4, 10.0, 9.4],
    );

    fn build(h: f64, q: f64, z: f64, d: f64) -> StateSpace<f64> {
        StateSpace::new_invariant(
            DMatrix::from_element(1, 1, z),
            DVector::from_element(1, d),
            DMatrix::from_element(1, 1, h),
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, q),
        )
        .unwrap()
    }
    let (h, q, z, d) = (2.0, 1.3, 1.0, 0.1);

    let mut maps = GradientMaps::zeros(4, 1, 1, 1);
    maps.H[(0, 0)] = 1.0;
    maps.Q[(1, 0)] = 1.0;
    maps.Z[(2, 0)] = 1.0;
    maps.d[(3, 0)] = 1.0;

    let (loglik, grad) = build(h, q, z, d).gradient(&nile_like, &maps).unwrap();
    assert!(loglik.is_finite());

    let step = 1e-6;
    let fd = |f_up: f64, f_dn: f64| (f_up - f_dn) / (2.0 * step);
    let cases: [(Box<dyn Fn(f64) -> StateSpace<f64>>, f64); 4] = [
        (Box::new(move |e| build(h + e, q, z, d)), grad[0]),
        (Box::new(move |e| build(h, q + e, z, d)), grad[1]),
        (Box::new(move |e| build(h, q, z + e, d)), grad[2]),
        (Box::new(move |e| build(h, q, z, d + e)), grad[3]),
    ];
    for (builder, analytic) in cases.iter() {
        let lup = builder(step).filter(&nile_like).unwrap().log_likelihood;
        let ldn = builder(-step).filter(&nile_like).unwrap().log_likelihood;
        assert_relative_eq!(*analytic, fd(lup, ldn), max_relative = 1e-6, epsilon = 1e-6);
    }
}

/// The initial-condition scores: shifting the mean of a stationary state
/// must match finite differences through the explicit-override path.
#[test]
fn val_initial_condition_gradient() {
    let build = |a0: f64, p0: f64| -> StateSpace<f64> {
        StateSpace::new_invariant(
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, 0.5),
            DMatrix::from_element(1, 1, 0.8),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 0.3),
        )
        .unwrap()
        .with_initial(
            Some(DVector::from_element(1, a0)),
            Some(DMatrix::from_element(1, 1, p0)),
        )
    };
    let y = DMatrix::from_row_slice(1, 6, &[0.9, 0.4, 0.6, -0.1, 0.3, 0.2]);

    let mut maps = GradientMaps::zeros(2, 1, 1, 1);
    maps.a0[(0, 0)] = 1.0;
    maps.P0[(1, 0)] = 1.0;
    let (a0, p0) = (0.4, 1.1);
    let (_, grad) = build(a0, p0).gradient(&y, &maps).unwrap();

    let step = 1e-6;
    let fd_a0 = (build(a0 + step, p0).filter(&y).unwrap().log_likelihood
        - build(a0 - step, p0).filter(&y).unwrap().log_likelihood)
        / (2.0 * step);
    let fd_p0 = (build(a0, p0 + step).filter(&y).unwrap().log_likelihood
        - build(a0, p0 - step).filter(&y).unwrap().log_likelihood)
        / (2.0 * step);
    assert_relative_eq!(grad[0], fd_a0, max_relative = 1e-6, epsilon = 1e-8);
    assert_relative_eq!(grad[1], fd_p0, max_relative = 1e-6, epsilon = 1e-8);
}

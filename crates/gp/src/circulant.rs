//! Diagonalization of the temporal kernel on a regular time axis.
//!
//! On a regular axis of `n` bins taken as a cycle, the squared exponential kernel matrix is
//! circulant: each row is a cyclic shift of the first one, which holds the kernel evaluated at
//! wrap-around distances `min(k, n - k)` (in bins). A symmetric circulant matrix is diagonalized
//! by the discrete Fourier basis, so its eigenvalues are the (real) DFT of its first column and
//! a real orthonormal eigenbasis is given by the cosine and sine Fourier modes.
//!
//! This replaces an O(n³) dense eigensolve by an O(n log n) FFT.

use crate::eigen::EigenDecomposition;
use crate::errors::{GpError, Result};
use crate::kernels::SquaredExponential;
use crate::GpFloat;
use log::debug;
use ndarray::{Array1, Array2};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::time::Instant;

/// First column of the circulant kernel matrix of size `n`
/// given a length scale expressed in bins.
pub fn first_column<F: GpFloat>(n: usize, length_scale_bins: F) -> Array1<F> {
    let kernel = SquaredExponential::new(length_scale_bins);
    Array1::from_shape_fn(n, |k| kernel.value(F::cast(k.min(n - k))))
}

/// Dense circulant kernel matrix, `K[i, j] = k(min(|i - j|, n - |i - j|))`
pub fn dense_circulant_kernel<F: GpFloat>(n: usize, length_scale_bins: F) -> Array2<F> {
    let column = first_column(n, length_scale_bins);
    Array2::from_shape_fn((n, n), |(i, j)| {
        let k = if i >= j { i - j } else { j - i };
        column[k]
    })
}

/// Real orthonormal Fourier basis of size `n` as columns.
///
/// Column ordering is `[DC, cos_1, sin_1, cos_2, sin_2, ..., (Nyquist when n is even)]`.
/// DC and Nyquist columns are scaled by `1/√n`, the others by `√(2/n)`.
pub fn real_fourier_basis<F: GpFloat>(n: usize) -> Array2<F> {
    let mut basis = Array2::zeros((n, n));
    let nf = F::cast(n);
    let dc = F::one() / nf.sqrt();
    let scale = (F::cast(2.) / nf).sqrt();
    let two_pi = F::cast(2. * std::f64::consts::PI);

    basis.column_mut(0).fill(dc);
    for (mode, col) in fourier_modes(n).into_iter().skip(1).enumerate() {
        let freq = F::cast(mode_frequency(mode + 1));
        let mut column = basis.column_mut(mode + 1);
        match col {
            Mode::Cos => column
                .indexed_iter_mut()
                .for_each(|(j, v)| *v = scale * (two_pi * freq * F::cast(j) / nf).cos()),
            Mode::Sin => column
                .indexed_iter_mut()
                .for_each(|(j, v)| *v = scale * (two_pi * freq * F::cast(j) / nf).sin()),
            Mode::Nyquist => column.indexed_iter_mut().for_each(|(j, v)| {
                *v = if j % 2 == 0 { dc } else { -dc };
            }),
            Mode::Dc => column.fill(dc),
        }
    }
    basis
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Mode {
    Dc,
    Cos,
    Sin,
    Nyquist,
}

/// Kind of each basis column
fn fourier_modes(n: usize) -> Vec<Mode> {
    (0..n)
        .map(|c| {
            if c == 0 {
                Mode::Dc
            } else if n % 2 == 0 && c == n - 1 {
                Mode::Nyquist
            } else if c % 2 == 1 {
                Mode::Cos
            } else {
                Mode::Sin
            }
        })
        .collect()
}

/// Fourier frequency index carried by basis column `c`
fn mode_frequency(c: usize) -> usize {
    (c + 1) / 2
}

/// Eigendecomposition of the circulant squared exponential kernel on `n` regular bins.
///
/// `length_scale_bins` is the time length scale divided by the bin spacing.
pub fn circulant_eigen<F: GpFloat>(
    n: usize,
    length_scale_bins: F,
) -> Result<EigenDecomposition<F>> {
    if n == 0 {
        return Err(GpError::InvalidValueError(
            "Circulant kernel needs at least one time bin".to_string(),
        ));
    }
    if !(length_scale_bins > F::zero()) {
        return Err(GpError::InvalidValueError(format!(
            "Time length scale should be positive, got {length_scale_bins}"
        )));
    }
    let now = Instant::now();
    let column = first_column(n, length_scale_bins);

    let mut planner = FftPlanner::<F>::new();
    let fft = planner.plan_fft_forward(n);
    let mut buffer: Vec<Complex<F>> = column
        .iter()
        .map(|v| Complex::new(*v, F::zero()))
        .collect();
    fft.process(&mut buffer);

    // symmetric first column: spectrum is real and spectrum[k] == spectrum[n - k]
    let values = Array1::from_shape_fn(n, |c| buffer[mode_frequency(c)].re);
    let vectors = real_fourier_basis(n);
    debug!(
        "Circulant time kernel ({n} bins) diagonalized in {:?}",
        now.elapsed()
    );
    Ok(EigenDecomposition { values, vectors })
}

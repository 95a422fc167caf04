use crate::algorithm::SpaceTimeData;
use crate::errors::{GpError, Result};
use crate::parameters::{Hyperparameters, StGpValidParams};
use crate::{GpFloat, GP_COBYLA_MIN_EVAL};

use linfa::Float;
use log::{debug, warn};
use ndarray::{arr1, Array1, Array2};
use ndarray_rand::rand::{Rng, SeedableRng};
use num_traits::ToPrimitive;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::time::Instant;

pub(crate) struct CobylaParams {
    pub rhobeg: f64,
    pub ftol_rel: f64,
    pub maxeval: usize,
}

impl Default for CobylaParams {
    fn default() -> Self {
        CobylaParams {
            rhobeg: 0.5,
            ftol_rel: 1e-4,
            maxeval: 200,
        }
    }
}

/// Starting points on log10 scale: the given guess (clipped to bounds) then
/// `n_start` points drawn uniformly within bounds.
pub(crate) fn prepare_multistart(
    n_start: usize,
    init: &[f64],
    bounds: &[(f64, f64)],
) -> Array2<f64> {
    let mut starts = Array2::zeros((n_start + 1, init.len()));
    starts
        .row_mut(0)
        .iter_mut()
        .zip(init.iter().zip(bounds))
        .for_each(|(s, (v, (lo, up)))| *s = v.clamp(*lo, *up));

    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    for mut row in starts.rows_mut().into_iter().skip(1) {
        row.iter_mut().zip(bounds).for_each(|(s, (lo, up))| {
            *s = if lo < up { rng.gen_range(*lo..*up) } else { *lo };
        });
    }
    starts
}

/// Minimize `objfn` from `param0` within `bounds` with cobyla
pub(crate) fn optimize_params<ObjF>(
    objfn: ObjF,
    param0: &[f64],
    bounds: &[(f64, f64)],
    cobyla: CobylaParams,
) -> (f64, Array1<f64>)
where
    ObjF: Fn(&[f64], &mut ()) -> f64,
{
    use cobyla::{minimize, Func, StopTols};

    let cons: Vec<&dyn Func<()>> = vec![];
    match minimize(
        objfn,
        param0,
        bounds,
        &cons,
        (),
        cobyla.maxeval,
        cobyla::RhoBeg::All(cobyla.rhobeg),
        Some(StopTols {
            ftol_rel: cobyla.ftol_rel,
            ..StopTols::default()
        }),
    ) {
        Ok((_, x_opt, fval)) => {
            let fval = if f64::is_nan(fval) {
                f64::INFINITY
            } else {
                fval
            };
            (fval, arr1(&x_opt))
        }
        Err((status, x_opt, _)) => {
            warn!("Cobyla optimizer failed in GP hyperparameter tuning status={status:?}");
            (f64::INFINITY, arr1(&x_opt))
        }
    }
}

/// Hyperparameters minimizing the negative log likelihood of `data` within `[lower, upper]`.
///
/// Optimization runs on log10 values from several starting points in parallel.
pub(crate) fn optimize_hyperparameters<F: GpFloat>(
    params: &StGpValidParams<F>,
    data: &SpaceTimeData<F>,
    lower: &Hyperparameters<F>,
    upper: &Hyperparameters<F>,
) -> Result<Hyperparameters<F>> {
    let to_log10 = |h: &Hyperparameters<F>| -> Vec<f64> {
        h.to_array()
            .iter()
            .map(|v| v.to_f64().unwrap_or(f64::NAN).log10())
            .collect()
    };
    let from_log10 = |x: &[f64]| -> Hyperparameters<F> {
        let mut values = [F::zero(); 5];
        values
            .iter_mut()
            .zip(x)
            .for_each(|(v, xi)| *v = F::cast(10f64.powf(*xi)));
        Hyperparameters::from_array(values)
    };
    let bounds: Vec<(f64, f64)> = to_log10(lower)
        .into_iter()
        .zip(to_log10(upper))
        .collect();
    let starts = prepare_multistart(
        params.n_start(),
        &to_log10(params.hyperparameters()),
        &bounds,
    );

    let objfn = |x: &[f64], _params: &mut ()| -> f64 {
        if x.iter().any(|v| v.is_nan()) {
            return f64::INFINITY;
        }
        match params.with_hyperparameters(from_log10(x)).fit_fixed(data) {
            Ok(gp) => gp.likelihood().to_f64().unwrap_or(f64::INFINITY),
            Err(_) => f64::INFINITY,
        }
    };

    debug!("Optimize hyperparameters with multistart {starts:?} and bounds {bounds:?}");
    let now = Instant::now();
    let (fmin, xmin) = (0..starts.nrows())
        .into_par_iter()
        .map(|i| {
            optimize_params(
                objfn,
                starts.row(i).as_slice().unwrap_or(&[]),
                &bounds,
                CobylaParams {
                    maxeval: (10 * starts.ncols()).clamp(GP_COBYLA_MIN_EVAL, params.max_eval()),
                    ..CobylaParams::default()
                },
            )
        })
        .reduce(
            || (f64::INFINITY, Array1::zeros(bounds.len())),
            |a, b| if b.0 < a.0 { b } else { a },
        );
    debug!("elapsed optim = {:?}", now.elapsed().as_millis());

    if !fmin.is_finite() {
        return Err(GpError::OptimizationError(
            "no starting point led to a finite likelihood".to_string(),
        ));
    }
    let xmin = xmin.to_vec();
    let best = from_log10(&xmin);
    debug!("Optimized hyperparameters {best:?} with likelihood {fmin}");
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HyperTuning, SpaceTimeGp, TimeAxis};
    use ndarray::array;

    #[test]
    fn test_prepare_multistart() {
        let bounds = vec![(0., 1.), (2., 2.)];
        let starts = prepare_multistart(3, &[5., 2.], &bounds);
        assert_eq!(starts.dim(), (4, 2));
        assert_eq!(starts.row(0).to_vec(), vec![1., 2.]);
        for row in starts.rows() {
            assert!((0. ..=1.).contains(&row[0]));
            assert_eq!(row[1], 2.);
        }
    }

    #[test]
    fn test_optimized_likelihood_improves() {
        let space = array![[0., 0., 0.], [700., 200., 0.], [300., 900., 0.]];
        let n = 24;
        let data = Array2::from_shape_fn((3, n), |(s, t)| {
            2. * (2. * std::f64::consts::PI * t as f64 / 8.).sin() + 0.2 * s as f64
        });
        let dataset = SpaceTimeData::new(space, TimeAxis::regular(1., n), data).unwrap();

        let init = SpaceTimeGp::params(100., 30., 0.3).jitter(1e-6);
        let fixed = init.clone().fit(&dataset).unwrap();
        let optimized = init
            .tuning(HyperTuning::Optimized {
                lower: Hyperparameters::from_array([50., 10., 0.2, 1e-3, 0.1]),
                upper: Hyperparameters::from_array([5000., 100., 4., 1., 10.]),
            })
            .n_start(2)
            .fit(&dataset)
            .unwrap();
        assert!(optimized.likelihood() <= fixed.likelihood());
    }
}

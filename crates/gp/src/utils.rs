use linfa::Float;
use ndarray::{s, Array1, Array2, ArrayBase, Data, Ix1, Ix2, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Time coordinates (hours) of the training bins, relative to the first bin
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum TimeAxis<F: Float> {
    /// `len` bins at `0, spacing, 2.spacing, ...`
    Regular {
        /// Distance in hours between two consecutive bins
        spacing: F,
        /// Number of bins
        len: usize,
    },
    /// Arbitrary increasing time coordinates
    Irregular(Array1<F>),
}

impl<F: Float> TimeAxis<F> {
    /// Regular axis of `len` bins separated by `spacing` hours
    pub fn regular(spacing: F, len: usize) -> Self {
        TimeAxis::Regular { spacing, len }
    }

    /// Build an axis from explicit coordinates, detecting uniform spacing starting at 0.
    pub fn from_coordinates(times: Array1<F>) -> Self {
        let n = times.len();
        if n < 2 || times[0] != F::zero() {
            return TimeAxis::Irregular(times);
        }
        let spacing = times[1] - times[0];
        let tol = F::cast(1e-9) * spacing.abs().max(F::one());
        let uniform = spacing > F::zero()
            && times
                .iter()
                .enumerate()
                .all(|(i, t)| (*t - spacing * F::cast(i)).abs() <= tol);
        if uniform {
            TimeAxis::Regular { spacing, len: n }
        } else {
            TimeAxis::Irregular(times)
        }
    }

    /// Number of bins
    pub fn len(&self) -> usize {
        match self {
            TimeAxis::Regular { len, .. } => *len,
            TimeAxis::Irregular(times) => times.len(),
        }
    }

    /// Whether the axis has no bin
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether bins are uniformly spaced
    pub fn is_regular(&self) -> bool {
        matches!(self, TimeAxis::Regular { .. })
    }

    /// Period of the cyclic axis used by the circulant kernel
    pub fn period(&self) -> Option<F> {
        match self {
            TimeAxis::Regular { spacing, len } => Some(*spacing * F::cast(*len)),
            TimeAxis::Irregular(_) => None,
        }
    }

    /// Time coordinates of the bins
    pub fn coordinates(&self) -> Array1<F> {
        match self {
            TimeAxis::Regular { spacing, len } => {
                Array1::from_shape_fn(*len, |i| *spacing * F::cast(i))
            }
            TimeAxis::Irregular(times) => times.to_owned(),
        }
    }

    /// Check coordinates are finite and strictly increasing
    pub(crate) fn validate(&self) -> bool {
        match self {
            TimeAxis::Regular { spacing, len } => {
                *len > 0 && spacing.is_finite() && *spacing > F::zero()
            }
            TimeAxis::Irregular(times) => {
                !times.is_empty()
                    && times.iter().all(|t| t.is_finite())
                    && times.windows(2).into_iter().all(|w| w[1] > w[0])
            }
        }
    }
}

/// Kronecker product of two matrices: block (i, j) of the result is `a[i, j] * b`
pub fn kronecker<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array2<F> {
    let (am, an) = a.dim();
    let (bm, bn) = b.dim();
    let mut result = Array2::zeros((am * bm, an * bn));
    for ((i, j), &aij) in a.indexed_iter() {
        result
            .slice_mut(s![i * bm..(i + 1) * bm, j * bn..(j + 1) * bn])
            .assign(&b.mapv(|v| v * aij));
    }
    result
}

/// Squared euclidean distances between rows of x and rows of y,
/// resulting in a 2d array of shape (nrows(x), nrows(y)).
/// *Panics* if x and y have not the same column numbers
pub fn pairwise_sq_distances<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array2<F> {
    assert!(x.ncols() == y.ncols());
    let mut result = Array2::zeros((x.nrows(), y.nrows()));
    Zip::from(result.rows_mut())
        .and(x.rows())
        .for_each(|mut res, x_row| {
            Zip::from(&mut res).and(y.rows()).for_each(|r, y_row| {
                *r = Zip::from(&x_row)
                    .and(&y_row)
                    .fold(F::zero(), |acc, a, b| acc + (*a - *b) * (*a - *b));
            });
        });
    result
}

/// Absolute time differences between elements of t and elements of t2,
/// shape (len(t), len(t2)).
pub fn time_distances<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    t2: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Array2<F> {
    Array2::from_shape_fn((t.len(), t2.len()), |(i, j)| (t[i] - t2[j]).abs())
}

/// Wrap-around time differences on a cycle of length `period`:
/// `min(d mod period, period - d mod period)`
pub fn wrapped_time_distances<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    t2: &ArrayBase<impl Data<Elem = F>, Ix1>,
    period: F,
) -> Array2<F> {
    time_distances(t, t2).mapv(|d| {
        let d = d % period;
        d.min(period - d)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_pairwise_sq_distances() {
        let x = array![[0., 0.], [3., 4.]];
        let y = array![[0., 0.], [1., 1.], [3., 0.]];
        assert_abs_diff_eq!(
            array![[0., 2., 9.], [25., 13., 16.]],
            pairwise_sq_distances(&x, &y),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_wrapped_time_distances() {
        let t = array![0., 1., 7.];
        let d = wrapped_time_distances(&t, &t, 8.);
        assert_abs_diff_eq!(
            array![[0., 1., 1.], [1., 0., 2.], [1., 2., 0.]],
            d,
            epsilon = 1e-12
        );
        // query between bins
        let d = wrapped_time_distances(&array![7.5], &t, 8.);
        assert_abs_diff_eq!(array![[0.5, 1.5, 0.5]], d, epsilon = 1e-12);
    }

    #[test]
    fn test_kronecker() {
        let a = array![[1., 2.], [3., 4.]];
        let b = array![[0., 1.], [1., 0.]];
        assert_abs_diff_eq!(
            array![
                [0., 1., 0., 2.],
                [1., 0., 2., 0.],
                [0., 3., 0., 4.],
                [3., 0., 4., 0.]
            ],
            kronecker(&a, &b),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_time_axis_detection() {
        let axis = TimeAxis::from_coordinates(array![0., 0.5, 1., 1.5]);
        assert_eq!(axis, TimeAxis::regular(0.5, 4));
        assert_eq!(axis.period(), Some(2.));

        let axis = TimeAxis::from_coordinates(array![0., 0.5, 1.5]);
        assert!(!axis.is_regular());
        assert!(axis.validate());

        assert!(!TimeAxis::Irregular(array![0., 2., 1.]).validate());
    }
}

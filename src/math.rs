use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "aarch64+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).map(|(x, y)| x * y).sum()
}

/// `sum((a - b) * x)`
#[multiversion(targets("x86_64+avx+avx2+fma", "aarch64+neon"))]
pub(crate) fn dot_of_diff(a: &[f64], b: &[f64], x: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    assert!(a.len() == x.len());
    izip!(a, b, x).map(|(a, b, x)| (a - b) * x).sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "aarch64+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    izip!(x, y).for_each(|(x, y)| {
        *y = a.mul_add(*x, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "aarch64+neon"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    assert!(x.len() == y.len());
    assert!(x.len() == out.len());
    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x * y;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
        izip!(x, y, out).for_each(|(x, y, out)| {
            *out = a.mul_add(*x, *y);
        });
    }

    proptest! {
        #[test]
        fn check_logaddexp(x in -10f64..10f64, y in -10f64..10f64) {
            let a = (x.exp() + y.exp()).ln();
            let b = logaddexp(x, y);
            let neginf = f64::NEG_INFINITY;
            let nan = f64::NAN;
            prop_assert!((a - b).abs() < 1e-10);
            prop_assert_eq!(b, logaddexp(y, x));
            prop_assert_eq!(x, logaddexp(x, neginf));
            prop_assert_eq!(logaddexp(neginf, neginf), neginf);
            prop_assert!(logaddexp(nan, x).is_nan());
        }

        #[test]
        fn check_dot_of_diff(
            a in prop::collection::vec(-10f64..10f64, 5),
            b in prop::collection::vec(-10f64..10f64, 5),
            x in prop::collection::vec(-10f64..10f64, 5),
        ) {
            let mut diff = vec![0.; 5];
            axpy_out(&b, &a, -1., &mut diff);
            let expected = vector_dot(&diff, &x);
            prop_assert!((dot_of_diff(&a, &b, &x) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
    }

    #[test]
    fn check_kernels() {
        let x = [1., 2., 3.];
        let mut y = [1., 1., 1.];
        axpy(&x, &mut y, 2.);
        assert_eq!(y, [3., 5., 7.]);

        let mut out = [0.; 3];
        multiply(&x, &y, &mut out);
        assert_eq!(out, [3., 10., 21.]);
        assert_relative_eq!(vector_dot(&x, &x), 14.);
    }
}

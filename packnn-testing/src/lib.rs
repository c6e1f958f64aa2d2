//! Internal testing utilities for the packnn crates.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Table-driven tests.
///
/// Declare a `Case` struct deriving `Debug`, build a collection of cases
/// named `cases` and call one of the `test_each*` methods with the test body.
/// Every case is run, with panics caught, and the method then panics with a
/// list of the failing cases if there were any.
///
/// ```
/// use packnn_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///   lanes: usize,
///   channels: usize,
///   expected: usize,
/// }
///
/// let cases = [
///   Case { lanes: 4, channels: 16, expected: 4 },
///   Case { lanes: 8, channels: 64, expected: 8 },
/// ];
///
/// cases.test_each(|&Case { lanes, channels, expected }| {
///   assert_eq!(channels.div_ceil(channels / lanes), expected);
/// });
/// ```
///
/// Cases and anything captured by the test function must be unwind safe.
/// Fields which are not can be wrapped in
/// [`AssertUnwindSafe`](std::panic::AssertUnwindSafe), or replaced by a
/// description of how to construct the value inside the test body.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Run `test` with a reference to each case.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Run `test` with a clone of each case.
    fn test_each_clone(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + Clone + UnwindSafe;

    /// Run `test` with each case by value.
    ///
    /// The debug representation of each case is captured before the test
    /// runs, so cases need not be `Clone`.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

fn report_failures<F: Debug>(failures: Vec<F>) {
    assert!(
        failures.is_empty(),
        "{} test cases failed: {:?}",
        failures.len(),
        failures
    );
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .collect();
        report_failures(failures);
    }

    fn test_each_clone(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Clone + Debug + UnwindSafe,
    {
        let test = &test;
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| {
                let value = case.clone();
                std::panic::catch_unwind(move || test(value)).is_err()
            })
            .collect();
        report_failures(failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let test = &test;
        let failures: Vec<String> = self
            .into_iter()
            .filter_map(|case| {
                let desc = format!("{:?}", case);
                std::panic::catch_unwind(move || test(case))
                    .is_err()
                    .then_some(desc)
            })
            .collect();
        report_failures(failures);
    }
}

/// Check that two float slices have the same length and that each pair of
/// values satisfies `|a - b| <= atol + rtol * |b|`.
///
/// On failure, returns a description of the first mismatch, so that tests can
/// use `expect_all_close(..).unwrap()` to get a readable panic message.
pub fn expect_all_close(
    actual: &[f32],
    expected: &[f32],
    rtol: f32,
    atol: f32,
) -> Result<(), String> {
    if actual.len() != expected.len() {
        return Err(format!(
            "Lengths differ. {} vs. {}",
            actual.len(),
            expected.len()
        ));
    }

    for (i, (&x, &y)) in actual.iter().zip(expected).enumerate() {
        let close = !x.is_nan() && !y.is_nan() && (x - y).abs() <= atol + rtol * y.abs();
        if !close {
            return Err(format!("Values differ at index {}: {} vs {}", i, x, y));
        }
    }

    Ok(())
}

/// Return the largest absolute difference between corresponding values.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0., f32::max)
}

#[cfg(test)]
mod tests {
    use super::{expect_all_close, max_abs_diff, TestCases};

    #[test]
    fn test_test_cases_success() {
        #[derive(Clone, Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.clone().test_each(|case| assert!(case.x > 0));
        cases.clone().test_each_clone(|case| assert!(case.x > 0));
        cases.test_each_value(|case| assert!(case.x > 0));
    }

    #[test]
    #[should_panic(expected = "1 test cases failed")]
    fn test_test_each_failure() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each(|case| assert_eq!(case.x, 1));
    }

    #[test]
    #[should_panic(expected = "2 test cases failed")]
    fn test_test_each_value_failure() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each_value(|case| {
            _ = case.x;
            panic!("oh no");
        })
    }

    #[test]
    fn test_expect_all_close() {
        assert!(expect_all_close(&[1.0, 2.0], &[1.0, 2.0005], 0., 1e-3).is_ok());
        assert!(expect_all_close(&[100.0], &[100.05], 1e-3, 0.).is_ok());

        let err = expect_all_close(&[1.0, 2.0], &[1.0, 2.1], 0., 1e-3).unwrap_err();
        assert_eq!(err, "Values differ at index 1: 2 vs 2.1");

        assert!(expect_all_close(&[1.0], &[1.0, 2.0], 0., 1e-3).is_err());
        assert!(expect_all_close(&[f32::NAN], &[f32::NAN], 0., 1e-3).is_err());
        assert_eq!(max_abs_diff(&[1.0, 5.0], &[1.5, 4.0]), 1.0);
    }
}

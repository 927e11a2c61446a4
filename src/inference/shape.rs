//! Post-load shape verification.
//!
//! A loaded backbone is compared tensor by tensor against a freshly initialized twin built from
//! the same config. Norm statistics are included.

use burn::{
    module::{Param, RunningState},
    nn::{conv::Conv2d, BatchNorm, LayerNorm, Linear},
    tensor::{backend::Backend, Tensor},
};

pub trait ShapeCheck {
    fn check_shapes(&self, expected: &Self, path: &str, mismatches: &mut Vec<String>);
}

pub fn check_param<B: Backend, const D: usize>(
    actual: &Param<Tensor<B, D>>,
    expected: &Param<Tensor<B, D>>,
    path: &str,
    mismatches: &mut Vec<String>,
) {
    let (a, e) = (actual.val().dims(), expected.val().dims());
    if a != e {
        mismatches.push(format!("{path}: checkpoint {a:?}, expected {e:?}"));
    }
}

fn check_bias<B: Backend>(
    actual: &Option<Param<Tensor<B, 1>>>,
    expected: &Option<Param<Tensor<B, 1>>>,
    path: &str,
    mismatches: &mut Vec<String>,
) {
    match (actual, expected) {
        (Some(a), Some(e)) => check_param(a, e, path, mismatches),
        (None, None) => {}
        (None, Some(_)) => mismatches.push(format!("{path}: missing from checkpoint")),
        (Some(_), None) => mismatches.push(format!("{path}: unexpected in checkpoint")),
    }
}

impl<B: Backend> ShapeCheck for Linear<B> {
    fn check_shapes(&self, expected: &Self, path: &str, mismatches: &mut Vec<String>) {
        check_param(&self.weight, &expected.weight, &join(path, "weight"), mismatches);
        check_bias(&self.bias, &expected.bias, &join(path, "bias"), mismatches);
    }
}

impl<B: Backend> ShapeCheck for Conv2d<B> {
    fn check_shapes(&self, expected: &Self, path: &str, mismatches: &mut Vec<String>) {
        check_param(&self.weight, &expected.weight, &join(path, "weight"), mismatches);
        check_bias(&self.bias, &expected.bias, &join(path, "bias"), mismatches);
    }
}

impl<B: Backend> ShapeCheck for LayerNorm<B> {
    fn check_shapes(&self, expected: &Self, path: &str, mismatches: &mut Vec<String>) {
        check_param(&self.gamma, &expected.gamma, &join(path, "weight"), mismatches);
        check_param(&self.beta, &expected.beta, &join(path, "bias"), mismatches);
    }
}

fn check_running<B: Backend>(
    actual: &RunningState<Tensor<B, 1>>,
    expected: &RunningState<Tensor<B, 1>>,
    path: &str,
    mismatches: &mut Vec<String>,
) {
    let (a, e) = (actual.value().dims(), expected.value().dims());
    if a != e {
        mismatches.push(format!("{path}: checkpoint {a:?}, expected {e:?}"));
    }
}

impl<B: Backend> ShapeCheck for BatchNorm<B, 2> {
    fn check_shapes(&self, expected: &Self, path: &str, mismatches: &mut Vec<String>) {
        check_param(&self.gamma, &expected.gamma, &join(path, "weight"), mismatches);
        check_param(&self.beta, &expected.beta, &join(path, "bias"), mismatches);
        let (mean, var) = (join(path, "running_mean"), join(path, "running_var"));
        check_running(&self.running_mean, &expected.running_mean, &mean, mismatches);
        check_running(&self.running_var, &expected.running_var, &var, mismatches);
    }
}

impl<M: ShapeCheck> ShapeCheck for Vec<M> {
    fn check_shapes(&self, expected: &Self, path: &str, mismatches: &mut Vec<String>) {
        if self.len() != expected.len() {
            mismatches.push(format!(
                "{path}: checkpoint has {} entries, expected {}",
                self.len(),
                expected.len()
            ));
            return;
        }
        for (i, (a, e)) in self.iter().zip(expected).enumerate() {
            a.check_shapes(e, &join(path, &i.to_string()), mismatches);
        }
    }
}

/// Fail with every mismatching parameter path when `loaded` does not match `expected`.
pub fn verify<M: ShapeCheck>(loaded: &M, expected: &M) -> anyhow::Result<()> {
    let mut mismatches = Vec::new();
    loaded.check_shapes(expected, "", &mut mismatches);
    if mismatches.is_empty() {
        return Ok(());
    }
    anyhow::bail!("checkpoint shape mismatch: {}", mismatches.join("; "))
}

/// Join a parent path and a field name the way checkpoint keys are written.
pub fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{path}.{field}")
    }
}

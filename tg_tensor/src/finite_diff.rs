//! Central-difference gradient estimation, used to validate autograd.

use crate::error::Result;
use crate::node::Tensor;
use crate::shape::Shape;
use crate::value::TensorValue;
use crate::DataType;

fn eval<F>(f: &F, inputs: &[Vec<f32>], shapes: &[Shape]) -> Result<f32>
where
    F: Fn(&[Tensor]) -> Tensor,
{
    let args: Result<Vec<Tensor>> = inputs
        .iter()
        .zip(shapes.iter())
        .map(|(data, shape)| {
            let value = TensorValue::from_elems(
                data,
                shape.clone(),
                DataType::F32,
                crate::default_device(),
            )?;
            Tensor::from_value(value, false)
        })
        .collect();
    f(&args?).item::<f32>()
}

/// Estimate `d f / d inputs[k][i]` for every input element via central
/// differences. `f` must reduce to a rank-0 tensor.
pub fn finite_diff_grad<F>(f: F, inputs: &[Vec<f32>], shapes: &[Shape], eps: f32) -> Vec<Vec<f32>>
where
    F: Fn(&[Tensor]) -> Tensor,
{
    let mut grads = Vec::with_capacity(inputs.len());

    for input_idx in 0..inputs.len() {
        let mut input_grads = Vec::with_capacity(inputs[input_idx].len());

        for elem_idx in 0..inputs[input_idx].len() {
            let mut plus = inputs.to_vec();
            plus[input_idx][elem_idx] += eps;
            let mut minus = inputs.to_vec();
            minus[input_idx][elem_idx] -= eps;

            let out_plus = eval(&f, &plus, shapes).expect("finite difference forward failed");
            let out_minus = eval(&f, &minus, shapes).expect("finite difference forward failed");
            input_grads.push((out_plus - out_minus) / (2.0 * eps));
        }

        grads.push(input_grads);
    }

    grads
}

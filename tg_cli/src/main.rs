//! CLI demo for the tensor autodiff engine.
//!
//! Builds an expression over scalar tensors, computes gradients with the
//! reverse-mode engine, and validates them against finite differences.

use tg_tensor::finite_diff::finite_diff_grad;
use tg_tensor::prelude::*;
use tg_tensor::{scalar, tensor};

fn main() -> Result<()> {
    println!("=== Tensor Autodiff Demo ===\n");

    // z = (x*y + sin(x)) / (y + 2)
    let x_val = 1.5f32;
    let y_val = 2.5f32;

    let x = scalar(x_val, true);
    let y = scalar(y_val, true);

    let numerator = &(&x * &y) + &x.sin()?;
    let denominator = &y + 2.0;
    let z = &numerator / &denominator;

    println!("Expression: z = (x*y + sin(x)) / (y + 2)");
    println!("At point:   x = {x_val}, y = {y_val}");
    println!("Value:      z = {:.10}\n", z.item::<f32>()?);

    z.backward()?;
    let dz_dx = x.grad()?.item::<f32>()?;
    let dz_dy = y.grad()?.item::<f32>()?;

    println!("Autodiff gradients:");
    println!("  dz/dx = {dz_dx:.10}");
    println!("  dz/dy = {dz_dy:.10}\n");

    let f = |args: &[Tensor]| {
        let x = &args[0];
        let y = &args[1];
        let num = &(x * y) + &x.sin().expect("sin failed");
        let den = y + 2.0;
        (&num / &den).sum().expect("sum failed")
    };
    let fd = finite_diff_grad(
        f,
        &[vec![x_val], vec![y_val]],
        &[Shape::new(vec![1]), Shape::new(vec![1])],
        1e-3,
    );

    println!("Finite difference gradients (eps=1e-3):");
    println!("  dz/dx = {:.10}", fd[0][0]);
    println!("  dz/dy = {:.10}\n", fd[1][0]);

    let err_x = (dz_dx - fd[0][0]).abs();
    let err_y = (dz_dy - fd[1][0]).abs();
    println!("Gradient errors:");
    println!("  |autodiff - fd| for x: {err_x:.2e}");
    println!("  |autodiff - fd| for y: {err_y:.2e}\n");

    // Broadcasting gradients, printed with the diagnostic formatter.
    let a = tensor(&[1.0f32, 2.0, 3.0], [1, 3], true);
    let b = tensor(&[7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0], [2, 3], true);
    let product = &a * &b;
    product.backward()?;

    println!("a * b with a [1,3] and b [2,3]:");
    println!("{product}");
    println!("da (summed over the broadcast axis):");
    println!("{}", a.grad()?);

    Ok(())
}

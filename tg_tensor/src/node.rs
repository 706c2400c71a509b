//! The dynamic autograd graph: `TensorNode` and the `Tensor` handle.
//!
//! Every tensor-producing op records its operands and a local gradient rule
//! in a new node. `backward` walks the graph depth-first from the sink,
//! pushing a seed gradient to each parent according to the rule. The walk
//! visits a shared parent once per path rather than deduplicating; the rules
//! are distributive and accumulation is additive, so the result is correct
//! at the cost of redundant work on diamond-shaped graphs.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::device::Device;
use crate::dtype::{DataType, Element, Scalar};
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::value::TensorValue;

/// Local gradient rule recorded by the op that produced a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradFn {
    /// Leaf node: accumulate the seed into `grad` when gradients are required.
    Leaf,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Sqrt,
    Sin,
    Cos,
    Tanh,
    Log,
    Exp,
    Pow,
    MatMul,
    Transpose,
    Sum,
    SumDim { dim: usize, keep_dim: bool },
    Mean,
    BroadcastTo,
    Cast,
}

/// A graph node: the forward value, its accumulated gradient, flags, and up
/// to two shared parent references.
pub(crate) struct TensorNode {
    pub name: Option<String>,
    pub value: TensorValue,
    pub grad: TensorValue,
    pub require_grad: bool,
    pub retain_grad: bool,
    pub a: Option<Tensor>,
    pub b: Option<Tensor>,
    pub dim0: usize,
    pub dim1: usize,
    pub grad_fn: GradFn,
}

/// A lightweight, cloneable handle to a shared graph node. Aliasing clones
/// see each other's mutations. The graph is a DAG: parents are set once at
/// construction and never changed, so no cycles can form.
#[derive(Clone)]
pub struct Tensor(pub(crate) Rc<RefCell<TensorNode>>);

impl Tensor {
    /// Wrap an existing value in a fresh leaf node.
    pub fn from_value(value: TensorValue, require_grad: bool) -> Result<Tensor> {
        Self::new_node(value, require_grad, GradFn::Leaf, None, None)
    }

    fn new_node(
        value: TensorValue,
        require_grad: bool,
        grad_fn: GradFn,
        a: Option<Tensor>,
        b: Option<Tensor>,
    ) -> Result<Tensor> {
        let grad = TensorValue::zeros(value.shape().clone(), value.dtype(), value.device().clone())?;
        Ok(Tensor(Rc::new(RefCell::new(TensorNode {
            name: None,
            value,
            grad,
            require_grad,
            retain_grad: false,
            a,
            b,
            dim0: 0,
            dim1: 0,
            grad_fn,
        }))))
    }

    // Accessors.

    /// Borrow the forward value.
    pub fn value(&self) -> Ref<'_, TensorValue> {
        Ref::map(self.0.borrow(), |n| &n.value)
    }

    /// Mutably borrow the forward value. In-place edits through this handle
    /// (optimizer steps) are visible to every alias and do not invalidate
    /// the node.
    pub fn value_mut(&self) -> RefMut<'_, TensorValue> {
        RefMut::map(self.0.borrow_mut(), |n| &mut n.value)
    }

    pub fn shape(&self) -> Shape {
        self.0.borrow().value.shape().clone()
    }

    pub fn dtype(&self) -> DataType {
        self.0.borrow().value.dtype()
    }

    pub fn device(&self) -> Arc<dyn Device> {
        self.0.borrow().value.device().clone()
    }

    pub fn size(&self) -> usize {
        self.0.borrow().value.size()
    }

    pub fn item<T: Element>(&self) -> Result<T> {
        self.0.borrow().value.item()
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.0.borrow().value.to_vec()
    }

    pub fn is_require_grad(&self) -> bool {
        self.0.borrow().require_grad
    }

    pub fn name(&self) -> Option<String> {
        self.0.borrow().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.0.borrow_mut().name = Some(name.to_string());
    }

    /// Read the accumulated gradient.
    ///
    /// Gradients are only populated on require-grad leaves and on nodes that
    /// called [`Tensor::retain_grad`] before the backward pass.
    pub fn grad(&self) -> Result<TensorValue> {
        let n = self.0.borrow();
        if !n.require_grad && !n.retain_grad {
            return Err(TensorError::InvalidGradAccess);
        }
        Ok(n.grad.clone())
    }

    /// Reset the accumulated gradient to zero.
    pub fn zero_grad(&self) {
        self.0.borrow_mut().grad.fill(Scalar::F64(0.0));
    }

    /// Keep this node's gradient during backward even though it is not a
    /// leaf. Zeroes the gradient buffer.
    pub fn retain_grad(&self) {
        let mut n = self.0.borrow_mut();
        n.retain_grad = true;
        n.grad.fill(Scalar::F64(0.0));
    }

    /// Migrate the node (value and gradient) to another device.
    pub fn to_device(&self, device: Arc<dyn Device>) -> Result<()> {
        let mut n = self.0.borrow_mut();
        n.value.to_device(device.clone())?;
        n.grad.to_device(device)
    }

    // Op constructors.

    fn unary_op(&self, value: TensorValue, grad_fn: GradFn) -> Result<Tensor> {
        Self::new_node(value, self.is_require_grad(), grad_fn, Some(self.clone()), None)
    }

    fn broadcast_for(&self, shape: &Shape) -> Result<Tensor> {
        if &self.shape() == shape {
            Ok(self.clone())
        } else {
            self.broadcast_to(shape)
        }
    }

    fn cast_for(&self, dtype: DataType) -> Result<Tensor> {
        if self.dtype() == dtype {
            Ok(self.clone())
        } else {
            self.cast(dtype)
        }
    }

    /// Promote dtypes, insert broadcast nodes where shapes differ, then run
    /// the forward kernel and record the rule.
    fn binary_op(&self, other: &Tensor, grad_fn: GradFn) -> Result<Tensor> {
        let promoted = self.dtype().promote(other.dtype());
        let bc = Shape::broadcast_shapes(&self.shape(), &other.shape())?;
        let lhs = self.broadcast_for(&bc)?.cast_for(promoted)?;
        let rhs = other.broadcast_for(&bc)?.cast_for(promoted)?;

        let value = {
            let lv = lhs.value();
            let rv = rhs.value();
            match grad_fn {
                GradFn::Add => lv.add(&rv)?,
                GradFn::Sub => lv.sub(&rv)?,
                GradFn::Mul => lv.mul(&rv)?,
                GradFn::Div => lv.div(&rv)?,
                _ => unreachable!("not a binary elementwise rule"),
            }
        };

        let require_grad = lhs.is_require_grad() || rhs.is_require_grad();
        Self::new_node(value, require_grad, grad_fn, Some(lhs), Some(rhs))
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(other, GradFn::Add)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(other, GradFn::Sub)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(other, GradFn::Mul)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(other, GradFn::Div)
    }

    /// Elementwise `self^exp`. The exponent participates in the forward
    /// value only; no gradient flows into it.
    pub fn pow(&self, exp: &Tensor) -> Result<Tensor> {
        let promoted = self.dtype().promote(exp.dtype());
        let bc = Shape::broadcast_shapes(&self.shape(), &exp.shape())?;
        let lhs = self.broadcast_for(&bc)?.cast_for(promoted)?;
        let rhs = exp.broadcast_for(&bc)?.cast_for(promoted)?;
        let value = {
            let lv = lhs.value();
            let rv = rhs.value();
            lv.pow(&rv)?
        };
        let require_grad = lhs.is_require_grad();
        Self::new_node(value, require_grad, GradFn::Pow, Some(lhs), Some(rhs))
    }

    pub fn neg(&self) -> Result<Tensor> {
        let value = self.value().neg()?;
        self.unary_op(value, GradFn::Neg)
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        let value = self.value().sqrt()?;
        self.unary_op(value, GradFn::Sqrt)
    }

    pub fn sin(&self) -> Result<Tensor> {
        let value = self.value().sin()?;
        self.unary_op(value, GradFn::Sin)
    }

    pub fn cos(&self) -> Result<Tensor> {
        let value = self.value().cos()?;
        self.unary_op(value, GradFn::Cos)
    }

    pub fn tanh(&self) -> Result<Tensor> {
        let value = self.value().tanh()?;
        self.unary_op(value, GradFn::Tanh)
    }

    pub fn log(&self) -> Result<Tensor> {
        let value = self.value().log()?;
        self.unary_op(value, GradFn::Log)
    }

    pub fn exp(&self) -> Result<Tensor> {
        let value = self.value().exp()?;
        self.unary_op(value, GradFn::Exp)
    }

    /// Sum all elements to a rank-0 tensor.
    pub fn sum(&self) -> Result<Tensor> {
        let value = self.value().sum()?;
        self.unary_op(value, GradFn::Sum)
    }

    /// Sum along one dimension.
    pub fn sum_dim(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        let value = self.value().sum_dim(dim, keep_dim)?;
        self.unary_op(value, GradFn::SumDim { dim, keep_dim })
    }

    /// Mean of all elements as a rank-0 tensor.
    pub fn mean(&self) -> Result<Tensor> {
        let value = self.value().mean()?;
        self.unary_op(value, GradFn::Mean)
    }

    /// 2-D matrix multiplication.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let promoted = self.dtype().promote(other.dtype());
        let lhs = self.cast_for(promoted)?;
        let rhs = other.cast_for(promoted)?;
        let value = {
            let lv = lhs.value();
            let rv = rhs.value();
            lv.matmul(&rv)?
        };
        let require_grad = lhs.is_require_grad() || rhs.is_require_grad();
        Self::new_node(value, require_grad, GradFn::MatMul, Some(lhs), Some(rhs))
    }

    /// Swap two axes.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        let value = self.value().transpose(dim0, dim1)?;
        let result = self.unary_op(value, GradFn::Transpose)?;
        {
            let mut n = result.0.borrow_mut();
            n.dim0 = dim0;
            n.dim1 = dim1;
        }
        Ok(result)
    }

    /// Materialize this tensor in a broadcast-compatible shape. The backward
    /// rule sums the gradient back down to the original shape.
    pub fn broadcast_to(&self, shape: &Shape) -> Result<Tensor> {
        let value = self.value().broadcast_to(shape)?;
        self.unary_op(value, GradFn::BroadcastTo)
    }

    /// Convert to another dtype. The backward rule converts the seed back.
    pub fn cast(&self, dtype: DataType) -> Result<Tensor> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let value = self.value().to(dtype)?;
        self.unary_op(value, GradFn::Cast)
    }

    /// Same elements under a new shape. The result is a fresh leaf detached
    /// from this node's graph.
    pub fn reshape(&self, shape: &Shape) -> Result<Tensor> {
        let value = self.value().reshape(shape)?;
        Tensor::from_value(value, self.is_require_grad())
    }

    // Backward.

    fn parent_a(&self) -> Tensor {
        self.0.borrow().a.clone().expect("graph node is missing its operand")
    }

    fn parents(&self) -> (Tensor, Tensor) {
        let n = self.0.borrow();
        (
            n.a.clone().expect("graph node is missing its first operand"),
            n.b.clone().expect("graph node is missing its second operand"),
        )
    }

    /// Run reverse-mode differentiation from this sink with seed value 1.
    ///
    /// The seed tensor takes the shape of the sink's parent gradient, so a
    /// reduction sink distributes the seed over its input directly.
    pub fn backward(&self) -> Result<()> {
        self.backward_with(1.0)
    }

    /// Like [`Tensor::backward`] with an explicit seed value.
    pub fn backward_with(&self, seed: f64) -> Result<()> {
        let shape = {
            let n = self.0.borrow();
            match &n.a {
                Some(a) => a.0.borrow().grad.shape().clone(),
                None => n.value.shape().clone(),
            }
        };
        self.backward_with_shape(seed, &shape)
    }

    /// Like [`Tensor::backward`] with an explicit seed value and shape.
    pub fn backward_with_shape(&self, seed: f64, shape: &Shape) -> Result<()> {
        let (dtype, device) = {
            let n = self.0.borrow();
            (n.value.dtype(), n.value.device().clone())
        };
        let seed = TensorValue::full(Scalar::F64(seed), shape.clone(), dtype, device)?;
        self.backward_seed(&seed)
    }

    /// Push a seed gradient into this node and recurse into its parents.
    pub fn backward_seed(&self, seed: &TensorValue) -> Result<()> {
        {
            let mut n = self.0.borrow_mut();
            if n.retain_grad {
                n.grad.add_in_place(seed)?;
            }
        }

        let grad_fn = self.0.borrow().grad_fn;
        match grad_fn {
            GradFn::Leaf => {
                let mut n = self.0.borrow_mut();
                if n.require_grad && !n.retain_grad {
                    debug_assert_eq!(n.grad.dtype(), seed.dtype());
                    n.grad.add_in_place(seed)?;
                }
                Ok(())
            }

            GradFn::Add => {
                let (a, b) = self.parents();
                a.backward_seed(seed)?;
                b.backward_seed(seed)
            }

            GradFn::Sub => {
                let (a, b) = self.parents();
                a.backward_seed(seed)?;
                b.backward_seed(&seed.neg()?)
            }

            GradFn::Mul => {
                let (a, b) = self.parents();
                let grad_a = {
                    let bn = b.0.borrow();
                    bn.value.mul(seed)?
                };
                let grad_b = {
                    let an = a.0.borrow();
                    an.value.mul(seed)?
                };
                a.backward_seed(&grad_a)?;
                b.backward_seed(&grad_b)
            }

            GradFn::Div => {
                let (a, b) = self.parents();
                let grad_a = {
                    let bn = b.0.borrow();
                    seed.div(&bn.value)?
                };
                let grad_b = {
                    let an = a.0.borrow();
                    let bn = b.0.borrow();
                    let b_sq = bn.value.mul(&bn.value)?;
                    an.value.neg()?.mul(seed)?.div(&b_sq)?
                };
                a.backward_seed(&grad_a)?;
                b.backward_seed(&grad_b)
            }

            GradFn::Neg => {
                let a = self.parent_a();
                a.backward_seed(&seed.neg()?)
            }

            GradFn::Sqrt => {
                let a = self.parent_a();
                let grad = {
                    let an = a.0.borrow();
                    an.value.sqrt()?.rdiv_scalar(Scalar::F32(0.5))?.mul(seed)?
                };
                a.backward_seed(&grad)
            }

            GradFn::Sin => {
                let a = self.parent_a();
                let grad = {
                    let an = a.0.borrow();
                    an.value.cos()?.mul(seed)?
                };
                a.backward_seed(&grad)
            }

            GradFn::Cos => {
                let a = self.parent_a();
                let grad = {
                    let an = a.0.borrow();
                    an.value.sin()?.neg()?.mul(seed)?
                };
                a.backward_seed(&grad)
            }

            GradFn::Tanh => {
                let a = self.parent_a();
                let grad = {
                    let an = a.0.borrow();
                    let t = an.value.tanh()?;
                    let t_sq = t.mul(&t)?;
                    t_sq.rsub_scalar(Scalar::F32(1.0))?.mul(seed)?
                };
                a.backward_seed(&grad)
            }

            GradFn::Log => {
                let a = self.parent_a();
                let grad = {
                    let an = a.0.borrow();
                    seed.div(&an.value)?
                };
                a.backward_seed(&grad)
            }

            GradFn::Exp => {
                let a = self.parent_a();
                let grad = {
                    let an = a.0.borrow();
                    seed.mul(&an.value.exp()?)?
                };
                a.backward_seed(&grad)
            }

            GradFn::Pow => {
                // d(a^b)/da = b * a^(b-1); the exponent gets no gradient.
                let (a, b) = self.parents();
                let grad = {
                    let an = a.0.borrow();
                    let bn = b.0.borrow();
                    let b_minus_1 = bn.value.sub_scalar(Scalar::F32(1.0))?;
                    let a_pow = an.value.pow(&b_minus_1)?;
                    seed.mul(&bn.value)?.mul(&a_pow)?
                };
                a.backward_seed(&grad)
            }

            GradFn::MatMul => {
                // dL/dA = seed @ B^T, dL/dB = A^T @ seed.
                let (a, b) = self.parents();
                let grad_a = {
                    let bn = b.0.borrow();
                    seed.matmul(&bn.value.transpose(0, 1)?)?
                };
                let grad_b = {
                    let an = a.0.borrow();
                    an.value.transpose(0, 1)?.matmul(seed)?
                };
                a.backward_seed(&grad_a)?;
                b.backward_seed(&grad_b)
            }

            GradFn::Transpose => {
                let (dim0, dim1) = {
                    let n = self.0.borrow();
                    (n.dim0, n.dim1)
                };
                let a = self.parent_a();
                a.backward_seed(&seed.transpose(dim0, dim1)?)
            }

            GradFn::Sum => {
                // The seed is already shaped for the parent; accumulation
                // broadcasts a narrower seed as needed.
                let a = self.parent_a();
                a.backward_seed(seed)
            }

            GradFn::SumDim { dim, keep_dim: _ } => {
                let a = self.parent_a();
                let parent_shape = a.0.borrow().value.shape().clone();
                let value_shape = self.0.borrow().value.shape().clone();
                let mut keep_shape = parent_shape.clone();
                keep_shape.0[dim] = 1;

                // A seed already shaped like the parent (the default seed
                // convention) passes straight through.
                if seed.shape() == &parent_shape {
                    return a.backward_seed(seed);
                }
                let grad = if seed.shape() == &value_shape {
                    seed.clone()
                } else {
                    seed.broadcast_to(&value_shape)?
                };
                let grad = grad.reshape(&keep_shape)?.broadcast_to(&parent_shape)?;
                a.backward_seed(&grad)
            }

            GradFn::Mean => {
                let a = self.parent_a();
                let count = a.0.borrow().value.size();
                let grad = seed.div_scalar(Scalar::F32(count as f32))?;
                a.backward_seed(&grad)
            }

            GradFn::BroadcastTo => {
                // Each source element fed several broadcast elements, so the
                // gradient sums back down to the source shape.
                let a = self.parent_a();
                let original = a.0.borrow().value.shape().clone();
                a.backward_seed(&seed.reduce_to(&original)?)
            }

            GradFn::Cast => {
                let a = self.parent_a();
                let dtype = a.0.borrow().value.dtype();
                a.backward_seed(&seed.to(dtype)?)
            }
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.borrow();
        f.debug_struct("Tensor")
            .field("grad_fn", &n.grad_fn)
            .field("value", &n.value)
            .field("require_grad", &n.require_grad)
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.borrow().value)
    }
}

// Operator overloads for every borrow combination.

macro_rules! tensor_binop {
    ($trait:ident, $method:ident, $msg:literal) => {
        impl std::ops::$trait for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                Tensor::$method(self, rhs).expect($msg)
            }
        }

        impl std::ops::$trait<Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Tensor {
                Tensor::$method(self, &rhs).expect($msg)
            }
        }

        impl std::ops::$trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                Tensor::$method(&self, rhs).expect($msg)
            }
        }

        impl std::ops::$trait for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Tensor {
                Tensor::$method(&self, &rhs).expect($msg)
            }
        }
    };
}

tensor_binop!(Add, add, "tensor addition failed");
tensor_binop!(Sub, sub, "tensor subtraction failed");
tensor_binop!(Mul, mul, "tensor multiplication failed");
tensor_binop!(Div, div, "tensor division failed");

impl std::ops::Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        Tensor::neg(self).expect("tensor negation failed")
    }
}

impl std::ops::Neg for Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        Tensor::neg(&self).expect("tensor negation failed")
    }
}

// Scalar operands become a tensor of the same shape, then combine.

fn scalar_like(t: &Tensor, value: f32) -> Tensor {
    let tv = TensorValue::full(Scalar::F32(value), t.shape(), t.dtype(), t.device())
        .expect("allocation failed for scalar operand");
    Tensor::from_value(tv, t.is_require_grad()).expect("allocation failed for scalar operand")
}

macro_rules! tensor_scalar_binop {
    ($trait:ident, $method:ident) => {
        impl std::ops::$trait<f32> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: f32) -> Tensor {
                let rhs = scalar_like(self, rhs);
                std::ops::$trait::$method(self, &rhs)
            }
        }

        impl std::ops::$trait<f32> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: f32) -> Tensor {
                let rhs = scalar_like(&self, rhs);
                std::ops::$trait::$method(&self, &rhs)
            }
        }

        impl std::ops::$trait<&Tensor> for f32 {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                let lhs = scalar_like(rhs, self);
                std::ops::$trait::$method(&lhs, rhs)
            }
        }

        impl std::ops::$trait<Tensor> for f32 {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Tensor {
                let lhs = scalar_like(&rhs, self);
                std::ops::$trait::$method(&lhs, &rhs)
            }
        }
    };
}

tensor_scalar_binop!(Add, add);
tensor_scalar_binop!(Sub, sub);
tensor_scalar_binop!(Mul, mul);
tensor_scalar_binop!(Div, div);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finite_diff::finite_diff_grad;
    use crate::{scalar, tensor};

    fn grad_item(t: &Tensor) -> f32 {
        t.grad().unwrap().item::<f32>().unwrap()
    }

    #[test]
    fn test_leaf_accumulates_seed() {
        let x = tensor(&[1.0f32, 2.0, 3.0], [3], true);
        let y = tensor(&[4.0f32, 5.0, 6.0], [3], true);
        let z = (&x + &y).sum().unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![1.0, 1.0, 1.0]);
        assert_eq!(y.grad().unwrap().to_vec::<f32>().unwrap(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_mul_backward() {
        let x = tensor(&[1.0f32, 2.0, 3.0], [3], true);
        let y = tensor(&[4.0f32, 5.0, 6.0], [3], true);
        let z = (&x * &y).sum().unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![4.0, 5.0, 6.0]);
        assert_eq!(y.grad().unwrap().to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_shared_parent_visited_once_per_path() {
        // z = x * x; dz/dx = 2x, accumulated over both paths.
        let x = tensor(&[2.0f32, 3.0], [2], true);
        let z = (&x * &x).sum().unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_scalar_expression_gradients() {
        // m = x*z + sin(u)*u with z = x(x+y)/t - tanh(y^2).
        let x = scalar(2.0, true);
        let y = scalar(3.0, true);
        let t = scalar(4.0, true);
        let u = scalar(5.0, true);

        let z = &(&(&x * &(&x + &y)) / &t) - &(&y * &y).tanh().unwrap();
        let m = &(&x * &z) + &(&u.sin().unwrap() * &u);
        m.backward().unwrap();

        assert!((m.item::<f32>().unwrap() - (-1.79462)).abs() < 1e-4);
        assert!((grad_item(&x) - 5.0).abs() < 1e-4);
        assert!((grad_item(&y) - 1.0).abs() < 1e-4);
        assert!((grad_item(&t) - (-1.25)).abs() < 1e-4);
        assert!((grad_item(&u) - 0.459387).abs() < 1e-4);
    }

    #[test]
    fn test_broadcast_gradients() {
        // x [1,3] * y [2,3]: x's gradient sums over the broadcast axis.
        let x = tensor(&[1.0f32, 2.0, 3.0], [1, 3], true);
        let y = tensor(&[7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0], [2, 3], true);
        let z = &x * &y;
        z.backward().unwrap();

        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![17.0, 19.0, 21.0]);
        assert_eq!(
            y.grad().unwrap().to_vec::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_transpose_gradient_round_trip() {
        let x = tensor(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2], true);
        let z = x.transpose(0, 1).unwrap();
        z.backward_with_shape(1.0, &Shape::new(vec![2, 3])).unwrap();
        assert_eq!(x.grad().unwrap().shape(), &Shape::new(vec![3, 2]));
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![1.0; 6]);
    }

    #[test]
    fn test_sum_dim_forward_and_backward() {
        let data: Vec<f32> = (1..=24).map(|v| v as f32).collect();
        let t = tensor(&data, [3, 4, 2], true);
        let s = t.sum_dim(1, true).unwrap();
        assert_eq!(s.shape(), Shape::new(vec![3, 1, 2]));
        assert_eq!(s.value().value_at::<f32>(&[0, 0, 0]).unwrap(), 16.0);

        s.backward_with_shape(1.0, &Shape::new(vec![3, 1, 2])).unwrap();
        assert_eq!(t.grad().unwrap().to_vec::<f32>().unwrap(), vec![1.0; 24]);
    }

    #[test]
    fn test_matmul_gradients() {
        let a = tensor(&[1.0f32, 2.0, 3.0, 4.0], [2, 2], true);
        let b = tensor(&[5.0f32, 6.0, 7.0, 8.0], [2, 2], true);
        let c = a.matmul(&b).unwrap().sum().unwrap();
        c.backward().unwrap();

        // dC/dA = ones @ B^T, dC/dB = A^T @ ones.
        assert_eq!(
            a.grad().unwrap().to_vec::<f32>().unwrap(),
            vec![11.0, 15.0, 11.0, 15.0]
        );
        assert_eq!(
            b.grad().unwrap().to_vec::<f32>().unwrap(),
            vec![4.0, 4.0, 6.0, 6.0]
        );
    }

    #[test]
    fn test_mean_backward() {
        let x = tensor(&[1.0f32, 2.0, 3.0, 4.0], [2, 2], true);
        let z = x.mean().unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![0.25; 4]);
    }

    #[test]
    fn test_grad_access_rules() {
        let x = tensor(&[1.0f32, 2.0], [2], true);
        let y = tensor(&[1.0f32, 2.0], [2], false);
        let z = &x + &y;

        assert!(x.grad().is_ok());
        assert!(matches!(y.grad(), Err(TensorError::InvalidGradAccess)));
        // z requires grad (propagated), so access is allowed even though
        // only retained nodes get populated.
        assert!(z.grad().is_ok());
    }

    #[test]
    fn test_retain_grad_on_intermediate() {
        let x = scalar(3.0, true);
        let y = &x * &x;
        y.retain_grad();
        let z = &y * 2.0;
        z.backward().unwrap();

        assert!((grad_item(&y) - 2.0).abs() < 1e-6);
        assert!((grad_item(&x) - 12.0).abs() < 1e-6);
    }

    #[test]
    fn test_cast_backward_converts_seed() {
        let x = tensor(&[1.0f32, 2.0], [2], true);
        let z = x.cast(DataType::F64).unwrap().sum().unwrap();
        z.backward().unwrap();
        let g = x.grad().unwrap();
        assert_eq!(g.dtype(), DataType::F32);
        assert_eq!(g.to_vec::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_mixed_dtype_promotes() {
        let x = tensor(&[1.0f32, 2.0], [2], true);
        let wide = Tensor::from_value(
            TensorValue::from_elems(&[1.0f64, 1.0], Shape::new(vec![2]), DataType::F64, crate::default_device()).unwrap(),
            false,
        )
        .unwrap();
        let z = x.add(&wide).unwrap();
        assert_eq!(z.dtype(), DataType::F64);
        z.sum().unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let inputs = vec![vec![0.4f32, -0.7, 1.3], vec![0.9f32, 0.2, -0.5]];
        let shapes = vec![Shape::new(vec![3]), Shape::new(vec![3])];

        let f = |args: &[Tensor]| {
            let a = &args[0];
            let b = &args[1];
            let prod = a * b;
            let wave = a.sin().unwrap() + b.exp().unwrap();
            (prod + wave).sum().unwrap()
        };

        let x = tensor(&inputs[0], [3], true);
        let y = tensor(&inputs[1], [3], true);
        let loss = f(&[x.clone(), y.clone()]);
        loss.backward().unwrap();

        let numeric = finite_diff_grad(f, &inputs, &shapes, 1e-3);
        let gx = x.grad().unwrap().to_vec::<f32>().unwrap();
        let gy = y.grad().unwrap().to_vec::<f32>().unwrap();
        for i in 0..3 {
            assert!((gx[i] - numeric[0][i]).abs() < 1e-2, "x[{i}]: {} vs {}", gx[i], numeric[0][i]);
            assert!((gy[i] - numeric[1][i]).abs() < 1e-2, "y[{i}]: {} vs {}", gy[i], numeric[1][i]);
        }
    }

    #[test]
    fn test_zero_grad_resets() {
        let x = tensor(&[1.0f32, 2.0], [2], true);
        let z = (&x * &x).sum().unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![2.0, 4.0]);

        x.zero_grad();
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_backward_accumulates_across_calls() {
        let x = tensor(&[1.0f32, 2.0], [2], true);
        let z = x.sum().unwrap();
        z.backward().unwrap();
        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![2.0, 2.0]);
    }
}

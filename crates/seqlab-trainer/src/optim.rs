//! Optimizer construction and gradient diagnostics.

use candle_core::backprop::GradStore;
use candle_core::{Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

/// Plain Adam: AdamW with weight decay disabled.
pub fn adam(vars: Vec<Var>, learning_rate: f64) -> Result<AdamW> {
    AdamW::new(
        vars,
        ParamsAdamW {
            lr: learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )
}

/// Global L2 norm of the gradients of `vars`. Variables without a gradient are skipped.
pub fn gradient_norm(grads: &GradStore, vars: &[Var]) -> Result<f32> {
    let mut total = 0f32;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    Ok(total.sqrt())
}

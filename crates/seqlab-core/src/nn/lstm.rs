//! Masked LSTM layers.
//!
//! Padding positions leave the recurrent state untouched, so a backward
//! pass over right-padded sequences starts cleanly at each sequence's last
//! real token.

use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear, linear_no_bias};

use crate::nn::sigmoid;

/// A single LSTM cell with input, forget, cell and output gates.
#[derive(Debug, Clone)]
pub struct LstmCell {
    input: Linear,
    recurrent: Linear,
    hidden_dim: usize,
}

impl LstmCell {
    pub fn new(input_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input: linear(input_dim, 4 * hidden_dim, vb.pp("input"))?,
            recurrent: linear_no_bias(hidden_dim, 4 * hidden_dim, vb.pp("recurrent"))?,
            hidden_dim,
        })
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// One time step. `xs` is `[batch, input_dim]`, `h`/`c` are `[batch, hidden_dim]`.
    pub fn step(&self, xs: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = (self.input.forward(xs)? + self.recurrent.forward(h)?)?;
        let gates = gates.chunk(4, 1)?;

        let i = sigmoid(&gates[0])?;
        let f = sigmoid(&gates[1])?;
        let g = gates[2].tanh()?;
        let o = sigmoid(&gates[3])?;

        let c = ((f * c)? + (i * g)?)?;
        let h = (o * c.tanh()?)?;
        Ok((h, c))
    }

    /// Run over `[batch, seq_len, input_dim]`, honoring `mask` (`[batch, seq_len]` f32).
    ///
    /// Returns `[batch, seq_len, hidden_dim]` hidden states.
    pub fn run(&self, xs: &Tensor, mask: &Tensor, reverse: bool) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        let mut h = Tensor::zeros((batch, self.hidden_dim), xs.dtype(), xs.device())?;
        let mut c = h.clone();

        let mut outputs = vec![h.clone(); seq_len];
        let steps: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..seq_len).rev())
        } else {
            Box::new(0..seq_len)
        };

        for t in steps {
            let x_t = xs.i((.., t, ..))?.contiguous()?;
            let (h_new, c_new) = self.step(&x_t, &h, &c)?;
            let keep = mask.i((.., t))?.unsqueeze(1)?;
            let skip = keep.affine(-1.0, 1.0)?;
            h = (h_new.broadcast_mul(&keep)? + h.broadcast_mul(&skip)?)?;
            c = (c_new.broadcast_mul(&keep)? + c.broadcast_mul(&skip)?)?;
            outputs[t] = h.clone();
        }

        Tensor::stack(&outputs, 1)
    }
}

/// Bidirectional LSTM: forward and backward cells, outputs concatenated.
#[derive(Debug, Clone)]
pub struct BiLstm {
    forward: LstmCell,
    backward: LstmCell,
}

impl BiLstm {
    /// `hidden_dim` is the concatenated output size; each direction gets half.
    pub fn new(input_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        if hidden_dim == 0 || hidden_dim % 2 != 0 {
            candle_core::bail!("bidirectional hidden size must be even and non-zero, got {hidden_dim}");
        }
        Ok(Self {
            forward: LstmCell::new(input_dim, hidden_dim / 2, vb.pp("forward"))?,
            backward: LstmCell::new(input_dim, hidden_dim / 2, vb.pp("backward"))?,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.forward.hidden_dim() + self.backward.hidden_dim()
    }

    /// `[batch, seq_len, input_dim]` -> `[batch, seq_len, hidden_dim]`.
    pub fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let fwd = self.forward.run(xs, mask, false)?;
        let bwd = self.backward.run(xs, mask, true)?;
        Tensor::cat(&[&fwd, &bwd], 2)
    }
}

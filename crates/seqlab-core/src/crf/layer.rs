//! Linear-chain CRF layer.
//!
//! Transition scores live in a trainable `[num_labels, num_labels]` matrix
//! where `transitions[i, j]` scores label `i` followed by label `j`. Two
//! pseudo labels mark the sequence boundaries: every sequence starts from
//! `begin_idx` and ends in `end_idx`, and neither is ever emitted.

use candle_core::{DType, IndexOp, Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::crf::viterbi::ViterbiDecoder;

/// Score added to forbidden transitions.
pub const FORBIDDEN: f32 = -10000.0;

/// Linear-chain conditional random field over emission scores.
#[derive(Debug, Clone)]
pub struct Crf {
    transitions: Tensor,
    constraint: Tensor,
    num_labels: usize,
    begin_idx: usize,
    end_idx: usize,
    decoder: ViterbiDecoder,
}

impl Crf {
    /// Create the layer, allocating `transitions` through `vb`.
    pub fn new(num_labels: usize, begin_idx: usize, end_idx: usize, vb: VarBuilder) -> Result<Self> {
        if begin_idx >= num_labels || end_idx >= num_labels || begin_idx == end_idx {
            candle_core::bail!(
                "invalid CRF boundary labels begin={begin_idx} end={end_idx} for {num_labels} labels"
            );
        }

        let transitions = vb.get_with_hints(
            (num_labels, num_labels),
            "transitions",
            Init::Randn {
                mean: 0.0,
                stdev: 0.1,
            },
        )?;

        // Nothing enters the begin label, nothing leaves the end label
        let mut mask = vec![0f32; num_labels * num_labels];
        for from in 0..num_labels {
            mask[from * num_labels + begin_idx] = FORBIDDEN;
        }
        for to in 0..num_labels {
            mask[end_idx * num_labels + to] = FORBIDDEN;
        }
        let constraint = Tensor::from_vec(mask, (num_labels, num_labels), vb.device())?;

        Ok(Self {
            transitions,
            constraint,
            num_labels,
            begin_idx,
            end_idx,
            decoder: ViterbiDecoder::new(num_labels).with_boundaries(begin_idx, end_idx),
        })
    }

    /// Restrict decoding with chunk-scheme constraints.
    ///
    /// Only decoding is affected; training still scores every path so that
    /// noisy gold sequences keep a finite likelihood.
    pub fn with_decode_constraints<F, S, E>(mut self, valid: F, can_start: S, can_end: E) -> Self
    where
        F: Fn(usize, usize) -> bool,
        S: Fn(usize) -> bool,
        E: Fn(usize) -> bool,
    {
        self.decoder = self
            .decoder
            .with_constraints(valid)
            .with_boundary_constraints(can_start, can_end);
        self
    }

    /// Drop chunk-scheme constraints, keeping only the boundary labels.
    pub fn without_decode_constraints(mut self) -> Self {
        self.decoder = ViterbiDecoder::new(self.num_labels).with_boundaries(self.begin_idx, self.end_idx);
        self
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn begin_idx(&self) -> usize {
        self.begin_idx
    }

    pub fn end_idx(&self) -> usize {
        self.end_idx
    }

    /// Effective transition matrix, boundary constraints applied.
    pub fn transitions(&self) -> Result<Tensor> {
        self.transitions.add(&self.constraint)
    }

    /// Mean negative log-likelihood of `labels` under the CRF.
    ///
    /// * `emissions` - `[batch, seq_len, num_labels]`
    /// * `labels` - gold label indices per sequence, each at most `seq_len` long
    /// * `mask` - `[batch, seq_len]` f32, 1.0 on real positions, left-aligned
    pub fn neg_log_likelihood(
        &self,
        emissions: &Tensor,
        labels: &[Vec<u32>],
        mask: &Tensor,
    ) -> Result<Tensor> {
        let (batch, seq_len, num_labels) = emissions.dims3()?;
        if num_labels != self.num_labels || labels.len() != batch {
            candle_core::bail!(
                "CRF expects [{batch}, _, {}] emissions for {} sequences, got {:?}",
                self.num_labels,
                labels.len(),
                emissions.dims()
            );
        }

        let transitions = self.transitions()?;
        let log_z = self.log_partition(emissions, mask, &transitions)?;
        let gold = self.gold_score(emissions, labels, seq_len, &transitions)?;

        (log_z - gold)?.mean(0)
    }

    /// Forward algorithm: log of the summed score of every label path.
    fn log_partition(&self, emissions: &Tensor, mask: &Tensor, transitions: &Tensor) -> Result<Tensor> {
        let seq_len = emissions.dim(1)?;

        let start = transitions.i(self.begin_idx)?.unsqueeze(0)?;
        let mut alpha = emissions.i((.., 0, ..))?.broadcast_add(&start)?;

        let pairwise = transitions.unsqueeze(0)?;
        for t in 1..seq_len {
            let emit = emissions.i((.., t, ..))?.unsqueeze(1)?;
            // [batch, from, to]
            let scores = alpha
                .unsqueeze(2)?
                .broadcast_add(&pairwise)?
                .broadcast_add(&emit)?;
            let next = log_sum_exp(&scores, 1)?;

            let keep = mask.i((.., t))?.unsqueeze(1)?;
            let skip = keep.affine(-1.0, 1.0)?;
            alpha = (next.broadcast_mul(&keep)? + alpha.broadcast_mul(&skip)?)?;
        }

        let end = transitions.i((.., self.end_idx))?.unsqueeze(0)?;
        log_sum_exp(&alpha.broadcast_add(&end)?, 1)
    }

    /// Score of the gold path, including begin and end transitions.
    fn gold_score(
        &self,
        emissions: &Tensor,
        labels: &[Vec<u32>],
        seq_len: usize,
        transitions: &Tensor,
    ) -> Result<Tensor> {
        let batch = labels.len();
        let n = self.num_labels;

        // One-hot selection of gold emissions and counts of gold transitions
        let mut one_hot = vec![0f32; batch * seq_len * n];
        let mut counts = vec![0f32; batch * n * n];
        for (b, seq) in labels.iter().enumerate() {
            if seq.len() > seq_len {
                candle_core::bail!("label sequence longer than emissions ({} > {seq_len})", seq.len());
            }
            if let Some(&bad) = seq.iter().find(|&&l| l as usize >= n) {
                candle_core::bail!("label index {bad} out of range for {n} labels");
            }

            let mut prev = self.begin_idx;
            for (t, &label) in seq.iter().enumerate() {
                let label = label as usize;
                one_hot[(b * seq_len + t) * n + label] = 1.0;
                counts[b * n * n + prev * n + label] += 1.0;
                prev = label;
            }
            if !seq.is_empty() {
                counts[b * n * n + prev * n + self.end_idx] += 1.0;
            }
        }

        let device = emissions.device();
        let one_hot = Tensor::from_vec(one_hot, (batch, seq_len, n), device)?;
        let counts = Tensor::from_vec(counts, (batch, n, n), device)?;

        let emission_score = emissions.mul(&one_hot)?.sum((1, 2))?;
        let transition_score = counts.broadcast_mul(&transitions.unsqueeze(0)?)?.sum((1, 2))?;
        emission_score + transition_score
    }

    /// Best label path for each sequence, truncated to its length.
    pub fn decode(&self, emissions: &Tensor, lengths: &[usize]) -> crate::Result<Vec<Vec<u32>>> {
        let emissions: Vec<Vec<Vec<f32>>> = emissions.to_dtype(DType::F32)?.to_vec3()?;
        let transitions: Vec<Vec<f32>> = self.transitions()?.to_vec2()?;

        emissions
            .iter()
            .zip(lengths)
            .map(|(scores, &len)| {
                let len = len.min(scores.len());
                let path = self.decoder.decode(&scores[..len], &transitions)?;
                Ok(path.into_iter().map(|l| l as u32).collect())
            })
            .collect()
    }
}

/// Numerically stable `log(sum(exp(x)))` along `dim`, which is removed.
pub fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?.detach();
    let shifted = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    (shifted + max)?.squeeze(dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn crf(num_labels: usize) -> (Crf, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let crf = Crf::new(num_labels, num_labels - 2, num_labels - 1, vb).unwrap();
        (crf, varmap)
    }

    /// Brute-force log partition over all paths of real labels.
    fn brute_force_log_z(emissions: &[Vec<f32>], trans: &[Vec<f32>], real: usize, begin: usize, end: usize) -> f32 {
        let len = emissions.len();
        let mut total = 0f64;
        let paths = real.pow(len as u32);
        for mut code in 0..paths {
            let mut path = Vec::with_capacity(len);
            for _ in 0..len {
                path.push(code % real);
                code /= real;
            }
            let mut score = trans[begin][path[0]] + emissions[0][path[0]];
            for t in 1..len {
                score += trans[path[t - 1]][path[t]] + emissions[t][path[t]];
            }
            score += trans[path[len - 1]][end];
            total += (score as f64).exp();
        }
        total.ln() as f32
    }

    #[test]
    fn nll_matches_brute_force() {
        let (crf, _varmap) = crf(4);
        let emissions = Tensor::new(
            &[[[0.5f32, -0.2, 0.0, 0.0], [0.1, 0.9, 0.0, 0.0], [-0.3, 0.4, 0.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let mask = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        let labels = vec![vec![0u32, 1, 1]];

        let nll: f32 = crf
            .neg_log_likelihood(&emissions, &labels, &mask)
            .unwrap()
            .to_scalar()
            .unwrap();

        let trans: Vec<Vec<f32>> = crf.transitions().unwrap().to_vec2().unwrap();
        let em: Vec<Vec<f32>> = emissions.squeeze(0).unwrap().to_vec2().unwrap();
        let log_z = brute_force_log_z(&em, &trans, 2, 2, 3);
        let gold = trans[2][0] + em[0][0] + trans[0][1] + em[1][1] + trans[1][1] + em[2][1] + trans[1][3];

        assert!((nll - (log_z - gold)).abs() < 1e-3, "nll={nll} expected={}", log_z - gold);
        assert!(nll > 0.0);
    }

    #[test]
    fn padding_does_not_change_likelihood() {
        let (crf, _varmap) = crf(4);
        let short = Tensor::new(&[[[0.5f32, -0.2, 0.0, 0.0], [0.1, 0.9, 0.0, 0.0]]], &Device::Cpu).unwrap();
        let padded = Tensor::new(
            &[[[0.5f32, -0.2, 0.0, 0.0], [0.1, 0.9, 0.0, 0.0], [7.0, -7.0, 3.0, 3.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let labels = vec![vec![1u32, 0]];

        let a: f32 = crf
            .neg_log_likelihood(&short, &labels, &Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap())
            .unwrap()
            .to_scalar()
            .unwrap();
        let b: f32 = crf
            .neg_log_likelihood(&padded, &labels, &Tensor::new(&[[1f32, 1.0, 0.0]], &Device::Cpu).unwrap())
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((a - b).abs() < 1e-4);
    }

    #[test]
    fn decode_never_emits_boundary_labels() {
        let (crf, _varmap) = crf(4);
        let emissions = Tensor::new(
            &[[[0.0f32, 0.0, 9.0, 9.0], [0.0, 0.0, 9.0, 9.0], [0.0, 0.0, 9.0, 9.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let paths = crf.decode(&emissions, &[2]).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 2);
        assert!(paths[0].iter().all(|&l| l < 2));
    }

    #[test]
    fn rejects_bad_boundaries() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Crf::new(3, 1, 1, vb.clone()).is_err());
        assert!(Crf::new(3, 0, 5, vb).is_err());
    }

    #[test]
    fn log_sum_exp_is_stable() {
        let xs = Tensor::new(&[[1000f32, 1000.0]], &Device::Cpu).unwrap();
        let v: Vec<f32> = log_sum_exp(&xs, 1).unwrap().to_vec1().unwrap();
        assert!((v[0] - (1000.0 + 2f32.ln())).abs() < 1e-3);
    }
}

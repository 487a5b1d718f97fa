//! Mini-batch ordering and padding.

use candle_core::{Device, Result, Tensor};

/// Splits a dataset into batches of positions, optionally shuffled.
#[derive(Debug, Clone)]
pub struct Batcher {
    batch_size: usize,
    seed: Option<u64>,
}

impl Batcher {
    /// Sequential batches of `batch_size` (at least 1).
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            seed: None,
        }
    }

    /// Shuffle positions every epoch, deterministically from `seed`.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches of dataset positions for `epoch`.
    pub fn batches(&self, len: usize, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..len).collect();

        if let Some(seed) = self.seed {
            let mut rng = oorandom::Rand64::new(u128::from(seed) << 64 | epoch as u128);
            // Fisher-Yates
            for i in (1..indices.len()).rev() {
                let j = rng.rand_range(0..(i as u64 + 1)) as usize;
                indices.swap(i, j);
            }
        }

        indices
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }
}

/// A padded batch of index sequences.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, max_len]` u32 token indices.
    pub ids: Tensor,
    /// `[batch, max_len]` f32, 1.0 on real tokens.
    pub mask: Tensor,
    /// Unpadded length of each row.
    pub lengths: Vec<usize>,
}

impl Batch {
    /// Right-pad `seqs` with `pad` to the longest sequence (minimum 1).
    pub fn from_sequences(seqs: &[Vec<u32>], pad: u32, device: &Device) -> Result<Self> {
        let batch = seqs.len();
        let max_len = seqs.iter().map(Vec::len).max().unwrap_or(0).max(1);

        let mut ids = Vec::with_capacity(batch * max_len);
        let mut mask = Vec::with_capacity(batch * max_len);
        for seq in seqs {
            ids.extend_from_slice(seq);
            ids.extend(std::iter::repeat_n(pad, max_len - seq.len()));
            mask.extend(std::iter::repeat_n(1f32, seq.len()));
            mask.extend(std::iter::repeat_n(0f32, max_len - seq.len()));
        }

        Ok(Self {
            ids: Tensor::from_vec(ids, (batch, max_len), device)?,
            mask: Tensor::from_vec(mask, (batch, max_len), device)?,
            lengths: seqs.iter().map(Vec::len).collect(),
        })
    }

    pub fn size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_len(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0).max(1)
    }

    /// Number of real (unpadded) tokens.
    pub fn tokens(&self) -> usize {
        self.lengths.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_batches_keep_order() {
        let batches = Batcher::new(2).batches(5, 0);
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        assert_eq!(Batcher::new(0).batch_size(), 1);
    }

    #[test]
    fn shuffle_is_deterministic_per_epoch() {
        let batcher = Batcher::new(3).shuffled(42);
        let a = batcher.batches(10, 1);
        let b = batcher.batches(10, 1);
        assert_eq!(a, b);

        let mut flat: Vec<usize> = a.into_iter().flatten().collect();
        flat.sort_unstable();
        assert_eq!(flat, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_changes_between_epochs() {
        let batcher = Batcher::new(100).shuffled(7);
        assert_ne!(batcher.batches(50, 0), batcher.batches(50, 1));
    }

    #[test]
    fn pads_to_longest_sequence() {
        let batch = Batch::from_sequences(&[vec![5, 6, 7], vec![8]], 0, &Device::Cpu).unwrap();
        assert_eq!(batch.ids.dims(), &[2, 3]);
        assert_eq!(
            batch.ids.to_vec2::<u32>().unwrap(),
            vec![vec![5, 6, 7], vec![8, 0, 0]]
        );
        assert_eq!(
            batch.mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 1.0], vec![1.0, 0.0, 0.0]]
        );
        assert_eq!(batch.tokens(), 4);
    }

    #[test]
    fn empty_sequences_still_get_one_column() {
        let batch = Batch::from_sequences(&[vec![]], 0, &Device::Cpu).unwrap();
        assert_eq!(batch.ids.dims(), &[1, 1]);
        assert_eq!(batch.mask.to_vec2::<f32>().unwrap(), vec![vec![0.0]]);
    }
}

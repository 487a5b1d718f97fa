//! Corpus-level BLEU-4 with a single reference per hypothesis.

use std::collections::HashMap;

const MAX_ORDER: usize = 4;

fn ngram_counts<S: AsRef<str>>(tokens: &[S], n: usize) -> HashMap<Vec<&str>, usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for window in tokens.windows(n) {
            let key: Vec<&str> = window.iter().map(AsRef::as_ref).collect();
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    counts
}

/// BLEU in `[0, 1]` over aligned `(hypothesis, reference)` pairs.
///
/// Uses clipped n-gram precision up to order 4, the geometric mean and the
/// brevity penalty. Returns 0 when any order has no matches.
pub fn corpus_bleu<S: AsRef<str>>(hypotheses: &[Vec<S>], references: &[Vec<S>]) -> f64 {
    let mut matches = [0usize; MAX_ORDER];
    let mut possible = [0usize; MAX_ORDER];
    let mut hyp_len = 0usize;
    let mut ref_len = 0usize;

    for (hyp, reference) in hypotheses.iter().zip(references) {
        hyp_len += hyp.len();
        ref_len += reference.len();

        for n in 1..=MAX_ORDER {
            let ref_counts = ngram_counts(reference, n);
            for (gram, count) in ngram_counts(hyp, n) {
                let clip = ref_counts.get(&gram).copied().unwrap_or(0);
                matches[n - 1] += count.min(clip);
                possible[n - 1] += count;
            }
        }
    }

    if hyp_len == 0 || matches.contains(&0) {
        return 0.0;
    }

    let log_precision: f64 = matches
        .iter()
        .zip(&possible)
        .map(|(&m, &p)| (m as f64 / p as f64).ln())
        .sum::<f64>()
        / MAX_ORDER as f64;

    let brevity = if hyp_len < ref_len {
        (1.0 - ref_len as f64 / hyp_len as f64).exp()
    } else {
        1.0
    };

    brevity * log_precision.exp()
}

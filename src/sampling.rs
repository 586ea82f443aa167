use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::dataset::GoldenAnswer;
use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleSpec {
    /// Fraction of the dataset in (0, 1].
    Fraction(f64),
    /// Absolute number of queries.
    Count(usize),
}

impl SampleSpec {
    pub fn full() -> Self {
        Self::Fraction(1.0)
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Fraction(f) if !(f > 0.0 && f <= 1.0) => Err(HarnessError::InvalidSample(
                format!("sample fraction must be in (0, 1], got {}", f),
            )),
            Self::Count(0) => Err(HarnessError::InvalidSample(
                "sample size must be at least 1".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Number of items selected out of `n`.
    pub fn size_for(&self, n: usize) -> Result<usize> {
        self.validate()?;
        match *self {
            Self::Fraction(f) => {
                if n == 0 {
                    return Ok(0);
                }
                Ok(((f * n as f64).round() as usize).clamp(1, n))
            }
            Self::Count(k) if k > n => Err(HarnessError::InvalidSample(format!(
                "sample size {} exceeds dataset size {}",
                k, n
            ))),
            Self::Count(k) => Ok(k),
        }
    }
}

/// Select a seeded, uniform subset of queries without replacement, keeping
/// each query aligned with its golden answer. A sample covering the whole
/// dataset returns it unchanged.
pub fn sample(
    queries: &[String],
    golden_set: &[GoldenAnswer],
    spec: SampleSpec,
    seed: u64,
) -> Result<(Vec<String>, Vec<GoldenAnswer>)> {
    if queries.len() != golden_set.len() {
        return Err(HarnessError::InvalidSample(format!(
            "query count {} does not match golden set size {}",
            queries.len(),
            golden_set.len()
        )));
    }

    let n = queries.len();
    let k = spec.size_for(n)?;
    if k == n {
        return Ok((queries.to_vec(), golden_set.to_vec()));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices = rand::seq::index::sample(&mut rng, n, k).into_vec();
    indices.sort_unstable();

    let sampled_queries = indices.iter().map(|&i| queries[i].clone()).collect();
    let sampled_golden = indices.iter().map(|&i| golden_set[i].clone()).collect();
    Ok((sampled_queries, sampled_golden))
}

// Label policy — which channels of a multi-label volume become samples

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::Rng;

use voxreg_core::{Error, Result, ValidationError};

/// How label channels are chosen when a label volume stacks several masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleLabel {
    /// One sample per channel, in ascending channel order.
    All,
    /// One sample with a channel drawn uniformly at random.
    #[default]
    Sample,
    /// One sample with the given channel.
    Fixed(usize),
}

impl fmt::Display for SampleLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleLabel::All => write!(f, "all"),
            SampleLabel::Sample => write!(f, "sample"),
            SampleLabel::Fixed(k) => write!(f, "{k}"),
        }
    }
}

impl FromStr for SampleLabel {
    type Err = Error;

    /// Parses `"all"`, `"sample"` or a channel number.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(SampleLabel::All),
            "sample" => Ok(SampleLabel::Sample),
            other => other.parse::<usize>().map(SampleLabel::Fixed).map_err(|_| {
                Error::Configuration(format!(
                    "unknown label sampling policy {s:?}, \
                     expected \"all\", \"sample\" or a channel index"
                ))
            }),
        }
    }
}

/// Channel indices to emit for a label with `num_labels` channels.
///
/// A single-channel label always yields `[0]`. `Sample` consumes one draw
/// from `rng`; the other policies leave it untouched.
pub fn label_indices(
    num_labels: usize,
    policy: SampleLabel,
    rng: &mut StdRng,
) -> Result<Vec<usize>> {
    if num_labels <= 1 {
        return match policy {
            SampleLabel::Fixed(k) if k > 0 => Err(Error::validation(
                &[],
                ValidationError::LabelIndexOutOfRange {
                    index: k,
                    num_labels,
                },
            )),
            _ => Ok(vec![0]),
        };
    }
    match policy {
        SampleLabel::All => Ok((0..num_labels).collect()),
        SampleLabel::Sample => Ok(vec![rng.gen_range(0..num_labels)]),
        SampleLabel::Fixed(k) if k < num_labels => Ok(vec![k]),
        SampleLabel::Fixed(k) => Err(Error::validation(
            &[],
            ValidationError::LabelIndexOutOfRange {
                index: k,
                num_labels,
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn parse_policies() {
        assert_eq!("all".parse::<SampleLabel>().unwrap(), SampleLabel::All);
        assert_eq!("Sample".parse::<SampleLabel>().unwrap(), SampleLabel::Sample);
        assert_eq!("2".parse::<SampleLabel>().unwrap(), SampleLabel::Fixed(2));
        assert!("first".parse::<SampleLabel>().is_err());
    }

    #[test]
    fn all_yields_every_channel() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(label_indices(3, SampleLabel::All, &mut rng).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn single_channel_is_always_zero() {
        let mut rng = StdRng::seed_from_u64(0);
        for policy in [SampleLabel::All, SampleLabel::Sample, SampleLabel::Fixed(0)] {
            assert_eq!(label_indices(1, policy, &mut rng).unwrap(), vec![0]);
        }
    }

    #[test]
    fn sample_draws_one_channel_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let picked = label_indices(4, SampleLabel::Sample, &mut rng).unwrap();
            assert_eq!(picked.len(), 1);
            assert!(picked[0] < 4);
        }
    }

    #[test]
    fn fixed_past_last_channel_fails() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(label_indices(3, SampleLabel::Fixed(1), &mut rng).unwrap(), vec![1]);
        assert!(label_indices(3, SampleLabel::Fixed(3), &mut rng).is_err());
        assert!(label_indices(1, SampleLabel::Fixed(1), &mut rng).is_err());
    }
}

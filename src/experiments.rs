//! Deterministic experiment bucketing.
//!
//! A subject is assigned to one of an experiment's variants by hashing the
//! pair `(subject_key, experiment_name)`. Nothing is stored: the same inputs
//! always produce the same variant, so cross-session consistency depends only
//! on the subject key being stable.
//!
//! Two hash functions are available:
//!
//! | `BucketingHash` | Input                                 | Notes            |
//! |-----------------|---------------------------------------|------------------|
//! | `Rolling`       | UTF-16 code units of both strings     | Default          |
//! | `Fnv1a`         | UTF-8 `subject ‖ 0xFF ‖ experiment`   | Opt-in           |
//!
//! `Rolling` keeps existing assignments but collapses to one variant for
//! same-length keys with a common prefix (`anon-0000`, `anon-0001`, ...).
//! Switching to `Fnv1a` reassigns existing subjects.

use crate::errors::ExperimentError;
use serde::{Deserialize, Serialize};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;
const FNV_SEPARATOR: u8 = 0xff;

/// Hash function used to map a `(subject, experiment)` pair to a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketingHash {
    #[default]
    Rolling,
    Fnv1a,
}

impl std::fmt::Display for BucketingHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketingHash::Rolling => write!(f, "rolling"),
            BucketingHash::Fnv1a => write!(f, "fnv1a"),
        }
    }
}

impl std::str::FromStr for BucketingHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rolling" => Ok(BucketingHash::Rolling),
            "fnv1a" | "fnv-1a" => Ok(BucketingHash::Fnv1a),
            _ => anyhow::bail!("Invalid bucketing hash '{}'. Valid values: rolling, fnv1a", s),
        }
    }
}

impl BucketingHash {
    /// Bucket value for the pair; the variant index is this value modulo the
    /// number of variants.
    pub fn bucket(self, subject_key: &str, experiment: &str) -> u32 {
        match self {
            BucketingHash::Rolling => rolling_hash(subject_key, experiment).unsigned_abs(),
            BucketingHash::Fnv1a => fnv1a_hash(subject_key, experiment),
        }
    }

    /// Assign a variant using this hash.
    pub fn assign<'a, S: AsRef<str>>(
        self,
        subject_key: &str,
        experiment: &str,
        variants: &'a [S],
    ) -> Result<&'a str, ExperimentError> {
        if variants.is_empty() {
            return Err(ExperimentError::InvalidArgument(format!(
                "experiment '{}' has no variants",
                experiment
            )));
        }
        let index = self.bucket(subject_key, experiment) as usize % variants.len();
        Ok(variants[index].as_ref())
    }
}

/// Assign a variant with the default rolling hash.
///
/// Returns `ExperimentError::InvalidArgument` when `variants` is empty.
pub fn assign_variant<'a, S: AsRef<str>>(
    subject_key: &str,
    experiment: &str,
    variants: &'a [S],
) -> Result<&'a str, ExperimentError> {
    BucketingHash::Rolling.assign(subject_key, experiment, variants)
}

/// `hash = hash * 31 + (s[i % |s|] ^ e[i % |e|])` in wrapping i32 arithmetic,
/// for `|s| + |e|` rounds. An empty string contributes code unit 0.
pub fn rolling_hash(subject_key: &str, experiment: &str) -> i32 {
    let subject: Vec<u16> = subject_key.encode_utf16().collect();
    let exp: Vec<u16> = experiment.encode_utf16().collect();

    let unit_at = |units: &[u16], i: usize| -> i32 {
        if units.is_empty() {
            0
        } else {
            i32::from(units[i % units.len()])
        }
    };

    let mut hash: i32 = 0;
    for i in 0..subject.len() + exp.len() {
        let mixed = unit_at(&subject, i) ^ unit_at(&exp, i);
        hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(mixed);
    }
    hash
}

/// 32-bit FNV-1a over `subject ‖ 0xFF ‖ experiment`.
pub fn fnv1a_hash(subject_key: &str, experiment: &str) -> u32 {
    subject_key
        .as_bytes()
        .iter()
        .chain(std::iter::once(&FNV_SEPARATOR))
        .chain(experiment.as_bytes())
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
        })
}

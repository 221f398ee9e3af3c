//! `beacon assign`: print the variant for a subject.

use anyhow::Result;
use beacon::config::BeaconConfig;
use beacon::experiments::BucketingHash;

pub fn cmd_assign(
    config: &BeaconConfig,
    subject: &str,
    experiment: &str,
    variants: &[String],
    hash: Option<BucketingHash>,
) -> Result<()> {
    let hash = hash.unwrap_or_else(|| config.bucketing_hash());
    let variant = hash.assign(subject, experiment, variants)?;
    println!("{}", variant);
    Ok(())
}

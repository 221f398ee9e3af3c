//! `beacon track`: queue one event and flush it right away.

use anyhow::{Context, Result};
use beacon::Analytics;
use beacon::config::BeaconConfig;
use beacon::event::Properties;
use serde_json::Value;

pub async fn cmd_track(
    config: &BeaconConfig,
    event: &str,
    properties: &[String],
    user: Option<&str>,
) -> Result<()> {
    let properties = parse_properties(properties)?;
    let analytics = Analytics::from_config(config).context("Failed to set up analytics")?;
    if let Some(user) = user {
        analytics.identify(user);
    }

    analytics.track(event, properties);
    let report = analytics.shutdown().await;

    let label = if report.failed == 0 {
        console::style("Sent").green().bold()
    } else {
        console::style("Not delivered").yellow().bold()
    };
    println!("{} {} ({})", label, event, report);
    println!("  backend: {}/{}", config.backend_url().trim_end_matches('/'), config.endpoint());
    println!("  subject: {}", analytics.subject_id());
    Ok(())
}

/// Parse `key=value` pairs. Values that are valid JSON keep their type.
pub fn parse_properties(raw: &[String]) -> Result<Properties> {
    let mut properties = Properties::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid property '{}': expected key=value", pair))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Invalid property '{}': key is empty", pair);
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
        properties.insert(key.to_string(), value);
    }
    Ok(properties)
}

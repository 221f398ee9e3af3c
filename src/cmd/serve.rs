//! `beacon serve`: run the local collector in the foreground.

use anyhow::{Context, Result};
use beacon::collector::CollectorServer;
use std::net::SocketAddr;
use std::path::Path;

pub async fn cmd_serve(port: u16, log_file: Option<&Path>) -> Result<()> {
    let mut server = CollectorServer::new();
    if let Some(path) = log_file {
        server = server.with_log_file(path)?;
    }

    let url = server.start(SocketAddr::from(([127, 0, 0, 1], port))).await?;
    println!(
        "{} collector on {}",
        console::style("Listening:").green().bold(),
        url
    );
    if let Some(path) = server.log_path() {
        println!("  logging events to {}", path.display());
    }
    println!("  press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let received = server.total_received().await;
    server.stop().await?;
    println!();
    println!("Stopped. {} event(s) received.", received);
    Ok(())
}

//! Health, readiness, and metrics snapshot commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, get_status};

#[derive(Deserialize)]
struct MetricsSnapshot {
    sessions_created: u64,
    transfers_init: u64,
    transfers_completed: u64,
    chunks_written: u64,
    chunk_conflicts: u64,
    quota_rejections: u64,
    scan_verdicts_clean: u64,
    scan_verdicts_failed: u64,
    scan_verdicts_unavailable: u64,
    sweep_sessions_deleted: u64,
    sweep_transfers_deleted: u64,
    sweep_scans_deleted: u64,
}

pub async fn cmd_health(port: u16) -> Result<()> {
    let status = get_status(&format!("{}/health", base_url(port))).await?;
    if status.is_success() {
        println!("relayd is up.");
    } else {
        println!("relayd responded with {status}.");
        std::process::exit(1);
    }
    Ok(())
}

pub async fn cmd_ready(port: u16) -> Result<()> {
    let status = get_status(&format!("{}/ready", base_url(port))).await?;
    if status.is_success() {
        println!("relayd is ready.");
    } else {
        println!("relayd is not ready ({status}).");
        std::process::exit(1);
    }
    Ok(())
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let snap: MetricsSnapshot = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  udrop relay — status");
    println!("═══════════════════════════════════════");
    println!("  sessions created       : {}", snap.sessions_created);
    println!("  transfers initiated    : {}", snap.transfers_init);
    println!("  transfers completed    : {}", snap.transfers_completed);
    println!("  chunks written         : {}", snap.chunks_written);
    println!("  chunk conflicts        : {}", snap.chunk_conflicts);
    println!("  quota rejections       : {}", snap.quota_rejections);
    println!(
        "  scan verdicts          : clean={} failed={} unavailable={}",
        snap.scan_verdicts_clean, snap.scan_verdicts_failed, snap.scan_verdicts_unavailable
    );
    println!(
        "  sweep deletions        : sessions={} transfers={} scans={}",
        snap.sweep_sessions_deleted, snap.sweep_transfers_deleted, snap.sweep_scans_deleted
    );

    Ok(())
}

//! CLI command implementations

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use console::style;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::warn;

use kino_pipeline::{BufferHealth, PipelineConfig, PlayerEvent};

use crate::output::{to_json, OutputFormat};
use crate::simulate::{self, Outcome, SimulationOptions, SimulationReport};

/// Run a synthetic session; Ctrl-C aborts it and still prints the report
pub async fn simulate(options: SimulationOptions, format: &str) -> anyhow::Result<()> {
    let format = OutputFormat::from(format);
    let cancel = Arc::new(AtomicBool::new(false));

    let show_progress = format != OutputFormat::Json;
    let worker_cancel = Arc::clone(&cancel);
    let mut session = tokio::task::spawn_blocking(move || simulate::run(options, worker_cancel, show_progress));

    let report = tokio::select! {
        result = &mut session => result.context("simulation task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, aborting session");
            cancel.store(true, Ordering::Release);
            session.await.context("simulation task panicked")??
        }
    };

    match format {
        OutputFormat::Json => println!("{}", to_json(&report)),
        OutputFormat::Table => print_table(&report),
        OutputFormat::Text => print_text(&report),
    }

    if report.outcome == Outcome::Failed {
        anyhow::bail!("session failed: {} error(s) reported", report.errors.len());
    }
    Ok(())
}

/// Print the default configuration, or validate a configuration file
pub async fn config(path: Option<PathBuf>, format: &str) -> anyhow::Result<()> {
    let Some(path) = path else {
        println!("{}", PipelineConfig::default().to_json());
        return Ok(());
    };

    let config = PipelineConfig::from_json_file(&path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", config.to_json()),
        OutputFormat::Text | OutputFormat::Table => {
            println!("{} {}", style("✓").green(), path.display());
            println!("  Ring capacity:        {} fragments", config.ring_capacity());
            println!("  Green threshold:      {:.1}s", config.green_threshold());
            println!("  Monitor:              {:?} delay, {:?} interval", config.monitor_delay(), config.monitor_interval());
            println!("  Network timeout:      {:?}", config.network_timeout());
            println!("  Discontinuity timeout: {:?}", config.discontinuity_timeout());
            println!("  Low latency:          {}", config.low_latency_mode);
        }
    }
    Ok(())
}

// ============================================================================
// Report rendering
// ============================================================================

#[derive(Tabled)]
struct TrackRow {
    #[tabled(rename = "Track")]
    track: String,
    #[tabled(rename = "Delivered")]
    delivered: usize,
    #[tabled(rename = "Injected (s)")]
    injected: String,
    #[tabled(rename = "Bytes")]
    bytes: u64,
    #[tabled(rename = "Discontinuities")]
    discontinuities: usize,
    #[tabled(rename = "Health")]
    health: String,
    #[tabled(rename = "EOS")]
    eos: bool,
}

fn health_label(health: BufferHealth) -> String {
    match health {
        BufferHealth::Green => style(health).green().to_string(),
        BufferHealth::Yellow => style(health).yellow().to_string(),
        BufferHealth::Red => style(health).red().to_string(),
    }
}

fn outcome_label(outcome: Outcome) -> String {
    match outcome {
        Outcome::Completed => style(outcome).green().bold().to_string(),
        Outcome::Cancelled | Outcome::TimedOut => style(outcome).yellow().bold().to_string(),
        Outcome::Failed => style(outcome).red().bold().to_string(),
    }
}

fn print_header(report: &SimulationReport) {
    println!("\n{}", style("Simulated Session").bold());
    println!("  Session:   {}", report.session_id);
    println!("  Protocol:  {}  rate {}", report.protocol, report.rate);
    println!("  Outcome:   {} in {} ms", outcome_label(report.outcome), report.elapsed_ms);
    println!(
        "  Profile:   #{} ({} bps)",
        report.final_profile, report.final_bandwidth_bps
    );
    println!("  Health:    {}", health_label(report.worst_health()));
}

fn print_footer(report: &SimulationReport) {
    let m = &report.metrics;
    println!("\nMetrics:");
    println!("  Injected fragments:      {}", m.injected_fragments);
    println!("  Bitrate changes:         {}", m.bitrate_changes);
    println!("  Buffer health changes:   {}", m.buffer_health_changes);
    println!("  Ramp downs:              {}", m.ramp_downs);
    println!("  Discontinuities applied: {}", m.applied_discontinuities);
    println!("  Discontinuities ignored: {}", m.ignored_discontinuities);
    println!("  Discarded fragments:     {}", m.discarded_fragments);
    println!("  Rewrite failures:        {}", m.rewrite_failures);
    println!("  Retunes requested:       {}", report.retunes);

    for record in &report.events {
        if let PlayerEvent::BitrateChanged {
            profile_index,
            bandwidth_bps,
            reason,
            position,
        } = &record.event
        {
            println!("  @{position:>7.2}s bitrate -> #{profile_index} ({bandwidth_bps} bps, {reason})");
        }
    }

    for error in &report.errors {
        println!("{} {}", style("✗").red(), error);
    }
}

fn print_text(report: &SimulationReport) {
    print_header(report);
    println!("\nTracks:");
    for track in &report.tracks {
        let snapshot = &track.snapshot;
        println!(
            "  {:<9} {:>4} delivered  {:>8.2}s injected  {:>6.2}s fetched  {}",
            snapshot.track.to_string(),
            track.delivered,
            snapshot.stats.total_injected_duration,
            snapshot.stats.total_fetched_duration,
            health_label(snapshot.health),
        );
    }
    for fetcher in &report.fetchers {
        if fetcher.failures > 0 {
            if let Some(track) = fetcher.track {
                println!(
                    "  {track} fetcher: {} failures, {} retried, {} skipped",
                    fetcher.failures, fetcher.retries, fetcher.skipped
                );
            }
        }
    }
    print_footer(report);
}

fn print_table(report: &SimulationReport) {
    print_header(report);
    let rows: Vec<TrackRow> = report
        .tracks
        .iter()
        .map(|t| TrackRow {
            track: t.snapshot.track.to_string(),
            delivered: t.delivered,
            injected: format!("{:.2}", t.snapshot.stats.total_injected_duration),
            bytes: t.bytes,
            discontinuities: t.discontinuities_applied,
            health: t.snapshot.health.to_string(),
            eos: t.end_of_stream_signalled,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("\n{table}");
    print_footer(report);
}

//! Tor v3 Vanity Onion Address Generator CLI
//!
//! Usage:
//!   onion-vanity myname                 # Find an address starting with "myname"
//!   onion-vanity food:suffix            # Find an address ending with "food"
//!   onion-vanity cafe -t anywhere -n 5  # Find 5 keys with "cafe" anywhere
//!   onion-vanity abc xyz2d:suffix       # Search several patterns at once

use std::process;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use onion_vanity::search::StatsSnapshot;
use onion_vanity::{Config, KeyStore, SearchController, SearchEvent, SearchState};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        process::exit(1);
    }

    // validate() already proved the patterns parse.
    let patterns = match config.pattern_set() {
        Ok(patterns) => patterns,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    let store = match KeyStore::open(&config.dst) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    // Rough per-core rate for an unaccelerated search, shaded by how
    // much of each address the patterns need to examine. Replaced by
    // the measured rate once the search is running.
    let assumed_rate =
        50_000.0 * config.worker_count() as f64 / patterns.comparison_cost().max(1.0);

    println!("Tor v3 Vanity Onion Address Generator");
    println!("=====================================");
    for pattern in patterns.patterns() {
        println!(
            "Pattern:    {} (estimated: {})",
            pattern,
            pattern.difficulty_description(assumed_rate)
        );
    }
    println!("Workers:    {}", config.worker_count());
    println!("Output:     {}", store.dir().display());
    if config.count > 0 {
        println!("Target:     {} key(s) per pattern", config.count);
    } else {
        println!("Target:     unlimited (run until stopped)");
    }
    println!();

    // Kept for one retry when a save fails mid-search.
    let retry_store = store.clone();

    let mut controller = SearchController::new(
        patterns,
        store,
        config.mode,
        config.backend_options(),
        config.count,
    );

    let stop_flag = controller.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        stop_flag.store(true, std::sync::atomic::Ordering::Relaxed);
    }) {
        eprintln!("Failed to set Ctrl-C handler: {}", e);
        process::exit(1);
    }

    if let Err(e) = controller.start() {
        eprintln!("Failed to start search: {}", e);
        process::exit(1);
    }

    println!("Searching... (Press Ctrl+C to stop)\n");

    let report_interval = Duration::from_secs(config.report_interval.max(1));
    let mut found = 0usize;

    while controller.state() == SearchState::Running {
        match controller.poll(report_interval) {
            Some(SearchEvent::Found { found: key, path }) => {
                found += 1;
                println!("=== Match #{} ===", found);
                println!("Address:  {}", key.address);
                println!("Pattern:  {}", key.pattern);
                println!("Key file: {}", path.display());
                println!();
            }
            Some(SearchEvent::PersistFailed { found: key, error }) => {
                eprintln!("Failed to save key for {}: {}", key.address, error);
                match retry_store.save(&key) {
                    Ok(path) => {
                        found += 1;
                        println!("Key file (after retry): {}", path.display());
                        println!();
                    }
                    Err(e) => {
                        eprintln!("Retry failed: {}", e);
                        eprintln!("Seed (hex): {}", hex::encode(key.keypair.seed()));
                    }
                }
            }
            Some(SearchEvent::BackendFailed) => {
                eprintln!("All workers exited unexpectedly; stopping.");
            }
            None => print_progress(&controller),
        }
    }

    // Drain anything found between the stop signal and worker exit.
    while let Some(event) = controller.poll(Duration::ZERO) {
        if let SearchEvent::Found { found: key, path } = event {
            found += 1;
            println!("Match: {} -> {}", key.address, path.display());
        }
    }

    match controller.state() {
        SearchState::Completed => println!("\nTarget reached! Found {} key(s).", found),
        _ => println!("\nStopped. Found {} key(s).", found),
    }

    let stats = controller.snapshot();
    println!("\n--- Final Statistics ---");
    println!("Backend:              {}", stats.backend);
    println!("Total keys tested:    {}", format_number(stats.attempts));
    println!("Total matches found:  {}", stats.matches);
    println!("Time elapsed:         {:.2}s", stats.elapsed.as_secs_f64());
    println!(
        "Average speed:        {}/s",
        format_number(stats.keys_per_second as u64)
    );
}

fn print_progress(controller: &SearchController) {
    let StatsSnapshot {
        attempts,
        elapsed,
        keys_per_second,
        ..
    } = controller.snapshot();

    let eta = match controller.estimated_seconds_to_match() {
        Some(secs) => format!(", ~{} to a match", format_duration(secs)),
        None => String::new(),
    };
    println!(
        "[{:>4}s] Tested {} keys ({}/s{})",
        elapsed.as_secs(),
        format_number(attempts),
        format_number(keys_per_second as u64),
        eta
    );
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else if secs < 3_600.0 {
        format!("{:.0}m", secs / 60.0)
    } else if secs < 86_400.0 {
        format!("{:.1}h", secs / 3_600.0)
    } else {
        format!("{:.1}d", secs / 86_400.0)
    }
}

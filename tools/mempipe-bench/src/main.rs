// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mempipe-bench - inter-process throughput benchmark
//!
//! Forks a consumer, pins both processes, and streams fixed-size messages
//! through one of the mempipe transports.

mod driver;
mod harness;
mod stats;

use clap::Parser;
use colored::*;
use driver::{BenchParams, DataMode, Report, Transport};
use harness::CpuPair;
use mempipe::config::DEFAULT_MESSAGE_SIZE;
use mempipe::shm::DEFAULT_DEFERRED_BATCH;
use stats::Summary;

/// Shared-memory transport throughput benchmark
#[derive(Parser, Debug)]
#[command(name = "mempipe-bench")]
#[command(version = "0.1.0")]
#[command(about = "Measure inter-process message throughput over shared memory")]
struct Args {
    /// Transport: ring-spin, ring-futex, extent-pipe
    #[arg(short, long, default_value = "ring-futex")]
    transport: Transport,

    /// Payload size in bytes
    #[arg(short = 's', long, default_value_t = DEFAULT_MESSAGE_SIZE)]
    size: usize,

    /// Number of messages
    #[arg(short = 'c', long, default_value = "100000")]
    count: u64,

    /// Payload production: in-place, external, no-data
    #[arg(short, long, default_value = "in-place")]
    mode: DataMode,

    /// CPU for the consumer (child)
    #[arg(long)]
    first_cpu: Option<usize>,

    /// CPU for the producer (parent)
    #[arg(long)]
    second_cpu: Option<usize>,

    /// NUMA node to bind the shared region to
    #[arg(long)]
    numa_node: Option<u32>,

    /// Deferred header writes held by the futex strategy (0 = none)
    #[arg(long, default_value_t = DEFAULT_DEFERRED_BATCH)]
    deferred_batch: u32,

    /// Spin polls between scheduler yields for ring-spin (0 = never yield)
    #[arg(long, default_value_t = 0)]
    spin_yield: u32,

    /// Check every payload byte in the consumer
    #[arg(long)]
    verify: bool,

    /// Record and summarise per-message timings
    #[arg(long)]
    per_iter: bool,

    /// Only print the result line
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    // Initialize logger for RUST_LOG-based debug output
    env_logger::init();

    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.count == 0 {
        return Err("count must be at least 1".into());
    }
    let params = BenchParams {
        transport: args.transport,
        size: args.size,
        count: args.count,
        mode: args.mode,
        verify: args.verify,
        per_iter: args.per_iter,
        numa_node: args.numa_node,
        deferred_batch: args.deferred_batch,
        spin_yield: Some(args.spin_yield).filter(|&n| n > 0),
    };
    let cpus = CpuPair {
        first: args.first_cpu,
        second: args.second_cpu,
    };

    if !args.quiet {
        eprintln!(
            "{} {} ({} x {} bytes, {:?})",
            ">>>".green().bold(),
            args.transport,
            args.count,
            args.size,
            args.mode
        );
    }

    let report = driver::run(&params, cpus)?;
    print_results(args, &report);
    Ok(())
}

fn print_results(args: &Args, report: &Report) {
    let secs = report.elapsed.as_secs_f64();
    // Result line: name size count seconds-per-message
    println!(
        "{} {} {} {:e}",
        args.transport,
        args.size,
        args.count,
        secs / args.count as f64
    );
    if args.quiet {
        return;
    }

    let bytes = args.size as f64 * args.count as f64;
    println!(
        "  {} {:.1} MB/s ({:.0} msg/s)",
        "Throughput:".cyan(),
        bytes / secs / 1e6,
        args.count as f64 / secs
    );
    println!("  {} {:.3}s", "Duration:".cyan(), secs);
    println!(
        "  {} {:.3}",
        "Waits/msg:".cyan(),
        report.metrics.waits_per_message()
    );

    if args.per_iter {
        match stats::summarise(&report.per_iter_ns) {
            Some(summary) => print_summary(&summary),
            None => println!("  {}", "Too few samples for a summary".yellow()),
        }
    }
}

fn print_summary(s: &Summary) {
    println!();
    println!("{}", "--- Per message (nanoseconds) ---".dimmed());
    println!("  {} {}", "Samples:".white(), s.samples);
    println!("  {} {:>12.1}", "Mean:".yellow(), s.mean);
    println!("  {} {:>12.1}", "Stddev:".yellow(), s.stddev);
    println!(
        "  {} {:.0} / {:.0} / {:.0} / {:.0} / {:.0} / {:.0}",
        "Quintiles:".white(),
        s.quintiles[0],
        s.quintiles[1],
        s.quintiles[2],
        s.quintiles[3],
        s.quintiles[4],
        s.quintiles[5]
    );
    println!("  {} {:>12.1}", "p5:".white(), s.p5);
    println!("  {} {:>12.1}", "Median:".white(), s.median);
    println!("  {} {:>12.1}", "p95:".white(), s.p95);
    println!("  {} {:>12.1}", "p99:".red(), s.p99);
}

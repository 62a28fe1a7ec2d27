use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shuffle_merge::io::write_bin;
use shuffle_merge::{Admission, MergeConfig, MergeCoordinator};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Simulated reduce-side shuffle: fetcher threads pull synthetic map outputs
/// through the merge coordinator, then the merged stream is checked for order.
#[derive(Parser, Debug)]
struct Args {
    /// Shuffle memory budget in bytes
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    memory_bytes: u64,
    #[arg(long, default_value_t = 0.70)]
    usable_fraction: f64,
    #[arg(long, default_value_t = 0.66)]
    merge_fraction: f64,
    #[arg(long, default_value_t = 0.25)]
    segment_fraction: f64,
    #[arg(long, default_value_t = 10)]
    merge_factor: usize,
    /// Number of map outputs to fetch
    #[arg(long, default_value_t = 400)]
    maps: usize,
    /// Mean records per map output
    #[arg(long, default_value_t = 2000)]
    records_per_map: usize,
    /// Every Nth map output is oversized and goes straight to disk (0 = never)
    #[arg(long, default_value_t = 50)]
    oversized_every: usize,
    /// Fetcher threads (default: number of CPUs)
    #[arg(long)]
    fetchers: Option<usize>,
    #[arg(long)]
    spill_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Take the memory settings from BJORN_SHUFFLE_* instead of flags
    #[arg(long)]
    from_env: bool,
    #[arg(long)]
    keep_intermediates: bool,
    /// Also write the merge stats JSON to this file
    #[arg(long)]
    stats_out: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> Result<MergeConfig> {
        let mut cfg = if self.from_env {
            MergeConfig::from_env()?
        } else {
            MergeConfig::new(self.memory_bytes, self.usable_fraction, self.merge_fraction, self.segment_fraction)
                .with_merge_factor(self.merge_factor)
                .with_keep_intermediates(self.keep_intermediates)
        };
        if let Some(dir) = &self.spill_dir { cfg.spill_dir = dir.clone(); }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// One map's sorted output for this reducer's partition.
fn map_output(seed: u64, map: usize, records: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed ^ (map as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let mut keys: Vec<u64> = (0..records).map(|_| rng.gen()).collect();
    keys.sort_unstable();
    let mut buf = Vec::new();
    for (i, k) in keys.iter().enumerate() {
        write_bin(&mut buf, format!("{:016x}", k).as_bytes(), format!("m{}:{}", map, i).as_bytes());
    }
    buf
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    let config = args.config()?;
    let fetchers = args.fetchers.unwrap_or_else(num_cpus::get).max(1);
    let t0 = Instant::now();

    let coordinator = Arc::new(MergeCoordinator::new(config)?);
    let next_map = Arc::new(AtomicUsize::new(0));
    let records_sent = Arc::new(AtomicU64::new(0));
    let backoffs = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..fetchers)
        .map(|f| {
            let coordinator = coordinator.clone();
            let next_map = next_map.clone();
            let records_sent = records_sent.clone();
            let backoffs = backoffs.clone();
            let (seed, maps, per_map, oversized_every) = (args.seed, args.maps, args.records_per_map, args.oversized_every);
            thread::Builder::new().name(format!("fetcher-{}", f)).spawn(move || -> Result<()> {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(f as u64));
                loop {
                    let map = next_map.fetch_add(1, Ordering::Relaxed);
                    if map >= maps { return Ok(()); }
                    let records = if oversized_every > 0 && map % oversized_every == oversized_every - 1 {
                        per_map * 80
                    } else {
                        rng.gen_range(per_map / 2..=per_map * 3 / 2)
                    };
                    let bytes = map_output(seed, map, records);
                    let mut delay = Duration::from_millis(1);
                    let mut segment = loop {
                        match coordinator.reserve(bytes.len() as u64) {
                            Admission::Granted(seg) => break seg,
                            Admission::Wait => {
                                backoffs.fetch_add(1, Ordering::Relaxed);
                                thread::sleep(delay);
                                delay = (delay * 2).min(Duration::from_millis(50));
                            }
                        }
                    };
                    segment.write(&bytes).with_context(|| format!("write map {}", map))?;
                    let origin = segment.origin();
                    coordinator.commit(segment)?;
                    records_sent.fetch_add(records as u64, Ordering::Relaxed);
                    debug!(map, records, bytes = bytes.len(), %origin, "map output fetched");
                }
            })
        })
        .collect::<std::io::Result<_>>()
        .context("spawn fetcher threads")?;
    for h in handles {
        match h.join() {
            Ok(res) => res?,
            Err(_) => bail!("fetcher thread panicked"),
        }
    }
    let t_fetch = t0.elapsed();
    info!(maps = args.maps, fetchers, fetch_ms = t_fetch.as_millis() as u64, "all map outputs fetched");

    let t_merge0 = Instant::now();
    let records = coordinator.close()?.into_records()?;
    let mut prev: Option<Vec<u8>> = None;
    let mut records_out = 0u64;
    for record in records {
        let (key, _value) = record?;
        if let Some(p) = &prev {
            if p > &key { bail!("merged output out of order at record {}", records_out); }
        }
        prev = Some(key);
        records_out += 1;
    }
    let sent = records_sent.load(Ordering::Relaxed);
    if records_out != sent { bail!("lost records: fetched {} merged {}", sent, records_out); }

    let stats = coordinator.stats();
    let spilled = stats.admissions.spilled;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if let Some(path) = &args.stats_out { stats.write_json(path)?; }
    eprintln!(
        "shuffle_sim: maps={} records={} spilled_maps={} backoffs={} fetch_ms={} merge_ms={} total_ms={}",
        args.maps,
        records_out,
        spilled,
        backoffs.load(Ordering::Relaxed),
        t_fetch.as_millis(),
        t_merge0.elapsed().as_millis(),
        t0.elapsed().as_millis(),
    );
    Ok(())
}

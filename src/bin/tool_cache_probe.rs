/// Cache Probe Tool
///
/// Exercises a read-through entity cache against a simulated slow backing
/// store and prints the resulting statistics. Useful for eyeballing the
/// single-flight behavior under concurrent load.
///
/// Usage: cargo run --bin tool_cache_probe -- --keys 20 --tasks 64 --latency-ms 40

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::time::{ Duration, Instant };

use anyhow::Result;
use async_trait::async_trait;
use clap::{ Arg, Command };
use rand::Rng;

use tradecache::{ CacheResult, CacheSettings, ChangeType, EntityCache, EntityFetcher };

/// Simulated backing store: fixed latency plus jitter per batch call.
struct SlowQuoteStore {
    quotes: HashMap<String, f64>,
    latency: Duration,
    batches: AtomicUsize,
    keys_served: AtomicUsize,
}

#[async_trait]
impl EntityFetcher<String, f64> for SlowQuoteStore {
    async fn fetch_many(&self, keys: &[String]) -> CacheResult<HashMap<String, f64>> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.keys_served.fetch_add(keys.len(), Ordering::Relaxed);

        let jitter = rand::thread_rng().gen_range(0..20);
        tokio::time::sleep(self.latency + Duration::from_millis(jitter)).await;

        Ok(
            keys
                .iter()
                .filter_map(|key| self.quotes.get(key).map(|price| (key.clone(), *price)))
                .collect()
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let matches = Command::new("Cache Probe")
        .version("1.0")
        .about("Exercise a read-through entity cache against a simulated backing store")
        .arg(
            Arg::new("keys")
                .short('k')
                .long("keys")
                .value_name("COUNT")
                .help("Number of distinct symbols in the backing store")
                .default_value("20")
        )
        .arg(
            Arg::new("tasks")
                .short('t')
                .long("tasks")
                .value_name("COUNT")
                .help("Number of concurrent reader tasks")
                .default_value("64")
        )
        .arg(
            Arg::new("latency-ms")
                .short('l')
                .long("latency-ms")
                .value_name("MS")
                .help("Base latency of a backing-store batch call")
                .default_value("40")
        )
        .get_matches();

    let key_count: usize = matches.get_one::<String>("keys").unwrap().parse()?;
    let task_count: usize = matches.get_one::<String>("tasks").unwrap().parse()?;
    let latency_ms: u64 = matches.get_one::<String>("latency-ms").unwrap().parse()?;

    let quotes: HashMap<String, f64> = (0..key_count)
        .map(|i| (format!("SYM{}", i), 100.0 + (i as f64)))
        .collect();
    let backing = Arc::new(SlowQuoteStore {
        quotes,
        latency: Duration::from_millis(latency_ms),
        batches: AtomicUsize::new(0),
        keys_served: AtomicUsize::new(0),
    });

    let fetcher: Arc<dyn EntityFetcher<String, f64>> = backing.clone();
    let cache = Arc::new(EntityCache::new(CacheSettings::price_lookups(), fetcher)?);

    log::info!(
        "probing with {} symbols, {} tasks, {}ms base latency",
        key_count,
        task_count,
        latency_ms
    );

    let started = Instant::now();
    let mut handles = Vec::new();
    for task_id in 0..task_count {
        let cache = Arc::clone(&cache);
        handles.push(
            tokio::spawn(async move {
                let mut served = 0usize;
                for round in 0..8usize {
                    let key = format!("SYM{}", (task_id * 7 + round * 3) % key_count);
                    match cache.get(key).await {
                        Ok(_) => {
                            served += 1;
                        }
                        Err(e) if e.is_recoverable() => {
                            log::warn!("transient fetch failure: {}", e);
                        }
                        Err(e) => {
                            log::error!("lookup failed: {}", e);
                        }
                    }
                }
                served
            })
        );
    }

    let results = futures::future::join_all(handles).await;
    let served: usize = results
        .into_iter()
        .filter_map(|result| result.ok())
        .sum();
    let elapsed = started.elapsed();

    // Exercise the invalidation path once before sampling stats.
    cache.notify_changed(vec!["SYM0".to_string()], ChangeType::Updated);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = cache.stats();
    println!("── cache probe results ──────────────────────────");
    println!("reads served:        {} in {:.2?}", served, elapsed);
    println!("backing batches:     {}", backing.batches.load(Ordering::Relaxed));
    println!("backing keys served: {}", backing.keys_served.load(Ordering::Relaxed));
    println!("hits:                {}", stats.hits);
    println!("misses:              {}", stats.misses);
    println!("hit rate:            {:.1}%", stats.hit_rate() * 100.0);
    println!("evictions:           {}", stats.evictions);
    println!("dropped changes:     {}", stats.dropped_notifications);
    println!("items cached:        {}", stats.items);

    cache.shutdown().await;
    Ok(())
}

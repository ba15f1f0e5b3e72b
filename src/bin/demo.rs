use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use lsmkv::client::Client;
use rand::{distr::Uniform, prelude::*, rngs::StdRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{task, time::Instant};

// Durations of the requests are saved into the array of atomics. The index of the entry
// is effectively a duration in milliseconds here and the value is amount of requests
// finished in the given milliseconds.
const DURATIONS_SIZE: usize = 1024;

#[derive(Parser)]
#[clap(about = "Write-heavy load generator for the key-value server")]
struct Args {
    #[clap(short, long, default_value = "30")]
    clients: usize,

    #[clap(short, long, default_value = "localhost:9999")]
    address: String,

    /// How long to run the load, in seconds.
    #[clap(short, long, default_value = "10")]
    duration: u64,
}

struct Metrics {
    read_requests: AtomicU64,
    write_requests: AtomicU64,
    read_success: AtomicU64,
    write_success: AtomicU64,
    set_durations: Vec<AtomicU64>,
    get_durations: Vec<AtomicU64>,
}

impl Metrics {
    fn new() -> Self {
        Self {
            read_requests: AtomicU64::new(0),
            write_requests: AtomicU64::new(0),
            read_success: AtomicU64::new(0),
            write_success: AtomicU64::new(0),
            set_durations: (0..DURATIONS_SIZE).map(|_| AtomicU64::new(0)).collect(),
            get_durations: (0..DURATIONS_SIZE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn read_requests(&self) -> u64 {
        self.read_requests.load(Ordering::Acquire)
    }

    fn write_requests(&self) -> u64 {
        self.write_requests.load(Ordering::Acquire)
    }

    fn read_success(&self) -> u64 {
        self.read_success.load(Ordering::Acquire)
    }

    fn write_success(&self) -> u64 {
        self.write_success.load(Ordering::Acquire)
    }

    fn record_duration(&self, is_write: bool, dur: usize) {
        if dur >= DURATIONS_SIZE {
            return;
        }

        let durations = if is_write {
            &self.set_durations
        } else {
            &self.get_durations
        };
        durations[dur].fetch_add(1, Ordering::Relaxed);
    }

    /// Average in milliseconds over the recorded requests.
    fn average(durations: &[AtomicU64]) -> u64 {
        let (count, total) = durations
            .iter()
            .enumerate()
            .map(|(ms, cnt)| (ms as u64, cnt.load(Ordering::Relaxed)))
            .fold((0, 0), |(count, total), (ms, cnt)| (count + cnt, total + ms * cnt));

        if count > 0 {
            total / count
        } else {
            0
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let metrics = Arc::new(Metrics::new());
    let keys_set = Arc::new(parking_lot::RwLock::new(HashSet::new()));
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(args.clients);

    for _ in 0..args.clients {
        let addr = args.address.clone();
        let metrics = Arc::clone(&metrics);
        let keys_set = Arc::clone(&keys_set);
        let stop = Arc::clone(&stop);

        handles.push(task::spawn(async move {
            let mut client = match Client::connect(&addr).await {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Failed to connect: {}", e);
                    return;
                }
            };

            let key_dist = Uniform::new_inclusive(1, 64).unwrap();
            let val_dist = Uniform::new_inclusive(1, 500).unwrap();
            let mut rng = StdRng::from_os_rng();

            while !stop.load(Ordering::Relaxed) {
                let is_write = rng.random_bool(0.9); // Make it write heavy since we test LSM.
                let reuse_key = rng.random_bool(0.5); // Half of the keys will be reused not fresh generated.

                let key: Bytes = if !is_write || reuse_key {
                    let picked = keys_set.read().iter().choose(&mut rng).cloned();
                    match picked {
                        Some(key) => key,
                        None => {
                            task::yield_now().await;
                            continue;
                        }
                    }
                } else {
                    let len = key_dist.sample(&mut rng);
                    random_printable(&mut rng, len)
                };

                let start_time = Instant::now();
                if is_write {
                    let len = val_dist.sample(&mut rng);
                    let value = random_printable(&mut rng, len);
                    let response = client.set(key.clone(), value).await;
                    metrics.record_duration(true, start_time.elapsed().as_millis() as usize);

                    metrics.write_requests.fetch_add(1, Ordering::Release);
                    if response.is_ok() {
                        keys_set.write().insert(key);
                        metrics.write_success.fetch_add(1, Ordering::Release);
                    }
                } else {
                    let response = client.get(key).await;
                    metrics.record_duration(false, start_time.elapsed().as_millis() as usize);

                    metrics.read_requests.fetch_add(1, Ordering::Release);
                    if let Ok(Some(_)) = response {
                        metrics.read_success.fetch_add(1, Ordering::Release);
                    }
                }
            }
        }));
    }

    let start_time = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    while start_time.elapsed() < Duration::from_secs(args.duration) {
        ticker.tick().await;
        println!(
            "reads: {}/{} writes: {}/{}",
            metrics.read_success(),
            metrics.read_requests(),
            metrics.write_success(),
            metrics.write_requests()
        );
    }

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.await?;
    }

    let total_elapsed = start_time.elapsed();

    println!("Final Stats:");
    println!("Read Requests: {}", metrics.read_requests());
    println!("Write Requests: {}", metrics.write_requests());
    println!("Successful Reads: {}", metrics.read_success());
    println!("Successful Writes: {}", metrics.write_success());
    println!(
        "Average Set Request Time: {} ms",
        Metrics::average(&metrics.set_durations)
    );
    println!(
        "Average Get Request Time: {} ms",
        Metrics::average(&metrics.get_durations)
    );
    println!("Total Elapsed Time: {:.2?}", total_elapsed);

    Ok(())
}

// Keys and values travel in the query string, printable ASCII keeps them readable in the logs.
fn random_printable(rng: &mut StdRng, len: usize) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|_| rng.random_range(32..=126u8))
            .collect::<Vec<u8>>(),
    )
}

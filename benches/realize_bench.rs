use std::sync::Arc;
use std::time::Instant;

use tensorlib::config::{available_queues, QueueKind};
use tensorlib::{Runtime, RuntimeConfig, Tensor};

struct BenchmarkResult {
    device: String,
    numel: usize,
    latency_ms: f64,
    speedup: f64,
}

/// Build a chain of `depth` dependent adds and time realizing its tail.
fn bench_chain(runtime: &Arc<Runtime>, device: &str, numel: usize, depth: usize) -> f64 {
    let data: Vec<f32> = (0..numel).map(|i| i as f32 * 0.5).collect();
    let base = Tensor::from_vec_in(runtime, data, vec![numel], device).unwrap();

    let start = Instant::now();
    let mut tail = (&base + &base).unwrap();
    for _ in 1..depth {
        tail = (&tail + &base).unwrap();
    }
    tail.realize(true).unwrap();
    start.elapsed().as_secs_f64() * 1000.0
}

fn main() {
    let sizes = [1 << 10, 1 << 14, 1 << 18];
    let depth = 16;
    let iterations = 5;

    let mut configs = vec![("cpu".to_string(), RuntimeConfig::software())];
    for queue in available_queues() {
        let label = format!("gpu/{}", queue.name());
        configs.push((label, RuntimeConfig::with_gpu_queue(queue)));
    }
    if !QueueKind::Metal.is_available() {
        println!("Metal not available; gpu runs on the software queue only.\n");
    }

    let mut results = Vec::new();
    for &numel in &sizes {
        let mut baseline = None;
        for (label, config) in &configs {
            let runtime = Runtime::new(config.clone());
            let device = if label == "cpu" { "cpu" } else { "gpu" };

            // Warm up device construction and kernel compilation.
            bench_chain(&runtime, device, numel, 2);
            let total: f64 = (0..iterations)
                .map(|_| bench_chain(&runtime, device, numel, depth))
                .sum();
            let latency_ms = total / iterations as f64;
            let base = *baseline.get_or_insert(latency_ms);

            results.push(BenchmarkResult {
                device: label.clone(),
                numel,
                latency_ms,
                speedup: base / latency_ms,
            });
            runtime.teardown();
        }
    }

    println!(
        "{:<20} {:>10} {:>14} {:>10}",
        "device", "numel", "latency (ms)", "speedup"
    );
    println!("{}", "-".repeat(57));
    for r in &results {
        println!(
            "{:<20} {:>10} {:>14.3} {:>9.2}x",
            r.device, r.numel, r.latency_ms, r.speedup
        );
    }
}

use tensorlib::config::print_device_info;
use tensorlib::{Result, Runtime, RuntimeConfig, Tensor};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== tensorlib ===\n");
    print_device_info();

    let runtime = Runtime::new(RuntimeConfig::default());
    let gpu = runtime.device("gpu")?;
    println!("\ngpu queue: {}", runtime.config().gpu_queue.resolve().name());

    let values: Vec<f32> = (1..=6).map(|v| v as f32).collect();
    let t0 = Tensor::from_vec_in(&runtime, values.clone(), vec![2, 3], "cpu")?;
    let t1 = Tensor::from_vec_in(&runtime, values, vec![2, 3], "cpu")?;
    t0.to("gpu")?;
    t1.to("gpu")?;

    let t2 = (&t0 + &t1)?;
    let t3 = (&t2 * &t0)?;
    t3.realize(false)?;
    println!("t3 state after scheduling: {:?}", t3.state()?);

    t2.to("cpu")?;
    println!("t0 + t1        = {:?}", t2.to_vec::<f32>()?);
    println!("(t0 + t1) * t0 = {:?}", t3.to_vec::<f32>()?);

    let stats = gpu.backend().stats();
    println!(
        "\ngpu: {} submissions, {} completions, {} failures, {} requeues",
        stats.submissions, stats.completions, stats.failures, stats.requeues
    );

    runtime.teardown();
    Ok(())
}

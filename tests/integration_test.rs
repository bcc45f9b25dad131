//! Integration tests driving tensors through both devices

use std::sync::Arc;
use std::thread;

use rand::Rng;
use tensorlib::device::accelerator::SoftwareQueue;
use tensorlib::device::backend::CommandStatus;
use tensorlib::{DType, RealizationState, Runtime, RuntimeConfig, Tensor, TensorError};

fn runtime() -> Arc<Runtime> {
    Runtime::new(RuntimeConfig::software().queue_workers(3))
}

#[test]
fn test_add_on_gpu_and_copy_back() {
    let rt = runtime();
    let values: Vec<f32> = (1..=6).map(|v| v as f32).collect();
    let t0 = Tensor::from_vec_in(&rt, values.clone(), vec![2, 3], "cpu").unwrap();
    let t1 = Tensor::from_vec_in(&rt, values, vec![2, 3], "cpu").unwrap();
    t0.to("gpu").unwrap();
    t1.to("gpu").unwrap();

    let t2 = (&t0 + &t1).unwrap();
    assert_eq!(t2.device_name().unwrap(), "gpu");
    assert_eq!(t2.state().unwrap(), RealizationState::Unrealized);

    t2.to("cpu").unwrap();
    assert_eq!(t2.device_name().unwrap(), "cpu");
    assert_eq!(t2.shape(), &[2, 3]);
    assert_eq!(
        t2.to_vec::<f32>().unwrap(),
        vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0]
    );
}

#[test]
fn test_mixed_devices_rejected() {
    let rt = runtime();
    let a = Tensor::from_vec_in(&rt, vec![1i32, 2], vec![2], "cpu").unwrap();
    let b = Tensor::from_vec_in(&rt, vec![1i32, 2], vec![2], "gpu").unwrap();

    assert!(matches!(&a * &b, Err(TensorError::MixedDevice { .. })));
    assert!(matches!(&b - &a, Err(TensorError::MixedDevice { .. })));
    let gpu = rt.device("gpu").unwrap();
    assert!(gpu.backend().submission_log().is_empty());
}

#[test]
fn test_round_trip_preserves_bytes() {
    let rt = runtime();
    let t = Tensor::from_vec_in(&rt, vec![i64::MIN, -1, 0, 7, i64::MAX], vec![5], "cpu").unwrap();
    let before = t.data().unwrap();
    t.to("gpu").unwrap();
    t.to("cpu").unwrap();
    assert_eq!(t.data().unwrap(), before);
}

#[test]
fn test_gpu_matches_cpu_for_random_inputs() {
    let rt = runtime();
    let mut rng = rand::thread_rng();
    let shape = vec![8, 16];
    let n = 8 * 16;

    // Kept away from zero so the division stays finite.
    let a: Vec<f32> = (0..n)
        .map(|_| rng.gen_range(0.5..100.0) * if rng.gen_bool(0.5) { 1.0 } else { -1.0 })
        .collect();
    let b: Vec<f32> = (0..n).map(|_| rng.gen_range(0.5..100.0)).collect();

    let mut results = Vec::new();
    for device in ["cpu", "gpu"] {
        let ta = Tensor::from_vec_in(&rt, a.clone(), shape.clone(), device).unwrap();
        let tb = Tensor::from_vec_in(&rt, b.clone(), shape.clone(), device).unwrap();
        let sum = (&ta + &tb).unwrap();
        let prod = (&sum * &tb).unwrap();
        let quot = (&prod / &ta).unwrap();
        let out = (-&quot).unwrap();
        results.push(out.to_vec::<f32>().unwrap());
    }
    // Both devices run the same host kernels, so results agree exactly.
    assert_eq!(results[0], results[1]);
}

#[test]
fn test_integer_ops_match_cpu() {
    let rt = runtime();
    let mut rng = rand::thread_rng();
    let a: Vec<i32> = (0..64).map(|_| rng.gen()).collect();
    let b: Vec<i32> = (0..64).map(|_| rng.gen()).collect();

    let mut results = Vec::new();
    for device in ["cpu", "gpu"] {
        let ta = Tensor::from_vec_in(&rt, a.clone(), vec![64], device).unwrap();
        let tb = Tensor::from_vec_in(&rt, b.clone(), vec![64], device).unwrap();
        // Wrapping arithmetic on overflow.
        let out = (&(&ta * &tb).unwrap() + &ta).unwrap();
        results.push(out.to_vec::<i32>().unwrap());
    }
    let expected: Vec<i32> = a
        .iter()
        .zip(&b)
        .map(|(x, y)| x.wrapping_mul(*y).wrapping_add(*x))
        .collect();
    assert_eq!(results[0], expected);
    assert_eq!(results[1], expected);
}

#[test]
fn test_requeue_through_tensor_api() {
    let queue = Arc::new(SoftwareQueue::new(2).unwrap());
    let rt = Runtime::with_queue(RuntimeConfig::software(), queue.clone());
    let a = Tensor::from_vec_in(&rt, vec![1.0f32, 2.0], vec![2], "gpu").unwrap();
    let b = Tensor::from_vec_in(&rt, vec![3.0f32, 4.0], vec![2], "gpu").unwrap();
    let c = (&a + &b).unwrap();

    queue.inject_failures(1);
    assert_eq!(c.to_vec::<f32>().unwrap(), vec![4.0, 6.0]);

    let stats = rt.device("gpu").unwrap().backend().stats();
    assert_eq!(stats.requeues, 1);
    assert_eq!(stats.submissions, 2);
}

#[test]
fn test_two_failures_surface_execution_error() {
    let queue = Arc::new(SoftwareQueue::new(1).unwrap());
    let rt = Runtime::with_queue(RuntimeConfig::software(), queue.clone());
    let a = Tensor::from_vec_in(&rt, vec![1i32], vec![1], "gpu").unwrap();
    let b = (-&a).unwrap();

    queue.inject_failures(2);
    let err = b.realize(true).unwrap_err();
    assert!(err.is_execution());
    assert_eq!(b.state().unwrap(), RealizationState::Failed);
    let gpu = rt.device("gpu").unwrap();
    assert_eq!(gpu.backend().get_cmdbuf_status(b.id()), CommandStatus::Error);
}

#[test]
fn test_chain_submits_operands_first() {
    let rt = runtime();
    let a = Tensor::from_vec_in(&rt, vec![1i64, 2, 3], vec![3], "gpu").unwrap();
    let b = (&a + &a).unwrap();
    let c = (&b * &a).unwrap();
    let d = (&c - &b).unwrap();

    assert_eq!(d.to_vec::<i64>().unwrap(), vec![0, 4, 12]);
    let log = rt.device("gpu").unwrap().backend().submission_log();
    assert_eq!(log, vec![b.id(), c.id(), d.id()]);
}

#[test]
fn test_unregistered_op_leaves_no_record() {
    let rt = runtime();
    let gpu = rt.device("gpu").unwrap();
    let a = Tensor::from_vec_in(&rt, vec![1.0f32], vec![1], "gpu").unwrap();
    let result = tensorlib::TensorId::new(999, 0);

    let err = gpu
        .backend()
        .enqueue_kernel(&[a.id(), a.id()], result, "pow_f32")
        .unwrap_err();
    assert_eq!(err, TensorError::UnsupportedOperation("pow_f32".into()));
    assert!(!gpu.backend().has_invocation(result));
}

#[test]
fn test_concurrent_device_creation() {
    let rt = runtime();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let rt = Arc::clone(&rt);
            let name = if i % 2 == 0 { "cpu" } else { "gpu" };
            thread::spawn(move || rt.device(name).unwrap())
        })
        .collect();
    let devices: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let cpu = rt.device("cpu").unwrap();
    let gpu = rt.device("gpu").unwrap();
    for device in &devices {
        let expected = if device.name() == "cpu" { &cpu } else { &gpu };
        assert!(Arc::ptr_eq(device, expected));
    }
}

#[test]
fn test_deferred_release_keeps_parents_alive() {
    let rt = runtime();
    let a = Tensor::from_vec_in(&rt, vec![2i32, 4], vec![2], "gpu").unwrap();
    let b = Tensor::ones_in(&rt, vec![2], DType::I32, "gpu").unwrap();
    let a_id = a.id();
    let c = (&a - &b).unwrap();
    drop(a);
    drop(b);
    assert_eq!(rt.tensors().len(), 3);

    assert_eq!(c.to_vec::<i32>().unwrap(), vec![1, 3]);
    assert_eq!(rt.tensors().len(), 1);
    assert!(rt.tensors().lookup(a_id).is_err());

    drop(c);
    assert!(rt.tensors().is_empty());
}

#[test]
fn test_dropping_unrealized_result_releases_everything() {
    let rt = runtime();
    let a = Tensor::from_vec_in(&rt, vec![1.0f32, 2.0], vec![2], "gpu").unwrap();
    let b = (&a * &a).unwrap();
    b.realize(false).unwrap();
    drop(a);
    drop(b);
    assert!(rt.tensors().is_empty());
}

#[test]
fn test_moving_pinned_tensor_frees_old_storage() {
    let rt = runtime();
    let cpu = rt.device("cpu").unwrap();
    let gpu = rt.device("gpu").unwrap();
    let a = Tensor::from_vec_in(&rt, vec![1i32, 2, 3], vec![3], "gpu").unwrap();
    let a_id = a.id();
    let c = (&a + &a).unwrap();

    a.to("cpu").unwrap();
    // The pending add still reads the gpu copy.
    assert!(gpu.backend().has_buffer(a_id));

    assert_eq!(c.to_vec::<i32>().unwrap(), vec![2, 4, 6]);
    assert!(!gpu.backend().has_buffer(a_id));
    assert!(cpu.backend().has_buffer(a_id));

    drop(a);
    drop(c);
    assert!(rt.tensors().is_empty());
    assert!(!cpu.backend().has_buffer(a_id));
    assert!(!gpu.backend().has_invocation(a_id));
}

#[test]
fn test_dropping_moved_parent_before_dependent_runs() {
    let rt = runtime();
    let gpu = rt.device("gpu").unwrap();
    let a = Tensor::from_vec_in(&rt, vec![5i64, 6], vec![2], "gpu").unwrap();
    let a_id = a.id();
    let c = (-&a).unwrap();
    let c_id = c.id();

    a.to("cpu").unwrap();
    drop(a);
    drop(c);
    assert!(rt.tensors().is_empty());
    assert!(!gpu.backend().has_buffer(a_id));
    assert!(!gpu.backend().has_invocation(c_id));
}

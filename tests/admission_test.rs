//! Property-style tests for admission hysteresis, driven by seeded random
//! host samples, plus the controller gating the scheduler feeder.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use prometheus_harvest::core::{
    evaluate, AdmissionController, AdmissionState, FeedGate, HostMetrics, Job, SchedulerLimits,
    TaskScheduler, Watermarks,
};
use prometheus_harvest::util::Shutdown;

const SAMPLES: usize = 2_000;

fn sample(rng: &mut StdRng, cpu: (f64, f64), mem: (f64, f64), load: (f64, f64)) -> HostMetrics {
    HostMetrics {
        cpu: rng.random_range(cpu.0..cpu.1),
        mem: rng.random_range(mem.0..mem.1),
        load: rng.random_range(load.0..load.1),
    }
}

#[test]
fn test_single_hot_metric_never_pauses() {
    let w = Watermarks::default();
    let mut rng = StdRng::seed_from_u64(7);
    let controller = AdmissionController::new(w);

    for i in 0..SAMPLES {
        // Rotate which metric swings across its whole range.
        let m = match i % 3 {
            0 => sample(&mut rng, (0.0, 100.0), (0.0, w.high.mem), (0.0, w.high.load)),
            1 => sample(&mut rng, (0.0, w.high.cpu), (0.0, w.mem_ceiling), (0.0, w.high.load)),
            _ => sample(&mut rng, (0.0, w.high.cpu), (0.0, w.high.mem), (0.0, 400.0)),
        };
        assert_eq!(controller.observe(m), AdmissionState::Running, "flipped on {m:?}");
    }
    assert_eq!(controller.stats().pauses, 0);
    assert_eq!(controller.stats().samples, SAMPLES as u64);
}

#[test]
fn test_pause_requires_two_high_metrics_or_memory_ceiling() {
    let w = Watermarks::default();
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..SAMPLES {
        let m = sample(&mut rng, (0.0, 100.0), (0.0, 100.0), (0.0, 150.0));
        let high = [m.cpu > w.high.cpu, m.mem > w.high.mem, m.load > w.high.load]
            .into_iter()
            .filter(|h| *h)
            .count();
        let expected = if high >= 2 || m.mem > w.mem_ceiling {
            AdmissionState::Paused
        } else {
            AdmissionState::Running
        };
        assert_eq!(evaluate(AdmissionState::Running, m, &w), expected, "{m:?}");
    }
}

#[test]
fn test_resume_requires_every_metric_below_low_water() {
    let w = Watermarks::default();
    let mut rng = StdRng::seed_from_u64(1234);

    for _ in 0..SAMPLES {
        let m = sample(&mut rng, (0.0, 100.0), (0.0, 100.0), (0.0, 150.0));
        let calm = m.cpu < w.low.cpu && m.mem < w.low.mem && m.load < w.low.load;
        let next = evaluate(AdmissionState::Paused, m, &w);
        assert_eq!(next == AdmissionState::Running, calm, "{m:?}");
    }
}

#[test]
fn test_dead_band_never_flaps() {
    let w = Watermarks::default();
    let mut rng = StdRng::seed_from_u64(99);
    let band = |rng: &mut StdRng| {
        sample(
            rng,
            (w.low.cpu, w.high.cpu),
            (w.low.mem, w.high.mem),
            (w.low.load, w.high.load),
        )
    };

    let controller = AdmissionController::new(w);
    for _ in 0..SAMPLES / 2 {
        assert_eq!(controller.observe(band(&mut rng)), AdmissionState::Running);
    }
    controller.observe(HostMetrics {
        cpu: 99.0,
        mem: 99.0,
        load: 99.0,
    });
    for _ in 0..SAMPLES / 2 {
        assert_eq!(controller.observe(band(&mut rng)), AdmissionState::Paused);
    }
    let stats = controller.stats();
    assert_eq!((stats.pauses, stats.resumes), (1, 0));
}

#[test]
fn test_paused_controller_holds_back_the_feeder() {
    let shutdown = Shutdown::new();
    let controller = Arc::new(AdmissionController::new(Watermarks::default()));
    controller.force_pause();

    let scheduler = Arc::new(TaskScheduler::new(
        SchedulerLimits {
            normal_capacity: 4,
            feed_chunk: 2,
        },
        shutdown.clone(),
    ));
    scheduler.extend((0..6).filter_map(|i| Job::new(i as u64 + 1, i, vec![format!("t-{i}")])));
    let gate: Arc<dyn FeedGate> = controller.clone();
    let feeder = scheduler.spawn_feeder(gate).unwrap();

    thread::sleep(Duration::from_millis(150));
    assert_eq!(scheduler.stats().normal_depth, 0);
    assert_eq!(scheduler.stats().backlog, 6);

    // Samples are ignored while a forced pause holds.
    controller.observe(HostMetrics::default());
    assert_eq!(controller.state(), AdmissionState::Paused);

    controller.force_resume();
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut drained = 0;
    while drained < 6 && Instant::now() < deadline {
        if scheduler.try_next().is_some() {
            drained += 1;
        } else {
            thread::sleep(Duration::from_millis(5));
        }
    }
    assert_eq!(drained, 6);

    shutdown.stop();
    scheduler.stop();
    feeder.join().unwrap();
}

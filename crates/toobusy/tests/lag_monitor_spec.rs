//! Deterministic lag monitor behaviour on a paused Tokio clock
//!
//! With the clock paused, advancing it past the sampler's deadline makes the
//! tick fire exactly that much late, so raw lag values are known in advance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use toobusy::{LagConfig, LagMonitor, ToobusyError};

const EPSILON: f64 = 1e-6;

/// Give the sampler a chance to run (arm, fire or re-arm)
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Move the clock forward and let the sampler observe it
async fn advance_ms(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

async fn spawn_armed(config: LagConfig) -> LagMonitor {
    let monitor = LagMonitor::spawn(config).unwrap();
    settle().await;
    monitor
}

fn fast_config() -> LagConfig {
    LagConfig {
        max_lag_ms: 10.0,
        interval_ms: 100.0,
        ..Default::default()
    }
}

fn recording_listener(monitor: &LagMonitor, threshold: Option<f64>) -> Arc<Mutex<Vec<f64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    monitor.on_lag(move |lag| sink.lock().unwrap().push(lag), threshold);
    seen
}

#[tokio::test(start_paused = true)]
async fn test_monitor_starts_with_defaults() {
    // Given: A monitor with default configuration
    let monitor = LagMonitor::spawn(LagConfig::default()).unwrap();

    // Then: It is running with the documented defaults and no lag
    assert!(monitor.started());
    assert_eq!(monitor.max_lag(), 70.0);
    assert_eq!(monitor.interval(), 500.0);
    assert_eq!(monitor.smoothing_factor_on_rise(), 1.0 / 3.0);
    assert_eq!(monitor.smoothing_factor_on_fall(), 1.0 - 1.0 / 3.0);
    assert_eq!(monitor.current_lag(), 0.0);
    assert!(!monitor.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_spawn_rejects_invalid_config() {
    let config = LagConfig {
        max_lag_ms: 9.0,
        ..Default::default()
    };

    let result = LagMonitor::spawn(config);

    assert!(matches!(result, Err(ToobusyError::OutOfRange { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_late_tick_rises_then_falls() {
    // Given: A 100ms sampler
    let monitor = spawn_armed(fast_config()).await;

    // When: The first tick fires 100ms late
    advance_ms(200).await;

    // Then: A third of the raw lag is absorbed
    assert!((monitor.current_lag() - 100.0 / 3.0).abs() < EPSILON);
    assert!(monitor.is_busy());
    assert_eq!(monitor.lag_ms(), 33);

    // When: The next tick is on time
    advance_ms(100).await;

    // Then: Two thirds of the excess drains away
    assert!((monitor.current_lag() - 100.0 / 9.0).abs() < EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_on_time_ticks_stay_at_zero() {
    let monitor = spawn_armed(fast_config()).await;

    for _ in 0..5 {
        advance_ms(100).await;
    }

    assert_eq!(monitor.current_lag(), 0.0);
    assert_eq!(monitor.snapshot().samples, 5);
}

#[tokio::test(start_paused = true)]
async fn test_no_dampening_tracks_raw_lag() {
    // Given: Smoothing disabled in both directions
    let monitor = spawn_armed(fast_config()).await;
    monitor.set_smoothing_factor_on_rise(1.0).unwrap();
    monitor.set_smoothing_factor_on_fall(1.0).unwrap();

    // Then: Every tick reports exactly its own raw lag
    for late_by in [30, 5, 0, 45] {
        advance_ms(100 + late_by).await;
        assert!((monitor.current_lag() - late_by as f64).abs() < EPSILON);
    }
    assert!(monitor.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_larger_dampening_needs_more_ticks() {
    // Given: A heavily damped rise
    let monitor = spawn_armed(LagConfig {
        max_lag_ms: 10.0,
        interval_ms: 50.0,
        ..Default::default()
    })
    .await;
    monitor.set_smoothing_factor_on_rise(0.05).unwrap();

    // When: Every tick is 50ms late
    let mut ticks = 0;
    while !monitor.is_busy() {
        advance_ms(100).await;
        ticks += 1;
        assert!(ticks < 20, "monitor never became busy");
    }

    // Then: Busy only after the fifth tick
    assert_eq!(ticks, 5);
}

#[tokio::test(start_paused = true)]
async fn test_listener_without_threshold_fires_every_qualifying_tick() {
    let monitor = spawn_armed(fast_config()).await;
    let seen = recording_listener(&monitor, None);

    for _ in 0..3 {
        advance_ms(160).await;
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|lag| *lag > 10.0));
    assert!(seen.windows(2).all(|w| w[1] > w[0]));
}

#[tokio::test(start_paused = true)]
async fn test_listener_above_induced_lag_never_fires() {
    let monitor = spawn_armed(fast_config()).await;
    let quiet = recording_listener(&monitor, Some(100.0));
    let loud = recording_listener(&monitor, Some(5.0));

    for _ in 0..6 {
        advance_ms(150).await;
    }

    assert!(quiet.lock().unwrap().is_empty());
    assert_eq!(loud.lock().unwrap().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_default_threshold_follows_max_lag_changes() {
    // Given: A listener using the monitor's max lag
    let monitor = spawn_armed(LagConfig {
        interval_ms: 100.0,
        ..Default::default()
    })
    .await;
    let seen = recording_listener(&monitor, None);

    // When: Lag settles around 30ms under the default 70ms threshold
    monitor.set_smoothing_factor_on_rise(1.0).unwrap();
    advance_ms(130).await;
    assert!(seen.lock().unwrap().is_empty());

    // Then: Lowering max lag makes the same load qualify on the next tick
    monitor.set_max_lag(20.0).unwrap();
    advance_ms(130).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!((seen[0] - 30.0).abs() < EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_ticks_and_listeners() {
    // Given: A busy monitor with a listener
    let monitor = spawn_armed(fast_config()).await;
    let seen = recording_listener(&monitor, None);
    advance_ms(200).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    let frozen = monitor.current_lag();

    // When: Shutting down, then continuing to generate lag
    monitor.shutdown();
    for _ in 0..3 {
        advance_ms(300).await;
    }

    // Then: Nothing fires, the lag is frozen and listeners are gone
    assert!(!monitor.started());
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(monitor.current_lag(), frozen);
    assert_eq!(monitor.listener_count(), 0);

    // Idempotent
    monitor.shutdown();
    assert!(!monitor.started());
}

#[tokio::test(start_paused = true)]
async fn test_listener_may_shut_down_the_monitor() {
    // Given: A first listener that shuts the monitor down, and a second one
    let monitor = Arc::new(spawn_armed(fast_config()).await);
    let stopper = Arc::downgrade(&monitor);
    monitor.on_lag(
        move |_| {
            if let Some(monitor) = stopper.upgrade() {
                monitor.shutdown();
            }
        },
        None,
    );
    let later = recording_listener(&monitor, None);

    // When: A qualifying tick fires
    advance_ms(200).await;
    advance_ms(200).await;

    // Then: The pass stops at the shutdown and nothing fires afterwards
    assert!(!monitor.started());
    assert!(later.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_listener_does_not_stop_sampling() {
    let monitor = spawn_armed(fast_config()).await;
    monitor.on_lag(|_| panic!("listener failure"), None);
    let after = recording_listener(&monitor, None);

    advance_ms(200).await;
    advance_ms(200).await;

    assert!(monitor.started());
    assert_eq!(after.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_removed_listener_stops_firing() {
    let monitor = spawn_armed(fast_config()).await;
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let id = monitor.on_lag(
        move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        },
        None,
    );

    advance_ms(200).await;
    assert!(monitor.remove_listener(id));
    advance_ms(200).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reset_returns_to_baseline_immediately() {
    let monitor = spawn_armed(fast_config()).await;
    advance_ms(250).await;
    assert!(monitor.current_lag() > 0.0);

    // When: Resetting before any further tick
    monitor.reset();

    // Then: The baseline is visible at once and the schedule keeps going
    assert_eq!(monitor.current_lag(), 0.0);
    assert!(!monitor.is_busy());
    assert!(monitor.started());

    advance_ms(130).await;
    assert!((monitor.current_lag() - 10.0).abs() < EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_set_interval_resets_lag_and_rearms() {
    // Given: Accumulated lag on a 100ms cadence
    let monitor = spawn_armed(fast_config()).await;
    advance_ms(250).await;
    assert!(monitor.current_lag() > 0.0);

    // When: Switching to a 50ms cadence
    assert_eq!(monitor.set_interval(50.0), Ok(50.0));
    assert_eq!(monitor.current_lag(), 0.0);
    settle().await;

    // Then: The next tick is measured against the new period
    advance_ms(80).await;
    assert!((monitor.current_lag() - 10.0).abs() < EPSILON);
    assert_eq!(monitor.interval(), 50.0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_updates_keep_previous_values() {
    let monitor = spawn_armed(fast_config()).await;

    assert!(matches!(
        monitor.set_max_lag(9.0),
        Err(ToobusyError::OutOfRange { .. })
    ));
    assert!(matches!(
        monitor.set_max_lag(f64::NAN),
        Err(ToobusyError::InvalidArgument { .. })
    ));
    assert!(monitor.set_interval(15.0).is_err());
    for bad in [0.0, 2.0, -1.0] {
        assert!(monitor.set_smoothing_factor_on_rise(bad).is_err());
        assert!(monitor.set_smoothing_factor_on_fall(bad).is_err());
    }

    assert_eq!(monitor.max_lag(), 10.0);
    assert_eq!(monitor.interval(), 100.0);
    assert_eq!(monitor.smoothing_factor_on_rise(), 1.0 / 3.0);

    assert_eq!(monitor.set_max_lag(50.0), Ok(50.0));
    assert_eq!(monitor.max_lag(), 50.0);
    assert_eq!(monitor.max_lag(), 50.0);
    assert_eq!(monitor.set_smoothing_factor_on_rise(0.9), Ok(0.9));
    assert_eq!(monitor.set_smoothing_factor_on_rise(0.1), Ok(0.1));
    assert_eq!(monitor.smoothing_factor_on_rise(), 0.1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_lag_function() {
    // Given: A strategy that keeps the worst lag seen so far
    let monitor = spawn_armed(fast_config()).await;
    monitor.set_lag_function(|raw: f64, current: f64, _rise: f64, _fall: f64| raw.max(current));

    advance_ms(140).await;
    advance_ms(110).await;
    advance_ms(100).await;

    assert!((monitor.current_lag() - 40.0).abs() < EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_reflects_state() {
    let monitor = spawn_armed(fast_config()).await;
    let before = monitor.snapshot();
    assert_eq!(before.samples, 0);
    assert!(before.last_sample_at.is_none());

    advance_ms(200).await;
    let after = monitor.snapshot();

    assert_eq!(after.samples, 1);
    assert!(after.busy);
    assert!(after.started);
    assert_eq!(after.max_lag_ms, 10.0);
    assert_eq!(after.interval_ms, 100.0);
    assert!(after.last_sample_at.is_some());
    assert!((after.current_lag_ms - monitor.current_lag()).abs() < EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_set_interval_restarts_a_stopped_monitor() {
    // Given: A monitor shut down with lag on record
    let monitor = spawn_armed(fast_config()).await;
    recording_listener(&monitor, None);
    advance_ms(200).await;
    monitor.shutdown();
    assert!(!monitor.started());
    assert!((monitor.current_lag() - 100.0 / 3.0).abs() < EPSILON);

    // When: A new interval is set
    assert_eq!(monitor.set_interval(50.0), Ok(50.0));

    // Then: Sampling resumes from a zero baseline with no old listeners
    assert!(monitor.started());
    assert_eq!(monitor.current_lag(), 0.0);
    assert_eq!(monitor.listener_count(), 0);

    settle().await;
    advance_ms(100).await;
    assert!((monitor.current_lag() - 50.0 / 3.0).abs() < EPSILON);
    assert!(monitor.is_busy());
    assert_eq!(monitor.snapshot().samples, 1);
}

#[tokio::test(start_paused = true)]
async fn test_lag_function_may_query_its_own_monitor() {
    // Given: A strategy that reads a snapshot of its own monitor
    let monitor = Arc::new(spawn_armed(fast_config()).await);
    let weak = Arc::downgrade(&monitor);
    let observed = Arc::new(AtomicUsize::new(0));
    let seen = observed.clone();
    monitor.set_lag_function(move |raw: f64, current: f64, rise: f64, fall: f64| {
        if let Some(monitor) = weak.upgrade() {
            let _ = monitor.snapshot();
            seen.fetch_add(1, Ordering::SeqCst);
        }
        toobusy::smooth(raw, current, rise, fall)
    });

    // When: A late tick fires
    advance_ms(150).await;

    // Then: The tick completes normally
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert!((monitor.current_lag() - 50.0 / 3.0).abs() < EPSILON);
    assert_eq!(monitor.snapshot().samples, 1);
}

#[tokio::test(start_paused = true)]
async fn test_lag_function_may_shut_down_its_own_monitor() {
    let monitor = Arc::new(spawn_armed(fast_config()).await);
    let seen = recording_listener(&monitor, None);
    let weak = Arc::downgrade(&monitor);
    monitor.set_lag_function(move |raw: f64, _: f64, _: f64, _: f64| {
        if let Some(monitor) = weak.upgrade() {
            monitor.shutdown();
        }
        raw
    });

    advance_ms(200).await;
    advance_ms(200).await;

    // The stopped tick is discarded rather than published
    assert!(!monitor.started());
    assert_eq!(monitor.current_lag(), 0.0);
    assert!(seen.lock().unwrap().is_empty());
}

//! Lock-in sampler behaviour against scripted devices on tokio's paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fault, transient, RecordingActuator, ScriptedSensor, OFF, ON};
use thorlabs_daq::{AcquisitionError, LockInConfig, LockInSampler, Phase, StopFlag};

fn sampler(cycles: u32) -> LockInSampler {
    LockInSampler::new(LockInConfig::default().with_cycles(cycles)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn constant_sensor_gives_exact_difference() {
    let (von, voff) = (3.7e-3, 1.2e-4);
    for cycles in [1, 2, 5] {
        let actuator = RecordingActuator::new();
        let sensor = ScriptedSensor::constant(actuator.clone(), von, voff);
        let run = sampler(cycles)
            .run(actuator.as_ref(), &sensor, &StopFlag::new())
            .await
            .unwrap();
        assert_eq!(run.lockin_signal(), von - voff, "cycles = {cycles}");
        assert_eq!(run.mean(Phase::On), von);
        assert_eq!(run.mean(Phase::Off), voff);
    }
}

#[tokio::test(start_paused = true)]
async fn three_cycles_give_six_alternating_segments() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::constant(actuator.clone(), 1.0, 0.0);
    let run = sampler(3)
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap();

    let segments = run.segments();
    assert_eq!(segments.len(), 6);
    for (i, segment) in segments.iter().enumerate() {
        let expected_phase = if i % 2 == 0 { Phase::On } else { Phase::Off };
        assert_eq!(segment.phase, expected_phase);
        assert_eq!(segment.cycle as usize, i / 2 + 1);
        assert!(segment.len > 0, "segment {i} is empty");
        assert!(run
            .segment_samples(segment)
            .iter()
            .all(|s| s.phase == expected_phase));
    }
    assert_eq!(run.count(Phase::On) + run.count(Phase::Off), run.samples().len());
    assert_eq!(actuator.moves(), vec![ON, OFF, ON, OFF, ON, OFF]);
}

#[tokio::test(start_paused = true)]
async fn trace_is_time_ordered() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::constant(actuator.clone(), 2.0, 1.0);
    let run = sampler(2)
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap();

    let times = run.times();
    assert_eq!(times.len(), run.values().len());
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
    // Two full servo periods plus two settle delays.
    assert!(*times.last().unwrap() < 2.0 + 0.2 + 1e-9);
}

#[tokio::test(start_paused = true)]
async fn settle_delay_precedes_first_on_reading() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::constant(actuator.clone(), 1.0, 0.0);
    let config = LockInConfig::default().with_settle_delay(Duration::from_millis(100));
    let run = LockInSampler::new(config)
        .unwrap()
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap();

    let first = run.samples().first().unwrap();
    assert_eq!(first.phase, Phase::On);
    assert!(first.timestamp >= 0.1 - 1e-9, "first read at {}", first.timestamp);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_in_one_segment_is_tolerated() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::new(actuator.clone(), |phase, cycle| match (phase, cycle) {
        (Phase::On, 2) => Err(transient()),
        (Phase::On, _) => Ok(5.0),
        (Phase::Off, _) => Ok(1.0),
    });
    let run = sampler(3)
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap();

    assert_eq!(run.lockin_signal(), 4.0);
    assert!(run.skipped_reads() > 0);
    let empty: Vec<_> = run.segments().iter().filter(|s| s.len == 0).collect();
    assert_eq!(empty.len(), 1);
    assert_eq!((empty[0].cycle, empty[0].phase), (2, Phase::On));
}

#[tokio::test(start_paused = true)]
async fn strict_mode_rejects_an_empty_segment() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::new(actuator.clone(), |phase, cycle| match (phase, cycle) {
        (Phase::Off, 1) => Err(transient()),
        (Phase::On, _) => Ok(5.0),
        (Phase::Off, _) => Ok(1.0),
    });
    let config = LockInConfig::default().with_cycles(2).strict(true);
    let err = LockInSampler::new(config)
        .unwrap()
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AcquisitionError::InsufficientData {
            cycle: Some(1),
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn failing_every_on_segment_is_insufficient_data() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::new(actuator.clone(), |phase, _| match phase {
        Phase::On => Err(transient()),
        Phase::Off => Ok(1.0),
    });
    let err = sampler(3)
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap_err();

    match err {
        AcquisitionError::InsufficientData {
            on_samples,
            off_samples,
            ..
        } => {
            assert_eq!(on_samples, 0);
            assert!(off_samples > 0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn non_finite_readings_are_skipped() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::new(actuator.clone(), |phase, _| match phase {
        Phase::On => Ok(f64::NAN),
        Phase::Off => Ok(1.0),
    });
    let err = sampler(1)
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AcquisitionError::InsufficientData { .. }));
}

#[tokio::test(start_paused = true)]
async fn result_depends_only_on_the_multiset_of_readings() {
    let values = [0.1, 0.7, 1.0e-3];
    let forward = values;
    let mut backward = values;
    backward.reverse();

    let mut signals = Vec::new();
    for order in [forward, backward] {
        let actuator = RecordingActuator::new();
        let sensor = ScriptedSensor::new(actuator.clone(), move |phase, cycle| match phase {
            Phase::On => Ok(order[cycle - 1]),
            Phase::Off => Ok(order[cycle - 1] / 3.0),
        });
        let run = sampler(3)
            .run(actuator.as_ref(), &sensor, &StopFlag::new())
            .await
            .unwrap();
        signals.push(run.lockin_signal());
    }
    assert_eq!(signals[0].to_bits(), signals[1].to_bits());
}

#[tokio::test(start_paused = true)]
async fn stop_flag_cancels_and_parks_off() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::constant(actuator.clone(), 1.0, 0.0);
    let stop = StopFlag::new();

    let trigger = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(750)).await;
        trigger.trigger("operator abort");
    });

    let err = sampler(10)
        .run(actuator.as_ref(), &sensor, &stop)
        .await
        .unwrap_err();

    match err {
        AcquisitionError::Cancelled(reason) => assert_eq!(reason, "operator abort"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(actuator.last_move(), Some(OFF));
    assert!(actuator.moves().len() < 20);
}

#[tokio::test(start_paused = true)]
async fn already_triggered_stop_reads_nothing() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::constant(actuator.clone(), 1.0, 0.0);
    let stop = StopFlag::new();
    stop.trigger("before start");

    let err = sampler(1)
        .run(actuator.as_ref(), &sensor, &stop)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(sensor.reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn actuator_fault_aborts() {
    let actuator = RecordingActuator::failing_at(ON);
    let sensor = ScriptedSensor::constant(actuator.clone(), 1.0, 0.0);
    let err = sampler(2)
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap_err();

    match err {
        AcquisitionError::ActuatorFault { position, .. } => assert_eq!(position, ON),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sensor.reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn sensor_fault_aborts() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::new(actuator.clone(), |phase, cycle| match (phase, cycle) {
        (Phase::Off, 2) => Err(fault()),
        _ => Ok(1.0),
    });
    let err = sampler(3)
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AcquisitionError::SensorFault(_)));
}

#[tokio::test(start_paused = true)]
async fn actuator_ends_off_after_a_normal_run() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::constant(actuator.clone(), 1.0, 0.0);
    sampler(2)
        .run(actuator.as_ref(), &sensor, &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(actuator.last_move(), Some(OFF));
}

#[tokio::test(start_paused = true)]
async fn observer_sees_every_half_cycle() {
    let actuator = RecordingActuator::new();
    let sensor = ScriptedSensor::constant(actuator.clone(), 1.0, 0.0);
    let mut seen = Vec::new();
    sampler(2)
        .run_observed(actuator.as_ref(), &sensor, &StopFlag::new(), |report| {
            seen.push((report.cycle, report.phase, report.samples > 0));
        })
        .await
        .unwrap();
    assert_eq!(
        seen,
        vec![
            (1, Phase::On, true),
            (1, Phase::Off, true),
            (2, Phase::On, true),
            (2, Phase::Off, true),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn works_through_trait_objects() {
    let actuator = RecordingActuator::new();
    let sensor = Arc::new(ScriptedSensor::constant(actuator.clone(), 2.0, 0.5));
    let movable: Arc<dyn thorlabs_daq::hardware::Movable> = actuator.clone();
    let readable: Arc<dyn thorlabs_daq::hardware::Readable> = sensor;
    let run = sampler(1)
        .run(movable.as_ref(), readable.as_ref(), &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(run.lockin_signal(), 1.5);
}

use ndarray::Array1;
use proptest::prelude::*;
use stimcompiler_backend::*;

fn builder() -> WaveformBuilder {
    WaveformBuilder::new(UnitConverter::new(VoltageRange::Five))
}

#[test]
fn ramp_reaches_target_after_duration() {
    let b = builder();
    let wave = b
        .build(&WaveformSpec::Ramp {
            duration_ms: 5000,
            blue_voltage: 3.0,
            red_voltage: 4.0,
        })
        .unwrap();
    let blue = wave.channel("blue").unwrap();
    let start = PAD_LENGTH - 1;
    assert_eq!(blue[start], 0);
    assert_eq!(blue[start + 5000], b.converter().to_device_units(3.0));
    assert!((start..start + 5000).all(|i| blue[i] <= blue[i + 1]));
}

#[test]
fn pulse_train_longer_than_period_is_rejected() {
    let spec = WaveformSpec::PulseTrain {
        pulse_length_ms: 150,
        blue_voltage: 2.0,
        red_voltage: 4.0,
        freq_hz: 10.,
        num_pulses: 5,
    };
    assert_eq!(spec.period_ms(), Some(100));
    let err = builder().build(&spec).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);
}

#[test]
fn pulse_train_period_is_rounded() {
    // 1000 / 3 = 333.33 -> 333
    let spec = WaveformSpec::PulseTrain {
        pulse_length_ms: 10,
        blue_voltage: 2.0,
        red_voltage: 4.0,
        freq_hz: 3.,
        num_pulses: 2,
    };
    assert_eq!(spec.period_ms(), Some(333));
    let wave = builder().with_padding(1).build(&spec).unwrap();
    assert_eq!(wave.frames(), 2 * 333 + 2);
}

#[test]
fn terminator_fires_on_cross_time_th_qualifying_sample() {
    let threshold = 0.9;
    let baseline = 20000.;
    let mut term = MovingAverageTerminator::new(threshold);
    for _ in 0..WINDOW_SIZE {
        assert!(!term.update(baseline));
    }
    let low = threshold * baseline * 0.5;
    for k in 0..CROSS_TIME {
        let fired = term.update(low);
        assert_eq!(fired, k == CROSS_TIME - 1, "sample {}", k);
    }
    assert!(term.has_terminated());
    assert_eq!(term.latency(), Some(WINDOW_SIZE));
}

#[test]
fn short_runs_never_terminate() {
    let mut term = MovingAverageTerminator::new(0.9);
    for _ in 0..WINDOW_SIZE {
        term.update(1.0);
    }
    for _ in 0..50 {
        for _ in 0..CROSS_TIME - 1 {
            term.update(0.0);
        }
        term.update(10.0);
        assert_eq!(term.latency(), None);
    }
    assert!(!term.has_terminated());
}

#[test]
fn offline_replay_is_idempotent() {
    // Noisy plateau with a drop at 3210
    let red = Array1::from_iter((0..6000).map(|i| {
        let noise = ((i * 7919) % 101) as f64 / 1000.;
        if i < 3210 {
            4.0 + noise
        } else {
            0.2 + noise
        }
    }));
    let analyzer = LatencyAnalyzer::default();
    let first = analyzer.analyze(red.view()).unwrap();
    assert_eq!(first, Some(3210));
    assert_eq!(first, analyzer.analyze(red.view()).unwrap());
    assert_eq!(first, analyze_latency(red.as_slice().unwrap(), 0.9));
}

#[test]
fn calibrated_power_of_compiled_ramp() {
    let cal = PowerCalibration::fit(&[0.0, 1.0, 2.0, 3.0], &[0.1, 5.1, 10.1, 15.1]).unwrap();
    let b = builder();
    let wave = b
        .build(&WaveformSpec::Ramp {
            duration_ms: 1000,
            blue_voltage: 2.0,
            red_voltage: 4.0,
        })
        .unwrap();
    let blue = wave.commanded_volts(b.converter())["blue"].clone();
    let power = LatencyAnalyzer::default()
        .stimulus_power(blue.view(), Some(&cal))
        .unwrap();
    let peak = power.iter().cloned().fold(f64::MIN, f64::max);
    assert!((peak - cal.to_milliwatts(2.0)).abs() < 5. * b.converter().step() * cal.slope);
}

proptest! {
    #[test]
    fn unit_round_trip_within_one_step(v in 0.0f64..4.9998, ten in any::<bool>()) {
        let range = if ten { VoltageRange::Ten } else { VoltageRange::Five };
        let conv = UnitConverter::new(range);
        let back = conv.from_device_units(conv.to_device_units(v));
        prop_assert!((back - v).abs() <= conv.step());
    }

    #[test]
    fn pulse_layout_holds_for_valid_lengths(len in 10usize..=10000, blue in 0.01f64..4.9998) {
        let spec = WaveformSpec::Pulse { duration_ms: len, blue_voltage: blue, red_voltage: 4.0 };
        let wave = builder().with_padding(20).build(&spec).unwrap();
        let chan = wave.channel("blue").unwrap();
        let on = chan.iter().filter(|&&x| x != 0).count();
        prop_assert_eq!(wave.frames(), len + 40);
        prop_assert!(on == len || blue < builder().converter().step());
    }
}

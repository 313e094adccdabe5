use std::time::Duration;

use ndarray::s;

use stimcompiler_backend::error::FailureKind;
use stimcompiler_backend::latency::analyze_latency;
use stimcompiler_backend::waveform::WaveformSpec;
use stimctrl_backend::command::{abort_sequence, CameraTrigger, KILL_OUTPUT};
use stimctrl_backend::engine::{EngineState, StimulusEngine};
use stimctrl_backend::sim::{SimFaults, SimulatedDevice};
use stimctrl_backend::worker::{StimulusJob, StimulusWorker};

fn pulse(duration_ms: usize) -> WaveformSpec {
    WaveformSpec::Pulse {
        duration_ms,
        blue_voltage: 2.0,
        red_voltage: 4.0,
    }
}

fn faulty(faults: SimFaults) -> StimulusEngine<SimulatedDevice> {
    StimulusEngine::open(SimulatedDevice::new().with_faults(faults))
        .unwrap()
        .with_padding(100)
}

#[test]
fn withdrawal_terminates_stimulus() {
    // Red drops to 2% of its level 100 ms into the blue pulse
    let dev = SimulatedDevice::new().with_response(0, 2100, 0.02);
    let mut engine = StimulusEngine::open(dev).unwrap();
    let outcome = engine.execute(&pulse(500), 0.9, None).unwrap();
    assert_eq!(engine.state(), EngineState::Completed);

    assert!(outcome.has_terminated());
    assert_eq!(outcome.latency(), Some(2100));
    // Confirmed on the 20th low sample (frame 2119), once its frame was complete
    assert_eq!(outcome.abort_frame, Some(2120));
    assert!(outcome.commanded.is_empty());

    let step = engine.converter().step();
    let red = &outcome.received["red"];
    assert_eq!(red.len(), 4500);
    assert!(red.slice(s![..2100]).iter().all(|v| (v - 4.0).abs() <= step));
    assert!(red.slice(s![2100..2120]).iter().all(|v| (v - 0.08).abs() <= step));
    assert!(red.slice(s![2120..]).iter().all(|&v| v == 0.));
    let blue = &outcome.received["blue"];
    assert!(blue.slice(s![..2000]).iter().all(|&v| v == 0.));
    assert!(blue.slice(s![2000..2120]).iter().all(|v| (v - 2.0).abs() <= step));
    assert!(blue.slice(s![2120..]).iter().all(|&v| v == 0.));

    // Offline analysis of the recording agrees with the live decision
    assert_eq!(analyze_latency(&red.to_vec(), 0.9), Some(2100));

    let commands = engine.session().commands();
    assert_eq!(commands[0], "clear;");
    let start = "CLEAR;memdac,i,2,0,18000,0 1,1,c,10,100;adcmem,i,2,18000,18000,0 1,1,c,5,100;";
    assert!(commands.contains(&start.to_string()));
    let kill = commands.iter().position(|c| c == KILL_OUTPUT).unwrap();
    assert_eq!(commands[kill..kill + 4].to_vec(), abort_sequence());
    // Red forced off again before the bulk read
    assert!(commands[kill + 4..].contains(&"DAC,0,0;".to_string()));
    assert_eq!(commands.iter().filter(|c| *c == KILL_OUTPUT).count(), 1);
    assert_eq!(engine.session().dac_level(1), Some(0));
}

#[test]
fn repeated_runs_are_independent() {
    let dev = SimulatedDevice::new().with_response(0, 1200, 0.02);
    let mut engine = StimulusEngine::open(dev).unwrap();
    let first = engine.execute(&pulse(500), 0.9, None).unwrap();
    let second = engine.execute(&pulse(500), 0.9, None).unwrap();
    assert_eq!(first.latency(), Some(1200));
    assert_eq!(first.latency(), second.latency());
    assert_eq!(first.abort_frame, second.abort_frame);
    assert_eq!(first.received["red"], second.received["red"]);
}

#[test]
fn no_withdrawal_runs_to_completion() {
    let mut engine = StimulusEngine::open(SimulatedDevice::new().with_bytes_per_poll(8))
        .unwrap()
        .with_padding(500);
    let outcome = engine.execute(&pulse(200), 0.9, None).unwrap();
    assert!(!outcome.has_terminated());
    assert_eq!(outcome.latency(), None);
    assert_eq!(outcome.abort_frame, None);
    assert_eq!(outcome.received["red"].len(), 1200);
    assert!(!engine.session().commands().iter().any(|c| c == KILL_OUTPUT));
    assert!(engine.session().polls() > 0);
}

#[test]
fn readback_mismatch_kills_output() {
    let mut engine = faulty(SimFaults {
        corrupt_readback: Some(7),
        ..Default::default()
    });
    let err = engine.execute(&pulse(50), 0.9, None).unwrap_err();
    assert_eq!(err.kind(), FailureKind::VerificationMismatch);
    assert!(err.to_string().contains("sample 7"));
    assert_eq!(engine.state(), EngineState::Failed(FailureKind::VerificationMismatch));

    let commands = engine.session().commands();
    assert_eq!(commands.last().unwrap(), KILL_OUTPUT);
    // Never started
    assert!(!commands.iter().any(|c| c.starts_with("CLEAR;")));
    assert_eq!(engine.session().polls(), 0);
}

#[test]
fn rejected_start_command_is_a_device_error() {
    let mut engine = faulty(SimFaults {
        reject_command: Some("adcmem,i".to_string()),
        ..Default::default()
    });
    let err = engine.execute(&pulse(50), 0.9, None).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Device);
    assert!(err.session_suspect());
    assert_eq!(engine.state(), EngineState::Failed(FailureKind::Device));
    assert_eq!(engine.session().commands().last().unwrap(), KILL_OUTPUT);
    assert!(!engine.session().output_running());
}

#[test]
fn failed_write_is_a_transfer_error() {
    let mut engine = faulty(SimFaults {
        fail_write: true,
        ..Default::default()
    });
    let err = engine.execute(&pulse(50), 0.9, None).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Transfer);
    assert_eq!(engine.session().writes(), 1);
    assert_eq!(engine.session().reads(), 0);
    assert_eq!(engine.session().commands().last().unwrap(), KILL_OUTPUT);
}

#[test]
fn oversized_waveform_never_reaches_device() {
    let dev = SimulatedDevice::new().with_user_memory(32768);
    let mut engine = StimulusEngine::open(dev).unwrap();
    let sent = engine.session().commands().len();

    // 4500 frames x 2 channels x 2 bytes = 18000 > 16384
    let err = engine.execute(&pulse(500), 0.9, None).unwrap_err();
    assert_eq!(err.kind(), FailureKind::MemoryLimitExceeded);
    assert!(!err.session_suspect());
    assert!(err.to_string().contains("16384"));
    assert_eq!(engine.state(), EngineState::Failed(FailureKind::MemoryLimitExceeded));

    assert_eq!(engine.session().commands().len(), sent);
    assert_eq!(engine.session().writes(), 0);
    assert_eq!(engine.session().reads(), 0);
}

#[test]
fn invalid_parameters_never_reach_device() {
    let mut engine = StimulusEngine::open(SimulatedDevice::new()).unwrap();
    let sent = engine.session().commands().len();

    let bad = [
        pulse(5),
        WaveformSpec::Pulse {
            duration_ms: 500,
            blue_voltage: 2.0,
            red_voltage: 5.5,
        },
        WaveformSpec::Ramp {
            duration_ms: 500,
            blue_voltage: 2.0,
            red_voltage: 4.0,
        },
    ];
    for spec in &bad {
        let err = engine.execute(spec, 0.9, None).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Validation, "{:?}", spec);
    }
    let camera = CameraTrigger { fps: 0., length_s: 1. };
    let err = engine.execute(&pulse(500), 0.9, Some(&camera)).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);

    assert_eq!(engine.session().commands().len(), sent);
    assert_eq!(engine.session().writes(), 0);
}

#[test]
fn three_channel_stimulus_reports_laser_as_commanded() {
    let spec = WaveformSpec::RedGreenLaser {
        duration_ms: 1000,
        green_voltage: 1.5,
        laser_voltage: 3.0,
        red_voltage: 4.0,
    };
    let mut engine = StimulusEngine::open(SimulatedDevice::new().with_bytes_per_poll(16))
        .unwrap()
        .with_padding(100);
    let outcome = engine.execute(&spec, 0.9, None).unwrap();
    let step = engine.converter().step();

    assert_eq!(outcome.received.keys().collect::<Vec<_>>(), vec!["red", "green"]);
    assert_eq!(outcome.commanded.keys().collect::<Vec<_>>(), vec!["laser"]);
    let green = &outcome.received["green"];
    let laser = &outcome.commanded["laser"];
    assert_eq!(green.len(), 1200);
    assert_eq!(laser.len(), 1200);
    assert!((green[600] - 1.5).abs() <= step);
    assert!((laser[600] - 3.0).abs() <= step);
    assert_eq!(laser[50], 0.);

    // 1200 frames x 3 outputs, 1200 frames x 2 inputs
    let start = "CLEAR;memdac,i,2,0,7200,0 1 2,1,c,10,100;adcmem,i,2,7200,4800,0 1,1,c,5,100;";
    assert!(engine.session().commands().contains(&start.to_string()));
}

#[test]
fn camera_trigger_is_armed_with_the_stimulus() {
    let mut engine = StimulusEngine::open(SimulatedDevice::new().with_bytes_per_poll(8))
        .unwrap()
        .with_padding(100);
    let camera = CameraTrigger::new(500., 1.).unwrap();
    engine.execute(&pulse(50), 0.9, Some(&camera)).unwrap();

    // 250 frames: 1000 bytes out, 1000 bytes in, pulse table after both
    let start = engine
        .session()
        .commands()
        .iter()
        .find(|c| c.starts_with("CLEAR;"))
        .unwrap();
    assert!(start.contains("adcmem,i,2,1000,1000,0 1,1,c,5,100;DIGTIM,SD,2000,32;"));
    assert!(start.ends_with("DIGTIM,A,1,1,8;DIGTIM,A,1,0,8;DIGTIM,C,5,25,500;"));
}

#[test]
fn pulse_table_counts_against_memory() {
    // 1000 bytes out and 1000 bytes in fill the memory exactly
    let dev = SimulatedDevice::new().with_user_memory(2000).with_bytes_per_poll(8);
    let mut engine = StimulusEngine::open(dev).unwrap().with_padding(100);
    let sent = engine.session().commands().len();
    let camera = CameraTrigger::new(500., 1.).unwrap();

    let err = engine.execute(&pulse(50), 0.9, Some(&camera)).unwrap_err();
    assert_eq!(err.kind(), FailureKind::MemoryLimitExceeded);
    assert!(err.to_string().contains("984"));
    assert_eq!(engine.session().commands().len(), sent);
    assert_eq!(engine.session().writes(), 0);
    assert_eq!(engine.session().reads(), 0);

    engine.execute(&pulse(50), 0.9, None).unwrap();
}

#[test]
fn stalled_cursor_times_out() {
    let mut engine = faulty(SimFaults {
        stall_at: Some(100),
        ..Default::default()
    })
    .with_stall_timeout(Duration::from_millis(50));
    let err = engine.execute(&pulse(50), 0.9, None).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Timeout);
    assert_eq!(engine.state(), EngineState::Failed(FailureKind::Timeout));
    assert_eq!(engine.session().input_cursor(), 100);
    assert_eq!(engine.session().commands().last().unwrap(), KILL_OUTPUT);
}

#[test]
fn direct_dac_levels() {
    let mut engine = StimulusEngine::open(SimulatedDevice::new()).unwrap();
    engine.set_dac(0, 4.0).unwrap();
    engine.set_dac(2, -1.25).unwrap();
    assert_eq!(engine.session().dac_level(0), Some(26214));
    assert_eq!(engine.session().dac_level(2), Some(-8192));
    let err = engine.set_dac(0, f64::NAN).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn worker_runs_jobs_in_order() {
    let dev = SimulatedDevice::new().with_response(0, 1200, 0.02);
    let worker = StimulusWorker::spawn(StimulusEngine::open(dev).unwrap());
    assert_eq!(worker.state(), EngineState::Idle);

    let first = worker.submit(StimulusJob::new(pulse(500))).unwrap();
    let mut bad = StimulusJob::new(pulse(500));
    bad.threshold = 1.5;
    let second = worker.submit(bad).unwrap();
    let dac = worker.set_dac(1, 1.0).unwrap();
    worker.wait_idle();

    let outcome = first.recv().unwrap().unwrap();
    assert!(outcome.has_terminated());
    assert_eq!(outcome.latency(), Some(1200));
    let err = second.recv().unwrap().unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);
    dac.recv().unwrap().unwrap();
    // set_dac does not change the execution state
    assert_eq!(worker.state(), EngineState::Failed(FailureKind::Validation));

    let engine = worker.close().unwrap();
    assert_eq!(engine.session().commands().last().unwrap(), "DAC,1,6554;");
}

#[test]
fn worker_publishes_completion() {
    let engine = StimulusEngine::open(SimulatedDevice::new()).unwrap().with_padding(100);
    let worker = StimulusWorker::spawn(engine);
    let rx = worker.submit(StimulusJob::new(pulse(50))).unwrap();
    assert!(!rx.recv().unwrap().unwrap().has_terminated());
    worker.wait_idle();
    assert_eq!(worker.state(), EngineState::Completed);
}

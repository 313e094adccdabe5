use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use stimcompiler_backend::error::{Result, StimError};
use stimctrl_backend::config::{DeviceConfig, RunConfig};
use stimctrl_backend::engine::StimulusEngine;
use stimctrl_backend::session::DeviceSession;
use stimctrl_backend::worker::StimulusWorker;

#[derive(Parser)]
#[command(
    name = "stimctrl",
    version,
    about = "Run photostimulation protocols on a CED 1401 with withdrawal-triggered termination"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run every stimulus of a run file in order
    Run {
        /// TOML run file
        config: PathBuf,
        /// Use the simulated 1401 regardless of the run file
        #[arg(long)]
        simulate: bool,
    },
    /// Parse a run file and validate its stimuli without a device
    Validate {
        config: PathBuf,
    },
}

#[cfg(feature = "ced1401")]
fn open_hardware(device: &DeviceConfig) -> Result<Box<dyn DeviceSession + Send>> {
    let dir = device
        .command_dir
        .as_deref()
        .unwrap_or(stimctrl_backend::command::DEFAULT_COMMAND_DIR);
    let session = stimctrl_backend::use1401::Ced1401Session::open_with_commands(device.index, dir)?;
    Ok(Box::new(session))
}

#[cfg(not(feature = "ced1401"))]
fn open_hardware(_device: &DeviceConfig) -> Result<Box<dyn DeviceSession + Send>> {
    Err(StimError::Config(
        "Built without the `ced1401` feature; use --simulate".to_string(),
    ))
}

fn open_session(config: &RunConfig, simulate: bool) -> Result<Box<dyn DeviceSession + Send>> {
    if simulate || config.device.simulate {
        return Ok(Box::new(config.simulator()));
    }
    open_hardware(&config.device)
}

fn run(config: &RunConfig, simulate: bool) -> Result<usize> {
    let engine = config.configure(StimulusEngine::open(open_session(config, simulate)?)?);
    let worker = StimulusWorker::spawn(engine);

    let mut failures = 0;
    for (i, job) in config.stimuli.iter().enumerate() {
        let rx = worker.submit(job.clone())?;
        let result = rx.recv().map_err(|_| StimError::Device {
            context: "stimulus worker".to_string(),
            code: -1,
            text: "Worker stopped before reporting".to_string(),
        })?;
        match result {
            Ok(outcome) => {
                let power = match config.calibration.as_ref() {
                    Some(cal) => outcome
                        .stimulus_power(Some(cal))
                        .ok()
                        .and_then(|p| outcome.latency().and_then(|l| p.get(l).copied())),
                    None => None,
                };
                println!(
                    "#{} {:?}: terminated={} latency={:?} abort_frame={:?} power_at_latency_mw={:?}",
                    i,
                    job.spec.kind(),
                    outcome.has_terminated(),
                    outcome.latency(),
                    outcome.abort_frame,
                    power
                );
            }
            Err(err) => {
                failures += 1;
                println!("#{} {:?}: failed ({:?}): {}", i, job.spec.kind(), err.kind(), err);
                if err.session_suspect() {
                    log::error!("Device session is suspect, stopping the run");
                    break;
                }
            }
        }
    }
    worker.close();
    Ok(failures)
}

fn validate(config: &RunConfig) -> usize {
    let limits = stimcompiler_backend::waveform::StimLimits {
        max_voltage: config
            .engine
            .max_voltage
            .unwrap_or(stimcompiler_backend::waveform::VALID_VOLTAGE_HIGH),
    };
    config
        .stimuli
        .iter()
        .enumerate()
        .filter(|(i, job)| match job.spec.validate(&limits) {
            Ok(()) => {
                println!("#{} {:?}: ok", i, job.spec.kind());
                false
            }
            Err(err) => {
                println!("#{} {:?}: {}", i, job.spec.kind(), err);
                true
            }
        })
        .count()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    let outcome = match &cli.command {
        Command::Run { config, simulate } => {
            RunConfig::load(config).and_then(|c| run(&c, *simulate))
        }
        Command::Validate { config } => RunConfig::load(config).map(|c| validate(&c)),
    };

    match outcome {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failures) => {
            eprintln!("{} stimulus request(s) failed", failures);
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::from(2)
        }
    }
}

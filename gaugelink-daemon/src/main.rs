//! Gauge link daemon
//!
//! Polls the configured SSM ECU and Arduino sensor board, logging their
//! values, until the run time elapses or a link fails for good.
//!
//! Usage: cargo run -p gaugelink-daemon -- --config gaugelink.json

mod config;

use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use gaugelink_comm_lib::arduino::{ArduinoDataReceived, ArduinoLink};
use gaugelink_comm_lib::link;
use gaugelink_comm_lib::ssm::{SsmDataReceived, SsmLink};
use gaugelink_comm_lib::{Cadence, LinkEvent, LinkHandle, ParameterCode, Protocol};
use log::{debug, error, info, warn, LevelFilter};

use config::{ArduinoLinkConfig, Config, LogLevel, RecoveryConfig, SsmLinkConfig};

/// How often the latest values are logged at info level
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "gaugelink", version)]
#[command(about = "Poll SSM and Arduino gauge links and log their values")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, default_value = "gaugelink.json")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Override the configured SSM port (`tcp://host:port` for a network bridge)
    #[arg(long)]
    ssm_port: Option<String>,

    /// Override the configured Arduino port (`tcp://host:port` for a network bridge)
    #[arg(long)]
    arduino_port: Option<String>,

    /// Seconds to run before stopping (0 = run until a link fails)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    write_config: bool,
}

/// A link that stopped itself
#[derive(Debug)]
struct FatalReport {
    link: String,
    resets: u32,
    reason: String,
}

/// Notification payloads the logger knows how to print
trait CycleReport {
    type Code: ParameterCode;

    fn label(&self) -> &'static str;
    fn updated(&self) -> &[Self::Code];
}

impl CycleReport for SsmDataReceived {
    type Code = gaugelink_comm_lib::ssm::SsmCode;

    fn label(&self) -> &'static str {
        match self.cadence {
            Cadence::Fast => "fast",
            Cadence::Slow => "slow",
        }
    }

    fn updated(&self) -> &[Self::Code] {
        &self.codes
    }
}

impl CycleReport for ArduinoDataReceived {
    type Code = gaugelink_comm_lib::arduino::ArduinoCode;

    fn label(&self) -> &'static str {
        "cycle"
    }

    fn updated(&self) -> &[Self::Code] {
        &self.codes
    }
}

fn format_values<P: Protocol>(handle: &LinkHandle<P>, codes: &[P::Code]) -> String {
    codes
        .iter()
        .map(|&code| {
            let reading = handle.reading(code);
            format!("{code}={:.2}{}", reading.value, reading.unit)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log every cycle at debug level and the latest values once per [`REPORT_INTERVAL`].
fn spawn_logger<P>(handle: LinkHandle<P>, fatal_tx: Sender<FatalReport>) -> Result<()>
where
    P: Protocol,
    P::Data: CycleReport<Code = P::Code>,
{
    let events = handle.subscribe();
    std::thread::Builder::new()
        .name(format!("{}-log", handle.name()))
        .spawn(move || {
            let mut last_report = Instant::now();
            let mut cycles = 0u64;
            while let Some(event) = events.recv() {
                match event {
                    LinkEvent::Received(data) => {
                        cycles += 1;
                        debug!(
                            "{} [{}] {}",
                            handle.name(),
                            data.label(),
                            format_values(&handle, data.updated())
                        );
                        if last_report.elapsed() >= REPORT_INTERVAL {
                            let dropped = events.dropped();
                            info!(
                                "{}: {cycles} cycles, {}{}",
                                handle.name(),
                                format_values(&handle, data.updated()),
                                if dropped > 0 {
                                    format!(" ({dropped} notifications dropped)")
                                } else {
                                    String::new()
                                }
                            );
                            last_report = Instant::now();
                            cycles = 0;
                        }
                    }
                    LinkEvent::Fatal { resets, reason } => {
                        let report = FatalReport {
                            link: handle.name().to_string(),
                            resets,
                            reason,
                        };
                        if fatal_tx.send(report).is_err() {
                            debug!("{}: nobody is waiting for fatal reports", handle.name());
                        }
                    }
                }
            }
        })
        .context("spawning logger thread")?;
    Ok(())
}

fn start_ssm(
    config: &SsmLinkConfig,
    recovery: &RecoveryConfig,
    fatal_tx: Sender<FatalReport>,
) -> Result<SsmLink> {
    let driver = link::from_port(config.serial_settings());
    let mut ecu = SsmLink::ssm(driver).with_timing(recovery.timing());
    ecu.set_slow_read_interval(config.slow_read_interval)?;
    for &code in &config.fast_read {
        ecu.set_enabled_quiet(code, Cadence::Fast, true);
    }
    for &code in &config.slow_read {
        ecu.set_enabled_quiet(code, Cadence::Slow, true);
    }
    info!(
        "SSM: {} fast, {} slow codes, slow read every {} cycles",
        config.fast_read.len(),
        config.slow_read.len(),
        config.slow_read_interval
    );

    spawn_logger(ecu.handle(), fatal_tx)?;
    ecu.start()
        .with_context(|| format!("starting SSM link on {}", config.port))?;
    Ok(ecu)
}

fn start_arduino(
    config: &ArduinoLinkConfig,
    recovery: &RecoveryConfig,
    fatal_tx: Sender<FatalReport>,
) -> Result<ArduinoLink> {
    let driver = link::from_port(config.serial_settings());
    let mut board = ArduinoLink::arduino(driver).with_timing(recovery.timing());
    spawn_logger(board.handle(), fatal_tx)?;
    board
        .start()
        .with_context(|| format!("starting Arduino link on {}", config.port))?;
    Ok(board)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Everything up to the configured level is filtered with set_max_level below
    env_logger::Builder::new()
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();
    log::set_max_level(args.log_level.unwrap_or_default().as_level_filter());

    let mut config = Config::load_or_default(&args.config);
    if let Some(port) = args.ssm_port {
        match &mut config.ssm {
            Some(ssm) => ssm.port = port,
            None => config.ssm = Some(SsmLinkConfig::with_port(port)),
        }
    }
    if let Some(port) = args.arduino_port {
        match &mut config.arduino {
            Some(arduino) => arduino.port = port,
            None => config.arduino = Some(ArduinoLinkConfig::with_port(port)),
        }
    }
    config.validate();
    log::set_max_level(args.log_level.unwrap_or(config.log_level).as_level_filter());

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
    }
    if args.write_config {
        config.save(&args.config)?;
    }
    if args.print_config || args.write_config {
        return Ok(());
    }

    if config.ssm.is_none() && config.arduino.is_none() {
        bail!("no links configured in {}", args.config.display());
    }

    let (fatal_tx, fatal_rx) = mpsc::channel();
    let mut ecu = config
        .ssm
        .as_ref()
        .map(|ssm| start_ssm(ssm, &config.recovery, fatal_tx.clone()))
        .transpose()?;
    let mut board = config
        .arduino
        .as_ref()
        .map(|arduino| start_arduino(arduino, &config.recovery, fatal_tx.clone()))
        .transpose()?;
    drop(fatal_tx);

    let fatal = if args.duration > 0 {
        fatal_rx.recv_timeout(Duration::from_secs(args.duration)).ok()
    } else {
        fatal_rx.recv().ok()
    };

    info!("Shutting down");
    if let Some(ecu) = ecu.as_mut() {
        if let Err(e) = ecu.stop() {
            warn!("SSM link: {e}");
        }
    }
    if let Some(board) = board.as_mut() {
        if let Err(e) = board.stop() {
            warn!("Arduino link: {e}");
        }
    }

    if let Some(FatalReport {
        link,
        resets,
        reason,
    }) = fatal
    {
        error!("{link} failed after {resets} consecutive resets: {reason}");
        bail!("link {link} failed: {reason}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_config_flag() {
        let args = Args::try_parse_from(["gaugelink", "--write-config", "-c", "out.json"]).unwrap();
        assert!(args.write_config);
        assert!(!args.print_config);
        assert_eq!(args.config, PathBuf::from("out.json"));
    }

    #[test]
    fn test_write_config_saves_effective_config() {
        let path = std::env::temp_dir().join(format!("gaugelink-write-{}.json", std::process::id()));
        let mut config = Config::default();
        config.arduino = Some(ArduinoLinkConfig::with_port("tcp://127.0.0.1:35002"));
        config.save(&path).unwrap();
        assert_eq!(Config::load_or_default(&path), config);
        std::fs::remove_file(&path).unwrap();
    }
}

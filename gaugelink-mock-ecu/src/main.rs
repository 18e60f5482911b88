//! Mock SSM ECU and Arduino sensor board for testing the gauge link daemon
//!
//! Usage: cargo run -p gaugelink-mock-ecu -- --protocol ssm
//! Then point the daemon at `tcp://127.0.0.1:35001`

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use gaugelink_comm_lib::arduino::ArduinoCode;
use gaugelink_comm_lib::{ssm, LinkKind, ParameterCode};
use log::{debug, error, info, LevelFilter};

#[derive(Parser, Debug)]
#[command(name = "gaugelink-mock")]
#[command(about = "Serve a fake SSM ECU or Arduino sensor board over TCP")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:35001")]
    listen: String,

    /// Device to imitate: ssm or arduino
    #[arg(short, long, default_value = "ssm")]
    protocol: LinkKind,

    /// Milliseconds between Arduino reading cycles
    #[arg(short, long, default_value = "50")]
    interval_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = Args::parse();

    info!("Mock {} starting on {}...", args.protocol, args.listen);
    let listener =
        TcpListener::bind(&args.listen).with_context(|| format!("binding {}", args.listen))?;
    info!("Mock {} ready - waiting for connections...", args.protocol);

    let interval = Duration::from_millis(args.interval_ms);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("Client connected: {:?}", stream.peer_addr());
                let kind = args.protocol;
                thread::spawn(move || {
                    let result = match kind {
                        LinkKind::Ssm => serve_ssm(stream),
                        LinkKind::Arduino => serve_arduino(stream, interval),
                    };
                    match result {
                        Ok(()) => info!("Client disconnected"),
                        Err(e) => error!("Client error: {e:#}"),
                    }
                });
            }
            Err(e) => error!("Connection error: {e}"),
        }
    }
    Ok(())
}

/// Engine speed sweeping 800 to 3500 rpm and back
fn engine_speed(start_time: &Instant) -> f32 {
    const MIN_RPM: f32 = 800.0;
    const MAX_RPM: f32 = 3500.0;
    const RAMP_TIME: f32 = 4.0;
    const HOLD_TIME: f32 = 3.0;
    const CYCLE_TIME: f32 = 2.0 * (RAMP_TIME + HOLD_TIME);

    let phase = start_time.elapsed().as_secs_f32() % CYCLE_TIME;

    if phase < RAMP_TIME {
        MIN_RPM + (MAX_RPM - MIN_RPM) * (phase / RAMP_TIME)
    } else if phase < RAMP_TIME + HOLD_TIME {
        MAX_RPM
    } else if phase < 2.0 * RAMP_TIME + HOLD_TIME {
        let ramp_phase = phase - RAMP_TIME - HOLD_TIME;
        MAX_RPM - (MAX_RPM - MIN_RPM) * (ramp_phase / RAMP_TIME)
    } else {
        MIN_RPM
    }
}

/// Byte stored at one ECU address
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ssm_byte(address: &[u8], start_time: &Instant) -> u8 {
    let rpm_raw = (engine_speed(start_time) * 4.0) as u16;
    match address {
        [0x00, 0x00, 0x07] => 0x40,                   // Engine load
        [0x00, 0x00, 0x08] => 0x82,                   // Coolant: 90°C
        [0x00, 0x00, 0x0D] => 0x1A,                   // Manifold pressure
        [0x00, 0x00, 0x0E] => (rpm_raw >> 8) as u8,   // Engine speed, high
        [0x00, 0x00, 0x0F] => (rpm_raw & 0xFF) as u8, // Engine speed, low
        [0x00, 0x00, 0x10] => 0x28,                   // Speed: 40 km/h
        [0x00, 0x00, 0x12] => 0x38,                   // Intake air: 16°C
        [0x00, 0x00, 0x15] => 0x45,                   // Throttle
        [0x00, 0x00, 0x1C] => 0xB4,                   // Battery: 14.4 V
        [0x00, 0x00, 0x62] => 0x80,                   // Neutral switch
        _ => 0x00,
    }
}

fn serve_ssm(mut stream: TcpStream) -> Result<()> {
    let start_time = Instant::now();
    loop {
        let mut head = [0u8; 4];
        match stream.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e).context("reading query header"),
        }
        let mut query = head.to_vec();
        query.resize(head.len() + usize::from(head[3]) + 1, 0);
        stream
            .read_exact(&mut query[head.len()..])
            .context("reading query body")?;
        debug!("RX: {}", hex::encode(&query));

        let addresses = match ssm::parse_query(&query) {
            Ok(addresses) => addresses,
            Err(e) => {
                // A real ECU stays silent and lets the tester time out
                error!("Ignoring bad query: {e}");
                continue;
            }
        };
        let data: Vec<u8> = addresses
            .chunks(ssm::ADDRESS_BYTES_PER_DATA_BYTE)
            .map(|address| ssm_byte(address, &start_time))
            .collect();
        let reply = ssm::build_response(&query, &data)?;
        debug!("TX: {}", hex::encode(&reply));

        // The K-line echoes the query back before the reply
        stream.write_all(&query).context("echoing query")?;
        stream.write_all(&reply).context("writing reply")?;
    }
}

/// Raw line value the board would print for one sensor
#[allow(clippy::cast_possible_truncation)]
fn arduino_raw(code: ArduinoCode, start_time: &Instant) -> i32 {
    match code {
        // Half-period of the tach signal in microseconds
        ArduinoCode::EngineSpeed => (30e6 / engine_speed(start_time)) as i32,
        ArduinoCode::VehicleSpeed => 35_000,
        ArduinoCode::Boost => 300,
        _ => 512,
    }
}

fn serve_arduino(mut stream: TcpStream, interval: Duration) -> Result<()> {
    let start_time = Instant::now();
    loop {
        let mut cycle = String::new();
        for &code in ArduinoCode::ALL {
            cycle.push_str(&format!("{}{}\r\n", code.header(), arduino_raw(code, &start_time)));
        }
        debug!("TX: {}", cycle.escape_debug());
        if let Err(e) = stream.write_all(cycle.as_bytes()) {
            if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            ) {
                return Ok(());
            }
            return Err(e).context("writing readings");
        }
        thread::sleep(interval);
    }
}

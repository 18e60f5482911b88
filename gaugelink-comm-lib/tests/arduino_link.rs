use std::time::Duration;

use gaugelink_comm_lib::arduino::{ArduinoCode, ArduinoLink, LINES_PER_CYCLE};
use gaugelink_comm_lib::link::{ScriptHandle, ScriptedLink};
use gaugelink_comm_lib::{LinkEvent, ParameterCode, RecoveryTiming};

const WAIT: Duration = Duration::from_secs(10);

fn timing() -> RecoveryTiming {
    RecoveryTiming {
        settle_delay: Duration::from_millis(300),
        idle_delay: Duration::from_millis(5),
    }
}

fn push_cycle(script: &ScriptHandle, rpm_period: i32) {
    script.push_line(&format!("T{rpm_period}"));
    for line in ["S20000", "A300", "B512", "C500", "D510", "E400", "F600"] {
        script.push_line(line);
    }
}

#[test]
fn test_cycles_arrive_in_order() {
    let (link, script) = ScriptedLink::new("arduino");
    push_cycle(&script, 10_000);
    push_cycle(&script, 20_000);

    let mut board = ArduinoLink::arduino(Box::new(link)).with_timing(timing());
    let events = board.subscribe();
    board.start().unwrap();

    for _ in 0..2 {
        match events.recv_timeout(WAIT) {
            Some(LinkEvent::Received(data)) => {
                assert_eq!(data.codes.len(), LINES_PER_CYCLE);
                assert_eq!(data.codes.as_slice(), ArduinoCode::ALL);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
    assert_eq!(board.raw_value(ArduinoCode::EngineSpeed), 20_000);
    assert!((board.value(ArduinoCode::EngineSpeed) - 1500.0).abs() < 1e-9);
    board.stop().unwrap();
    assert!(script.writes().is_empty());
}

#[test]
fn test_empty_line_skips_notification() {
    let (link, script) = ScriptedLink::new("arduino");
    script.push_line("T30000");
    script.push_line("");
    push_cycle(&script, 10_000);

    let mut board = ArduinoLink::arduino(Box::new(link)).with_timing(timing());
    let events = board.subscribe();
    board.start().unwrap();

    match events.recv_timeout(WAIT) {
        Some(LinkEvent::Received(data)) => assert_eq!(data.codes.len(), LINES_PER_CYCLE),
        other => panic!("expected data, got {other:?}"),
    }
    // The aborted cycle's tachometer line never reached the table
    assert_eq!(board.raw_value(ArduinoCode::EngineSpeed), 10_000);
    // An aborted cycle is not a link failure
    assert_eq!(script.opens(), 1);
    board.stop().unwrap();
}

#[test]
fn test_malformed_number_resets_link() {
    let (link, script) = ScriptedLink::new("arduino");
    script.push_line("T1x0");
    push_cycle(&script, 12_000);

    let mut board = ArduinoLink::arduino(Box::new(link)).with_timing(timing());
    let events = board.subscribe();
    board.start().unwrap();

    assert!(matches!(events.recv_timeout(WAIT), Some(LinkEvent::Received(_))));
    assert_eq!(script.opens(), 2);
    assert_eq!(board.raw_value(ArduinoCode::EngineSpeed), 12_000);
    board.stop().unwrap();
}

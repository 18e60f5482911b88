//! The per-link communication loop.
//!
//! A [`CommLink`] owns one protocol codec and one link driver. `start()` opens
//! the link and moves both onto a dedicated thread that polls one cycle at a
//! time; `stop()` asks the thread to finish its current cycle, joins it and
//! takes the codec and driver back so the link can be started again.
//!
//! Failed cycles go through the recovery procedure: flush, close, wait, and
//! reopen. More than [`MAX_CONSECUTIVE_RESETS`] failures in a row stop the loop
//! and publish a single [`LinkEvent::Fatal`].

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{ConfigError, LinkError};
use crate::link::LinkDriver;
use crate::notify::{NotificationHub, Subscription};
use crate::table::{Cadence, ParameterCode, ParameterTable, Reading};

/// Consecutive failed cycles tolerated before a link is declared dead
pub const MAX_CONSECUTIVE_RESETS: u32 = 20;

/// Wait between closing and reopening a link during recovery
pub const SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Wait after a fast cycle that had nothing to query
pub const IDLE_DELAY: Duration = Duration::from_millis(500);

/// Fast cycles between slow cycles
pub const DEFAULT_SLOW_READ_INTERVAL: u32 = 10;

/// Delays used by the loop. Tests shorten them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryTiming {
    pub settle_delay: Duration,
    pub idle_delay: Duration,
}

impl Default for RecoveryTiming {
    fn default() -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
            idle_delay: IDLE_DELAY,
        }
    }
}

/// Result of one successful exchange
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome<D> {
    /// Values were decoded and committed to the table
    Received(D),
    /// Nothing was enabled for this cadence, so nothing was sent
    Idle,
    /// The cycle was abandoned without touching the link's health
    Aborted,
}

/// A wire protocol spoken over a [`LinkDriver`].
pub trait Protocol: Send + 'static {
    type Code: ParameterCode;

    /// Payload of the notification published after a successful cycle
    type Data: Clone + Send + fmt::Debug + 'static;

    /// Short name used in thread names and logs
    const NAME: &'static str;

    /// Whether the loop alternates fast and slow cycles
    const HAS_SLOW_CADENCE: bool;

    /// Run one complete request/response (or read) exchange.
    ///
    /// Any error sends the loop into recovery.
    fn run_cycle(
        &mut self,
        link: &mut dyn LinkDriver,
        table: &ParameterTable<Self::Code>,
        cadence: Cadence,
    ) -> Result<CycleOutcome<Self::Data>, LinkError>;
}

/// Notification published by a running link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent<D> {
    /// One cycle completed and its values are in the table
    Received(D),
    /// The loop gave up. Published once, as the last event of the session.
    Fatal { resets: u32, reason: String },
}

/// Lifecycle state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkState {
    Stopped = 0,
    Running = 1,
    /// Stopped itself after too many consecutive failures
    Failed = 2,
}

impl LinkState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Failed,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State shared between the loop thread and every handle
struct Shared<P: Protocol> {
    name: String,
    table: ParameterTable<P::Code>,
    hub: NotificationHub<LinkEvent<P::Data>>,
    stop_requested: AtomicBool,
    state: AtomicU8,
    slow_read_interval: AtomicU32,
}

impl<P: Protocol> Shared<P> {
    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Counters owned by one running session
#[derive(Debug, Default)]
struct LinkSession {
    reset_count: u32,
    cycles_since_slow: u32,
}

impl LinkSession {
    /// Slow once the counter passes `interval`, fast otherwise
    fn next_cadence(&mut self, interval: u32) -> Cadence {
        self.cycles_since_slow += 1;
        if self.cycles_since_slow > interval {
            self.cycles_since_slow = 0;
            Cadence::Slow
        } else {
            Cadence::Fast
        }
    }
}

/// What the loop thread hands back when it exits
struct Finished<P> {
    protocol: P,
    link: Box<dyn LinkDriver>,
    result: Result<(), LinkError>,
}

/// Configuration and query access to a link, usable from any thread.
///
/// Handles stay valid across restarts and after the link stops.
pub struct LinkHandle<P: Protocol> {
    shared: Arc<Shared<P>>,
}

impl<P: Protocol> Clone for LinkHandle<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Protocol> LinkHandle<P> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LinkState::Running
    }

    /// Receive an event for every cycle completed from now on
    #[must_use]
    pub fn subscribe(&self) -> Subscription<LinkEvent<P::Data>> {
        self.shared.hub.subscribe()
    }

    #[must_use]
    pub fn table(&self) -> &ParameterTable<P::Code> {
        &self.shared.table
    }

    #[must_use]
    pub fn reading(&self, code: P::Code) -> Reading {
        self.shared.table.get(code)
    }

    #[must_use]
    pub fn value(&self, code: P::Code) -> f64 {
        self.shared.table.value(code)
    }

    #[must_use]
    pub fn raw_value(&self, code: P::Code) -> i32 {
        self.shared.table.raw_value(code)
    }

    #[must_use]
    pub fn unit(&self, code: P::Code) -> &'static str {
        self.shared.table.unit(code)
    }

    #[must_use]
    pub fn enabled(&self, code: P::Code, cadence: Cadence) -> bool {
        self.shared.table.enabled(code, cadence)
    }

    /// Include or exclude `code` from `cadence` queries, starting next cycle
    pub fn set_enabled(&self, code: P::Code, cadence: Cadence, enabled: bool) {
        debug!(
            "{}: {code} {} read {}",
            self.shared.name,
            cadence_name(cadence),
            if enabled { "enabled" } else { "disabled" }
        );
        self.set_enabled_quiet(code, cadence, enabled);
    }

    /// [`Self::set_enabled`] without logging, for bulk updates
    pub fn set_enabled_quiet(&self, code: P::Code, cadence: Cadence, enabled: bool) {
        self.shared.table.set_enabled(code, cadence, enabled);
    }

    pub fn disable_all(&self) {
        self.shared.table.disable_all();
    }

    #[must_use]
    pub fn slow_read_interval(&self) -> u32 {
        self.shared.slow_read_interval.load(Ordering::Acquire)
    }

    /// Set how many fast cycles run between slow cycles.
    ///
    /// Takes effect from the next cycle. Links without a slow cadence ignore it.
    pub fn set_slow_read_interval(&self, interval: u32) -> Result<(), ConfigError> {
        if interval == 0 {
            return Err(ConfigError::InvalidInterval { interval });
        }
        debug!("{}: slow read interval set to {interval}", self.shared.name);
        self.shared
            .slow_read_interval
            .store(interval, Ordering::Release);
        Ok(())
    }
}

const fn cadence_name(cadence: Cadence) -> &'static str {
    match cadence {
        Cadence::Fast => "fast",
        Cadence::Slow => "slow",
    }
}

/// A link and the thread polling it.
///
/// Dereferences to [`LinkHandle`] for configuration and queries.
pub struct CommLink<P: Protocol> {
    handle: LinkHandle<P>,
    timing: RecoveryTiming,
    idle: Option<(P, Box<dyn LinkDriver>)>,
    worker: Option<JoinHandle<Finished<P>>>,
}

impl<P: Protocol> Deref for CommLink<P> {
    type Target = LinkHandle<P>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<P: Protocol> CommLink<P> {
    /// Create a stopped link with an empty table
    pub fn new(protocol: P, link: Box<dyn LinkDriver>) -> Self {
        let shared = Shared {
            name: format!("{}@{}", P::NAME, link.name()),
            table: ParameterTable::new(),
            hub: NotificationHub::default(),
            stop_requested: AtomicBool::new(false),
            state: AtomicU8::new(LinkState::Stopped as u8),
            slow_read_interval: AtomicU32::new(DEFAULT_SLOW_READ_INTERVAL),
        };
        Self {
            handle: LinkHandle {
                shared: Arc::new(shared),
            },
            timing: RecoveryTiming::default(),
            idle: Some((protocol, link)),
            worker: None,
        }
    }

    #[must_use]
    pub fn with_timing(mut self, timing: RecoveryTiming) -> Self {
        self.timing = timing;
        self
    }

    /// A handle that outlives borrows of this link
    #[must_use]
    pub fn handle(&self) -> LinkHandle<P> {
        self.handle.clone()
    }

    /// Open the link and start polling on a new thread.
    pub fn start(&mut self) -> Result<(), LinkError> {
        let name = self.handle.shared.name.clone();
        // A failed loop is on its way out and only needs joining
        let busy = self.worker.as_ref().is_some_and(|w| !w.is_finished());
        if busy && self.state() != LinkState::Failed {
            return Err(LinkError::AlreadyRunning { name });
        }
        self.reap();

        let (protocol, mut link) = self
            .idle
            .take()
            .ok_or_else(|| LinkError::Unavailable { name: name.clone() })?;
        if let Err(e) = link.open() {
            self.idle = Some((protocol, link));
            return Err(e);
        }

        let shared = Arc::clone(&self.handle.shared);
        let timing = self.timing;
        shared.stop_requested.store(false, Ordering::Release);
        shared.set_state(LinkState::Running);

        let spawned = crate::thread_util::spawn_named(&name, move || {
            let mut protocol = protocol;
            let mut link = link;
            let result = run_loop(&shared, &mut protocol, link.as_mut(), timing);
            Finished {
                protocol,
                link,
                result,
            }
        });
        match spawned {
            Ok(worker) => {
                info!("{name}: started");
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                error!("{name}: failed to spawn loop thread: {e}");
                self.handle.shared.set_state(LinkState::Stopped);
                Err(LinkError::Io { source: e })
            }
        }
    }

    /// Stop polling after the current cycle, wait for the thread and close the link.
    ///
    /// Returns the loop's error if it had already stopped itself. Stopping a
    /// link that was never started does nothing.
    pub fn stop(&mut self) -> Result<(), LinkError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let shared = &self.handle.shared;
        info!("{}: stopping", shared.name);
        shared.stop_requested.store(true, Ordering::Release);
        self.finish(worker)
    }

    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = self.finish(worker) {
                debug!("{}: previous session ended with: {e}", self.handle.shared.name);
            }
        }
    }

    fn finish(&mut self, worker: JoinHandle<Finished<P>>) -> Result<(), LinkError> {
        let shared = &self.handle.shared;
        match worker.join() {
            Ok(Finished {
                protocol,
                mut link,
                result,
            }) => {
                link.close();
                self.idle = Some((protocol, link));
                if result.is_ok() {
                    shared.set_state(LinkState::Stopped);
                    info!("{}: stopped", shared.name);
                }
                result
            }
            Err(_) => {
                error!("{}: loop thread panicked", shared.name);
                shared.set_state(LinkState::Stopped);
                Err(LinkError::Unavailable {
                    name: shared.name.clone(),
                })
            }
        }
    }
}

impl<P: Protocol> Drop for CommLink<P> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("{}: {e}", self.handle.shared.name);
        }
    }
}

fn run_loop<P: Protocol>(
    shared: &Shared<P>,
    protocol: &mut P,
    link: &mut dyn LinkDriver,
    timing: RecoveryTiming,
) -> Result<(), LinkError> {
    let name = shared.name.as_str();
    let mut session = LinkSession::default();
    debug!("{name}: loop running");

    while !shared.stop_requested.load(Ordering::Acquire) {
        let cadence = if P::HAS_SLOW_CADENCE {
            session.next_cadence(shared.slow_read_interval.load(Ordering::Acquire))
        } else {
            Cadence::Fast
        };

        match protocol.run_cycle(link, &shared.table, cadence) {
            Ok(CycleOutcome::Received(data)) => {
                session.reset_count = 0;
                shared.hub.publish(&LinkEvent::Received(data));
            }
            // Nothing was exchanged, so the link's health is unknown
            Ok(CycleOutcome::Idle) => {
                if cadence == Cadence::Fast {
                    std::thread::sleep(timing.idle_delay);
                }
            }
            Ok(CycleOutcome::Aborted) => {
                session.reset_count = 0;
            }
            Err(e) => {
                session.reset_count += 1;
                if session.reset_count > MAX_CONSECUTIVE_RESETS || !e.is_recoverable() {
                    let resets = session.reset_count;
                    error!("{name}: {e}; giving up after {resets} consecutive failures");
                    shared.set_state(LinkState::Failed);
                    shared.hub.publish(&LinkEvent::Fatal {
                        resets,
                        reason: e.to_string(),
                    });
                    link.close();
                    return Err(if e.is_recoverable() {
                        LinkError::RetriesExhausted { resets }
                    } else {
                        e
                    });
                }
                warn!(
                    "{name}: {e}; resetting link ({}/{MAX_CONSECUTIVE_RESETS})",
                    session.reset_count
                );
                recover(link, timing.settle_delay, name);
            }
        }
    }

    debug!("{name}: loop exiting");
    Ok(())
}

/// Flush, close, wait, and reopen. A failed reopen surfaces on the next cycle.
fn recover(link: &mut dyn LinkDriver, settle_delay: Duration, name: &str) {
    if let Err(e) = link.discard_input() {
        debug!("{name}: discard input failed: {e}");
    }
    if let Err(e) = link.discard_output() {
        debug!("{name}: discard output failed: {e}");
    }
    link.close();
    std::thread::sleep(settle_delay);
    if let Err(e) = link.open() {
        warn!("{name}: reopen failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ScriptedLink;
    use crate::table::tests::TestCode;

    /// Reads one byte per cycle; 0xFF is a decode failure and 0xEE aborts.
    struct ByteProtocol;

    impl Protocol for ByteProtocol {
        type Code = TestCode;
        type Data = (Cadence, u8);
        const NAME: &'static str = "byte";
        const HAS_SLOW_CADENCE: bool = true;

        fn run_cycle(
            &mut self,
            link: &mut dyn LinkDriver,
            table: &ParameterTable<TestCode>,
            cadence: Cadence,
        ) -> Result<CycleOutcome<Self::Data>, LinkError> {
            let mut byte = [0u8; 1];
            link.read_exact(&mut byte)?;
            match byte[0] {
                0xFF => Err(crate::error::FrameError::EmptyLine.into()),
                0xEE => Ok(CycleOutcome::Aborted),
                b => {
                    table.set_raw(TestCode::Alpha, i32::from(b));
                    Ok(CycleOutcome::Received((cadence, b)))
                }
            }
        }
    }

    /// Reads a byte on fast cycles and has nothing to ask on slow ones
    struct FastOnlyProtocol;

    impl Protocol for FastOnlyProtocol {
        type Code = TestCode;
        type Data = u8;
        const NAME: &'static str = "fast-only";
        const HAS_SLOW_CADENCE: bool = true;

        fn run_cycle(
            &mut self,
            link: &mut dyn LinkDriver,
            _table: &ParameterTable<TestCode>,
            cadence: Cadence,
        ) -> Result<CycleOutcome<Self::Data>, LinkError> {
            if cadence == Cadence::Slow {
                return Ok(CycleOutcome::Idle);
            }
            let mut byte = [0u8; 1];
            link.read_exact(&mut byte)?;
            Ok(CycleOutcome::Received(byte[0]))
        }
    }

    fn fast_timing() -> RecoveryTiming {
        RecoveryTiming {
            settle_delay: Duration::from_millis(20),
            idle_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_cadence_goes_slow_after_interval() {
        let mut session = LinkSession::default();
        let cadences: Vec<_> = (0..8).map(|_| session.next_cadence(3)).collect();
        assert_eq!(
            cadences,
            [
                Cadence::Fast,
                Cadence::Fast,
                Cadence::Fast,
                Cadence::Slow,
                Cadence::Fast,
                Cadence::Fast,
                Cadence::Fast,
                Cadence::Slow,
            ]
        );
    }

    #[test]
    fn test_zero_slow_read_interval_is_rejected() {
        let (link, _script) = ScriptedLink::new("bytes");
        let comm = CommLink::new(ByteProtocol, Box::new(link));
        assert_eq!(
            comm.set_slow_read_interval(0),
            Err(ConfigError::InvalidInterval { interval: 0 })
        );
        assert_eq!(comm.slow_read_interval(), DEFAULT_SLOW_READ_INTERVAL);
        comm.set_slow_read_interval(3).unwrap();
        assert_eq!(comm.slow_read_interval(), 3);
    }

    #[test]
    fn test_link_state_roundtrip() {
        for state in [LinkState::Stopped, LinkState::Running, LinkState::Failed] {
            assert_eq!(LinkState::from_u8(state as u8), state);
        }
        assert_eq!(LinkState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_events_arrive_in_cycle_order() {
        let (link, script) = ScriptedLink::new("bytes");
        script.push_data(&[1, 2, 3]);
        let mut comm = CommLink::new(ByteProtocol, Box::new(link));
        let events = comm.subscribe();
        comm.start().unwrap();

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match events.recv_timeout(Duration::from_secs(5)) {
                Some(LinkEvent::Received((_, b))) => seen.push(b),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(seen, [1, 2, 3]);
        assert_eq!(comm.raw_value(TestCode::Alpha), 3);
        comm.stop().unwrap();
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (link, _script) = ScriptedLink::new("bytes");
        let mut comm = CommLink::new(ByteProtocol, Box::new(link));
        comm.start().unwrap();
        assert!(matches!(comm.start(), Err(LinkError::AlreadyRunning { .. })));
        comm.stop().unwrap();
        assert_eq!(comm.state(), LinkState::Stopped);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let (link, script) = ScriptedLink::new("bytes");
        let mut comm = CommLink::new(ByteProtocol, Box::new(link));
        comm.stop().unwrap();
        assert_eq!(script.opens(), 0);
        assert!(!comm.is_running());
    }

    #[test]
    fn test_restart_after_stop() {
        let (link, script) = ScriptedLink::new("bytes");
        let mut comm = CommLink::new(ByteProtocol, Box::new(link));
        let events = comm.subscribe();

        comm.start().unwrap();
        comm.stop().unwrap();
        assert_eq!(script.closes(), script.opens());

        script.push_data(&[9]);
        comm.start().unwrap();
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)),
            Some(LinkEvent::Received((_, 9)))
        ));
        comm.stop().unwrap();
    }

    #[test]
    fn test_aborted_cycle_resets_failure_count() {
        let (link, script) = ScriptedLink::new("bytes");
        // Twenty failures, an abort, then twenty more: never fatal
        let mut steps = vec![0xFF; MAX_CONSECUTIVE_RESETS as usize];
        steps.push(0xEE);
        steps.extend(std::iter::repeat(0xFF).take(MAX_CONSECUTIVE_RESETS as usize));
        steps.push(7);
        for b in steps {
            script.push_data(&[b]);
        }
        let mut comm = CommLink::new(ByteProtocol, Box::new(link)).with_timing(fast_timing());
        let events = comm.subscribe();
        comm.start().unwrap();

        assert!(matches!(
            events.recv_timeout(Duration::from_secs(10)),
            Some(LinkEvent::Received((_, 7)))
        ));
        assert!(comm.is_running());
        comm.stop().unwrap();
    }

    #[test]
    fn test_idle_cycles_do_not_reset_failure_count() {
        let (link, script) = ScriptedLink::new("bytes");
        let mut comm = CommLink::new(FastOnlyProtocol, Box::new(link)).with_timing(fast_timing());
        // Every other cycle is an idle slow cycle between timed out fast ones
        comm.set_slow_read_interval(1).unwrap();
        let events = comm.subscribe();
        comm.start().unwrap();

        match events.recv_timeout(Duration::from_secs(10)) {
            Some(LinkEvent::Fatal { resets, .. }) => assert_eq!(resets, MAX_CONSECUTIVE_RESETS + 1),
            other => panic!("expected fatal event, got {other:?}"),
        }
        assert!(matches!(
            comm.stop(),
            Err(LinkError::RetriesExhausted { .. })
        ));
        assert_eq!(comm.state(), LinkState::Failed);
        assert_eq!(script.opens(), MAX_CONSECUTIVE_RESETS + 1);
    }

    #[test]
    fn test_open_failure_at_start_is_returned() {
        let (link, script) = ScriptedLink::new("bytes");
        script.fail_next_opens(1);
        let mut comm = CommLink::new(ByteProtocol, Box::new(link));
        assert!(matches!(comm.start(), Err(LinkError::Open { .. })));
        assert_eq!(comm.state(), LinkState::Stopped);

        comm.start().unwrap();
        assert!(comm.is_running());
        comm.stop().unwrap();
    }
}

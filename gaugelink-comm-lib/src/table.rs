//! In-memory parameter table shared between a communication loop and its
//! configuration/query callers.
//!
//! Each entry is a set of atomics, so the loop can write raw values while
//! other threads read values or toggle read flags without a table-wide lock.
//! Engineering values are derived from the raw value on read, so a value can
//! never disagree with the raw value it came from.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Ordered list of codes queried or updated in one cycle
pub type CodeList<C> = SmallVec<[C; 16]>;

/// Polling rate class for SSM queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    /// Read every cycle
    Fast,
    /// Read once every slow-read interval
    Slow,
}

/// A protocol-scoped parameter identifier.
///
/// Implementors are dense fieldless enums. `ALL` lists every variant in
/// declaration order and `index()` must equal the variant's position in
/// `ALL`; that order is the wire order for query frames.
pub trait ParameterCode:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Every code, in declaration order
    const ALL: &'static [Self];

    /// Position of this code in [`Self::ALL`]
    fn index(self) -> usize;

    /// Display unit of the converted value
    fn unit(self) -> &'static str;

    /// Convert a raw wire value into engineering units.
    ///
    /// Total over the whole `i32` domain: out-of-range input gives an
    /// out-of-range value, never an error.
    fn convert(self, raw: i32) -> f64;
}

/// Snapshot of one parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub raw: i32,
    pub value: f64,
    pub unit: &'static str,
}

#[derive(Debug, Default)]
struct ParameterEntry {
    raw: AtomicI32,
    fast_read: AtomicBool,
    slow_read: AtomicBool,
}

impl ParameterEntry {
    fn flag(&self, cadence: Cadence) -> &AtomicBool {
        match cadence {
            Cadence::Fast => &self.fast_read,
            Cadence::Slow => &self.slow_read,
        }
    }
}

/// Latest raw value and read flags for every code of one protocol.
pub struct ParameterTable<C: ParameterCode> {
    entries: Box<[ParameterEntry]>,
    _codes: std::marker::PhantomData<C>,
}

impl<C: ParameterCode> Default for ParameterTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ParameterCode> fmt::Debug for ParameterTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(C::ALL.iter().map(|&code| (code, self.raw_value(code))))
            .finish()
    }
}

impl<C: ParameterCode> ParameterTable<C> {
    /// Create a table with every raw value zero and every read flag off
    #[must_use]
    pub fn new() -> Self {
        let entries = C::ALL.iter().map(|_| ParameterEntry::default()).collect();
        Self {
            entries,
            _codes: std::marker::PhantomData,
        }
    }

    fn entry(&self, code: C) -> &ParameterEntry {
        &self.entries[code.index()]
    }

    #[must_use]
    pub fn get(&self, code: C) -> Reading {
        let raw = self.raw_value(code);
        Reading {
            raw,
            value: code.convert(raw),
            unit: code.unit(),
        }
    }

    #[must_use]
    pub fn raw_value(&self, code: C) -> i32 {
        self.entry(code).raw.load(Ordering::Acquire)
    }

    /// Engineering value, always `code.convert(self.raw_value(code))`
    #[must_use]
    pub fn value(&self, code: C) -> f64 {
        code.convert(self.raw_value(code))
    }

    #[must_use]
    pub fn unit(&self, code: C) -> &'static str {
        code.unit()
    }

    pub fn set_raw(&self, code: C, raw: i32) {
        self.entry(code).raw.store(raw, Ordering::Release);
    }

    /// Store a whole cycle's decoded values.
    pub fn commit(&self, updates: &[(C, i32)]) {
        for &(code, raw) in updates {
            self.set_raw(code, raw);
        }
    }

    #[must_use]
    pub fn enabled(&self, code: C, cadence: Cadence) -> bool {
        self.entry(code).flag(cadence).load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, code: C, cadence: Cadence, enabled: bool) {
        self.entry(code).flag(cadence).store(enabled, Ordering::Release);
    }

    /// Turn off both read flags of every code
    pub fn disable_all(&self) {
        for entry in &*self.entries {
            entry.fast_read.store(false, Ordering::Release);
            entry.slow_read.store(false, Ordering::Release);
        }
        debug!("All read flags cleared");
    }

    /// Codes enabled for `cadence`, in declaration order.
    ///
    /// This is a snapshot: flags toggled after the call do not affect it.
    #[must_use]
    pub fn enabled_codes(&self, cadence: Cadence) -> CodeList<C> {
        C::ALL
            .iter()
            .copied()
            .filter(|&code| self.enabled(code, cadence))
            .collect()
    }
}

// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Wall-clock abstraction
//!
//! The seasonal valve policy depends on the calendar month and the staleness
//! checks on elapsed milliseconds. Both read the clock through this trait so
//! tests can pin time deterministically.

use chrono::{Datelike, Utc};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current calendar month, 1..=12.
    fn month(&self) -> u32;

    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn month(&self) -> u32 {
        Utc::now().month()
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Fixed clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    month: std::sync::atomic::AtomicU32,
    now_ms: std::sync::atomic::AtomicI64,
}

impl FixedClock {
    /// Create a clock pinned to the given month and timestamp.
    pub fn new(month: u32, now_ms: i64) -> Self {
        Self {
            month: std::sync::atomic::AtomicU32::new(month),
            now_ms: std::sync::atomic::AtomicI64::new(now_ms),
        }
    }

    /// Move the pinned timestamp.
    pub fn set_now_ms(&self, now_ms: i64) {
        self.now_ms
            .store(now_ms, std::sync::atomic::Ordering::Relaxed);
    }

    /// Move the pinned month.
    pub fn set_month(&self, month: u32) {
        self.month
            .store(month, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn month(&self) -> u32 {
        self.month.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn now_ms(&self) -> i64 {
        self.now_ms.load(std::sync::atomic::Ordering::Relaxed)
    }
}

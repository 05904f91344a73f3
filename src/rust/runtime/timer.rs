// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::time::{
    Duration,
    Instant,
};

//==============================================================================
// Structures
//==============================================================================

/// Logical clock of a request queue.
///
/// Time only moves when the owner calls [Clock::advance_clock], so expiry decisions are reproducible.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    now: Instant,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Clock {
    pub fn new(now: Instant) -> Self {
        Self { now }
    }

    pub fn advance_clock(&mut self, now: Instant) {
        assert!(self.now <= now);
        self.now = now;
    }

    /// Moves the clock forward by `delta`.
    pub fn advance_by(&mut self, delta: Duration) {
        self.now += delta;
    }

    pub fn now(&self) -> Instant {
        self.now
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

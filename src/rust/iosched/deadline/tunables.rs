// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::Config,
    runtime::fail::Fail,
};
use ::std::{
    sync::OnceLock,
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Default time a read may wait before it is served out of sector order.
pub const DEFAULT_READ_EXPIRE: Duration = Duration::from_millis(500);

/// Default cost budget of a batch.
pub const DEFAULT_FIFO_BATCH: u32 = 32;

/// Default cost of a non-contiguous request.
pub const DEFAULT_SEEK_COST: u32 = 16;

/// Default number of read batches that may run while writes wait.
pub const DEFAULT_WRITES_STARVED: u32 = 2;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Tunables captured when the scheduler module was loaded.
static MODULE_TUNABLES: OnceLock<Tunables> = OnceLock::new();

//======================================================================================================================
// Structures
//======================================================================================================================

/// Deadline scheduler tunables.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Tunables {
    /// How long a read may stay queued before it is served ahead of the sector order.
    pub read_expire: Duration,
    /// Cost budget of one dispatch batch.
    pub fifo_batch: u32,
    /// Cost of a request that does not continue where the previous one ended.
    pub seek_cost: u32,
    /// Read batches allowed to go ahead of pending writes.
    pub writes_starved: u32,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Tunables {
    /// Reads tunables from a configuration object.
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            read_expire: config.read_expire()?,
            fifo_batch: config.fifo_batch()?,
            seek_cost: config.seek_cost()?,
            writes_starved: config.writes_starved()?,
        })
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Captures process-wide tunables. Must run before the first scheduler is attached; fails with `EEXIST` afterwards.
pub fn load(tunables: Tunables) -> Result<(), Fail> {
    match MODULE_TUNABLES.set(tunables) {
        Ok(()) => {
            debug!("load(): {:?}", tunables);
            Ok(())
        },
        Err(_) => {
            let cause: &str = "deadline tunables already captured";
            warn!("load(): {}", cause);
            Err(Fail::new(libc::EEXIST, cause))
        },
    }
}

/// Tunables every new scheduler starts from. Defaults are captured if nothing was loaded.
pub fn current() -> Tunables {
    *MODULE_TUNABLES.get_or_init(Tunables::default)
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Tunables {
    fn default() -> Self {
        Self {
            read_expire: DEFAULT_READ_EXPIRE,
            fifo_batch: DEFAULT_FIFO_BATCH,
            seek_cost: DEFAULT_SEEK_COST,
            writes_starved: DEFAULT_WRITES_STARVED,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

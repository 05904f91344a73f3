// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::libc::{
    c_int,
    EIO,
    ENOMEM,
};
use ::std::{
    collections::TryReserveError,
    error,
    fmt,
    io,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure of a queue or scheduler operation. Carries a libc error code, so that callers can tell exhausted pools
/// (`EAGAIN`), bad arguments (`EINVAL`), and failed attaches (`ENOMEM`) apart.
#[derive(Clone, Eq, PartialEq)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Fail {
    pub fn new(errno: c_int, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

impl error::Error for Fail {}

/// Configuration files that cannot be read.
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: format!("I/O error: {}", e),
        }
    }
}

/// Failed reservations surface as out-of-memory.
impl From<TryReserveError> for Fail {
    fn from(e: TryReserveError) -> Self {
        Self {
            errno: ENOMEM,
            cause: format!("allocation failed: {}", e),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Fail;
    use ::anyhow::Result;
    use ::std::collections::TryReserveError;

    #[test]
    fn failed_reservation_is_enomem() -> Result<()> {
        let mut v: Vec<u64> = Vec::new();
        let e: TryReserveError = match v.try_reserve_exact(usize::MAX) {
            Err(e) => e,
            Ok(()) => anyhow::bail!("reserved usize::MAX elements"),
        };
        crate::ensure_eq!(Fail::from(e).errno, libc::ENOMEM);
        Ok(())
    }
}

//! Definition of error and status.

use std::error::Error;
use std::fmt;

/// Failure status of the thread index facility
#[derive(PartialEq, Copy, Clone, Debug)]
pub enum Status {
    /// Thread number overflow
    ThreadNumOverflow,
    /// Invalid parameter
    InvalidParam,
    /// Thread index held by another thread
    Busy,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for Status {}

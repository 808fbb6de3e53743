//! Kernel error types
//!
//! Errors are reported at operation boundaries as `Result` values and are
//! never thrown through control flow. Fatal conditions (boot capability
//! failures, unhandled CPU exceptions) halt instead of returning.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// An allocator could not satisfy the request.
    OutOfMemory { requested: usize },
    /// The device was not found at probe time; the subsystem is dormant.
    DeviceAbsent { device: &'static str },
    /// A counted-iteration poll on device status ran out of iterations.
    Timeout { device: &'static str },
    /// The device reported an error condition.
    HardwareError { device: &'static str, code: u32 },
    /// A caller-supplied argument was rejected.
    InvalidArgument { name: &'static str },
    /// The operation cannot make progress right now; retry later.
    WouldBlock,
    /// Subsystem used before its `init()` ran.
    NotInitialized { subsystem: &'static str },
}

/// Convenient result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} bytes)", requested)
            }
            KernelError::DeviceAbsent { device } => write!(f, "device absent: {}", device),
            KernelError::Timeout { device } => write!(f, "timeout waiting on {}", device),
            KernelError::HardwareError { device, code } => {
                write!(f, "hardware error on {} (code {:#x})", device, code)
            }
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
            KernelError::WouldBlock => write!(f, "operation would block"),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

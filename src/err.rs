use thiserror::Error;

/// Error taxonomy of the driver, storage and event-loop layers.
///
/// None of these terminate the process on their own; the runtime decides
/// whether a failure is fatal (during init) or survivable (at runtime).
#[derive(Debug, Error)]
pub enum DriverError {
    /// Caller contract violated; the operation had no side effect.
    #[error("illegal argument")]
    IllegalArgument,

    /// A kernel or OS call failed.
    #[error("syscall failed: {0}")]
    Syscall(#[from] std::io::Error),

    /// Target CAN network couldn't be found.
    #[error("CAN device lookup failed: {0}")]
    Lookup(nix::Error),

    /// Operation attempted in a mode that forbids it, e.g. adding an
    /// interface after the module entered normal mode.
    #[error("operation not allowed in the current state")]
    InvalidState,

    /// Transient transmit rejection; the frame stays queued and is re-sent
    /// from the mainline tick.
    #[error("transmit queue full, frame re-queued")]
    TxBusy,

    /// Terminal transmit rejection; the frame was dropped.
    #[error("transmit path overflowed, frame dropped")]
    TxOverflow,

    /// Persisted data failed length or CRC verification. Non-fatal:
    /// defaults remain in effect.
    #[error("stored data corrupt")]
    DataCorrupt,

    /// Surfaced verbatim from the protocol layer when the node-id is left
    /// to LSS configuration.
    #[error("node-id unconfigured, waiting for LSS")]
    NodeIdUnconfigured,
}

impl From<nix::Error> for DriverError {
    fn from(e: nix::Error) -> Self {
        match e.as_errno() {
            Some(errno) => DriverError::Syscall(std::io::Error::from_raw_os_error(errno as i32)),
            None => DriverError::Syscall(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::from_raw_os_error(libc::ENOBUFS);
        match DriverError::from(io) {
            DriverError::Syscall(e) => assert_eq!(e.raw_os_error(), Some(libc::ENOBUFS)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn nix_error_converts() {
        let e = nix::Error::Sys(nix::errno::Errno::EAGAIN);
        match DriverError::from(e) {
            DriverError::Syscall(e) => assert_eq!(e.raw_os_error(), Some(libc::EAGAIN)),
            other => panic!("unexpected {:?}", other),
        }
    }
}

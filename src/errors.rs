use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::bpf::CompileError;

#[derive(Error, Debug)]
pub enum Error {
    /// No packet (or send resource) became available within the timeout.
    #[error("Resource temporarily unavailable")]
    WouldBlock,
    /// A blocking driver call was interrupted.
    #[error("Interrupted driver call")]
    Interrupted,
    /// The handle or ring is no longer operational.
    #[error("End of stream")]
    EndOfStream,
    #[error("Resource busy: {0}")]
    Busy(&'static str),
    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] CompileError),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("No such port: {0}")]
    NoDevice(u32),
    #[error("Can't allocate memory")]
    NoMemory,
    #[error("Too big packet: {0}")]
    TooBigPacket(usize),
    #[error("Operation not supported")]
    NotSupported,
    #[error("Driver error: {0}")]
    Driver(Errno),
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps a positive errno returned by the capture driver.
    pub fn from_errno(code: i32) -> Self {
        match Errno::from_raw(code) {
            Errno::EAGAIN => Error::WouldBlock,
            Errno::EINTR => Error::Interrupted,
            Errno::EBUSY => Error::Busy("driver resource in use"),
            Errno::ENOMEM => Error::NoMemory,
            Errno::ENOTSUP => Error::NotSupported,
            Errno::EINVAL => Error::InvalidArgument("rejected by driver".to_string()),
            errno => Error::Driver(errno),
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }

    /// Anything that is not a transient would-block or interrupt.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::WouldBlock | Error::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert!(Error::from_errno(libc::EAGAIN).is_would_block());
        assert!(matches!(Error::from_errno(libc::EINTR), Error::Interrupted));
        assert!(Error::from_errno(libc::EBUSY).is_busy());
        assert!(matches!(Error::from_errno(libc::ENOMEM), Error::NoMemory));
        assert!(matches!(
            Error::from_errno(libc::EIO),
            Error::Driver(Errno::EIO)
        ));
    }

    #[test]
    fn test_terminal() {
        assert!(!Error::WouldBlock.is_terminal());
        assert!(!Error::Interrupted.is_terminal());
        assert!(Error::EndOfStream.is_terminal());
    }
}

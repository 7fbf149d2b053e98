/*!
Error taxonomy for the readout loop.

A readout iteration ends in either a completed cycle or a [`ReadoutError`].
Transient errors (a missed timecode, a late data packet, a failed command)
end the current iteration only; the loop resynchronises on the next sync
pulse. Fatal errors terminate the processor.
*/

use shared::SharedError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReadoutError {
    /// A 0 or 1 byte packet was read, which usually means the link dropped
    #[error("no bytes received, lost connection to the front-end?")]
    NoBytesReceived,

    /// No timecode arrived within the timecode wait window
    #[error("timeout while waiting for the next timecode")]
    TimecodeTimeout,

    /// The link delivered a different packet class than the cycle expects
    #[error("expected a {expected}, but got {got}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },

    /// The data phase ran past the deadline after which commanding would be
    /// discarded by the front-end
    #[error("retrieving data packets exceeded the allowed time window")]
    DataDeadlineExceeded,

    /// A command failed while being sent to the front-end
    #[error("command {name} failed: {source}")]
    Command {
        name: &'static str,
        source: SharedError,
    },

    /// Transport or register map failures. Storage failures never reach
    /// this: saves are fire and forget and only logged.
    #[error(transparent)]
    Shared(#[from] SharedError),

    /// The processor was asked to quit before initialisation completed
    #[error("processor aborted during initialisation")]
    Aborted,
}

impl ReadoutError {
    /// Transient errors abort the current readout iteration; the loop picks
    /// up again at the next sync pulse. Everything else stops the processor.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReadoutError::NoBytesReceived
                | ReadoutError::TimecodeTimeout
                | ReadoutError::UnexpectedPacket { .. }
                | ReadoutError::DataDeadlineExceeded
                | ReadoutError::Command { .. }
        )
    }

    /// Transient errors that are part of normal idle operation and are not
    /// worth a log line (waiting for a front-end that is not sending yet)
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            ReadoutError::TimecodeTimeout | ReadoutError::NoBytesReceived
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ReadoutError::TimecodeTimeout.is_transient());
        assert!(ReadoutError::DataDeadlineExceeded.is_transient());
        assert!(!ReadoutError::Aborted.is_transient());
        assert!(!ReadoutError::Shared(SharedError::new("link gone")).is_transient());
    }

    #[test]
    fn test_silent_classification() {
        assert!(ReadoutError::TimecodeTimeout.is_silent());
        assert!(!ReadoutError::DataDeadlineExceeded.is_silent());
    }
}

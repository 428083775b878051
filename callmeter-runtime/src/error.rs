use crate::selector::Slot;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid profiler config: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid function key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("function key {key:?} contains byte 0x{byte:02x} at offset {offset}, outside the trie alphabet (0x00-0x7e)")]
    UnsupportedByte { key: String, byte: u8, offset: usize },

    #[error("failed to {op} CPU affinity: {source}")]
    Affinity {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("calibration failed on cpu {cpu}: {reason}")]
    Calibration { cpu: usize, reason: String },

    #[error("cpu {0} is not in the calibrated set")]
    UncalibratedCpu(usize),

    #[error("call exit without a matching tracked enter (empty call stack)")]
    EmptyStack,

    #[error("stat slot {slot} is outside the table (size {len})")]
    SlotOutOfRange { slot: Slot, len: usize },

    #[error("frame pool exhausted at {limit} frames")]
    PoolExhausted { limit: usize },

    #[error("profiler is not enabled")]
    NotEnabled,

    #[error("operation not valid while the profiler is {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// True for errors caused by a broken enter/exit pairing on the host side.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::EmptyStack | Error::SlotOutOfRange { .. })
    }
}

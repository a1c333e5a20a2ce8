//! Fixed-Size Wire Records
//!
//! Records distributed through the broadcast primitive travel as opaque
//! buffers of exactly [`WireRecord::WIRE_SIZE`] bytes. Fields are written
//! little-endian at fixed offsets so every task agrees on the layout
//! regardless of how the host lays out the struct.

use thiserror::Error;

/// Decoding failures for fixed-size records
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A record with a fixed binary layout
pub trait WireRecord: Sized {
    /// Exact encoded size in bytes
    const WIRE_SIZE: usize;

    /// Write the record into `buf`, which is exactly `WIRE_SIZE` bytes
    fn encode(&self, buf: &mut [u8]);

    /// Read a record from `buf`, which is exactly `WIRE_SIZE` bytes
    fn decode(buf: &[u8]) -> Result<Self, WireError>;

    /// Encode into a fresh buffer
    fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::WIRE_SIZE];
        self.encode(&mut buf);
        buf
    }

    /// Decode after checking the buffer length
    fn from_wire(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(WireError::SizeMismatch {
                expected: Self::WIRE_SIZE,
                actual: buf.len(),
            });
        }
        Self::decode(buf)
    }
}

impl WireRecord for u64 {
    const WIRE_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(buf);
        Ok(u64::from_le_bytes(bytes))
    }
}

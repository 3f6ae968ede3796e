use thiserror::Error;

/// Errors shared by both sensor drivers and the bus transport.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("i2c bus error: {0}")]
    Bus(#[from] rppal::i2c::Error),

    #[error("short write to register 0x{register:02X}: {written} of {expected} bytes")]
    ShortWrite {
        register: u8,
        written: usize,
        expected: usize,
    },

    #[error("short read from register 0x{register:02X}: {read} of {expected} bytes")]
    ShortRead {
        register: u8,
        read: usize,
        expected: usize,
    },

    #[error("unexpected chip id 0x{found:02X}, expected 0x{expected:02X}")]
    ChipId { found: u8, expected: u8 },

    #[error("record output error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SensorError>;

//! Register-addressed I2C transport.
//!
//! Register reads follow the i2c-dev convention: write one byte (the
//! register address) to set the device's register pointer, then read the
//! requested number of bytes from the same handle. Both halves must
//! transfer completely or the whole call fails; after a partial transfer
//! the device's register pointer is undefined, so nothing is retried here.
//! cf. https://www.kernel.org/doc/Documentation/i2c/dev-interface

use rppal::i2c::I2c;

use crate::error::{Result, SensorError};

pub trait RegisterBus {
    /// Selects `register`, then reads exactly `buffer.len()` bytes.
    fn read_register(&mut self, register: u8, buffer: &mut [u8]) -> Result<()>;

    /// Writes the buffer as-is; `buffer[0]` is the destination register.
    fn write_raw(&mut self, buffer: &[u8]) -> Result<()>;

    /// Single-value register write (exactly 2 bytes on the wire).
    fn write_register(&mut self, register: u8, value: u8) -> Result<()> {
        self.write_raw(&[register, value])
    }
}

/// An opened, address-bound connection to one peripheral.
pub struct I2cBus {
    i2c: I2c,
}

impl I2cBus {
    pub fn open(bus: u8, address: u16) -> Result<I2cBus> {
        let mut i2c = I2c::with_bus(bus)?;
        i2c.set_slave_address(address)?;
        Ok(I2cBus { i2c })
    }
}

impl RegisterBus for I2cBus {
    fn read_register(&mut self, register: u8, buffer: &mut [u8]) -> Result<()> {
        let written = self.i2c.write(&[register])?;
        if written != 1 {
            return Err(SensorError::ShortWrite {
                register,
                written,
                expected: 1,
            });
        }

        let read = self.i2c.read(buffer)?;
        if read != buffer.len() {
            return Err(SensorError::ShortRead {
                register,
                read,
                expected: buffer.len(),
            });
        }

        Ok(())
    }

    fn write_raw(&mut self, buffer: &[u8]) -> Result<()> {
        let written = self.i2c.write(buffer)?;
        if written != buffer.len() {
            return Err(SensorError::ShortWrite {
                register: buffer[0],
                written,
                expected: buffer.len(),
            });
        }

        Ok(())
    }
}

/// Scripted in-memory bus for driver tests.
#[cfg(test)]
pub mod mock {
    use std::collections::{HashMap, VecDeque};

    use super::RegisterBus;
    use crate::error::{Result, SensorError};

    #[derive(Default)]
    pub struct MockBus {
        /// One-shot responses, consumed front to back per register.
        queued: HashMap<u8, VecDeque<Vec<u8>>>,
        /// Repeatable responses, used when the queue for a register is empty.
        sticky: HashMap<u8, Vec<u8>>,
        /// Every write issued, in order, including the register byte.
        pub writes: Vec<Vec<u8>>,
        /// When set, every read fails as a short read.
        pub fail_reads: bool,
    }

    impl MockBus {
        pub fn new() -> MockBus {
            MockBus::default()
        }

        pub fn stick(&mut self, register: u8, bytes: &[u8]) {
            self.sticky.insert(register, bytes.to_vec());
        }

        pub fn queue(&mut self, register: u8, bytes: &[u8]) {
            self.queued
                .entry(register)
                .or_insert_with(VecDeque::new)
                .push_back(bytes.to_vec());
        }

        pub fn queued_reads_remaining(&self, register: u8) -> usize {
            self.queued.get(&register).map_or(0, VecDeque::len)
        }
    }

    impl RegisterBus for MockBus {
        fn read_register(&mut self, register: u8, buffer: &mut [u8]) -> Result<()> {
            if self.fail_reads {
                return Err(SensorError::ShortRead {
                    register,
                    read: 0,
                    expected: buffer.len(),
                });
            }

            let bytes = self
                .queued
                .get_mut(&register)
                .and_then(VecDeque::pop_front)
                .or_else(|| self.sticky.get(&register).cloned())
                .ok_or(SensorError::ShortRead {
                    register,
                    read: 0,
                    expected: buffer.len(),
                })?;
            buffer.copy_from_slice(&bytes[..buffer.len()]);
            Ok(())
        }

        fn write_raw(&mut self, buffer: &[u8]) -> Result<()> {
            self.writes.push(buffer.to_vec());
            Ok(())
        }
    }
}

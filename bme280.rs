//! BME280 pressure/temperature/humidity driver.
//!
//! Register references follow the BME280 datasheet from Bosch, document
//! BST-BME280-DS001-10, revision 1.1.

use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::RegisterBus;
use crate::cancel::CancelToken;
use crate::compensation::{
    self, compensate_humidity, compensate_pressure, compensate_temperature, Compensation,
};
use crate::error::{Result, SensorError};
use crate::sink;

pub const I2C_BUS: u8 = 1;
pub const I2C_ADDR: u16 = 0x77;

pub const SAMPLE_PERIOD: Duration = Duration::from_millis(1000);

const CHIP_ID: u8 = 0x60;

const REG_CHIP_ID: u8 = 0xD0; // read only
const REG_CTRL_HUM: u8 = 0xF2;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_CALIB_TP: u8 = 0x88; // 24 bytes, temperature/pressure trimming
const REG_CALIB_H1: u8 = 0xA1; // 1 byte, first humidity trimming value
const REG_CALIB_HX: u8 = 0xE1; // 7 bytes, remaining humidity trimming
const REG_DATA: u8 = 0xF7; // 8-byte burst: pressure, temperature, humidity

const SETTING_SLEEP: u8 = 0x00;
const SETTING_STBY: u8 = 0xE0; // 111x xxxx = 250 ms standby (table 27)
const SETTING_FILTER: u8 = 0x10; // xxx1 00xx = IIR filter coeff 16
const SETTING_HUM_OS: u8 = 0x05; // xxxx x101 = 16x oversampling (table 20)
const SETTING_TEMP_OS: u8 = 0xA0; // 101x xxxx = 16x oversampling (table 24)
const SETTING_PRESS_OS: u8 = 0x14; // xxx1 01xx = 16x oversampling (table 23)
const SETTING_MODE_NORMAL: u8 = 0x03; // xxxx xx11 = normal mode (table 25)

/// One undecoded measurement burst.
///
/// Chapter 4 data readout: pressure and temperature are unsigned 20-bit,
/// humidity unsigned 16-bit, all widened to u32 here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub pressure: u32,
    pub temperature: u32,
    pub humidity: u32,
}

impl RawSample {
    pub const BURST_LEN: usize = 8;

    pub fn from_burst(buffer: &[u8; 8]) -> RawSample {
        RawSample {
            pressure: u32::from(buffer[0]) << 12 // press_msb
                | u32::from(buffer[1]) << 4 // press_lsb
                | u32::from(buffer[2]) >> 4, // press_xlsb
            temperature: u32::from(buffer[3]) << 12 // temp_msb
                | u32::from(buffer[4]) << 4 // temp_lsb
                | u32::from(buffer[5]) >> 4, // temp_xlsb
            humidity: u32::from(buffer[6]) << 8 // hum_msb
                | u32::from(buffer[7]), // hum_lsb
        }
    }
}

pub struct Bme280<B, W> {
    bus: B,
    out: W,
    comp: Compensation,
}

impl<B: RegisterBus, W: Write> Bme280<B, W> {
    /// Startup state machine: verify the chip identity, assemble the
    /// compensation table, then configure and enter normal mode.
    pub fn initialize(mut bus: B, out: W) -> Result<Bme280<B, W>> {
        let mut id = [0u8; 1];
        bus.read_register(REG_CHIP_ID, &mut id)?;
        if id[0] != CHIP_ID {
            return Err(SensorError::ChipId {
                found: id[0],
                expected: CHIP_ID,
            });
        }
        log::info!("pressure chip id 0x{:02X}", id[0]);

        let comp = read_compensation(&mut bus)?;
        configure(&mut bus)?;

        Ok(Bme280 { bus, out, comp })
    }

    /// Samples until cancelled or the bus fails. Every cycle reads one
    /// burst and derives all three values from it and from the same
    /// fine-temperature term.
    pub fn run_sampling_loop(&mut self, period: Duration, cancel: &CancelToken) -> Result<()> {
        while !cancel.is_cancelled() {
            let cycle_start = Instant::now();
            let stamp = sink::unix_time();

            let mut buffer = [0u8; RawSample::BURST_LEN];
            self.bus.read_register(REG_DATA, &mut buffer)?;
            let raw = RawSample::from_burst(&buffer);

            // Temperature first; pressure and humidity consume its
            // fine-temperature output.
            let (temperature, fine) = compensate_temperature(raw.temperature as i32, &self.comp);
            let pressure = compensate_pressure(raw.pressure as i32, &self.comp, fine);
            let humidity = compensate_humidity(raw.humidity as i32, &self.comp, fine);

            writeln!(
                self.out,
                "pressure@{}: {}, {}, {}, {}, {}, {}",
                stamp, raw.pressure, pressure, raw.temperature, temperature, raw.humidity, humidity
            )?;

            if let Some(remaining) = period.checked_sub(cycle_start.elapsed()) {
                thread::sleep(remaining);
            }
        }

        writeln!(self.out, "pressure read loop returning")?;
        Ok(())
    }
}

/// Three disjoint register windows concatenated into the 32-byte table;
/// the table must be complete before any compensation call.
fn read_compensation<B: RegisterBus>(bus: &mut B) -> Result<Compensation> {
    let mut table = [0u8; compensation::TABLE_LEN];
    bus.read_register(REG_CALIB_TP, &mut table[0..24])?;
    bus.read_register(REG_CALIB_H1, &mut table[24..25])?;
    bus.read_register(REG_CALIB_HX, &mut table[25..32])?;

    for (index, byte) in table.iter().enumerate() {
        log::debug!("pressure compensation byte {:02}: 0x{:02X}", index, byte);
    }
    let comp = Compensation::from_table(&table);
    log::debug!("pressure compensation unpacked: {:?}", comp);

    Ok(comp)
}

/// Chapter 5.4.6: "in sleep mode writes are not ignored", and the chip may
/// still be in normal mode from a previous run, so sleep is forced first.
/// The final ctrl_meas write sets oversampling and re-enters normal mode
/// in one transfer; free-running sampling starts only after it.
fn configure<B: RegisterBus>(bus: &mut B) -> Result<()> {
    bus.write_register(REG_CTRL_MEAS, SETTING_SLEEP)?;
    bus.write_register(REG_CONFIG, SETTING_STBY | SETTING_FILTER)?;
    bus.write_register(REG_CTRL_HUM, SETTING_HUM_OS)?;
    bus.write_register(
        REG_CTRL_MEAS,
        SETTING_TEMP_OS | SETTING_PRESS_OS | SETTING_MODE_NORMAL,
    )?;
    Ok(())
}

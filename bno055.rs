//! BNO055 9-axis orientation sensor driver.
//!
//! The device runs its own sensor fusion; the driver configures it, replays
//! or acquires a calibration profile, and decodes the fused output words.
//! Register references follow the BNO055 datasheet from Bosch, document
//! BST-BNO055-DS000-14.

use std::fmt;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::RegisterBus;
use crate::cancel::CancelToken;
use crate::error::{Result, SensorError};
use crate::sink;

pub const I2C_BUS: u8 = 3;
pub const I2C_ADDR: u16 = 0x28;

pub const SAMPLE_PERIOD: Duration = Duration::from_millis(10);

const CHIP_ID: u8 = 0xA0;

const REG_CHIP_ID: u8 = 0x00; // read only
const REG_ACC_ID: u8 = 0x01; // read only, 0xFB
const REG_MAG_ID: u8 = 0x02; // read only, 0x32
const REG_GYR_ID: u8 = 0x03; // read only, 0x0F
const REG_DATA: u8 = 0x08; // beginning of the data area
const REG_CALIB_STAT: u8 = 0x35;
const REG_ST_RESULT: u8 = 0x36;
const REG_SYS_STATUS: u8 = 0x39;
const REG_SYS_ERR: u8 = 0x3A;
const REG_OPR_MODE: u8 = 0x3D;
const REG_SYS_TRIGGER: u8 = 0x3F;
const REG_AXIS_MAP_CONFIG: u8 = 0x41;
const REG_AXIS_MAP_SIGN: u8 = 0x42;
const REG_CALIB_DATA: u8 = 0x55; // first of 22 offset/radius bytes

const OPR_MODE_CONFIG: u8 = 0x00;
const OPR_MODE_NDOF: u8 = 0x0C; // working fusion mode

const TRIGGER_RESET: u8 = 0x20;
const TRIGGER_SELF_TEST: u8 = 0x01;
const SYS_STATUS_SELF_TESTING: u8 = 0x04; // 4.3.58: executing selftest

/// Axis remap values: x stays, y and z trade places, all signs positive.
const AXIS_MAP: u8 = (0x01 << 4) | (0x02 << 2) | 0x00;
const AXIS_SIGN: u8 = 0x00;

const RESET_SETTLE: Duration = Duration::from_secs(1);
const MODE_SWITCH_SETTLE: Duration = Duration::from_micros(30);
const STATUS_POLL: Duration = Duration::from_secs(1);

const CALIB_STAT_SATURATED: u8 = 0xFF; // all four 2-bit scores at 3
const CALIB_CONSECUTIVE_POLLS: u8 = 5;

/// Offsets and radii captured from a fully calibrated device, replayable
/// per 3.11.4 "Reuse of Calibration Profile": 11 little-endian signed
/// 16-bit values (acc offset xyz, mag offset xyz, gyro offset xyz, acc
/// radius, mag radius).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationProfile {
    bytes: [u8; 22],
}

impl CalibrationProfile {
    pub const LEN: usize = 22;

    pub const fn from_bytes(bytes: [u8; 22]) -> CalibrationProfile {
        CalibrationProfile { bytes }
    }

    /// The register-prefixed burst that replays this profile.
    fn as_burst(&self) -> [u8; 23] {
        let mut burst = [0u8; 23];
        burst[0] = REG_CALIB_DATA;
        burst[1..].copy_from_slice(&self.bytes);
        burst
    }

    fn value(&self, index: usize) -> i16 {
        i16::from_le_bytes([self.bytes[2 * index], self.bytes[2 * index + 1]])
    }

    /// Paste-ready source form, for refreshing [`STORED_CALIBRATION`] from
    /// a read-back.
    fn as_source_literal(&self) -> String {
        let bytes: Vec<String> = self
            .bytes
            .iter()
            .map(|byte| format!("0x{:02X}", byte))
            .collect();
        format!("[{}]", bytes.join(", "))
    }
}

impl fmt::Display for CalibrationProfile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let values: Vec<String> = (0..Self::LEN / 2)
            .map(|index| self.value(index).to_string())
            .collect();
        write!(f, "{}", values.join(","))
    }
}

/// Captured from the flight unit after one full interactive calibration.
pub const STORED_CALIBRATION: CalibrationProfile = CalibrationProfile::from_bytes([
    0xF1, 0xFF, 0x0A, 0x00, 0x08, 0x00, // accelerometer offset
    0xE4, 0xFD, 0xC6, 0xFF, 0x77, 0xFF, // magnetometer offset
    0xFF, 0xFF, 0xFC, 0xFF, 0xFF, 0xFF, // gyroscope offset
    0xE8, 0x03, // accelerometer radius
    0x73, 0x02, // magnetometer radius
]);

/// How the device gets calibrated at startup.
#[derive(Debug, Clone, Copy)]
pub enum CalibrationStrategy {
    /// Replay a previously captured profile; deterministic, no polling.
    StoredProfile(CalibrationProfile),
    /// Operator-attended: poll the calibration status until it saturates.
    Interactive,
}

pub struct ImuConfig {
    pub calibration: CalibrationStrategy,
    pub run_bist: bool,
}

impl Default for ImuConfig {
    fn default() -> ImuConfig {
        ImuConfig {
            calibration: CalibrationStrategy::StoredProfile(STORED_CALIBRATION),
            run_bist: false,
        }
    }
}

/// Interactive calibration completes only after the status byte reads
/// fully saturated on five consecutive polls; any other read starts the
/// count over.
#[derive(Debug, Default)]
struct CalibrationDebounce {
    consecutive: u8,
}

impl CalibrationDebounce {
    fn observe(&mut self, status: u8) -> bool {
        if status == CALIB_STAT_SATURATED {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.consecutive = 0;
        }
        self.consecutive >= CALIB_CONSECUTIVE_POLLS
    }
}

/// One decoded 46-byte data-area burst: the device's fused output words,
/// consecutive little-endian i16 except the trailing temperature and
/// calibration-status bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImuSample {
    pub acceleration: [i16; 3],        // 100 LSB per m/s^2 (table 3-17)
    pub magnetic_field: [i16; 3],      // 16 LSB per uT (table 3-19)
    pub angular_rate: [i16; 3],        // 16 LSB per dps (table 3-22)
    pub euler_angles: [i16; 3],        // 16 LSB per degree (table 3-29)
    pub quaternion: [i16; 4],          // 2^14 LSB per unit (table 3-31)
    pub linear_acceleration: [i16; 3], // 100 LSB per m/s^2 (table 3-33)
    pub gravity: [i16; 3],             // 100 LSB per m/s^2 (table 3-35)
    pub temperature: i8,               // 1 LSB per degC (table 3-37)
    pub calibration_status: u8,
}

impl ImuSample {
    pub const BURST_LEN: usize = 46;

    pub fn from_burst(buffer: &[u8; 46]) -> ImuSample {
        let word = |index: usize| i16::from_le_bytes([buffer[index], buffer[index + 1]]);
        let triple = |index: usize| [word(index), word(index + 2), word(index + 4)];

        ImuSample {
            acceleration: triple(0),
            magnetic_field: triple(6),
            angular_rate: triple(12),
            euler_angles: triple(18),
            quaternion: [word(24), word(26), word(28), word(30)],
            linear_acceleration: triple(32),
            gravity: triple(38),
            temperature: buffer[44] as i8,
            calibration_status: buffer[45],
        }
    }
}

impl fmt::Display for ImuSample {
    /// Record body. Euler angles are emitted in whole degrees (16 LSB per
    /// degree); everything else stays in device units.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "acc={},{},{} mag={},{},{} gyr={},{},{} eul={},{},{} qua={},{},{},{} lia={},{},{} grv={},{},{} temp={} calib=0x{:x}",
            self.acceleration[0],
            self.acceleration[1],
            self.acceleration[2],
            self.magnetic_field[0],
            self.magnetic_field[1],
            self.magnetic_field[2],
            self.angular_rate[0],
            self.angular_rate[1],
            self.angular_rate[2],
            self.euler_angles[0] / 16,
            self.euler_angles[1] / 16,
            self.euler_angles[2] / 16,
            self.quaternion[0],
            self.quaternion[1],
            self.quaternion[2],
            self.quaternion[3],
            self.linear_acceleration[0],
            self.linear_acceleration[1],
            self.linear_acceleration[2],
            self.gravity[0],
            self.gravity[1],
            self.gravity[2],
            self.temperature,
            self.calibration_status
        )
    }
}

pub struct Bno055<B, W> {
    bus: B,
    out: W,
}

impl<B: RegisterBus, W: Write> Bno055<B, W> {
    /// Startup state machine: reset, identity and status, calibration,
    /// calibration read-back, axis remap, optional self test.
    pub fn initialize(bus: B, out: W, config: &ImuConfig) -> Result<Bno055<B, W>> {
        let mut imu = Bno055 { bus, out };

        imu.reset()?;
        imu.read_identity()?;
        imu.log_system_status()?;

        match config.calibration {
            CalibrationStrategy::StoredProfile(profile) => imu.calibrate_from_profile(&profile)?,
            CalibrationStrategy::Interactive => imu.calibrate_interactively(STATUS_POLL)?,
        }
        imu.read_back_calibration()?;
        imu.configure_axis_remap()?;

        if config.run_bist {
            imu.run_self_test()?;
        }

        Ok(imu)
    }

    /// Soft reset. The device is unusable until the settle time passes.
    fn reset(&mut self) -> Result<()> {
        self.bus.write_register(REG_SYS_TRIGGER, TRIGGER_RESET)?;
        thread::sleep(RESET_SETTLE);
        log::info!("imu reset performed");
        Ok(())
    }

    fn read_identity(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];

        self.bus.read_register(REG_CHIP_ID, &mut byte)?;
        if byte[0] != CHIP_ID {
            return Err(SensorError::ChipId {
                found: byte[0],
                expected: CHIP_ID,
            });
        }
        log::info!("imu chip id 0x{:02X}", byte[0]);

        for &(name, register) in &[
            ("acc", REG_ACC_ID),
            ("mag", REG_MAG_ID),
            ("gyr", REG_GYR_ID),
        ] {
            self.bus.read_register(register, &mut byte)?;
            log::info!("imu {} id 0x{:02X}", name, byte[0]);
        }

        Ok(())
    }

    /// POST result and system status/error registers.
    pub fn log_system_status(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];

        self.bus.read_register(REG_ST_RESULT, &mut byte)?;
        log::info!("imu POST result 0x{:02X}", byte[0]);

        self.bus.read_register(REG_SYS_STATUS, &mut byte)?;
        log::info!("imu system status 0x{:02X}", byte[0]);

        self.bus.read_register(REG_SYS_ERR, &mut byte)?;
        log::info!("imu system error 0x{:02X}", byte[0]);

        Ok(())
    }

    /// Operating-mode switches need the settle delay on both sides of the
    /// write before the next register access is valid.
    fn set_mode(&mut self, mode: u8) -> Result<()> {
        thread::sleep(MODE_SWITCH_SETTLE);
        self.bus.write_register(REG_OPR_MODE, mode)?;
        thread::sleep(MODE_SWITCH_SETTLE);
        Ok(())
    }

    /// 3.11.4 "Reuse of Calibration Profile": replay the stored offsets as
    /// one burst while in config mode, then return to the fusion mode.
    fn calibrate_from_profile(&mut self, profile: &CalibrationProfile) -> Result<()> {
        log::info!("imu calibrating from stored profile");
        self.set_mode(OPR_MODE_CONFIG)?;
        self.bus.write_raw(&profile.as_burst())?;
        self.set_mode(OPR_MODE_NDOF)?;
        Ok(())
    }

    /// Operator-attended path: fusion must be running for the scores to
    /// move, so switch to the working mode first, then poll.
    fn calibrate_interactively(&mut self, poll: Duration) -> Result<()> {
        log::info!("imu calibrating interactively, move the device now");
        self.set_mode(OPR_MODE_NDOF)?;

        let mut debounce = CalibrationDebounce::default();
        loop {
            let mut status = [0u8; 1];
            self.bus.read_register(REG_CALIB_STAT, &mut status)?;
            log::info!(
                "imu calibration status: sys={} gyr={} acc={} mag={}",
                (status[0] >> 6) & 0x03,
                (status[0] >> 4) & 0x03,
                (status[0] >> 2) & 0x03,
                status[0] & 0x03
            );
            if debounce.observe(status[0]) {
                log::info!("imu calibration complete");
                return Ok(());
            }
            thread::sleep(poll);
        }
    }

    /// Reads the offset/radius block and emits it into the record stream,
    /// both as labeled values and as a paste-ready byte literal. The
    /// sampling path never consumes this; it exists so a fresh profile can
    /// be captured for [`STORED_CALIBRATION`]. Readable only in config
    /// mode, and only meaningful after a full calibration.
    fn read_back_calibration(&mut self) -> Result<CalibrationProfile> {
        self.set_mode(OPR_MODE_CONFIG)?;

        let mut bytes = [0u8; CalibrationProfile::LEN];
        self.bus.read_register(REG_CALIB_DATA, &mut bytes)?;
        let profile = CalibrationProfile::from_bytes(bytes);

        writeln!(
            self.out,
            "imu calibration: acc off x,acc off y,acc off z,mag off x,mag off y,mag off z,\
             gyro off x,gyro off y,gyro off z,acc radius,mag radius"
        )?;
        writeln!(self.out, "imu calibration: {}", profile)?;
        writeln!(
            self.out,
            "imu calibration bytes: {}",
            profile.as_source_literal()
        )?;

        self.set_mode(OPR_MODE_NDOF)?;
        Ok(profile)
    }

    /// Axis remap register pair, writable only in config mode.
    fn configure_axis_remap(&mut self) -> Result<()> {
        log::info!("imu configuring axis remap");
        self.set_mode(OPR_MODE_CONFIG)?;
        self.bus.write_register(REG_AXIS_MAP_CONFIG, AXIS_MAP)?;
        self.bus.write_register(REG_AXIS_MAP_SIGN, AXIS_SIGN)?;
        self.set_mode(OPR_MODE_NDOF)?;
        Ok(())
    }

    /// Built-in self test; polls until the system status leaves the
    /// selftest-executing state, then logs the results.
    fn run_self_test(&mut self) -> Result<()> {
        log::info!("imu BIST start");
        self.bus.write_register(REG_SYS_TRIGGER, TRIGGER_SELF_TEST)?;

        let mut status = [0u8; 1];
        loop {
            thread::sleep(STATUS_POLL);
            self.bus.read_register(REG_SYS_STATUS, &mut status)?;
            log::info!("imu system status during BIST 0x{:02X}", status[0]);
            if status[0] != SYS_STATUS_SELF_TESTING {
                break;
            }
        }

        self.log_system_status()
    }

    /// Samples until cancelled or the bus fails; one 46-byte burst per
    /// cycle, decoded and emitted as a single record line.
    pub fn run_sampling_loop(&mut self, period: Duration, cancel: &CancelToken) -> Result<()> {
        while !cancel.is_cancelled() {
            let cycle_start = Instant::now();
            let stamp = sink::unix_time();

            let mut buffer = [0u8; ImuSample::BURST_LEN];
            self.bus.read_register(REG_DATA, &mut buffer)?;
            let sample = ImuSample::from_burst(&buffer);

            writeln!(self.out, "imu@{}:{}", stamp, sample)?;

            if let Some(remaining) = period.checked_sub(cycle_start.elapsed()) {
                thread::sleep(remaining);
            }
        }

        writeln!(self.out, "imu read loop returning")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;

    fn sample_burst() -> [u8; ImuSample::BURST_LEN] {
        let mut buffer = [0u8; ImuSample::BURST_LEN];
        buffer[0] = 0x38; // acc x = -200
        buffer[1] = 0xFF;
        buffer[6] = 0x10; // mag x = 16
        buffer[12] = 0xF0; // gyr x = -16
        buffer[13] = 0xFF;
        buffer[18] = 0x90; // eul heading = 400 raw = 25 degrees
        buffer[19] = 0x01;
        buffer[24] = 0x00; // qua w = 2^14
        buffer[25] = 0x40;
        buffer[32] = 0x64; // lia x = 100
        buffer[38] = 0x9C; // grv x = -100
        buffer[39] = 0xFF;
        buffer[44] = 0xE7; // temp = -25
        buffer[45] = 0xC3;
        buffer
    }

    #[test]
    fn burst_decodes_signed_words() {
        let sample = ImuSample::from_burst(&sample_burst());
        assert_eq!(sample.acceleration, [-200, 0, 0]);
        assert_eq!(sample.magnetic_field, [16, 0, 0]);
        assert_eq!(sample.angular_rate, [-16, 0, 0]);
        assert_eq!(sample.euler_angles, [400, 0, 0]);
        assert_eq!(sample.quaternion, [16384, 0, 0, 0]);
        assert_eq!(sample.linear_acceleration, [100, 0, 0]);
        assert_eq!(sample.gravity, [-100, 0, 0]);
        assert_eq!(sample.temperature, -25);
        assert_eq!(sample.calibration_status, 0xC3);
    }

    #[test]
    fn record_scales_euler_angles_to_degrees() {
        let sample = ImuSample::from_burst(&sample_burst());
        let record = sample.to_string();
        assert!(record.contains("eul=25,0,0"));
        assert!(record.contains("acc=-200,0,0"));
        assert!(record.contains("qua=16384,0,0,0"));
        assert!(record.contains("temp=-25"));
        assert!(record.ends_with("calib=0xc3"));
    }

    #[test]
    fn zero_burst_decodes_to_zero() {
        let sample = ImuSample::from_burst(&[0; ImuSample::BURST_LEN]);
        assert_eq!(sample, ImuSample {
            acceleration: [0; 3],
            magnetic_field: [0; 3],
            angular_rate: [0; 3],
            euler_angles: [0; 3],
            quaternion: [0; 4],
            linear_acceleration: [0; 3],
            gravity: [0; 3],
            temperature: 0,
            calibration_status: 0,
        });
    }

    #[test]
    fn stored_profile_decodes_to_known_offsets() {
        assert_eq!(STORED_CALIBRATION.value(0), -15); // acc offset x
        assert_eq!(STORED_CALIBRATION.value(1), 10); // acc offset y
        assert_eq!(STORED_CALIBRATION.value(9), 1000); // acc radius
        assert_eq!(STORED_CALIBRATION.value(10), 627); // mag radius
    }

    #[test]
    fn profile_burst_is_register_prefixed() {
        let burst = STORED_CALIBRATION.as_burst();
        assert_eq!(burst.len(), CalibrationProfile::LEN + 1);
        assert_eq!(burst[0], REG_CALIB_DATA);
        assert_eq!(&burst[1..], &STORED_CALIBRATION.bytes[..]);
    }

    #[test]
    fn debounce_needs_five_consecutive_saturated_polls() {
        // Nine saturated reads complete on the fifth; the rest are gravy.
        let mut debounce = CalibrationDebounce::default();
        let completions: Vec<bool> = (0..9).map(|_| debounce.observe(0xFF)).collect();
        assert_eq!(
            completions,
            vec![false, false, false, false, true, true, true, true, true]
        );
    }

    #[test]
    fn debounce_resets_on_any_unsaturated_read() {
        let mut debounce = CalibrationDebounce::default();
        for _ in 0..4 {
            assert!(!debounce.observe(0xFF));
        }
        assert!(!debounce.observe(0xFE)); // one sub-score short, start over
        for _ in 0..4 {
            assert!(!debounce.observe(0xFF));
        }
        assert!(debounce.observe(0xFF));
    }

    #[test]
    fn stored_profile_calibration_is_idempotent() {
        let mut imu = Bno055 {
            bus: MockBus::new(),
            out: Vec::<u8>::new(),
        };

        for _ in 0..2 {
            imu.calibrate_from_profile(&STORED_CALIBRATION).unwrap();
            // Each pass must leave the device back in the working mode.
            assert_eq!(imu.bus.writes.last().unwrap(), &vec![REG_OPR_MODE, OPR_MODE_NDOF]);
        }

        let expected_pass = vec![
            vec![REG_OPR_MODE, OPR_MODE_CONFIG],
            STORED_CALIBRATION.as_burst().to_vec(),
            vec![REG_OPR_MODE, OPR_MODE_NDOF],
        ];
        let mut expected = expected_pass.clone();
        expected.extend(expected_pass);
        assert_eq!(imu.bus.writes, expected);
    }

    #[test]
    fn interactive_calibration_consumes_debounced_status_sequence() {
        let mut bus = MockBus::new();
        for _ in 0..4 {
            bus.queue(REG_CALIB_STAT, &[0xFF]);
        }
        bus.queue(REG_CALIB_STAT, &[0xFE]);
        for _ in 0..5 {
            bus.queue(REG_CALIB_STAT, &[0xFF]);
        }

        let mut imu = Bno055 {
            bus,
            out: Vec::<u8>::new(),
        };
        imu.calibrate_interactively(Duration::from_millis(0)).unwrap();
        assert_eq!(imu.bus.queued_reads_remaining(REG_CALIB_STAT), 0);
    }

    #[test]
    fn cancelled_loop_emits_only_exit_marker() {
        let mut bus = MockBus::new();
        bus.stick(REG_DATA, &[0u8; ImuSample::BURST_LEN]);
        let mut imu = Bno055 {
            bus,
            out: Vec::<u8>::new(),
        };

        let cancel = CancelToken::new();
        cancel.cancel();
        imu.run_sampling_loop(Duration::from_millis(1), &cancel)
            .unwrap();

        let output = String::from_utf8(imu.out.clone()).unwrap();
        assert_eq!(output, "imu read loop returning\n");
    }
}

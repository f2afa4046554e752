//! Typed attribute values carried by attribute-changed messages.
//!
//! The device tags every attribute payload with a one-byte identifier; the
//! identifier uniquely determines the payload shape. Identifiers this crate
//! does not recognise decode into [`AttributeValue::Unknown`] so that a new
//! firmware attribute never breaks the stream.

use bytes::{BufMut, BytesMut};

/// Attribute identifiers assigned by the device firmware.
pub mod ids {
    pub const SERIAL_NO: u8 = 0x01;
    pub const AFE_SETTINGS: u8 = 0x06;
    pub const AFE_SETTINGS_ALL: u8 = 0x07;
    pub const MEASUREMENT_DEACTIVATED: u8 = 0x72;
    pub const BATTERY_LEVEL: u8 = 0xA1;
    pub const PULSE_RAW: u8 = 0xA2;
    pub const IMU: u8 = 0xA4;
    pub const HEARTRATE: u8 = 0xA5;
    pub const SLEEP_MODE: u8 = 0xA6;
    pub const BREATH_RATE: u8 = 0xA7;
    pub const HEART_RATE_VARIABILITY: u8 = 0xA8;
    pub const CHARGE_STATE: u8 = 0xA9;
    pub const BELT_ON_BODY: u8 = 0xAA;
    pub const FIRMWARE_UPDATE_PROGRESS: u8 = 0xAB;
    pub const IMU_RAW: u8 = 0xAC;
    pub const HEART_RATE_INTERVAL: u8 = 0xAD;
    pub const PULSE_RAW_ALL: u8 = 0xAE;
    pub const ACC_RAW: u8 = 0xAF;
    pub const GYRO_RAW: u8 = 0xB0;
    pub const TEMPERATURE: u8 = 0xB1;
    pub const DIAGNOSTICS: u8 = 0xB2;
    pub const LEDS: u8 = 0xB3;
}

/// Raw six-axis IMU sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImuRaw {
    pub acc_x: i16,
    pub acc_y: i16,
    pub acc_z: i16,
    pub gyr_x: i16,
    pub gyr_y: i16,
    pub gyr_z: i16,
}

/// Raw accelerometer sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccRaw {
    pub acc_x: i16,
    pub acc_y: i16,
    pub acc_z: i16,
}

/// Raw gyroscope sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GyroRaw {
    pub gyr_x: i16,
    pub gyr_y: i16,
    pub gyr_z: i16,
}

/// On-body temperature reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Temperature {
    /// Raw sensor value in 1/128 °C steps.
    pub raw: i16,
}

impl Temperature {
    /// Convert the raw reading to degrees Celsius.
    #[must_use]
    pub fn celsius(self) -> f32 { f32::from(self.raw) * 0.007_812_5 }
}

/// LED bank state: three LEDs, each steady or blinking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leds {
    pub led1: bool,
    pub led1_blinking: bool,
    pub led2: bool,
    pub led2_blinking: bool,
    pub led3: bool,
    pub led3_blinking: bool,
}

impl Leds {
    fn from_bits(bits: u8) -> Self {
        Self {
            led1: bits & 0x01 != 0,
            led1_blinking: bits & 0x02 != 0,
            led2: bits & 0x04 != 0,
            led2_blinking: bits & 0x08 != 0,
            led3: bits & 0x10 != 0,
            led3_blinking: bits & 0x20 != 0,
        }
    }

    fn to_bits(self) -> u8 {
        u8::from(self.led1)
            | u8::from(self.led1_blinking) << 1
            | u8::from(self.led2) << 2
            | u8::from(self.led2_blinking) << 3
            | u8::from(self.led3) << 4
            | u8::from(self.led3_blinking) << 5
    }
}

/// Battery fuel-gauge diagnostics block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Diagnostics {
    pub rep_soc: u16,
    pub avg_current: i16,
    pub rep_cap: u16,
    pub full_cap: u16,
    pub tte: u32,
    pub ttf: u32,
    pub voltage: u16,
    pub avg_voltage: u16,
}

/// Analog front end configuration.
///
/// Two wire shapes decode into this struct: the basic form carries one LED
/// current and one offset DAC, the all-channels form carries all four LED
/// currents and all three offset DACs. The extended fields are `None` for
/// the basic form and all `Some` for the all-channels form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AfeSettings {
    pub rf_gain: u8,
    pub cf_value: u8,
    pub ecg_gain: u8,
    pub ioffdac_range: u8,
    pub led1: u32,
    pub led4: u32,
    pub off_dac1: u32,
    pub relative_gain: f32,
    pub led2: Option<u32>,
    pub led3: Option<u32>,
    pub off_dac2: Option<u32>,
    pub off_dac3: Option<u32>,
}

impl AfeSettings {
    /// Whether this configuration carries the all-channels fields.
    #[must_use]
    pub const fn is_all_channels(&self) -> bool { self.led2.is_some() }
}

/// A decoded attribute value, one variant per known wire shape.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    SerialNo(i64),
    AfeSettings(AfeSettings),
    /// Non-zero while measurement is deactivated; the recording callback
    /// reports `value == 0`.
    MeasurementDeactivated(u8),
    BatteryLevel(u8),
    PulseRaw {
        ecg: i32,
        ppg: i32,
    },
    Imu {
        /// High nibble is orientation, low nibble is activity level.
        orientation_and_activity: u8,
    },
    Heartrate(u16),
    SleepMode(u8),
    BreathRate(u8),
    HeartRateVariability(u16),
    ChargeState(bool),
    BeltOnBody(bool),
    FirmwareUpdateProgress(u8),
    ImuRaw(ImuRaw),
    HeartRateInterval(u16),
    PulseRawAll {
        ecg: i32,
        ppg_green: i32,
        ppg_red: i32,
        ppg_ir: i32,
    },
    AccRaw(AccRaw),
    GyroRaw(GyroRaw),
    Temperature(Temperature),
    Diagnostics(Diagnostics),
    Leds(Leds),
    /// An identifier this crate does not recognise. Preserved verbatim so
    /// the raw payload stays inspectable; never a decode failure.
    Unknown {
        attribute_id: u8,
        data: Vec<u8>,
    },
}

struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8, &'static str> {
        let (&v, rest) = self.0.split_first().ok_or("attribute payload too short")?;
        self.0 = rest;
        Ok(v)
    }

    fn i16(&mut self) -> Result<i16, &'static str> {
        Ok(i16::from_be_bytes(self.array::<2>()?))
    }

    fn u16(&mut self) -> Result<u16, &'static str> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32, &'static str> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    fn i32(&mut self) -> Result<i32, &'static str> {
        Ok(i32::from_be_bytes(self.array::<4>()?))
    }

    fn i64(&mut self) -> Result<i64, &'static str> {
        Ok(i64::from_be_bytes(self.array::<8>()?))
    }

    fn f32(&mut self) -> Result<f32, &'static str> {
        Ok(f32::from_be_bytes(self.array::<4>()?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], &'static str> {
        if self.0.len() < N {
            return Err("attribute payload too short");
        }
        let (head, rest) = self.0.split_at(N);
        self.0 = rest;
        let mut out = [0_u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn finish(&self) -> Result<(), &'static str> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err("trailing bytes after attribute payload")
        }
    }
}

impl AttributeValue {
    /// Decode the payload for `attribute_id`.
    ///
    /// Unrecognised identifiers yield [`AttributeValue::Unknown`] rather
    /// than an error.
    ///
    /// # Errors
    ///
    /// Returns a description when a *known* identifier carries a payload of
    /// the wrong shape.
    #[allow(clippy::too_many_lines)]
    pub fn decode(attribute_id: u8, data: &[u8]) -> Result<Self, &'static str> {
        let mut r = Reader(data);
        let value = match attribute_id {
            ids::SERIAL_NO => Self::SerialNo(r.i64()?),
            ids::AFE_SETTINGS => Self::AfeSettings(AfeSettings {
                rf_gain: r.u8()?,
                cf_value: r.u8()?,
                ecg_gain: r.u8()?,
                ioffdac_range: r.u8()?,
                led1: r.u32()?,
                led4: r.u32()?,
                off_dac1: r.u32()?,
                relative_gain: r.f32()?,
                led2: None,
                led3: None,
                off_dac2: None,
                off_dac3: None,
            }),
            ids::AFE_SETTINGS_ALL => {
                let (rf_gain, cf_value, ecg_gain, ioffdac_range) =
                    (r.u8()?, r.u8()?, r.u8()?, r.u8()?);
                let (led1, led2, led3, led4) = (r.u32()?, r.u32()?, r.u32()?, r.u32()?);
                let (off_dac1, off_dac2, off_dac3) = (r.u32()?, r.u32()?, r.u32()?);
                Self::AfeSettings(AfeSettings {
                    rf_gain,
                    cf_value,
                    ecg_gain,
                    ioffdac_range,
                    led1,
                    led4,
                    off_dac1,
                    relative_gain: r.f32()?,
                    led2: Some(led2),
                    led3: Some(led3),
                    off_dac2: Some(off_dac2),
                    off_dac3: Some(off_dac3),
                })
            }
            ids::MEASUREMENT_DEACTIVATED => Self::MeasurementDeactivated(r.u8()?),
            ids::BATTERY_LEVEL => Self::BatteryLevel(r.u8()?),
            ids::PULSE_RAW => Self::PulseRaw {
                ecg: r.i32()?,
                ppg: r.i32()?,
            },
            ids::IMU => Self::Imu {
                orientation_and_activity: r.u8()?,
            },
            ids::HEARTRATE => Self::Heartrate(r.u16()?),
            ids::SLEEP_MODE => Self::SleepMode(r.u8()?),
            ids::BREATH_RATE => Self::BreathRate(r.u8()?),
            ids::HEART_RATE_VARIABILITY => Self::HeartRateVariability(r.u16()?),
            ids::CHARGE_STATE => Self::ChargeState(r.u8()? != 0),
            ids::BELT_ON_BODY => Self::BeltOnBody(r.u8()? != 0),
            ids::FIRMWARE_UPDATE_PROGRESS => Self::FirmwareUpdateProgress(r.u8()?),
            ids::IMU_RAW => Self::ImuRaw(ImuRaw {
                acc_x: r.i16()?,
                acc_y: r.i16()?,
                acc_z: r.i16()?,
                gyr_x: r.i16()?,
                gyr_y: r.i16()?,
                gyr_z: r.i16()?,
            }),
            ids::HEART_RATE_INTERVAL => Self::HeartRateInterval(r.u16()?),
            ids::PULSE_RAW_ALL => Self::PulseRawAll {
                ecg: r.i32()?,
                ppg_green: r.i32()?,
                ppg_red: r.i32()?,
                ppg_ir: r.i32()?,
            },
            ids::ACC_RAW => Self::AccRaw(AccRaw {
                acc_x: r.i16()?,
                acc_y: r.i16()?,
                acc_z: r.i16()?,
            }),
            ids::GYRO_RAW => Self::GyroRaw(GyroRaw {
                gyr_x: r.i16()?,
                gyr_y: r.i16()?,
                gyr_z: r.i16()?,
            }),
            ids::TEMPERATURE => Self::Temperature(Temperature { raw: r.i16()? }),
            ids::DIAGNOSTICS => Self::Diagnostics(Diagnostics {
                rep_soc: r.u16()?,
                avg_current: r.i16()?,
                rep_cap: r.u16()?,
                full_cap: r.u16()?,
                tte: r.u32()?,
                ttf: r.u32()?,
                voltage: r.u16()?,
                avg_voltage: r.u16()?,
            }),
            ids::LEDS => Self::Leds(Leds::from_bits(r.u8()?)),
            _ => {
                return Ok(Self::Unknown {
                    attribute_id,
                    data: data.to_vec(),
                });
            }
        };
        r.finish()?;
        Ok(value)
    }

    /// Identifier this value encodes under.
    #[must_use]
    pub fn attribute_id(&self) -> u8 {
        match self {
            Self::SerialNo(_) => ids::SERIAL_NO,
            Self::AfeSettings(afe) => {
                if afe.is_all_channels() {
                    ids::AFE_SETTINGS_ALL
                } else {
                    ids::AFE_SETTINGS
                }
            }
            Self::MeasurementDeactivated(_) => ids::MEASUREMENT_DEACTIVATED,
            Self::BatteryLevel(_) => ids::BATTERY_LEVEL,
            Self::PulseRaw { .. } => ids::PULSE_RAW,
            Self::Imu { .. } => ids::IMU,
            Self::Heartrate(_) => ids::HEARTRATE,
            Self::SleepMode(_) => ids::SLEEP_MODE,
            Self::BreathRate(_) => ids::BREATH_RATE,
            Self::HeartRateVariability(_) => ids::HEART_RATE_VARIABILITY,
            Self::ChargeState(_) => ids::CHARGE_STATE,
            Self::BeltOnBody(_) => ids::BELT_ON_BODY,
            Self::FirmwareUpdateProgress(_) => ids::FIRMWARE_UPDATE_PROGRESS,
            Self::ImuRaw(_) => ids::IMU_RAW,
            Self::HeartRateInterval(_) => ids::HEART_RATE_INTERVAL,
            Self::PulseRawAll { .. } => ids::PULSE_RAW_ALL,
            Self::AccRaw(_) => ids::ACC_RAW,
            Self::GyroRaw(_) => ids::GYRO_RAW,
            Self::Temperature(_) => ids::TEMPERATURE,
            Self::Diagnostics(_) => ids::DIAGNOSTICS,
            Self::Leds(_) => ids::LEDS,
            Self::Unknown { attribute_id, .. } => *attribute_id,
        }
    }

    /// Encoded payload size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::MeasurementDeactivated(_)
            | Self::BatteryLevel(_)
            | Self::Imu { .. }
            | Self::SleepMode(_)
            | Self::BreathRate(_)
            | Self::ChargeState(_)
            | Self::BeltOnBody(_)
            | Self::FirmwareUpdateProgress(_)
            | Self::Leds(_) => 1,
            Self::Heartrate(_)
            | Self::HeartRateVariability(_)
            | Self::HeartRateInterval(_)
            | Self::Temperature(_) => 2,
            Self::AccRaw(_) | Self::GyroRaw(_) => 6,
            Self::SerialNo(_) | Self::PulseRaw { .. } => 8,
            Self::ImuRaw(_) => 12,
            Self::PulseRawAll { .. } => 16,
            Self::AfeSettings(afe) => {
                if afe.is_all_channels() {
                    36
                } else {
                    20
                }
            }
            Self::Diagnostics(_) => 20,
            Self::Unknown { data, .. } => data.len(),
        }
    }

    /// Append the encoded payload to `buf`.
    #[allow(clippy::too_many_lines)]
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            Self::SerialNo(v) => buf.put_i64(*v),
            Self::AfeSettings(afe) => {
                buf.put_u8(afe.rf_gain);
                buf.put_u8(afe.cf_value);
                buf.put_u8(afe.ecg_gain);
                buf.put_u8(afe.ioffdac_range);
                if let (Some(led2), Some(led3), Some(off_dac2), Some(off_dac3)) =
                    (afe.led2, afe.led3, afe.off_dac2, afe.off_dac3)
                {
                    buf.put_u32(afe.led1);
                    buf.put_u32(led2);
                    buf.put_u32(led3);
                    buf.put_u32(afe.led4);
                    buf.put_u32(afe.off_dac1);
                    buf.put_u32(off_dac2);
                    buf.put_u32(off_dac3);
                } else {
                    buf.put_u32(afe.led1);
                    buf.put_u32(afe.led4);
                    buf.put_u32(afe.off_dac1);
                }
                buf.put_f32(afe.relative_gain);
            }
            Self::MeasurementDeactivated(v)
            | Self::BatteryLevel(v)
            | Self::SleepMode(v)
            | Self::BreathRate(v)
            | Self::FirmwareUpdateProgress(v) => buf.put_u8(*v),
            Self::PulseRaw { ecg, ppg } => {
                buf.put_i32(*ecg);
                buf.put_i32(*ppg);
            }
            Self::Imu {
                orientation_and_activity,
            } => buf.put_u8(*orientation_and_activity),
            Self::Heartrate(v) | Self::HeartRateVariability(v) | Self::HeartRateInterval(v) => {
                buf.put_u16(*v);
            }
            Self::ChargeState(v) | Self::BeltOnBody(v) => buf.put_u8(u8::from(*v)),
            Self::ImuRaw(imu) => {
                buf.put_i16(imu.acc_x);
                buf.put_i16(imu.acc_y);
                buf.put_i16(imu.acc_z);
                buf.put_i16(imu.gyr_x);
                buf.put_i16(imu.gyr_y);
                buf.put_i16(imu.gyr_z);
            }
            Self::PulseRawAll {
                ecg,
                ppg_green,
                ppg_red,
                ppg_ir,
            } => {
                buf.put_i32(*ecg);
                buf.put_i32(*ppg_green);
                buf.put_i32(*ppg_red);
                buf.put_i32(*ppg_ir);
            }
            Self::AccRaw(acc) => {
                buf.put_i16(acc.acc_x);
                buf.put_i16(acc.acc_y);
                buf.put_i16(acc.acc_z);
            }
            Self::GyroRaw(gyr) => {
                buf.put_i16(gyr.gyr_x);
                buf.put_i16(gyr.gyr_y);
                buf.put_i16(gyr.gyr_z);
            }
            Self::Temperature(t) => buf.put_i16(t.raw),
            Self::Diagnostics(d) => {
                buf.put_u16(d.rep_soc);
                buf.put_i16(d.avg_current);
                buf.put_u16(d.rep_cap);
                buf.put_u16(d.full_cap);
                buf.put_u32(d.tte);
                buf.put_u32(d.ttf);
                buf.put_u16(d.voltage);
                buf.put_u16(d.avg_voltage);
            }
            Self::Leds(leds) => buf.put_u8(leds.to_bits()),
            Self::Unknown { data, .. } => buf.put_slice(data),
        }
    }
}

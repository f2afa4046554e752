//! Typed attribute fan-out.
//!
//! [`AttributeDispatcher`] sits on the event stream and converts decoded
//! attribute payloads into per-attribute callbacks on [`AttributeListener`].
//! Every callback has an empty default body, so an observer implements only
//! what it cares about. Attribute identifiers the codec does not recognise
//! are logged and dropped; they never reach observers or fail the stream.

use std::sync::Arc;

use crate::codec::attributes::{
    AccRaw, AfeSettings, AttributeValue, Diagnostics, GyroRaw, ImuRaw, Leds, Temperature,
};
use crate::codec::{Message, PulseSample};
use crate::listener::{ListenerId, ListenerSet, MessageListener};
use crate::session::BodyLink;

/// Observer for decoded attribute values. All methods default to no-ops.
#[allow(unused_variables)]
pub trait AttributeListener: Send + Sync {
    fn on_serial_no(&self, serial_no: i64) {}
    fn on_battery_level(&self, percent: u8) {}
    fn on_heartrate(&self, rate: u16) {}
    fn on_heart_rate_variability(&self, variability: u16) {}
    fn on_heart_rate_interval(&self, interval: u16) {}
    fn on_breath_rate(&self, rate: u8) {}
    fn on_sleep_mode(&self, mode: u8) {}
    fn on_charge_state(&self, charging: bool) {}
    fn on_belt_on_body(&self, on_body: bool) {}
    /// Recording state derived from the measurement-deactivated attribute:
    /// `recording` is false while measurement is deactivated.
    fn on_recording_changed(&self, recording: bool) {}
    fn on_firmware_update_progress(&self, percent: u8) {}
    /// Device orientation (high nibble) and activity level (low nibble).
    fn on_imu(&self, orientation: u8, activity: u8) {}
    fn on_imu_raw(&self, sample: &ImuRaw) {}
    fn on_acc_raw(&self, sample: &AccRaw) {}
    fn on_gyro_raw(&self, sample: &GyroRaw) {}
    /// One basic raw pulse sample, from either the attribute stream or a
    /// dedicated raw-pulse event frame.
    fn on_pulse_raw(&self, ecg: i32, ppg: i32) {}
    /// One all-channels raw pulse sample.
    fn on_pulse_raw_all(&self, ecg: i32, ppg_green: i32, ppg_red: i32, ppg_ir: i32) {}
    /// A batch of raw pulse samples delivered in one event frame.
    fn on_pulse_raw_list(&self, ecgs: &[i32], ppgs: &[i32]) {}
    fn on_temperature(&self, temperature: Temperature) {}
    fn on_diagnostics(&self, diagnostics: &Diagnostics) {}
    fn on_leds(&self, leds: &Leds) {}
    /// Basic and all-channels AFE configurations both land here; check
    /// [`AfeSettings::is_all_channels`] to tell them apart.
    fn on_afe_settings(&self, settings: &AfeSettings) {}
}

/// Routes event messages to registered [`AttributeListener`]s.
pub struct AttributeDispatcher {
    listeners: ListenerSet<dyn AttributeListener>,
    registration: std::sync::Mutex<Option<ListenerId>>,
    link: Option<BodyLink>,
}

impl Default for AttributeDispatcher {
    fn default() -> Self { Self::new() }
}

impl AttributeDispatcher {
    /// Standalone dispatcher; feed it by registering it as a message
    /// listener yourself.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: ListenerSet::default(),
            registration: std::sync::Mutex::new(None),
            link: None,
        }
    }

    /// Create a dispatcher and register it on `link`'s event stream.
    #[must_use]
    pub fn attach(link: &BodyLink) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            listeners: ListenerSet::default(),
            registration: std::sync::Mutex::new(None),
            link: Some(link.clone()),
        });
        let id = link.add_message_listener(dispatcher.clone());
        *dispatcher
            .registration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(id);
        dispatcher
    }

    /// Unregister from the link's event stream.
    pub fn detach(&self) {
        let id = self
            .registration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let (Some(id), Some(link)) = (id, self.link.as_ref()) {
            link.discard_message_listener(id);
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn AttributeListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn discard_listener(&self, id: ListenerId) -> bool { self.listeners.discard(id) }

    fn dispatch_value(&self, value: &AttributeValue) {
        self.listeners.for_each("attribute listener", |l| match value {
            AttributeValue::SerialNo(serial_no) => l.on_serial_no(*serial_no),
            AttributeValue::BatteryLevel(percent) => l.on_battery_level(*percent),
            AttributeValue::Heartrate(rate) => l.on_heartrate(*rate),
            AttributeValue::HeartRateVariability(v) => l.on_heart_rate_variability(*v),
            AttributeValue::HeartRateInterval(interval) => l.on_heart_rate_interval(*interval),
            AttributeValue::BreathRate(rate) => l.on_breath_rate(*rate),
            AttributeValue::SleepMode(mode) => l.on_sleep_mode(*mode),
            AttributeValue::ChargeState(charging) => l.on_charge_state(*charging),
            AttributeValue::BeltOnBody(on_body) => l.on_belt_on_body(*on_body),
            AttributeValue::MeasurementDeactivated(value) => {
                l.on_recording_changed(*value == 0);
            }
            AttributeValue::FirmwareUpdateProgress(percent) => {
                l.on_firmware_update_progress(*percent);
            }
            AttributeValue::Imu {
                orientation_and_activity,
            } => l.on_imu(
                (orientation_and_activity & 0xF0) >> 4,
                orientation_and_activity & 0x0F,
            ),
            AttributeValue::ImuRaw(sample) => l.on_imu_raw(sample),
            AttributeValue::AccRaw(sample) => l.on_acc_raw(sample),
            AttributeValue::GyroRaw(sample) => l.on_gyro_raw(sample),
            AttributeValue::PulseRaw { ecg, ppg } => l.on_pulse_raw(*ecg, *ppg),
            AttributeValue::PulseRawAll {
                ecg,
                ppg_green,
                ppg_red,
                ppg_ir,
            } => l.on_pulse_raw_all(*ecg, *ppg_green, *ppg_red, *ppg_ir),
            AttributeValue::Temperature(temperature) => l.on_temperature(*temperature),
            AttributeValue::Diagnostics(diagnostics) => l.on_diagnostics(diagnostics),
            AttributeValue::Leds(leds) => l.on_leds(leds),
            AttributeValue::AfeSettings(settings) => l.on_afe_settings(settings),
            // Filtered before dispatch; nothing to deliver.
            AttributeValue::Unknown { .. } => {}
        });
    }
}

impl MessageListener for AttributeDispatcher {
    fn message_received(&self, message: &Message) {
        match message {
            Message::AttributeChanged {
                attribute_id,
                value,
            } => {
                if let AttributeValue::Unknown { data, .. } = value {
                    tracing::warn!(
                        attribute_id = format_args!("{attribute_id:#04x}"),
                        len = data.len(),
                        "unknown attribute id, dropping"
                    );
                } else {
                    self.dispatch_value(value);
                }
            }
            Message::RawPulseChanged { sample } => match *sample {
                PulseSample::Basic { ecg, ppg } => {
                    self.listeners
                        .for_each("attribute listener", |l| l.on_pulse_raw(ecg, ppg));
                }
                PulseSample::AllChannels {
                    ecg,
                    ppg_green,
                    ppg_red,
                    ppg_ir,
                } => {
                    self.listeners.for_each("attribute listener", |l| {
                        l.on_pulse_raw_all(ecg, ppg_green, ppg_red, ppg_ir);
                    });
                }
            },
            Message::RawPulseListChanged { ecgs, ppgs } => {
                self.listeners
                    .for_each("attribute listener", |l| l.on_pulse_raw_list(ecgs, ppgs));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::codec::attributes::ids;

    #[derive(Default)]
    struct Captured {
        heartrates: Mutex<Vec<u16>>,
        imu: Mutex<Vec<(u8, u8)>>,
        recording: Mutex<Vec<bool>>,
        pulses: Mutex<Vec<(i32, i32)>>,
        afe_all: Mutex<Vec<bool>>,
    }

    impl AttributeListener for Captured {
        fn on_heartrate(&self, rate: u16) {
            self.heartrates.lock().expect("lock").push(rate);
        }

        fn on_imu(&self, orientation: u8, activity: u8) {
            self.imu.lock().expect("lock").push((orientation, activity));
        }

        fn on_recording_changed(&self, recording: bool) {
            self.recording.lock().expect("lock").push(recording);
        }

        fn on_pulse_raw(&self, ecg: i32, ppg: i32) {
            self.pulses.lock().expect("lock").push((ecg, ppg));
        }

        fn on_afe_settings(&self, settings: &AfeSettings) {
            self.afe_all
                .lock()
                .expect("lock")
                .push(settings.is_all_channels());
        }
    }

    fn changed(attribute_id: u8, value: AttributeValue) -> Message {
        Message::AttributeChanged {
            attribute_id,
            value,
        }
    }

    #[test]
    fn heartrate_reaches_the_matching_callback() {
        let dispatcher = AttributeDispatcher::new();
        let captured = Arc::new(Captured::default());
        dispatcher.add_listener(captured.clone());

        dispatcher.message_received(&changed(ids::HEARTRATE, AttributeValue::Heartrate(68)));
        assert_eq!(*captured.heartrates.lock().expect("lock"), vec![68]);
    }

    #[test]
    fn imu_byte_is_split_into_nibbles() {
        let dispatcher = AttributeDispatcher::new();
        let captured = Arc::new(Captured::default());
        dispatcher.add_listener(captured.clone());

        dispatcher.message_received(&changed(
            ids::IMU,
            AttributeValue::Imu {
                orientation_and_activity: 0x52,
            },
        ));
        assert_eq!(*captured.imu.lock().expect("lock"), vec![(0x5, 0x2)]);
    }

    #[test]
    fn measurement_deactivated_inverts_into_recording_state() {
        let dispatcher = AttributeDispatcher::new();
        let captured = Arc::new(Captured::default());
        dispatcher.add_listener(captured.clone());

        dispatcher.message_received(&changed(
            ids::MEASUREMENT_DEACTIVATED,
            AttributeValue::MeasurementDeactivated(1),
        ));
        dispatcher.message_received(&changed(
            ids::MEASUREMENT_DEACTIVATED,
            AttributeValue::MeasurementDeactivated(0),
        ));
        assert_eq!(*captured.recording.lock().expect("lock"), vec![false, true]);
    }

    #[test]
    fn raw_pulse_events_share_the_pulse_callback() {
        let dispatcher = AttributeDispatcher::new();
        let captured = Arc::new(Captured::default());
        dispatcher.add_listener(captured.clone());

        dispatcher.message_received(&Message::RawPulseChanged {
            sample: PulseSample::Basic { ecg: -7, ppg: 9 },
        });
        dispatcher.message_received(&changed(
            ids::PULSE_RAW,
            AttributeValue::PulseRaw { ecg: 1, ppg: 2 },
        ));
        assert_eq!(
            *captured.pulses.lock().expect("lock"),
            vec![(-7, 9), (1, 2)]
        );
    }

    #[test]
    fn both_afe_forms_land_in_one_callback() {
        let dispatcher = AttributeDispatcher::new();
        let captured = Arc::new(Captured::default());
        dispatcher.add_listener(captured.clone());

        let basic = AfeSettings {
            rf_gain: 1,
            cf_value: 2,
            ecg_gain: 3,
            ioffdac_range: 4,
            led1: 5,
            led4: 6,
            off_dac1: 7,
            relative_gain: 1.0,
            led2: None,
            led3: None,
            off_dac2: None,
            off_dac3: None,
        };
        let all = AfeSettings {
            led2: Some(8),
            led3: Some(9),
            off_dac2: Some(10),
            off_dac3: Some(11),
            ..basic
        };
        dispatcher.message_received(&changed(
            ids::AFE_SETTINGS,
            AttributeValue::AfeSettings(basic),
        ));
        dispatcher.message_received(&changed(
            ids::AFE_SETTINGS_ALL,
            AttributeValue::AfeSettings(all),
        ));
        assert_eq!(*captured.afe_all.lock().expect("lock"), vec![false, true]);
    }

    #[test]
    fn unknown_attribute_is_dropped_without_callbacks() {
        let dispatcher = AttributeDispatcher::new();
        let captured = Arc::new(Captured::default());
        dispatcher.add_listener(captured.clone());

        dispatcher.message_received(&changed(
            0x7E,
            AttributeValue::Unknown {
                attribute_id: 0x7E,
                data: vec![1, 2, 3],
            },
        ));
        assert!(captured.heartrates.lock().expect("lock").is_empty());
        assert!(captured.pulses.lock().expect("lock").is_empty());
    }
}

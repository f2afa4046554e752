//! High-level reporting configuration.
//!
//! [`Reporter`] turns "give me heart rate every second" into the underlying
//! configure/reset request pairs and owns an [`AttributeDispatcher`] so the
//! resulting attribute stream lands in typed callbacks. One reporter per
//! session is the intended shape.

use std::sync::Arc;

use crate::codec::Message;
use crate::codec::attributes::ids;
use crate::dispatcher::{AttributeDispatcher, AttributeListener};
use crate::listener::ListenerId;
use crate::session::{BodyLink, SessionError};

/// Reporting modes accepted by the device.
pub mod mode {
    /// Report on every change, or on the configured interval.
    pub const ON_CHANGE: u8 = 0x01;
    /// Stream raw ECG and all PPG channels.
    pub const ECG_PPG_ALL: u8 = 0x03;
}

/// Attributes covered by [`Reporter::stop_all_reporting`].
const REPORTED_ATTRIBUTES: &[u8] = &[
    ids::BATTERY_LEVEL,
    ids::PULSE_RAW,
    ids::PULSE_RAW_ALL,
    ids::IMU,
    ids::IMU_RAW,
    ids::ACC_RAW,
    ids::GYRO_RAW,
    ids::HEARTRATE,
    ids::HEART_RATE_VARIABILITY,
    ids::HEART_RATE_INTERVAL,
    ids::BREATH_RATE,
    ids::SLEEP_MODE,
    ids::CHARGE_STATE,
    ids::BELT_ON_BODY,
    ids::TEMPERATURE,
    ids::DIAGNOSTICS,
    ids::LEDS,
];

macro_rules! reporting_pair {
    ($(#[$meta:meta])* $start:ident / $stop:ident => $attr:expr) => {
        $(#[$meta])*
        /// Returns whether the device acknowledged the request.
        ///
        /// # Errors
        ///
        /// [`SessionError::NotConnected`] when no link is active.
        pub async fn $start(&self, interval: u16) -> Result<bool, SessionError> {
            self.configure($attr, interval, mode::ON_CHANGE).await
        }

        /// Returns whether the device acknowledged the request.
        ///
        /// # Errors
        ///
        /// [`SessionError::NotConnected`] when no link is active.
        pub async fn $stop(&self) -> Result<bool, SessionError> { self.reset($attr).await }
    };
}

/// Configures which attributes the device reports, and at what cadence.
pub struct Reporter {
    link: BodyLink,
    dispatcher: Arc<AttributeDispatcher>,
}

impl Reporter {
    /// Build a reporter on `link` and register its dispatcher for events.
    #[must_use]
    pub fn attach(link: &BodyLink) -> Self {
        Self {
            link: link.clone(),
            dispatcher: AttributeDispatcher::attach(link),
        }
    }

    /// Register an observer for the reported attributes.
    pub fn add_listener(&self, listener: Arc<dyn AttributeListener>) -> ListenerId {
        self.dispatcher.add_listener(listener)
    }

    pub fn discard_listener(&self, id: ListenerId) -> bool { self.dispatcher.discard_listener(id) }

    /// The dispatcher feeding this reporter's observers.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<AttributeDispatcher> { &self.dispatcher }

    /// Unregister the dispatcher from the session's event stream.
    pub fn detach(&self) { self.dispatcher.detach(); }

    reporting_pair!(start_battery_level_reporting / stop_battery_level_reporting => ids::BATTERY_LEVEL);
    reporting_pair!(start_heartrate_reporting / stop_heartrate_reporting => ids::HEARTRATE);
    reporting_pair!(start_heart_rate_variability_reporting / stop_heart_rate_variability_reporting => ids::HEART_RATE_VARIABILITY);
    reporting_pair!(start_heart_rate_interval_reporting / stop_heart_rate_interval_reporting => ids::HEART_RATE_INTERVAL);
    reporting_pair!(start_breath_rate_reporting / stop_breath_rate_reporting => ids::BREATH_RATE);
    reporting_pair!(start_sleep_mode_reporting / stop_sleep_mode_reporting => ids::SLEEP_MODE);
    reporting_pair!(start_charge_state_reporting / stop_charge_state_reporting => ids::CHARGE_STATE);
    reporting_pair!(start_belt_on_body_reporting / stop_belt_on_body_reporting => ids::BELT_ON_BODY);
    reporting_pair!(start_imu_reporting / stop_imu_reporting => ids::IMU);
    reporting_pair!(start_imu_raw_reporting / stop_imu_raw_reporting => ids::IMU_RAW);
    reporting_pair!(start_acc_raw_reporting / stop_acc_raw_reporting => ids::ACC_RAW);
    reporting_pair!(start_gyro_raw_reporting / stop_gyro_raw_reporting => ids::GYRO_RAW);
    reporting_pair!(start_temperature_reporting / stop_temperature_reporting => ids::TEMPERATURE);
    reporting_pair!(start_diagnostics_reporting / stop_diagnostics_reporting => ids::DIAGNOSTICS);
    reporting_pair!(start_leds_reporting / stop_leds_reporting => ids::LEDS);

    /// Stream basic raw ECG/PPG samples.
    ///
    /// Returns whether the device acknowledged the request.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] when no link is active.
    pub async fn start_ecg_ppg_reporting(&self, interval: u16) -> Result<bool, SessionError> {
        self.configure(ids::PULSE_RAW, interval, mode::ON_CHANGE).await
    }

    /// Stream raw ECG plus all PPG channels.
    ///
    /// Returns whether the device acknowledged the request.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] when no link is active.
    pub async fn start_ecg_ppg_all_reporting(&self, interval: u16) -> Result<bool, SessionError> {
        self.configure(ids::PULSE_RAW_ALL, interval, mode::ECG_PPG_ALL)
            .await
    }

    /// Returns whether the device acknowledged the request.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] when no link is active.
    pub async fn stop_ecg_ppg_reporting(&self) -> Result<bool, SessionError> {
        self.reset(ids::PULSE_RAW).await?;
        self.reset(ids::PULSE_RAW_ALL).await
    }

    /// Reset reporting for every attribute this module can configure.
    /// Unacknowledged resets are logged and skipped, never fatal.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] when no link is active.
    pub async fn stop_all_reporting(&self) -> Result<(), SessionError> {
        for &attribute_id in REPORTED_ATTRIBUTES {
            if !self.reset(attribute_id).await? {
                tracing::warn!(
                    attribute_id = format_args!("{attribute_id:#04x}"),
                    "reset reporting unacknowledged"
                );
            }
        }
        Ok(())
    }

    async fn configure(
        &self,
        attribute_id: u8,
        interval: u16,
        reporting_mode: u8,
    ) -> Result<bool, SessionError> {
        let response = self
            .link
            .send(Message::ConfigureReporting {
                attribute_id,
                interval,
                reporting_mode,
            })
            .await?;
        Ok(matches!(response, Some(Message::ConfigureReportingResponse)))
    }

    async fn reset(&self, attribute_id: u8) -> Result<bool, SessionError> {
        let response = self
            .link
            .send(Message::ResetReporting { attribute_id })
            .await?;
        Ok(matches!(response, Some(Message::ResetReportingResponse)))
    }
}

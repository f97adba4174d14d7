use crate::domain::gestures::GestureEvent;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Characteristics exposed by the controller.
///
/// Opaque identifiers; the transport binding maps them onto GATT UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    LedMatrix,
    Battery,
    HardwareVersion,
    FirmwareVersion,
    ModelColor,
    ButtonSensor,
    RotationSensor,
    TouchSensor,
    FlySensor,
    RebootToDfu,
    FlyCalibration,
}

impl Characteristic {
    /// Sensor characteristics the session subscribes to while connecting
    pub const NOTIFICATION_SOURCES: [Characteristic; 4] = [
        Characteristic::FlySensor,
        Characteristic::TouchSensor,
        Characteristic::RotationSensor,
        Characteristic::ButtonSensor,
    ];

    /// Characteristics read once after the connection is established
    pub const DEVICE_INFORMATION: [Characteristic; 4] = [
        Characteristic::Battery,
        Characteristic::FirmwareVersion,
        Characteristic::HardwareVersion,
        Characteristic::ModelColor,
    ];

    pub fn is_notification_source(self) -> bool {
        Self::NOTIFICATION_SOURCES.contains(&self)
    }

    pub fn is_device_information(self) -> bool {
        Self::DEVICE_INFORMATION.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LedMatrix => "led_matrix",
            Self::Battery => "battery",
            Self::HardwareVersion => "hardware_version",
            Self::FirmwareVersion => "firmware_version",
            Self::ModelColor => "model_color",
            Self::ButtonSensor => "button_sensor",
            Self::RotationSensor => "rotation_sensor",
            Self::TouchSensor => "touch_sensor",
            Self::FlySensor => "fly_sensor",
            Self::RebootToDfu => "reboot_to_dfu",
            Self::FlyCalibration => "fly_calibration",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a controller session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The transport rejected the link request or reported a non-success status
    GattError,
    /// The link went down before the connection was established
    ConnectionNotEstablished,
    /// A sensor characteristic has no notification descriptor
    MissingNotificationDescriptor(Characteristic),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GattError => f.write_str("GATT error"),
            Self::ConnectionNotEstablished => f.write_str("connection not established"),
            Self::MissingNotificationDescriptor(c) => {
                write!(f, "no notification descriptor on {}", c)
            }
        }
    }
}

/// Options accepted by `display_led_matrix`, combinable with `|`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct DisplayOptions(u8);

impl DisplayOptions {
    pub const NONE: Self = Self(0);
    /// Write the matrix even if it equals the one currently displayed
    pub const RESEND_DUPLICATES: Self = Self(1 << 0);
    /// Let the previous frame fade out underneath the new one
    pub const WITH_FADE_IN: Self = Self(1 << 1);
    /// Use write-without-response, trading reliability for throughput
    pub const WITHOUT_WRITE_RESPONSE: Self = Self(1 << 2);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DisplayOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DisplayOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Device information read after connecting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInformation {
    pub battery_percentage: Option<u8>,
    pub hardware_version: Option<String>,
    pub firmware_version: Option<String>,
    pub color: Option<String>,
}

/// Everything a session reports to its listeners, as a value.
///
/// Used by channel-based consumers, see `session::listener::ChannelListener`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Connected,
    FailedToConnect(FailReason),
    Disconnected,
    LedMatrixWritten,
    Gesture(GestureEvent),
    BatteryPercentage(u8),
    InformationRead {
        hardware_version: Option<String>,
        firmware_version: Option<String>,
        color: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_options_combine() {
        let options = DisplayOptions::WITH_FADE_IN | DisplayOptions::WITHOUT_WRITE_RESPONSE;
        assert!(options.contains(DisplayOptions::WITH_FADE_IN));
        assert!(options.contains(DisplayOptions::WITHOUT_WRITE_RESPONSE));
        assert!(!options.contains(DisplayOptions::RESEND_DUPLICATES));
        assert_eq!(options.bits(), 0b110);
        assert_eq!(DisplayOptions::from_bits(0xFF).bits(), 0b111);
    }

    #[test]
    fn test_characteristic_groups() {
        assert!(Characteristic::RotationSensor.is_notification_source());
        assert!(!Characteristic::LedMatrix.is_notification_source());
        assert!(Characteristic::Battery.is_device_information());
        assert!(!Characteristic::FlyCalibration.is_device_information());
    }
}

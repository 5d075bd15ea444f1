//! Discriminator enums shared by control commands and data messages

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of data a device can stream, doubling as the frame discriminator
/// of data messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    ControllerInfo = 1,
    Configuration = 2,
    Accelerometer = 3,
    Compass = 4,
    Gyroscope = 5,
    Motion = 6,
    Touch = 7,
    Tap = 8,
    DoubleTap = 9,
    Hold = 10,
    Flick = 11,
    FreeDrag = 12,
    HorizontalDrag = 13,
    VerticalDrag = 14,
    DragComplete = 15,
    CustomDrag = 16,
    CustomDragComplete = 17,
    Pinch = 18,
    PinchComplete = 19,
    Text = 20,
}

impl DataType {
    /// Every data type, in discriminator order
    pub const ALL: [DataType; 20] = [
        DataType::ControllerInfo,
        DataType::Configuration,
        DataType::Accelerometer,
        DataType::Compass,
        DataType::Gyroscope,
        DataType::Motion,
        DataType::Touch,
        DataType::Tap,
        DataType::DoubleTap,
        DataType::Hold,
        DataType::Flick,
        DataType::FreeDrag,
        DataType::HorizontalDrag,
        DataType::VerticalDrag,
        DataType::DragComplete,
        DataType::CustomDrag,
        DataType::CustomDragComplete,
        DataType::Pinch,
        DataType::PinchComplete,
        DataType::Text,
    ];

    /// Get the wire discriminator
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Look up a data type by its wire discriminator
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_u8() == value)
    }

    /// Continuous streams emit samples at a high rate where only the most
    /// recent value matters. They may be throttled and may travel over UDP.
    pub fn is_continuous(self) -> bool {
        matches!(
            self,
            DataType::Accelerometer
                | DataType::Compass
                | DataType::Gyroscope
                | DataType::Motion
                | DataType::Touch
                | DataType::FreeDrag
                | DataType::HorizontalDrag
                | DataType::VerticalDrag
                | DataType::CustomDrag
                | DataType::Pinch
        )
    }

    /// Canonical name, also accepted by `FromStr`
    pub fn name(self) -> &'static str {
        match self {
            DataType::ControllerInfo => "ControllerInfo",
            DataType::Configuration => "Configuration",
            DataType::Accelerometer => "Accelerometer",
            DataType::Compass => "Compass",
            DataType::Gyroscope => "Gyroscope",
            DataType::Motion => "Motion",
            DataType::Touch => "Touch",
            DataType::Tap => "Tap",
            DataType::DoubleTap => "DoubleTap",
            DataType::Hold => "Hold",
            DataType::Flick => "Flick",
            DataType::FreeDrag => "FreeDrag",
            DataType::HorizontalDrag => "HorizontalDrag",
            DataType::VerticalDrag => "VerticalDrag",
            DataType::DragComplete => "DragComplete",
            DataType::CustomDrag => "CustomDrag",
            DataType::CustomDragComplete => "CustomDragComplete",
            DataType::Pinch => "Pinch",
            DataType::PinchComplete => "PinchComplete",
            DataType::Text => "Text",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a data type name does not match any variant
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown data type: {0}")]
pub struct UnknownDataType(pub String);

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        DataType::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownDataType(s.to_string()))
    }
}

/// What a control command asks the device to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlCommandAction {
    /// No acquisition change; used by configuration pushes
    None = 0,
    /// Start acquiring a data type
    Start = 1,
    /// Stop acquiring a data type
    Stop = 2,
}

impl ControlCommandAction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ControlCommandAction::None),
            1 => Some(ControlCommandAction::Start),
            2 => Some(ControlCommandAction::Stop),
            _ => None,
        }
    }
}

/// Phase of a single touch point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TouchPhase {
    Pressed = 0,
    Moved = 1,
    Released = 2,
}

impl TouchPhase {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TouchPhase::Pressed),
            1 => Some(TouchPhase::Moved),
            2 => Some(TouchPhase::Released),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_discriminators_are_dense() {
        for (i, data_type) in DataType::ALL.iter().enumerate() {
            assert_eq!(data_type.as_u8() as usize, i + 1);
            assert_eq!(DataType::from_u8(data_type.as_u8()), Some(*data_type));
        }
        assert_eq!(DataType::from_u8(0), None);
        assert_eq!(DataType::from_u8(21), None);
    }

    #[test]
    fn test_data_type_from_str() {
        assert_eq!("accelerometer".parse::<DataType>(), Ok(DataType::Accelerometer));
        assert_eq!("DoubleTap".parse::<DataType>(), Ok(DataType::DoubleTap));
        assert!("barometer".parse::<DataType>().is_err());
    }

    #[test]
    fn test_continuous_types() {
        assert!(DataType::Gyroscope.is_continuous());
        assert!(!DataType::Tap.is_continuous());
        assert!(!DataType::Text.is_continuous());
    }
}

//! Control command definitions
//!
//! Control commands are sent by the PC to the device: start or stop
//! acquisition of a data type, or push the controller configuration.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::codec::{CodecError, CodecResult, WireFrame, FRAME_HEADER_LEN};
use super::{ControlCommandAction, DataType, PROTOCOL_VERSION};

/// Bits of the discriminator holding the data type
const DATA_TYPE_MASK: u8 = 0x3F;

/// Shift applied to the action in the discriminator
const ACTION_SHIFT: u8 = 6;

/// Settings the server pushes to a device right after it connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfiguration {
    /// Protocol version the server speaks
    pub server_version: u16,
    /// Whether the device should collect diagnostic traces
    pub tracing_enabled: bool,
    /// Where the device uploads diagnostic logs (empty when unset)
    pub tracing_endpoint: String,
}

impl Default for ControllerConfiguration {
    fn default() -> Self {
        Self {
            server_version: PROTOCOL_VERSION,
            tracing_enabled: false,
            tracing_endpoint: String::new(),
        }
    }
}

impl ControllerConfiguration {
    pub fn new(server_version: u16) -> Self {
        Self {
            server_version,
            ..Default::default()
        }
    }

    pub fn with_tracing(mut self, endpoint: impl Into<String>) -> Self {
        self.tracing_enabled = true;
        self.tracing_endpoint = endpoint.into();
        self
    }

    /// Size of the serialized record: version(2) + flag(1) + string length(8) + string
    pub fn encoded_len(&self) -> usize {
        2 + 1 + 8 + self.tracing_endpoint.len()
    }

    pub fn serialize(&self) -> CodecResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CodecError::Configuration(e.to_string()))
    }

    /// Deserialize a record, rejecting trailing bytes so that the round trip
    /// is byte-exact.
    pub fn deserialize(bytes: &[u8]) -> CodecResult<Self> {
        let config: Self =
            bincode::deserialize(bytes).map_err(|e| CodecError::Configuration(e.to_string()))?;
        if config.encoded_len() != bytes.len() {
            return Err(CodecError::TrailingBytes(
                bytes.len().saturating_sub(config.encoded_len()),
            ));
        }
        Ok(config)
    }
}

/// Instruction from the PC to the device
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Push controller configuration (action `None`, data type `Configuration`)
    Configure(ControllerConfiguration),
    /// Start acquiring a data type
    Start(DataType),
    /// Stop acquiring a data type
    Stop(DataType),
}

impl ControlCommand {
    pub fn action(&self) -> ControlCommandAction {
        match self {
            ControlCommand::Configure(_) => ControlCommandAction::None,
            ControlCommand::Start(_) => ControlCommandAction::Start,
            ControlCommand::Stop(_) => ControlCommandAction::Stop,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            ControlCommand::Configure(_) => DataType::Configuration,
            ControlCommand::Start(t) | ControlCommand::Stop(t) => *t,
        }
    }

    /// Total wire length of this command, including the length byte
    pub fn length(&self) -> usize {
        match self {
            ControlCommand::Configure(config) => FRAME_HEADER_LEN + config.encoded_len(),
            ControlCommand::Start(_) | ControlCommand::Stop(_) => FRAME_HEADER_LEN,
        }
    }
}

impl WireFrame for ControlCommand {
    fn discriminator(&self) -> u8 {
        ((self.action() as u8) << ACTION_SHIFT) | self.data_type().as_u8()
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> CodecResult<()> {
        if let ControlCommand::Configure(config) = self {
            buf.put_slice(&config.serialize()?);
        }
        Ok(())
    }

    fn decode_payload(discriminator: u8, payload: &[u8]) -> CodecResult<Self> {
        let action = ControlCommandAction::from_u8(discriminator >> ACTION_SHIFT)
            .ok_or(CodecError::UnknownDiscriminator(discriminator))?;
        let data_type = DataType::from_u8(discriminator & DATA_TYPE_MASK)
            .ok_or(CodecError::UnknownDiscriminator(discriminator))?;

        match action {
            ControlCommandAction::None if data_type == DataType::Configuration => Ok(
                ControlCommand::Configure(ControllerConfiguration::deserialize(payload)?),
            ),
            ControlCommandAction::None => Err(CodecError::UnknownDiscriminator(discriminator)),
            ControlCommandAction::Start | ControlCommandAction::Stop => {
                if !payload.is_empty() {
                    return Err(CodecError::PayloadSize {
                        kind: "control command",
                        expected: 0,
                        actual: payload.len(),
                    });
                }
                Ok(if action == ControlCommandAction::Start {
                    ControlCommand::Start(data_type)
                } else {
                    ControlCommand::Stop(data_type)
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_exact, encode_frame};

    fn encode(command: &ControlCommand) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(command, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_stop_command_is_two_bytes() {
        let command = ControlCommand::Stop(DataType::Accelerometer);
        let bytes = encode(&command);
        assert_eq!(&bytes[..], &[2, 0x80 | 3]);
        assert_eq!(command.length(), 2);
    }

    #[test]
    fn test_length_matches_serialized_size() {
        let commands = vec![
            ControlCommand::Start(DataType::Gyroscope),
            ControlCommand::Configure(ControllerConfiguration::default()),
            ControlCommand::Configure(
                ControllerConfiguration::new(7).with_tracing("http://10.0.0.2:8080/logs"),
            ),
        ];
        for command in commands {
            let bytes = encode(&command);
            assert_eq!(command.length(), bytes.len());
            assert_eq!(bytes[0] as usize, bytes.len());
        }
    }

    #[test]
    fn test_wire_roundtrip_is_byte_exact() {
        let commands = vec![
            ControlCommand::Start(DataType::Text),
            ControlCommand::Stop(DataType::Touch),
            ControlCommand::Configure(ControllerConfiguration::new(3).with_tracing("log-host")),
        ];
        for command in commands {
            let bytes = encode(&command);
            let decoded: ControlCommand = decode_exact(&bytes).unwrap();
            assert_eq!(decoded, command);
            assert_eq!(encode(&decoded), bytes);
        }
    }

    #[test]
    fn test_configuration_record_roundtrip() {
        let config = ControllerConfiguration::new(9).with_tracing("https://diag.local/upload");
        let bytes = config.serialize().unwrap();
        assert_eq!(bytes.len(), config.encoded_len());
        assert_eq!(ControllerConfiguration::deserialize(&bytes).unwrap(), config);

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(ControllerConfiguration::deserialize(&padded).is_err());
    }

    #[test]
    fn test_oversized_configuration_is_rejected() {
        let config = ControllerConfiguration::new(2).with_tracing("x".repeat(250));
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_frame(&ControlCommand::Configure(config), &mut buf),
            Err(CodecError::FrameTooLarge(..))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_discriminators() {
        // action None only pairs with Configuration
        assert!(decode_exact::<ControlCommand>(&[2, 3]).is_err());
        // action value 3 is unused
        assert!(decode_exact::<ControlCommand>(&[2, 0xC3]).is_err());
        // Start carries no payload
        assert!(decode_exact::<ControlCommand>(&[3, 0x43, 0]).is_err());
    }
}

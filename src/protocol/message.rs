//! Data message definitions
//!
//! Defines every message a device streams to the PC. Each variant is keyed by
//! a [`DataType`] and owns a strictly typed payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::codec::{
    decode_exact, encode_frame, expect_len, read_f32s, CodecError, CodecResult, WireFrame,
    MAX_PAYLOAD_LEN,
};
use super::{ControllerConfiguration, DataType, TouchPhase};

/// Discriminator of a text chunk that is followed by more text
pub const TEXT_CONTINUATION: u8 = 0x80;

/// Longest text a single `Text` message may carry (64 KiB)
pub const MAX_TEXT_LEN: usize = 64 * 1024;

/// Three-axis sensor reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Compass reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompassReading {
    /// Heading relative to magnetic north, in degrees
    pub magnetic_heading: f32,
    /// Heading relative to geographic north, in degrees
    pub true_heading: f32,
    /// Heading accuracy, in degrees
    pub accuracy: f32,
    /// Raw magnetometer reading, in microteslas
    pub raw: Vector3,
}

/// Fused motion reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionReading {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub gravity: Vector3,
    pub acceleration: Vector3,
}

/// A single touch point in screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TouchPoint {
    pub id: u8,
    pub x: f32,
    pub y: f32,
    pub phase: TouchPhase,
}

/// Screen position of a discrete gesture
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GesturePoint {
    pub x: f32,
    pub y: f32,
}

/// Position and movement delta of a drag or flick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GestureDelta {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
}

/// Two-finger pinch
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PinchGesture {
    pub first: GestureDelta,
    pub second: GestureDelta,
}

/// Device identification sent when a data channel opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub client_version: u16,
    pub device_name: String,
}

/// All possible data messages
#[derive(Debug, Clone, PartialEq)]
pub enum DataMessage {
    ControllerInfo(ControllerInfo),
    Configuration(ControllerConfiguration),
    Accelerometer(Vector3),
    Compass(CompassReading),
    Gyroscope(Vector3),
    Motion(MotionReading),
    Touch(TouchPoint),
    Tap(GesturePoint),
    DoubleTap(GesturePoint),
    Hold(GesturePoint),
    Flick(GestureDelta),
    FreeDrag(GestureDelta),
    HorizontalDrag(GestureDelta),
    VerticalDrag(GestureDelta),
    DragComplete,
    CustomDrag(GestureDelta),
    CustomDragComplete,
    Pinch(PinchGesture),
    PinchComplete,
    Text(String),
}

impl DataMessage {
    /// Get the data type this message belongs to
    pub fn data_type(&self) -> DataType {
        match self {
            DataMessage::ControllerInfo(_) => DataType::ControllerInfo,
            DataMessage::Configuration(_) => DataType::Configuration,
            DataMessage::Accelerometer(_) => DataType::Accelerometer,
            DataMessage::Compass(_) => DataType::Compass,
            DataMessage::Gyroscope(_) => DataType::Gyroscope,
            DataMessage::Motion(_) => DataType::Motion,
            DataMessage::Touch(_) => DataType::Touch,
            DataMessage::Tap(_) => DataType::Tap,
            DataMessage::DoubleTap(_) => DataType::DoubleTap,
            DataMessage::Hold(_) => DataType::Hold,
            DataMessage::Flick(_) => DataType::Flick,
            DataMessage::FreeDrag(_) => DataType::FreeDrag,
            DataMessage::HorizontalDrag(_) => DataType::HorizontalDrag,
            DataMessage::VerticalDrag(_) => DataType::VerticalDrag,
            DataMessage::DragComplete => DataType::DragComplete,
            DataMessage::CustomDrag(_) => DataType::CustomDrag,
            DataMessage::CustomDragComplete => DataType::CustomDragComplete,
            DataMessage::Pinch(_) => DataType::Pinch,
            DataMessage::PinchComplete => DataType::PinchComplete,
            DataMessage::Text(_) => DataType::Text,
        }
    }

    /// Encode for a byte stream. Text longer than one frame is split into
    /// continuation chunks; everything else is a single frame.
    ///
    /// Returns the number of frames written. On failure `buf` is unchanged.
    pub fn encode(&self, buf: &mut BytesMut) -> CodecResult<usize> {
        let DataMessage::Text(text) = self else {
            encode_frame(&DataFrame::Message(self.clone()), buf)?;
            return Ok(1);
        };

        if text.len() > MAX_TEXT_LEN {
            return Err(CodecError::TextTooLong(text.len(), MAX_TEXT_LEN));
        }

        let bytes = Bytes::copy_from_slice(text.as_bytes());
        if bytes.is_empty() {
            encode_frame(&DataFrame::text_chunk(bytes, false), buf)?;
            return Ok(1);
        }

        let start = buf.len();
        let chunks = bytes.len().div_ceil(MAX_PAYLOAD_LEN);
        for index in 0..chunks {
            let from = index * MAX_PAYLOAD_LEN;
            let to = (from + MAX_PAYLOAD_LEN).min(bytes.len());
            let chunk = DataFrame::text_chunk(bytes.slice(from..to), index + 1 < chunks);
            if let Err(e) = encode_frame(&chunk, buf) {
                buf.truncate(start);
                return Err(e);
            }
        }
        Ok(chunks)
    }

    /// Encode as a single datagram. Datagrams are never split, so text that
    /// does not fit one frame is rejected.
    pub fn encode_datagram(&self, buf: &mut BytesMut) -> CodecResult<()> {
        encode_frame(&DataFrame::from(self.clone()), buf).map(|_| ())
    }

    /// Decode a datagram holding exactly one complete frame
    pub fn decode_datagram(datagram: &[u8]) -> CodecResult<Self> {
        match decode_exact::<DataFrame>(datagram)? {
            DataFrame::Message(message) => Ok(message),
            DataFrame::Text { continued: true, .. } => Err(CodecError::UnexpectedContinuation),
            DataFrame::Text { chunk, .. } => String::from_utf8(chunk.to_vec())
                .map(DataMessage::Text)
                .map_err(|_| CodecError::InvalidText),
        }
    }
}

/// One data frame on the wire: either a whole message or a chunk of text.
#[derive(Debug, Clone, PartialEq)]
pub enum DataFrame {
    /// Any message other than text
    Message(DataMessage),
    /// Raw text bytes; `continued` is set on every chunk but the last
    Text { chunk: Bytes, continued: bool },
}

impl DataFrame {
    fn text_chunk(chunk: Bytes, continued: bool) -> Self {
        DataFrame::Text { chunk, continued }
    }
}

impl From<DataMessage> for DataFrame {
    fn from(message: DataMessage) -> Self {
        match message {
            DataMessage::Text(text) => DataFrame::text_chunk(Bytes::from(text), false),
            other => DataFrame::Message(other),
        }
    }
}

fn put_f32s(buf: &mut BytesMut, values: &[f32]) {
    for value in values {
        buf.put_f32(*value);
    }
}

fn put_delta(buf: &mut BytesMut, delta: &GestureDelta) {
    put_f32s(buf, &[delta.x, delta.y, delta.dx, delta.dy]);
}

fn read_delta(kind: &'static str, payload: &[u8]) -> CodecResult<GestureDelta> {
    expect_len(kind, payload, 16)?;
    let [x, y, dx, dy] = read_f32s::<4>(payload);
    Ok(GestureDelta { x, y, dx, dy })
}

fn read_point(kind: &'static str, payload: &[u8]) -> CodecResult<GesturePoint> {
    expect_len(kind, payload, 8)?;
    let [x, y] = read_f32s::<2>(payload);
    Ok(GesturePoint { x, y })
}

fn read_vector(kind: &'static str, payload: &[u8]) -> CodecResult<Vector3> {
    expect_len(kind, payload, 12)?;
    let [x, y, z] = read_f32s::<3>(payload);
    Ok(Vector3 { x, y, z })
}

impl WireFrame for DataFrame {
    fn discriminator(&self) -> u8 {
        match self {
            DataFrame::Message(message) => message.data_type().as_u8(),
            DataFrame::Text { continued: true, .. } => TEXT_CONTINUATION,
            DataFrame::Text { .. } => DataType::Text.as_u8(),
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> CodecResult<()> {
        let message = match self {
            DataFrame::Text { chunk, .. } => {
                buf.put_slice(chunk);
                return Ok(());
            }
            DataFrame::Message(message) => message,
        };

        match message {
            DataMessage::ControllerInfo(info) => {
                buf.put_u16(info.client_version);
                buf.put_slice(info.device_name.as_bytes());
            }
            DataMessage::Configuration(config) => buf.put_slice(&config.serialize()?),
            DataMessage::Accelerometer(v) | DataMessage::Gyroscope(v) => {
                put_f32s(buf, &[v.x, v.y, v.z]);
            }
            DataMessage::Compass(c) => put_f32s(
                buf,
                &[c.magnetic_heading, c.true_heading, c.accuracy, c.raw.x, c.raw.y, c.raw.z],
            ),
            DataMessage::Motion(m) => put_f32s(
                buf,
                &[
                    m.yaw,
                    m.pitch,
                    m.roll,
                    m.gravity.x,
                    m.gravity.y,
                    m.gravity.z,
                    m.acceleration.x,
                    m.acceleration.y,
                    m.acceleration.z,
                ],
            ),
            DataMessage::Touch(t) => {
                buf.put_u8(t.id);
                put_f32s(buf, &[t.x, t.y]);
                buf.put_u8(t.phase as u8);
            }
            DataMessage::Tap(p) | DataMessage::DoubleTap(p) | DataMessage::Hold(p) => {
                put_f32s(buf, &[p.x, p.y]);
            }
            DataMessage::Flick(d)
            | DataMessage::FreeDrag(d)
            | DataMessage::HorizontalDrag(d)
            | DataMessage::VerticalDrag(d)
            | DataMessage::CustomDrag(d) => put_delta(buf, d),
            DataMessage::Pinch(p) => {
                put_delta(buf, &p.first);
                put_delta(buf, &p.second);
            }
            DataMessage::DragComplete
            | DataMessage::CustomDragComplete
            | DataMessage::PinchComplete => {}
            DataMessage::Text(text) => buf.put_slice(text.as_bytes()),
        }
        Ok(())
    }

    fn decode_payload(discriminator: u8, payload: &[u8]) -> CodecResult<Self> {
        if discriminator == TEXT_CONTINUATION {
            return Ok(DataFrame::text_chunk(Bytes::copy_from_slice(payload), true));
        }

        let data_type =
            DataType::from_u8(discriminator).ok_or(CodecError::UnknownDiscriminator(discriminator))?;
        let kind = data_type.name();

        let message = match data_type {
            DataType::Text => {
                return Ok(DataFrame::text_chunk(Bytes::copy_from_slice(payload), false));
            }
            DataType::ControllerInfo => {
                if payload.len() < 2 {
                    return Err(CodecError::PayloadSize {
                        kind,
                        expected: 2,
                        actual: payload.len(),
                    });
                }
                let mut cursor = payload;
                let client_version = cursor.get_u16();
                let device_name =
                    String::from_utf8(cursor.to_vec()).map_err(|_| CodecError::InvalidText)?;
                DataMessage::ControllerInfo(ControllerInfo {
                    client_version,
                    device_name,
                })
            }
            DataType::Configuration => {
                DataMessage::Configuration(ControllerConfiguration::deserialize(payload)?)
            }
            DataType::Accelerometer => DataMessage::Accelerometer(read_vector(kind, payload)?),
            DataType::Gyroscope => DataMessage::Gyroscope(read_vector(kind, payload)?),
            DataType::Compass => {
                expect_len(kind, payload, 24)?;
                let [magnetic_heading, true_heading, accuracy, x, y, z] = read_f32s::<6>(payload);
                DataMessage::Compass(CompassReading {
                    magnetic_heading,
                    true_heading,
                    accuracy,
                    raw: Vector3 { x, y, z },
                })
            }
            DataType::Motion => {
                expect_len(kind, payload, 36)?;
                let [yaw, pitch, roll, gx, gy, gz, ax, ay, az] = read_f32s::<9>(payload);
                DataMessage::Motion(MotionReading {
                    yaw,
                    pitch,
                    roll,
                    gravity: Vector3::new(gx, gy, gz),
                    acceleration: Vector3::new(ax, ay, az),
                })
            }
            DataType::Touch => {
                expect_len(kind, payload, 10)?;
                let phase = TouchPhase::from_u8(payload[9])
                    .ok_or(CodecError::InvalidValue("touch phase", payload[9]))?;
                let [x, y] = read_f32s::<2>(&payload[1..9]);
                DataMessage::Touch(TouchPoint {
                    id: payload[0],
                    x,
                    y,
                    phase,
                })
            }
            DataType::Tap => DataMessage::Tap(read_point(kind, payload)?),
            DataType::DoubleTap => DataMessage::DoubleTap(read_point(kind, payload)?),
            DataType::Hold => DataMessage::Hold(read_point(kind, payload)?),
            DataType::Flick => DataMessage::Flick(read_delta(kind, payload)?),
            DataType::FreeDrag => DataMessage::FreeDrag(read_delta(kind, payload)?),
            DataType::HorizontalDrag => DataMessage::HorizontalDrag(read_delta(kind, payload)?),
            DataType::VerticalDrag => DataMessage::VerticalDrag(read_delta(kind, payload)?),
            DataType::CustomDrag => DataMessage::CustomDrag(read_delta(kind, payload)?),
            DataType::Pinch => {
                expect_len(kind, payload, 32)?;
                DataMessage::Pinch(PinchGesture {
                    first: read_delta(kind, &payload[..16])?,
                    second: read_delta(kind, &payload[16..])?,
                })
            }
            DataType::DragComplete => {
                expect_len(kind, payload, 0)?;
                DataMessage::DragComplete
            }
            DataType::CustomDragComplete => {
                expect_len(kind, payload, 0)?;
                DataMessage::CustomDragComplete
            }
            DataType::PinchComplete => {
                expect_len(kind, payload, 0)?;
                DataMessage::PinchComplete
            }
        };

        Ok(DataFrame::Message(message))
    }
}

/// Joins text chunks arriving on a byte stream back into `Text` messages.
#[derive(Debug, Default)]
pub struct TextAssembler {
    pending: Option<BytesMut>,
}

impl TextAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded frame. Returns a message once one is complete.
    pub fn accept(&mut self, frame: DataFrame) -> CodecResult<Option<DataMessage>> {
        let (chunk, continued) = match frame {
            DataFrame::Message(message) => return Ok(Some(message)),
            DataFrame::Text { chunk, continued } => (chunk, continued),
        };

        let pending = self.pending.get_or_insert_with(BytesMut::new);
        if pending.len() + chunk.len() > MAX_TEXT_LEN {
            let total = pending.len() + chunk.len();
            self.pending = None;
            return Err(CodecError::TextTooLong(total, MAX_TEXT_LEN));
        }
        pending.extend_from_slice(&chunk);

        if continued {
            return Ok(None);
        }

        let bytes = self.pending.take().unwrap_or_default();
        String::from_utf8(bytes.to_vec())
            .map(|text| Some(DataMessage::Text(text)))
            .map_err(|_| CodecError::InvalidText)
    }

    /// Whether a partially received text is buffered
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_frame, MAX_FRAME_LEN};

    fn samples() -> Vec<DataMessage> {
        let delta = GestureDelta {
            x: 10.0,
            y: 20.5,
            dx: -1.5,
            dy: 3.25,
        };
        vec![
            DataMessage::ControllerInfo(ControllerInfo {
                client_version: 2,
                device_name: "Lumia".to_string(),
            }),
            DataMessage::Configuration(ControllerConfiguration::new(2).with_tracing("diag")),
            DataMessage::Accelerometer(Vector3::new(0.1, -0.98, 0.02)),
            DataMessage::Compass(CompassReading {
                magnetic_heading: 181.0,
                true_heading: 183.5,
                accuracy: 5.0,
                raw: Vector3::new(12.0, -30.0, 44.0),
            }),
            DataMessage::Gyroscope(Vector3::new(0.5, 0.25, -0.125)),
            DataMessage::Motion(MotionReading {
                yaw: 0.1,
                pitch: 0.2,
                roll: 0.3,
                gravity: Vector3::new(0.0, 0.0, -1.0),
                acceleration: Vector3::new(0.01, 0.02, 0.03),
            }),
            DataMessage::Touch(TouchPoint {
                id: 1,
                x: 240.0,
                y: 400.0,
                phase: TouchPhase::Moved,
            }),
            DataMessage::Tap(GesturePoint { x: 1.0, y: 2.0 }),
            DataMessage::DoubleTap(GesturePoint { x: 3.0, y: 4.0 }),
            DataMessage::Hold(GesturePoint { x: 5.0, y: 6.0 }),
            DataMessage::Flick(delta),
            DataMessage::FreeDrag(delta),
            DataMessage::HorizontalDrag(delta),
            DataMessage::VerticalDrag(delta),
            DataMessage::DragComplete,
            DataMessage::CustomDrag(delta),
            DataMessage::CustomDragComplete,
            DataMessage::Pinch(PinchGesture {
                first: delta,
                second: GestureDelta::default(),
            }),
            DataMessage::PinchComplete,
            DataMessage::Text("hello".to_string()),
        ]
    }

    #[test]
    fn test_every_variant_roundtrips() {
        let messages = samples();
        assert_eq!(messages.len(), DataType::ALL.len());

        for message in messages {
            let mut buf = BytesMut::new();
            message.encode_datagram(&mut buf).unwrap();
            assert_eq!(buf[0] as usize, buf.len());
            assert_eq!(buf[1], message.data_type().as_u8());

            let decoded = DataMessage::decode_datagram(&buf).unwrap();
            assert_eq!(decoded, message);

            let mut again = BytesMut::new();
            decoded.encode_datagram(&mut again).unwrap();
            assert_eq!(again, buf);
        }
    }

    #[test]
    fn test_max_text_frame_roundtrip() {
        let mut wire = vec![MAX_FRAME_LEN as u8, DataType::Text.as_u8()];
        wire.extend(std::iter::repeat(b'a').take(MAX_PAYLOAD_LEN));

        let message = DataMessage::decode_datagram(&wire).unwrap();
        let mut buf = BytesMut::new();
        assert_eq!(message.encode(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..], &wire[..]);
    }

    #[test]
    fn test_long_text_is_chunked_and_reassembled() {
        let text = "ä".repeat(300); // 600 bytes, chunk boundaries split characters
        let message = DataMessage::Text(text.clone());

        let mut buf = BytesMut::new();
        assert_eq!(message.encode(&mut buf).unwrap(), 3);
        assert_eq!(buf[1], TEXT_CONTINUATION);

        let mut assembler = TextAssembler::new();
        let mut out = Vec::new();
        while let Some(frame) = decode_frame::<DataFrame>(&mut buf).unwrap() {
            if let Some(message) = assembler.accept(frame).unwrap() {
                out.push(message);
            }
        }
        assert_eq!(out, vec![DataMessage::Text(text)]);
        assert!(!assembler.has_pending());
    }

    #[test]
    fn test_long_text_rejected_as_datagram() {
        let message = DataMessage::Text("b".repeat(MAX_PAYLOAD_LEN + 1));
        let mut buf = BytesMut::new();
        assert!(matches!(
            message.encode_datagram(&mut buf),
            Err(CodecError::FrameTooLarge(..))
        ));
    }

    #[test]
    fn test_continuation_datagram_rejected() {
        let wire = [3u8, TEXT_CONTINUATION, b'x'];
        assert_eq!(
            DataMessage::decode_datagram(&wire).unwrap_err(),
            CodecError::UnexpectedContinuation
        );
    }

    #[test]
    fn test_wrong_payload_size() {
        let wire = [4u8, DataType::Accelerometer.as_u8(), 0, 0];
        assert!(matches!(
            DataMessage::decode_datagram(&wire),
            Err(CodecError::PayloadSize { expected: 12, actual: 2, .. })
        ));
    }

    #[test]
    fn test_text_over_limit_is_rejected() {
        let message = DataMessage::Text("z".repeat(MAX_TEXT_LEN + 1));
        let mut buf = BytesMut::new();
        assert!(matches!(
            message.encode(&mut buf),
            Err(CodecError::TextTooLong(..))
        ));
        assert!(buf.is_empty());
    }
}

//! Per stream rate limiting of outgoing samples
//!
//! Continuous streams (accelerometer, gyroscope, drags, ...) may produce
//! samples much faster than the link should carry them. Within the minimum
//! interval only the newest sample of a stream is kept; it goes out when the
//! interval has elapsed. Discrete events are never held back, and they never
//! overtake a held sample of the gesture they close.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{DataMessage, DataType, TouchPhase};

/// One coalescable sample stream. Touch points are tracked per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub data_type: DataType,
    pub touch_id: Option<u8>,
}

impl StreamKey {
    /// `None` for messages that must go out as they are: discrete events
    /// and touch press/release edges.
    pub fn of(message: &DataMessage) -> Option<Self> {
        match message {
            DataMessage::Touch(point) if point.phase != TouchPhase::Moved => None,
            DataMessage::Touch(point) => Some(Self {
                data_type: DataType::Touch,
                touch_id: Some(point.id),
            }),
            other if other.data_type().is_continuous() => Some(Self {
                data_type: other.data_type(),
                touch_id: None,
            }),
            _ => None,
        }
    }

    /// Whether a held sample of this stream has to reach the wire before
    /// `message`
    fn closed_by(&self, message: &DataMessage) -> bool {
        match message {
            DataMessage::DragComplete => matches!(
                self.data_type,
                DataType::FreeDrag | DataType::HorizontalDrag | DataType::VerticalDrag
            ),
            DataMessage::CustomDragComplete => self.data_type == DataType::CustomDrag,
            DataMessage::PinchComplete => self.data_type == DataType::Pinch,
            DataMessage::Touch(point) => self.touch_id == Some(point.id),
            _ => false,
        }
    }
}

/// What to do with a sample offered to the throttle
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// Send `message` now, right after the held samples it flushed
    Send {
        flushed: Vec<(StreamKey, DataMessage)>,
        message: DataMessage,
    },
    /// Held back; schedule a flush for `key` at `until`
    Deferred { key: StreamKey, until: Instant },
    /// Replaced a sample already held back; a flush is already scheduled
    Coalesced { key: StreamKey },
}

impl Admission {
    fn immediate(message: DataMessage) -> Self {
        Admission::Send {
            flushed: Vec::new(),
            message,
        }
    }
}

/// Latest-value-wins throttle keyed by stream
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_sent: HashMap<StreamKey, Instant>,
    /// Held samples in the order they were first held back
    deferred: Vec<(StreamKey, DataMessage)>,
}

impl Throttle {
    /// An interval of zero disables throttling
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: HashMap::new(),
            deferred: Vec::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn admit(&mut self, message: DataMessage, now: Instant) -> Admission {
        if self.interval.is_zero() {
            return Admission::immediate(message);
        }
        let Some(key) = StreamKey::of(&message) else {
            let flushed = self.take_closed_by(&message, now);
            return Admission::Send { flushed, message };
        };

        if let Some((_, held)) = self.deferred.iter_mut().find(|(k, _)| *k == key) {
            *held = message;
            return Admission::Coalesced { key };
        }

        match self.last_sent.get(&key) {
            Some(&last) if now < last + self.interval => {
                self.deferred.push((key, message));
                Admission::Deferred {
                    key,
                    until: last + self.interval,
                }
            }
            _ => {
                self.last_sent.insert(key, now);
                Admission::immediate(message)
            }
        }
    }

    fn take_closed_by(
        &mut self,
        message: &DataMessage,
        now: Instant,
    ) -> Vec<(StreamKey, DataMessage)> {
        let (closed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|(key, _)| key.closed_by(message));
        self.deferred = kept;
        for (key, _) in &closed {
            self.last_sent.insert(*key, now);
        }
        closed
    }

    /// Release the sample held back for `key`, if any
    pub fn take_due(&mut self, key: StreamKey, now: Instant) -> Option<DataMessage> {
        let index = self.deferred.iter().position(|(k, _)| *k == key)?;
        let (_, message) = self.deferred.remove(index);
        self.last_sent.insert(key, now);
        Some(message)
    }

    /// Drop every sample of `data_type` held back, returning how many
    pub fn discard(&mut self, data_type: DataType) -> usize {
        let before = self.deferred.len();
        self.deferred.retain(|(key, _)| key.data_type != data_type);
        before - self.deferred.len()
    }

    pub fn held(&self) -> usize {
        self.deferred.len()
    }

    pub fn clear(&mut self) {
        self.last_sent.clear();
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GestureDelta, GesturePoint, TouchPoint, Vector3};

    fn accel(x: f32) -> DataMessage {
        DataMessage::Accelerometer(Vector3::new(x, 0.0, 0.0))
    }

    fn drag(x: f32) -> DataMessage {
        DataMessage::FreeDrag(GestureDelta {
            x,
            y: 0.0,
            dx: 1.0,
            dy: 0.0,
        })
    }

    fn touch(id: u8, x: f32, phase: TouchPhase) -> DataMessage {
        DataMessage::Touch(TouchPoint { id, x, y: 0.0, phase })
    }

    fn key(message: &DataMessage) -> StreamKey {
        StreamKey::of(message).unwrap()
    }

    fn send(message: DataMessage) -> Admission {
        Admission::immediate(message)
    }

    #[test]
    fn test_disabled_throttle_sends_everything() {
        let mut throttle = Throttle::new(Duration::ZERO);
        let now = Instant::now();
        assert_eq!(throttle.admit(accel(1.0), now), send(accel(1.0)));
        assert_eq!(throttle.admit(accel(2.0), now), send(accel(2.0)));
    }

    #[test]
    fn test_latest_value_wins() {
        let interval = Duration::from_millis(50);
        let mut throttle = Throttle::new(interval);
        let t0 = Instant::now();

        assert_eq!(throttle.admit(accel(1.0), t0), send(accel(1.0)));
        assert_eq!(
            throttle.admit(accel(2.0), t0 + Duration::from_millis(10)),
            Admission::Deferred {
                key: key(&accel(0.0)),
                until: t0 + interval
            }
        );
        assert_eq!(
            throttle.admit(accel(3.0), t0 + Duration::from_millis(20)),
            Admission::Coalesced {
                key: key(&accel(0.0))
            }
        );
        assert_eq!(throttle.held(), 1);

        let due = throttle.take_due(key(&accel(0.0)), t0 + interval);
        assert_eq!(due, Some(accel(3.0)));
        assert_eq!(throttle.held(), 0);
    }

    #[test]
    fn test_interval_elapsed_sends_directly() {
        let interval = Duration::from_millis(50);
        let mut throttle = Throttle::new(interval);
        let t0 = Instant::now();

        throttle.admit(accel(1.0), t0);
        assert_eq!(
            throttle.admit(accel(2.0), t0 + interval),
            send(accel(2.0))
        );
    }

    #[test]
    fn test_types_are_independent() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let t0 = Instant::now();
        throttle.admit(accel(1.0), t0);

        let gyro = DataMessage::Gyroscope(Vector3::new(0.0, 1.0, 0.0));
        assert_eq!(throttle.admit(gyro.clone(), t0), send(gyro));
    }

    #[test]
    fn test_discrete_events_are_never_throttled() {
        let mut throttle = Throttle::new(Duration::from_secs(1));
        let now = Instant::now();
        let tap = DataMessage::Tap(GesturePoint { x: 1.0, y: 1.0 });
        for _ in 0..3 {
            assert_eq!(throttle.admit(tap.clone(), now), send(tap.clone()));
        }
    }

    #[test]
    fn test_discard() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let t0 = Instant::now();
        throttle.admit(accel(1.0), t0);
        throttle.admit(accel(2.0), t0);
        assert_eq!(throttle.discard(DataType::Accelerometer), 1);
        assert_eq!(throttle.take_due(key(&accel(0.0)), t0), None);
    }

    #[test]
    fn test_completion_flushes_its_gesture_first() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let t0 = Instant::now();
        throttle.admit(drag(1.0), t0);
        throttle.admit(drag(2.0), t0);
        throttle.admit(accel(1.0), t0);
        throttle.admit(accel(2.0), t0);
        assert_eq!(throttle.held(), 2);

        assert_eq!(
            throttle.admit(DataMessage::DragComplete, t0),
            Admission::Send {
                flushed: vec![(key(&drag(0.0)), drag(2.0))],
                message: DataMessage::DragComplete,
            }
        );
        // the accelerometer is not part of the drag
        assert_eq!(throttle.held(), 1);
        assert_eq!(throttle.take_due(key(&drag(0.0)), t0), None);
    }

    #[test]
    fn test_pinch_completion_leaves_drags_alone() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let t0 = Instant::now();
        throttle.admit(drag(1.0), t0);
        throttle.admit(drag(2.0), t0);

        assert_eq!(
            throttle.admit(DataMessage::PinchComplete, t0),
            send(DataMessage::PinchComplete)
        );
        assert_eq!(throttle.held(), 1);
    }

    #[test]
    fn test_touch_edges_are_never_coalesced() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let t0 = Instant::now();
        let moved = touch(1, 1.0, TouchPhase::Moved);
        assert_eq!(throttle.admit(moved.clone(), t0), send(moved));

        let held = touch(1, 2.0, TouchPhase::Moved);
        assert!(matches!(
            throttle.admit(held.clone(), t0),
            Admission::Deferred { .. }
        ));

        let released = touch(1, 2.0, TouchPhase::Released);
        assert_eq!(
            throttle.admit(released.clone(), t0),
            Admission::Send {
                flushed: vec![(key(&held), held)],
                message: released,
            }
        );
        let pressed = touch(1, 5.0, TouchPhase::Pressed);
        assert_eq!(throttle.admit(pressed.clone(), t0), send(pressed));
        assert_eq!(throttle.held(), 0);
    }

    #[test]
    fn test_touch_points_are_throttled_per_id() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let t0 = Instant::now();
        let first = touch(1, 1.0, TouchPhase::Moved);
        let second = touch(2, 1.0, TouchPhase::Moved);
        assert_eq!(throttle.admit(first.clone(), t0), send(first));
        assert_eq!(throttle.admit(second.clone(), t0), send(second));

        throttle.admit(touch(1, 2.0, TouchPhase::Moved), t0);
        throttle.admit(touch(2, 2.0, TouchPhase::Moved), t0);
        assert_eq!(throttle.held(), 2);

        // releasing one finger only flushes that finger
        let released = throttle.admit(touch(2, 2.0, TouchPhase::Released), t0);
        assert!(matches!(
            released,
            Admission::Send { ref flushed, .. } if flushed.len() == 1
        ));
        assert_eq!(throttle.held(), 1);
        assert_eq!(throttle.discard(DataType::Touch), 1);
    }
}

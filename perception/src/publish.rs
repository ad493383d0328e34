use std::fmt::Write;

use anyhow::Result;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;

use crate::{decision::Decision, models::Position, tracker::TrackSnapshot};

/// Length of an encoded [`AcceptedObject`] message.
pub const OBJECT_MESSAGE_LEN: usize = 10;

/// A tracked object that passed the decision threshold this frame.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct AcceptedObject {
    pub snapshot: TrackSnapshot,
    pub decision: Decision,
    /// Position in the robot frame when a camera mount is configured.
    pub robot_position: Option<Position>,
}

impl AcceptedObject {
    /// The position published downstream, robot frame first.
    pub fn position(&self) -> Option<Position> {
        self.robot_position.or(self.snapshot.position())
    }
}

/// Sink for accepted objects.
#[cfg_attr(test, automock)]
pub trait Publisher: Send {
    fn publish(&mut self, object: &AcceptedObject) -> Result<()>;
}

/// Packs `object` as `u16 id | u8 shape | u8 color | i16 x | i16 y | i16 z`, little-endian.
///
/// Ids above `u16::MAX` saturate and a missing position encodes as the origin.
pub fn encode_object_message(object: &AcceptedObject) -> [u8; OBJECT_MESSAGE_LEN] {
    let data = &object.snapshot.data;
    let id = u16::try_from(object.snapshot.id).unwrap_or(u16::MAX);
    let position = object.position().unwrap_or_default();

    let mut message = [0; OBJECT_MESSAGE_LEN];
    message[0..2].copy_from_slice(&id.to_le_bytes());
    message[2] = data.shape.wire_index();
    message[3] = data.color.wire_index();
    message[4..6].copy_from_slice(&saturating_mm(position.x_mm).to_le_bytes());
    message[6..8].copy_from_slice(&saturating_mm(position.y_mm).to_le_bytes());
    message[8..10].copy_from_slice(&saturating_mm(position.z_mm).to_le_bytes());
    message
}

/// Lowercase hex of `bytes` for text transports.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    })
}

#[inline]
fn saturating_mm(value: f64) -> i16 {
    // Float to int casts saturate and map NaN to 0
    value.round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decision::DecisionReason,
        models::{Candidate, ColorKind, Extent, ShapeKind, ValidityFlags},
    };

    fn object(id: u64, position: Option<Position>, robot_position: Option<Position>) -> AcceptedObject {
        AcceptedObject {
            snapshot: TrackSnapshot {
                id,
                age: 5,
                stable_age: 4,
                lost: 0,
                data: Candidate {
                    shape: ShapeKind::Rectangle,
                    color: ColorKind::NeonYellow,
                    cx: 100.0,
                    cy: 120.0,
                    extent: Extent::Circle { radius: 30.0 },
                    quality: 1.0,
                    position,
                    flags: ValidityFlags::default(),
                },
            },
            decision: Decision {
                accepted: true,
                score: 3.0,
                label: "neon_yellow_rectangle".to_string(),
                reason: DecisionReason::Ok,
            },
            robot_position,
        }
    }

    #[test]
    fn encode_little_endian_fields() {
        let message = encode_object_message(&object(
            258,
            Some(Position::new(-1.6, 300.4, 1000.0)),
            None,
        ));

        assert_eq!(message, [2, 1, 2, 4, 0xfe, 0xff, 0x2c, 0x01, 0xe8, 0x03]);
        assert_eq!(to_hex(&message), "02010204feff2c01e803");
    }

    #[test]
    fn encode_prefers_robot_frame_and_saturates() {
        let message = encode_object_message(&object(
            70_000,
            Some(Position::new(1.0, 1.0, 1.0)),
            Some(Position::new(40_000.0, -40_000.0, f64::NAN)),
        ));

        assert_eq!(&message[0..2], &u16::MAX.to_le_bytes());
        assert_eq!(&message[4..6], &i16::MAX.to_le_bytes());
        assert_eq!(&message[6..8], &i16::MIN.to_le_bytes());
        assert_eq!(&message[8..10], &[0, 0]);
    }

    #[test]
    fn missing_position_encodes_origin() {
        let message = encode_object_message(&object(1, None, None));
        assert_eq!(&message[4..], &[0; 6]);
    }
}

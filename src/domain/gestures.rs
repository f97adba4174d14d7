//! Gesture Decoder
//!
//! Turns raw sensor notifications into typed gesture events.
//!
//! ## Payloads
//!
//! ```text
//! button   : [state]                     1 = press, anything else = release
//! rotation : [delta lo, delta hi]        i16 little-endian, negative = left
//! touch    : [code]                      0..=3 = swipe left/right/up/down
//!            [mask lo, mask hi,          legacy firmware: bit i set = touch area i / 2
//!             event lo, event hi]        (left, top, right, bottom), event 1 = down,
//!                                        2 = release, 4 = swipe
//! fly      : [direction, speed]          0 = left, 1 = right, 2 = backwards,
//!                                        3 = towards, 4 = up/down (speed is the height)
//! ```

use crate::domain::models::Characteristic;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gesture {
    ButtonPress,
    ButtonRelease,
    /// Value carries the signed rotation delta, negative values turn left
    Rotate,
    SwipeLeft,
    SwipeRight,
    SwipeUp,
    SwipeDown,
    TouchLeftDown,
    TouchLeftRelease,
    TouchRightDown,
    TouchRightRelease,
    TouchTopDown,
    TouchTopRelease,
    TouchBottomDown,
    TouchBottomRelease,
    FlyLeft,
    FlyRight,
    FlyBackwards,
    FlyTowards,
    /// Value carries the hand's height above the device
    FlyUpDown,
}

impl Gesture {
    /// Release phase belonging to a touch gesture
    pub fn touch_release(self) -> Option<Gesture> {
        match self {
            Self::TouchLeftDown | Self::TouchLeftRelease => Some(Self::TouchLeftRelease),
            Self::TouchRightDown | Self::TouchRightRelease => Some(Self::TouchRightRelease),
            Self::TouchTopDown | Self::TouchTopRelease => Some(Self::TouchTopRelease),
            Self::TouchBottomDown | Self::TouchBottomRelease => Some(Self::TouchBottomRelease),
            _ => None,
        }
    }

    /// Swipe that starts in the area of a touch gesture
    pub fn swipe(self) -> Option<Gesture> {
        match self {
            Self::TouchLeftDown | Self::TouchLeftRelease => Some(Self::SwipeLeft),
            Self::TouchRightDown | Self::TouchRightRelease => Some(Self::SwipeRight),
            Self::TouchTopDown | Self::TouchTopRelease => Some(Self::SwipeUp),
            Self::TouchBottomDown | Self::TouchBottomRelease => Some(Self::SwipeDown),
            _ => None,
        }
    }
}

/// A decoded gesture with its optional magnitude
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GestureEvent {
    pub gesture: Gesture,
    pub value: Option<i32>,
}

impl GestureEvent {
    pub fn new(gesture: Gesture, value: Option<i32>) -> Self {
        Self { gesture, value }
    }
}

/// Touch-down gestures indexed by `bit / 2` of the legacy touch mask
const LEGACY_TOUCH_DOWN_GESTURES: [Gesture; 4] = [
    Gesture::TouchLeftDown,
    Gesture::TouchTopDown,
    Gesture::TouchRightDown,
    Gesture::TouchBottomDown,
];

/// Decode a notification. Unknown characteristics and malformed payloads yield `None`.
pub fn decode(characteristic: Characteristic, payload: &[u8]) -> Option<GestureEvent> {
    let event = match characteristic {
        Characteristic::ButtonSensor => decode_button(payload),
        Characteristic::RotationSensor => decode_rotation(payload),
        Characteristic::TouchSensor => decode_touch(payload),
        Characteristic::FlySensor => decode_fly(payload),
        _ => None,
    };
    if event.is_none() {
        trace!(
            "Ignoring notification from {}: {:02X?}",
            characteristic,
            payload
        );
    }
    event
}

fn decode_button(payload: &[u8]) -> Option<GestureEvent> {
    let state = *payload.first()?;
    let gesture = if state == 1 {
        Gesture::ButtonPress
    } else {
        Gesture::ButtonRelease
    };
    Some(GestureEvent::new(gesture, Some(state as i32)))
}

fn decode_rotation(payload: &[u8]) -> Option<GestureEvent> {
    let bytes = payload.get(..2)?;
    let delta = i16::from_le_bytes([bytes[0], bytes[1]]);
    Some(GestureEvent::new(Gesture::Rotate, Some(delta as i32)))
}

fn decode_touch(payload: &[u8]) -> Option<GestureEvent> {
    match payload.len() {
        1 => {
            let gesture = match payload[0] {
                0 => Gesture::SwipeLeft,
                1 => Gesture::SwipeRight,
                2 => Gesture::SwipeUp,
                3 => Gesture::SwipeDown,
                _ => return None,
            };
            Some(GestureEvent::new(gesture, None))
        }
        n if n >= 4 => decode_legacy_touch(payload),
        _ => None,
    }
}

/// Old firmware reports a touch area bitmask plus an event code
fn decode_legacy_touch(payload: &[u8]) -> Option<GestureEvent> {
    let mask = i16::from_le_bytes([payload[0], payload[1]]);
    let event = i16::from_le_bytes([payload[2], payload[3]]);

    (0..8)
        .filter(|bit| mask & (1 << bit) != 0)
        .find_map(|bit| {
            let touch_down = LEGACY_TOUCH_DOWN_GESTURES[bit / 2];
            let gesture = match event {
                1 => Some(touch_down),
                2 => touch_down.touch_release(),
                4 => touch_down.swipe(),
                // 3 is a double touch, not reported
                _ => None,
            }?;
            Some(GestureEvent::new(gesture, Some(bit as i32)))
        })
}

fn decode_fly(payload: &[u8]) -> Option<GestureEvent> {
    if payload.len() < 2 {
        return None;
    }
    let event = match payload[0] {
        0 => GestureEvent::new(Gesture::FlyLeft, None),
        1 => GestureEvent::new(Gesture::FlyRight, None),
        2 => GestureEvent::new(Gesture::FlyBackwards, None),
        3 => GestureEvent::new(Gesture::FlyTowards, None),
        4 => GestureEvent::new(Gesture::FlyUpDown, Some(payload[1] as i32)),
        _ => return None,
    };
    Some(event)
}

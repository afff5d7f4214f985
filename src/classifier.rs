//! Event classification: decide if an input event is button-like, and
//! normalize its value to `{-1, 0, 1}` for anything that is.
//!
//! Grounded on the `is_button`/`standardize_value` pair of the source this
//! was distilled from; code constants mirror `linux/input-event-codes.h`
//! directly rather than going through `evdev`'s typed wrappers, since only
//! their numeric identity is needed here (see `crate::keys::SubKey`).

use std::f64::consts::PI;

pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;

pub const REL_HWHEEL: u16 = 0x06;
pub const REL_WHEEL: u16 = 0x08;

pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_RX: u16 = 0x03;
pub const ABS_RY: u16 = 0x04;

/// First and last multi-touch axis codes (ABS_MT_SLOT..ABS_MT_TOOL_Y);
/// these never classify as buttons.
const ABS_MT_FIRST: u16 = 0x2f;
const ABS_MT_LAST: u16 = 0x3d;

/// How a stick's axes should be interpreted downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoystickPurpose {
    Mouse,
    Wheel,
    Buttons,
    None,
}

/// Per-device classification context: the maximum magnitude reported for
/// each axis (from the kernel's absinfo) and which purpose each stick
/// currently serves.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierConfig {
    pub left_purpose: JoystickPurpose,
    pub right_purpose: JoystickPurpose,
}

/// A third of a quarter turn: the deadzone threshold fraction applied to a
/// stick configured for button emulation.
fn joystick_button_threshold(max_abs: i32) -> f64 {
    max_abs as f64 * (PI / 6.0).sin()
}

fn is_left_stick_axis(code: u16) -> bool {
    code == ABS_X || code == ABS_Y
}

fn is_right_stick_axis(code: u16) -> bool {
    code == ABS_RX || code == ABS_RY
}

fn is_multitouch_axis(code: u16) -> bool {
    (ABS_MT_FIRST..=ABS_MT_LAST).contains(&code)
}

/// Classification verdict: either "not a button, forward the raw event" or
/// "button, with its value normalized".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NotAButton,
    Button { normalized_value: i32 },
}

/// Classify `(ev_type, code, value)` per spec §4.1. `max_abs` is the
/// absinfo maximum magnitude for `code` when it is an absolute axis
/// (ignored otherwise).
pub fn classify(
    ev_type: u16,
    code: u16,
    value: i32,
    max_abs: i32,
    config: &ClassifierConfig,
) -> Classification {
    match ev_type {
        EV_KEY => Classification::Button {
            normalized_value: value,
        },
        EV_REL if code == REL_WHEEL || code == REL_HWHEEL => Classification::Button {
            normalized_value: value.signum(),
        },
        EV_ABS if is_multitouch_axis(code) => Classification::NotAButton,
        EV_ABS if is_left_stick_axis(code) || is_right_stick_axis(code) => {
            let purpose = if is_left_stick_axis(code) {
                config.left_purpose
            } else {
                config.right_purpose
            };
            if purpose != JoystickPurpose::Buttons {
                return Classification::NotAButton;
            }
            let threshold = joystick_button_threshold(max_abs);
            let normalized_value = if (value as f64).abs() > threshold {
                value.signum()
            } else {
                0
            };
            Classification::Button { normalized_value }
        }
        EV_ABS => Classification::Button {
            normalized_value: value.signum(),
        },
        _ => Classification::NotAButton,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(left: JoystickPurpose, right: JoystickPurpose) -> ClassifierConfig {
        ClassifierConfig {
            left_purpose: left,
            right_purpose: right,
        }
    }

    #[test]
    fn key_events_are_always_buttons() {
        let c = cfg(JoystickPurpose::None, JoystickPurpose::None);
        assert_eq!(
            classify(EV_KEY, 30, 1, 0, &c),
            Classification::Button { normalized_value: 1 }
        );
    }

    #[test]
    fn multitouch_axes_never_classify_as_buttons() {
        let c = cfg(JoystickPurpose::None, JoystickPurpose::None);
        assert_eq!(classify(EV_ABS, 0x35, 100, 255, &c), Classification::NotAButton);
    }

    #[test]
    fn wheel_is_a_button_with_sign_only() {
        let c = cfg(JoystickPurpose::None, JoystickPurpose::None);
        assert_eq!(
            classify(EV_REL, REL_WHEEL, -3, 0, &c),
            Classification::Button { normalized_value: -1 }
        );
    }

    #[test]
    fn joystick_buttons_respect_threshold_boundary() {
        let c = cfg(JoystickPurpose::Buttons, JoystickPurpose::None);
        let max_abs = 32767;
        let threshold = joystick_button_threshold(max_abs);

        // Exactly at threshold: not triggered.
        let at = threshold.round() as i32;
        assert_eq!(
            classify(EV_ABS, ABS_Y, at, max_abs, &c),
            Classification::Button { normalized_value: 0 }
        );

        // Strictly greater: triggered.
        let over = at + 1;
        assert_eq!(
            classify(EV_ABS, ABS_Y, over, max_abs, &c),
            Classification::Button { normalized_value: 1 }
        );
    }

    #[test]
    fn joystick_not_buttons_purpose_is_not_a_button() {
        let c = cfg(JoystickPurpose::Mouse, JoystickPurpose::None);
        assert_eq!(
            classify(EV_ABS, ABS_X, 30000, 32767, &c),
            Classification::NotAButton
        );
    }

    #[test]
    fn other_absolute_axes_reduce_to_sign() {
        let c = cfg(JoystickPurpose::None, JoystickPurpose::None);
        assert_eq!(
            classify(EV_ABS, 0x10, -1, 1, &c), // ABS_HAT0X
            Classification::Button { normalized_value: -1 }
        );
    }

    #[test]
    fn classification_is_idempotent() {
        let c = cfg(JoystickPurpose::Buttons, JoystickPurpose::None);
        let max_abs = 32767;
        let first = classify(EV_ABS, ABS_Y, 30000, max_abs, &c);
        let Classification::Button { normalized_value } = first else {
            panic!("expected a button classification");
        };
        let second = classify(EV_ABS, ABS_Y, normalized_value, max_abs, &c);
        assert_eq!(second, Classification::Button { normalized_value });
    }
}

//! Joystick-to-pointer/wheel producer and deferred emission (spec §4.4, §4.5).
//!
//! Grounded on the analog-to-relative-motion math of the source this was
//! distilled from, and on the teacher's `audio.rs` accumulator pattern
//! (running per-voice state sampled on a fixed callback) for carrying a
//! fractional pixel remainder between ticks.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, interval};

use crate::classifier::{ABS_RX, ABS_RY, ABS_X, ABS_Y, EV_KEY, EV_REL, JoystickPurpose};
use crate::mapping::EffectiveConfig;

pub const TICK_HZ: u64 = 60;
const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_HWHEEL: u16 = 0x06;
const REL_WHEEL: u16 = 0x08;
const BTN_LEFT: u16 = 0x110;

/// Which stick an axis belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Stick {
    Left,
    Right,
}

fn stick_for_axis(code: u16) -> Option<Stick> {
    match code {
        ABS_X | ABS_Y => Some(Stick::Left),
        ABS_RX | ABS_RY => Some(Stick::Right),
        _ => None,
    }
}

/// Most recently observed value of a joystick axis, written by Consumer
/// tasks and read once per tick by the Producer. Last-write-wins, no lock
/// needed: only one writer per axis, one reader, under cooperative
/// scheduling (spec §5).
#[derive(Debug, Default, Clone, Copy)]
pub struct AxisCache {
    pub x: i32,
    pub y: i32,
    pub max_abs: i32,
}

pub struct AxisState {
    left: AxisCache,
    right: AxisCache,
}

impl AxisState {
    pub fn new(left_max_abs: i32, right_max_abs: i32) -> Self {
        AxisState {
            left: AxisCache {
                max_abs: left_max_abs,
                ..Default::default()
            },
            right: AxisCache {
                max_abs: right_max_abs,
                ..Default::default()
            },
        }
    }

    pub fn notify(&mut self, code: u16, value: i32) {
        let Some(stick) = stick_for_axis(code) else {
            return;
        };
        let cache = match stick {
            Stick::Left => &mut self.left,
            Stick::Right => &mut self.right,
        };
        match code {
            ABS_X | ABS_RX => cache.x = value,
            ABS_Y | ABS_RY => cache.y = value,
            _ => {}
        }
    }
}

/// Per-stick running state for the mouse-emulation accumulator.
#[derive(Default)]
struct StickRuntime {
    accum_x: f64,
    accum_y: f64,
}

/// A pending deferred call, armed `ticks_left` producer ticks from now.
/// Re-arming the same key replaces the pending entry (spec §4.5).
struct Deferred {
    ticks_left: u32,
    event: (u16, u16, i32),
}

/// Owns deferred wheel-release bookkeeping. Exposed separately from the
/// joystick sampler so the Injector can also use it for wheel release
/// synthesis driven by the tracker (spec §4.2's "wheel special case").
#[derive(Default)]
pub struct DeferredQueue {
    pending: HashMap<(u16, u16), Deferred>,
}

impl DeferredQueue {
    pub fn schedule(&mut self, key: (u16, u16), ticks: u32, event: (u16, u16, i32)) {
        self.pending.insert(key, Deferred {
            ticks_left: ticks,
            event,
        });
    }

    /// Advance all pending entries by one tick, returning events whose
    /// countdown reached zero.
    pub fn tick(&mut self) -> Vec<(u16, u16, i32)> {
        let mut fired = Vec::new();
        self.pending.retain(|_, d| {
            if d.ticks_left == 0 {
                fired.push(d.event);
                false
            } else {
                d.ticks_left -= 1;
                true
            }
        });
        fired
    }
}

/// Run the fixed-tick joystick sampler for one Injector. Reads `state`
/// (shared, `Rc<RefCell<_>>`-style ownership is the caller's concern; this
/// function only needs `&AxisState` each tick) and emits synthetic
/// `REL_*`/`BTN_LEFT` events on `sink`. Runs until `shutdown` fires.
pub async fn run(
    config: EffectiveConfig,
    state: std::rc::Rc<std::cell::RefCell<AxisState>>,
    sink: UnboundedSender<(u16, u16, i32)>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_millis(1000 / TICK_HZ));
    let mut left_rt = StickRuntime::default();
    let mut right_rt = StickRuntime::default();
    let mut left_button_down = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => { return; }
            _ = ticker.tick() => {}
        }

        let (left, right) = {
            let s = state.borrow();
            (s.left, s.right)
        };

        if config.left_purpose == JoystickPurpose::Mouse {
            sample_mouse(&config, &left, &mut left_rt, &sink, &mut left_button_down);
        } else if config.left_purpose == JoystickPurpose::Wheel {
            sample_wheel(&config, &left, &sink);
        }
        if right.max_abs > 0
            && (config.right_purpose == JoystickPurpose::Mouse
                || config.right_purpose == JoystickPurpose::Wheel)
        {
            match config.right_purpose {
                JoystickPurpose::Mouse => {
                    sample_mouse(&config, &right, &mut right_rt, &sink, &mut left_button_down)
                }
                JoystickPurpose::Wheel => sample_wheel(&config, &right, &sink),
                _ => {}
            }
        }
    }
}

fn normalized_deflection(value: i32, max_abs: i32, non_linearity: f64) -> f64 {
    if max_abs == 0 {
        return 0.0;
    }
    let fraction = (value as f64 / max_abs as f64).clamp(-1.0, 1.0);
    fraction.signum() * fraction.abs().powf(non_linearity)
}

fn sample_mouse(
    config: &EffectiveConfig,
    axis: &AxisCache,
    rt: &mut StickRuntime,
    sink: &UnboundedSender<(u16, u16, i32)>,
    button_down: &mut bool,
) {
    let dx = normalized_deflection(axis.x, axis.max_abs, config.non_linearity) * config.pointer_speed;
    let dy = normalized_deflection(axis.y, axis.max_abs, config.non_linearity) * config.pointer_speed;

    rt.accum_x += dx;
    rt.accum_y += dy;

    let moving = axis.x != 0 || axis.y != 0;
    if moving && !*button_down {
        let _ = sink.send((EV_KEY, BTN_LEFT, 1));
        *button_down = true;
    }

    if rt.accum_x.abs() >= 1.0 {
        let whole = rt.accum_x.trunc() as i32;
        rt.accum_x -= whole as f64;
        let _ = sink.send((EV_REL, REL_X, whole));
    }
    if rt.accum_y.abs() >= 1.0 {
        let whole = rt.accum_y.trunc() as i32;
        rt.accum_y -= whole as f64;
        let _ = sink.send((EV_REL, REL_Y, whole));
    }
}

/// Emit one wheel event per producer tick for as long as the axis stays
/// deflected, with magnitude equal to the configured scroll speed (spec
/// §4.4: "magnitude = configured speed", confirmed by the original
/// source's event-producer tests sustaining a deflection for several ticks
/// and asserting every one of them carries the configured speed).
fn sample_wheel(config: &EffectiveConfig, axis: &AxisCache, sink: &UnboundedSender<(u16, u16, i32)>) {
    if axis.x != 0 {
        let magnitude = config.x_scroll_speed.round() as i32;
        let _ = sink.send((EV_REL, REL_HWHEEL, magnitude * axis.x.signum()));
    }

    if axis.y != 0 {
        let magnitude = config.y_scroll_speed.round() as i32;
        // Native scroll convention: positive stick deflection (down)
        // scrolls down, which is a negative REL_WHEEL value.
        let _ = sink.send((EV_REL, REL_WHEEL, -magnitude * axis.y.signum()));
    }
}

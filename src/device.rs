//! Grab retry and capability synthesis for the per-device virtual output
//! (spec §4.6).
//!
//! Grounded on the teacher's `input.rs::create_virtual_device` capability
//! mirroring builder chain (generalized into the synthesis rules below) and
//! on `original_source/keymapper/dev/injector.py::_prepare_device`/
//! `_modify_capabilities` for the retry budget and stripping rules.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use evdev::uinput::VirtualDevice;
use evdev::{AbsInfo, AbsoluteAxisCode, AttributeSet, Device, KeyCode, RelativeAxisCode, UinputAbsSetup};

use crate::error::CoreError;

const GRAB_ATTEMPTS: u32 = 4;
const GRAB_RETRY_DELAY: Duration = Duration::from_millis(500);

const BTN_LEFT: u16 = 0x110;
const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_HWHEEL: u16 = 0x06;
const REL_WHEEL: u16 = 0x08;

/// Try to exclusively grab `device`, retrying up to `GRAB_ATTEMPTS` times,
/// `GRAB_RETRY_DELAY` apart. Blocking: call from a dedicated worker thread,
/// never from the cooperative scheduler.
pub fn grab_with_retry(device: &mut Device, path: &str) -> Result<(), CoreError> {
    let mut last_err = None;
    for attempt in 1..=GRAB_ATTEMPTS {
        match device.grab() {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("grab attempt {attempt}/{GRAB_ATTEMPTS} on {path} failed: {e}");
                last_err = Some(e);
                if attempt < GRAB_ATTEMPTS {
                    thread::sleep(GRAB_RETRY_DELAY);
                }
            }
        }
    }
    Err(CoreError::GrabFailed {
        path: path.to_string(),
        source: last_err.expect("loop always sets last_err before exhausting attempts"),
    })
}

/// The capability set to build the virtual output device from, expressed in
/// terms of plain `evdev::AttributeSet` values so this can be computed (and
/// tested) without ever touching `/dev/uinput`.
pub struct SynthesizedCapabilities {
    pub keys: AttributeSet<KeyCode>,
    pub rel_axes: AttributeSet<RelativeAxisCode>,
    pub abs_axes: Vec<(AbsoluteAxisCode, AbsInfo)>,
}

/// Build the synthesized capability set per spec §4.6 steps 1-6. EV_SYN and
/// EV_FF are never added to begin with (the builder sets SYN automatically
/// and this crate never synthesizes force-feedback), so step 5 ("strip
/// EV_SYN and EV_FF") needs no explicit code here.
pub fn synthesize_capabilities(
    source_keys: Option<AttributeSet<KeyCode>>,
    source_rel_axes: Option<AttributeSet<RelativeAxisCode>>,
    source_abs_axes: Vec<(AbsoluteAxisCode, AbsInfo)>,
    mapped_key_targets: &HashSet<u16>,
    macro_capabilities: &HashSet<u16>,
    joystick_to_pointer_active: bool,
) -> SynthesizedCapabilities {
    let mut keys = source_keys.unwrap_or_else(AttributeSet::<KeyCode>::new);
    for &code in mapped_key_targets.iter().chain(macro_capabilities.iter()) {
        keys.insert(KeyCode::new(code));
    }

    let mut rel_axes = source_rel_axes.unwrap_or_else(AttributeSet::<RelativeAxisCode>::new);
    let mut abs_axes = source_abs_axes;

    if joystick_to_pointer_active {
        let mut fixed = AttributeSet::<RelativeAxisCode>::new();
        fixed.insert(RelativeAxisCode(REL_X));
        fixed.insert(RelativeAxisCode(REL_Y));
        fixed.insert(RelativeAxisCode(REL_WHEEL));
        fixed.insert(RelativeAxisCode(REL_HWHEEL));
        rel_axes = fixed;
        keys.insert(KeyCode::new(BTN_LEFT));

        // Step 6: strip EV_ABS if any EV_KEY capability exists and
        // joystick->pointer emulation is active for this node.
        if keys.iter().next().is_some() {
            abs_axes.clear();
        }
    }

    SynthesizedCapabilities {
        keys,
        rel_axes,
        abs_axes,
    }
}

/// Open the source device's current capabilities into the plain form
/// `synthesize_capabilities` consumes.
pub fn capture_source_capabilities(
    device: &Device,
) -> (
    Option<AttributeSet<KeyCode>>,
    Option<AttributeSet<RelativeAxisCode>>,
    Vec<(AbsoluteAxisCode, AbsInfo)>,
) {
    let keys = device.supported_keys().map(|set| {
        let mut owned = AttributeSet::<KeyCode>::new();
        for key in set.iter() {
            owned.insert(key);
        }
        owned
    });
    let rel_axes = device.supported_relative_axes().map(|set| {
        let mut owned = AttributeSet::<RelativeAxisCode>::new();
        for axis in set.iter() {
            owned.insert(axis);
        }
        owned
    });
    let abs_axes = device
        .get_absinfo()
        .map(|iter| iter.collect())
        .unwrap_or_default();
    (keys, rel_axes, abs_axes)
}

/// Build the actual uinput virtual device from synthesized capabilities.
/// Thin and untested, like the teacher's own `create_virtual_device` — the
/// logic worth testing lives in `synthesize_capabilities` above.
pub fn build_virtual_device(name: &str, caps: &SynthesizedCapabilities) -> Result<VirtualDevice> {
    // evdev's VirtualDeviceBuilder has no phys-setting hook (phys is set by
    // the kernel from the uinput node path), so only the device name
    // carries the "key-mapper <device-name>" identity from spec §6.
    let device_name = format!("key-mapper {name}");
    let mut builder = VirtualDevice::builder()
        .context("failed to open /dev/uinput")?
        .name(device_name.as_bytes());

    if caps.keys.iter().next().is_some() {
        builder = builder
            .with_keys(&caps.keys)
            .context("failed to set virtual device keys")?;
    }
    if caps.rel_axes.iter().next().is_some() {
        builder = builder
            .with_relative_axes(&caps.rel_axes)
            .context("failed to set virtual device relative axes")?;
    }
    for (axis, info) in &caps.abs_axes {
        let setup = UinputAbsSetup::new(*axis, *info);
        builder = builder
            .with_absolute_axis(&setup)
            .context("failed to set virtual device absolute axis")?;
    }

    builder.build().context("failed to create virtual device")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyset(codes: &[u16]) -> AttributeSet<KeyCode> {
        let mut set = AttributeSet::<KeyCode>::new();
        for &c in codes {
            set.insert(KeyCode::new(c));
        }
        set
    }

    #[test]
    fn adds_mapped_targets_and_macro_capabilities_to_keys() {
        let targets = HashSet::from([100]);
        let macros = HashSet::from([101, 102]);
        let caps = synthesize_capabilities(Some(keyset(&[30])), None, vec![], &targets, &macros, false);
        assert!(caps.keys.contains(KeyCode::new(30)));
        assert!(caps.keys.contains(KeyCode::new(100)));
        assert!(caps.keys.contains(KeyCode::new(101)));
        assert!(caps.keys.contains(KeyCode::new(102)));
    }

    #[test]
    fn joystick_to_pointer_replaces_rel_axes_and_adds_btn_left() {
        let caps = synthesize_capabilities(None, None, vec![], &HashSet::new(), &HashSet::new(), true);
        assert!(caps.rel_axes.contains(RelativeAxisCode(REL_X)));
        assert!(caps.rel_axes.contains(RelativeAxisCode(REL_Y)));
        assert!(caps.rel_axes.contains(RelativeAxisCode(REL_WHEEL)));
        assert!(caps.rel_axes.contains(RelativeAxisCode(REL_HWHEEL)));
        assert!(caps.keys.contains(KeyCode::new(BTN_LEFT)));
    }

    #[test]
    fn joystick_to_pointer_strips_abs_when_keys_present() {
        let abs = vec![];
        let caps = synthesize_capabilities(
            Some(keyset(&[30])),
            None,
            abs,
            &HashSet::new(),
            &HashSet::new(),
            true,
        );
        assert!(caps.abs_axes.is_empty());
    }

    #[test]
    fn non_joystick_leaves_abs_axes_untouched() {
        let caps = synthesize_capabilities(None, None, vec![], &HashSet::new(), &HashSet::new(), false);
        assert!(caps.abs_axes.is_empty());
        assert!(caps.rel_axes.iter().next().is_none());
    }
}

//! Numlock preservation guard (spec §4.6).
//!
//! Grabbing a keyboard can toggle NumLock on some kernels. There is no
//! portable ioctl for reading/restoring LED state that works across the
//! tty/X/Wayland split, so this shells out to `xset`/`numlockx` exactly as
//! `original_source/keymapper/dev/utils.py::is_numlock_on`/`set_numlock`
//! does. A missing binary or a bare tty session is treated as non-fatal:
//! the guard just skips the restore and logs at debug level.
use std::process::Command;

pub fn is_numlock_on() -> Option<bool> {
    let output = Command::new("xset").arg("q").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_xset_numlock(&text)
}

fn parse_xset_numlock(text: &str) -> Option<bool> {
    // `xset q` prints a line like:
    //   "...  2: Num Lock:   on    ..."
    let line = text.lines().find(|l| l.contains("Num Lock"))?;
    let after = line.split("Num Lock:").nth(1)?;
    let word = after.split_whitespace().next()?;
    match word {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

pub fn set_numlock(on: bool) {
    let arg = if on { "on" } else { "off" };
    match Command::new("numlockx").arg(arg).status() {
        Ok(status) if status.success() => {}
        Ok(status) => log::debug!("numlockx exited with {status}, skipping numlock restore"),
        Err(e) => log::debug!("numlockx unavailable ({e}), skipping numlock restore"),
    }
}

/// Run `body`, restoring the numlock state observed before it ran (if it
/// could be read at all) once `body` returns.
pub fn with_numlock_preserved<T>(body: impl FnOnce() -> T) -> T {
    let before = is_numlock_on();
    let result = body();
    if let Some(state) = before {
        set_numlock(state);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numlock_on() {
        let sample = "Keyboard Control:\n  auto repeat:  on    key click percent:  0\n  LED mask:  00000002\n...  2: Num Lock:   on    3: Caps Lock:   off";
        assert_eq!(parse_xset_numlock(sample), Some(true));
    }

    #[test]
    fn parses_numlock_off() {
        let sample = "2: Num Lock:   off    3: Caps Lock:   off";
        assert_eq!(parse_xset_numlock(sample), Some(false));
    }

    #[test]
    fn missing_numlock_line_is_none() {
        let sample = "Keyboard Control:\n  auto repeat: on";
        assert_eq!(parse_xset_numlock(sample), None);
    }

    #[test]
    fn with_numlock_preserved_returns_body_result() {
        let result = with_numlock_preserved(|| 42);
        assert_eq!(result, 42);
    }
}

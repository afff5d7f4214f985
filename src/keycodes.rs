//! Symbol name resolution, standing in for the out-of-scope system-wide
//! keycode name table (spec §6). Wraps `evdev`'s own code tables, which the
//! teacher crate already depends on for the same purpose in `config.rs`.

use std::str::FromStr;

use evdev::{AbsoluteAxisCode, KeyCode};

use crate::keys::DISABLE_SYMBOL;

/// Resolve a symbol name to a raw evdev `EV_KEY` code. Used by the macro
/// compiler and by mapping-file output resolution for `k()`/plain outputs.
pub fn resolve_key_symbol(name: &str) -> Option<u16> {
    KeyCode::from_str(name).ok().map(|k| k.code())
}

/// Resolve an absolute axis symbol name (e.g. `"ABS_HAT0X"`) to its code.
pub fn resolve_abs_symbol(name: &str) -> Option<u16> {
    AbsoluteAxisCode::from_str(name).ok().map(|a| a.0)
}

/// True if `name` is the reserved disable sentinel.
pub fn is_disable_symbol(name: &str) -> bool {
    name.eq_ignore_ascii_case(DISABLE_SYMBOL)
}

/// List every resolvable `EV_KEY` symbol name, for the `list-keys` CLI verb.
///
/// `evdev` doesn't publish an enumerator over all key names, so this probes
/// the stable low range of `input-event-codes.h` (covers every key and
/// button a real mapping file would reference) and keeps only codes whose
/// `Debug` form looks like a real symbol rather than a raw numeric fallback.
pub fn list_key_symbols() -> Vec<String> {
    (0u16..0x2e0)
        .map(|code| format!("{:?}", KeyCode::new(code)))
        .filter(|name| name.starts_with("KEY_") || name.starts_with("BTN_"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_key_symbol() {
        assert_eq!(resolve_key_symbol("KEY_A"), Some(KeyCode::KEY_A.code()));
    }

    #[test]
    fn unknown_key_symbol_is_none() {
        assert_eq!(resolve_key_symbol("KEY_DEFINITELY_NOT_REAL"), None);
    }

    #[test]
    fn disable_symbol_is_case_insensitive() {
        assert!(is_disable_symbol("disable"));
        assert!(is_disable_symbol("DISABLE"));
        assert!(!is_disable_symbol("KEY_A"));
    }
}

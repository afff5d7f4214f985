//! Mapping file format and compilation (spec §3, §6.1).
//!
//! Grounded on the teacher's `config.rs`: a raw `Deserialize` struct parsed
//! from TOML, then validated/clamped/defaulted into a `Resolved*`-style
//! struct (`resolve_config` there, `compile` here) consumed by the rest of
//! the crate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::classifier::JoystickPurpose;
use crate::keycodes::{is_disable_symbol, resolve_abs_symbol, resolve_key_symbol};
use crate::keys::{CompiledOutput, Key, SubKey};
use crate::macros;

/// Raw `[[mapping]]` sub-key entry as it appears in a mapping file: either
/// a bare key name (`EV_KEY`, value 1 implied) or an explicit axis
/// direction.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum RawSubKey {
    Name(String),
    Axis { code: String, value: i32 },
}

#[derive(Debug, Deserialize)]
pub struct RawMappingEntry {
    pub key: Vec<RawSubKey>,
    pub output: String,
}

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub config: HashMap<String, toml::Value>,
    #[serde(rename = "mapping", default)]
    pub mappings: Vec<RawMappingEntry>,
}

/// Validated, defaulted configuration values (spec §6 table).
#[derive(Debug, Clone, Copy)]
pub struct EffectiveConfig {
    pub keystroke_sleep_ms: u64,
    pub left_purpose: JoystickPurpose,
    pub right_purpose: JoystickPurpose,
    pub pointer_speed: f64,
    pub non_linearity: f64,
    pub x_scroll_speed: f64,
    pub y_scroll_speed: f64,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        // See DESIGN.md "Open Question decisions": these four joystick
        // defaults aren't present in the filtered original source and were
        // chosen to match the magnitudes implied by spec §8 scenario 6.
        EffectiveConfig {
            keystroke_sleep_ms: 10,
            left_purpose: JoystickPurpose::None,
            right_purpose: JoystickPurpose::None,
            pointer_speed: 80.0,
            non_linearity: 4.0,
            x_scroll_speed: 2.0,
            y_scroll_speed: 2.0,
        }
    }
}

/// A fully compiled mapping: the unified lookup table plus effective
/// configuration. Immutable for the lifetime of the Injector that owns it.
pub struct CompiledMapping {
    pub entries: HashMap<Key, CompiledOutput>,
    pub config: EffectiveConfig,
}

impl CompiledMapping {
    #[cfg(test)]
    pub fn for_test(entries: HashMap<Key, CompiledOutput>) -> Self {
        CompiledMapping {
            entries,
            config: EffectiveConfig::default(),
        }
    }
}

fn parse_purpose(raw: &toml::Value) -> Result<JoystickPurpose> {
    let s = raw
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("joystick purpose must be a string"))?;
    match s {
        "mouse" => Ok(JoystickPurpose::Mouse),
        "wheel" => Ok(JoystickPurpose::Wheel),
        "buttons" => Ok(JoystickPurpose::Buttons),
        "none" => Ok(JoystickPurpose::None),
        other => bail!("unknown joystick purpose '{other}' (expected mouse/wheel/buttons/none)"),
    }
}

fn config_f64(raw: &HashMap<String, toml::Value>, key: &str, default: f64) -> Result<f64> {
    match raw.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_float()
            .or_else(|| v.as_integer().map(|i| i as f64))
            .ok_or_else(|| anyhow::anyhow!("config key '{key}' must be numeric")),
    }
}

fn resolve_effective_config(raw: &HashMap<String, toml::Value>) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::default();

    if let Some(v) = raw.get("macros.keystroke_sleep_ms") {
        cfg.keystroke_sleep_ms = v
            .as_integer()
            .ok_or_else(|| anyhow::anyhow!("macros.keystroke_sleep_ms must be an integer"))?
            as u64;
    }
    if let Some(v) = raw.get("gamepad.joystick.left_purpose") {
        cfg.left_purpose = parse_purpose(v)?;
    }
    if let Some(v) = raw.get("gamepad.joystick.right_purpose") {
        cfg.right_purpose = parse_purpose(v)?;
    }
    cfg.pointer_speed = config_f64(raw, "gamepad.joystick.pointer_speed", cfg.pointer_speed)?;
    cfg.non_linearity = config_f64(raw, "gamepad.joystick.non_linearity", cfg.non_linearity)?;
    cfg.x_scroll_speed = config_f64(raw, "gamepad.joystick.x_scroll_speed", cfg.x_scroll_speed)?;
    cfg.y_scroll_speed = config_f64(raw, "gamepad.joystick.y_scroll_speed", cfg.y_scroll_speed)?;

    if cfg.pointer_speed <= 0.0 {
        bail!("gamepad.joystick.pointer_speed must be positive");
    }
    if cfg.non_linearity <= 0.0 {
        bail!("gamepad.joystick.non_linearity must be positive");
    }

    Ok(cfg)
}

fn resolve_sub_key(raw: &RawSubKey) -> Result<SubKey> {
    match raw {
        RawSubKey::Name(name) => {
            let code = resolve_key_symbol(name)
                .ok_or_else(|| anyhow::anyhow!("unknown symbol '{name}'"))?;
            Ok(SubKey::new(crate::classifier::EV_KEY, code, 1))
        }
        RawSubKey::Axis { code, value } => {
            let resolved = resolve_abs_symbol(code)
                .ok_or_else(|| anyhow::anyhow!("unknown axis symbol '{code}'"))?;
            Ok(SubKey::new(crate::classifier::EV_ABS, resolved, *value))
        }
    }
}

/// Load and compile a mapping file from disk.
pub fn load(path: &Path) -> Result<CompiledMapping> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read mapping file: {}", path.display()))?;
    let raw: RawConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse mapping file: {}", path.display()))?;
    compile(raw)
}

/// Validate and compile a raw mapping into its runtime form, expanding
/// combinations into every permutation with the trigger fixed last (spec
/// §3's `key_to_code`/`macros` compilation step).
pub fn compile(raw: RawConfig) -> Result<CompiledMapping> {
    let config = resolve_effective_config(&raw.config).context("invalid [config] section")?;

    if raw.mappings.is_empty() {
        bail!("mapping file defines no [[mapping]] entries");
    }

    let mut entries = HashMap::new();
    for entry in &raw.mappings {
        match compile_entry(entry, config.keystroke_sleep_ms) {
            Ok((key, output)) => {
                for permuted in key.permutations_with_fixed_trigger() {
                    entries.insert(permuted, output.clone());
                }
            }
            // Spec §7: a bad entry (unresolvable symbol, malformed key list,
            // macro parse error) drops just that mapping; the rest still
            // compile, matching the original source's own per-entry
            // `continue` in its mapping/macro resolution.
            Err(e) => log::error!("dropping mapping for output '{}': {e:#}", entry.output),
        }
    }

    Ok(CompiledMapping { entries, config })
}

fn compile_entry(entry: &RawMappingEntry, keystroke_sleep_ms: u64) -> Result<(Key, CompiledOutput)> {
    if entry.key.is_empty() {
        bail!("a mapping entry's key list must not be empty");
    }
    let sub_keys: Vec<SubKey> = entry.key.iter().map(resolve_sub_key).collect::<Result<_>>()?;

    let output = compile_output(&entry.output, keystroke_sleep_ms)
        .with_context(|| format!("in mapping for output '{}'", entry.output))?;

    let key = if sub_keys.len() == 1 {
        Key::single(sub_keys[0])
    } else {
        Key::combination(sub_keys)
    };

    Ok((key, output))
}

fn compile_output(output: &str, keystroke_sleep_ms: u64) -> Result<CompiledOutput> {
    let trimmed = output.trim();

    if is_disable_symbol(trimmed) {
        return Ok(CompiledOutput::Disable);
    }

    // A bare symbol name (no call syntax) is a plain remap; anything
    // containing '(' is treated as macro source.
    if !trimmed.contains('(') {
        let code = resolve_key_symbol(trimmed)
            .ok_or_else(|| anyhow::anyhow!("unknown symbol '{trimmed}'"))?;
        return Ok(CompiledOutput::Key(code));
    }

    let compiled = macros::compile(trimmed, keystroke_sleep_ms, &resolve_key_symbol)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(CompiledOutput::Macro(Arc::new(compiled)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_mapping(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("mapping.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn compiles_plain_remap() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(
            &dir,
            r#"
            [[mapping]]
            key = ["KEY_A"]
            output = "KEY_B"
            "#,
        );
        let compiled = load(&path).unwrap();
        let key = Key::single(SubKey::new(crate::classifier::EV_KEY, resolve_key_symbol("KEY_A").unwrap(), 1));
        assert!(matches!(compiled.entries.get(&key), Some(CompiledOutput::Key(_))));
    }

    #[test]
    fn compiles_combination_with_all_permutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(
            &dir,
            r#"
            [[mapping]]
            key = ["KEY_LEFTSHIFT", "KEY_A"]
            output = "KEY_B"
            "#,
        );
        let compiled = load(&path).unwrap();
        // Only one permutation exists for a pair (the non-trigger set has
        // length 1), and it should be present.
        let shift = SubKey::new(crate::classifier::EV_KEY, resolve_key_symbol("KEY_LEFTSHIFT").unwrap(), 1);
        let a = SubKey::new(crate::classifier::EV_KEY, resolve_key_symbol("KEY_A").unwrap(), 1);
        let key = Key::combination(vec![shift, a]);
        assert!(compiled.entries.contains_key(&key));
    }

    #[test]
    fn compiles_macro_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(
            &dir,
            r#"
            [[mapping]]
            key = ["KEY_A"]
            output = "k(KEY_B).k(KEY_C)"
            "#,
        );
        let compiled = load(&path).unwrap();
        let key = Key::single(SubKey::new(crate::classifier::EV_KEY, resolve_key_symbol("KEY_A").unwrap(), 1));
        assert!(matches!(compiled.entries.get(&key), Some(CompiledOutput::Macro(_))));
    }

    #[test]
    fn compiles_disable_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(
            &dir,
            r#"
            [[mapping]]
            key = ["KEY_A"]
            output = "DISABLE"
            "#,
        );
        let compiled = load(&path).unwrap();
        let key = Key::single(SubKey::new(crate::classifier::EV_KEY, resolve_key_symbol("KEY_A").unwrap(), 1));
        assert!(matches!(compiled.entries.get(&key), Some(CompiledOutput::Disable)));
    }

    #[test]
    fn unknown_symbol_drops_only_that_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(
            &dir,
            r#"
            [[mapping]]
            key = ["KEY_NOT_REAL"]
            output = "KEY_B"

            [[mapping]]
            key = ["KEY_A"]
            output = "KEY_C"
            "#,
        );
        let compiled = load(&path).unwrap();
        assert_eq!(compiled.entries.len(), 1);
        let key = Key::single(SubKey::new(crate::classifier::EV_KEY, resolve_key_symbol("KEY_A").unwrap(), 1));
        assert!(matches!(compiled.entries.get(&key), Some(CompiledOutput::Key(_))));
    }

    #[test]
    fn all_entries_bad_compiles_to_empty_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(
            &dir,
            r#"
            [[mapping]]
            key = ["KEY_NOT_REAL"]
            output = "KEY_B"
            "#,
        );
        let compiled = load(&path).unwrap();
        assert!(compiled.entries.is_empty());
    }

    #[test]
    fn rejects_empty_mapping_list() {
        let raw = RawConfig {
            config: HashMap::new(),
            mappings: vec![],
        };
        assert!(compile(raw).is_err());
    }

    #[test]
    fn axis_direction_sub_key_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(
            &dir,
            r#"
            [[mapping]]
            key = [{ code = "ABS_HAT0X", value = -1 }]
            output = "KEY_LEFT"
            "#,
        );
        let compiled = load(&path).unwrap();
        let sub = SubKey::new(crate::classifier::EV_ABS, resolve_abs_symbol("ABS_HAT0X").unwrap(), -1);
        assert!(compiled.entries.contains_key(&Key::single(sub)));
    }

    #[test]
    fn joystick_purpose_defaults_to_none() {
        let raw = RawConfig {
            config: HashMap::new(),
            mappings: vec![RawMappingEntry {
                key: vec![RawSubKey::Name("KEY_A".to_string())],
                output: "KEY_B".to_string(),
            }],
        };
        let compiled = compile(raw).unwrap();
        assert_eq!(compiled.config.left_purpose, JoystickPurpose::None);
        assert_eq!(compiled.config.keystroke_sleep_ms, 10);
    }
}

//! Key/combination model shared by mapping compilation and the tracker.

use std::sync::Arc;

use crate::macros::CompiledMacro;

/// One physical input in its normalized form: an evdev event type, code, and
/// a direction-normalized value (`-1`/`0`/`1` for axes, `1` for plain keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubKey {
    pub ev_type: u16,
    pub code: u16,
    pub value: i32,
}

impl SubKey {
    pub fn new(ev_type: u16, code: u16, value: i32) -> Self {
        SubKey {
            ev_type,
            code,
            value,
        }
    }

    /// Identity of the underlying hardware input, ignoring direction/value.
    /// Used to index the unreleased table, where a release (value 0) must
    /// find the entry its down-edge created.
    pub fn identity(&self) -> (u16, u16) {
        (self.ev_type, self.code)
    }
}

/// An ordered tuple of sub-keys. Length 1 is a plain key; length > 1 is a
/// combination whose last element is the trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(Vec<SubKey>);

impl Key {
    pub fn single(sub: SubKey) -> Self {
        Key(vec![sub])
    }

    pub fn combination(subs: Vec<SubKey>) -> Self {
        debug_assert!(!subs.is_empty());
        Key(subs)
    }

    pub fn sub_keys(&self) -> &[SubKey] {
        &self.0
    }

    pub fn trigger(&self) -> SubKey {
        *self.0.last().expect("Key is never empty")
    }

    pub fn is_combination(&self) -> bool {
        self.0.len() > 1
    }

    /// Every Key reachable by permuting the non-trigger sub-keys, keeping the
    /// trigger last. For a singleton, yields just itself. Used at mapping
    /// compile time so lookup is order-insensitive via a single equality
    /// check (spec §3 invariant: "every permutation... appears").
    pub fn permutations_with_fixed_trigger(&self) -> Vec<Key> {
        let n = self.0.len();
        if n <= 1 {
            return vec![self.clone()];
        }
        let trigger = self.0[n - 1];
        let head = &self.0[..n - 1];
        let mut out = Vec::new();
        permute(head, &mut Vec::new(), &mut vec![false; head.len()], &mut |perm| {
            let mut subs = perm.to_vec();
            subs.push(trigger);
            out.push(Key(subs));
        });
        out
    }
}

fn permute(
    items: &[SubKey],
    current: &mut Vec<SubKey>,
    used: &mut [bool],
    emit: &mut dyn FnMut(&[SubKey]),
) {
    if current.len() == items.len() {
        emit(current);
        return;
    }
    for i in 0..items.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        current.push(items[i]);
        permute(items, current, used, emit);
        current.pop();
        used[i] = false;
    }
}

/// The reserved sentinel meaning "consume this input, emit nothing".
/// Modeled as a first-class `CompiledOutput` variant rather than a magic
/// integer (spec's own Design Notes recommendation); the magic value only
/// exists at the wire boundary when a mapping file needs to spell it.
pub const DISABLE_SYMBOL: &str = "DISABLE";

/// What a Key compiles to. Unifies the spec's `key_to_code`/`macros` tables
/// into one map keyed by `Key`.
#[derive(Clone)]
pub enum CompiledOutput {
    /// Emit a plain target key code on press/release.
    Key(u16),
    /// Swallow the input; never emits anything downstream.
    Disable,
    /// Run a compiled macro program.
    Macro(Arc<CompiledMacro>),
}

impl std::fmt::Debug for CompiledOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompiledOutput::Key(code) => write!(f, "CompiledOutput::Key({code})"),
            CompiledOutput::Disable => write!(f, "CompiledOutput::Disable"),
            CompiledOutput::Macro(_) => write!(f, "CompiledOutput::Macro(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sk(code: u16, value: i32) -> SubKey {
        SubKey::new(1, code, value)
    }

    #[test]
    fn singleton_permutes_to_itself() {
        let key = Key::single(sk(30, 1));
        let perms = key.permutations_with_fixed_trigger();
        assert_eq!(perms, vec![key]);
    }

    #[test]
    fn pair_permutes_with_trigger_fixed_last() {
        let a = sk(42, 1);
        let b = sk(30, 1);
        let key = Key::combination(vec![a, b]);
        let perms = key.permutations_with_fixed_trigger();
        assert_eq!(perms.len(), 1);
        assert_eq!(perms[0].sub_keys(), &[a, b]);
    }

    #[test]
    fn triple_permutes_non_trigger_subkeys() {
        let a = sk(1, 1);
        let b = sk(2, 1);
        let trigger = sk(3, 1);
        let key = Key::combination(vec![a, b, trigger]);
        let perms = key.permutations_with_fixed_trigger();
        assert_eq!(perms.len(), 2);
        for perm in &perms {
            assert_eq!(perm.trigger(), trigger);
        }
        let first_elems: Vec<_> = perms.iter().map(|p| p.sub_keys()[0]).collect();
        assert!(first_elems.contains(&a));
        assert!(first_elems.contains(&b));
    }

    #[test]
    fn identity_ignores_value() {
        let a = sk(30, 1);
        let b = sk(30, 0);
        assert_eq!(a.identity(), b.identity());
    }
}

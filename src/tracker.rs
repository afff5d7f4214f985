//! Key/combination tracker: the decision algorithm of spec §4.2.
//!
//! Grounded line-by-line on `injector.py::handle_keycode` from the source
//! this was distilled from, restructured as a pure `decide()` method
//! returning a list of `Action`s instead of performing I/O directly — this
//! mirrors the teacher's own separation of `handle_event` (a pure decision)
//! from `forward_batch`/`virtual_device.emit` (the I/O), and is what makes
//! the decision algorithm unit-testable without a running uinput device.

use std::collections::HashMap;
use std::sync::Arc;

use crate::classifier::EV_ABS;
use crate::keys::{CompiledOutput, Key, SubKey};
use crate::macros::{CompiledMacro, MacroHandle};
use crate::mapping::CompiledMapping;

type Identity = (u16, u16);

#[derive(Debug, Clone)]
struct UnreleasedEntry {
    /// `(ev_type, code)` of the event that was actually emitted downstream.
    target: Identity,
    /// The physical sub-key whose down-edge created this entry.
    origin: SubKey,
    /// True if this down-edge matched `CompiledOutput::Disable`: the entry
    /// is kept (so the eventual release is absorbed too) but nothing was,
    /// or will be, emitted for it.
    disabled: bool,
}

/// What the tracker decided should happen in response to one input event.
/// The caller (the Injector's Consumer task) is responsible for performing
/// these — emitting to the virtual device, or spawning a macro's
/// interpreter task — since the tracker itself never touches I/O.
#[derive(Clone)]
pub enum Action {
    Emit(u16, u16, i32),
    StartMacro {
        origin: Identity,
        compiled: Arc<CompiledMacro>,
        handle: MacroHandle,
    },
    ReleaseMacroHold(MacroHandle),
}

pub struct Tracker {
    mapping: Arc<CompiledMapping>,
    unreleased: Vec<(Identity, UnreleasedEntry)>,
    active_macros: HashMap<Identity, MacroHandle>,
}

impl Tracker {
    pub fn new(mapping: Arc<CompiledMapping>) -> Self {
        Tracker {
            mapping,
            unreleased: Vec::new(),
            active_macros: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn unreleased_len(&self) -> usize {
        self.unreleased.len()
    }

    /// Feed one already-classified, value-normalized sub-key through the
    /// decision algorithm.
    pub fn decide(&mut self, e: SubKey) -> Vec<Action> {
        let mut actions = Vec::new();
        let id = e.identity();

        // Step 1: held-repeat filter (kernel auto-repeat; the virtual
        // device's own driver will synthesize repeats downstream).
        if e.ev_type == crate::classifier::EV_KEY && e.value == 2 {
            return actions;
        }

        if e.value == 0 {
            self.handle_release(id, &mut actions);
            return actions;
        }

        // Step 2: resolve the effective Key this down-edge triggers.
        let effective_key = self.resolve_effective_key(&e);
        let output = self.mapping.entries.get(&effective_key).cloned();

        // Step 4: duplicate-down suppression.
        if matches!(output, Some(CompiledOutput::Key(_)) | Some(CompiledOutput::Disable))
            && self.unreleased.iter().any(|(k, _)| *k == id)
        {
            return actions;
        }

        // Step 5: macro already running for this origin.
        if matches!(output, Some(CompiledOutput::Macro(_))) {
            if let Some(handle) = self.active_macros.get(&id) {
                if handle.is_running() {
                    return actions;
                }
            }
        }

        match output {
            // Step 6: start macro.
            Some(CompiledOutput::Macro(compiled)) => {
                let handle = MacroHandle::new();
                self.active_macros.insert(id, handle.clone());
                actions.push(Action::StartMacro {
                    origin: id,
                    compiled,
                    handle,
                });
            }
            // Step 7: emit mapped key (or absorb if disabled).
            Some(CompiledOutput::Key(target)) => {
                self.unreleased.push((
                    id,
                    UnreleasedEntry {
                        target: (crate::classifier::EV_KEY, target),
                        origin: e,
                        disabled: false,
                    },
                ));
                actions.push(Action::Emit(crate::classifier::EV_KEY, target, 1));
            }
            Some(CompiledOutput::Disable) => {
                self.unreleased.push((
                    id,
                    UnreleasedEntry {
                        target: id,
                        origin: e,
                        disabled: true,
                    },
                ));
            }
            // Step 8: forward unchanged.
            None => {
                self.unreleased.push((
                    id,
                    UnreleasedEntry {
                        target: id,
                        origin: e,
                        disabled: false,
                    },
                ));
                actions.push(Action::Emit(e.ev_type, e.code, e.value));
            }
        }

        actions
    }

    fn handle_release(&mut self, id: Identity, actions: &mut Vec<Action>) {
        // Step 3a: a holding macro gets told to release; it decides when to
        // actually stop (its `Hold` loop checks `holding` between iterations).
        if let Some(handle) = self.active_macros.get(&id) {
            if handle.is_holding() {
                handle.release();
                actions.push(Action::ReleaseMacroHold(handle.clone()));
            }
        }

        // Step 3b: release a previously emitted mapped/forwarded key. A
        // `Disable`d entry's target equals its own identity but must never
        // emit a release either, unlike a plain forward (which also has
        // `target == id`); distinguish the two by consulting the table.
        if let Some(pos) = self.unreleased.iter().position(|(k, _)| *k == id) {
            let (_, entry) = self.unreleased.remove(pos);
            if !entry.disabled {
                actions.push(Action::Emit(entry.target.0, entry.target.1, 0));
            }
        } else if id.0 != EV_ABS {
            log::debug!("unexpected release for identity {id:?}");
        }
    }

    /// Build the effective Key for a down-edge: the largest subset of
    /// currently-held inputs (plus `e`, kept last) that matches a compiled
    /// entry, falling back to the singleton.
    fn resolve_effective_key(&self, e: &SubKey) -> Key {
        let others: Vec<SubKey> = self
            .unreleased
            .iter()
            .map(|(_, entry)| entry.origin)
            .filter(|s| s.identity() != e.identity())
            .collect();

        for size in (1..=others.len()).rev() {
            for subset in combinations(&others, size) {
                let mut subs = subset;
                subs.push(*e);
                let key = Key::combination(subs);
                if self.mapping.entries.contains_key(&key) {
                    return key;
                }
            }
        }
        Key::single(*e)
    }
}

/// Every size-`size` subset of `items`, preserving relative order. Small
/// inputs only (the number of simultaneously held keys on real hardware is
/// never more than a handful), so no attempt is made to avoid the
/// exponential blowup of a naive bitmask/recursive enumeration.
fn combinations(items: &[SubKey], size: usize) -> Vec<Vec<SubKey>> {
    if size == 0 {
        return vec![Vec::new()];
    }
    if items.len() < size {
        return Vec::new();
    }
    let (first, rest) = items.split_first().unwrap();
    let mut with_first: Vec<Vec<SubKey>> = combinations(rest, size - 1)
        .into_iter()
        .map(|mut c| {
            c.insert(0, *first);
            c
        })
        .collect();
    with_first.extend(combinations(rest, size));
    with_first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SubKey;
    use crate::mapping::CompiledMapping;
    use std::collections::HashMap;

    const EV_KEY: u16 = crate::classifier::EV_KEY;

    fn sk(code: u16, value: i32) -> SubKey {
        SubKey::new(EV_KEY, code, value)
    }

    fn mapping_with(entries: Vec<(Key, CompiledOutput)>) -> Arc<CompiledMapping> {
        let mut map = HashMap::new();
        for (k, v) in entries {
            map.insert(k, v);
        }
        Arc::new(CompiledMapping::for_test(map))
    }

    #[test]
    fn scenario_single_remap() {
        let mapping = mapping_with(vec![(Key::single(sk(30, 1)), CompiledOutput::Key(38))]);
        let mut tracker = Tracker::new(mapping);

        let down = tracker.decide(sk(30, 1));
        assert_eq!(down.len(), 1);
        match &down[0] {
            Action::Emit(ev_type, 38, 1) => assert_eq!(*ev_type, EV_KEY),
            _ => panic!("expected Emit(EV_KEY, 38, 1)"),
        }

        let up = tracker.decide(sk(30, 0));
        assert!(matches!(up.as_slice(), [Action::Emit(_, 38, 0)]));
        assert_eq!(tracker.unreleased_len(), 0);
    }

    #[test]
    fn scenario_duplicate_down_suppressed() {
        let mapping = mapping_with(vec![(Key::single(sk(30, 1)), CompiledOutput::Key(38))]);
        let mut tracker = Tracker::new(mapping);

        assert_eq!(tracker.decide(sk(30, 1)).len(), 1);
        assert_eq!(tracker.decide(sk(30, 1)).len(), 0);
        assert_eq!(tracker.decide(sk(30, 0)).len(), 1);
    }

    #[test]
    fn scenario_combination_trigger_emits_once() {
        let a = sk(8, 1);
        let b = sk(9, 1);
        let combo = Key::combination(vec![a, b]);
        let mapping = mapping_with(vec![(combo, CompiledOutput::Key(101))]);
        let mut tracker = Tracker::new(mapping);

        // 'a' alone isn't mapped: forwarded unchanged.
        let first = tracker.decide(a);
        assert!(matches!(first.as_slice(), [Action::Emit(_, 8, 1)]));

        // 'b' with 'a' already held completes the combination.
        let second = tracker.decide(b);
        assert!(matches!(second.as_slice(), [Action::Emit(_, 101, 1)]));
    }

    #[test]
    fn scenario_dpad_axis_direction() {
        let negative = SubKey::new(crate::classifier::EV_ABS, 16, -1); // ABS_HAT0X
        let mapping = mapping_with(vec![(Key::single(negative), CompiledOutput::Key(100))]);
        let mut tracker = Tracker::new(mapping);

        let down = tracker.decide(negative);
        assert!(matches!(down.as_slice(), [Action::Emit(_, 100, 1)]));

        let release = SubKey::new(crate::classifier::EV_ABS, 16, 0);
        let up = tracker.decide(release);
        assert!(matches!(up.as_slice(), [Action::Emit(_, 100, 0)]));
    }

    #[test]
    fn unmapped_key_forwards_unchanged() {
        let mapping = mapping_with(vec![]);
        let mut tracker = Tracker::new(mapping);
        let down = tracker.decide(sk(50, 1));
        assert!(matches!(down.as_slice(), [Action::Emit(_, 50, 1)]));
    }

    #[test]
    fn disabled_key_absorbs_both_edges() {
        let mapping = mapping_with(vec![(Key::single(sk(30, 1)), CompiledOutput::Disable)]);
        let mut tracker = Tracker::new(mapping);
        assert_eq!(tracker.decide(sk(30, 1)).len(), 0);
        assert_eq!(tracker.decide(sk(30, 0)).len(), 0);
    }

    #[test]
    fn repeat_events_are_discarded() {
        let mapping = mapping_with(vec![]);
        let mut tracker = Tracker::new(mapping);
        assert_eq!(tracker.decide(sk(30, 2)).len(), 0);
    }
}

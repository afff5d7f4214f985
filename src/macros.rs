//! Macro DSL: parsing, compilation, and cooperative execution.
//!
//! Grammar (chained with `.`, case-insensitive call names, whitespace and
//! quotes ignored): `k(name)`, `w(ms)`, `r(n, body)`, `m(mod, body)`,
//! `h(body)`. Grounded on the `_Macro`/tokenizer pair of the source this was
//! distilled from; translated into a recursive-descent parser over owned
//! `Vec<Step>` trees (see `DESIGN.md` for why `ChildMacroCall` is structural
//! here rather than a reference to a sibling object).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;

use crate::classifier::EV_KEY;
use crate::error::CoreError;

/// A single step in a compiled macro's program.
#[derive(Debug, Clone)]
pub enum Step {
    ModifierDown(u16),
    ModifierUp(u16),
    KeyDown(u16),
    KeyUp(u16),
    Sleep(u64),
    Repeat(u32, Vec<Step>),
    Hold(Vec<Step>),
}

/// A compiled macro program plus the set of key codes it (transitively) emits.
#[derive(Debug)]
pub struct CompiledMacro {
    pub steps: Vec<Step>,
    pub capabilities: HashSet<u16>,
    pub source: String,
}

/// Shared state between the tracker (which flips these) and a macro's
/// running interpreter task (which reads them). `Arc<AtomicBool>` rather
/// than a mutex: both sides only ever read-or-write a single bool, never
/// need a consistent multi-field snapshot.
#[derive(Clone)]
pub struct MacroHandle {
    pub holding: Arc<AtomicBool>,
    pub running: Arc<AtomicBool>,
}

impl MacroHandle {
    pub fn new() -> Self {
        MacroHandle {
            holding: Arc::new(AtomicBool::new(true)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn release(&self) {
        self.holding.store(false, Ordering::SeqCst);
    }

    pub fn is_holding(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Compile macro source into a step tree. `resolve` maps a symbol name to
/// an evdev key code (see `crate::keycodes::resolve_symbol`); a name that
/// doesn't resolve fails compilation immediately, matching the "unknown
/// symbol detected at compile time" policy from spec §4.3.
pub fn compile(
    source: &str,
    keystroke_sleep_ms: u64,
    resolve: &dyn Fn(&str) -> Option<u16>,
) -> Result<CompiledMacro, CoreError> {
    let calls = split_top_level(source, '.').map_err(|reason| CoreError::ParseError {
        source_text: source.to_string(),
        reason,
    })?;
    if calls.is_empty() {
        return Err(CoreError::ParseError {
            source_text: source.to_string(),
            reason: "empty macro body".to_string(),
        });
    }

    let mut steps = Vec::new();
    let mut capabilities = HashSet::new();
    for call in calls {
        compile_call(&call, keystroke_sleep_ms, resolve, &mut steps, &mut capabilities)
            .map_err(|reason| CoreError::ParseError {
                source_text: source.to_string(),
                reason,
            })?;
    }

    Ok(CompiledMacro {
        steps,
        capabilities,
        source: source.to_string(),
    })
}

fn compile_call(
    call: &str,
    keystroke_sleep_ms: u64,
    resolve: &dyn Fn(&str) -> Option<u16>,
    steps: &mut Vec<Step>,
    capabilities: &mut HashSet<u16>,
) -> Result<(), String> {
    let (name, args_str) = split_call(call)?;
    let args = split_top_level(&args_str, ',')?;

    match name.to_ascii_lowercase().as_str() {
        "k" => {
            let [name] = require_args(&args, 1)?;
            let code = resolve(&clean(name)).ok_or_else(|| format!("unknown symbol '{name}'"))?;
            capabilities.insert(code);
            steps.push(Step::KeyDown(code));
            steps.push(Step::Sleep(keystroke_sleep_ms));
            steps.push(Step::KeyUp(code));
            steps.push(Step::Sleep(keystroke_sleep_ms));
        }
        "w" => {
            let [ms] = require_args(&args, 1)?;
            let ms: u64 = clean(ms)
                .parse()
                .map_err(|_| format!("invalid sleep duration '{ms}'"))?;
            steps.push(Step::Sleep(ms));
        }
        "r" => {
            let [n, body] = require_args(&args, 2)?;
            let n: u32 = clean(n)
                .parse()
                .map_err(|_| format!("invalid repeat count '{n}'"))?;
            let body_steps = compile_body(body, keystroke_sleep_ms, resolve, capabilities)?;
            steps.push(Step::Repeat(n, body_steps));
        }
        "m" => {
            let [modifier, body] = require_args(&args, 2)?;
            let code =
                resolve(&clean(modifier)).ok_or_else(|| format!("unknown symbol '{modifier}'"))?;
            capabilities.insert(code);
            let body_steps = compile_body(body, keystroke_sleep_ms, resolve, capabilities)?;
            steps.push(Step::ModifierDown(code));
            steps.push(Step::Sleep(keystroke_sleep_ms));
            steps.extend(body_steps);
            steps.push(Step::Sleep(keystroke_sleep_ms));
            steps.push(Step::ModifierUp(code));
            steps.push(Step::Sleep(keystroke_sleep_ms));
        }
        "h" => {
            let [body] = require_args(&args, 1)?;
            let body_steps = compile_body(body, keystroke_sleep_ms, resolve, capabilities)?;
            steps.push(Step::Hold(body_steps));
        }
        other => return Err(format!("unknown macro call '{other}'")),
    }

    Ok(())
}

fn compile_body(
    body: &str,
    keystroke_sleep_ms: u64,
    resolve: &dyn Fn(&str) -> Option<u16>,
    capabilities: &mut HashSet<u16>,
) -> Result<Vec<Step>, String> {
    let calls = split_top_level(body, '.')?;
    let mut steps = Vec::new();
    for call in calls {
        compile_call(&call, keystroke_sleep_ms, resolve, &mut steps, capabilities)?;
    }
    Ok(steps)
}

fn require_args<'a, const N: usize>(args: &'a [String], expected: usize) -> Result<[&'a str; N], String> {
    if args.len() != expected {
        return Err(format!(
            "expected {expected} argument(s), got {}",
            args.len()
        ));
    }
    let mut out = [""; N];
    for (slot, arg) in out.iter_mut().zip(args.iter()) {
        *slot = arg.as_str();
    }
    Ok(out)
}

fn clean(s: &str) -> String {
    s.trim().trim_matches(|c| c == '\'' || c == '"').to_string()
}

/// Split `name(args)` into `(name, args)`.
fn split_call(call: &str) -> Result<(String, String), String> {
    let call = call.trim();
    let open = call.find('(').ok_or_else(|| format!("missing '(' in '{call}'"))?;
    if !call.ends_with(')') {
        return Err(format!("missing closing ')' in '{call}'"));
    }
    let name = call[..open].trim().to_string();
    let args = call[open + 1..call.len() - 1].to_string();
    Ok((name, args))
}

/// Split `s` on `sep` at bracket depth 0, respecting `'`/`"` quoting.
fn split_top_level(s: &str, sep: char) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
                continue;
            }
            Some(_) => {
                current.push(c);
                continue;
            }
            None => {}
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced ')'".to_string());
                }
                current.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(std::mem::take(&mut current).trim().to_string());
            }
            c => current.push(c),
        }
    }
    if depth != 0 {
        return Err("unbalanced '('".to_string());
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() || !parts.is_empty() {
        parts.push(tail);
    }
    Ok(parts.into_iter().filter(|p| !p.is_empty()).collect())
}

/// Run a compiled macro to completion (or until released and its `Hold`
/// loops exit), emitting `(ev_type, code, value)` tuples on `sink`.
///
/// `sink` is an `UnboundedSender` rather than a generic trait object:
/// every task in an Injector (Consumer, Producer, and every running macro)
/// funnels output through the same channel into the per-device write task,
/// which is what actually serializes emission to the virtual device
/// (concurrency model, spec §5).
pub async fn run(macro_: Arc<CompiledMacro>, handle: MacroHandle, sink: UnboundedSender<(u16, u16, i32)>) {
    handle.running.store(true, Ordering::SeqCst);
    run_steps(&macro_.steps, &handle, &sink).await;
    handle.running.store(false, Ordering::SeqCst);
}

fn run_steps<'a>(
    steps: &'a [Step],
    handle: &'a MacroHandle,
    sink: &'a UnboundedSender<(u16, u16, i32)>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>> {
    Box::pin(async move {
        for step in steps {
            run_step(step, handle, sink).await;
        }
    })
}

fn run_step<'a>(
    step: &'a Step,
    handle: &'a MacroHandle,
    sink: &'a UnboundedSender<(u16, u16, i32)>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>> {
    Box::pin(async move {
        match step {
            Step::ModifierDown(code) | Step::KeyDown(code) => {
                let _ = sink.send((EV_KEY, *code, 1));
            }
            Step::ModifierUp(code) | Step::KeyUp(code) => {
                let _ = sink.send((EV_KEY, *code, 0));
            }
            Step::Sleep(ms) => {
                sleep(Duration::from_millis(*ms)).await;
            }
            Step::Repeat(n, body) => {
                for _ in 0..*n {
                    run_steps(body, handle, sink).await;
                }
            }
            Step::Hold(body) => {
                while handle.is_holding() {
                    run_steps(body, handle, sink).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(name: &str) -> Option<u16> {
        match name {
            "KEY_Q" => Some(16),
            "KEY_W" => Some(17),
            "KEY_LEFTSHIFT" => Some(42),
            _ => None,
        }
    }

    #[test]
    fn compiles_single_keystroke() {
        let m = compile("k(KEY_Q)", 10, &resolver).unwrap();
        assert_eq!(m.capabilities, HashSet::from([16]));
        assert!(matches!(m.steps[0], Step::KeyDown(16)));
        assert!(matches!(m.steps[2], Step::KeyUp(16)));
    }

    #[test]
    fn compiles_chained_keystrokes() {
        let m = compile("k(KEY_Q).k(KEY_W)", 10, &resolver).unwrap();
        assert_eq!(m.capabilities, HashSet::from([16, 17]));
    }

    #[test]
    fn compiles_repeat_with_nested_body() {
        let m = compile("r(3, k(KEY_Q).w(5))", 10, &resolver).unwrap();
        match &m.steps[0] {
            Step::Repeat(3, body) => {
                assert!(matches!(body[0], Step::KeyDown(16)));
            }
            other => panic!("expected Repeat, got {other:?}"),
        }
    }

    #[test]
    fn compiles_modifier_wrapped_body() {
        let m = compile("m(KEY_LEFTSHIFT, k(KEY_Q))", 10, &resolver).unwrap();
        assert!(matches!(m.steps[0], Step::ModifierDown(42)));
        assert!(m.capabilities.contains(&42));
        assert!(m.capabilities.contains(&16));
        assert!(matches!(m.steps.last().unwrap(), Step::ModifierUp(42)));
    }

    #[test]
    fn unknown_symbol_is_a_parse_error() {
        let err = compile("k(KEY_NOPE)", 10, &resolver).unwrap_err();
        assert!(matches!(err, CoreError::ParseError { .. }));
    }

    #[test]
    fn unbalanced_parens_is_a_parse_error() {
        let err = compile("k(KEY_Q", 10, &resolver).unwrap_err();
        assert!(matches!(err, CoreError::ParseError { .. }));
    }

    #[test]
    fn capabilities_are_union_of_children() {
        let m = compile("r(2, m(KEY_LEFTSHIFT, k(KEY_Q).k(KEY_W)))", 10, &resolver).unwrap();
        assert_eq!(m.capabilities, HashSet::from([16, 17, 42]));
    }
}

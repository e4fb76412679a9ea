//! Embedded scripting sandbox.
//!
//! Scripts decide whether a `LUA` trigger fires and compute the payload of a
//! `LUA` send. The host side talks to a script through registers only:
//!
//! - `INPUT` is set to the triggering content before the script runs and is
//!   also exposed as a global of the same name.
//! - `OUTPUT` must be set by the script, either as a global or through
//!   `setRegValue(1, "OUTPUT", value)`. A run without `OUTPUT` fails.
//! - `TARGET` optionally overrides the transition target.
//! - `ERROR` optionally carries a diagnostic message.
//!
//! Two host functions are exposed to scripts:
//!
//! - `getRegValue(bank, key)` - fails the script when the key is absent
//! - `setRegValue(bank, key, value)`
//!
//! Bank `1` addresses the machine memory. Every other bank is a scratch bank
//! that only lives for the duration of one evaluation.

use crate::memory::{self, Memory};
use mlua::{Lua, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Register bank backed by the machine memory.
pub const MEMORY_BANK: &str = "1";

/// Errors from script evaluation.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),

    #[error("script did not set OUTPUT: {}", .message.as_deref().unwrap_or("no diagnostic"))]
    MissingOutput { message: Option<String> },

    #[error("register bank lost during evaluation")]
    RegistersLost,
}

/// A script evaluator bound to one machine.
///
/// Implementations are moved into the task that owns the machine and are
/// never shared between threads.
pub trait Evaluator: Send {
    /// Runs `script` against `registers` and returns the registers as the
    /// script left them.
    fn eval(&mut self, script: &str, registers: Memory) -> Result<Memory, ScriptError>;
}

/// Expected `OUTPUT` value of a successful script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sentinel {
    /// `OUTPUT` must equal this value.
    Value(String),
    /// Any `OUTPUT` counts as success.
    Any,
}

impl Default for Sentinel {
    fn default() -> Self {
        Sentinel::Value("OK".to_string())
    }
}

impl Sentinel {
    pub fn accepts(&self, output: &str) -> bool {
        match self {
            Sentinel::Value(expected) => expected == output,
            Sentinel::Any => true,
        }
    }
}

/// Result of a script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    /// Value of the `OUTPUT` register.
    pub output: String,
    /// Next-state override requested by the script.
    pub target: Option<String>,
    /// Whether `output` satisfied the sentinel.
    pub ok: bool,
}

/// Runs a script with `input` and reads its result registers.
///
/// Memory is only updated when the evaluator returns successfully. `OUTPUT`,
/// `TARGET` and `ERROR` are consumed from memory, `INPUT` is left in place.
pub fn run_script(
    evaluator: &mut dyn Evaluator,
    memory: &mut Memory,
    script: &str,
    input: &str,
    sentinel: &Sentinel,
) -> Result<ScriptOutcome, ScriptError> {
    let mut registers = memory.clone();
    registers.set(memory::INPUT, input);
    registers.remove(memory::OUTPUT);
    registers.remove(memory::TARGET);
    registers.remove(memory::ERROR);

    let mut registers = evaluator.eval(script, registers)?;

    let target = registers.remove(memory::TARGET);
    let message = registers.remove(memory::ERROR);
    let output = registers.remove(memory::OUTPUT);
    *memory = registers;

    let output = output.ok_or(ScriptError::MissingOutput { message })?;
    let ok = sentinel.accepts(&output);
    Ok(ScriptOutcome { output, target, ok })
}

/// Registers visible to a running script.
struct RegisterBanks {
    memory: Memory,
    scratch: HashMap<String, Memory>,
}

impl RegisterBanks {
    fn get(&self, bank: &str, key: &str) -> Option<&str> {
        if bank == MEMORY_BANK {
            self.memory.get(key)
        } else {
            self.scratch.get(bank).and_then(|b| b.get(key))
        }
    }

    fn set(&mut self, bank: &str, key: String, value: String) {
        if bank == MEMORY_BANK {
            self.memory.set(key, value);
        } else {
            self.scratch
                .entry(bank.to_string())
                .or_default()
                .set(key, value);
        }
    }
}

/// Lua 5.4 evaluator.
///
/// The interpreter state persists between evaluations, so globals a script
/// defines stay visible to later scripts of the same machine.
pub struct LuaEvaluator {
    lua: Lua,
}

impl LuaEvaluator {
    /// Creates an interpreter with the register host functions installed.
    pub fn new() -> Result<Self, ScriptError> {
        let lua = Lua::new();

        let get_reg = lua.create_function(|lua, (bank, key): (String, String)| {
            let banks = lua.app_data_ref::<RegisterBanks>().ok_or_else(|| {
                mlua::Error::RuntimeError("registers are not bound".to_string())
            })?;
            banks
                .get(&bank, &key)
                .map(str::to_string)
                .ok_or_else(|| {
                    mlua::Error::RuntimeError(format!(
                        "register '{}' not set in bank {}",
                        key, bank
                    ))
                })
        })?;

        let set_reg =
            lua.create_function(|lua, (bank, key, value): (String, String, String)| {
                let mut banks = lua.app_data_mut::<RegisterBanks>().ok_or_else(|| {
                    mlua::Error::RuntimeError("registers are not bound".to_string())
                })?;
                banks.set(&bank, key, value);
                Ok(())
            })?;

        {
            let globals = lua.globals();
            globals.set("getRegValue", get_reg)?;
            globals.set("setRegValue", set_reg)?;
        }

        Ok(Self { lua })
    }
}

impl Evaluator for LuaEvaluator {
    fn eval(&mut self, script: &str, registers: Memory) -> Result<Memory, ScriptError> {
        let input = registers.get_or_empty(memory::INPUT).to_string();
        self.lua.set_app_data(RegisterBanks {
            memory: registers,
            scratch: HashMap::new(),
        });

        let globals = self.lua.globals();
        let prepared = globals
            .set(memory::INPUT, input)
            .and_then(|_| globals.set(memory::OUTPUT, Value::Nil))
            .and_then(|_| globals.set(memory::TARGET, Value::Nil))
            .and_then(|_| globals.set(memory::ERROR, Value::Nil));

        let run = prepared.and_then(|_| self.lua.load(script).exec());

        let banks = self
            .lua
            .remove_app_data::<RegisterBanks>()
            .ok_or(ScriptError::RegistersLost)?;
        let mut registers = banks.memory;

        if let Err(e) = run {
            tracing::debug!("script failed: {}", e);
            return Err(e.into());
        }

        for key in [memory::OUTPUT, memory::TARGET, memory::ERROR] {
            if let Some(value) = globals.get::<_, Option<String>>(key)? {
                registers.set(key, value);
            }
        }

        Ok(registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua() -> LuaEvaluator {
        LuaEvaluator::new().unwrap()
    }

    const PREDICATE: &str = r#"if INPUT == "TEST" then OUTPUT = "OK" else OUTPUT = "NO" end"#;

    #[test]
    fn test_predicate_script() {
        let mut eval = lua();
        let mut mem = Memory::new();

        let hit = run_script(&mut eval, &mut mem, PREDICATE, "TEST", &Sentinel::default()).unwrap();
        assert!(hit.ok);
        assert_eq!(hit.output, "OK");

        let miss = run_script(&mut eval, &mut mem, PREDICATE, "test", &Sentinel::default()).unwrap();
        assert!(!miss.ok);
        assert_eq!(miss.output, "NO");
    }

    #[test]
    fn test_output_script() {
        let mut eval = lua();
        let mut mem = Memory::new();

        let out = run_script(
            &mut eval,
            &mut mem,
            r#"OUTPUT = INPUT .. "-" .. INPUT"#,
            "TEST",
            &Sentinel::Any,
        )
        .unwrap();
        assert!(out.ok);
        assert_eq!(out.output, "TEST-TEST");
    }

    #[test]
    fn test_missing_output_fails() {
        let mut eval = lua();
        let mut mem = Memory::new();

        let result = run_script(
            &mut eval,
            &mut mem,
            r#"ERROR = "nothing to say""#,
            "x",
            &Sentinel::Any,
        );
        match result {
            Err(ScriptError::MissingOutput { message }) => {
                assert_eq!(message.as_deref(), Some("nothing to say"));
            }
            other => panic!("expected MissingOutput, got {:?}", other),
        }
    }

    #[test]
    fn test_runtime_error_keeps_memory() {
        let mut eval = lua();
        let mut mem: Memory = [("LINE", "kept")].into_iter().collect();

        let result = run_script(&mut eval, &mut mem, "error('boom')", "x", &Sentinel::Any);
        assert!(matches!(result, Err(ScriptError::Lua(_))));
        assert_eq!(mem.get("LINE"), Some("kept"));
    }

    #[test]
    fn test_register_functions() {
        let mut eval = lua();
        let mut mem: Memory = [("NAME", "alice")].into_iter().collect();

        let script = r#"
            local name = getRegValue(1, "NAME")
            setRegValue(1, "GREETED", name)
            setRegValue(1, "OUTPUT", "hello " .. name)
        "#;
        let out = run_script(&mut eval, &mut mem, script, "", &Sentinel::Any).unwrap();
        assert_eq!(out.output, "hello alice");
        assert_eq!(mem.get("GREETED"), Some("alice"));
        assert!(!mem.contains("OUTPUT"));
    }

    #[test]
    fn test_missing_register_fails_script() {
        let mut eval = lua();
        let mut mem = Memory::new();

        let result = run_script(
            &mut eval,
            &mut mem,
            r#"OUTPUT = getRegValue(1, "ABSENT")"#,
            "",
            &Sentinel::Any,
        );
        assert!(matches!(result, Err(ScriptError::Lua(_))));
    }

    #[test]
    fn test_scratch_bank_is_isolated() {
        let mut eval = lua();
        let mut mem = Memory::new();

        let script = r#"
            setRegValue(2, "TMP", "scratch")
            OUTPUT = getRegValue(2, "TMP")
        "#;
        let out = run_script(&mut eval, &mut mem, script, "", &Sentinel::Any).unwrap();
        assert_eq!(out.output, "scratch");
        assert!(!mem.contains("TMP"));

        // scratch registers do not survive the evaluation
        let result = run_script(
            &mut eval,
            &mut mem,
            r#"OUTPUT = getRegValue(2, "TMP")"#,
            "",
            &Sentinel::Any,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_target_is_typed() {
        let mut eval = lua();
        let mut mem = Memory::new();

        let out = run_script(
            &mut eval,
            &mut mem,
            r#"OUTPUT = "OK"; TARGET = "YES""#,
            "",
            &Sentinel::default(),
        )
        .unwrap();
        assert_eq!(out.target.as_deref(), Some("YES"));
        assert!(!mem.contains("TARGET"));
    }

    #[test]
    fn test_stale_globals_are_cleared() {
        let mut eval = lua();
        let mut mem = Memory::new();

        run_script(&mut eval, &mut mem, r#"OUTPUT = "OK""#, "", &Sentinel::Any).unwrap();
        let result = run_script(&mut eval, &mut mem, "local x = 1", "", &Sentinel::Any);
        assert!(matches!(result, Err(ScriptError::MissingOutput { .. })));
    }

    #[test]
    fn test_sentinel() {
        assert!(Sentinel::default().accepts("OK"));
        assert!(!Sentinel::default().accepts("ok"));
        assert!(Sentinel::Any.accepts("anything"));
        assert!(Sentinel::Value("YES".into()).accepts("YES"));
    }
}

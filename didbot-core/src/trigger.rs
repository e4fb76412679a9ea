//! Trigger rule predicates.
//!
//! A trigger fires when the rule of its event holds for the content of the
//! inbound notification. Some rules have a side effect on memory when they
//! fire (`INPUT_SAVE`), and a `LUA` trigger may carry a dynamic target.

use crate::definition::{Event, Rule};
use crate::memory::Memory;
use crate::notification::ProofValue;
use crate::script::{run_script, Evaluator, Sentinel};

/// A trigger that fired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fired {
    /// Next-state override computed by a script.
    pub target: Option<String>,
}

/// Evaluates the rule of a trigger event against `content`.
///
/// Returns `None` when the trigger does not fire. Script failures count as a
/// miss and are logged.
pub fn evaluate(
    event: &Event,
    content: &str,
    memory: &mut Memory,
    evaluator: Option<&mut dyn Evaluator>,
) -> Option<Fired> {
    match event.rule {
        Rule::Input
        | Rule::Data
        | Rule::Transient
        | Rule::OurStatus
        | Rule::AcceptAndInputValues
        | Rule::NotAcceptValues => Some(Fired::default()),

        Rule::InputSave => {
            memory.set(event.data.as_str(), content);
            Some(Fired::default())
        }

        Rule::InputEqual => (content == event.data).then(Fired::default),

        Rule::ValidateEqual => {
            (memory.get_or_empty(&event.data) == content).then(Fired::default)
        }

        Rule::ValidateNotEqual => {
            (memory.get_or_empty(&event.data) != content).then(Fired::default)
        }

        Rule::Lua => {
            let Some(evaluator) = evaluator else {
                tracing::warn!("LUA trigger without an evaluator, treating as no match");
                return None;
            };
            match run_script(evaluator, memory, &event.data, content, &Sentinel::default()) {
                Ok(outcome) if outcome.ok => Some(Fired {
                    target: outcome.target,
                }),
                Ok(outcome) => {
                    tracing::debug!(output = %outcome.output, "LUA trigger did not fire");
                    None
                }
                Err(e) => {
                    tracing::warn!("LUA trigger failed: {}", e);
                    None
                }
            }
        }

        // Send-only rules are rejected when the definition loads.
        Rule::Format | Rule::FormatMem | Rule::GenPin => None,
    }
}

/// Stores proof attribute values in memory, one register per attribute.
pub fn store_values(memory: &mut Memory, values: &[ProofValue]) {
    for value in values {
        memory.set(value.name.as_str(), value.value.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ProtocolType;
    use crate::script::LuaEvaluator;
    use proptest::prelude::*;

    fn event(rule: Rule, data: &str) -> Event {
        Event {
            protocol: ProtocolType::BasicMessage,
            rule,
            type_id: None,
            data: data.to_string(),
            event_data: None,
            want_status: true,
        }
    }

    #[test]
    fn test_always_rules() {
        let mut mem = Memory::new();
        for rule in [Rule::Input, Rule::Data, Rule::Transient, Rule::OurStatus] {
            assert!(evaluate(&event(rule, "x"), "anything", &mut mem, None).is_some());
        }
        assert!(mem.is_empty());
    }

    #[test]
    fn test_input_save() {
        let mut mem = Memory::new();
        let fired = evaluate(&event(Rule::InputSave, "LINE"), "hi", &mut mem, None);
        assert!(fired.is_some());
        assert_eq!(mem.get("LINE"), Some("hi"));
    }

    #[test]
    fn test_validate_absent_register_is_empty() {
        let mut mem = Memory::new();
        assert!(evaluate(&event(Rule::ValidateEqual, "PIN"), "", &mut mem, None).is_some());
        assert!(evaluate(&event(Rule::ValidateNotEqual, "PIN"), "1234", &mut mem, None).is_some());
    }

    #[test]
    fn test_lua_trigger() {
        let mut lua = LuaEvaluator::new().unwrap();
        let mut mem = Memory::new();
        let e = event(
            Rule::Lua,
            r#"if INPUT == "TEST" then OUTPUT = "OK" else OUTPUT = "NO" end"#,
        );

        assert!(evaluate(&e, "TEST", &mut mem, Some(&mut lua)).is_some());
        assert!(evaluate(&e, "NOPE", &mut mem, Some(&mut lua)).is_none());
    }

    #[test]
    fn test_lua_trigger_target() {
        let mut lua = LuaEvaluator::new().unwrap();
        let mut mem = Memory::new();
        let e = event(Rule::Lua, r#"OUTPUT = "OK"; TARGET = "YES""#);

        let fired = evaluate(&e, "", &mut mem, Some(&mut lua)).unwrap();
        assert_eq!(fired.target.as_deref(), Some("YES"));
    }

    #[test]
    fn test_lua_failure_is_a_miss() {
        let mut lua = LuaEvaluator::new().unwrap();
        let mut mem = Memory::new();

        let broken = event(Rule::Lua, "this is not lua");
        assert!(evaluate(&broken, "x", &mut mem, Some(&mut lua)).is_none());

        let no_evaluator = event(Rule::Lua, r#"OUTPUT = "OK""#);
        assert!(evaluate(&no_evaluator, "x", &mut mem, None).is_none());
    }

    #[test]
    fn test_store_values() {
        let mut mem = Memory::new();
        store_values(
            &mut mem,
            &[ProofValue {
                name: "email".into(),
                value: "a@b.c".into(),
                cred_def_id: None,
            }],
        );
        assert_eq!(mem.get("email"), Some("a@b.c"));
    }

    proptest! {
        #[test]
        fn prop_input_equal_is_exact(data in ".{0,12}", content in ".{0,12}") {
            let mut mem = Memory::new();
            let fired = evaluate(&event(Rule::InputEqual, &data), &content, &mut mem, None);
            prop_assert_eq!(fired.is_some(), content == data);
        }

        #[test]
        fn prop_input_equal_is_case_sensitive(data in "[a-z]{1,8}") {
            let mut mem = Memory::new();
            let upper = data.to_uppercase();
            let fired = evaluate(&event(Rule::InputEqual, &data), &upper, &mut mem, None);
            prop_assert!(fired.is_none());
        }

        #[test]
        fn prop_validate_complement(saved in ".{0,8}", later in ".{0,8}") {
            let mut mem = Memory::new();
            evaluate(&event(Rule::InputSave, "K"), &saved, &mut mem, None);

            let eq = evaluate(&event(Rule::ValidateEqual, "K"), &later, &mut mem, None);
            let ne = evaluate(&event(Rule::ValidateNotEqual, "K"), &later, &mut mem, None);

            prop_assert_eq!(eq.is_some(), later == saved);
            prop_assert_eq!(ne.is_some(), !eq.is_some());
        }
    }
}

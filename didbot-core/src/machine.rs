//! Machine instances.
//!
//! A [`Machine`] is one running copy of a [`MachineDefinition`]: it owns the
//! current state pointer, the memory registers and an optional script
//! evaluator. Definitions are shared read-only between machines, so creating
//! a machine per conversation is cheap.
//!
//! Resolving a transition and committing it are separate steps: callers ask
//! one of the `triggers*` entry points for a transition, dispatch the sends
//! it builds, and only then call [`Machine::step`].

use crate::definition::{Event, MachineDefinition, ProtocolType, Rule, State, Transition};
use crate::error::CoreError;
use crate::memory::Memory;
use crate::notification::{BackendData, HookData, ProtocolStatus, Question};
use crate::script::Evaluator;
use crate::send::{self, SendEvent};
use crate::trigger;
use std::sync::Arc;
use tokio::sync::oneshot;

/// One running instance of a machine definition.
pub struct Machine {
    definition: Arc<MachineDefinition>,
    /// Index of the current state in declaration order.
    current: usize,
    memory: Memory,
    evaluator: Option<Box<dyn Evaluator>>,
    /// Memory as it was before the pending transition was resolved.
    checkpoint: Option<Memory>,
    terminate: Option<oneshot::Sender<bool>>,
    terminated: bool,
}

impl Machine {
    /// Creates a machine positioned at the initial state with empty memory.
    pub fn new(definition: Arc<MachineDefinition>) -> Self {
        let current = definition.initial_index();
        Self {
            definition,
            current,
            memory: Memory::new(),
            evaluator: None,
            checkpoint: None,
            terminate: None,
            terminated: false,
        }
    }

    /// Attaches a script evaluator.
    pub fn with_evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Attaches the channel signalled when a terminal state is reached.
    pub fn with_terminate(mut self, tx: oneshot::Sender<bool>) -> Self {
        self.terminate = Some(tx);
        self
    }

    pub fn definition(&self) -> &Arc<MachineDefinition> {
        &self.definition
    }

    pub fn current_state(&self) -> &State {
        &self.definition.states()[self.current]
    }

    /// Name of the current state.
    pub fn current(&self) -> &str {
        &self.current_state().name
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Returns true once a terminal state has been reached.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Builds the sends of the initial transition.
    pub fn start(&mut self) -> Result<Vec<SendEvent>, CoreError> {
        let definition = Arc::clone(&self.definition);
        tracing::debug!(
            machine = %definition.name,
            state = %definition.initial_state(),
            "Starting machine"
        );
        let evaluator = self
            .evaluator
            .as_mut()
            .map(|e| e.as_mut() as &mut dyn Evaluator);
        send::build_all(&definition.initial.sends, "", &mut self.memory, evaluator)
    }

    /// Resolves a protocol status notification.
    ///
    /// `OUR_STATUS` triggers only match completed protocols we started;
    /// every other rule only matches protocols the other party started.
    pub fn triggers(&mut self, status: &ProtocolStatus) -> Option<Transition> {
        let content = status.content();
        let ours = status.initiated_by_us;
        self.resolve(status.protocol, &content, |event| {
            (event.rule == Rule::OurStatus) == ours
        })
    }

    /// Resolves user hook data.
    pub fn triggers_by_hook(&mut self, hook: &HookData) -> Option<Transition> {
        let content = hook.content();
        self.resolve(ProtocolType::Hook, &content, |_| true)
    }

    /// Resolves a backend message. A trigger `type_id` filters on the subject.
    pub fn triggers_by_backend_data(&mut self, data: &BackendData) -> Option<Transition> {
        self.resolve(ProtocolType::Backend, &data.content, |event| {
            event
                .type_id
                .as_deref()
                .map_or(true, |subject| subject == data.subject)
        })
    }

    /// Resolves a question. `ACCEPT_AND_INPUT_VALUES` stores the question's
    /// values in memory.
    pub fn answers(&mut self, question: &Question) -> Option<Transition> {
        let content = question.content();
        let transition = self.resolve(ProtocolType::Answer, &content, |_| true)?;
        if transition.trigger.rule == Rule::AcceptAndInputValues {
            trigger::store_values(&mut self.memory, question.values());
        }
        Some(transition)
    }

    /// Resolves a transient pseudo-notification sent by this machine.
    pub fn triggers_transient(&mut self, content: &str) -> Option<Transition> {
        self.resolve(ProtocolType::Transient, content, |_| true)
    }

    /// Builds the sends of a transition for the triggering `input`.
    pub fn build_sends(
        &mut self,
        transition: &Transition,
        input: &str,
    ) -> Result<Vec<SendEvent>, CoreError> {
        let evaluator = self
            .evaluator
            .as_mut()
            .map(|e| e.as_mut() as &mut dyn Evaluator);
        send::build_all(&transition.sends, input, &mut self.memory, evaluator)
    }

    /// Undoes the memory writes of a resolved transition that will not be
    /// committed, e.g. because one of its sends failed.
    pub fn rollback(&mut self) {
        if let Some(memory) = self.checkpoint.take() {
            tracing::debug!(state = %self.current(), "Rolling back memory");
            self.memory = memory;
        }
    }

    /// Commits a transition.
    ///
    /// Entering the initial state clears memory unless the definition keeps
    /// it. Entering a terminal state signals the terminate channel once.
    pub fn step(&mut self, transition: &Transition) -> Result<(), CoreError> {
        let next = self
            .definition
            .state_index(&transition.target)
            .ok_or_else(|| CoreError::UnknownTarget {
                state: self.current().to_string(),
                target: transition.target.clone(),
            })?;

        tracing::debug!(from = %self.current(), to = %transition.target, "Step");
        self.current = next;
        self.checkpoint = None;

        if next == self.definition.initial_index() && !self.definition.keep_memory {
            self.memory.clear();
        }

        if self.current_state().terminal && !self.terminated {
            self.terminated = true;
            match self.terminate.take() {
                Some(tx) => {
                    if tx.send(true).is_err() {
                        tracing::debug!("terminate receiver already dropped");
                    }
                }
                None => tracing::warn!(
                    machine = %self.definition.name,
                    "reached terminal state without a terminate channel"
                ),
            }
        }

        Ok(())
    }

    /// Returns the first transition of the current state that fires.
    fn resolve<F>(&mut self, protocol: ProtocolType, content: &str, accept: F) -> Option<Transition>
    where
        F: Fn(&Event) -> bool,
    {
        let definition = Arc::clone(&self.definition);
        let state = &definition.states()[self.current];
        self.checkpoint = Some(self.memory.clone());

        for transition in &state.transitions {
            let event = &transition.trigger;
            if event.protocol != protocol || !accept(event) {
                continue;
            }
            let evaluator = self
                .evaluator
                .as_mut()
                .map(|e| e.as_mut() as &mut dyn Evaluator);
            let fired = trigger::evaluate(event, content, &mut self.memory, evaluator);
            if let Some(fired) = fired {
                let resolved = self.retarget(transition, fired.target);
                return Some(resolved);
            }
        }

        tracing::debug!(state = %state.name, protocol = %protocol, "no transition");
        None
    }

    /// Applies a dynamic target if it names an existing state.
    fn retarget(&self, transition: &Transition, target: Option<String>) -> Transition {
        match target {
            Some(target) if target == transition.target => transition.clone(),
            Some(target) if self.definition.has_state(&target) => transition.with_target(target),
            Some(target) => {
                tracing::warn!(
                    target = %target,
                    fallback = %transition.target,
                    "dynamic target names no state, keeping static target"
                );
                transition.clone()
            }
            None => transition.clone(),
        }
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("definition", &self.definition.name)
            .field("current", &self.current())
            .field("memory", &self.memory)
            .field("evaluator", &self.evaluator.is_some())
            .field("terminated", &self.terminated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{ProofValue, StatusState};
    use crate::script::LuaEvaluator;
    use crate::send::SendPayload;

    fn load(yaml: &str) -> Arc<MachineDefinition> {
        Arc::new(MachineDefinition::from_yaml(yaml).unwrap())
    }

    const ECHO: &str = r#"
name: echo
initial:
  target: IDLE
  sends: [{ protocol: basic_message, data: "Hello!" }]
states:
  IDLE:
    transitions:
      - trigger: { protocol: basic_message, rule: INPUT_EQUAL, data: bye }
        sends: [{ protocol: basic_message, data: "Bye!" }]
        target: DONE
      - trigger: { protocol: basic_message, rule: INPUT_SAVE, data: LINE }
        sends: [{ protocol: basic_message, rule: FORMAT_MEM, data: "echo {{.LINE}}" }]
        target: IDLE
  DONE:
    terminate: true
"#;

    fn msg(content: &str) -> ProtocolStatus {
        ProtocolStatus::basic_message("c1", content)
    }

    #[test]
    fn test_new_machine_is_at_initial_state() {
        let machine = Machine::new(load(ECHO));
        assert_eq!(machine.current(), "IDLE");
        assert!(machine.memory().is_empty());
        assert!(!machine.is_terminated());
    }

    #[test]
    fn test_start_builds_initial_sends() {
        let mut machine = Machine::new(load(ECHO));
        let sends = machine.start().unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].content, "Hello!");
    }

    #[test]
    fn test_echo_flow() {
        let mut machine = Machine::new(load(ECHO));

        let t = machine.triggers(&msg("hi")).unwrap();
        assert_eq!(t.target, "IDLE");
        let sends = machine.build_sends(&t, "hi").unwrap();
        assert_eq!(sends[0].content, "echo hi");
        machine.step(&t).unwrap();

        // re-entering the initial state clears memory
        assert!(machine.memory().is_empty());
    }

    #[test]
    fn test_earlier_transition_wins() {
        let mut machine = Machine::new(load(ECHO));
        let t = machine.triggers(&msg("bye")).unwrap();
        assert_eq!(t.target, "DONE");
        assert!(machine.memory().is_empty());
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let mut machine = Machine::new(load(ECHO));
        let mut echo = msg("hi");
        echo.initiated_by_us = true;
        assert!(machine.triggers(&echo).is_none());
    }

    #[test]
    fn test_terminal_signals_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut machine = Machine::new(load(ECHO)).with_terminate(tx);

        let t = machine.triggers(&msg("bye")).unwrap();
        machine.step(&t).unwrap();
        assert!(machine.is_terminated());
        assert_eq!(rx.try_recv(), Ok(true));

        // stepping again does not signal again
        machine.step(&t).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_terminal_without_channel() {
        let mut machine = Machine::new(load(ECHO));
        let t = machine.triggers(&msg("bye")).unwrap();
        machine.step(&t).unwrap();
        assert_eq!(machine.current(), "DONE");
        assert!(machine.is_terminated());
    }

    #[test]
    fn test_keep_memory() {
        let yaml = ECHO.replace("name: echo", "name: echo\nkeep_memory: true");
        let mut machine = Machine::new(load(&yaml));

        let t = machine.triggers(&msg("hi")).unwrap();
        machine.step(&t).unwrap();
        assert_eq!(machine.memory().get("LINE"), Some("hi"));
    }

    #[test]
    fn test_rollback_undoes_trigger_writes() {
        let yaml = ECHO.replace("name: echo", "name: echo\nkeep_memory: true");
        let mut machine = Machine::new(load(&yaml));

        let t = machine.triggers(&msg("first")).unwrap();
        machine.step(&t).unwrap();

        let t = machine.triggers(&msg("secret")).unwrap();
        machine.build_sends(&t, "secret").unwrap();
        assert_eq!(machine.memory().get("LINE"), Some("secret"));

        machine.rollback();
        assert_eq!(machine.current(), "IDLE");
        assert_eq!(machine.memory().get("LINE"), Some("first"));

        // nothing left to undo
        machine.rollback();
        assert_eq!(machine.memory().get("LINE"), Some("first"));
    }

    const PIN: &str = r#"
initial: { target: IDLE }
states:
  IDLE:
    transitions:
      - trigger: { protocol: basic_message, rule: INPUT_SAVE, data: CODE }
        target: CHECK
  CHECK:
    transitions:
      - trigger: { protocol: basic_message, rule: VALIDATE_EQUAL, data: CODE }
        sends: [{ protocol: basic_message, data: match }]
        target: IDLE
      - trigger: { protocol: basic_message, rule: VALIDATE_NOT_EQUAL, data: CODE }
        sends: [{ protocol: basic_message, data: mismatch }]
        target: CHECK
"#;

    #[test]
    fn test_save_then_validate() {
        let mut machine = Machine::new(load(PIN));

        let t = machine.triggers(&msg("1234")).unwrap();
        machine.step(&t).unwrap();
        assert_eq!(machine.current(), "CHECK");

        let miss = machine.triggers(&msg("9999")).unwrap();
        assert_eq!(machine.build_sends(&miss, "9999").unwrap()[0].content, "mismatch");
        machine.step(&miss).unwrap();

        let hit = machine.triggers(&msg("1234")).unwrap();
        assert_eq!(machine.build_sends(&hit, "1234").unwrap()[0].content, "match");
        machine.step(&hit).unwrap();

        assert_eq!(machine.current(), "IDLE");
        assert!(machine.memory().is_empty());
    }

    const LUA: &str = r#"
initial: { target: IDLE }
states:
  IDLE:
    transitions:
      - trigger:
          protocol: basic_message
          rule: LUA
          data: 'if INPUT == "TEST" then OUTPUT = "OK" else OUTPUT = "NO" end'
        sends:
          - protocol: basic_message
            rule: LUA
            data: 'OUTPUT = INPUT .. "-" .. INPUT'
        target: IDLE
"#;

    #[test]
    fn test_lua_round_trip() {
        let def = load(LUA);
        assert!(def.needs_evaluator());
        let mut machine = Machine::new(def).with_evaluator(Box::new(LuaEvaluator::new().unwrap()));

        assert!(machine.triggers(&msg("nope")).is_none());

        let t = machine.triggers(&msg("TEST")).unwrap();
        let sends = machine.build_sends(&t, "TEST").unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].content, "TEST-TEST");
    }

    const DYNAMIC: &str = r#"
initial: { target: IDLE }
states:
  IDLE:
    transitions:
      - trigger:
          protocol: basic_message
          rule: LUA
          data: 'OUTPUT = "OK"; if INPUT == "go" then TARGET = "YES" elseif INPUT == "lost" then TARGET = "NOWHERE" end'
        target: TERMINATE
  YES: {}
  TERMINATE:
    terminate: true
"#;

    #[test]
    fn test_dynamic_target() {
        let def = load(DYNAMIC);
        let mut machine =
            Machine::new(Arc::clone(&def)).with_evaluator(Box::new(LuaEvaluator::new().unwrap()));

        let t = machine.triggers(&msg("go")).unwrap();
        assert_eq!(t.target, "YES");
        machine.step(&t).unwrap();
        assert_eq!(machine.current(), "YES");

        // the definition keeps its static target
        assert_eq!(def.state("IDLE").unwrap().transitions[0].target, "TERMINATE");
        assert!(!machine.memory().contains("TARGET"));
    }

    #[test]
    fn test_unknown_dynamic_target_falls_back() {
        let mut machine =
            Machine::new(load(DYNAMIC)).with_evaluator(Box::new(LuaEvaluator::new().unwrap()));
        let t = machine.triggers(&msg("lost")).unwrap();
        assert_eq!(t.target, "TERMINATE");
    }

    const BACKEND: &str = r#"
name: backend
type: backend
initial: { target: IDLE }
states:
  IDLE:
    transitions:
      - trigger: { protocol: backend, rule: INPUT, type_id: other }
        sends: [{ protocol: backend, data: wrong }]
        target: IDLE
      - trigger: { protocol: backend, rule: INPUT }
        sends: [{ protocol: backend, rule: FORMAT, data: "she says: %s" }]
        target: IDLE
"#;

    #[test]
    fn test_backend_format() {
        let mut machine = Machine::new(load(BACKEND));
        let data = BackendData {
            conn_id: "c1".into(),
            protocol: String::new(),
            subject: "chat".into(),
            content: "TEST".into(),
        };

        let t = machine.triggers_by_backend_data(&data).unwrap();
        let sends = machine.build_sends(&t, &data.content).unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].content, "she says: TEST");
        assert_eq!(sends[0].protocol, ProtocolType::Backend);
    }

    const ISSUER: &str = r#"
initial:
  target: IDLE
  sends: [{ protocol: present_proof, event_data: { proof: { attributes: '[{"name":"email"}]' } } }]
states:
  IDLE:
    transitions:
      - trigger: { protocol: answer, rule: ACCEPT_AND_INPUT_VALUES }
        target: ISSUE
  ISSUE:
    transitions:
      - trigger: { protocol: present_proof, rule: OUR_STATUS }
        sends:
          - protocol: issue_credential
            event_data:
              issuing: { cred_def_id: cd-1, attrs: '[{"name":"email","value":"{{.email}}"}]' }
        target: DONE
  DONE:
    terminate: true
"#;

    #[test]
    fn test_answer_stores_values_and_our_status() {
        let mut machine = Machine::new(load(ISSUER));
        let question = Question::proof_verify(
            "c1",
            vec![ProofValue {
                name: "email".into(),
                value: "a@b.c".into(),
                cred_def_id: None,
            }],
        );

        let t = machine.answers(&question).unwrap();
        machine.step(&t).unwrap();
        assert_eq!(machine.memory().get("email"), Some("a@b.c"));

        // a proof the other party started does not match OUR_STATUS
        let mut theirs = ProtocolStatus::completed("c1", "p1", ProtocolType::PresentProof);
        theirs.initiated_by_us = false;
        assert!(machine.triggers(&theirs).is_none());

        let ours = ProtocolStatus::completed("c1", "p1", ProtocolType::PresentProof);
        assert_eq!(ours.state, StatusState::Ok);
        let t = machine.triggers(&ours).unwrap();
        let sends = machine.build_sends(&t, "").unwrap();
        assert_eq!(
            sends[0].payload,
            SendPayload::Issuing {
                cred_def_id: "cd-1".into(),
                attrs: r#"[{"name":"email","value":"a@b.c"}]"#.into(),
            }
        );
    }

    #[test]
    fn test_hook_and_transient_entry_points() {
        let yaml = r#"
initial: { target: IDLE }
states:
  IDLE:
    transitions:
      - trigger: { protocol: hook, rule: INPUT_SAVE, data: HOOK }
        sends: [{ protocol: transient, data: next }]
        target: WAIT
  WAIT:
    transitions:
      - trigger: { protocol: transient, rule: TRANSIENT }
        target: IDLE
"#;
        let mut machine = Machine::new(load(yaml));
        let hook = HookData {
            conn_id: "c1".into(),
            data: [("k".to_string(), "v".to_string())].into(),
        };

        let t = machine.triggers_by_hook(&hook).unwrap();
        let sends = machine.build_sends(&t, &hook.content()).unwrap();
        assert_eq!(sends[0].protocol, ProtocolType::Transient);
        assert_eq!(machine.memory().get("HOOK"), Some(r#"{"k":"v"}"#));
        machine.step(&t).unwrap();

        assert!(machine.triggers(&msg("next")).is_none());
        let t = machine.triggers_transient("next").unwrap();
        machine.step(&t).unwrap();
        assert_eq!(machine.current(), "IDLE");
    }
}

// src/scripting/dispatcher.rs
//! Main-thread dispatcher: the single consumer of the action queue and the
//! bridge from cvar mutations to script handlers.
//!
//! Once per frame: pending cvar changes become `CvarChange` actions, then
//! the queue drains. Script results go to the console sink, cvar changes
//! call the named handler through a leased interpreter state, custom
//! actions defer to the caller-provided handler.
//!
//! A cvar-change handler may mutate engine state; plain script execution
//! cannot.

use std::sync::Arc;

use crate::cvar::CvarRegistry;
use crate::diagnostics::Diagnostics;

use super::action_queue::{Action, ActionKind, ActionQueue};
use super::state_pool::StatePool;

type CustomHandler = Box<dyn FnMut(&[u8]) + Send>;

pub struct MainDispatcher {
    actions: Arc<ActionQueue>,
    states: StatePool,
    cvars: Arc<CvarRegistry>,
    diagnostics: Arc<Diagnostics>,
    custom: Option<CustomHandler>,
}

impl MainDispatcher {
    pub fn new(
        actions: Arc<ActionQueue>,
        states: StatePool,
        cvars: Arc<CvarRegistry>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            actions,
            states,
            cvars,
            diagnostics,
            custom: None,
        }
    }

    /// Install the handler for [`ActionKind::Custom`] payloads.
    pub fn set_custom_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.custom = Some(Box::new(handler));
    }

    /// One frame's dispatch. Returns the number of actions drained.
    pub fn tick(&mut self) -> usize {
        self.enqueue_cvar_changes();
        self.drain()
    }

    /// Turn pending cvar mutations into `CvarChange` actions. Only changes
    /// whose cvar names a script handler produce an action.
    fn enqueue_cvar_changes(&self) {
        for change in self.cvars.take_pending() {
            let Some(handler) = self.cvars.script_handler(&change.name) else {
                continue;
            };
            let mut payload =
                Vec::with_capacity(handler.len() + change.name.len() + change.old.len() + change.new.len() + 3);
            payload.extend_from_slice(handler.as_bytes());
            payload.push(0);
            payload.extend_from_slice(change.name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(change.old.as_bytes());
            payload.push(0);
            payload.extend_from_slice(change.new.as_bytes());

            if self
                .actions
                .push(Action::new(ActionKind::CvarChange, payload))
                .is_err()
            {
                // producer-side free: the rejected action drops here
                self.diagnostics.report_dropped_action();
                log::warn!("action queue full; cvar change '{}' dropped", change.name);
            }
        }
    }

    fn drain(&mut self) -> usize {
        let mut drained = 0;
        while let Some(action) = self.actions.try_pop() {
            drained += 1;
            match action.kind {
                ActionKind::ScriptResult => {
                    let text = String::from_utf8_lossy(&action.payload);
                    if !text.is_empty() {
                        log::info!("[script] {}", text);
                    }
                }
                ActionKind::CvarChange => self.apply_cvar_change(&action.payload),
                ActionKind::Custom => {
                    if let Some(handler) = &mut self.custom {
                        handler(&action.payload);
                    } else {
                        log::debug!("custom action dropped: no handler installed");
                    }
                }
            }
            // the consumer frees the payload: `action` drops here
        }
        drained
    }

    /// Payload layout: `handler\0name\0old\0new`.
    fn apply_cvar_change(&self, payload: &[u8]) {
        let mut parts = payload.split(|&b| b == 0);
        let (Some(handler), Some(name), Some(old), Some(new)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            self.diagnostics
                .report_recoverable("malformed cvar-change payload");
            return;
        };
        let handler = String::from_utf8_lossy(handler);
        let name = String::from_utf8_lossy(name);
        let old = String::from_utf8_lossy(old);
        let new = String::from_utf8_lossy(new);

        match self.states.acquire() {
            Ok(mut lease) => {
                if let Err(e) = lease.state().call_handler(&handler, &name, &old, &new) {
                    log::warn!("cvar handler '{}' failed: {}", handler, e);
                }
            }
            Err(e) => log::warn!("cvar handler '{}' skipped: {}", handler, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::{ScriptOutcome, ScriptState};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordedCalls {
        handlers: Vec<(String, String, String, String)>,
    }

    struct RecordingState {
        calls: Arc<Mutex<RecordedCalls>>,
    }

    impl ScriptState for RecordingState {
        fn execute(&mut self, _source: &[u8]) -> ScriptOutcome {
            ScriptOutcome::ok("")
        }

        fn call_handler(&mut self, h: &str, n: &str, o: &str, v: &str) -> crate::Result<()> {
            self.calls
                .lock()
                .handlers
                .push((h.into(), n.into(), o.into(), v.into()));
            Ok(())
        }
    }

    fn fixture() -> (MainDispatcher, Arc<ActionQueue>, Arc<CvarRegistry>, Arc<Mutex<RecordedCalls>>) {
        let calls = Arc::new(Mutex::new(RecordedCalls::default()));
        let c = calls.clone();
        let states = StatePool::new(
            2,
            move || {
                Box::new(RecordingState { calls: c.clone() }) as Box<dyn ScriptState>
            },
            |_| {},
        );
        let actions = ActionQueue::new(16);
        let cvars = Arc::new(CvarRegistry::new());
        let dispatcher = MainDispatcher::new(
            actions.clone(),
            states,
            cvars.clone(),
            Arc::new(Diagnostics::new()),
        );
        (dispatcher, actions, cvars, calls)
    }

    #[test]
    fn cvar_change_reaches_script_handler() {
        let (mut dispatcher, actions, cvars, calls) = fixture();
        cvars.register("fov", "60", Some("OnFovChanged"));
        cvars.set("fov", "90");

        // the payload crosses the queue in the documented layout
        dispatcher.enqueue_cvar_changes();
        let queued = actions.try_pop().unwrap();
        assert_eq!(queued.kind, ActionKind::CvarChange);
        assert_eq!(queued.payload, b"OnFovChanged\0fov\060\090");
        // hand it back for the drain
        actions.push(queued).unwrap();

        let drained = dispatcher.tick();
        assert_eq!(drained, 1);
        let calls = calls.lock();
        assert_eq!(
            calls.handlers,
            vec![(
                "OnFovChanged".to_string(),
                "fov".to_string(),
                "60".to_string(),
                "90".to_string()
            )]
        );
    }

    #[test]
    fn change_without_handler_produces_no_action() {
        let (mut dispatcher, actions, cvars, _) = fixture();
        cvars.register("vsync", "0", None);
        cvars.set("vsync", "1");
        dispatcher.tick();
        assert_eq!(actions.stats().pushed, 0);
    }

    #[test]
    fn custom_actions_defer_to_installed_handler() {
        let (mut dispatcher, actions, _, _) = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        dispatcher.set_custom_handler(move |payload| {
            s.lock().push(payload.to_vec());
        });

        actions
            .push(Action::new(ActionKind::Custom, b"ping".to_vec()))
            .unwrap();
        dispatcher.tick();
        assert_eq!(*seen.lock(), vec![b"ping".to_vec()]);
    }

    #[test]
    fn script_results_drain_to_the_log_sink() {
        let (mut dispatcher, actions, _, _) = fixture();
        actions.push(Action::script_result("4")).unwrap();
        assert_eq!(dispatcher.tick(), 1);
        assert_eq!(actions.stats().pending, 0);
    }
}

// src/cvar.rs
//! Console-variable registry.
//!
//! Cvars hold string values and may name a script handler that the
//! main-thread dispatcher invokes after a change. Mutations are recorded as
//! pending changes and picked up once per frame; the registry itself never
//! calls into scripting.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

#[derive(Debug, Clone)]
struct Cvar {
    value: String,
    script_handler: Option<String>,
}

/// A recorded mutation, consumed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvarChange {
    pub name: String,
    pub old: String,
    pub new: String,
}

#[derive(Default)]
pub struct CvarRegistry {
    vars: RwLock<HashMap<String, Cvar>>,
    pending: Mutex<Vec<CvarChange>>,
}

impl CvarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cvar with its default value and optional script handler.
    /// Idempotent: re-registering keeps the current value.
    pub fn register(&self, name: &str, default: &str, script_handler: Option<&str>) {
        let mut vars = self.vars.write();
        vars.entry(name.to_owned()).or_insert_with(|| Cvar {
            value: default.to_owned(),
            script_handler: script_handler.map(str::to_owned),
        });
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.vars.read().get(name).map(|v| v.value.clone())
    }

    pub fn script_handler(&self, name: &str) -> Option<String> {
        self.vars.read().get(name)?.script_handler.clone()
    }

    /// Set a cvar. A real change (different value on a known cvar) is
    /// recorded for the next dispatcher tick. Returns false for unknown
    /// names.
    pub fn set(&self, name: &str, value: &str) -> bool {
        let mut vars = self.vars.write();
        let Some(var) = vars.get_mut(name) else {
            return false;
        };
        if var.value == value {
            return true;
        }
        let old = std::mem::replace(&mut var.value, value.to_owned());
        drop(vars);
        self.pending.lock().push(CvarChange {
            name: name.to_owned(),
            old,
            new: value.to_owned(),
        });
        true
    }

    /// Take the changes recorded since the last tick, in mutation order.
    pub fn take_pending(&self) -> Vec<CvarChange> {
        std::mem::take(&mut *self.pending.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_records_one_pending_change() {
        let cvars = CvarRegistry::new();
        cvars.register("fov", "60", Some("OnFovChanged"));

        assert!(cvars.set("fov", "90"));
        assert_eq!(cvars.get("fov").as_deref(), Some("90"));

        let pending = cvars.take_pending();
        assert_eq!(
            pending,
            vec![CvarChange {
                name: "fov".into(),
                old: "60".into(),
                new: "90".into(),
            }]
        );
        assert!(cvars.take_pending().is_empty());
    }

    #[test]
    fn same_value_set_is_not_a_change() {
        let cvars = CvarRegistry::new();
        cvars.register("vsync", "1", None);
        assert!(cvars.set("vsync", "1"));
        assert!(cvars.take_pending().is_empty());
    }

    #[test]
    fn unknown_cvar_set_fails() {
        let cvars = CvarRegistry::new();
        assert!(!cvars.set("nope", "1"));
    }

    #[test]
    fn register_is_idempotent() {
        let cvars = CvarRegistry::new();
        cvars.register("fov", "60", Some("OnFovChanged"));
        cvars.set("fov", "75");
        cvars.register("fov", "60", Some("OnFovChanged"));
        assert_eq!(cvars.get("fov").as_deref(), Some("75"));
        assert_eq!(cvars.script_handler("fov").as_deref(), Some("OnFovChanged"));
    }
}

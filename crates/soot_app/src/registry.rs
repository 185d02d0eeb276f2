//! Registry associating import paths with app factories.
//!
//! The statically-typed stand-in for loading `module:Class` by name: the
//! embedding binary registers every app it ships, and both the arbiter (for
//! placement limits) and the workers (for hosting) consult the same
//! registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::spec::SpecError;
use crate::{App, AppFactory};

struct Entry {
    factory: AppFactory,
    /// Registered worker limit, the class-level `workers` declaration.
    /// Overridden by a `:N` spec suffix.
    workers: Option<u32>,
}

/// App factories known to this binary, keyed by import path.
#[derive(Default)]
pub struct AppRegistry {
    entries: HashMap<String, Entry>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an app hosted by every worker.
    pub fn register<A, F>(&mut self, import_path: &str, factory: F) -> Result<(), SpecError>
    where
        A: App + 'static,
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.insert(
            import_path,
            Arc::new(move || Arc::new(factory()) as Arc<dyn App>),
            None,
        )
    }

    /// Register an app hosted by at most `workers` workers.
    pub fn register_limited<A, F>(
        &mut self,
        import_path: &str,
        workers: u32,
        factory: F,
    ) -> Result<(), SpecError>
    where
        A: App + 'static,
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.insert(
            import_path,
            Arc::new(move || Arc::new(factory()) as Arc<dyn App>),
            Some(workers),
        )
    }

    fn insert(
        &mut self,
        import_path: &str,
        factory: AppFactory,
        workers: Option<u32>,
    ) -> Result<(), SpecError> {
        if self.entries.contains_key(import_path) {
            return Err(SpecError::DuplicateRegistration {
                path: import_path.to_string(),
            });
        }
        self.entries
            .insert(import_path.to_string(), Entry { factory, workers });
        Ok(())
    }

    pub fn contains(&self, import_path: &str) -> bool {
        self.entries.contains_key(import_path)
    }

    /// The registered worker limit for an app, `None` for unlimited.
    pub fn registered_workers(&self, import_path: &str) -> Result<Option<u32>, SpecError> {
        self.entries
            .get(import_path)
            .map(|entry| entry.workers)
            .ok_or_else(|| SpecError::NotRegistered {
                path: import_path.to_string(),
            })
    }

    /// Build a fresh instance of an app. The caller runs `init`.
    pub fn instantiate(&self, import_path: &str) -> Result<Arc<dyn App>, SpecError> {
        let entry = self
            .entries
            .get(import_path)
            .ok_or_else(|| SpecError::NotRegistered {
                path: import_path.to_string(),
            })?;
        Ok((entry.factory)())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Args, Kwargs, Outcome};
    use soot_protocol::Value;

    struct Echo;

    impl App for Echo {
        fn dispatch(&self, action: &str, _args: &Args, _kwargs: &Kwargs) -> anyhow::Result<Outcome> {
            Ok(Outcome::Value(Value::Str(action.to_string())))
        }
    }

    #[test]
    fn register_and_instantiate() {
        let mut registry = AppRegistry::new();
        registry.register("echo:Echo", || Echo).unwrap();

        assert!(registry.contains("echo:Echo"));
        assert_eq!(registry.registered_workers("echo:Echo").unwrap(), None);

        let app = registry.instantiate("echo:Echo").unwrap();
        let result = app.dispatch("ping", &[], &Kwargs::new()).unwrap();
        match result {
            Outcome::Value(Value::Str(s)) => assert_eq!(s, "ping"),
            _ => panic!("expected a value outcome"),
        }
    }

    #[test]
    fn limited_registration() {
        let mut registry = AppRegistry::new();
        registry
            .register_limited("echo:Echo", 2, || Echo)
            .unwrap();
        assert_eq!(registry.registered_workers("echo:Echo").unwrap(), Some(2));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = AppRegistry::new();
        registry.register("echo:Echo", || Echo).unwrap();
        assert!(matches!(
            registry.register("echo:Echo", || Echo),
            Err(SpecError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn unknown_path_rejected() {
        let registry = AppRegistry::new();
        assert!(matches!(
            registry.instantiate("missing:App"),
            Err(SpecError::NotRegistered { .. })
        ));
        assert!(matches!(
            registry.registered_workers("missing:App"),
            Err(SpecError::NotRegistered { .. })
        ));
    }
}

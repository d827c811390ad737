//! Helper-library injection for script endpoints.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::error::{GraphOrmError, Result};
use crate::transport::scripts::{ScriptCall, LIBRARY_MISSING_MARKER, LIBRARY_SOURCE};

/// Raw script execution.
pub trait ScriptEndpoint {
    /// Executes `script` with `params` and returns its value.
    fn execute(&self, script: &str, params: &JsonValue) -> Result<JsonValue>;
}

/// Runs helper-library calls, loading the library on demand.
///
/// A call that fails because the library is unknown is retried exactly once
/// with the library source prepended.
#[derive(Debug, Default)]
pub struct LibraryLoader {
    loads: AtomicU64,
}

impl LibraryLoader {
    /// Fresh loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the library source has been sent.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Executes a helper call through `endpoint`.
    pub fn run<E: ScriptEndpoint + ?Sized>(&self, endpoint: &E, call: &ScriptCall) -> Result<JsonValue> {
        let (script, params) = call.to_script();
        match endpoint.execute(&script, &params) {
            Err(err) if err.to_string().contains(LIBRARY_MISSING_MARKER) => {
                self.loads.fetch_add(1, Ordering::Relaxed);
                info!(function = call.function(), "graphorm.library.loading");
                let with_library = format!("{LIBRARY_SOURCE}\n{script}");
                endpoint.execute(&with_library, &params).map_err(|retry| {
                    warn!(function = call.function(), error = %retry, "graphorm.library.retry_failed");
                    if retry.to_string().contains(LIBRARY_MISSING_MARKER) {
                        GraphOrmError::LibraryNotLoaded(retry.to_string())
                    } else {
                        retry
                    }
                })
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use crate::transport::TypeSpec;

    fn missing() -> String {
        format!("groovy.lang.MissingPropertyException: {LIBRARY_MISSING_MARKER} for class: Script1")
    }

    /// Fails with the missing-library error until the library is sent, then
    /// answers with `after_load`.
    struct Scripted {
        seen: Mutex<Vec<String>>,
        after_load: Option<String>,
    }

    impl Scripted {
        fn new(after_load: Option<String>) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                after_load,
            }
        }
    }

    impl ScriptEndpoint for Scripted {
        fn execute(&self, script: &str, _params: &JsonValue) -> Result<JsonValue> {
            self.seen.lock().push(script.to_owned());
            if !script.contains("class GraphOrm") {
                return Err(GraphOrmError::transport(missing()));
            }
            match &self.after_load {
                None => Ok(JsonValue::from(1)),
                Some(msg) => Err(GraphOrmError::transport(msg.clone())),
            }
        }
    }

    fn call() -> ScriptCall {
        ScriptCall::GetTypeNode {
            types: vec![TypeSpec {
                app_label: "tests".into(),
                model_name: "Dog".into(),
            }],
        }
    }

    #[test]
    fn retries_once_with_library_prepended() {
        let endpoint = Scripted::new(None);
        let loader = LibraryLoader::new();
        assert_eq!(loader.run(&endpoint, &call()).unwrap(), JsonValue::from(1));
        let seen = endpoint.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].starts_with(LIBRARY_SOURCE));
        assert_eq!(loader.loads(), 1);
    }

    #[test]
    fn second_failure_is_library_not_loaded() {
        let endpoint = Scripted::new(Some(missing()));
        let err = LibraryLoader::new().run(&endpoint, &call()).unwrap_err();
        assert_eq!(err.code(), "LibraryNotLoaded");
        assert_eq!(endpoint.seen.lock().len(), 2);
    }

    #[test]
    fn unrelated_retry_failure_keeps_its_own_error() {
        let endpoint = Scripted::new(Some("java.lang.IllegalStateException: node 7 not found".into()));
        let err = LibraryLoader::new().run(&endpoint, &call()).unwrap_err();
        assert_eq!(err.code(), "Transport");
        assert!(err.to_string().contains("node 7 not found"));
        assert!(!err.to_string().contains("library not loaded"));
        assert_eq!(endpoint.seen.lock().len(), 2);
    }
}

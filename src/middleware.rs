use std::sync::Arc;

use serde_json::Value;

/// The two hook points spec.md §5 names. Deliberately a closed set, not a
/// type-level "middleware onion" like `ethers-providers`' `Middleware`
/// trait — that trait exists to compose Ethereum-method-specific behavior
/// (gas estimation, nonce management) at arbitrary depth, which has no
/// analogue here: this crate has exactly two named extension points on a
/// single request lifecycle, so a flat registry is the honest shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Runs just before a request is handed to the transport.
    SendWillBeCalled,
    /// Runs after a request has been handed to the transport.
    SendIsCalled,
}

type Callback = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// A named-hook registry, grounded on `original_source/deriv_api/middlewares.py`.
///
/// Each hook holds at most one callback (the original's `Middleware` class
/// exposes exactly one slot per named hook; spec.md does not ask for
/// chaining multiple callbacks per hook).
#[derive(Clone, Default)]
pub struct Middleware {
    send_will_be_called: Option<Callback>,
    send_is_called: Option<Callback>,
}

impl Middleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_will_be_called(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.send_will_be_called = Some(Arc::new(f));
        self
    }

    pub fn with_send_is_called(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.send_is_called = Some(Arc::new(f));
        self
    }

    /// Runs the `sendWillBeCalled` hook over `request`, if registered.
    /// Returns `Value::Null` ("falsy", per spec.md §4.7) when no hook is
    /// registered, so callers can tell "no middleware" apart from a hook
    /// that deliberately returns nothing.
    pub fn run_send_will_be_called(&self, request: &Value) -> Value {
        match &self.send_will_be_called {
            Some(f) => f(request),
            None => Value::Null,
        }
    }

    /// Runs the `sendIsCalled` hook over `{request, response}`, if
    /// registered. Same falsy-means-passthrough convention as
    /// [`Self::run_send_will_be_called`].
    pub fn run_send_is_called(&self, request: &Value, response: &Value) -> Value {
        match &self.send_is_called {
            Some(f) => f(&serde_json::json!({"request": request, "response": response})),
            None => Value::Null,
        }
    }

    pub fn has(&self, hook: Hook) -> bool {
        match hook {
            Hook::SendWillBeCalled => self.send_will_be_called.is_some(),
            Hook::SendIsCalled => self.send_is_called.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_to_falsy_passthrough() {
        let mw = Middleware::new();
        let req = json!({"ticks": "R_50"});
        assert!(mw.run_send_will_be_called(&req).is_null());
        assert!(mw.run_send_is_called(&req, &json!({"quote": 1})).is_null());
        assert!(!mw.has(Hook::SendWillBeCalled));
    }

    #[test]
    fn runs_registered_hook() {
        let mw = Middleware::new().with_send_will_be_called(|req| {
            let mut req = req.clone();
            req["stamped"] = json!(true);
            req
        });
        let out = mw.run_send_will_be_called(&json!({"ticks": "R_50"}));
        assert_eq!(out["stamped"], json!(true));
        assert!(mw.has(Hook::SendWillBeCalled));
        assert!(!mw.has(Hook::SendIsCalled));
    }
}

//! RPC dispatcher (C3, §4.3).
//!
//! Each sync client scope (a session or a machine) owns one [`RpcRegistry`],
//! keyed by *unqualified* method name. On the wire, methods are qualified
//! with the scope's id (`{scopePrefix}:{method}`) so the server can route a
//! request to the right client without knowing which kind of scope it is.
//!
//! A "method not found" or "could not decrypt params" failure is a
//! protocol-level rejection, answered unencrypted — it never reaches a
//! handler. A handler's own `Err` is encrypted like a normal result, since
//! the caller still needs it to be opaque to the server.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use happy_crypto::AeadVariant;
use serde_json::Value;

use crate::envelope;

pub type RpcFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
pub type RpcHandler = Arc<dyn Fn(Value) -> RpcFuture + Send + Sync>;

/// A handler-level failure. Encrypted into the ack the same as a success
/// result (§4.3: "encrypt the result (or a `{error: {code, message}}`
/// envelope)").
#[derive(Debug, Clone, serde::Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The outcome of [`RpcRegistry::dispatch`]: either an encrypted ack
/// payload, or an unencrypted protocol-level rejection.
pub enum DispatchOutcome {
    Encrypted(String),
    ProtocolError { code: String, message: String },
}

pub struct RpcRegistry {
    scope_prefix: String,
    handlers: Mutex<HashMap<String, RpcHandler>>,
}

impl RpcRegistry {
    pub fn new(scope_prefix: impl Into<String>) -> Self {
        Self {
            scope_prefix: scope_prefix.into(),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, method: impl Into<String>, handler: RpcHandler) {
        self.handlers.lock().unwrap().insert(method.into(), handler);
    }

    pub fn unregister(&self, method: &str) {
        self.handlers.lock().unwrap().remove(method);
    }

    /// Every currently-registered method, qualified with this scope's
    /// prefix — what must be re-announced to the server on every connect,
    /// since the server forgets registrations per connection.
    pub fn qualified_names(&self) -> Vec<String> {
        self.handlers
            .lock()
            .unwrap()
            .keys()
            .map(|m| format!("{}:{m}", self.scope_prefix))
            .collect()
    }

    fn strip_prefix<'a>(&self, qualified: &'a str) -> &'a str {
        qualified
            .strip_prefix(&self.scope_prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(qualified)
    }

    /// Decrypt `params_b64`, dispatch to the matching handler, and encrypt
    /// the result (or handler error) into the ack this server's request
    /// should receive.
    pub async fn dispatch(
        &self,
        variant: AeadVariant,
        key: &[u8; 32],
        method: &str,
        params_b64: &str,
    ) -> DispatchOutcome {
        let unqualified = self.strip_prefix(method);
        let handler = self.handlers.lock().unwrap().get(unqualified).cloned();

        let Some(handler) = handler else {
            return DispatchOutcome::ProtocolError {
                code: "method_not_found".into(),
                message: format!("no handler registered for {method}"),
            };
        };

        let Some(params) = envelope::open::<Value>(variant, key, params_b64) else {
            return DispatchOutcome::ProtocolError {
                code: "decrypt_failed".into(),
                message: "could not decrypt rpc params".into(),
            };
        };

        let payload = match handler(params).await {
            Ok(result) => result,
            Err(rpc_error) => serde_json::json!({ "error": rpc_error }),
        };

        match envelope::seal(variant, key, &payload) {
            Ok(sealed) => DispatchOutcome::Encrypted(sealed),
            Err(e) => DispatchOutcome::ProtocolError {
                code: "encrypt_failed".into(),
                message: e.to_string(),
            },
        }
    }
}

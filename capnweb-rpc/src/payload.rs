//! Ownership discipline for values crossing the application boundary.
//!
//! A payload carries a value plus a marker recording where the value came
//! from. Application-supplied call parameters must be adopted (containers
//! rebuilt, embedded capabilities catalogued) before the runtime may retain
//! them; return values transfer ownership but still get scanned so that
//! every embedded stub and promise is released exactly once.

use crate::capability::{RpcPromise, RpcStub};
use crate::value::Value;

/// Provenance of the data inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    /// From the application as call parameters. Must be adopted before use.
    Params,
    /// From the application as a return value. The runtime takes ownership.
    Return,
    /// Deserialized or already adopted. The runtime owns it outright.
    Owned,
}

/// A value with explicit ownership semantics and capability tracking.
pub struct RpcPayload {
    pub value: Value,
    source: PayloadSource,
    // Populated by ensure_deep_copied: one extra handle per embedded
    // capability, released when the payload is disposed.
    stubs: Vec<RpcStub>,
    promises: Vec<RpcPromise>,
}

impl RpcPayload {
    pub fn from_app_params(value: Value) -> Self {
        Self {
            value,
            source: PayloadSource::Params,
            stubs: Vec::new(),
            promises: Vec::new(),
        }
    }

    pub fn from_app_return(value: Value) -> Self {
        Self {
            value,
            source: PayloadSource::Return,
            stubs: Vec::new(),
            promises: Vec::new(),
        }
    }

    pub fn owned(value: Value) -> Self {
        Self {
            value,
            source: PayloadSource::Owned,
            stubs: Vec::new(),
            promises: Vec::new(),
        }
    }

    pub fn source(&self) -> PayloadSource {
        self.source
    }

    /// Number of stubs catalogued by [`Self::ensure_deep_copied`].
    pub fn tracked_stubs(&self) -> usize {
        self.stubs.len()
    }

    /// Number of promises catalogued by [`Self::ensure_deep_copied`].
    pub fn tracked_promises(&self) -> usize {
        self.promises.len()
    }

    /// Transitions the payload to `Owned`, rebuilding containers and
    /// cataloguing every embedded stub and promise. Idempotent: a payload
    /// that is already owned is returned untouched. Capabilities are never
    /// structurally copied; sharing goes through `add_ref`.
    pub fn ensure_deep_copied(&mut self) {
        if self.source == PayloadSource::Owned {
            return;
        }
        let value = std::mem::replace(&mut self.value, Value::Null);
        let mut stubs = Vec::new();
        let mut promises = Vec::new();
        self.value = adopt(value, &mut stubs, &mut promises);
        self.stubs = stubs;
        self.promises = promises;
        self.source = PayloadSource::Owned;
    }

    /// Releases every catalogued capability and drops the value. Idempotent.
    pub fn dispose(&mut self) {
        self.stubs.clear();
        self.promises.clear();
        self.value = Value::Null;
    }

    /// Extracts the value, releasing the payload's tracking handles but
    /// transferring the value's own capability references to the caller.
    pub fn into_value(mut self) -> Value {
        std::mem::replace(&mut self.value, Value::Null)
    }
}

fn adopt(value: Value, stubs: &mut Vec<RpcStub>, promises: &mut Vec<RpcPromise>) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| adopt(item, stubs, promises))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, adopt(v, stubs, promises)))
                .collect(),
        ),
        Value::Stub(stub) => {
            stubs.push(stub.clone());
            Value::Stub(stub)
        }
        Value::Promise(promise) => {
            promises.push(promise.clone());
            Value::Promise(promise)
        }
        primitive => primitive,
    }
}

impl std::fmt::Debug for RpcPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPayload")
            .field("source", &self.source)
            .field("value", &self.value)
            .finish()
    }
}

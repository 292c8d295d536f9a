//! Translation from in-memory values onto the wire.
//!
//! The mirror of the parser, parameterized by the session acting as
//! exporter: embedded stubs are exported (identity-deduplicated against the
//! export table) and replaced with `["export", id]`, promises with
//! `["promise", id]`, errors with `["error", ...]`. Escaping of plain
//! arrays that collide with tagged forms happens in the wire codec when the
//! resulting expression is encoded.

use capnweb::wire::{Expression, WireError};
use capnweb::RpcError;

use crate::payload::RpcPayload;
use crate::session::RpcSession;
use crate::value::Value;

pub struct Serializer<'a> {
    session: &'a RpcSession,
}

impl<'a> Serializer<'a> {
    pub fn new(session: &'a RpcSession) -> Self {
        Self { session }
    }

    /// Serializes a payload, adopting it first so that embedded
    /// capabilities are catalogued before they are exported.
    pub fn serialize_payload(&self, payload: &mut RpcPayload) -> Expression {
        payload.ensure_deep_copied();
        self.serialize_value(&payload.value)
    }

    pub fn serialize_value(&self, value: &Value) -> Expression {
        match value {
            Value::Null => Expression::Null,
            Value::Bool(b) => Expression::Bool(*b),
            Value::Number(n) => Expression::Number(n.clone()),
            Value::String(s) => Expression::String(s.clone()),
            Value::Date(ms) => Expression::Date(*ms),
            Value::Array(items) => Expression::Array(
                items
                    .iter()
                    .map(|item| self.serialize_value(item))
                    .collect(),
            ),
            Value::Object(map) => Expression::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.serialize_value(v)))
                    .collect(),
            ),
            Value::Error(e) => Expression::Error(self.wire_error(e)),
            Value::Stub(stub) => {
                Expression::Export(self.session.export_capability(stub.hook_ref()))
            }
            Value::Promise(promise) => {
                Expression::Promise(self.session.export_capability(promise.hook_ref()))
            }
        }
    }

    /// Encodes an error for the wire. The stack slot is only populated when
    /// the session is configured to include diagnostics.
    pub fn wire_error(&self, error: &RpcError) -> WireError {
        let mut wire_error = WireError::from(error);
        if self.session.include_stack_traces() {
            wire_error.stack = Some(error.to_string());
        }
        wire_error
    }
}

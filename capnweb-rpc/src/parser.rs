//! Translation from the wire into in-memory values.
//!
//! A pure transformation over wire expressions, parameterized by the
//! session acting as importer: `["export", id]` registers an import and
//! becomes a stub, `["promise", id]` becomes a promise tied to the pending
//! map, errors become broken stubs. Send-only and executor-only forms
//! (`import`, `pipeline`, `remap`) must never appear in parse input and
//! decode to broken stubs describing the violation.

use capnweb::wire::Expression;
use capnweb::RpcError;

use crate::broken::ErrorHook;
use crate::capability::{RpcPromise, RpcStub};
use crate::payload::RpcPayload;
use crate::session::RpcSession;
use crate::value::Value;

pub struct Parser<'a> {
    session: &'a RpcSession,
}

impl<'a> Parser<'a> {
    pub fn new(session: &'a RpcSession) -> Self {
        Self { session }
    }

    /// Parses a wire expression into a value, registering capabilities on
    /// the session as a side effect. The result is always an owned payload.
    pub fn parse(&self, expr: &Expression) -> RpcPayload {
        RpcPayload::owned(self.parse_value(expr))
    }

    pub(crate) fn parse_value(&self, expr: &Expression) -> Value {
        match expr {
            Expression::Null => Value::Null,
            Expression::Bool(b) => Value::Bool(*b),
            Expression::Number(n) => Value::Number(n.clone()),
            Expression::String(s) => Value::String(s.clone()),
            Expression::Date(ms) => Value::Date(*ms),
            Expression::Array(items) => {
                Value::Array(items.iter().map(|item| self.parse_value(item)).collect())
            }
            Expression::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.parse_value(v)))
                    .collect(),
            ),
            Expression::Error(wire_error) => Value::Stub(RpcStub::new(ErrorHook::boxed(
                wire_error.to_error(),
            ))),
            Expression::Export(id) => {
                // The peer's export is our import.
                let hook = self.session.import_capability(*id);
                Value::Stub(RpcStub::with_session(hook, self.session.downgrade()))
            }
            Expression::Promise(id) => {
                let hook = self.session.promise_hook(*id);
                Value::Promise(RpcPromise::with_session(hook, self.session.downgrade()))
            }
            Expression::Import(_) => Value::Stub(RpcStub::new(ErrorHook::boxed(
                RpcError::bad_request("import expressions must not appear in parse input"),
            ))),
            Expression::Pipeline(_) => Value::Stub(RpcStub::new(ErrorHook::boxed(
                RpcError::bad_request("pipeline expressions must not appear in parse input"),
            ))),
            Expression::Remap(_) => Value::Stub(RpcStub::new(ErrorHook::boxed(
                RpcError::bad_request("remap expressions must not appear in parse input"),
            ))),
        }
    }
}

//! User-facing capability handles.
//!
//! [`RpcStub`] and [`RpcPromise`] are thin proxies over a [`StubHook`]: a
//! property access or method call on the proxy becomes the corresponding
//! hook operation, yielding a new promise that may itself be chained before
//! anything is awaited. Dropping a handle releases its reference; cloning
//! shares the hook.

use capnweb::RpcError;

use crate::broken::ErrorHook;
use crate::hooks::StubHook;
use crate::map::MapOutcome;
use crate::payload::RpcPayload;
use crate::promise::Promise;
use crate::queued::hook_from_promise;
use crate::session::{RpcSession, SessionRef};
use crate::value::Value;

/// An application-provided capability.
///
/// Methods dispatched through [`call`](Self::call) and properties read
/// through [`get_property`](Self::get_property) are the whole RPC surface of
/// a target. Names beginning with an underscore are never reachable from the
/// wire. Implementations return [`Promise`] so that synchronous bodies can
/// answer with `Promise::ok` without an allocation.
pub trait RpcTarget {
    fn call(&self, method: &str, args: Vec<Value>) -> Promise<Value, RpcError>;

    fn get_property(&self, property: &str) -> Promise<Value, RpcError>;

    /// Invoked (best-effort) when the last reference to this target is
    /// released.
    fn dispose(&self) {}
}

/// A reference to a capability.
pub struct RpcStub {
    hook: Option<Box<dyn StubHook>>,
    session: Option<SessionRef>,
}

impl RpcStub {
    pub fn new(hook: Box<dyn StubHook>) -> Self {
        Self {
            hook: Some(hook),
            session: None,
        }
    }

    pub(crate) fn with_session(hook: Box<dyn StubHook>, session: SessionRef) -> Self {
        Self {
            hook: Some(hook),
            session: Some(session),
        }
    }

    pub(crate) fn hook_ref(&self) -> &dyn StubHook {
        self.hook.as_deref().expect("stub used after disposal")
    }

    pub(crate) fn into_hook(mut self) -> Box<dyn StubHook> {
        self.hook.take().expect("stub used after disposal")
    }

    /// Reads a property, returning a promise for its value.
    pub fn get(&self, name: &str) -> RpcPromise {
        RpcPromise {
            hook: Some(self.hook_ref().get(vec![name.into()])),
            session: self.session.clone(),
        }
    }

    /// Invokes a method, returning a promise for its result.
    pub fn call(&self, method: &str, args: Vec<Value>) -> RpcPromise {
        let payload = RpcPayload::from_app_params(Value::Array(args));
        let promise = self.hook_ref().call(vec![method.into()], payload);
        RpcPromise {
            hook: Some(hook_from_promise(promise)),
            session: self.session.clone(),
        }
    }

    /// Records `f` as a per-element transformation and ships it to the
    /// peer holding the underlying collection. `f` runs synchronously
    /// against a placeholder; the real execution is remote.
    pub fn map<O, F>(&self, f: F) -> RpcPromise
    where
        O: Into<MapOutcome>,
        F: FnOnce(RpcPromise) -> O,
    {
        map_with_session(self.session.as_ref(), self.hook_ref(), f)
    }

    /// Releases this reference.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Clone for RpcStub {
    fn clone(&self) -> Self {
        Self {
            hook: Some(self.hook_ref().add_ref()),
            session: self.session.clone(),
        }
    }
}

impl Drop for RpcStub {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook.dispose();
        }
    }
}

impl PartialEq for RpcStub {
    fn eq(&self, other: &Self) -> bool {
        self.hook_ref().get_ptr() == other.hook_ref().get_ptr()
    }
}

impl std::fmt::Debug for RpcStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpcStub({:#x})", self.hook_ref().get_ptr())
    }
}

/// A promise for a capability or value.
///
/// Operations chain without awaiting; [`pull`](Self::pull) resolves the
/// chain to a final value.
pub struct RpcPromise {
    pub(crate) hook: Option<Box<dyn StubHook>>,
    pub(crate) session: Option<SessionRef>,
}

impl RpcPromise {
    pub fn new(hook: Box<dyn StubHook>) -> Self {
        Self {
            hook: Some(hook),
            session: None,
        }
    }

    pub(crate) fn with_session(hook: Box<dyn StubHook>, session: SessionRef) -> Self {
        Self {
            hook: Some(hook),
            session: Some(session),
        }
    }

    pub(crate) fn hook_ref(&self) -> &dyn StubHook {
        self.hook.as_deref().expect("promise used after disposal")
    }

    pub(crate) fn into_hook(mut self) -> Box<dyn StubHook> {
        self.hook.take().expect("promise used after disposal")
    }

    /// Reads a property of the eventual value, returning a chained promise.
    pub fn get(&self, name: &str) -> RpcPromise {
        RpcPromise {
            hook: Some(self.hook_ref().get(vec![name.into()])),
            session: self.session.clone(),
        }
    }

    /// Invokes a method on the eventual value, returning a chained promise.
    pub fn call(&self, method: &str, args: Vec<Value>) -> RpcPromise {
        let payload = RpcPayload::from_app_params(Value::Array(args));
        let promise = self.hook_ref().call(vec![method.into()], payload);
        RpcPromise {
            hook: Some(hook_from_promise(promise)),
            session: self.session.clone(),
        }
    }

    /// Records `f` as a per-element transformation over the eventual
    /// collection; see [`RpcStub::map`].
    pub fn map<O, F>(&self, f: F) -> RpcPromise
    where
        O: Into<MapOutcome>,
        F: FnOnce(RpcPromise) -> O,
    {
        map_with_session(self.session.as_ref(), self.hook_ref(), f)
    }

    /// Resolves the promise to its final value. Errors anywhere along the
    /// chain surface here.
    pub async fn pull(&self) -> Result<Value, RpcError> {
        let payload = self.hook_ref().pull().await?;
        Ok(payload.into_value())
    }

    /// Releases this reference, canceling the computation if it has not
    /// resolved yet.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Clone for RpcPromise {
    fn clone(&self) -> Self {
        Self {
            hook: Some(self.hook_ref().add_ref()),
            session: self.session.clone(),
        }
    }
}

impl Drop for RpcPromise {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook.dispose();
        }
    }
}

impl PartialEq for RpcPromise {
    fn eq(&self, other: &Self) -> bool {
        self.hook_ref().get_ptr() == other.hook_ref().get_ptr()
    }
}

impl std::fmt::Debug for RpcPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpcPromise({:#x})", self.hook_ref().get_ptr())
    }
}

fn map_with_session<O, F>(session: Option<&SessionRef>, hook: &dyn StubHook, f: F) -> RpcPromise
where
    O: Into<MapOutcome>,
    F: FnOnce(RpcPromise) -> O,
{
    match session.and_then(RpcSession::upgrade) {
        Some(session) => crate::map::send_map(&session, hook.add_ref(), Vec::new(), f),
        None => RpcPromise::new(ErrorHook::boxed(RpcError::bad_request(
            "an RPC session is required to use map()",
        ))),
    }
}

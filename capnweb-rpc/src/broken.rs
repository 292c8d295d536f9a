//! A capability that is permanently broken.

use std::rc::Rc;

use capnweb::wire::PropertyKey;
use capnweb::RpcError;

use crate::hooks::StubHook;
use crate::payload::RpcPayload;
use crate::promise::Promise;

/// A hook holding an error. Every navigation or call returns the hook
/// itself, so the error propagates through arbitrarily long chains and
/// surfaces when the caller finally pulls.
pub struct ErrorHook {
    inner: Rc<RpcError>,
}

impl ErrorHook {
    pub fn new(error: RpcError) -> Self {
        Self {
            inner: Rc::new(error),
        }
    }

    pub fn boxed(error: RpcError) -> Box<dyn StubHook> {
        Box::new(Self::new(error))
    }

    pub fn error(&self) -> &RpcError {
        &self.inner
    }
}

impl StubHook for ErrorHook {
    fn call(
        &self,
        _path: Vec<PropertyKey>,
        _args: RpcPayload,
    ) -> Promise<Box<dyn StubHook>, RpcError> {
        Promise::ok(self.add_ref())
    }

    fn get(&self, _path: Vec<PropertyKey>) -> Box<dyn StubHook> {
        self.add_ref()
    }

    fn pull(&self) -> Promise<RpcPayload, RpcError> {
        Promise::err((*self.inner).clone())
    }

    fn add_ref(&self) -> Box<dyn StubHook> {
        Box::new(Self {
            inner: self.inner.clone(),
        })
    }

    fn dispose(&self) {}

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }
}

// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Hooks for capabilities that live in this process: resolved payloads and
//! application-provided targets.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use capnweb::wire::PropertyKey;
use capnweb::RpcError;

use crate::broken::ErrorHook;
use crate::capability::RpcTarget;
use crate::hooks::StubHook;
use crate::payload::RpcPayload;
use crate::promise::Promise;
use crate::queued::PromiseHook;
use crate::value::Value;

/// Outcome of walking a property path through a payload: either a plain
/// value at the end of the path, or a capability encountered along the way
/// together with the path that remains to be walked on its side.
enum Navigated {
    Value(Value),
    Forward(Box<dyn StubHook>, Vec<PropertyKey>),
}

fn navigate(value: &Value, path: &[PropertyKey]) -> Result<Navigated, RpcError> {
    let mut current = value;
    for (i, key) in path.iter().enumerate() {
        match current {
            Value::Stub(stub) => {
                return Ok(Navigated::Forward(
                    stub.hook_ref().add_ref(),
                    path[i..].to_vec(),
                ))
            }
            Value::Promise(promise) => {
                return Ok(Navigated::Forward(
                    promise.hook_ref().add_ref(),
                    path[i..].to_vec(),
                ))
            }
            Value::Error(e) => return Err(e.clone()),
            Value::Object(map) => match key {
                PropertyKey::String(name) => {
                    current = map
                        .get(name)
                        .ok_or_else(|| RpcError::not_found(format!("property {name} not found")))?;
                }
                PropertyKey::Index(_) => {
                    return Err(RpcError::not_found(format!("property {key} not found")))
                }
            },
            Value::Array(items) => match key {
                PropertyKey::Index(idx) => {
                    current = items.get(*idx as usize).ok_or_else(|| {
                        RpcError::not_found(format!("index {idx} out of bounds"))
                    })?;
                }
                PropertyKey::String(_) => {
                    return Err(RpcError::not_found(format!("property {key} not found")))
                }
            },
            _ => {
                return Err(RpcError::not_found(format!(
                    "cannot navigate into a primitive at {key}"
                )))
            }
        }
    }
    match current {
        Value::Stub(stub) => Ok(Navigated::Forward(stub.hook_ref().add_ref(), Vec::new())),
        Value::Promise(p) => Ok(Navigated::Forward(p.hook_ref().add_ref(), Vec::new())),
        other => Ok(Navigated::Value(other.clone())),
    }
}

fn format_path(path: &[PropertyKey]) -> String {
    path.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

struct PayloadShared {
    payload: RefCell<RpcPayload>,
    refs: Cell<u32>,
}

/// A hook wrapping an already-resolved value. Property walks and calls are
/// local; calls only succeed when the path leads to an embedded capability.
pub struct PayloadHook {
    shared: Rc<PayloadShared>,
}

impl PayloadHook {
    pub fn new(mut payload: RpcPayload) -> Self {
        payload.ensure_deep_copied();
        Self {
            shared: Rc::new(PayloadShared {
                payload: RefCell::new(payload),
                refs: Cell::new(1),
            }),
        }
    }

    pub fn boxed(payload: RpcPayload) -> Box<dyn StubHook> {
        Box::new(Self::new(payload))
    }
}

impl StubHook for PayloadHook {
    fn call(
        &self,
        path: Vec<PropertyKey>,
        args: RpcPayload,
    ) -> Promise<Box<dyn StubHook>, RpcError> {
        let nav = navigate(&self.shared.payload.borrow().value, &path);
        match nav {
            Ok(Navigated::Forward(hook, rest)) => {
                let promise = hook.call(rest, args);
                hook.dispose();
                promise
            }
            Ok(Navigated::Value(_)) => Promise::ok(ErrorHook::boxed(RpcError::bad_request(
                format!("target at {} is not callable", format_path(&path)),
            ))),
            Err(e) => Promise::ok(ErrorHook::boxed(e)),
        }
    }

    fn get(&self, path: Vec<PropertyKey>) -> Box<dyn StubHook> {
        let nav = navigate(&self.shared.payload.borrow().value, &path);
        match nav {
            Ok(Navigated::Value(v)) => Self::boxed(RpcPayload::owned(v)),
            Ok(Navigated::Forward(hook, rest)) => {
                if rest.is_empty() {
                    hook
                } else {
                    let result = hook.get(rest);
                    hook.dispose();
                    result
                }
            }
            Err(e) => ErrorHook::boxed(e),
        }
    }

    fn pull(&self) -> Promise<RpcPayload, RpcError> {
        Promise::ok(RpcPayload::owned(
            self.shared.payload.borrow().value.clone(),
        ))
    }

    fn add_ref(&self) -> Box<dyn StubHook> {
        self.shared.refs.set(self.shared.refs.get() + 1);
        Box::new(Self {
            shared: self.shared.clone(),
        })
    }

    fn dispose(&self) {
        let refs = self.shared.refs.get().saturating_sub(1);
        self.shared.refs.set(refs);
        if refs == 0 {
            self.shared.payload.borrow_mut().dispose();
        }
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.shared) as usize
    }
}

struct TargetShared {
    target: Rc<dyn RpcTarget>,
    refs: Cell<u32>,
}

/// A hook wrapping a local application object. Navigation goes through the
/// target's property accessor; the final path element dispatches as a
/// method. Names starting with an underscore are never reachable.
pub struct TargetHook {
    shared: Rc<TargetShared>,
}

impl TargetHook {
    pub fn new(target: Rc<dyn RpcTarget>) -> Self {
        Self {
            shared: Rc::new(TargetShared {
                target,
                refs: Cell::new(1),
            }),
        }
    }

    pub fn boxed(target: Rc<dyn RpcTarget>) -> Box<dyn StubHook> {
        Box::new(Self::new(target))
    }
}

impl StubHook for TargetHook {
    fn call(
        &self,
        path: Vec<PropertyKey>,
        mut args: RpcPayload,
    ) -> Promise<Box<dyn StubHook>, RpcError> {
        if path.is_empty() {
            return Promise::ok(ErrorHook::boxed(RpcError::bad_request(
                "cannot call a target without a method name",
            )));
        }
        let shared = self.shared.clone();
        Promise::from_future(async move {
            args.ensure_deep_copied();

            let last = path.len() - 1;
            for (i, key) in path[..last].iter().enumerate() {
                let name = key.to_string();
                if name.starts_with('_') {
                    return Ok(ErrorHook::boxed(RpcError::not_found(format!(
                        "property {name} not found"
                    ))));
                }
                match shared.target.get_property(&name).await {
                    Ok(Value::Stub(stub)) => {
                        let hook = stub.into_hook();
                        let rest = path[i + 1..].to_vec();
                        let result = hook.call(rest, args).await;
                        hook.dispose();
                        return result;
                    }
                    Ok(Value::Promise(promise)) => {
                        let hook = promise.into_hook();
                        let rest = path[i + 1..].to_vec();
                        let result = hook.call(rest, args).await;
                        hook.dispose();
                        return result;
                    }
                    Ok(_) => {
                        return Ok(ErrorHook::boxed(RpcError::not_found(format!(
                            "property {name} is not a capability"
                        ))))
                    }
                    Err(e) => return Ok(ErrorHook::boxed(e)),
                }
            }

            let method = path[last].to_string();
            if method.starts_with('_') {
                return Ok(ErrorHook::boxed(RpcError::not_found(format!(
                    "Method {method} not found"
                ))));
            }
            let args_vec = match args.into_value() {
                Value::Array(items) => items,
                other => vec![other],
            };
            match shared.target.call(&method, args_vec).await {
                Ok(value) => Ok(PayloadHook::boxed(RpcPayload::from_app_return(value))),
                Err(e) => Ok(ErrorHook::boxed(e)),
            }
        })
    }

    fn get(&self, path: Vec<PropertyKey>) -> Box<dyn StubHook> {
        if path.len() != 1 {
            return ErrorHook::boxed(RpcError::not_found(
                "complex property paths are not supported on targets",
            ));
        }
        let name = path[0].to_string();
        if name.starts_with('_') {
            return ErrorHook::boxed(RpcError::not_found(format!("property {name} not found")));
        }
        let shared = self.shared.clone();
        Box::new(PromiseHook::from_future(async move {
            match shared.target.get_property(&name).await {
                Ok(value) => Ok(PayloadHook::boxed(RpcPayload::from_app_return(value))),
                Err(e) => Ok(ErrorHook::boxed(e)),
            }
        }))
    }

    fn pull(&self) -> Promise<RpcPayload, RpcError> {
        Promise::err(RpcError::bad_request("cannot pull a target object"))
    }

    fn add_ref(&self) -> Box<dyn StubHook> {
        self.shared.refs.set(self.shared.refs.get() + 1);
        Box::new(Self {
            shared: self.shared.clone(),
        })
    }

    fn dispose(&self) {
        let refs = self.shared.refs.get().saturating_sub(1);
        self.shared.refs.set(refs);
        if refs == 0 {
            self.shared.target.dispose();
        }
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.shared) as usize
    }
}

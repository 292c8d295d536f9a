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

//! The polymorphic backing of a capability reference.
//!
//! Every user-visible stub or promise is a thin wrapper over a `StubHook`.
//! The concrete hook decides what an operation means: a broken hook
//! propagates its error, a local hook walks a payload or dispatches into an
//! application target, a remote hook turns the operation into wire messages,
//! and a promise hook chains the operation after its future resolves.

use capnweb::wire::{Expression, PropertyKey};
use capnweb::RpcError;

use crate::payload::RpcPayload;
use crate::promise::Promise;

pub trait StubHook {
    /// Navigates `path` and invokes the final element as a method with
    /// `args`. Application failures resolve to a broken hook rather than
    /// rejecting the promise, so they chain like any other capability.
    fn call(
        &self,
        path: Vec<PropertyKey>,
        args: RpcPayload,
    ) -> Promise<Box<dyn StubHook>, RpcError>;

    /// Navigates `path` and returns a hook for the property there. This is
    /// synchronous; hooks that must wait return a promise hook.
    fn get(&self, path: Vec<PropertyKey>) -> Box<dyn StubHook>;

    /// Resolves this hook to its final payload. This is what awaiting a
    /// promise bottoms out in; error hooks reject here.
    fn pull(&self) -> Promise<RpcPayload, RpcError>;

    /// Returns a new handle sharing the same underlying resource.
    fn add_ref(&self) -> Box<dyn StubHook>;

    /// Releases this handle. The hook's backing resource is torn down when
    /// the last handle is disposed: remote imports queue a release message,
    /// unresolved promises cancel, local targets run their disposer.
    fn dispose(&self);

    /// A stable identity for the backing resource, used to deduplicate
    /// exports and remap captures.
    fn get_ptr(&self) -> usize;

    /// Applies a recorded per-element transformation to the collection this
    /// hook resolves to. Only remote capabilities support this; everything
    /// else reports the recording as unusable.
    fn map(
        &self,
        path: Vec<PropertyKey>,
        captures: Vec<Box<dyn StubHook>>,
        instructions: Vec<Expression>,
    ) -> Box<dyn StubHook> {
        let _ = (path, instructions);
        for capture in &captures {
            capture.dispose();
        }
        Box::new(crate::broken::ErrorHook::new(RpcError::bad_request(
            "map() is only supported on remote capabilities",
        )))
    }
}

impl Clone for Box<dyn StubHook> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

impl std::fmt::Debug for dyn StubHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StubHook({:#x})", self.get_ptr())
    }
}

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

//! A hook backed by a future that will yield another hook.
//!
//! Operations invoked before resolution queue behind the future: each one
//! chains a fresh promise hook that waits for the inner hook and then
//! forwards. Settlement happens at most once; later settlements are dropped.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};

use futures_util::FutureExt;
use tokio::sync::oneshot;

use capnweb::wire::{Expression, PropertyKey};
use capnweb::RpcError;

use crate::broken::ErrorHook;
use crate::hooks::StubHook;
use crate::payload::RpcPayload;
use crate::promise::Promise;

type HookResult = Result<Box<dyn StubHook>, RpcError>;

enum State {
    Pending {
        waiters: Vec<oneshot::Sender<HookResult>>,
    },
    Settled(HookResult),
}

struct Shared {
    state: RefCell<State>,
    refs: Cell<u32>,
}

fn clone_result(result: &HookResult) -> HookResult {
    match result {
        Ok(hook) => Ok(hook.add_ref()),
        Err(e) => Err(e.clone()),
    }
}

/// A hook that will eventually stand in for another hook.
pub struct PromiseHook {
    shared: Rc<Shared>,
}

impl PromiseHook {
    /// Creates an unresolved promise hook along with the fulfiller that
    /// settles it.
    pub fn new() -> (Self, PromiseFulfiller) {
        let shared = Rc::new(Shared {
            state: RefCell::new(State::Pending {
                waiters: Vec::new(),
            }),
            refs: Cell::new(1),
        });
        let fulfiller = PromiseFulfiller {
            shared: Rc::downgrade(&shared),
        };
        (Self { shared }, fulfiller)
    }

    /// Spawns `future` onto the local task set and returns a hook that
    /// settles with its output.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = HookResult> + 'static,
    {
        let (hook, fulfiller) = Self::new();
        tokio::task::spawn_local(async move {
            fulfiller.settle(future.await);
        });
        hook
    }

    /// A promise for the inner hook. Each caller gets its own `add_ref`'d
    /// handle on resolution.
    fn resolved(&self) -> Promise<Box<dyn StubHook>, RpcError> {
        let mut state = self.shared.state.borrow_mut();
        match &mut *state {
            State::Settled(result) => Promise::from_result(clone_result(result)),
            State::Pending { waiters } => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Promise::from_future(rx.map(|received| match received {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::canceled("promise was canceled")),
                }))
            }
        }
    }
}

impl StubHook for PromiseHook {
    fn call(
        &self,
        path: Vec<PropertyKey>,
        args: RpcPayload,
    ) -> Promise<Box<dyn StubHook>, RpcError> {
        let wait = self.resolved();
        Promise::from_future(async move {
            match wait.await {
                Ok(hook) => {
                    let result = hook.call(path, args).await;
                    hook.dispose();
                    result
                }
                Err(e) => Ok(ErrorHook::boxed(e)),
            }
        })
    }

    fn get(&self, path: Vec<PropertyKey>) -> Box<dyn StubHook> {
        let wait = self.resolved();
        Box::new(Self::from_future(async move {
            match wait.await {
                Ok(hook) => {
                    let result = hook.get(path);
                    hook.dispose();
                    Ok(result)
                }
                Err(e) => Ok(ErrorHook::boxed(e)),
            }
        }))
    }

    fn pull(&self) -> Promise<RpcPayload, RpcError> {
        let wait = self.resolved();
        Promise::from_future(async move {
            let hook = wait.await?;
            let result = hook.pull().await;
            hook.dispose();
            result
        })
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
        if refs > 0 {
            return;
        }
        let canceled = RpcError::canceled("promise was canceled");
        let previous = std::mem::replace(
            &mut *self.shared.state.borrow_mut(),
            State::Settled(Err(canceled.clone())),
        );
        match previous {
            State::Pending { waiters } => {
                for waiter in waiters {
                    let _ = waiter.send(Err(canceled.clone()));
                }
            }
            State::Settled(result) => {
                if let Ok(hook) = &result {
                    hook.dispose();
                }
            }
        }
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.shared) as usize
    }

    fn map(
        &self,
        path: Vec<PropertyKey>,
        captures: Vec<Box<dyn StubHook>>,
        instructions: Vec<Expression>,
    ) -> Box<dyn StubHook> {
        let wait = self.resolved();
        Box::new(Self::from_future(async move {
            match wait.await {
                Ok(hook) => {
                    let result = hook.map(path, captures, instructions);
                    hook.dispose();
                    Ok(result)
                }
                Err(e) => {
                    for capture in &captures {
                        capture.dispose();
                    }
                    Ok(ErrorHook::boxed(e))
                }
            }
        }))
    }
}

/// Settles a [`PromiseHook`]. Settling is one-shot: later calls drop their
/// argument. If the fulfiller is dropped unsettled, waiters are rejected
/// with a cancellation.
pub struct PromiseFulfiller {
    shared: Weak<Shared>,
}

impl PromiseFulfiller {
    pub fn fulfill(&self, hook: Box<dyn StubHook>) {
        self.settle(Ok(hook));
    }

    pub fn reject(&self, error: RpcError) {
        self.settle(Err(error));
    }

    pub fn settle(&self, result: HookResult) {
        let Some(shared) = self.shared.upgrade() else {
            // Nobody is listening anymore; release the hook, if any.
            if let Ok(hook) = &result {
                hook.dispose();
            }
            return;
        };
        let mut state = shared.state.borrow_mut();
        let waiters = match std::mem::replace(
            &mut *state,
            State::Pending {
                waiters: Vec::new(),
            },
        ) {
            State::Settled(previous) => {
                // Already settled: put it back and drop the latecomer.
                *state = State::Settled(previous);
                if let Ok(hook) = &result {
                    hook.dispose();
                }
                return;
            }
            State::Pending { waiters } => waiters,
        };
        for waiter in waiters {
            let _ = waiter.send(clone_result(&result));
        }
        *state = State::Settled(result);
    }

    fn is_pending(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => matches!(&*shared.state.borrow(), State::Pending { .. }),
            None => false,
        }
    }
}

impl Drop for PromiseFulfiller {
    fn drop(&mut self) {
        if self.is_pending() {
            self.settle(Err(RpcError::canceled(
                "promise abandoned before resolution",
            )));
        }
    }
}

/// Collapses a hook-producing promise to a hook without double-wrapping:
/// an immediate result is used directly, a deferred one is driven by a
/// fresh [`PromiseHook`].
pub(crate) fn hook_from_promise(
    promise: Promise<Box<dyn StubHook>, RpcError>,
) -> Box<dyn StubHook> {
    match promise.ready() {
        Ok(Ok(hook)) => hook,
        Ok(Err(e)) => ErrorHook::boxed(e),
        Err(deferred) => Box::new(PromiseHook::from_future(deferred)),
    }
}

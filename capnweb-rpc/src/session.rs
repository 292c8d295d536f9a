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

//! The session: import/export tables, reference accounting, the pending
//! promise map, and the remote-capability hook that turns operations into
//! wire traffic.
//!
//! A session is symmetric; clients and servers share this type and differ
//! only in whether a transport dispatcher is attached and in how inbound
//! batches reach it. All state lives behind a single `RefCell` and is only
//! touched from one task; hooks keep a non-owning reference back to the
//! session, so reference cycles between the two cannot leak.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use capnweb::ids::{ExportId, IdAllocator};
use capnweb::wire::{Expression, PropertyKey};
use capnweb::RpcError;

use crate::broken::ErrorHook;
use crate::capability::RpcTarget;
use crate::hooks::StubHook;
use crate::local::TargetHook;
use crate::payload::RpcPayload;
use crate::promise::Promise;
use crate::queued::{PromiseFulfiller, PromiseHook};

/// How a session reaches its transport. Implemented by the client; a
/// server-side batch session has none, and remote operations on it fail
/// rather than block.
pub(crate) trait Dispatcher {
    /// Emits a pipelined call (or property get, when `args` is `None`)
    /// against `target`, eventually settling the pending promise registered
    /// under `result_import_id`.
    fn pipeline_call(
        &self,
        target: i64,
        path: Vec<PropertyKey>,
        args: Option<RpcPayload>,
        result_import_id: i64,
    );

    /// Emits a `remap` against `target`.
    fn remap_call(
        &self,
        target: i64,
        path: Vec<PropertyKey>,
        captures: Vec<Box<dyn StubHook>>,
        instructions: Vec<Expression>,
        result_import_id: i64,
    );

    /// Pulls the final value of an import.
    fn pull_import(&self, import_id: i64) -> Promise<RpcPayload, RpcError>;

    /// Flushes the session's queued release messages, best-effort.
    fn flush_releases(&self);
}

struct ExportEntry {
    hook: Box<dyn StubHook>,
    /// How many times this export has been introduced to the peer since it
    /// was last released. The peer's cumulative release count is matched
    /// against this.
    remote_refs: u32,
}

pub(crate) struct ImportShared {
    session: SessionRef,
    id: i64,
    /// Local handles (stubs, table-independent add_refs).
    refs: Cell<u32>,
    /// How many times the peer has introduced this ID to us; reported back
    /// in the release message.
    introductions: Cell<u32>,
}

struct PendingEntry {
    hook: Box<dyn StubHook>,
    fulfiller: PromiseFulfiller,
}

pub(crate) struct SessionInner {
    imports: HashMap<i64, Rc<ImportShared>>,
    exports: HashMap<i64, ExportEntry>,
    pending: HashMap<i64, PendingEntry>,
    allocator: IdAllocator,
    dispatcher: Option<Weak<dyn Dispatcher>>,
    pending_releases: Vec<(i64, u32)>,
    aborted: Option<RpcError>,
    include_stack_traces: bool,
}

pub(crate) type SessionRef = Weak<RefCell<SessionInner>>;

/// A snapshot of the session's table identities, held by the resume-token
/// manager for same-process reattachment.
pub struct SessionSnapshot {
    exports: Vec<(i64, Box<dyn StubHook>, u32)>,
    imports: Vec<i64>,
}

impl SessionSnapshot {
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            exports: self
                .exports
                .iter()
                .map(|(id, hook, refs)| (*id, hook.add_ref(), *refs))
                .collect(),
            imports: self.imports.clone(),
        }
    }

    pub(crate) fn import_ids(&self) -> &[i64] {
        &self.imports
    }

    fn take_parts(mut self) -> (Vec<(i64, Box<dyn StubHook>, u32)>, Vec<i64>) {
        (
            std::mem::take(&mut self.exports),
            std::mem::take(&mut self.imports),
        )
    }
}

impl Drop for SessionSnapshot {
    fn drop(&mut self) {
        for (_, hook, _) in &self.exports {
            hook.dispose();
        }
    }
}

/// Shared handle to a session's state.
#[derive(Clone)]
pub struct RpcSession {
    inner: Rc<RefCell<SessionInner>>,
}

impl RpcSession {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SessionInner {
                imports: HashMap::new(),
                exports: HashMap::new(),
                pending: HashMap::new(),
                allocator: IdAllocator::new(),
                dispatcher: None,
                pending_releases: Vec::new(),
                aborted: None,
                include_stack_traces: false,
            })),
        }
    }

    pub(crate) fn downgrade(&self) -> SessionRef {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &SessionRef) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn set_dispatcher(&self, dispatcher: Weak<dyn Dispatcher>) {
        self.inner.borrow_mut().dispatcher = Some(dispatcher);
    }

    pub(crate) fn dispatcher(&self) -> Option<Rc<dyn Dispatcher>> {
        self.inner
            .borrow()
            .dispatcher
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn set_include_stack_traces(&self, on: bool) {
        self.inner.borrow_mut().include_stack_traces = on;
    }

    pub fn include_stack_traces(&self) -> bool {
        self.inner.borrow().include_stack_traces
    }

    /// Registers a local target at a fixed export ID (typically 0, the main
    /// capability). Replaces and releases any previous occupant.
    pub fn register_target(&self, id: ExportId, target: Rc<dyn RpcTarget>) {
        let hook = TargetHook::boxed(target);
        let old = {
            let mut inner = self.inner.borrow_mut();
            inner.allocator.reserve_export(id);
            inner.exports.insert(
                id.0,
                ExportEntry {
                    hook,
                    remote_refs: 1,
                },
            )
        };
        if let Some(entry) = old {
            entry.hook.dispose();
        }
    }

    /// Exports a hook, deduplicating by identity: re-exporting the same
    /// capability returns the existing ID and bumps its introduction count.
    pub(crate) fn export_capability(&self, hook: &dyn StubHook) -> i64 {
        let mut inner = self.inner.borrow_mut();
        let ptr = hook.get_ptr();
        for (id, entry) in inner.exports.iter_mut() {
            if entry.hook.get_ptr() == ptr {
                entry.remote_refs += 1;
                return *id;
            }
        }
        let id = inner.allocator.next_export().0;
        inner.exports.insert(
            id,
            ExportEntry {
                hook: hook.add_ref(),
                remote_refs: 1,
            },
        );
        id
    }

    pub(crate) fn export_hook(&self, id: i64) -> Option<Box<dyn StubHook>> {
        self.inner
            .borrow()
            .exports
            .get(&id)
            .map(|entry| entry.hook.add_ref())
    }

    /// Applies an inbound `release` to the export table; the entry is
    /// dropped once every introduction has been acknowledged. The main
    /// capability lives for the whole session and ignores releases.
    pub(crate) fn release_export(&self, id: i64, count: u32) {
        if ExportId(id).is_main() {
            return;
        }
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let drop_entry = match inner.exports.get_mut(&id) {
                Some(entry) if entry.remote_refs > count => {
                    entry.remote_refs -= count;
                    false
                }
                Some(_) => true,
                None => false,
            };
            if drop_entry {
                inner.exports.remove(&id)
            } else {
                None
            }
        };
        if let Some(entry) = removed {
            tracing::debug!(export_id = id, "export released");
            entry.hook.dispose();
        }
    }

    /// Creates (or reuses) the import hook for an ID the peer introduced.
    /// Duplicate introductions share the hook and are accounted for in the
    /// release protocol.
    pub(crate) fn import_capability(&self, id: i64) -> Box<dyn StubHook> {
        let mut inner = self.inner.borrow_mut();
        if let Some(shared) = inner.imports.get(&id) {
            shared.introductions.set(shared.introductions.get() + 1);
            shared.refs.set(shared.refs.get() + 1);
            return Box::new(ImportHook {
                shared: shared.clone(),
                path: Vec::new(),
            });
        }
        let shared = Rc::new(ImportShared {
            session: Rc::downgrade(&self.inner),
            id,
            refs: Cell::new(1),
            introductions: Cell::new(1),
        });
        inner.imports.insert(id, shared.clone());
        Box::new(ImportHook {
            shared,
            path: Vec::new(),
        })
    }

    /// Looks up the import ID backing `hook`, if it is one of this
    /// session's imports.
    pub(crate) fn find_import_id(&self, hook: &dyn StubHook) -> Option<i64> {
        let ptr = hook.get_ptr();
        self.inner
            .borrow()
            .imports
            .iter()
            .find(|(_, shared)| Rc::as_ptr(shared) as usize == ptr)
            .map(|(id, _)| *id)
    }

    /// Creates (or reuses) the promise hook for a wire promise ID, and
    /// registers the fulfiller that a later `resolve`/`reject` settles.
    /// Also used to pre-register the result of an outbound pipelined call
    /// so the caller may await immediately.
    pub(crate) fn promise_hook(&self, id: i64) -> Box<dyn StubHook> {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.pending.get(&id) {
            return entry.hook.add_ref();
        }
        let (hook, fulfiller) = PromiseHook::new();
        let hook: Box<dyn StubHook> = Box::new(hook);
        let result = hook.add_ref();
        inner.pending.insert(id, PendingEntry { hook, fulfiller });
        result
    }

    /// Settles a pending promise positively. A promise settles at most
    /// once; later settlements release their hook and are dropped.
    pub(crate) fn resolve_promise(&self, id: i64, hook: Box<dyn StubHook>) {
        let entry = self.inner.borrow_mut().pending.remove(&id);
        match entry {
            Some(e) => {
                e.fulfiller.fulfill(hook);
                e.hook.dispose();
            }
            None => hook.dispose(),
        }
    }

    /// Settles a pending promise negatively. No-op if already settled.
    pub(crate) fn reject_promise(&self, id: i64, error: RpcError) {
        let entry = self.inner.borrow_mut().pending.remove(&id);
        if let Some(e) = entry {
            e.fulfiller.reject(error);
            e.hook.dispose();
        }
    }

    /// Fatal error: rejects every pending promise and marks the session
    /// unusable. Idempotent.
    pub fn abort(&self, error: RpcError) {
        let entries: Vec<PendingEntry> = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted.is_some() {
                return;
            }
            inner.aborted = Some(error.clone());
            inner.pending.drain().map(|(_, e)| e).collect()
        };
        tracing::warn!(%error, "session aborted");
        for entry in entries {
            entry.fulfiller.reject(error.clone());
            entry.hook.dispose();
        }
    }

    pub fn aborted(&self) -> Option<RpcError> {
        self.inner.borrow().aborted.clone()
    }

    pub(crate) fn allocate_import_id(&self) -> i64 {
        self.inner.borrow_mut().allocator.next_import().0
    }

    /// Called by the import hook when its last local handle is disposed:
    /// drops the table entry and queues the release message.
    pub(crate) fn release_import(&self, id: i64, introductions: u32) {
        let dispatcher = {
            let mut inner = self.inner.borrow_mut();
            inner.imports.remove(&id);
            inner.pending_releases.push((id, introductions));
            inner.dispatcher.clone()
        };
        tracing::debug!(import_id = id, count = introductions, "import released");
        if let Some(d) = dispatcher.and_then(|weak| weak.upgrade()) {
            d.flush_releases();
        }
    }

    pub(crate) fn take_pending_releases(&self) -> Vec<(i64, u32)> {
        std::mem::take(&mut self.inner.borrow_mut().pending_releases)
    }

    /// Captures the table identities for resume-token reattachment.
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.borrow();
        SessionSnapshot {
            exports: inner
                .exports
                .iter()
                .map(|(id, entry)| (*id, entry.hook.add_ref(), entry.remote_refs))
                .collect(),
            imports: inner.imports.keys().copied().collect(),
        }
    }

    /// Re-materializes the tables from a snapshot, replacing the current
    /// export table.
    pub fn restore(&self, snapshot: SessionSnapshot) {
        let (exports, imports) = snapshot.take_parts();
        let old: Vec<Box<dyn StubHook>> = {
            let mut inner = self.inner.borrow_mut();
            let old = inner.exports.drain().map(|(_, e)| e.hook).collect();
            for (id, hook, remote_refs) in exports {
                inner.allocator.reserve_export(ExportId(id));
                inner.exports.insert(id, ExportEntry { hook, remote_refs });
            }
            old
        };
        for hook in old {
            hook.dispose();
        }
        for id in imports {
            // Re-materialize the entry; the returned handle is dropped
            // without dispose so the table keeps its single reference.
            let _hook = self.import_capability(id);
        }
    }

    // Table introspection, mainly for diagnostics and tests.

    pub fn import_count(&self) -> usize {
        self.inner.borrow().imports.len()
    }

    pub fn export_count(&self) -> usize {
        self.inner.borrow().exports.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    pub fn contains_export(&self, id: i64) -> bool {
        self.inner.borrow().exports.contains_key(&id)
    }

    pub fn contains_import(&self, id: i64) -> bool {
        self.inner.borrow().imports.contains_key(&id)
    }

    pub fn export_introductions(&self, id: i64) -> Option<u32> {
        self.inner.borrow().exports.get(&id).map(|e| e.remote_refs)
    }

    pub fn import_introductions(&self, id: i64) -> Option<u32> {
        self.inner
            .borrow()
            .imports
            .get(&id)
            .map(|s| s.introductions.get())
    }
}

impl Default for RpcSession {
    fn default() -> Self {
        Self::new()
    }
}

/// A hook for a capability that lives on the peer, optionally narrowed by
/// a deferred property path.
///
/// Property walks are free: they extend the path without touching the
/// wire. A call ships a pipelined expression whose result is a
/// pre-registered future, so the caller may await, or keep chaining,
/// without a round trip per step; `map` ships the whole recorded
/// transformation as a single `remap` addressing the base import and the
/// accumulated path.
pub(crate) struct ImportHook {
    shared: Rc<ImportShared>,
    path: Vec<PropertyKey>,
}

impl ImportHook {
    fn session(&self) -> Option<RpcSession> {
        RpcSession::upgrade(&self.shared.session)
    }

    fn dispatch_context(&self) -> Result<(RpcSession, Rc<dyn Dispatcher>), RpcError> {
        let session = self
            .session()
            .ok_or_else(|| RpcError::internal("session is gone"))?;
        if let Some(err) = session.aborted() {
            return Err(err);
        }
        let dispatcher = session
            .dispatcher()
            .ok_or_else(|| RpcError::internal("session has no transport attached"))?;
        Ok((session, dispatcher))
    }

    fn full_path(&self, rest: Vec<PropertyKey>) -> Vec<PropertyKey> {
        let mut path = self.path.clone();
        path.extend(rest);
        path
    }
}

impl StubHook for ImportHook {
    fn call(
        &self,
        path: Vec<PropertyKey>,
        args: RpcPayload,
    ) -> Promise<Box<dyn StubHook>, RpcError> {
        match self.dispatch_context() {
            Ok((session, dispatcher)) => {
                let result_id = session.allocate_import_id();
                let promise = session.promise_hook(result_id);
                dispatcher.pipeline_call(
                    self.shared.id,
                    self.full_path(path),
                    Some(args),
                    result_id,
                );
                Promise::ok(promise)
            }
            Err(e) => Promise::ok(ErrorHook::boxed(e)),
        }
    }

    fn get(&self, path: Vec<PropertyKey>) -> Box<dyn StubHook> {
        // No wire traffic: narrow the path and stay addressable, so a later
        // call, pull, or map can ship the whole walk at once.
        self.shared.refs.set(self.shared.refs.get() + 1);
        Box::new(Self {
            shared: self.shared.clone(),
            path: self.full_path(path),
        })
    }

    fn pull(&self) -> Promise<RpcPayload, RpcError> {
        match self.dispatch_context() {
            Ok((session, dispatcher)) => {
                if self.path.is_empty() {
                    return dispatcher.pull_import(self.shared.id);
                }
                // A narrowed import resolves by shipping the deferred walk
                // as a pipeline get and pulling its result.
                let result_id = session.allocate_import_id();
                let promise = session.promise_hook(result_id);
                dispatcher.pipeline_call(self.shared.id, self.path.clone(), None, result_id);
                Promise::from_future(async move {
                    let pulled = promise.pull().await;
                    promise.dispose();
                    pulled
                })
            }
            Err(e) => Promise::err(e),
        }
    }

    fn add_ref(&self) -> Box<dyn StubHook> {
        self.shared.refs.set(self.shared.refs.get() + 1);
        Box::new(Self {
            shared: self.shared.clone(),
            path: self.path.clone(),
        })
    }

    fn dispose(&self) {
        let refs = self.shared.refs.get().saturating_sub(1);
        self.shared.refs.set(refs);
        if refs == 0 {
            if let Some(session) = self.session() {
                session.release_import(self.shared.id, self.shared.introductions.get());
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
        match self.dispatch_context() {
            Ok((session, dispatcher)) => {
                let result_id = session.allocate_import_id();
                let promise = session.promise_hook(result_id);
                dispatcher.remap_call(
                    self.shared.id,
                    self.full_path(path),
                    captures,
                    instructions,
                    result_id,
                );
                promise
            }
            Err(e) => {
                for capture in &captures {
                    capture.dispose();
                }
                ErrorHook::boxed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::PayloadHook;
    use crate::value::Value;

    #[test]
    fn export_is_deduplicated_by_identity() {
        let session = RpcSession::new();
        let hook = PayloadHook::boxed(RpcPayload::owned(Value::from(1i64)));
        let a = session.export_capability(&*hook);
        let b = session.export_capability(&*hook);
        assert_eq!(a, b);
        assert_eq!(session.export_introductions(a), Some(2));
        assert_eq!(session.export_count(), 1);
        hook.dispose();
    }

    #[test]
    fn release_export_honors_cumulative_count() {
        let session = RpcSession::new();
        let hook = PayloadHook::boxed(RpcPayload::owned(Value::from(1i64)));
        let id = session.export_capability(&*hook);
        session.export_capability(&*hook);
        session.export_capability(&*hook);
        hook.dispose();

        session.release_export(id, 2);
        assert!(session.contains_export(id));
        session.release_export(id, 1);
        assert!(!session.contains_export(id));
    }

    #[test]
    fn duplicate_introductions_share_the_import_hook() {
        let session = RpcSession::new();
        let a = session.import_capability(7);
        let b = session.import_capability(7);
        assert_eq!(a.get_ptr(), b.get_ptr());
        assert_eq!(session.import_introductions(7), Some(2));
        assert_eq!(session.import_count(), 1);
        a.dispose();
        assert!(session.contains_import(7));
        b.dispose();
        // Last handle gone: entry removed, release queued with the
        // cumulative introduction count.
        assert!(!session.contains_import(7));
        assert_eq!(session.take_pending_releases(), vec![(7, 2)]);
    }

    #[test]
    fn abort_is_idempotent_and_sticky() {
        let session = RpcSession::new();
        session.abort(RpcError::internal("first"));
        session.abort(RpcError::internal("second"));
        assert_eq!(session.aborted().map(|e| e.message), Some("first".into()));
    }
}

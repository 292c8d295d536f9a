//! The `remap` machinery: recording a transformation on the caller's side
//! and executing it per-element on the callee's side.
//!
//! Recording works through a placeholder hook handed to the user's closure.
//! Operations on the placeholder are appended to an instruction list instead
//! of being performed; each yields a new placeholder bound to the next
//! instruction slot. Slot indexing: 0 is the input element, positive `k` is
//! the result of the k-th instruction (1-based), negative `-k` is the k-th
//! capture.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use capnweb::wire::{CaptureRef, Expression, PropertyKey, WirePipeline};
use capnweb::RpcError;

use crate::capability::RpcPromise;
use crate::hooks::StubHook;
use crate::local::PayloadHook;
use crate::parser::Parser;
use crate::payload::RpcPayload;
use crate::promise::Promise;
use crate::serializer::Serializer;
use crate::session::RpcSession;
use crate::value::Value;

/// What a map closure may return: a promise derived from the placeholder,
/// or a plain value used as a constant result.
pub enum MapOutcome {
    Promise(RpcPromise),
    Value(Value),
}

impl From<RpcPromise> for MapOutcome {
    fn from(p: RpcPromise) -> Self {
        Self::Promise(p)
    }
}

impl From<Value> for MapOutcome {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

struct BuilderInner {
    session: RpcSession,
    instructions: Vec<Expression>,
    captures: Vec<Box<dyn StubHook>>,
    capture_indices: HashMap<usize, i64>,
    variable_ptrs: HashMap<usize, i64>,
}

type Builder = Rc<RefCell<BuilderInner>>;

/// Resolves a hook to a slot index: one of this builder's own variables, an
/// already-captured external hook, or a fresh capture.
fn capture_hook(builder: &Builder, hook: &dyn StubHook) -> i64 {
    let mut inner = builder.borrow_mut();
    let ptr = hook.get_ptr();
    if let Some(idx) = inner.variable_ptrs.get(&ptr) {
        return *idx;
    }
    if let Some(idx) = inner.capture_indices.get(&ptr) {
        return *idx;
    }
    let idx = -(inner.captures.len() as i64) - 1;
    inner.captures.push(hook.add_ref());
    inner.capture_indices.insert(ptr, idx);
    idx
}

struct VariableShared {
    builder: Builder,
    index: i64,
}

/// The placeholder hook used while a map closure runs. Operations record
/// instructions instead of executing.
pub(crate) struct MapVariableHook {
    shared: Rc<VariableShared>,
}

impl MapVariableHook {
    fn new(builder: Builder, index: i64) -> Box<dyn StubHook> {
        let shared = Rc::new(VariableShared {
            builder: builder.clone(),
            index,
        });
        builder
            .borrow_mut()
            .variable_ptrs
            .insert(Rc::as_ptr(&shared) as usize, index);
        Box::new(Self { shared })
    }

    fn record(&self, path: Vec<PropertyKey>, args: Option<Expression>) -> Box<dyn StubHook> {
        let builder = self.shared.builder.clone();
        let next_index = {
            let mut inner = builder.borrow_mut();
            inner.instructions.push(Expression::Pipeline(WirePipeline {
                target: self.shared.index,
                path: if path.is_empty() { None } else { Some(path) },
                args: args.map(Box::new),
            }));
            inner.instructions.len() as i64
        };
        Self::new(builder, next_index)
    }
}

impl StubHook for MapVariableHook {
    fn call(
        &self,
        path: Vec<PropertyKey>,
        mut args: RpcPayload,
    ) -> Promise<Box<dyn StubHook>, RpcError> {
        args.ensure_deep_copied();
        let serialized = {
            let inner = self.shared.builder.borrow();
            Serializer::new(&inner.session).serialize_value(&args.value)
        };
        Promise::ok(self.record(path, Some(serialized)))
    }

    fn get(&self, path: Vec<PropertyKey>) -> Box<dyn StubHook> {
        self.record(path, None)
    }

    fn pull(&self) -> Promise<RpcPayload, RpcError> {
        Promise::err(RpcError::bad_request(
            "a map placeholder cannot be awaited inside the map function",
        ))
    }

    fn add_ref(&self) -> Box<dyn StubHook> {
        Box::new(Self {
            shared: self.shared.clone(),
        })
    }

    fn dispose(&self) {}

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.shared) as usize
    }
}

/// Records `f` against a placeholder, then ships the recording to the
/// subject hook as a `remap`.
pub(crate) fn send_map<O, F>(
    session: &RpcSession,
    subject: Box<dyn StubHook>,
    path: Vec<PropertyKey>,
    f: F,
) -> RpcPromise
where
    O: Into<MapOutcome>,
    F: FnOnce(RpcPromise) -> O,
{
    let builder: Builder = Rc::new(RefCell::new(BuilderInner {
        session: session.clone(),
        instructions: Vec::new(),
        captures: Vec::new(),
        capture_indices: HashMap::new(),
        variable_ptrs: HashMap::new(),
    }));

    // Slot 0 is the current input element.
    let placeholder = RpcPromise::with_session(
        MapVariableHook::new(builder.clone(), 0),
        session.downgrade(),
    );
    let outcome = f(placeholder).into();

    let final_hook: Box<dyn StubHook> = match outcome {
        MapOutcome::Promise(p) => p.into_hook(),
        MapOutcome::Value(v) => PayloadHook::boxed(RpcPayload::owned(v)),
    };
    let final_index = capture_hook(&builder, &*final_hook);
    final_hook.dispose();

    let (instructions, captures) = {
        let mut inner = builder.borrow_mut();
        inner.instructions.push(Expression::integer(final_index));
        (
            std::mem::take(&mut inner.instructions),
            std::mem::take(&mut inner.captures),
        )
    };

    let result = subject.map(path, captures, instructions);
    subject.dispose();
    RpcPromise::with_session(result, session.downgrade())
}

/// Executes a `remap` on the callee. Captures are resolved once up front;
/// each element of the subject collection runs the instruction list over a
/// private variables table seeded with the element at slot 0.
pub(crate) struct MapApplicator {
    captures: Vec<Box<dyn StubHook>>,
    instructions: Vec<Expression>,
}

impl MapApplicator {
    pub fn new(
        session: &RpcSession,
        captures: &[CaptureRef],
        instructions: Vec<Expression>,
    ) -> Result<Self, RpcError> {
        let mut resolved: Vec<Box<dyn StubHook>> = Vec::with_capacity(captures.len());
        for capture in captures {
            let hook = match capture {
                // The sender refers to a capability it already imports from
                // us, so it lives in our export table.
                CaptureRef::Import(id) => match session.export_hook(*id) {
                    Some(hook) => hook,
                    None => {
                        for h in &resolved {
                            h.dispose();
                        }
                        return Err(RpcError::not_found(format!(
                            "capture refers to unknown export {id}"
                        )));
                    }
                },
                // A fresh capability the sender is exporting to us.
                CaptureRef::Export(id) => session.import_capability(*id),
            };
            resolved.push(hook);
        }
        Ok(Self {
            captures: resolved,
            instructions,
        })
    }

    /// Resolves the subject, applies the instructions to each element, and
    /// aggregates the results. The first failing element rejects the whole
    /// remap.
    pub async fn run(
        self,
        target: Box<dyn StubHook>,
        path: Vec<PropertyKey>,
        session: &RpcSession,
    ) -> Result<RpcPayload, RpcError> {
        let subject = if path.is_empty() {
            target
        } else {
            let walked = target.get(path);
            target.dispose();
            walked
        };
        let pulled = subject.pull().await;
        subject.dispose();
        let payload = match pulled {
            Ok(p) => p,
            Err(e) => {
                self.dispose_captures();
                return Err(e);
            }
        };

        let result = match payload.into_value() {
            Value::Array(items) => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    match self.apply_one(item, session).await {
                        Ok(v) => mapped.push(v),
                        Err(e) => {
                            self.dispose_captures();
                            return Err(e);
                        }
                    }
                }
                Ok(Value::Array(mapped))
            }
            single => self.apply_one(single, session).await,
        };
        self.dispose_captures();
        result.map(RpcPayload::owned)
    }

    async fn apply_one(&self, input: Value, session: &RpcSession) -> Result<Value, RpcError> {
        let mut variables: Vec<Box<dyn StubHook>> =
            vec![PayloadHook::boxed(RpcPayload::owned(input))];
        let result = self.run_instructions(&mut variables, session).await;
        for hook in &variables {
            hook.dispose();
        }
        result
    }

    async fn run_instructions(
        &self,
        variables: &mut Vec<Box<dyn StubHook>>,
        session: &RpcSession,
    ) -> Result<Value, RpcError> {
        for instruction in &self.instructions {
            match instruction {
                // The final instruction names the result slot.
                Expression::Number(n) => {
                    let index = n.as_i64().ok_or_else(|| {
                        RpcError::bad_request("map result index must be an integer")
                    })?;
                    let hook = self.resolve_slot(index, variables)?;
                    let pulled = hook.pull().await;
                    hook.dispose();
                    return Ok(pulled?.into_value());
                }
                Expression::Pipeline(p) => {
                    let subject = self.resolve_slot(p.target, variables)?;
                    let path = p.path.clone().unwrap_or_default();
                    let next = match &p.args {
                        None => {
                            let hook = subject.get(path);
                            subject.dispose();
                            hook
                        }
                        Some(args_expr) => {
                            let args = Parser::new(session).parse(args_expr);
                            let called = subject.call(path, args).await;
                            subject.dispose();
                            called?
                        }
                    };
                    variables.push(next);
                }
                _ => {
                    return Err(RpcError::bad_request(
                        "only pipeline instructions are supported in remap",
                    ))
                }
            }
        }
        Err(RpcError::bad_request(
            "map instructions ended without a final result",
        ))
    }

    fn resolve_slot(
        &self,
        index: i64,
        variables: &[Box<dyn StubHook>],
    ) -> Result<Box<dyn StubHook>, RpcError> {
        if index >= 0 {
            variables
                .get(index as usize)
                .map(|h| h.add_ref())
                .ok_or_else(|| {
                    RpcError::bad_request(format!("variable index {index} out of bounds"))
                })
        } else {
            self.captures
                .get((-index - 1) as usize)
                .map(|h| h.add_ref())
                .ok_or_else(|| {
                    RpcError::bad_request(format!("capture index {index} out of bounds"))
                })
        }
    }

    fn dispose_captures(&self) {
        for hook in &self.captures {
            hook.dispose();
        }
    }
}

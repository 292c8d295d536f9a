//! Explicit client-side batching of dependent calls.
//!
//! A batch assigns local import IDs sequentially from 1 to each enqueued
//! call; because the server numbers the pushes of a batch the same way, a
//! later call may name an earlier call's result as its target or argument.
//! Awaiting any promise flushes the whole batch in one transport round
//! trip.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tokio::sync::oneshot;

use capnweb::ids::ImportId;
use capnweb::wire::{Expression, Message, PropertyKey, WirePipeline};
use capnweb::RpcError;

use crate::client::{error_from_expression, Client};
use crate::parser::Parser;
use crate::payload::RpcPayload;
use crate::serializer::Serializer;
use crate::value::Value;

/// An argument to a batched call: a plain value, or a reference to the
/// result of an earlier call in the same batch.
pub enum BatchArg {
    Value(Value),
    Pipeline { target: i64, path: Vec<PropertyKey> },
}

impl From<Value> for BatchArg {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<i64> for BatchArg {
    fn from(n: i64) -> Self {
        Self::Value(Value::from(n))
    }
}

impl From<&str> for BatchArg {
    fn from(s: &str) -> Self {
        Self::Value(Value::from(s))
    }
}

impl From<bool> for BatchArg {
    fn from(b: bool) -> Self {
        Self::Value(Value::from(b))
    }
}

impl From<&PipelinePromise> for BatchArg {
    fn from(promise: &PipelinePromise) -> Self {
        Self::Pipeline {
            target: promise.import_id,
            path: Vec::new(),
        }
    }
}

enum BatchState {
    Idle,
    Executing(Vec<oneshot::Sender<()>>),
    Done,
}

struct BatchShared {
    next_id: i64,
    pushes: Vec<Expression>,
    results: HashMap<i64, Result<Value, RpcError>>,
    state: BatchState,
}

/// A set of calls flushed together in a single round trip.
pub struct PipelineBatch {
    shared: Rc<RefCell<BatchShared>>,
    client: Client,
}

impl PipelineBatch {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            shared: Rc::new(RefCell::new(BatchShared {
                next_id: 1,
                pushes: Vec::new(),
                results: HashMap::new(),
                state: BatchState::Idle,
            })),
            client,
        }
    }

    /// Enqueues a method call on `target` (0 is the peer's main
    /// capability, or an earlier call's batch-local ID).
    pub fn call(
        &self,
        target: i64,
        method: &str,
        args: Vec<BatchArg>,
    ) -> PipelinePromise {
        self.call_path(target, Vec::new(), method, args)
    }

    /// Like [`call`](Self::call), navigating `path` before the method.
    pub fn call_path(
        &self,
        target: i64,
        mut path: Vec<PropertyKey>,
        method: &str,
        args: Vec<BatchArg>,
    ) -> PipelinePromise {
        path.push(method.into());
        let args_expr = Expression::Array(
            args.into_iter()
                .map(|arg| match arg {
                    BatchArg::Value(v) => {
                        let mut payload = RpcPayload::from_app_params(v);
                        Serializer::new(self.client.session()).serialize_payload(&mut payload)
                    }
                    BatchArg::Pipeline { target, path } => Expression::Pipeline(WirePipeline {
                        target,
                        path: if path.is_empty() { None } else { Some(path) },
                        args: None,
                    }),
                })
                .collect(),
        );
        self.push(Expression::Pipeline(WirePipeline {
            target,
            path: Some(path),
            args: Some(Box::new(args_expr)),
        }))
    }

    fn push(&self, expr: Expression) -> PipelinePromise {
        let mut shared = self.shared.borrow_mut();
        let import_id = shared.next_id;
        shared.next_id += 1;
        shared.pushes.push(expr);
        PipelinePromise {
            shared: self.shared.clone(),
            client: self.client.clone(),
            import_id,
        }
    }
}

/// The not-yet-known result of a batched call. May be used as the target
/// of further batched operations before the batch is flushed.
pub struct PipelinePromise {
    shared: Rc<RefCell<BatchShared>>,
    client: Client,
    import_id: i64,
}

impl PipelinePromise {
    /// The batch-local import ID assigned to this result.
    pub fn import_id(&self) -> i64 {
        self.import_id
    }

    /// Enqueues a property read on this (unresolved) result.
    pub fn get(&self, name: &str) -> PipelinePromise {
        let mut shared = self.shared.borrow_mut();
        let import_id = shared.next_id;
        shared.next_id += 1;
        shared.pushes.push(Expression::Pipeline(WirePipeline {
            target: self.import_id,
            path: Some(vec![name.into()]),
            args: None,
        }));
        PipelinePromise {
            shared: self.shared.clone(),
            client: self.client.clone(),
            import_id,
        }
    }

    /// Enqueues a method call on this (unresolved) result.
    pub fn call(&self, method: &str, args: Vec<BatchArg>) -> PipelinePromise {
        let batch = PipelineBatch {
            shared: self.shared.clone(),
            client: self.client.clone(),
        };
        batch.call(self.import_id, method, args)
    }

    /// Flushes the batch (first awaiter only; the rest wait for the same
    /// round trip) and yields this call's result.
    pub async fn pull(&self) -> Result<Value, RpcError> {
        execute(&self.client, &self.shared).await;
        let shared = self.shared.borrow();
        match shared.results.get(&self.import_id) {
            Some(result) => result.clone(),
            None => Err(RpcError::internal("no result for batched call")),
        }
    }
}

async fn execute(client: &Client, shared: &Rc<RefCell<BatchShared>>) {
    // First caller becomes the executor; everyone else queues for the
    // completion signal.
    let wait = {
        let mut s = shared.borrow_mut();
        match &mut s.state {
            BatchState::Done => return,
            BatchState::Executing(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            }
            BatchState::Idle => {
                s.state = BatchState::Executing(Vec::new());
                None
            }
        }
    };
    if let Some(rx) = wait {
        let _ = rx.await;
        return;
    }

    let (messages, ids) = {
        let s = shared.borrow();
        let mut messages: Vec<Message> = s.pushes.iter().cloned().map(Message::Push).collect();
        let ids: Vec<i64> = (1..s.next_id).collect();
        messages.extend(ids.iter().map(|id| Message::Pull(ImportId(*id))));
        (messages, ids)
    };

    let outcome = client.exchange(messages).await;
    let mut settled: Vec<(i64, Result<Value, RpcError>)> = Vec::new();
    match outcome {
        Ok(response) => {
            for msg in response {
                match msg {
                    Message::Resolve(id, expr) => {
                        let value = Parser::new(client.session()).parse(&expr).into_value();
                        settled.push((id.0, Ok(value)));
                    }
                    Message::Reject(id, expr) => {
                        settled.push((id.0, Err(error_from_expression(&expr))));
                    }
                    Message::Abort(expr) => {
                        let error = error_from_expression(&expr);
                        client.session().abort(error.clone());
                        for id in &ids {
                            settled.push((*id, Err(error.clone())));
                        }
                        break;
                    }
                    _ => {}
                }
            }
        }
        Err(e) => {
            for id in &ids {
                settled.push((*id, Err(e.clone())));
            }
        }
    }

    let waiters = {
        let mut s = shared.borrow_mut();
        for (id, result) in settled {
            s.results.entry(id).or_insert(result);
        }
        match std::mem::replace(&mut s.state, BatchState::Done) {
            BatchState::Executing(waiters) => waiters,
            _ => Vec::new(),
        }
    };
    for waiter in waiters {
        let _ = waiter.send(());
    }
}

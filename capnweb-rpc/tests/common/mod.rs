#![allow(dead_code)]

//! Shared target implementations and a LocalSet-based test runner.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;

use capnweb::RpcError;
use capnweb_rpc::local::TargetHook;
use capnweb_rpc::{Promise, RpcStub, RpcTarget, Value};

/// Runs a future on a current-thread runtime inside a `LocalSet`, so that
/// the runtime's `spawn_local`-based machinery can make progress.
pub fn run<F: Future>(future: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build runtime");
    tokio::task::LocalSet::new().block_on(&rt, future)
}

/// Lets spawned local tasks (release flushes, chained promises) run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn object(pairs: Vec<(&str, Value)>) -> Value {
    Value::Object(
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect::<BTreeMap<String, Value>>(),
    )
}

fn arg_i64(args: &[Value], index: usize) -> Result<i64, RpcError> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| RpcError::bad_request("expected an integer argument"))
}

fn arg_str(args: &[Value], index: usize) -> Result<String, RpcError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| RpcError::bad_request("expected a string argument"))
}

pub struct Calculator;

impl RpcTarget for Calculator {
    fn call(&self, method: &str, args: Vec<Value>) -> Promise<Value, RpcError> {
        match method {
            "add" => Promise::from_result(
                arg_i64(&args, 0)
                    .and_then(|a| arg_i64(&args, 1).map(|b| Value::from(a + b))),
            ),
            "subtract" => Promise::from_result(
                arg_i64(&args, 0)
                    .and_then(|a| arg_i64(&args, 1).map(|b| Value::from(a - b))),
            ),
            "echo" => Promise::ok(args.into_iter().next().unwrap_or(Value::Null)),
            "fail" => Promise::err(
                RpcError::permission_denied("not allowed")
                    .with_data(serde_json::json!({"reason": "policy"})),
            ),
            _ => Promise::err(RpcError::not_found(format!("Method {method} not found"))),
        }
    }

    fn get_property(&self, property: &str) -> Promise<Value, RpcError> {
        match property {
            "version" => Promise::ok(Value::from("1.0.0")),
            _ => Promise::err(RpcError::not_found(format!(
                "property {property} not found"
            ))),
        }
    }
}

pub struct Worker {
    count: Cell<i64>,
    disposed: Rc<Cell<bool>>,
}

impl Worker {
    pub fn new(disposed: Rc<Cell<bool>>) -> Self {
        Self {
            count: Cell::new(0),
            disposed,
        }
    }
}

impl RpcTarget for Worker {
    fn call(&self, method: &str, _args: Vec<Value>) -> Promise<Value, RpcError> {
        match method {
            "increment" => {
                let next = self.count.get() + 1;
                self.count.set(next);
                Promise::ok(Value::from(next))
            }
            "current" => Promise::ok(Value::from(self.count.get())),
            _ => Promise::err(RpcError::not_found(format!("Method {method} not found"))),
        }
    }

    fn get_property(&self, property: &str) -> Promise<Value, RpcError> {
        match property {
            "count" => Promise::ok(Value::from(self.count.get())),
            _ => Promise::err(RpcError::not_found(format!(
                "property {property} not found"
            ))),
        }
    }

    fn dispose(&self) {
        self.disposed.set(true);
    }
}

/// Hands out worker capabilities: `spawn_worker` makes a fresh one per
/// call, `get_worker` always returns the same shared one.
pub struct Registry {
    shared_worker: RefCell<Option<RpcStub>>,
    pub worker_disposed: Rc<Cell<bool>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            shared_worker: RefCell::new(None),
            worker_disposed: Rc::new(Cell::new(false)),
        }
    }
}

impl RpcTarget for Registry {
    fn call(&self, method: &str, _args: Vec<Value>) -> Promise<Value, RpcError> {
        match method {
            "spawn_worker" => {
                let worker = Worker::new(self.worker_disposed.clone());
                Promise::ok(Value::Stub(RpcStub::new(TargetHook::boxed(Rc::new(
                    worker,
                )))))
            }
            "get_worker" => {
                let mut slot = self.shared_worker.borrow_mut();
                let stub = slot.get_or_insert_with(|| {
                    RpcStub::new(TargetHook::boxed(Rc::new(Worker::new(
                        self.worker_disposed.clone(),
                    ))))
                });
                Promise::ok(Value::Stub(stub.clone()))
            }
            _ => Promise::err(RpcError::not_found(format!("Method {method} not found"))),
        }
    }

    fn get_property(&self, property: &str) -> Promise<Value, RpcError> {
        Promise::err(RpcError::not_found(format!(
            "property {property} not found"
        )))
    }
}

pub struct UserSession {
    name: String,
}

impl RpcTarget for UserSession {
    fn call(&self, method: &str, _args: Vec<Value>) -> Promise<Value, RpcError> {
        match method {
            "getUserProfile" => Promise::ok(object(vec![
                ("id", Value::from(42i64)),
                ("name", Value::from(self.name.as_str())),
                ("bio", Value::from("works in mysterious ways")),
            ])),
            _ => Promise::err(RpcError::not_found(format!("Method {method} not found"))),
        }
    }

    fn get_property(&self, property: &str) -> Promise<Value, RpcError> {
        match property {
            "name" => Promise::ok(Value::from(self.name.as_str())),
            _ => Promise::err(RpcError::not_found(format!(
                "property {property} not found"
            ))),
        }
    }
}

/// Main capability whose `authenticate` returns a per-user capability,
/// exercising pipelining against a not-yet-resolved result.
pub struct AuthService;

impl RpcTarget for AuthService {
    fn call(&self, method: &str, args: Vec<Value>) -> Promise<Value, RpcError> {
        match method {
            "authenticate" => Promise::from_result(arg_str(&args, 0).and_then(|token| {
                if token == "tok-123" {
                    Ok(Value::Stub(RpcStub::new(TargetHook::boxed(Rc::new(
                        UserSession {
                            name: "alice".into(),
                        },
                    )))))
                } else {
                    Err(RpcError::permission_denied("bad token"))
                }
            })),
            _ => Promise::err(RpcError::not_found(format!("Method {method} not found"))),
        }
    }

    fn get_property(&self, property: &str) -> Promise<Value, RpcError> {
        Promise::err(RpcError::not_found(format!(
            "property {property} not found"
        )))
    }
}

/// Exposes a `users` collection for remap tests.
pub struct Directory;

impl RpcTarget for Directory {
    fn call(&self, method: &str, _args: Vec<Value>) -> Promise<Value, RpcError> {
        Promise::err(RpcError::not_found(format!("Method {method} not found")))
    }

    fn get_property(&self, property: &str) -> Promise<Value, RpcError> {
        match property {
            "users" => Promise::ok(Value::Array(vec![
                object(vec![("id", Value::from(1i64)), ("name", Value::from("a"))]),
                object(vec![("id", Value::from(2i64)), ("name", Value::from("b"))]),
                object(vec![("id", Value::from(3i64)), ("name", Value::from("c"))]),
            ])),
            _ => Promise::err(RpcError::not_found(format!(
                "property {property} not found"
            ))),
        }
    }
}

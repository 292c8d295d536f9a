//! The connecting side of a session.
//!
//! The client owns a transport and a session, and implements the session's
//! dispatcher: an operation on a remote capability becomes a `push` of a
//! pipeline expression plus a `pull` of the batch-local result, sent as one
//! batch. Inbound traffic on stateful transports is symmetric: the peer may
//! push calls against capabilities this side has exported.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use capnweb::ids::{ExportId, ImportId};
use capnweb::wire::{
    parse_batch, serialize_batch, CaptureRef, Expression, Message, PropertyKey, WirePipeline,
    WireRemap,
};
use capnweb::RpcError;

use crate::batch::PipelineBatch;
use crate::broken::ErrorHook;
use crate::capability::{RpcStub, RpcTarget};
use crate::evaluator::{evaluate_push, BatchImports};
use crate::hooks::StubHook;
use crate::local::{PayloadHook, TargetHook};
use crate::parser::Parser;
use crate::payload::RpcPayload;
use crate::promise::Promise;
use crate::serializer::Serializer;
use crate::session::{Dispatcher, RpcSession};
use crate::transport::Transport;
use crate::value::Value;

/// Materializes a wire expression carried by `reject`/`abort` as an error.
pub(crate) fn error_from_expression(expr: &Expression) -> RpcError {
    match expr {
        Expression::Error(wire_error) => wire_error.to_error(),
        other => RpcError::internal(format!("peer sent malformed error: {:?}", other.to_json())),
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// A connected RPC client.
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    session: RpcSession,
    transport: Box<dyn Transport>,
    /// Results of the peer's pushes, keyed by their per-connection
    /// sequential IDs (stateful transports only).
    peer_imports: RefCell<BatchImports>,
    next_peer_push_id: Cell<i64>,
    self_ref: RefCell<Weak<ClientInner>>,
}

impl Client {
    pub fn new(config: ClientConfig, transport: Box<dyn Transport>) -> Self {
        let session = RpcSession::new();
        let inner = Rc::new(ClientInner {
            config,
            session: session.clone(),
            transport,
            peer_imports: RefCell::new(HashMap::new()),
            next_peer_push_id: Cell::new(1),
            self_ref: RefCell::new(Weak::new()),
        });
        *inner.self_ref.borrow_mut() = Rc::downgrade(&inner);
        let dispatcher: Rc<dyn Dispatcher> = inner.clone();
        session.set_dispatcher(Rc::downgrade(&dispatcher));
        Self { inner }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &RpcSession {
        &self.inner.session
    }

    /// One pipelined call in its own round trip: push + pull, await the
    /// resolution.
    pub async fn call(
        &self,
        target: i64,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let args_expr = {
            let mut payload = RpcPayload::from_app_params(Value::Array(args));
            Serializer::new(&self.inner.session).serialize_payload(&mut payload)
        };
        let messages = vec![
            Message::Push(Expression::Pipeline(WirePipeline {
                target,
                path: Some(vec![method.into()]),
                args: Some(Box::new(args_expr)),
            })),
            // A batch's sole push takes ID 1 on the server.
            Message::Pull(ImportId(1)),
        ];
        let response = self.exchange(messages).await?;
        self.extract_result(response, 1)
    }

    /// Starts an explicit pipeline batch; see [`PipelineBatch`].
    pub fn pipeline(&self) -> PipelineBatch {
        PipelineBatch::new(self.clone())
    }

    /// A stub for a capability the peer exports at a known ID (0 is the
    /// main capability).
    pub fn get_remote_stub(&self, export_id: i64) -> RpcStub {
        let hook = self.inner.session.import_capability(export_id);
        RpcStub::with_session(hook, self.inner.session.downgrade())
    }

    /// Exports a local target so it can be passed to the peer as an
    /// argument and called back.
    pub fn create_stub(&self, target: Rc<dyn RpcTarget>) -> RpcStub {
        let hook = TargetHook::boxed(target);
        self.inner.session.export_capability(&*hook);
        RpcStub::with_session(hook, self.inner.session.downgrade())
    }

    pub async fn close(&self) {
        let _ = self.inner.transport.close().await;
    }

    /// Sends one batch (prefixed by any queued releases) and parses the
    /// response batch, bounded by the configured timeout.
    pub(crate) async fn exchange(
        &self,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, RpcError> {
        self.inner.exchange(messages).await
    }

    fn extract_result(&self, messages: Vec<Message>, id: i64) -> Result<Value, RpcError> {
        for msg in messages {
            match msg {
                Message::Resolve(export_id, expr) if export_id.0 == id => {
                    return Ok(Parser::new(&self.inner.session).parse(&expr).into_value());
                }
                Message::Reject(export_id, expr) if export_id.0 == id => {
                    return Err(error_from_expression(&expr));
                }
                Message::Abort(expr) => {
                    let error = error_from_expression(&expr);
                    self.inner.session.abort(error.clone());
                    return Err(error);
                }
                _ => {}
            }
        }
        Err(RpcError::internal("no response for call"))
    }

    /// Processes one inbound batch from a stateful transport. Handles
    /// settlements of our outstanding promises and, symmetrically, the
    /// peer's pushes and pulls against our exports. Returns the response
    /// batch to send back, if any.
    pub async fn handle_incoming(&self, data: &str) -> Result<Option<String>, RpcError> {
        let session = &self.inner.session;
        let messages = match parse_batch(data) {
            Ok(messages) => messages,
            Err(e) => {
                session.abort(e.clone());
                return Err(e);
            }
        };
        let mut responses = Vec::new();
        for msg in messages {
            match msg {
                Message::Push(expr) => {
                    let id = self.inner.next_peer_push_id.get();
                    self.inner.next_peer_push_id.set(id + 1);
                    let hook = {
                        let imports = self.inner.peer_imports.borrow();
                        evaluate_push(session, expr, &imports)
                    };
                    self.inner.peer_imports.borrow_mut().insert(id, hook);
                }
                Message::Pull(id) => {
                    let hook = {
                        self.inner
                            .peer_imports
                            .borrow()
                            .get(&id.0)
                            .map(|h| h.add_ref())
                    }
                    .or_else(|| session.export_hook(id.0));
                    match hook {
                        None => {
                            let error =
                                RpcError::not_found(format!("import {} not found", id.0));
                            responses.push(Message::Reject(
                                ExportId(id.0),
                                Expression::Error(Serializer::new(session).wire_error(&error)),
                            ));
                        }
                        Some(hook) => {
                            let pulled = hook.pull().await;
                            hook.dispose();
                            match pulled {
                                Ok(mut payload) => responses.push(Message::Resolve(
                                    ExportId(id.0),
                                    Serializer::new(session).serialize_payload(&mut payload),
                                )),
                                Err(e) => responses.push(Message::Reject(
                                    ExportId(id.0),
                                    Expression::Error(Serializer::new(session).wire_error(&e)),
                                )),
                            }
                        }
                    }
                }
                Message::Resolve(id, expr) => {
                    let payload = Parser::new(session).parse(&expr);
                    session.resolve_promise(id.0, PayloadHook::boxed(payload));
                }
                Message::Reject(id, expr) => {
                    session.reject_promise(id.0, error_from_expression(&expr));
                }
                Message::Release(id, count) => session.release_export(id.0, count),
                Message::Abort(expr) => {
                    let error = error_from_expression(&expr);
                    session.abort(error.clone());
                    return Err(error);
                }
            }
        }
        Ok(if responses.is_empty() {
            None
        } else {
            Some(serialize_batch(&responses))
        })
    }

    /// Drives a stateful transport: receives batches and answers them until
    /// the transport closes or the session aborts.
    pub async fn listen(&self) -> Result<(), RpcError> {
        loop {
            let bytes = self.inner.transport.receive().await?;
            let text = String::from_utf8(bytes)
                .map_err(|e| RpcError::internal(format!("invalid UTF-8 in batch: {e}")))?;
            if let Some(response) = self.handle_incoming(&text).await? {
                self.inner.transport.send(response.into_bytes()).await?;
            }
        }
    }
}

impl ClientInner {
    async fn exchange(&self, messages: Vec<Message>) -> Result<Vec<Message>, RpcError> {
        if let Some(e) = self.session.aborted() {
            return Err(e);
        }
        let mut all: Vec<Message> = self
            .session
            .take_pending_releases()
            .into_iter()
            .map(|(id, count)| Message::Release(ImportId(id), count))
            .collect();
        all.extend(messages);
        let body = serialize_batch(&all);
        tracing::debug!(bytes = body.len(), "sending batch");
        let exchange = self.transport.send_and_receive(body.into_bytes());
        let bytes = tokio::time::timeout(self.config.timeout, exchange)
            .await
            .map_err(|_| RpcError::internal("request timed out"))??;
        let text = String::from_utf8(bytes)
            .map_err(|e| RpcError::internal(format!("invalid UTF-8 in batch: {e}")))?;
        parse_batch(&text)
    }

    fn upgrade(&self) -> Option<Rc<Self>> {
        self.self_ref.borrow().upgrade()
    }

    /// Ships a single-push batch and settles the pre-registered result
    /// promise from the response. Rejections settle the promise with a
    /// broken hook so the error keeps chaining like a capability.
    fn dispatch_push(&self, push: Message, result_import_id: i64) {
        let Some(this) = self.upgrade() else {
            self.session
                .reject_promise(result_import_id, RpcError::internal("client is gone"));
            return;
        };
        tokio::task::spawn_local(async move {
            let result = this
                .exchange(vec![push, Message::Pull(ImportId(1))])
                .await;
            match result {
                Ok(messages) => {
                    let mut settled = false;
                    for msg in messages {
                        match msg {
                            Message::Resolve(id, expr) if id.0 == 1 => {
                                let payload = Parser::new(&this.session).parse(&expr);
                                this.session
                                    .resolve_promise(result_import_id, PayloadHook::boxed(payload));
                                settled = true;
                            }
                            Message::Reject(id, expr) if id.0 == 1 => {
                                this.session.resolve_promise(
                                    result_import_id,
                                    ErrorHook::boxed(error_from_expression(&expr)),
                                );
                                settled = true;
                            }
                            Message::Abort(expr) => {
                                this.session.abort(error_from_expression(&expr));
                                return;
                            }
                            _ => {}
                        }
                    }
                    if !settled {
                        this.session.reject_promise(
                            result_import_id,
                            RpcError::internal("no response for pipelined call"),
                        );
                    }
                }
                Err(e) => this.session.reject_promise(result_import_id, e),
            }
        });
    }
}

impl Dispatcher for ClientInner {
    fn pipeline_call(
        &self,
        target: i64,
        path: Vec<PropertyKey>,
        args: Option<RpcPayload>,
        result_import_id: i64,
    ) {
        let args_expr = args.map(|mut payload| {
            Serializer::new(&self.session).serialize_payload(&mut payload)
        });
        let push = Message::Push(Expression::Pipeline(WirePipeline {
            target,
            path: if path.is_empty() { None } else { Some(path) },
            args: args_expr.map(Box::new),
        }));
        self.dispatch_push(push, result_import_id);
    }

    fn remap_call(
        &self,
        target: i64,
        path: Vec<PropertyKey>,
        captures: Vec<Box<dyn StubHook>>,
        instructions: Vec<Expression>,
        result_import_id: i64,
    ) {
        let mut wire_captures = Vec::with_capacity(captures.len());
        for hook in captures {
            // A capability we already import can be referred to by the ID
            // the peer knows; anything else is exported fresh.
            match self.session.find_import_id(&*hook) {
                Some(id) => wire_captures.push(CaptureRef::Import(id)),
                None => {
                    wire_captures.push(CaptureRef::Export(self.session.export_capability(&*hook)))
                }
            }
            hook.dispose();
        }
        let push = Message::Push(Expression::Remap(WireRemap {
            target,
            path: if path.is_empty() { None } else { Some(path) },
            captures: wire_captures,
            instructions,
        }));
        self.dispatch_push(push, result_import_id);
    }

    fn pull_import(&self, import_id: i64) -> Promise<RpcPayload, RpcError> {
        let Some(this) = self.upgrade() else {
            return Promise::err(RpcError::internal("client is gone"));
        };
        Promise::from_future(async move {
            let response = this.exchange(vec![Message::Pull(ImportId(import_id))]).await?;
            for msg in response {
                match msg {
                    Message::Resolve(id, expr) if id.0 == import_id => {
                        return Ok(Parser::new(&this.session).parse(&expr));
                    }
                    Message::Reject(id, expr) if id.0 == import_id => {
                        return Err(error_from_expression(&expr));
                    }
                    Message::Abort(expr) => {
                        let error = error_from_expression(&expr);
                        this.session.abort(error.clone());
                        return Err(error);
                    }
                    _ => {}
                }
            }
            Err(RpcError::internal("no response for pull"))
        })
    }

    fn flush_releases(&self) {
        let Some(this) = self.upgrade() else {
            return;
        };
        tokio::task::spawn_local(async move {
            let releases = this.session.take_pending_releases();
            if releases.is_empty() {
                return;
            }
            let messages: Vec<Message> = releases
                .into_iter()
                .map(|(id, count)| Message::Release(ImportId(id), count))
                .collect();
            let body = serialize_batch(&messages);
            // Best-effort: a failed release only delays the peer's cleanup.
            let _ = this.transport.send_and_receive(body.into_bytes()).await;
        });
    }
}

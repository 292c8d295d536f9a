//! The accepting side of a session.
//!
//! The server's heart is [`Server::handle_batch`]: it numbers the batch's
//! pushes sequentially from 1 into a batch-local import table, evaluates
//! each pushed expression, answers pulls by awaiting and serializing the
//! stored hooks, and applies releases to the export table. Transports feed
//! it whole batches; an in-process transport is provided for wiring a
//! client directly to a server, byte-framed exactly like the HTTP batch
//! endpoint.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use capnweb::ids::ExportId;
use capnweb::wire::{parse_batch, serialize_batch, Expression, Message};
use capnweb::RpcError;
use serde_json::Value as JsonValue;

use crate::capability::RpcTarget;
use crate::client::error_from_expression;
use crate::evaluator::{evaluate_push, BatchImports};
use crate::local::PayloadHook;
use crate::parser::Parser;
use crate::promise::Promise;
use crate::resume::{ResumeToken, ResumeTokenManager};
use crate::serializer::Serializer;
use crate::session::RpcSession;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for a network front end; unused by the in-process
    /// batch handler itself.
    pub host: String,
    pub port: u16,
    /// Inbound batches with more messages than this abort the session.
    pub max_batch_size: usize,
    /// Whether outbound error expressions carry the stack slot.
    pub include_stack_traces: bool,
    /// Default TTL for resume tokens.
    pub resume_token_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            max_batch_size: 100,
            include_stack_traces: false,
            resume_token_ttl: Duration::from_secs(3600),
        }
    }
}

/// A server-side session endpoint.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    session: RpcSession,
    resume: RefCell<ResumeTokenManager>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let session = RpcSession::new();
        session.set_include_stack_traces(config.include_stack_traces);
        let resume = RefCell::new(ResumeTokenManager::new(config.resume_token_ttl));
        Self {
            inner: Rc::new(ServerInner {
                config,
                session,
                resume,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &RpcSession {
        &self.inner.session
    }

    /// Registers a capability at a fixed export ID. ID 0 is the main
    /// capability and should be registered before serving.
    pub fn register_capability(&self, export_id: i64, target: Rc<dyn RpcTarget>) {
        self.inner
            .session
            .register_target(ExportId(export_id), target);
    }

    /// Processes one inbound batch and returns the response batch (empty
    /// string when there is nothing to say).
    pub async fn handle_batch(&self, body: &str) -> String {
        let session = &self.inner.session;
        let messages = match parse_batch(body) {
            Ok(messages) => messages,
            // Includes unknown top-level message tags: protocol violation,
            // fatal to the session.
            Err(e) => return self.abort_with(e),
        };
        if messages.len() > self.inner.config.max_batch_size {
            return self.abort_with(RpcError::bad_request(format!(
                "batch size {} exceeds maximum {}",
                messages.len(),
                self.inner.config.max_batch_size
            )));
        }

        let mut batch_imports: BatchImports = BatchImports::new();
        let mut next_push_id = 1i64;
        let mut responses: Vec<Message> = Vec::new();

        for msg in messages {
            match msg {
                Message::Push(expr) => {
                    // The n-th push of a batch implicitly takes ID n.
                    let id = next_push_id;
                    next_push_id += 1;
                    let hook = evaluate_push(session, expr, &batch_imports);
                    batch_imports.insert(id, hook);
                }
                Message::Pull(id) => {
                    let hook = batch_imports
                        .get(&id.0)
                        .map(|h| h.add_ref())
                        // Not a batch-local push: fall back to the
                        // long-lived export table (e.g. pulling the main
                        // capability's value directly).
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
                                Err(e) => {
                                    tracing::debug!(id = id.0, error = %e, "pull rejected");
                                    responses.push(Message::Reject(
                                        ExportId(id.0),
                                        Expression::Error(
                                            Serializer::new(session).wire_error(&e),
                                        ),
                                    ));
                                }
                            }
                        }
                    }
                }
                Message::Release(id, count) => session.release_export(id.0, count),
                Message::Resolve(id, expr) => {
                    let payload = Parser::new(session).parse(&expr);
                    session.resolve_promise(id.0, PayloadHook::boxed(payload));
                }
                Message::Reject(id, expr) => {
                    session.reject_promise(id.0, error_from_expression(&expr));
                }
                Message::Abort(expr) => {
                    session.abort(error_from_expression(&expr));
                    break;
                }
            }
        }

        // Anything pushed but never pulled is canceled with the batch.
        for (_, hook) in batch_imports {
            hook.dispose();
        }
        serialize_batch(&responses)
    }

    fn abort_with(&self, error: RpcError) -> String {
        self.inner.session.abort(error.clone());
        let expr = Expression::Error(Serializer::new(&self.inner.session).wire_error(&error));
        serialize_batch(&[Message::Abort(expr)])
    }

    /// Snapshots the current session's table identities into a resume
    /// token; the session can be reattached later in the same process.
    pub fn create_resume_token(
        &self,
        metadata: Option<JsonValue>,
        ttl: Option<Duration>,
    ) -> ResumeToken {
        let snapshot = self.inner.session.snapshot();
        self.inner
            .resume
            .borrow_mut()
            .create_token(snapshot, ttl, metadata)
    }

    /// Re-materializes the session tables from a token. Returns false when
    /// the token is expired, unknown, or invalid.
    pub fn restore_from_token(&self, token: &ResumeToken) -> bool {
        let restored = {
            let mut resume = self.inner.resume.borrow_mut();
            resume.restore_session(token)
        };
        match restored {
            Some(snapshot) => {
                self.inner.session.restore(snapshot);
                true
            }
            None => false,
        }
    }

    pub fn invalidate_resume_token(&self, session_id: &str) {
        self.inner.resume.borrow_mut().invalidate(session_id);
    }

    pub fn cleanup_expired_tokens(&self) -> usize {
        self.inner.resume.borrow_mut().cleanup_expired()
    }

    /// An in-process transport speaking the stateless batch contract
    /// against this server: each `send_and_receive` is one request.
    pub fn local_transport(&self) -> LocalBatchTransport {
        LocalBatchTransport {
            server: self.clone(),
        }
    }
}

/// In-process equivalent of the HTTP batch endpoint.
pub struct LocalBatchTransport {
    server: Server,
}

impl Transport for LocalBatchTransport {
    fn send(&self, data: Vec<u8>) -> Promise<(), RpcError> {
        let server = self.server.clone();
        Promise::from_future(async move {
            let text = String::from_utf8(data)
                .map_err(|e| RpcError::internal(format!("invalid UTF-8 in batch: {e}")))?;
            let _ = server.handle_batch(&text).await;
            Ok(())
        })
    }

    fn receive(&self) -> Promise<Vec<u8>, RpcError> {
        Promise::err(RpcError::internal(
            "batch transport cannot receive without a request",
        ))
    }

    fn send_and_receive(&self, data: Vec<u8>) -> Promise<Vec<u8>, RpcError> {
        let server = self.server.clone();
        Promise::from_future(async move {
            let text = String::from_utf8(data)
                .map_err(|e| RpcError::internal(format!("invalid UTF-8 in batch: {e}")))?;
            Ok(server.handle_batch(&text).await.into_bytes())
        })
    }

    fn close(&self) -> Promise<(), RpcError> {
        Promise::ok(())
    }
}

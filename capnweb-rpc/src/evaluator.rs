//! Evaluation of pushed expressions on the receiving side.
//!
//! A `pipeline` targets either the result of an earlier push in the same
//! batch (the batch-local import table) or a long-lived entry in the export
//! table, so chained calls in one batch resolve in-process without a round
//! trip per link. Pipeline references inside call arguments resolve the
//! same way and are awaited before the call dispatches. A `remap` runs the
//! recorded per-element transformation. Anything else is plain data and
//! parses into a payload.

use std::collections::HashMap;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;

use capnweb::wire::Expression;
use capnweb::RpcError;

use crate::broken::ErrorHook;
use crate::capability::RpcPromise;
use crate::hooks::StubHook;
use crate::local::PayloadHook;
use crate::map::MapApplicator;
use crate::parser::Parser;
use crate::payload::RpcPayload;
use crate::queued::PromiseHook;
use crate::session::RpcSession;
use crate::value::Value;

/// The per-batch import table: push results keyed by their implicit
/// sequential IDs.
pub(crate) type BatchImports = HashMap<i64, Box<dyn StubHook>>;

/// Resolves a pipeline/remap target: batch-local pushes shadow the
/// session's exports, which cover the well-known main capability and other
/// long-lived IDs.
fn lookup_target(
    session: &RpcSession,
    batch_imports: &BatchImports,
    id: i64,
) -> Option<Box<dyn StubHook>> {
    batch_imports
        .get(&id)
        .map(|hook| hook.add_ref())
        .or_else(|| session.export_hook(id))
}

/// Evaluates one pushed expression to the hook stored under the push's
/// batch-local ID. Failures become broken hooks; the error surfaces when
/// the peer pulls.
pub(crate) fn evaluate_push(
    session: &RpcSession,
    expr: Expression,
    batch_imports: &BatchImports,
) -> Box<dyn StubHook> {
    match expr {
        Expression::Pipeline(pipeline) => {
            let Some(target) = lookup_target(session, batch_imports, pipeline.target) else {
                tracing::warn!(target_id = pipeline.target, "pipeline names unknown capability");
                return ErrorHook::boxed(RpcError::not_found(format!(
                    "capability {} not found",
                    pipeline.target
                )));
            };
            let path = pipeline.path.unwrap_or_default();
            match pipeline.args {
                // No arguments: a deferred property walk.
                None => {
                    let hook = target.get(path);
                    target.dispose();
                    hook
                }
                // Arguments present: resolve pipeline references against
                // this batch, await embedded promises, then dispatch.
                Some(args_expr) => {
                    let args_value = evaluate_arg(session, &args_expr, batch_imports);
                    Box::new(PromiseHook::from_future(async move {
                        let args_value = match resolve_embedded(args_value).await {
                            Ok(v) => v,
                            Err(e) => {
                                target.dispose();
                                return Ok(ErrorHook::boxed(e));
                            }
                        };
                        let result = target.call(path, RpcPayload::owned(args_value)).await;
                        target.dispose();
                        result
                    }))
                }
            }
        }
        Expression::Remap(remap) => {
            let Some(target) = lookup_target(session, batch_imports, remap.target) else {
                return ErrorHook::boxed(RpcError::not_found(format!(
                    "capability {} not found",
                    remap.target
                )));
            };
            match MapApplicator::new(session, &remap.captures, remap.instructions) {
                Ok(applicator) => {
                    let session = session.clone();
                    let path = remap.path.unwrap_or_default();
                    Box::new(PromiseHook::from_future(async move {
                        match applicator.run(target, path, &session).await {
                            Ok(payload) => Ok(PayloadHook::boxed(payload)),
                            Err(e) => Ok(ErrorHook::boxed(e)),
                        }
                    }))
                }
                Err(e) => {
                    target.dispose();
                    ErrorHook::boxed(e)
                }
            }
        }
        other => PayloadHook::boxed(Parser::new(session).parse(&other)),
    }
}

/// Parses a call-argument expression. Unlike ordinary parse input, pipeline
/// (and remap) forms are legal here: they reference earlier results of the
/// same batch and become embedded promises.
fn evaluate_arg(session: &RpcSession, expr: &Expression, batch_imports: &BatchImports) -> Value {
    match expr {
        Expression::Pipeline(_) | Expression::Remap(_) => {
            let hook = evaluate_push(session, expr.clone(), batch_imports);
            Value::Promise(RpcPromise::new(hook))
        }
        Expression::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| evaluate_arg(session, item, batch_imports))
                .collect(),
        ),
        Expression::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), evaluate_arg(session, v, batch_imports)))
                .collect(),
        ),
        other => Parser::new(session).parse_value(other),
    }
}

/// Awaits every promise embedded in a value, replacing it with its
/// resolution, so application targets only ever see settled arguments.
fn resolve_embedded(value: Value) -> LocalBoxFuture<'static, Result<Value, RpcError>> {
    async move {
        match value {
            Value::Promise(promise) => {
                let resolved = promise.pull().await?;
                resolve_embedded(resolved).await
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_embedded(item).await?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = std::collections::BTreeMap::new();
                for (k, v) in map {
                    out.insert(k, resolve_embedded(v).await?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other),
        }
    }
    .boxed_local()
}

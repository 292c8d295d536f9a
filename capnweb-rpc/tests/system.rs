//! End-to-end session behavior over the in-process batch transport.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use capnweb::wire::{parse_batch, Expression, Message};
use capnweb::{ErrorKind, RpcError};
use capnweb_rpc::server::LocalBatchTransport;
use capnweb_rpc::{
    channel_pair, BatchArg, Client, ClientConfig, Promise, ResumeToken, Server, ServerConfig,
    Transport, Value,
};

use common::{run, settle, AuthService, Calculator, Directory, Registry};

fn local_client(server: &Server) -> Client {
    Client::new(
        ClientConfig::new("http://localhost:8080/rpc/batch"),
        Box::new(server.local_transport()),
    )
}

struct CountingTransport {
    inner: LocalBatchTransport,
    count: Rc<Cell<usize>>,
}

impl Transport for CountingTransport {
    fn send(&self, data: Vec<u8>) -> Promise<(), RpcError> {
        self.count.set(self.count.get() + 1);
        self.inner.send(data)
    }

    fn receive(&self) -> Promise<Vec<u8>, RpcError> {
        self.inner.receive()
    }

    fn send_and_receive(&self, data: Vec<u8>) -> Promise<Vec<u8>, RpcError> {
        self.count.set(self.count.get() + 1);
        self.inner.send_and_receive(data)
    }

    fn close(&self) -> Promise<(), RpcError> {
        self.inner.close()
    }
}

struct NeverTransport;

impl Transport for NeverTransport {
    fn send(&self, _data: Vec<u8>) -> Promise<(), RpcError> {
        Promise::ok(())
    }

    fn receive(&self) -> Promise<Vec<u8>, RpcError> {
        Promise::from_future(std::future::pending())
    }

    fn send_and_receive(&self, _data: Vec<u8>) -> Promise<Vec<u8>, RpcError> {
        Promise::from_future(std::future::pending())
    }

    fn close(&self) -> Promise<(), RpcError> {
        Promise::ok(())
    }
}

#[test]
fn basic_call_over_the_wire() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Calculator));
        let response = server
            .handle_batch("[\"push\",[\"pipeline\",0,[\"add\"],[5,3]]]\n[\"pull\",1]\n")
            .await;
        assert_eq!(response, "[\"resolve\",1,8]\n");
    });
}

#[test]
fn unknown_method_rejects_with_not_found() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Calculator));
        let response = server
            .handle_batch("[\"push\",[\"pipeline\",0,[\"frobnicate\"],[]]]\n[\"pull\",1]\n")
            .await;
        assert_eq!(
            response,
            "[\"reject\",1,[\"error\",\"not_found\",\"Method frobnicate not found\"]]\n"
        );
    });
}

#[test]
fn error_propagates_to_the_caller() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Calculator));
        let client = local_client(&server);
        let err = client.call(0, "frobnicate", vec![]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("frobnicate"));
    });
}

#[test]
fn chained_pipeline_resolves_in_one_batch() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(AuthService));
        let batch = concat!(
            "[\"push\",[\"pipeline\",0,[\"authenticate\"],[\"tok-123\"]]]\n",
            "[\"push\",[\"pipeline\",1,[\"getUserProfile\"],[]]]\n",
            "[\"pull\",2]\n",
        );
        let response = server.handle_batch(batch).await;
        let messages = parse_batch(&response).unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::Resolve(id, Expression::Object(profile)) => {
                assert_eq!(id.0, 2);
                assert_eq!(
                    profile.get("name"),
                    Some(&Expression::String("alice".into()))
                );
            }
            other => panic!("unexpected response: {other:?}"),
        }
    });
}

#[test]
fn pipeline_batch_uses_a_single_round_trip() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(AuthService));
        let count = Rc::new(Cell::new(0));
        let client = Client::new(
            ClientConfig::new("http://localhost:8080/rpc/batch"),
            Box::new(CountingTransport {
                inner: server.local_transport(),
                count: count.clone(),
            }),
        );

        let batch = client.pipeline();
        let user = batch.call(0, "authenticate", vec!["tok-123".into()]);
        let profile = user.call("getUserProfile", vec![]);
        let value = profile.pull().await.unwrap();
        match value {
            Value::Object(map) => assert_eq!(map.get("name"), Some(&Value::from("alice"))),
            other => panic!("unexpected profile: {other:?}"),
        }
        assert_eq!(count.get(), 1);
    });
}

#[test]
fn batched_arguments_may_reference_earlier_results() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Calculator));
        let count = Rc::new(Cell::new(0));
        let client = Client::new(
            ClientConfig::new("http://localhost:8080/rpc/batch"),
            Box::new(CountingTransport {
                inner: server.local_transport(),
                count: count.clone(),
            }),
        );

        let batch = client.pipeline();
        let sum = batch.call(0, "add", vec![5i64.into(), 3i64.into()]);
        let echoed = batch.call(0, "echo", vec![BatchArg::from(&sum)]);
        assert_eq!(echoed.pull().await.unwrap(), Value::from(8i64));
        assert_eq!(sum.pull().await.unwrap(), Value::from(8i64));
        assert_eq!(count.get(), 1);
    });
}

#[test]
fn returned_capability_is_addressable_and_released() {
    run(async {
        let server = Server::new(ServerConfig::default());
        let registry = Rc::new(Registry::new());
        server.register_capability(0, registry.clone());
        let client = local_client(&server);

        let worker = match client.call(0, "spawn_worker", vec![]).await.unwrap() {
            Value::Stub(stub) => stub,
            other => panic!("expected a capability, got {other:?}"),
        };
        assert_eq!(server.session().export_count(), 2);

        assert_eq!(
            worker.call("increment", vec![]).pull().await.unwrap(),
            Value::from(1i64)
        );
        // Same server-side object on the second call.
        assert_eq!(
            worker.call("increment", vec![]).pull().await.unwrap(),
            Value::from(2i64)
        );

        drop(worker);
        settle().await;
        assert_eq!(server.session().export_count(), 1);
        assert!(registry.worker_disposed.get());
    });
}

#[test]
fn repeated_introductions_release_with_a_cumulative_count() {
    run(async {
        let server = Server::new(ServerConfig::default());
        let registry = Rc::new(Registry::new());
        server.register_capability(0, registry.clone());
        let client = local_client(&server);

        let mut stubs = Vec::new();
        for _ in 0..3 {
            match client.call(0, "get_worker", vec![]).await.unwrap() {
                Value::Stub(stub) => stubs.push(stub),
                other => panic!("expected a capability, got {other:?}"),
            }
        }
        // One entry on each side, introduced three times.
        assert_eq!(client.session().import_count(), 1);
        assert_eq!(client.session().import_introductions(1), Some(3));
        assert_eq!(server.session().export_introductions(1), Some(3));

        stubs.pop();
        stubs.pop();
        settle().await;
        assert!(server.session().contains_export(1));

        stubs.pop();
        settle().await;
        assert!(!server.session().contains_export(1));
        // The registry still owns its worker; only the wire references died.
        assert!(!registry.worker_disposed.get());
    });
}

#[test]
fn remap_extracts_one_field_per_element() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Directory));
        let client = local_client(&server);

        let stub = client.get_remote_stub(0);
        let ids = stub.get("users").map(|user| user.get("id"));
        assert_eq!(
            ids.pull().await.unwrap(),
            Value::Array(vec![
                Value::from(1i64),
                Value::from(2i64),
                Value::from(3i64)
            ])
        );
    });
}

#[test]
fn remap_wire_form_executes_per_element() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Directory));
        let batch = concat!(
            "[\"push\",[\"remap\",0,[\"users\"],[],[[\"pipeline\",0,[\"id\"]],1]]]\n",
            "[\"pull\",1]\n",
        );
        let response = server.handle_batch(batch).await;
        assert_eq!(response, "[\"resolve\",1,[1,2,3]]\n");
    });
}

#[test]
fn remap_fails_fast_on_the_first_bad_element() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Directory));
        let client = local_client(&server);

        let stub = client.get_remote_stub(0);
        let missing = stub.get("users").map(|user| user.get("salary"));
        let err = missing.pull().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    });
}

#[test]
fn oversized_batch_aborts_the_session() {
    run(async {
        let config = ServerConfig {
            max_batch_size: 2,
            ..ServerConfig::default()
        };
        let server = Server::new(config);
        server.register_capability(0, Rc::new(Calculator));
        let response = server
            .handle_batch("[\"pull\",1]\n[\"pull\",2]\n[\"pull\",3]\n")
            .await;
        let messages = parse_batch(&response).unwrap();
        assert!(matches!(messages[0], Message::Abort(_)));
        assert!(server.session().aborted().is_some());
    });
}

#[test]
fn unknown_message_tag_aborts_the_session() {
    run(async {
        let server = Server::new(ServerConfig::default());
        let response = server.handle_batch("[\"frobnicate\",1]\n").await;
        let messages = parse_batch(&response).unwrap();
        assert!(matches!(messages[0], Message::Abort(_)));
        assert!(server.session().aborted().is_some());
    });
}

#[test]
fn rejections_carry_a_stack_only_when_configured() {
    run(async {
        let quiet = Server::new(ServerConfig::default());
        quiet.register_capability(0, Rc::new(Calculator));
        let response = quiet
            .handle_batch("[\"push\",[\"pipeline\",0,[\"fail\"],[]]]\n[\"pull\",1]\n")
            .await;
        match &parse_batch(&response).unwrap()[0] {
            Message::Reject(_, Expression::Error(e)) => assert!(e.stack.is_none()),
            other => panic!("unexpected response: {other:?}"),
        }

        let chatty = Server::new(ServerConfig {
            include_stack_traces: true,
            ..ServerConfig::default()
        });
        chatty.register_capability(0, Rc::new(Calculator));
        let response = chatty
            .handle_batch("[\"push\",[\"pipeline\",0,[\"fail\"],[]]]\n[\"pull\",1]\n")
            .await;
        match &parse_batch(&response).unwrap()[0] {
            Message::Reject(_, Expression::Error(e)) => assert!(e.stack.is_some()),
            other => panic!("unexpected response: {other:?}"),
        }
    });
}

#[test]
fn resume_token_lifecycle() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Calculator));

        let token = server.create_resume_token(Some(serde_json::json!({"user": "alice"})), None);
        assert!(token.is_valid());

        // Round trip through the serialized form.
        let reparsed = ResumeToken::from_json(&token.to_json()).unwrap();
        assert!(server.restore_from_token(&reparsed));
        assert!(server.session().contains_export(0));

        server.invalidate_resume_token(&token.session_id);
        assert!(!server.restore_from_token(&token));

        // A token with no remaining lifetime stops restoring.
        let short = server.create_resume_token(None, Some(Duration::from_secs(0)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(short.is_expired());
        assert!(!server.restore_from_token(&short));
        assert_eq!(server.cleanup_expired_tokens(), 1);
    });
}

#[test]
fn client_answers_peer_pushes_against_its_exports() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Calculator));
        let client = local_client(&server);
        let stub = client.create_stub(Rc::new(Calculator));

        // What a stateful peer would send to invoke the client-side export.
        let inbound = "[\"push\",[\"pipeline\",1,[\"add\"],[2,2]]]\n[\"pull\",1]\n";
        let response = client.handle_incoming(inbound).await.unwrap().unwrap();
        assert_eq!(response, "[\"resolve\",1,4]\n");
        drop(stub);
    });
}

#[test]
fn listen_answers_pushes_over_a_duplex_transport() {
    run(async {
        let (client_end, peer_end) = channel_pair();
        let client = Client::new(
            ClientConfig::new("ws://localhost:8080/rpc/ws"),
            Box::new(client_end),
        );
        let _stub = client.create_stub(Rc::new(Calculator));
        let listener = client.clone();
        tokio::task::spawn_local(async move {
            let _ = listener.listen().await;
        });

        peer_end
            .send(b"[\"push\",[\"pipeline\",1,[\"add\"],[20,22]]]\n[\"pull\",1]\n".to_vec())
            .await
            .unwrap();
        let response = peer_end.receive().await.unwrap();
        assert_eq!(String::from_utf8(response).unwrap(), "[\"resolve\",1,42]\n");
    });
}

#[test]
fn timed_out_exchange_becomes_an_internal_error() {
    run(async {
        let client = Client::new(
            ClientConfig {
                url: "http://localhost:8080/rpc/batch".into(),
                timeout: Duration::from_millis(25),
            },
            Box::new(NeverTransport),
        );
        let err = client.call(0, "anything", vec![]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("timed out"));
    });
}

#[test]
fn dates_survive_the_round_trip() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Calculator));
        let client = local_client(&server);
        let stamp = Value::Date(1700000000000.0);
        assert_eq!(client.call(0, "echo", vec![stamp.clone()]).await.unwrap(), stamp);
    });
}

#[test]
fn tag_colliding_arrays_survive_the_round_trip() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Calculator));
        let client = local_client(&server);
        // A plain array that happens to start with a reserved tag string
        // must come back as data, not as a tagged form.
        let literal = Value::Array(vec![Value::from("error"), Value::from("just a word")]);
        assert_eq!(
            client.call(0, "echo", vec![literal.clone()]).await.unwrap(),
            literal
        );
    });
}

#[test]
fn error_data_crosses_the_wire() {
    run(async {
        let server = Server::new(ServerConfig::default());
        server.register_capability(0, Rc::new(Calculator));
        let client = local_client(&server);
        let err = client.call(0, "fail", vec![]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert_eq!(err.data, Some(serde_json::json!({"reason": "policy"})));
    });
}

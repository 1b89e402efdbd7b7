//! Integration tests for bidirectional sessions.
//!
//! Both ends of every session run in this process, connected by an
//! in-memory pipe.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use vipnode_jsonrpc::{
    call_typed, pipe, CallContext, Context, Dispatcher, Loopback, Methods, RpcError, Service,
    Session, SessionConfig,
};

fn dispatcher(prefix: &str, methods: Methods) -> Arc<Dispatcher> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(prefix, methods).unwrap();
    Arc::new(dispatcher)
}

fn bar_methods() -> Methods {
    Methods::new()
        .add("pong", |_cx, (): ()| async { Ok::<_, RpcError>("pong") })
        .add("add", |_cx, (a, b): (i64, i64)| async move {
            Ok::<_, RpcError>(a + b)
        })
        .add("fail", |_cx, (reason,): (String,)| async move {
            Err::<(), _>(RpcError::remote(-32005, reason))
        })
        .add("nothing", |_cx, (): ()| async { Ok::<_, RpcError>(()) })
}

/// Start a connected pair of sessions.
fn connect(server: Arc<Dispatcher>, client: Arc<Dispatcher>) -> (Session, Session) {
    let (a, b) = pipe();
    let server = Session::start(b, server, SessionConfig::default());
    let client = Session::start(a, client, SessionConfig::default());
    (server, client)
}

#[tokio::test]
async fn test_results_match_call_ids_under_concurrency() {
    let (_server, client) = connect(dispatcher("bar", bar_methods()), Arc::new(Dispatcher::new()));

    let mut tasks = Vec::new();
    for i in 0..20i64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let sum: i64 = call_typed(&client, &Context::background(), "bar_add", (i, 1000))
                .await
                .unwrap();
            (i, sum)
        }));
    }
    for task in tasks {
        let (i, sum) = task.await.unwrap();
        assert_eq!(sum, i + 1000);
    }
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn test_handler_calls_back_into_its_caller() {
    // The client exposes `client_name`; the server's `whoami` calls it over
    // the same connection while handling the client's call.
    let server_methods = Methods::new().add("whoami", |cx: CallContext, (): ()| async move {
        let caller = cx.service();
        let name: String = call_typed(caller.as_ref(), cx.context(), "client_name", ()).await?;
        Ok::<_, RpcError>(format!("you are {}", name))
    });
    let client_methods =
        Methods::new().add("name", |_cx, (): ()| async { Ok::<_, RpcError>("alice") });

    let (_server, client) = connect(
        dispatcher("server", server_methods),
        dispatcher("client", client_methods),
    );

    let reply: String = call_typed(&client, &Context::background(), "server_whoami", ())
        .await
        .unwrap();
    assert_eq!(reply, "you are alice");
}

#[tokio::test]
async fn test_loopback_and_session_agree() {
    let dispatcher = dispatcher("bar", bar_methods());
    let loopback = Loopback::new(Arc::clone(&dispatcher));
    let (_server, client) = connect(Arc::clone(&dispatcher), Arc::new(Dispatcher::new()));

    let cases: Vec<(&str, Vec<Value>)> = vec![
        ("bar_pong", vec![]),
        ("bar_add", vec![json!(2), json!(40)]),
        ("bar_add", vec![json!(2)]),
        ("bar_add", vec![json!("two"), json!(40)]),
        ("bar_fail", vec![json!("nope")]),
        ("bar_nothing", vec![]),
        ("bar_missing", vec![]),
        ("missing_pong", vec![]),
    ];

    let ctx = Context::background();
    for (method, params) in cases {
        let local = loopback.call(&ctx, method, params.clone()).await;
        let remote = client.call(&ctx, method, params).await;
        match (local, remote) {
            (Ok(a), Ok(b)) => assert_eq!(
                serde_json::to_vec(&a).unwrap(),
                serde_json::to_vec(&b).unwrap(),
                "{}",
                method
            ),
            (
                Err(RpcError::Remote { code: c1, message: m1 }),
                Err(RpcError::Remote { code: c2, message: m2 }),
            ) => {
                assert_eq!(c1, c2, "{}", method);
                assert_eq!(m1, m2, "{}", method);
            }
            (a, b) => panic!("{}: loopback {:?} vs session {:?}", method, a, b),
        }
    }
}

#[tokio::test]
async fn test_cancelled_call_unblocks_and_session_survives() {
    let methods = bar_methods().add("sleep", |_cx, (): ()| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, RpcError>(())
    });
    let (_server, client) = connect(dispatcher("bar", methods), Arc::new(Dispatcher::new()));

    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let err = client.call(&ctx, "bar_sleep", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Cancelled));
    assert_eq!(client.pending_len(), 0);

    let pong = client
        .call(&Context::background(), "bar_pong", vec![])
        .await
        .unwrap();
    assert_eq!(pong, json!("pong"));
}

#[tokio::test]
async fn test_backpressure_discards_oldest_without_deadlock() {
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let methods = {
        let gate = Arc::clone(&gate);
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        bar_methods().add("wait", move |_cx, (i,): (u64,)| {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                let _permit = gate.acquire().await.map_err(|_| RpcError::Closed)?;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RpcError>(i)
            }
        })
    };

    let (a, b) = pipe();
    let server = Session::start(
        b,
        dispatcher("bar", methods),
        SessionConfig {
            pending_limit: 3,
            pending_discard: 1,
        },
    );
    let client = Session::start(a, Arc::new(Dispatcher::new()), SessionConfig::unbounded());

    // Send four calls one at a time so their arrival order is known.
    let mut calls = Vec::new();
    for i in 0..4u64 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let ctx = Context::background().with_timeout(Duration::from_secs(2));
            call_typed::<_, _, u64>(&client, &ctx, "bar_wait", (i,)).await
        }));
        while started.load(Ordering::SeqCst) < i as usize + 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    assert_eq!(server.inflight_len(), 3);

    gate.add_permits(10);

    let mut outcomes = Vec::new();
    for call in calls {
        outcomes.push(call.await.unwrap());
    }
    // The oldest call was discarded: its handler was stopped before the
    // gate opened and its caller timed out.
    assert!(matches!(outcomes[0], Err(RpcError::Cancelled)));
    for (i, outcome) in outcomes.iter().enumerate().skip(1) {
        assert_eq!(outcome.as_ref().unwrap(), &(i as u64));
    }
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert_eq!(server.inflight_len(), 0);

    let pong = client
        .call(&Context::background(), "bar_pong", vec![])
        .await
        .unwrap();
    assert_eq!(pong, json!("pong"));
}

#[tokio::test]
async fn test_close_cancels_inbound_handlers() {
    let cancelled = Arc::new(AtomicUsize::new(0));
    let methods = {
        let cancelled = Arc::clone(&cancelled);
        Methods::new().add("hang", move |cx: CallContext, (): ()| {
            let cancelled = Arc::clone(&cancelled);
            async move {
                cx.context().done().await;
                cancelled.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RpcError>(())
            }
        })
    };
    let (server, client) = connect(dispatcher("bar", methods), Arc::new(Dispatcher::new()));

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.call(&Context::background(), "bar_hang", vec![]).await })
    };
    while server.inflight_len() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    server.close().await;
    while cancelled.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The client sees the hangup and fails its pending call.
    assert!(matches!(waiting.await.unwrap(), Err(RpcError::Closed)));
    client.closed().await;
}

#[tokio::test]
async fn test_notification_gets_no_reply() {
    let seen = Arc::new(AtomicUsize::new(0));
    let methods = {
        let seen = Arc::clone(&seen);
        Methods::new().add("tick", move |_cx, (): ()| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RpcError>(())
            }
        })
    };
    let (_server, client) = connect(dispatcher("bar", methods), Arc::new(Dispatcher::new()));

    client.notify("bar_tick", vec![]).await.unwrap();
    while seen.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(client.pending_len(), 0);
}

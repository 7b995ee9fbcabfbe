//! End-to-end handshake and RPC scenarios: a real [`dock_rpc::DockApp`]
//! session driven against [`dock_rpc_testkit::FakeDockHost`] over real local
//! sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use dock_rpc::{DockApp, FakeClock, SessionState};
use dock_rpc_testkit::FakeDockHost;

fn unique_pipe_names(label: &str) -> (String, String) {
    let unique = uuid::Uuid::new_v4();
    (
        format!("dock_rpc_test_dock_{label}_{unique}"),
        format!("dock_rpc_test_app_{label}_{unique}"),
    )
}

/// A successful call, a call to an unbound method, an arity mismatch, and a
/// handler returning an error all round-trip through the wire correctly.
#[tokio::test]
async fn rpc_call_success_and_error_outcomes() {
    let (dock_name, app_name) = unique_pipe_names("rpc_outcomes");
    let host = FakeDockHost::listen(&dock_name).expect("bind dock pipe");

    let mut app = DockApp::builder("app-1", "demo", "a demo app", "icon.png", &app_name)
        .dock_pipe_name(&dock_name)
        .clock(Arc::new(FakeClock::new(1)))
        .build();
    app.bind("add", |a: i64, b: i64| async move { Ok::<i64, String>(a + b) });
    app.bind("divide", |a: f64, b: f64| async move {
        if b == 0.0 {
            Err("division by zero".to_string())
        } else {
            Ok(a / b)
        }
    });

    let app_task = tokio::spawn(async move { app.run().await });

    // The session only writes `register` once it has *both* connected to the
    // dock pipe *and* accepted a peer on its own app pipe, so the host must
    // drive both sides concurrently rather than accepting the register frame
    // before dialing the app pipe.
    let host_clock = FakeClock::new(100);
    let (register, dock_session) = tokio::join!(
        host.accept_register(),
        dock_rpc_testkit::FakeDockSession::handshake(&app_name, &host_clock, "dock-host"),
    );
    let register = register.expect("accept register");
    let mut dock_session = dock_session.expect("handshake");
    assert_eq!(register.info.pipe_name, app_name);
    assert!(register.info.functions.contains("add"));
    assert!(register.info.functions.contains("divide"));
    assert!(register.info.functions.contains("exit"));

    // add(2, 3) -> 5, no error.
    let outcome = dock_session
        .call(&host_clock, "dock-host", "r1", "add", vec![json!(2), json!(3)])
        .await
        .expect("call add");
    match outcome {
        dock_rpc::RpcOutcome::Ok(v) => assert_eq!(v, json!(5)),
        dock_rpc::RpcOutcome::Err { .. } => panic!("expected success"),
    }

    // Unbound method -> 404, message mentions the method name.
    let outcome = dock_session
        .call(&host_clock, "dock-host", "r2", "noSuch", vec![])
        .await
        .expect("call noSuch");
    match outcome {
        dock_rpc::RpcOutcome::Err { code, message, .. } => {
            assert_eq!(code, 404);
            assert!(message.contains("noSuch"));
        }
        dock_rpc::RpcOutcome::Ok(_) => panic!("expected error"),
    }

    // divide with one argument -> 400 arity mismatch.
    let outcome = dock_session
        .call(&host_clock, "dock-host", "r3", "divide", vec![json!(1.0)])
        .await
        .expect("call divide arity");
    match outcome {
        dock_rpc::RpcOutcome::Err { code, .. } => assert_eq!(code, 400),
        dock_rpc::RpcOutcome::Ok(_) => panic!("expected error"),
    }

    // divide by zero -> 500, message mentions "zero".
    let outcome = dock_session
        .call(
            &host_clock,
            "dock-host",
            "r4",
            "divide",
            vec![json!(1.0), json!(0.0)],
        )
        .await
        .expect("call divide by zero");
    match outcome {
        dock_rpc::RpcOutcome::Err { code, message, .. } => {
            assert_eq!(code, 500);
            assert!(message.contains("zero"));
        }
        dock_rpc::RpcOutcome::Ok(_) => panic!("expected error"),
    }

    dock_session.close();
    let result = tokio::time::timeout(Duration::from_secs(5), app_task)
        .await
        .expect("app session must end after app stream closes")
        .expect("join");
    assert!(result.is_ok());
}

/// After the handshake completes, `emit("progress", ...)` produces exactly
/// one `rpc-event` on the app stream.
#[tokio::test]
async fn handshake_then_event_emission() {
    let (dock_name, app_name) = unique_pipe_names("event_emission");
    let host = FakeDockHost::listen(&dock_name).expect("bind dock pipe");

    let mut app = DockApp::builder("app-1", "demo", "a demo app", "icon.png", &app_name)
        .dock_pipe_name(&dock_name)
        .clock(Arc::new(FakeClock::new(1)))
        .build();
    app.declare_event("progress");
    let handle = app.handle();

    let app_task = tokio::spawn(async move { app.run().await });

    let host_clock = FakeClock::new(100);
    let (register, dock_session) = tokio::join!(
        host.accept_register(),
        dock_rpc_testkit::FakeDockSession::handshake(&app_name, &host_clock, "dock-host"),
    );
    let _register = register.expect("accept register");
    let mut dock_session = dock_session.expect("handshake");

    // Poll briefly for Active rather than sleeping a fixed guess: the
    // handshake-complete notification from the app side races this test.
    for _ in 0..50 {
        if handle.is_active() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.state(), SessionState::Active);

    handle.emit("progress", json!({"pct": 50}));

    let (event, data) = dock_session.next_event().await.expect("read rpc-event");
    assert_eq!(event, "progress");
    assert_eq!(data, json!({"pct": 50}));

    dock_session.close();
    tokio::time::timeout(Duration::from_secs(5), app_task)
        .await
        .expect("app session must end after app stream closes")
        .expect("join")
        .expect("session should close without error");
}

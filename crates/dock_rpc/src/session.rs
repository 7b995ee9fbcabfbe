//! Session state machine: the three-step handshake, registration, and
//! teardown sequencing; routes decoded envelopes to the dispatcher once
//! `Active`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::envelope::{AppInfoWire, Envelope, EnvelopeType, Payload, RegisterMsg, RpcOutcome};
use crate::error::DockRpcError;
use crate::stream::{Endpoint, FrameWriter};
use crate::worker_pool::WorkerPool;

/// Bound on envelopes received before `Active` and not yet handshake traffic.
pub const PRE_ACTIVE_BUFFER_CAPACITY: usize = 64;

/// Name of the built-in method whose delivery ends the session. Shared with
/// the app façade so it binds and recognizes the same name.
pub(crate) const EXIT_METHOD_NAME: &str = "exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    DockConnected,
    Registered,
    Handshaking(u8),
    Active,
    Closing,
    Closed,
}

/// A cheap, cloneable window onto a running [`Session`] for the app façade
/// to query connectivity and emit events from a different task than the one
/// driving [`Session::run`].
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<Mutex<SessionState>>,
    app_writer: Arc<Mutex<Option<FrameWriter>>>,
    clock: Arc<dyn Clock>,
    app_id: String,
}

impl SessionHandle {
    /// Builds a handle in the `Initial` state, decoupled from any particular
    /// [`Session`] instance so callers (the app façade, tests) can hold one
    /// before a session has connected anything, a stable handle to emit
    /// from across the lifetime of `run`.
    pub fn new(app_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        SessionHandle {
            state: Arc::new(Mutex::new(SessionState::Initial)),
            app_writer: Arc::new(Mutex::new(None)),
            clock,
            app_id: app_id.into(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), SessionState::Active)
    }

    /// Builds and writes an `rpc-event` if the session is currently `Active`;
    /// otherwise drops silently. Whether `event` was declared is the app
    /// façade's concern, checked before this is called.
    pub fn emit(&self, event: impl Into<String>, data: Value) {
        let writer = self.app_writer.lock().unwrap().clone();
        let Some(writer) = writer else { return };
        let env = Envelope::rpc_event(self.clock.as_ref(), self.app_id.clone(), event, data);
        if let Err(e) = writer.write_frame(env.encode()) {
            tracing::warn!(error = %e, "failed to write rpc-event");
        }
    }
}

struct SessionConfig {
    app_id: String,
    dock_pipe_name: String,
    app_pipe_name: String,
    register_info: AppInfoWire,
}

/// Owns the two stream endpoints and worker pool for one app/dock pairing.
/// `run` consumes the session and drives it to `Closed`; a fresh `Session`
/// is required to connect again, re-entry after `Closed` is not permitted.
pub struct Session {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    workers: WorkerPool,
    handle: SessionHandle,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
}

impl Session {
    pub fn new(
        app_id: impl Into<String>,
        dock_pipe_name: impl Into<String>,
        app_pipe_name: impl Into<String>,
        register_info: AppInfoWire,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<Dispatcher>,
        worker_count: usize,
    ) -> Self {
        let app_id = app_id.into();
        let handle = SessionHandle::new(app_id.clone(), clock.clone());
        Self::with_handle(
            handle,
            app_id,
            dock_pipe_name,
            app_pipe_name,
            register_info,
            clock,
            dispatcher,
            worker_count,
        )
    }

    /// Like [`Session::new`], but reuses an existing [`SessionHandle`] (e.g.
    /// one the façade already handed out to a caller) instead of minting a
    /// fresh one. `handle` must be in the `Initial` state.
    #[allow(clippy::too_many_arguments)]
    pub fn with_handle(
        handle: SessionHandle,
        app_id: impl Into<String>,
        dock_pipe_name: impl Into<String>,
        app_pipe_name: impl Into<String>,
        register_info: AppInfoWire,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<Dispatcher>,
        worker_count: usize,
    ) -> Self {
        let (exit_tx, exit_rx) = watch::channel(false);
        Session {
            config: SessionConfig {
                app_id: app_id.into(),
                dock_pipe_name: dock_pipe_name.into(),
                app_pipe_name: app_pipe_name.into(),
                register_info,
            },
            clock,
            dispatcher,
            workers: WorkerPool::new(worker_count.max(1)),
            handle,
            exit_tx,
            exit_rx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    fn set_state(&self, state: SessionState) {
        tracing::debug!(?state, "session state transition");
        *self.handle.state.lock().unwrap() = state;
    }

    /// Drives the session from `Initial` to `Closed`. Returns the error, if
    /// any, that ended the session (transport/protocol failures are reported
    /// here rather than panicking; per-request failures never reach this far,
    /// they are packaged into `rpc-response`s by workers instead). Returns
    /// once the app stream disconnects or the built-in `exit` method is
    /// invoked and its response has been flushed.
    pub async fn run(mut self) -> Result<(), DockRpcError> {
        let span = tracing::info_span!("session", app_id = %self.config.app_id);
        let _enter = span.enter();

        let outcome = self.drive().await;
        if let Err(ref e) = outcome {
            tracing::warn!(error = %e, "session ending with error");
        }

        *self.handle.app_writer.lock().unwrap() = None;
        self.workers.stop().await;
        Self::send_unregister_best_effort(
            &self.config.dock_pipe_name,
            &self.config.app_id,
            self.clock.as_ref(),
        )
        .await;
        self.set_state(SessionState::Closed);
        tracing::info!("session closed");
        outcome
    }

    /// Reconnects briefly to the dock pipe to send an `unregister` envelope,
    /// matching the wire format's already-defined envelope type. Best-effort:
    /// by the time a session reaches `Closing` the dock may no longer be
    /// listening, which is not itself an error.
    async fn send_unregister_best_effort(dock_pipe_name: &str, app_id: &str, clock: &dyn Clock) {
        match Endpoint::connect(dock_pipe_name, Duration::from_secs(5)).await {
            Ok(dock) => {
                let env = Envelope::unregister(clock, app_id.to_string());
                if let Err(e) = dock.write_frame(env.encode()) {
                    tracing::warn!(error = %e, "failed to write unregister envelope");
                }
                dock.close();
            }
            Err(e) => tracing::debug!(error = %e, "dock unreachable for unregister, skipping"),
        }
    }

    /// Explicit early unregister, usable before or instead of letting `run`
    /// reach `Closing` naturally.
    pub async fn unregister(
        dock_pipe_name: &str,
        app_id: &str,
        clock: &dyn Clock,
    ) -> Result<(), DockRpcError> {
        let dock = Endpoint::connect(dock_pipe_name, Duration::from_secs(5)).await?;
        let env = Envelope::unregister(clock, app_id.to_string());
        dock.write_frame(env.encode())?;
        dock.close();
        Ok(())
    }

    async fn drive(&mut self) -> Result<(), DockRpcError> {
        let dock_name = self.config.dock_pipe_name.clone();
        let app_name = self.config.app_pipe_name.clone();
        let (mut dock, mut app) = tokio::try_join!(
            Endpoint::connect(&dock_name, Duration::from_secs(5)),
            Endpoint::accept_one(&app_name),
        )?;
        self.set_state(SessionState::DockConnected);
        tracing::info!("dock and app streams connected");

        let register_env = Envelope::register(
            self.clock.as_ref(),
            RegisterMsg {
                app_id: self.config.app_id.clone(),
                info: self.config.register_info.clone(),
            },
        );
        dock.write_frame(register_env.encode_register_flat())?;
        self.set_state(SessionState::Registered);
        tracing::info!("register envelope sent on dock stream");

        let mut buffer: VecDeque<Envelope> = VecDeque::new();
        let handshake_result = self.await_handshake(&mut dock, &mut app, &mut buffer).await;
        dock.close();
        if let Err(e) = handshake_result {
            self.set_state(SessionState::Closing);
            app.close();
            return Err(e);
        }
        tracing::info!("handshake complete, dock stream closed");

        *self.handle.app_writer.lock().unwrap() = Some(app.writer());
        self.serve_active(&mut app, buffer).await
    }

    /// Reads the app stream until `Active` is reached, per the state
    /// transition table, while also reading the dock stream so a dock
    /// failure before step 3 is caught by the read itself rather than by a
    /// disconnect signal that can be missed if nothing is waiting on it at
    /// the instant it fires.
    async fn await_handshake(
        &mut self,
        dock: &mut Endpoint,
        app: &mut Endpoint,
        buffer: &mut VecDeque<Envelope>,
    ) -> Result<(), DockRpcError> {
        loop {
            tokio::select! {
                biased;
                dock_frame = dock.read_frame() => {
                    match dock_frame {
                        Ok(line) => tracing::warn!(
                            %line,
                            "ignoring unexpected frame on dock stream before handshake completes"
                        ),
                        Err(_) => return Err(DockRpcError::Disconnected),
                    }
                }
                frame = app.read_frame() => {
                    let line = frame?;
                    let env = Envelope::decode(&line)?;
                    self.handle_pre_active_envelope(env, app, buffer)?;
                    if matches!(self.state(), SessionState::Active) {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn handle_pre_active_envelope(
        &self,
        env: Envelope,
        app: &Endpoint,
        buffer: &mut VecDeque<Envelope>,
    ) -> Result<(), DockRpcError> {
        let state = self.state();
        match (&state, env.kind, &env.payload) {
            (SessionState::Registered, EnvelopeType::Handshake, Payload::Handshake { step: 1 }) => {
                self.set_state(SessionState::Handshaking(1));
                let reply = Envelope::handshake(self.clock.as_ref(), self.config.app_id.clone(), 2);
                app.write_frame(reply.encode())?;
                self.set_state(SessionState::Handshaking(2));
                Ok(())
            }
            (SessionState::Handshaking(2), EnvelopeType::Handshake, Payload::Handshake { step: 3 }) => {
                self.set_state(SessionState::Active);
                Ok(())
            }
            (SessionState::Handshaking(_), EnvelopeType::Handshake, Payload::Handshake { step }) => {
                Err(DockRpcError::ProtocolViolation {
                    state: format!("{state:?}"),
                    detail: format!("unexpected handshake step {step}"),
                })
            }
            _ => {
                if buffer.len() >= PRE_ACTIVE_BUFFER_CAPACITY {
                    self.set_state(SessionState::Closing);
                    return Err(DockRpcError::ProtocolViolation {
                        state: format!("{state:?}"),
                        detail: "pre-Active envelope buffer overflow".into(),
                    });
                }
                buffer.push_back(env);
                Ok(())
            }
        }
    }

    /// Replays buffered pre-Active envelopes, then serves the app stream
    /// until disconnect or the built-in `exit` method is delivered, routing
    /// `rpc-request`s to the worker pool.
    async fn serve_active(
        &mut self,
        app: &mut Endpoint,
        buffer: VecDeque<Envelope>,
    ) -> Result<(), DockRpcError> {
        for env in buffer {
            self.route_active_envelope(env, app);
        }

        let disconnect = app.disconnect_signal();
        let mut exit_rx = self.exit_rx.clone();
        loop {
            tokio::select! {
                biased;
                _ = exit_rx.changed() => {
                    tracing::info!("exit method invoked, closing session");
                    break;
                }
                _ = disconnect.notified() => {
                    tracing::info!("app stream disconnected, closing session");
                    break;
                }
                frame = app.read_frame() => {
                    match frame {
                        Ok(line) => match Envelope::decode(&line) {
                            Ok(env) => self.route_active_envelope(env, app),
                            Err(e) => tracing::warn!(error = %e, "dropping unparsable frame"),
                        },
                        Err(_) => {
                            tracing::info!("app stream disconnected, closing session");
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(SessionState::Closing);
        Ok(())
    }

    fn route_active_envelope(&self, env: Envelope, app: &Endpoint) {
        match env.payload {
            Payload::RpcRequest { id, method, params } => {
                let writer = app.writer();
                let dispatcher = self.dispatcher.clone();
                let clock = self.clock.clone();
                let app_id = self.config.app_id.clone();
                let exit_tx = self.exit_tx.clone();
                self.workers.submit(async move {
                    let outcome = match dispatcher.dispatch(&method, params).await {
                        Ok(value) => RpcOutcome::Ok(value),
                        Err(e) => RpcOutcome::Err {
                            code: e.rpc_code(),
                            message: e.to_string(),
                            data: Value::Null,
                        },
                    };
                    let response = Envelope::rpc_response(clock.as_ref(), app_id, id, outcome);
                    if let Err(e) = writer.write_frame(response.encode()) {
                        tracing::warn!(error = %e, "failed to write rpc-response");
                    }
                    if method == EXIT_METHOD_NAME {
                        let _ = exit_tx.send(true);
                    }
                });
            }
            Payload::Handshake { step } => {
                tracing::debug!(step, "ignoring handshake envelope received in Active");
            }
            other => {
                tracing::warn!(?other, "ignoring envelope kind not expected in Active");
            }
        }
    }
}

#![forbid(unsafe_code)]
//! Fake dock host used to exercise [`dock_rpc`] sessions in tests and
//! examples without a real host process, playing the host side of the
//! handshake over real local sockets instead of a real subprocess fixture.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use dock_rpc::{AcceptLoop, Clock, Endpoint, Envelope, EnvelopeType, Payload, RegisterMsg, RpcOutcome};

#[derive(Debug, Error)]
pub enum FakeDockError {
    #[error(transparent)]
    DockRpc(#[from] dock_rpc::DockRpcError),
    #[error("expected envelope kind {expected:?}, got {got:?}")]
    UnexpectedKind {
        expected: EnvelopeType,
        got: EnvelopeType,
    },
    #[error("expected a register envelope, got something else entirely")]
    NotRegister,
}

pub type Result<T> = std::result::Result<T, FakeDockError>;

/// Listens on the well-known dock pipe, waiting for one app to connect and
/// register, exactly like the real dock's registration endpoint.
///
/// Note the role reversal from the app's perspective: the dock *accepts* the
/// app's connection on the dock pipe (the app is the TCP/pipe client there),
/// while the dock *connects* to the app's own pipe to drive the handshake.
pub struct FakeDockHost {
    dock_accept: AcceptLoop,
}

impl FakeDockHost {
    pub fn listen(dock_pipe_name: &str) -> Result<Self> {
        Ok(FakeDockHost {
            dock_accept: AcceptLoop::bind(dock_pipe_name)?,
        })
    }

    /// Accepts the app's connection on the dock pipe and reads its (flat)
    /// `register` envelope.
    pub async fn accept_register(&self) -> Result<RegisterMsg> {
        let mut dock_conn = self.dock_accept.accept_next().await?;
        let line = dock_conn.read_frame().await?;
        let env = Envelope::decode(&line)?;
        dock_conn.close();
        match env.payload {
            Payload::Register(msg) => Ok(msg),
            _ => Err(FakeDockError::NotRegister),
        }
    }
}

/// The dock's live connection to one app's stream, after registration: owns
/// the client-role [`Endpoint`] connected to `appInfo.pipeName` and drives
/// the three-step handshake.
pub struct FakeDockSession {
    app_conn: Endpoint,
}

impl FakeDockSession {
    /// Connects to the app's own pipe and runs steps 1–3 of the handshake,
    /// leaving the session `Active` on both sides.
    pub async fn handshake(app_pipe_name: &str, clock: &dyn Clock, host_app_id: &str) -> Result<Self> {
        let mut app_conn = Endpoint::connect(app_pipe_name, Duration::from_secs(5)).await?;
        app_conn.write_frame(Envelope::handshake(clock, host_app_id, 1).encode())?;

        let step2_line = app_conn.read_frame().await?;
        let step2 = Envelope::decode(&step2_line)?;
        expect_handshake_step(&step2, 2)?;

        app_conn.write_frame(Envelope::handshake(clock, host_app_id, 3).encode())?;
        Ok(FakeDockSession { app_conn })
    }

    /// Sends an `rpc-request` on the app stream and returns the outcome once
    /// the matching `rpc-response` arrives, correlated by `id`.
    pub async fn call(
        &mut self,
        clock: &dyn Clock,
        host_app_id: &str,
        request_id: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<RpcOutcome> {
        let req = Envelope::rpc_request(clock, host_app_id, request_id, method, params);
        self.app_conn.write_frame(req.encode())?;
        loop {
            let line = self.app_conn.read_frame().await?;
            let env = Envelope::decode(&line)?;
            if let Payload::RpcResponse { id, outcome } = env.payload {
                if id == request_id {
                    return Ok(outcome);
                }
                tracing::debug!(id, "ignoring rpc-response for a different in-flight request");
            }
        }
    }

    /// Reads the next frame on the app stream and requires it to be an
    /// `rpc-event`, for asserting on emitted events in tests.
    pub async fn next_event(&mut self) -> Result<(String, Value)> {
        loop {
            let line = self.app_conn.read_frame().await?;
            let env = Envelope::decode(&line)?;
            if let Payload::RpcEvent { event, data, .. } = env.payload {
                return Ok((event, data));
            }
        }
    }

    pub fn close(self) {
        self.app_conn.close();
    }
}

fn expect_handshake_step(env: &Envelope, expected_step: u8) -> Result<()> {
    match &env.payload {
        Payload::Handshake { step } if *step == expected_step => Ok(()),
        _ => Err(FakeDockError::UnexpectedKind {
            expected: EnvelopeType::Handshake,
            got: env.kind,
        }),
    }
}

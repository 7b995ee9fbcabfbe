#![forbid(unsafe_code)]
//! RPC runtime core for a sidecar app registering with a local host "dock"
//! process. Ships the duplex message transport, handshake/lifecycle state
//! machine, concurrent request-dispatch engine, and the task-management
//! primitive the runtime uses for work execution, everything upstream of
//! the platform-specific system wrappers and the domain library manager,
//! which are external collaborators this crate does not implement.
//!
//! ```no_run
//! use dock_rpc::DockApp;
//!
//! # async fn run() -> dock_rpc::Result<()> {
//! let mut app = DockApp::builder("com.example.sidecar", "Example", "demo app", "icon.png", "example_app_pipe")
//!     .build();
//! app.bind("add", |a: i64, b: i64| async move { Ok::<i64, String>(a + b) });
//! app.declare_event("progress");
//! app.run().await
//! # }
//! ```

mod app;
mod clock;
mod dispatcher;
mod envelope;
mod error;
mod session;
mod stream;
mod task_manager;
mod worker_pool;

pub use app::{DockApp, DockAppBuilder, DEFAULT_DOCK_PIPE_NAME};
pub use clock::{Clock, FakeClock, SystemClock};
pub use dispatcher::{Dispatcher, HandlerFuture, IntoBoundMethod};
pub use envelope::{AppInfoWire, Envelope, EnvelopeType, Payload, RegisterMsg, RpcOutcome};
pub use error::{DockRpcError, Result};
pub use session::{Session, SessionHandle, SessionState};
pub use stream::{AcceptLoop, Endpoint, FrameWriter, MIN_CONNECT_WAIT, WRITE_QUEUE_CAPACITY};
pub use task_manager::{Task, TaskBuilder, TaskContext, TaskManager, TaskMode, TaskStatus};
pub use worker_pool::{WorkerPool, DEFAULT_WORKERS};

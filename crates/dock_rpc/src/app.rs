//! App façade: binds the transport, codec, session, dispatcher, worker pool,
//! and task manager into the user-visible API (`bind`, `declareEvent`, `emit`,
//! `run`). Mirrors the chainable-builder shape `ClaudeClientBuilder`/
//! `CodexClientBuilder` use elsewhere in this workspace, adapted to a
//! long-lived session instead of a one-shot subprocess call.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::dispatcher::{Dispatcher, IntoBoundMethod};
use crate::envelope::AppInfoWire;
use crate::error::Result;
use crate::session::{Session, SessionHandle, SessionState, EXIT_METHOD_NAME};
use crate::worker_pool::DEFAULT_WORKERS;

/// Well-known name of the shared dock endpoint apps register against.
pub const DEFAULT_DOCK_PIPE_NAME: &str = "leigod_tool_main_pipe";

/// Builds a [`DockApp`]. Construct with [`DockApp::builder`], chain setters,
/// call `build()` to fill in defaults (dock pipe name, worker count).
pub struct DockAppBuilder {
    app_id: String,
    name: String,
    description: String,
    icon: String,
    app_pipe_name: String,
    http_url: Option<String>,
    local_path: Option<String>,
    dock_pipe_name: String,
    worker_count: usize,
    clock: Arc<dyn Clock>,
}

impl DockAppBuilder {
    fn new(
        app_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        icon: impl Into<String>,
        app_pipe_name: impl Into<String>,
    ) -> Self {
        DockAppBuilder {
            app_id: app_id.into(),
            name: name.into(),
            description: description.into(),
            icon: icon.into(),
            app_pipe_name: app_pipe_name.into(),
            http_url: None,
            local_path: None,
            dock_pipe_name: DEFAULT_DOCK_PIPE_NAME.to_string(),
            worker_count: DEFAULT_WORKERS,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn http_url(mut self, url: impl Into<String>) -> Self {
        self.http_url = Some(url.into());
        self
    }

    pub fn local_path(mut self, path: impl Into<String>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn dock_pipe_name(mut self, name: impl Into<String>) -> Self {
        self.dock_pipe_name = name.into();
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Overrides the clock used for envelope timestamps; tests inject a
    /// [`crate::clock::FakeClock`] here, production callers rarely need to.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> DockApp {
        let mut dispatcher = Dispatcher::new();
        let mut functions = BTreeSet::new();

        // The built-in `exit` method is pre-bound so every app can be asked
        // to terminate gracefully without binding it itself.
        dispatcher.bind(EXIT_METHOD_NAME, || async move { Ok::<Value, String>(Value::Null) });
        functions.insert(EXIT_METHOD_NAME.to_string());

        let session_handle = SessionHandle::new(self.app_id.clone(), self.clock.clone());

        DockApp {
            app_id: self.app_id,
            name: self.name,
            description: self.description,
            icon: self.icon,
            app_pipe_name: self.app_pipe_name,
            http_url: self.http_url,
            local_path: self.local_path,
            dock_pipe_name: self.dock_pipe_name,
            worker_count: self.worker_count,
            clock: self.clock,
            dispatcher,
            functions,
            events: BTreeSet::new(),
            session_handle,
            exit_requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

/// User-visible entry point. Call [`DockApp::bind`] and
/// [`DockApp::declare_event`]/[`DockApp::declare_events`] before
/// [`DockApp::run`]; after `run` begins, bindings and declarations are
/// read-only.
pub struct DockApp {
    app_id: String,
    name: String,
    description: String,
    icon: String,
    app_pipe_name: String,
    http_url: Option<String>,
    local_path: Option<String>,
    dock_pipe_name: String,
    worker_count: usize,
    clock: Arc<dyn Clock>,
    dispatcher: Dispatcher,
    functions: BTreeSet<String>,
    events: BTreeSet<String>,
    session_handle: SessionHandle,
    exit_requested: Arc<std::sync::atomic::AtomicBool>,
}

impl DockApp {
    pub fn builder(
        app_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        icon: impl Into<String>,
        app_pipe_name: impl Into<String>,
    ) -> DockAppBuilder {
        DockAppBuilder::new(app_id, name, description, icon, app_pipe_name)
    }

    /// Registers `callable` under `name` and advertises it in `RegisterMsg.functions`.
    /// Must be called before [`DockApp::run`]; binding the same name twice
    /// replaces the prior binding.
    pub fn bind<Marker, H>(&mut self, name: impl Into<String>, callable: H)
    where
        H: IntoBoundMethod<Marker>,
    {
        let name = name.into();
        self.dispatcher.bind(name.clone(), callable);
        self.functions.insert(name);
    }

    /// Grows the declared-event set; never shrinks.
    pub fn declare_event(&mut self, name: impl Into<String>) {
        self.events.insert(name.into());
    }

    pub fn declare_events<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.declare_event(name);
        }
    }

    /// Builds and writes an `rpc-event` if `name` was declared and the session
    /// is connected; otherwise drops the emission with a warning rather than
    /// treating it as a fatal error.
    pub fn emit(&self, name: impl Into<String>, data: Value) {
        let name = name.into();
        if !self.events.contains(&name) {
            tracing::warn!(event = %name, "emit of undeclared event dropped");
            return;
        }
        if self.session_handle.is_active() {
            self.session_handle.emit(name, data);
        } else {
            tracing::warn!(event = %name, "emit while session is not active, dropped");
        }
    }

    /// A cloneable window onto this app's session, usable from another task
    /// while [`DockApp::run`] drives the session on this one. Available
    /// immediately after [`DockApp::builder`]`.build()`, before `run` is
    /// ever called, callers may capture it in a bound handler's closure to
    /// emit events from within that handler.
    pub fn handle(&self) -> SessionHandle {
        self.session_handle.clone()
    }

    fn register_info(&self) -> AppInfoWire {
        AppInfoWire {
            name: self.name.clone(),
            description: self.description.clone(),
            icon: self.icon.clone(),
            pipe_name: self.app_pipe_name.clone(),
            functions: self.functions.clone(),
            events: self.events.clone(),
            http_url: self.http_url.clone(),
            local_path: self.local_path.clone(),
        }
    }

    /// Drives the session to `Active`, parks until `Closed`, then returns.
    /// The built-in `exit` method returns its response, flips the
    /// exit-requested flag, and ends the session: once delivery completes the
    /// session transitions to `Closing`/`Closed` on its own and this call
    /// returns. Callers that own the process check [`DockApp::exit_requested`]
    /// after `run` returns to decide whether to call `std::process::exit`.
    pub async fn run(&mut self) -> Result<()> {
        self.bind_exit_hook();

        let session = Session::with_handle(
            self.session_handle.clone(),
            self.app_id.clone(),
            self.dock_pipe_name.clone(),
            self.app_pipe_name.clone(),
            self.register_info(),
            self.clock.clone(),
            Arc::new(std::mem::take(&mut self.dispatcher)),
            self.worker_count,
        );
        session.run().await
    }

    /// True once the built-in `exit` method has been invoked and returned its
    /// response; callers drive process shutdown from this after `run` returns.
    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn bind_exit_hook(&mut self) {
        let flag = self.exit_requested.clone();
        self.dispatcher.bind(EXIT_METHOD_NAME, move || {
            let flag = flag.clone();
            async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<Value, String>(Value::Null)
            }
        });
    }

    pub fn state(&self) -> SessionState {
        self.session_handle.state()
    }

    /// Explicit early unregister, usable instead of waiting for `run` to
    /// reach `Closing` and unregister on its own as part of teardown.
    pub async fn unregister(&self) -> Result<()> {
        Session::unregister(&self.dock_pipe_name, &self.app_id, self.clock.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_dock_pipe_and_worker_count() {
        let app = DockApp::builder("app-1", "demo", "a demo", "icon.png", "demo_pipe").build();
        assert_eq!(app.dock_pipe_name, DEFAULT_DOCK_PIPE_NAME);
        assert_eq!(app.worker_count, DEFAULT_WORKERS);
        assert!(app.functions.contains("exit"));
    }

    #[test]
    fn bind_advertises_function_name() {
        let mut app = DockApp::builder("app-1", "demo", "a demo", "icon.png", "demo_pipe").build();
        app.bind("add", |a: i64, b: i64| async move { Ok::<i64, String>(a + b) });
        assert!(app.functions.contains("add"));
    }

    #[test]
    fn declare_events_grows_set_and_never_shrinks() {
        let mut app = DockApp::builder("app-1", "demo", "a demo", "icon.png", "demo_pipe").build();
        app.declare_events(["progress", "done"]);
        assert!(app.events.contains("progress"));
        assert!(app.events.contains("done"));
    }

    #[test]
    fn emit_of_undeclared_event_is_a_dropped_no_op() {
        let app = DockApp::builder("app-1", "demo", "a demo", "icon.png", "demo_pipe").build();
        // No session handle yet (run() hasn't been called) and the event was
        // never declared: this must not panic, only log and drop.
        app.emit("never-declared", Value::Null);
    }
}

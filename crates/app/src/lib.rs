//! Application orchestrator: ordered startup of registered servers, signal
//! driven graceful shutdown, lifecycle hooks by phase, and a priority-ordered
//! cleanup list that runs only after every server has stopped accepting work.

use endpoint::Context;
use server::Server;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type BoxFuture = futures::future::BoxFuture<'static, Result<(), BoxError>>;
type Hook = Box<dyn FnOnce(Context) -> BoxFuture + Send>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("application is already running")]
    AlreadyRunning,
    #[error("before-start hook failed")]
    BeforeStart(#[source] BoxError),
    #[error("server {name} failed")]
    Server {
        name: String,
        #[source]
        source: server::Error,
    },
}

/// Lifecycle states; transitions are one-way per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Pending = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub name: String,
    pub version: String,
    pub shutdown_timeout: Duration,
    pub signals: Vec<SignalKind>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            version: "0.0.0".to_string(),
            shutdown_timeout: Duration::from_secs(30),
            signals: vec![SignalKind::interrupt(), SignalKind::terminate()],
        }
    }
}

struct Cleanup {
    name: String,
    priority: i32,
    run: Box<dyn FnOnce() -> BoxFuture + Send>,
}

#[derive(Default)]
struct Hooks {
    before_start: Vec<Hook>,
    after_start: Vec<Hook>,
    before_stop: Vec<Hook>,
    after_stop: Vec<Hook>,
}

/// Cancels the application's root context; cheap to clone out of the app and
/// hand to signal handlers or admin endpoints.
#[derive(Clone)]
pub struct Stopper(CancellationToken);

impl Stopper {
    pub fn stop(&self) {
        self.0.cancel()
    }
}

pub struct App {
    options: Options,
    servers: Vec<Arc<dyn Server>>,
    hooks: Mutex<Hooks>,
    cleanups: Mutex<Vec<Cleanup>>,
    state: AtomicU8,
    root: CancellationToken,
}

impl App {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            servers: Vec::new(),
            hooks: Mutex::new(Hooks::default()),
            cleanups: Mutex::new(Vec::new()),
            state: AtomicU8::new(State::Pending as u8),
            root: CancellationToken::new(),
        }
    }

    /// Register servers; ordered, and only possible before `run`.
    pub fn use_server(mut self, server: Arc<dyn Server>) -> Self {
        self.servers.push(server);
        self
    }

    pub fn before_start<F, Fut>(self, hook: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.lock().unwrap().before_start.push(boxed(hook));
        self
    }

    pub fn after_start<F, Fut>(self, hook: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.lock().unwrap().after_start.push(boxed(hook));
        self
    }

    pub fn before_stop<F, Fut>(self, hook: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.lock().unwrap().before_stop.push(boxed(hook));
        self
    }

    pub fn after_stop<F, Fut>(self, hook: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.lock().unwrap().after_stop.push(boxed(hook));
        self
    }

    /// Register a shutdown cleanup. Smaller priorities run first; the log
    /// flusher is conventionally last.
    pub fn cleanup<F, Fut>(self, name: impl Into<String>, priority: i32, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.cleanups.lock().unwrap().push(Cleanup {
            name: name.into(),
            priority,
            run: Box::new(move || Box::pin(f())),
        });
        self
    }

    pub fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Pending,
            1 => State::Starting,
            2 => State::Running,
            3 => State::Stopping,
            _ => State::Stopped,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Request shutdown. Safe to call any number of times, from anywhere.
    pub fn stop(&self) {
        self.root.cancel()
    }

    pub fn stopper(&self) -> Stopper {
        Stopper(self.root.clone())
    }

    /// Run the application: blocks until shutdown completes. Shutdown is
    /// triggered by a configured signal, `stop`, or a server failing
    /// fatally.
    pub async fn run(&self) -> Result<(), Error> {
        if self
            .state
            .compare_exchange(
                State::Pending as u8,
                State::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        let Options { name, version, .. } = &self.options;
        tracing::info!(%name, %version, "application starting");
        let root_cx = Context::with_cancel(self.root.clone());

        let before_start = std::mem::take(&mut self.hooks.lock().unwrap().before_start);
        for hook in before_start {
            if let Err(error) = hook(root_cx.clone()).await {
                self.set_state(State::Stopped);
                return Err(Error::BeforeStart(error));
            }
        }

        // Launch one worker per server. Servers return only on root-context
        // cancellation or fatal error, so we do not wait here.
        let (fatal_tx, mut fatal_rx) =
            tokio::sync::mpsc::channel::<(String, server::Error)>(self.servers.len().max(1));
        let mut workers = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            let server = server.clone();
            let cx = root_cx.clone();
            let fatal_tx = fatal_tx.clone();
            workers.push(tokio::spawn(async move {
                if let Err(error) = server.start(cx).await {
                    let _ = fatal_tx.send((server.name().to_string(), error)).await;
                }
            }));
        }
        drop(fatal_tx);

        let after_start = std::mem::take(&mut self.hooks.lock().unwrap().after_start);
        for hook in after_start {
            if let Err(error) = hook(root_cx.clone()).await {
                tracing::warn!(%error, "after-start hook failed");
            }
        }

        self.set_state(State::Running);
        tracing::info!(%name, "application running");

        // A closed channel means every worker exited cleanly (or none were
        // registered); shutdown then comes from a signal or `stop` alone.
        let first_fatal = async {
            loop {
                match fatal_rx.recv().await {
                    Some(failure) => break failure,
                    None => futures::future::pending::<()>().await,
                }
            }
        };

        let mut fatal = None;
        tokio::select! {
            () = wait_for_signal(self.options.signals.clone()) => {
                tracing::info!("shutdown signal received");
            }
            () = self.root.cancelled() => {
                tracing::info!("shutdown requested");
            }
            (server_name, source) = first_fatal => {
                tracing::error!(server = %server_name, error = %source, "server failed; shutting down");
                fatal = Some(Error::Server { name: server_name, source });
            }
        }

        self.set_state(State::Stopping);
        let shutdown_cx = Context::background().with_timeout(self.options.shutdown_timeout);

        let before_stop = std::mem::take(&mut self.hooks.lock().unwrap().before_stop);
        for hook in before_stop {
            if let Err(error) = hook(shutdown_cx.clone()).await {
                tracing::warn!(%error, "before-stop hook failed");
            }
        }

        // Stop servers in parallel; the phase completes (or times out) before
        // any cleanup runs.
        let stops = futures::future::join_all(self.servers.iter().map(|server| {
            let cx = shutdown_cx.clone();
            async move {
                if let Err(error) = server.stop(cx).await {
                    tracing::warn!(server = server.name(), %error, "server stop failed");
                }
            }
        }));
        tokio::select! {
            _ = stops => (),
            () = shutdown_cx.done() => {
                tracing::warn!("graceful timeout reached while stopping servers");
            }
        }

        // Release the start workers and collect them.
        self.root.cancel();
        tokio::select! {
            _ = futures::future::join_all(workers) => (),
            () = shutdown_cx.done() => {
                tracing::warn!("graceful timeout reached while joining server workers");
            }
        }

        let mut cleanups = std::mem::take(&mut *self.cleanups.lock().unwrap());
        cleanups.sort_by_key(|cleanup| cleanup.priority);
        for cleanup in cleanups {
            tracing::debug!(cleanup = %cleanup.name, priority = cleanup.priority, "running cleanup");
            tokio::select! {
                result = (cleanup.run)() => {
                    if let Err(error) = result {
                        tracing::warn!(cleanup = %cleanup.name, %error, "cleanup failed");
                    }
                }
                () = shutdown_cx.done() => {
                    tracing::warn!(cleanup = %cleanup.name, "cleanup cut short by graceful timeout");
                }
            }
        }

        // After-stop hooks run under a fresh, non-cancelled context.
        let after_stop = std::mem::take(&mut self.hooks.lock().unwrap().after_stop);
        for hook in after_stop {
            if let Err(error) = hook(Context::background()).await {
                tracing::warn!(%error, "after-stop hook failed");
            }
        }

        self.set_state(State::Stopped);
        tracing::info!(%name, "application stopped");
        match fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn boxed<F, Fut>(hook: F) -> Hook
where
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Box::new(move |cx| Box::pin(hook(cx)))
}

/// Resolves when any configured signal fires. Pends forever with no signals
/// configured (shutdown then comes from `stop` or a fatal server error).
async fn wait_for_signal(kinds: Vec<SignalKind>) {
    let mut streams = Vec::new();
    for kind in kinds {
        match tokio::signal::unix::signal(kind) {
            Ok(stream) => streams.push(stream),
            Err(error) => tracing::warn!(%error, "failed to install signal handler"),
        }
    }
    if streams.is_empty() {
        return futures::future::pending().await;
    }

    let waiters = streams
        .iter_mut()
        .map(|stream| Box::pin(stream.recv()))
        .collect::<Vec<_>>();
    let _ = futures::future::select_all(waiters).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeServer {
        name: String,
        log: Log,
        fail_start: bool,
        lifecycle: tokio::sync::Notify,
    }

    impl FakeServer {
        fn new(name: &str, log: Log) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                log,
                fail_start: false,
                lifecycle: tokio::sync::Notify::new(),
            })
        }

        fn failing(name: &str, log: Log) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                log,
                fail_start: true,
                lifecycle: tokio::sync::Notify::new(),
            })
        }
    }

    #[async_trait::async_trait]
    impl Server for FakeServer {
        fn name(&self) -> &str {
            &self.name
        }

        fn addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }

        async fn start(&self, cx: Context) -> Result<(), server::Error> {
            self.log.lock().unwrap().push(format!("{}:start", self.name));
            if self.fail_start {
                return Err(server::Error::AlreadyStarted);
            }
            tokio::select! {
                () = cx.done() => (),
                () = self.lifecycle.notified() => (),
            }
            Ok(())
        }

        async fn stop(&self, _cx: Context) -> Result<(), server::Error> {
            // Simulate a short drain so cleanup ordering is observable.
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.log.lock().unwrap().push(format!("{}:stop", self.name));
            self.lifecycle.notify_waiters();
            Ok(())
        }
    }

    fn init_logs() {
        let env_filter = tracing_subscriber::EnvFilter::from_default_env();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init();
    }

    fn record(log: &Log, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    fn index_of(entries: &[String], needle: &str) -> usize {
        entries
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("missing {needle} in {entries:?}"))
    }

    #[tokio::test]
    async fn shutdown_stops_servers_then_runs_cleanups_by_priority() {
        init_logs();
        let log: Log = Default::default();
        let server_a = FakeServer::new("a", log.clone());

        let app = {
            let (db, cache, flush) = (log.clone(), log.clone(), log.clone());
            App::new(Options::default())
                .use_server(server_a)
                .cleanup("db", 10, move || async move {
                    record(&db, "cleanup:db");
                    Ok(())
                })
                .cleanup("cache", 10, move || async move {
                    record(&cache, "cleanup:cache");
                    Ok(())
                })
                .cleanup("log", 100, move || async move {
                    record(&flush, "cleanup:log");
                    Ok(())
                })
        };
        let app = Arc::new(app);

        let running = {
            let app = app.clone();
            tokio::spawn(async move { app.run().await })
        };

        // Let startup settle, then request shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(app.state(), State::Running);
        app.stop();
        running.await.unwrap().unwrap();
        assert_eq!(app.state(), State::Stopped);

        let entries = log.lock().unwrap().clone();
        let a_stop = index_of(&entries, "a:stop");
        let db = index_of(&entries, "cleanup:db");
        let cache = index_of(&entries, "cleanup:cache");
        let flush = index_of(&entries, "cleanup:log");

        // Server stop strictly precedes every cleanup; the log flusher is last.
        assert!(a_stop < db && a_stop < cache);
        assert!(flush > db && flush > cache);
    }

    #[tokio::test]
    async fn hooks_run_in_phase_order() {
        let log: Log = Default::default();
        let app = {
            let (h1, h2, h3, h4) = (log.clone(), log.clone(), log.clone(), log.clone());
            App::new(Options::default())
                .before_start(move |_cx| async move {
                    record(&h1, "hook:before-start");
                    Ok(())
                })
                .after_start(move |_cx| async move {
                    record(&h2, "hook:after-start");
                    Err(anyhow::anyhow!("after-start hooks are not fatal").into())
                })
                .before_stop(move |_cx| async move {
                    record(&h3, "hook:before-stop");
                    Ok(())
                })
                .after_stop(move |_cx| async move {
                    record(&h4, "hook:after-stop");
                    Ok(())
                })
        };
        let app = Arc::new(app);

        let running = {
            let app = app.clone();
            tokio::spawn(async move { app.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        app.stop();
        running.await.unwrap().unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec![
                "hook:before-start",
                "hook:after-start",
                "hook:before-stop",
                "hook:after-stop"
            ]
        );
    }

    #[tokio::test]
    async fn before_start_failure_aborts_without_launching_servers() {
        let log: Log = Default::default();
        let server = FakeServer::new("a", log.clone());

        let app = App::new(Options::default())
            .use_server(server)
            .before_start(|_cx| async { Err(anyhow::anyhow!("no database").into()) });

        let err = app.run().await.unwrap_err();
        assert!(matches!(err, Error::BeforeStart(_)));
        assert_eq!(app.state(), State::Stopped);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fatal_server_error_triggers_shutdown_and_surfaces() {
        let log: Log = Default::default();
        let app = App::new(Options::default())
            .use_server(FakeServer::failing("bad", log.clone()))
            .use_server(FakeServer::new("good", log.clone()));

        let err = app.run().await.unwrap_err();
        match err {
            Error::Server { name, .. } => assert_eq!(name, "bad"),
            other => panic!("unexpected error {other:?}"),
        }

        let entries = log.lock().unwrap().clone();
        assert!(entries.contains(&"good:stop".to_string()));
    }

    #[tokio::test]
    async fn run_twice_is_a_typed_error() {
        let app = Arc::new(App::new(Options::default()));

        let first = {
            let app = app.clone();
            tokio::spawn(async move { app.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = app.run().await;
        assert!(matches!(second, Err(Error::AlreadyRunning)));

        app.stop();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let app = Arc::new(App::new(Options::default()));
        let running = {
            let app = app.clone();
            tokio::spawn(async move { app.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        app.stop();
        app.stop();
        app.stopper().stop();
        running.await.unwrap().unwrap();
    }
}

use super::cleanup::{default_cleaner, ResidualCleaner};
use super::detect::{SocketDetector, DEFAULT_POLL_INTERVAL};
use super::drain::Drain;
use super::lock;
use super::log_buffer::LogBuffer;
use super::registry::DefaultRegistry;
use crate::client::{Connector, ExtensionClient, SocketConnector};
use crate::config::InstanceConfig;
use crate::error::{BrokerError, Result};
use crate::reply::Reply;
use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Socket checks made by a query before giving up on an unready daemon.
pub const READY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Constructed, no process yet
    Created,
    /// Process spawned, no client yet
    Launching,
    /// Client established
    Connected,
    /// Terminal
    Closed,
}

impl InstanceState {
    pub fn is_closed(&self) -> bool {
        matches!(self, InstanceState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Created => "created",
            InstanceState::Launching => "launching",
            InstanceState::Connected => "connected",
            InstanceState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub state: InstanceState,
    pub pid: Option<u32>,
    /// How the last daemon process ended, once it has been reaped.
    pub exit: Option<ProcessExit>,
}

/// Exit status of a reaped daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Terminating signal, unix only.
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// The task owning the child process. It alone kills and reaps the daemon.
struct Waiter {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct Lifecycle {
    state: InstanceState,
    pid: Option<u32>,
    waiter: Option<Waiter>,
    tasks: Vec<JoinHandle<()>>,
}

/// One supervised osqueryd and its lazily established extension client.
pub struct Instance {
    config: RwLock<Arc<InstanceConfig>>,
    registry: Arc<DefaultRegistry>,
    connector: Arc<dyn Connector>,
    cleaner: Option<Arc<dyn ResidualCleaner>>,
    client: RwLock<Option<Arc<dyn ExtensionClient>>>,
    /// Held while a client is being established.
    connect_guard: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    exit: Arc<Mutex<Option<ProcessExit>>>,
    diagnostics: Arc<LogBuffer>,
    cancel: CancellationToken,
    ready_attempts: u32,
    poll_interval: Duration,
}

impl Instance {
    pub fn new(config: InstanceConfig, registry: Arc<DefaultRegistry>) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            registry,
            connector: Arc::new(SocketConnector),
            cleaner: None,
            client: RwLock::new(None),
            connect_guard: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle {
                state: InstanceState::Created,
                pid: None,
                waiter: None,
                tasks: Vec::new(),
            }),
            exit: Arc::new(Mutex::new(None)),
            diagnostics: Arc::new(LogBuffer::default()),
            cancel: CancellationToken::new(),
            ready_attempts: READY_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Overrides the platform default chosen from the working prefix.
    pub fn with_cleaner(mut self, cleaner: Arc<dyn ResidualCleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    pub fn with_ready_attempts(mut self, attempts: u32) -> Self {
        self.ready_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> String {
        self.config().name.clone()
    }

    pub fn config(&self) -> Arc<InstanceConfig> {
        Arc::clone(&read(&self.config))
    }

    /// Swaps in a new configuration. The running process and client are kept;
    /// the new values apply to the next start and connection.
    pub fn replace_config(&self, config: InstanceConfig) {
        let previous = std::mem::replace(&mut *write(&self.config), Arc::new(config));
        debug!(instance = %previous.name, "Released previous configuration");
    }

    pub fn state(&self) -> InstanceState {
        lock(&self.lifecycle).state
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn status(&self) -> InstanceStatus {
        let (state, pid) = {
            let lifecycle = lock(&self.lifecycle);
            (lifecycle.state, lifecycle.pid)
        };
        InstanceStatus {
            name: self.name(),
            state,
            pid,
            exit: *lock(&self.exit),
        }
    }

    /// Last `n` lines the daemon wrote to stderr.
    pub fn diagnostics(&self, n: usize) -> Vec<String> {
        self.diagnostics.tail(n)
    }

    /// Makes this the default instance unless another one already is.
    pub fn mark_default(self: &Arc<Self>) -> bool {
        self.registry.set_default(self)
    }

    /// Spawns the daemon and its drain and wait tasks.
    pub async fn start(&self) -> Result<()> {
        let config = self.config();
        let mut lifecycle = lock(&self.lifecycle);

        if lifecycle.state.is_closed() {
            return Err(BrokerError::Closed(config.name.clone()));
        }
        if lifecycle.pid.is_some() {
            return Err(BrokerError::AlreadyStarted(config.name.clone()));
        }

        let args = config.args();
        debug!(instance = %config.name, args = ?args, "Launching osqueryd");

        let mut cmd = Command::new(&config.binary_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so a kill also reaches the daemon's workers.
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd.spawn().map_err(|source| {
            error!(instance = %config.name, "Failed to launch osqueryd: {}", source);
            BrokerError::Launch {
                name: config.name.clone(),
                source,
            }
        })?;

        let pid = child.id();
        info!(
            instance = %config.name,
            pid = ?pid,
            binary = %config.binary_path.display(),
            "Started osqueryd"
        );

        *lock(&self.exit) = None;

        if let Some(stderr) = child.stderr.take() {
            let drain = Drain::new(
                config.name.clone(),
                Arc::clone(&self.diagnostics),
                self.cancel.clone(),
            );
            lifecycle.tasks.push(tokio::spawn(drain.run(stderr)));
        }

        let shutdown = self.cancel.child_token();
        let handle = tokio::spawn(wait_for_exit(
            config.name.clone(),
            child,
            shutdown.clone(),
            Arc::clone(&self.exit),
        ));
        lifecycle.waiter = Some(Waiter { shutdown, handle });

        lifecycle.pid = pid;
        if lifecycle.state == InstanceState::Created {
            lifecycle.state = InstanceState::Launching;
        }
        Ok(())
    }

    /// Runs `sql` on the daemon, connecting first if needed.
    pub async fn query(&self, sql: &str) -> Reply {
        if self.is_closed() {
            return Reply::err(BrokerError::Closed(self.name()));
        }

        let client = match self.ensure_connected().await {
            Ok(client) => client,
            Err(e) => {
                warn!(instance = %self.name(), "Extension client unavailable: {}", e);
                return Reply::err(e);
            }
        };

        let result = client.query(sql).await;
        if let Err(e) = &result {
            if e.is_transport() {
                warn!(instance = %self.name(), "Dropping extension client after transport error: {}", e);
                self.invalidate_client(&client).await;
            }
        }
        Reply::from(result)
    }

    fn current_client(&self) -> Option<Arc<dyn ExtensionClient>> {
        read(&self.client).clone()
    }

    async fn ensure_connected(&self) -> Result<Arc<dyn ExtensionClient>> {
        if let Some(client) = self.current_client() {
            return Ok(client);
        }

        let _guard = self.connect_guard.lock().await;
        if let Some(client) = self.current_client() {
            return Ok(client);
        }

        let config = self.config();
        let detector = SocketDetector::new(&config.socket_path, self.cancel.clone())
            .with_interval(self.poll_interval);

        if !detector.detect(self.ready_attempts).await {
            return Err(BrokerError::SocketNotFound {
                name: config.name.clone(),
                socket: config.socket_path.clone(),
            });
        }

        let client = self
            .connector
            .connect(&config.socket_path, config.timeout())
            .await?;

        let installed = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state.is_closed() {
                false
            } else {
                *write(&self.client) = Some(Arc::clone(&client));
                lifecycle.state = InstanceState::Connected;
                true
            }
        };

        if !installed {
            client.close().await;
            return Err(BrokerError::Closed(config.name.clone()));
        }

        info!(
            instance = %config.name,
            socket = %config.socket_path.display(),
            "Extension client connected"
        );
        Ok(client)
    }

    async fn invalidate_client(&self, stale: &Arc<dyn ExtensionClient>) {
        let removed = {
            let mut slot = write(&self.client);
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, stale)) {
                slot.take()
            } else {
                None
            }
        };

        if let Some(client) = removed {
            {
                let mut lifecycle = lock(&self.lifecycle);
                if lifecycle.state == InstanceState::Connected {
                    lifecycle.state = if lifecycle.pid.is_some() {
                        InstanceState::Launching
                    } else {
                        InstanceState::Created
                    };
                }
            }
            client.close().await;
        }
    }

    /// Kills the daemon, drops the client, stops background tasks and removes
    /// residual files. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let (waiter, tasks) = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state.is_closed() {
                return Ok(());
            }
            lifecycle.state = InstanceState::Closed;
            lifecycle.pid = None;
            (lifecycle.waiter.take(), std::mem::take(&mut lifecycle.tasks))
        };

        let name = self.name();

        if let Some(waiter) = waiter {
            waiter.shutdown.cancel();
            if let Err(e) = waiter.handle.await {
                warn!(instance = %name, "Wait task ended abnormally: {}", e);
            }
        }

        let client = write(&self.client).take();
        if let Some(client) = client {
            client.close().await;
        }

        self.registry.clear_if(self);
        self.cancel.cancel();

        for task in tasks {
            if let Err(e) = task.await {
                warn!(instance = %name, "Background task ended abnormally: {}", e);
            }
        }

        let cleaner = match &self.cleaner {
            Some(cleaner) => Arc::clone(cleaner),
            None => default_cleaner(self.config().working_prefix.as_deref()),
        };
        let removed = cleaner.clean(&name);

        info!(instance = %name, removed_files = removed, "Instance closed");
        Ok(())
    }
}

/// Waits for the daemon to exit and records how it ended. On shutdown it
/// kills the daemon's process group first.
async fn wait_for_exit(
    name: String,
    mut child: Child,
    shutdown: CancellationToken,
    exit: Arc<Mutex<Option<ProcessExit>>>,
) {
    let pid = child.id();
    let status = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            // Not reaped yet, so the group id still belongs to the daemon.
            if let Some(pid) = pid {
                info!(instance = %name, pid, "Killing osqueryd");
                kill_process_tree(&name, pid).await;
            }
            if let Err(e) = child.start_kill() {
                debug!(instance = %name, "Kill on shutdown: {}", e);
            }
            child.wait().await
        }
        status = child.wait() => status,
    };

    match status {
        Ok(status) => {
            let record = ProcessExit::from_status(status);
            *lock(&exit) = Some(record);

            if shutdown.is_cancelled() {
                debug!(instance = %name, "osqueryd stopped: {}", status);
            } else if status.success() {
                info!(target: "audit", instance = %name, "osqueryd exited");
            } else {
                warn!(
                    target: "audit",
                    instance = %name,
                    code = ?record.code,
                    signal = ?record.signal,
                    "osqueryd exited with failure: {}",
                    status
                );
            }
        }
        Err(e) => {
            error!(target: "audit", instance = %name, "Failed to wait for osqueryd: {}", e);
        }
    }
}

async fn kill_process_tree(name: &str, pid: u32) {
    #[cfg(unix)]
    {
        // SAFETY: kill(2) takes plain integers; a negative pid addresses the
        // process group the daemon leads.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            debug!(
                instance = %name,
                pid,
                "Process group already gone: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(windows)]
    {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = status {
            debug!(instance = %name, pid, "taskkill failed: {}", e);
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::QueryRows;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub(crate) struct MockClient {
        id: usize,
        transport_failures: AtomicUsize,
        closed: AtomicBool,
    }

    impl MockClient {
        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExtensionClient for MockClient {
        async fn query(&self, sql: &str) -> Result<QueryRows> {
            if self.is_closed() {
                return Err(BrokerError::Transport(std::io::ErrorKind::BrokenPipe.into()));
            }
            if self
                .transport_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BrokerError::Transport(
                    std::io::ErrorKind::ConnectionReset.into(),
                ));
            }
            if sql.contains("missing_table") {
                return Err(BrokerError::QueryFailed {
                    code: 1,
                    message: "no such table: missing_table".into(),
                });
            }

            let mut row = crate::client::Row::new();
            row.insert("client".into(), self.id.to_string());
            row.insert("sql".into(), sql.to_string());
            Ok(vec![row])
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub(crate) struct MockConnector {
        pub(crate) connects: AtomicUsize,
        pub(crate) fail_next: AtomicBool,
        pub(crate) delay: Duration,
        /// Transport failures each new client reports before succeeding.
        pub(crate) failing_calls: usize,
        pub(crate) clients: Mutex<Vec<Arc<MockClient>>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            socket: &Path,
            _timeout: Duration,
        ) -> Result<Arc<dyn ExtensionClient>> {
            tokio::time::sleep(self.delay).await;
            let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;

            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(BrokerError::Connect {
                    socket: socket.to_path_buf(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            }

            let client = Arc::new(MockClient {
                id,
                transport_failures: AtomicUsize::new(self.failing_calls),
                closed: AtomicBool::new(false),
            });
            lock(&self.clients).push(Arc::clone(&client));
            Ok(client)
        }
    }

    pub(crate) fn test_config(name: &str, socket: PathBuf) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            binary_path: PathBuf::from("/nonexistent/osqueryd"),
            checksum: String::new(),
            socket_path: socket,
            flags: vec!["disable_events".into()],
            timeout_secs: 5,
            working_prefix: None,
        }
    }

    pub(crate) fn test_instance(name: &str, registry: &Arc<DefaultRegistry>) -> Instance {
        Instance::new(
            test_config(name, PathBuf::from(format!("/nonexistent/{name}.em"))),
            Arc::clone(registry),
        )
    }

    /// Instance whose socket already exists, wired to `connector`.
    fn ready_instance(
        dir: &tempfile::TempDir,
        connector: &Arc<MockConnector>,
    ) -> Arc<Instance> {
        let socket = dir.path().join("osquery.em");
        std::fs::write(&socket, b"").unwrap();
        Arc::new(
            Instance::new(test_config("client", socket), Arc::new(DefaultRegistry::new()))
                .with_connector(Arc::clone(connector) as Arc<dyn Connector>)
                .with_poll_interval(Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn concurrent_queries_connect_once() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let instance = ready_instance(&dir, &connector);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let instance = Arc::clone(&instance);
                tokio::spawn(async move { instance.query(&format!("select {i}")).await })
            })
            .collect();

        for handle in handles {
            let reply = handle.await.unwrap();
            assert!(reply.is_ok(), "unexpected error: {:?}", reply.error());
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(instance.state(), InstanceState::Connected);
    }

    #[tokio::test]
    async fn missing_socket_reports_name_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("never.em");
        let connector = Arc::new(MockConnector::default());
        let instance = Instance::new(
            test_config("client", socket.clone()),
            Arc::new(DefaultRegistry::new()),
        )
        .with_connector(Arc::clone(&connector) as Arc<dyn Connector>)
        .with_ready_attempts(2)
        .with_poll_interval(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let reply = instance.query("select 1").await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let message = reply.error().unwrap().to_string();
        assert!(message.contains("client"));
        assert!(message.contains(&socket.display().to_string()));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(instance.state(), InstanceState::Created);
    }

    #[tokio::test]
    async fn connect_failure_leaves_instance_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::default());
        connector.fail_next.store(true, Ordering::SeqCst);
        let instance = ready_instance(&dir, &connector);

        let reply = instance.query("select 1").await;
        assert!(matches!(reply.error(), Some(BrokerError::Connect { .. })));
        assert!(instance.current_client().is_none());

        let reply = instance.query("select 1").await;
        assert!(reply.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transport_error_reconnects_on_next_query() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector {
            failing_calls: 1,
            ..Default::default()
        });
        let instance = ready_instance(&dir, &connector);

        // Daemon restarted under the first client.
        let reply = instance.query("select 1").await;
        assert!(reply.error().unwrap().is_transport());
        assert!(lock(&connector.clients)[0].is_closed());

        // Second client also fails once, then serves.
        let reply = instance.query("select 1").await;
        assert!(reply.error().unwrap().is_transport());
        let reply = instance.query("select 1").await;
        let rows = reply.into_result().unwrap();
        assert_eq!(rows[0].get("client").map(String::as_str), Some("3"));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn query_error_keeps_client() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::default());
        let instance = ready_instance(&dir, &connector);

        let reply = instance.query("select * from missing_table").await;
        assert!(matches!(reply.error(), Some(BrokerError::QueryFailed { .. })));

        let reply = instance.query("select 1").await;
        assert!(reply.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_clears_default_only_for_holder() {
        let registry = Arc::new(DefaultRegistry::new());
        let first = Arc::new(test_instance("first", &registry));
        let second = Arc::new(test_instance("second", &registry));
        assert!(first.mark_default());

        second.close().await.unwrap();
        assert_eq!(registry.current().unwrap().name(), "first");

        first.close().await.unwrap();
        assert!(registry.current().is_none());
    }

    #[tokio::test]
    async fn closed_instance_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::default());
        let instance = ready_instance(&dir, &connector);

        assert!(instance.query("select 1").await.is_ok());
        instance.close().await.unwrap();
        instance.close().await.unwrap();

        assert!(lock(&connector.clients)[0].is_closed());
        assert_eq!(instance.state(), InstanceState::Closed);
        assert!(matches!(
            instance.query("select 1").await.error(),
            Some(BrokerError::Closed(_))
        ));
        assert!(matches!(instance.start().await, Err(BrokerError::Closed(_))));
        assert!(!instance.mark_default());
    }

    #[tokio::test]
    async fn start_with_missing_binary_fails() {
        let registry = Arc::new(DefaultRegistry::new());
        let instance = test_instance("client", &registry);

        let err = instance.start().await.unwrap_err();
        assert!(matches!(err, BrokerError::Launch { .. }));
        assert_eq!(instance.state(), InstanceState::Created);
        assert!(instance.status().pid.is_none());
    }

    #[tokio::test]
    async fn replace_config_swaps_in_place() {
        let registry = Arc::new(DefaultRegistry::new());
        let instance = test_instance("client", &registry);

        let mut config = test_config("client", PathBuf::from("/tmp/other.em"));
        config.timeout_secs = 9;
        instance.replace_config(config);

        assert_eq!(instance.config().timeout_secs, 9);
        assert_eq!(instance.config().socket_path, PathBuf::from("/tmp/other.em"));
    }

    #[cfg(unix)]
    pub(crate) mod daemon {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        const PARSE_SOCKET: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    --extensions_socket=*) sock="${arg#--extensions_socket=}" ;;
  esac
done
"#;

        /// Writes an executable shell script standing in for osqueryd.
        pub(crate) fn fake_daemon(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("osqueryd");
            std::fs::write(&path, format!("{PARSE_SOCKET}{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        /// Retries spawns that race another test's fork holding the script open.
        pub(crate) async fn start_with_retry(instance: &Instance) {
            for _ in 0..10 {
                match instance.start().await {
                    Ok(()) => return,
                    Err(BrokerError::Launch { source, .. })
                        if source.raw_os_error() == Some(libc::ETXTBSY) =>
                    {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => panic!("start failed: {e}"),
                }
            }
            panic!("start kept failing with ETXTBSY");
        }

        pub(crate) fn process_alive(pid: u32) -> bool {
            unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
        }

        fn launched_instance(dir: &tempfile::TempDir, body: &str) -> Instance {
            let mut config = test_config("client", dir.path().join("osquery.em"));
            config.binary_path = fake_daemon(dir.path(), body);
            Instance::new(config, Arc::new(DefaultRegistry::new()))
                .with_connector(Arc::new(MockConnector::default()))
        }

        #[tokio::test]
        async fn start_query_close_kills_daemon() {
            let dir = tempfile::tempdir().unwrap();
            let instance = launched_instance(
                &dir,
                r#"echo "booting on $sock" >&2
: > "$sock"
exec sleep 30"#,
            );

            start_with_retry(&instance).await;
            assert_eq!(instance.state(), InstanceState::Launching);
            let pid = instance.status().pid.unwrap();
            assert!(process_alive(pid));
            assert!(matches!(
                instance.start().await,
                Err(BrokerError::AlreadyStarted(_))
            ));

            let reply = instance.query("select 1").await;
            assert!(reply.is_ok(), "unexpected error: {:?}", reply.error());
            assert_eq!(instance.state(), InstanceState::Connected);

            for _ in 0..50 {
                if !instance.diagnostics(10).is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let diagnostics = instance.diagnostics(10);
            assert!(diagnostics[0].starts_with("booting on "));

            instance.close().await.unwrap();
            assert!(!process_alive(pid));
            let status = instance.status();
            assert_eq!(status.pid, None);
            assert_eq!(
                status.exit.and_then(|e| e.signal),
                Some(libc::SIGKILL)
            );
        }

        #[tokio::test]
        async fn wait_task_records_exit_code() {
            let dir = tempfile::tempdir().unwrap();
            let instance = launched_instance(&dir, "exit 3");

            start_with_retry(&instance).await;
            for _ in 0..100 {
                if instance.status().exit.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert_eq!(
                instance.status().exit,
                Some(ProcessExit {
                    code: Some(3),
                    signal: None
                })
            );

            // Exit alone does not tear the instance down.
            assert_eq!(instance.state(), InstanceState::Launching);
            instance.close().await.unwrap();
            assert_eq!(instance.state(), InstanceState::Closed);
        }

        #[tokio::test]
        async fn death_by_signal_is_recorded() {
            let dir = tempfile::tempdir().unwrap();
            let instance = launched_instance(&dir, "kill -9 $$");

            start_with_retry(&instance).await;
            let pid = instance.status().pid.unwrap();
            for _ in 0..100 {
                if instance.status().exit.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            let exit = instance.status().exit.expect("exit recorded after reaping");
            assert_eq!(exit.code, None);
            assert_eq!(exit.signal, Some(libc::SIGKILL));
            assert!(!process_alive(pid));

            // Already reaped: close leaves the recorded exit as the daemon reported it.
            instance.close().await.unwrap();
            assert_eq!(instance.status().exit, Some(exit));
            assert_eq!(instance.state(), InstanceState::Closed);
        }

        #[tokio::test]
        async fn close_runs_configured_cleaner() {
            struct Counting(AtomicUsize);
            impl ResidualCleaner for Counting {
                fn clean(&self, _instance: &str) -> usize {
                    self.0.fetch_add(1, Ordering::SeqCst);
                    0
                }
            }

            let dir = tempfile::tempdir().unwrap();
            let cleaner = Arc::new(Counting(AtomicUsize::new(0)));
            let instance = launched_instance(&dir, "exec sleep 30")
                .with_cleaner(Arc::clone(&cleaner) as Arc<dyn ResidualCleaner>);

            start_with_retry(&instance).await;
            instance.close().await.unwrap();
            instance.close().await.unwrap();
            assert_eq!(cleaner.0.load(Ordering::SeqCst), 1);
        }
    }
}

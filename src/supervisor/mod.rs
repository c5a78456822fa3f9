// src/supervisor/mod.rs

//! Process lifecycle owner of the gateway: spawns and supervises the target
//! engine and monitor-client subprocesses, wires the control sockets, runs
//! the health probe, and drives ordered startup and shutdown.

pub mod logs;

use crate::config::Config;
use crate::core::model::ServiceMeta;
use crate::core::nqn;
use crate::discovery::DiscoveryService;
use crate::engine::EngineClient;
use crate::service::grpc::{self, MonitorRendezvous};
use crate::service::{CallMode, GatewayService, LogReloadHandle};
use crate::state::StateHandler;
use crate::store::{LocalState, ObjectStore, OmapState};
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, warn};

/// Cadence of the child-exit watchers.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(500);

type SharedChild = Arc<Mutex<Option<Child>>>;

pub struct GatewayServer {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    log_reload: Option<Arc<LogReloadHandle>>,
    name: String,
    shutting_down: Arc<AtomicBool>,
    spdk_process: SharedChild,
    monitor_client_process: SharedChild,
}

impl GatewayServer {
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        log_reload: Option<Arc<LogReloadHandle>>,
    ) -> Self {
        let name = config.gateway.name.clone();
        info!("Starting gateway {name}");
        Self {
            config: Arc::new(config),
            store,
            log_reload,
            name,
            shutting_down: Arc::new(AtomicBool::new(false)),
            spdk_process: Arc::new(Mutex::new(None)),
            monitor_client_process: Arc::new(Mutex::new(None)),
        }
    }

    /// Runs the gateway until a termination signal or a fatal component
    /// failure. Cleanup (children, socket, final log) happens before return.
    pub async fn serve(&self) -> Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(4);

        let result = self.startup(&fatal_tx).await;
        let running = match result {
            Ok(running) => running,
            Err(e) => {
                self.shutdown(None).await;
                return Err(e);
            }
        };

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, terminating gracefully...");
                Ok(())
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, terminating gracefully...");
                Ok(())
            }
            reason = fatal_rx.recv() => {
                let reason = reason.unwrap_or_else(|| "supervisor channel closed".to_string());
                error!("{reason}");
                Err(anyhow!(reason))
            }
        };

        self.shutdown(Some(running)).await;
        outcome
    }

    async fn startup(&self, fatal_tx: &mpsc::Sender<String>) -> Result<Running> {
        // Open the persistent group state and refuse legacy records.
        let omap = Arc::new(
            OmapState::open(Arc::clone(&self.store), self.config.state_object_name()).await?,
        );
        let state = omap.get_state().await?;
        OmapState::check_for_legacy_format(&state)?;

        // The monitor client delivers this peer's group id through the
        // one-shot rendezvous before anything else may proceed.
        let group_id = if self.config.gateway.enable_monitor_client {
            self.start_monitor_client(fatal_tx).await?
        } else {
            info!("Monitor client is disabled");
            0
        };
        info!("Gateway {} group id={group_id}", self.name);

        // Engine subprocess plus its three control sockets.
        let clients = self.start_spdk(fatal_tx).await?;

        self.register_service_map(group_id).await?;

        let local = Arc::new(LocalState::new());
        let service = Arc::new(GatewayService::new(
            Arc::clone(&self.config),
            group_id,
            Arc::clone(&clients.client),
            Arc::clone(&clients.subsystems_client),
            Arc::clone(&omap),
            Arc::clone(&local),
            self.log_reload.clone(),
        ));
        service.set_spdk_version(clients.version.clone());

        let handler = StateHandler::new(
            Arc::clone(&service),
            Arc::clone(&omap),
            Arc::clone(&local),
            self.config.gateway.state_update_interval_sec,
            self.config.gateway.state_update_notify,
        );
        service.attach_state_handler(&handler);

        // Our discovery responder replaces the engine's built-in one.
        if !self.config.gateway.enable_spdk_discovery_controller {
            if let Err(e) = clients
                .client
                .nvmf_delete_subsystem(nqn::DISCOVERY_NQN)
                .await
            {
                warn!("Delete discovery subsystem returned with error: {e}");
            }
            let discovery = DiscoveryService::new(&self.config, Arc::clone(&local));
            let updates = handler.subscribe();
            let fatal = fatal_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = discovery.run(updates).await {
                    let _ = fatal.send(format!("Discovery responder failed: {e}")).await;
                }
            });
        } else {
            info!("Using the engine's discovery controller");
        }

        // Converge on any pre-existing target state, then keep reconciling.
        let reconciler = handler.start().await?;

        let (grpc_stop_tx, grpc_stop_rx) = oneshot::channel::<()>();
        let grpc_service = Arc::clone(&service);
        let grpc_config = Arc::clone(&self.config);
        let fatal = fatal_tx.clone();
        let grpc_task = tokio::spawn(async move {
            let shutdown = async {
                let _ = grpc_stop_rx.await;
            };
            if let Err(e) = grpc::serve_gateway(grpc_service, &grpc_config, shutdown).await {
                let _ = fatal.send(format!("Gateway gRPC server failed: {e}")).await;
            }
        });

        // Engine log level from the configuration, once everything is up.
        let log_level = self.config.spdk.log_level.trim().to_string();
        if !log_level.is_empty() {
            if let Err(e) = service
                .set_spdk_nvmf_logs(Some(&log_level), Some(&log_level), CallMode::Authoritative)
                .await
            {
                warn!("Failed to set engine log level: {e}");
            }
        }

        self.spawn_ping_task(Arc::clone(&clients.ping_client), fatal_tx.clone());

        Ok(Running {
            reconciler,
            grpc_task,
            grpc_stop_tx,
        })
    }

    async fn shutdown(&self, running: Option<Running>) {
        self.shutting_down.store(true, Ordering::SeqCst);

        if let Some(running) = running {
            info!("Stopping the server...");
            let _ = running.grpc_stop_tx.send(());
            let _ = tokio::time::timeout(Duration::from_secs(5), running.grpc_task).await;
            running.reconciler.abort();
        }

        if self.monitor_client_process.lock().await.is_some() {
            self.stop_subprocess(
                &self.monitor_client_process,
                Duration::from_secs_f64(self.config.monitor.timeout.max(0.1)),
                "monitor client",
            )
            .await;
        }
        if self.spdk_process.lock().await.is_some() {
            self.stop_subprocess(
                &self.spdk_process,
                Duration::from_secs_f64(self.config.spdk.timeout.max(0.1)),
                "engine",
            )
            .await;
            let socket_path = self.config.rpc_socket_path();
            if Path::new(&socket_path).exists() {
                if let Err(e) = std::fs::remove_file(&socket_path) {
                    error!("An error occurred while removing RPC socket {socket_path}: {e}");
                }
            }
        }

        info!("Exiting the gateway process.");
        if self.config.logs.log_files_enabled {
            let dir = logs::gateway_log_dir(&self.config.logs.log_directory, &self.name);
            logs::compress_final_log_file(&dir);
        }
    }

    /// Spawns the monitor client and blocks on the rendezvous server until
    /// the monitor delivers this peer's group id.
    async fn start_monitor_client(&self, fatal_tx: &mpsc::Sender<String>) -> Result<u32> {
        let (group_tx, group_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let monitor_addr = grpc::monitor_address(&self.config);
        let socket_addr: std::net::SocketAddr = monitor_addr
            .parse()
            .with_context(|| format!("invalid monitor rendezvous address {monitor_addr}"))?;
        let rendezvous_server = tokio::spawn(async move {
            let shutdown = async {
                let _ = stop_rx.await;
            };
            tonic::transport::Server::builder()
                .add_service(MonitorRendezvous::new(group_tx).into_server())
                .serve_with_shutdown(socket_addr, shutdown)
                .await
        });
        info!("MonitorGroup server is listening on {monitor_addr} for group id");

        let mut cmd = Command::new(&self.config.monitor.client_path);
        cmd.arg("--gateway-name")
            .arg(&self.name)
            .arg("--gateway-address")
            .arg(grpc::gateway_address(&self.config))
            .arg("--gateway-pool")
            .arg(&self.config.store.pool)
            .arg("--gateway-group")
            .arg(&self.config.gateway.group)
            .arg("--monitor-group-address")
            .arg(&monitor_addr);
        if self.config.gateway.enable_auth {
            cmd.arg("--server-cert")
                .arg(&self.config.mtls.server_cert)
                .arg("--client-key")
                .arg(&self.config.mtls.client_key)
                .arg("--client-cert")
                .arg(&self.config.mtls.client_cert);
        }
        info!("Starting {:?}", cmd.as_std());
        let child = cmd
            .spawn()
            .with_context(|| {
                format!(
                    "Unable to start monitor client {}",
                    self.config.monitor.client_path
                )
            })?;
        if let Some(pid) = child.id() {
            info!("monitor client process id: {pid}");
        }
        *self.monitor_client_process.lock().await = Some(child);
        self.watch_child(
            Arc::clone(&self.monitor_client_process),
            "monitor client",
            fatal_tx.clone(),
        );

        let group_id = group_rx
            .await
            .map_err(|_| anyhow!("monitor rendezvous ended without a group id"))?;
        info!("Stopping the MonitorGroup server...");
        let _ = stop_tx.send(());
        let _ = rendezvous_server.await;
        info!("The MonitorGroup server stopped");
        Ok(group_id)
    }

    /// Spawns the engine subprocess and connects the primary, ping and
    /// subsystems control sockets.
    async fn start_spdk(&self, fatal_tx: &mpsc::Sender<String>) -> Result<EngineClients> {
        let spdk = &self.config.spdk;
        info!("Engine target path: {}", spdk.tgt_path);

        let sockdir = Path::new(&spdk.rpc_socket_dir);
        if !sockdir.is_dir() {
            warn!("Directory {} does not exist, will create it", sockdir.display());
            std::fs::create_dir_all(sockdir)
                .with_context(|| format!("Error trying to create {}", sockdir.display()))?;
        }
        let socket_path = self.config.rpc_socket_path();
        info!("Engine control socket: {socket_path}");

        let mut args: Vec<String> =
            vec!["-u".to_string(), "-r".to_string(), socket_path.clone()];
        args.extend(spdk.tgt_cmd_extra_args.split_whitespace().map(String::from));
        if !cpumask_set(&args) {
            let cpus = sysinfo::System::new_all().cpus().len().max(1);
            let mask = int_to_bitmask(cpus.min(4));
            info!("Engine auto-detected cpu mask: {mask}");
            args.push("-m".to_string());
            args.push(mask);
        }

        info!("Starting {} {}", spdk.tgt_path, args.join(" "));
        let child = Command::new(&spdk.tgt_path)
            .args(&args)
            .spawn()
            .with_context(|| format!("Unable to start engine {}", spdk.tgt_path))?;
        if let Some(pid) = child.id() {
            info!("Engine process id: {pid}");
        }
        *self.spdk_process.lock().await = Some(child);
        self.watch_child(Arc::clone(&self.spdk_process), "engine", fatal_tx.clone());

        let timeout = Duration::from_secs_f64(spdk.timeout.max(0.1));
        info!(
            "Attempting to initialize the engine: rpc_socket: {socket_path}, timeout: {:?}",
            timeout
        );
        let socket = Path::new(&socket_path);
        let client = Arc::new(EngineClient::connect(socket, timeout).await?);
        let ping_client = Arc::new(EngineClient::connect(socket, timeout).await?);
        let subsystems_client = Arc::new(EngineClient::connect(socket, timeout).await?);

        // Implicitly create the configured transports.
        for trtype in spdk.transports.split_whitespace() {
            self.create_transport(&client, &trtype.to_lowercase()).await?;
        }

        let version = match client.spdk_get_version().await {
            Ok(v) => {
                info!("Started engine with version \"{}\"", v.version);
                v.version
            }
            Err(e) => {
                error!("Can't read engine version: {e}");
                String::new()
            }
        };

        Ok(EngineClients {
            client,
            ping_client,
            subsystems_client,
            version,
        })
    }

    async fn create_transport(&self, client: &EngineClient, trtype: &str) -> Result<()> {
        let mut options = None;
        if trtype == "tcp" && !self.config.spdk.transport_tcp_options.is_empty() {
            let parsed: Value = serde_json::from_str(&self.config.spdk.transport_tcp_options)
                .context("Failed to parse spdk transport_tcp_options")?;
            match parsed {
                Value::Object(map) => options = Some(map),
                _ => return Err(anyhow!("spdk transport_tcp_options must be a JSON object")),
            }
        }
        info!("create_transport: {trtype} options: {options:?}");
        client
            .nvmf_create_transport(trtype, options)
            .await
            .with_context(|| format!("Create transport {trtype} returned with error"))?;
        Ok(())
    }

    /// Publishes this peer in the store's service map, so operators and
    /// peers can resolve group members.
    async fn register_service_map(&self, group_id: u32) -> Result<()> {
        let id = self
            .name
            .strip_prefix("client.nvmeof.")
            .unwrap_or(&self.name)
            .to_string();
        let meta = ServiceMeta {
            id,
            pool_name: self.config.store.pool.clone(),
            daemon_type: "gateway".to_string(),
            group: self.config.gateway.group.clone(),
            group_id,
            addr: self.config.gateway.addr.clone(),
            port: self.config.gateway.port,
        };
        self.store
            .service_register(&format!("gateway-{}", self.name), meta)
            .await
            .map_err(|e| anyhow!("Unable to register in the service map: {e}"))
    }

    /// Turns an unexpected child exit into a fatal supervisor failure,
    /// carrying the pid and exit status.
    fn watch_child(
        &self,
        child: SharedChild,
        name: &'static str,
        fatal_tx: mpsc::Sender<String>,
    ) {
        let shutting_down = Arc::clone(&self.shutting_down);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CHILD_POLL_INTERVAL).await;
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let mut guard = child.lock().await;
                let Some(proc) = guard.as_mut() else {
                    return;
                };
                let pid = proc.id();
                match proc.try_wait() {
                    Ok(Some(status)) => {
                        drop(guard);
                        if !shutting_down.load(Ordering::SeqCst) {
                            let _ = fatal_tx
                                .send(format!(
                                    "Gateway subprocess terminated: {name} pid={pid:?} \
                                     status={status}"
                                ))
                                .await;
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Failed to poll {name} subprocess: {e}");
                        return;
                    }
                }
            }
        });
    }

    /// Terminates a subprocess, escalating to a kill after the timeout.
    async fn stop_subprocess(&self, child: &SharedChild, timeout: Duration, name: &str) {
        let mut guard = child.lock().await;
        let Some(mut proc) = guard.take() else {
            return;
        };
        drop(guard);

        match proc.try_wait() {
            Ok(Some(status)) => {
                error!("{name} already terminated, exit status: {status}");
                return;
            }
            _ => {
                if let Some(pid) = proc.id() {
                    info!("Terminating {name} subprocess pid {pid} ...");
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
            }
        }

        match tokio::time::timeout(timeout, proc.wait()).await {
            Ok(Ok(status)) => info!("{name} subprocess exited with {status}"),
            Ok(Err(e)) => error!("Error waiting for {name} subprocess: {e}"),
            Err(_) => {
                error!("Timeout occurred while terminating {name} subprocess, killing it");
                let _ = proc.kill().await;
            }
        }
    }

    /// Periodically confirms communication with the engine; consecutive
    /// failures beyond the allowance abort the gateway.
    fn spawn_ping_task(&self, ping_client: Arc<EngineClient>, fatal_tx: mpsc::Sender<String>) {
        let interval =
            Duration::from_secs_f64(self.config.gateway.spdk_ping_interval_in_seconds.max(0.1));
        let allowed = self
            .config
            .gateway
            .allowed_consecutive_spdk_ping_failures
            .max(1);
        let shutting_down = Arc::clone(&self.shutting_down);
        tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                match ping_client.spdk_get_version().await {
                    Ok(_) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!("Engine ping failed ({consecutive_failures}): {e}");
                        if consecutive_failures >= allowed {
                            let _ = fatal_tx
                                .send(format!(
                                    "Engine ping failed {consecutive_failures} times, aborting"
                                ))
                                .await;
                            return;
                        }
                    }
                }
            }
        });
    }
}

struct EngineClients {
    client: Arc<EngineClient>,
    ping_client: Arc<EngineClient>,
    subsystems_client: Arc<EngineClient>,
    version: String,
}

struct Running {
    reconciler: tokio::task::JoinHandle<()>,
    grpc_task: tokio::task::JoinHandle<()>,
    grpc_stop_tx: oneshot::Sender<()>,
}

/// Converts a reactor count to the engine's hexadecimal cpu mask notation.
fn int_to_bitmask(n: usize) -> String {
    format!("0x{:X}", (1u64 << n) - 1)
}

/// True when a reactor mask is already present in the command line.
fn cpumask_set(args: &[String]) -> bool {
    args.iter()
        .any(|arg| arg == "-m" || arg == "--cpumask" || arg.starts_with("--cpumask="))
}

/// Builds the gateway supervisor and serves until shutdown.
pub async fn serve(
    config: Config,
    store: Arc<dyn ObjectStore>,
    log_reload: Option<Arc<LogReloadHandle>>,
) -> Result<()> {
    let server = GatewayServer::new(config, store, log_reload);
    server.serve().await
}

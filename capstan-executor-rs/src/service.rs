//! Executor service wiring: builds the shared context, starts the log
//! streamer, command socket, governor, disk accountant and the work
//! loops, and reacts to queue events and administrative commands.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capstan_rs::allocator::NodeAllocator;
use capstan_rs::keystore::Keystore;
use capstan_rs::queue::{BuildQueue, QueueEvent};
use capstan_rs::types::ResultKind;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builds::BuildRegistry;
use crate::command_socket::{Command, CommandSocket};
use crate::config::Config;
use crate::disk_accountant::DiskAccountant;
use crate::governor::Governor;
use crate::merger::Merger;
use crate::sensors::cpu::CpuSensor;
use crate::sensors::hdd::HddSensor;
use crate::sensors::pause::PauseSensor;
use crate::sensors::ram::RamSensor;
use crate::sensors::starting_builds::StartingBuildsSensor;
use crate::sensors::Sensor;
use crate::server;
use crate::streamer::LogStreamer;
use crate::update_queue::DeduplicateQueue;

/// Everything a build worker needs, threaded through constructors instead
/// of global state.
pub struct ExecutorContext {
    pub config: Config,
    pub hostname: String,
    /// Actual bound port of the log streamer.
    pub log_port: u16,
    pub queue: Arc<dyn BuildQueue>,
    pub allocator: Arc<dyn NodeAllocator>,
    pub keystore: Arc<dyn Keystore>,
    pub merger: Arc<Merger>,
    pub update_queue: Arc<DeduplicateQueue>,
    pub registry: Arc<BuildRegistry>,
    pub wake: Arc<Notify>,
    pub accepting_work: Arc<AtomicBool>,
    pub paused: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
    verbose: AtomicBool,
    keep_jobdir: AtomicBool,
    graceful: AtomicBool,
}

impl ExecutorContext {
    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::SeqCst)
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::SeqCst);
    }

    pub fn keep_jobdir(&self) -> bool {
        self.keep_jobdir.load(Ordering::SeqCst)
    }

    pub fn set_keep_jobdir(&self, keep: bool) {
        self.keep_jobdir.store(keep, Ordering::SeqCst);
    }

    pub fn is_graceful(&self) -> bool {
        self.graceful.load(Ordering::SeqCst)
    }

    /// Whether the lease loop may take new work right now.
    pub fn take_work(&self) -> bool {
        self.accepting_work.load(Ordering::SeqCst)
            && !self.is_graceful()
            && !self.shutdown.is_cancelled()
    }
}

pub struct Service {
    pub context: Arc<ExecutorContext>,
    streamer: LogStreamer,
    command_socket: CommandSocket,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    pub async fn start(
        config: Config,
        queue: Arc<dyn BuildQueue>,
        allocator: Arc<dyn NodeAllocator>,
        keystore: Arc<dyn Keystore>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.job_dir)?;
        std::fs::create_dir_all(&config.merger_dir)?;

        let streamer = LogStreamer::start(
            SocketAddr::new(config.host, config.finger_port),
            config.job_dir.clone(),
            config.finger_user.as_deref(),
        )
        .await?;
        let log_port = streamer.local_addr().port();
        info!(port = log_port, "log streamer listening");

        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        let merger = Arc::new(Merger::new(config.merger_dir.clone(), config.sources.clone()));
        let registry = Arc::new(BuildRegistry::new());
        let paused = Arc::new(AtomicBool::new(config.paused_on_start));
        let keep = config.keep_jobdir;

        let context = Arc::new(ExecutorContext {
            hostname,
            log_port,
            queue,
            allocator,
            keystore,
            merger,
            update_queue: Arc::new(DeduplicateQueue::new()),
            registry: registry.clone(),
            wake: Arc::new(Notify::new()),
            accepting_work: Arc::new(AtomicBool::new(!config.paused_on_start)),
            paused: paused.clone(),
            shutdown: CancellationToken::new(),
            verbose: AtomicBool::new(false),
            keep_jobdir: AtomicBool::new(keep),
            graceful: AtomicBool::new(false),
            config,
        });

        let (command_socket, command_rx) =
            CommandSocket::start(&context.config.command_socket)?;

        let mut tasks = Vec::new();

        // Queue events for our zones.
        let events = context.queue.subscribe(context.config.zone_filter());
        tasks.push(tokio::spawn(run_event_loop(context.clone(), events)));

        tasks.push(tokio::spawn(run_command_loop(context.clone(), command_rx)));

        tasks.push(tokio::spawn(server::run_update_loop(context.clone())));
        tasks.push(tokio::spawn(server::run_build_loop(context.clone())));

        let sensors: Vec<Box<dyn Sensor>> = vec![
            Box::new(CpuSensor::new(context.config.effective_max_load())),
            Box::new(RamSensor::new(context.config.min_avail_mem)),
            Box::new(HddSensor::new(
                context.config.min_avail_hdd,
                context.config.job_dir.clone(),
            )),
            Box::new(StartingBuildsSensor::new(
                registry.clone(),
                context.config.effective_max_load(),
            )),
            Box::new(PauseSensor::new(paused)),
        ];
        let governor = Governor::new(
            sensors,
            context.accepting_work.clone(),
            context.wake.clone(),
        );
        tasks.push(tokio::spawn(governor.run(context.shutdown.clone())));

        let accountant_registry = registry.clone();
        let accountant = DiskAccountant::new(
            context.config.job_dir.clone(),
            context.config.merger_dir.clone(),
            context.config.disk_limit_per_job,
            Arc::new(move |dir: &std::path::Path| {
                // Job dirs are named `<uuid>` or `<uuid>_<suffix>`.
                let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                    return;
                };
                let uuid = name.split('_').next().unwrap_or(name);
                if let Some(handle) = accountant_registry.get(uuid) {
                    warn!(build = %uuid, "killing build for exceeding its disk limit");
                    handle.abort(Some(ResultKind::DiskFull));
                }
            }),
        );
        tasks.push(tokio::spawn(accountant.run(context.shutdown.clone())));

        Ok(Self { context, streamer, command_socket, tasks })
    }

    pub fn log_port(&self) -> u16 {
        self.context.log_port
    }

    pub fn streamer(&self) -> &LogStreamer {
        &self.streamer
    }

    /// Run until stopped, then tear everything down.
    pub async fn join(mut self) {
        self.context.shutdown.cancelled().await;
        self.streamer.stop();
        self.command_socket.stop();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("executor stopped");
    }

    /// Hard stop: abort running builds and exit.
    pub fn stop(&self) {
        info!("stopping executor");
        self.context.registry.abort_all();
        self.context.shutdown.cancel();
    }
}

async fn run_event_loop(
    context: Arc<ExecutorContext>,
    mut events: mpsc::UnboundedReceiver<QueueEvent>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = context.shutdown.cancelled() => return,
        };
        match event {
            QueueEvent::NewRequest => {
                context.wake.notify_one();
            }
            QueueEvent::Cancel(uuid) => {
                info!(build = %uuid, "cancel requested");
                if let Some(handle) = context.registry.get(&uuid) {
                    handle.abort(Some(ResultKind::Aborted));
                }
                if let Ok(Some(request)) = context.queue.lookup(&uuid).await {
                    if let Err(err) = context.queue.fulfill_cancel(&request).await {
                        warn!(build = %uuid, %err, "could not fulfill cancel");
                    }
                }
            }
            QueueEvent::Resume(uuid) => {
                debug!(build = %uuid, "resume requested");
                match context.registry.get(&uuid) {
                    Some(handle) => handle.request_resume(),
                    None => debug!(build = %uuid, "no worker for resume"),
                }
            }
            QueueEvent::Delete(uuid) => {
                // The request vanished out from under us; stop working on
                // it, nothing to report.
                if let Some(handle) = context.registry.get(&uuid) {
                    warn!(build = %uuid, "request deleted, aborting build");
                    handle.abort(None);
                }
            }
        }
    }
}

async fn run_command_loop(
    context: Arc<ExecutorContext>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => return,
            },
            _ = context.shutdown.cancelled() => return,
        };
        info!(?command, "processing command");
        match command {
            Command::Stop => {
                context.registry.abort_all();
                context.shutdown.cancel();
            }
            Command::Graceful => {
                // Finish what we have, lease nothing new, then stop.
                context.graceful.store(true, Ordering::SeqCst);
                let context = context.clone();
                tokio::spawn(async move {
                    loop {
                        if context.registry.is_empty() {
                            context.shutdown.cancel();
                            return;
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                });
            }
            Command::Pause => context.paused.store(true, Ordering::SeqCst),
            Command::Unpause => {
                context.paused.store(false, Ordering::SeqCst);
                context.wake.notify_one();
            }
            Command::Verbose => context.set_verbose(true),
            Command::Unverbose => context.set_verbose(false),
            Command::Keep => context.set_keep_jobdir(true),
            Command::Nokeep => context.set_keep_jobdir(false),
            Command::Repl | Command::Norepl => {
                warn!("repl commands are not supported");
            }
        }
    }
}

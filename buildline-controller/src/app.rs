use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::{Config, ConfigFile, PipelinesMap};
use crate::database::Database;
use crate::dispatcher::Dispatcher;
use crate::executor::K8sExecutor;
use crate::git::GitCli;
use crate::server::{spawn_server, TriggerCtx};
use crate::state::StateStore;
use crate::watcher::{ChangeWatcher, RevisionCache};

/// Capacity of the build backlog channel.
const QUEUE_CAPACITY: usize = 1000;

/// The application object for when buildline is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the change watcher.
    watcher_handle: JoinHandle<Result<()>>,
    /// The join handle of the build dispatcher.
    dispatcher_handle: JoinHandle<Result<()>>,
    /// The join handle of the HTTP server.
    server_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(100);

        // Initialize this node's storage & persisted state.
        let db = Database::new(config.clone()).await.context("error opening state database")?;
        let state = StateStore::load(&db).await.context("error loading persisted pipeline state")?;

        // Load the pipelines config file; a startup failure here is fatal.
        let file = ConfigFile::load(&config.pipelines_file).await.context("error loading pipelines config file")?;
        let check_frequency = Duration::from_secs(file.check_frequency);
        let pipelines: PipelinesMap = Arc::new(ArcSwap::from_pointee(file.pipeline_configs()));

        // Initialize collaborators.
        let git = Arc::new(GitCli::new(&config));
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        let executor = Arc::new(K8sExecutor::new(client, config.clone()));

        // Recover baselines for pipelines without local state, then persist.
        state.recover(&pipelines.load_full(), git.as_ref(), executor.as_ref()).await;
        state.snapshot().await.context("error persisting recovered pipeline state")?;

        // Spawn the core loops.
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let cache = RevisionCache::default();
        let watcher_handle = ChangeWatcher::new(
            config.clone(),
            pipelines.clone(),
            state.clone(),
            cache.clone(),
            git.clone(),
            queue_tx.clone(),
            check_frequency,
            shutdown_tx.clone(),
        )
        .spawn();
        let dispatcher_handle = Dispatcher::new(
            config.clone(),
            pipelines.clone(),
            state.clone(),
            cache,
            git,
            executor,
            queue_rx,
            shutdown_tx.clone(),
        )
        .spawn();
        let server_handle = spawn_server(
            &config,
            Arc::new(TriggerCtx {
                pipelines,
                state,
                queue_tx,
            }),
            shutdown_tx.subscribe(),
        );

        Ok(Self {
            _config: config,
            _db: db,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            watcher_handle,
            dispatcher_handle,
            server_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("buildline is shutting down");
        if let Err(err) = self.watcher_handle.await.context("error joining change watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down change watcher");
        }
        if let Err(err) = self.dispatcher_handle.await.context("error joining dispatcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down build dispatcher");
        }
        if let Err(err) = self.server_handle.await.context("error joining HTTP server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down HTTP server");
        }

        tracing::debug!("buildline shutdown complete");
        Ok(())
    }
}

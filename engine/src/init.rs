//! Wiring every component from configuration.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use keel_context::{ErrorClassifier, TranscriptStore};

use crate::compaction::CompactionOrchestrator;
use crate::config::KeelConfig;
use crate::continuation::IdleNudge;
use crate::dispatch::Dispatcher;
use crate::notifications::Notifier;
use crate::ports::{BackgroundTasks, ConversationApi, RecoveryListener};
use crate::pruning::PruningService;
use crate::recovery::SessionRecovery;
use crate::self_loop::{LoopStateFile, SelfLoop};
use crate::Keel;

/// Everything the host has to provide.
#[derive(Clone)]
pub struct HostPorts {
    pub api: Arc<dyn ConversationApi>,
    pub notifier: Arc<dyn Notifier>,
    pub tasks: Arc<dyn BackgroundTasks>,
}

impl Keel {
    /// Load `~/.keel/config.toml` (or `$KEEL_CONFIG`) and build the engine.
    pub fn new(ports: HostPorts) -> anyhow::Result<Self> {
        let config = KeelConfig::load()
            .context("loading keel config")?
            .unwrap_or_default();
        Self::from_config(&config, ports)
    }

    pub fn from_config(config: &KeelConfig, ports: HostPorts) -> anyhow::Result<Self> {
        let root = config
            .storage_root()
            .context("no storage root configured and home directory is unknown")?;
        let loop_file = config
            .loop_state_file()
            .context("no loop state file configured and home directory is unknown")?;

        let store = Arc::new(TranscriptStore::new(root));
        let classifier = ErrorClassifier::new(config.model_registry());

        let pruning = Arc::new(PruningService::new(
            Arc::clone(&store),
            config.pruning().to_pruning_config(),
        ));
        let nudge = Arc::new(IdleNudge::new(
            Arc::clone(&ports.api),
            Arc::clone(&ports.notifier),
            Arc::clone(&ports.tasks),
            config.continuation(),
        ));
        let self_loop = Arc::new(SelfLoop::new(
            Arc::clone(&ports.api),
            Arc::clone(&ports.notifier),
            LoopStateFile::new(loop_file),
            config.self_loop(),
        ));
        let compaction = Arc::new(
            CompactionOrchestrator::new(
                Arc::clone(&ports.api),
                Arc::clone(&ports.notifier),
                Arc::clone(&store),
                classifier.clone(),
                config.compaction(),
            )
            .with_pruning(Arc::clone(&pruning))
            .with_listener(Arc::clone(&nudge) as Arc<dyn RecoveryListener>)
            .with_listener(Arc::clone(&self_loop) as Arc<dyn RecoveryListener>),
        );
        let recovery = Arc::new(
            SessionRecovery::new(
                Arc::clone(&ports.api),
                Arc::clone(&ports.notifier),
                Arc::clone(&store),
                config.recovery(),
            )
            .with_listener(Arc::clone(&nudge) as Arc<dyn RecoveryListener>)
            .with_listener(Arc::clone(&self_loop) as Arc<dyn RecoveryListener>),
        );

        let dispatcher = Dispatcher::new()
            .with_handler(recovery.clone())
            .with_handler(compaction.clone())
            .with_handler(pruning.clone())
            .with_handler(nudge.clone())
            .with_handler(self_loop.clone());

        info!(storage = %store.root().display(), handlers = ?dispatcher.handler_names(), "Keel engine ready");

        Ok(Self {
            store,
            classifier,
            compaction,
            pruning,
            nudge,
            self_loop,
            dispatcher,
        })
    }
}

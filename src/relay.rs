//! Relay assembly: wires the stores, channels, correlator, applier and
//! supervisor together behind one `AppState`.

use std::sync::Arc;

use axum::Router;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{AppState, relay_routes};
use crate::auth::{DeviceGuard, DeviceId, WebhookAuth};
use crate::channels::{ChannelRegistry, GatewayChannel, LoopbackChannel, SmsChannel};
use crate::config::{ChannelBackend, RelayConfig};
use crate::delivery::{
    CompletionSignal, Correlator, FailureStreak, OutcomeApplier, spawn_correlator,
};
use crate::dispatch::{Dispatcher, DispatchSupervisor, ProgressObserver};
use crate::error::Result;
use crate::store::LibSqlBackend;

/// Capacity of the completion-signal queue.
const SIGNAL_QUEUE_CAPACITY: usize = 1024;

/// A fully wired relay.
pub struct Relay {
    pub state: AppState,
    pub applier: Arc<OutcomeApplier>,
    correlator: JoinHandle<()>,
}

impl Relay {
    /// Resolve the device id and build channels from `config`.
    pub async fn start(config: &RelayConfig, db: Arc<LibSqlBackend>) -> Result<Self> {
        let device = DeviceId::resolve(config.device_id.clone(), db.as_ref()).await?;
        let backend = config.channel.clone();
        let ok_code = config.delivery.ok_result_code;

        Ok(Self::assemble(config, db, device, move |signals| {
            build_registry(&backend, signals, ok_code)
        }))
    }

    /// Wire everything around a caller-built channel registry. The closure
    /// receives the sender half of the completion-signal queue.
    pub fn assemble(
        config: &RelayConfig,
        db: Arc<LibSqlBackend>,
        device: DeviceId,
        channels: impl FnOnce(mpsc::Sender<CompletionSignal>) -> ChannelRegistry,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        let registry = Arc::new(channels(signal_tx.clone()));

        let observer = ProgressObserver::new();
        let streak = FailureStreak::new();

        let applier = Arc::new(OutcomeApplier::new(
            db.clone(),
            db.clone(),
            db.clone(),
            db.clone(),
            Arc::clone(&observer),
            Arc::clone(&streak),
            config.delivery.clone(),
        ));
        let correlator = spawn_correlator(
            Correlator::new(config.delivery.ok_result_code),
            Arc::clone(&applier),
            signal_rx,
        );

        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            db.clone(),
            Arc::clone(&registry),
            Arc::clone(&observer),
            config.dispatch.clone(),
        ));
        let supervisor = Arc::new(DispatchSupervisor::new(
            dispatcher,
            db.clone(),
            Arc::clone(&observer),
            Arc::clone(&streak),
        ));
        let guard = Arc::new(DeviceGuard::new(db.clone(), db.clone()));
        let webhook = WebhookAuth::new(
            config
                .webhook_token
                .clone()
                .map(SecretString::from)
                .as_ref(),
        );

        let state = AppState {
            guard,
            supervisor,
            observer,
            accounts: db.clone(),
            audit: db,
            signals: signal_tx,
            webhook,
            streak,
            device,
            default_mode: config.dispatch.mode,
            channel_names: registry.names(),
        };

        Self {
            state,
            applier,
            correlator,
        }
    }

    pub fn router(&self) -> Router {
        relay_routes(self.state.clone())
    }

    /// Stop dispatching and the correlator.
    pub async fn shutdown(self) {
        self.state.supervisor.stop().await;
        self.correlator.abort();
    }
}

fn build_registry(
    backend: &ChannelBackend,
    signals: mpsc::Sender<CompletionSignal>,
    ok_code: i32,
) -> ChannelRegistry {
    match backend {
        ChannelBackend::Loopback => {
            ChannelRegistry::new(Arc::new(LoopbackChannel::new("loopback", signals, ok_code)))
        }
        ChannelBackend::Gateway { urls, token } => {
            let mut channels = urls.iter().enumerate().map(|(slot, url)| {
                let token = token.clone().map(SecretString::from);
                Arc::new(GatewayChannel::new(slot, url.clone(), token)) as Arc<dyn SmsChannel>
            });
            // Config guarantees at least one URL; fall back to loopback otherwise
            let default = channels.next().unwrap_or_else(|| {
                Arc::new(LoopbackChannel::new("loopback", signals.clone(), ok_code))
            });
            channels.fold(ChannelRegistry::new(default), ChannelRegistry::with_channel)
        }
    }
}

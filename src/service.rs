//! Gateway control loop.
//!
//! One task, one event channel. Timers, the broker session pump and the
//! acquisition transport all feed the same [`Event`] enum, so every state
//! transition happens in one place and tests can drive the service with
//! synthetic events instead of sockets.
//!
//! Ordering guarantees fall out of the single-task design: a flush tick
//! fully drains the ingress queue before the next event is looked at, and
//! a reconnect settles the connection state before any publish consults it.

use crate::config::{self, ConfigDirective, ConfigError, GatewayConfig};
use crate::health::{
    StatusReporter, ERROR_BROKER_LOST, ERROR_SAVE_CONFIG, ERROR_TRANSPORT_LOST, STATUS_HEALTHY,
};
use crate::ingress::IngressQueue;
use crate::mqtt::{
    BrokerEvent, BrokerSession, ConnectionState, PublishError, PublishPipeline,
    RedeliveryResolver, ReplayAction, SessionEvent, SideEffect, Supervisor, SupervisorEvent,
    RECONNECT_DELAY,
};
use crate::store::{LogStore, StoreError};
use crate::transport::commands::{CommandQueue, RetryOutcome, COMMAND_RETRY_DELAY};
use crate::transport::{Frame, Ident, TransportEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything the control loop reacts to.
#[derive(Debug)]
pub enum Event {
    Transport(TransportEvent),
    Broker(SessionEvent),
    FlushTick { generation: u64 },
    ReconnectDue { generation: u64 },
    CommandRetryDue { seq: u64 },
}

pub struct GatewayService {
    config: GatewayConfig,
    config_path: PathBuf,
    device_id: String,
    dns: String,

    store: Option<Arc<LogStore>>,
    ingress: IngressQueue,
    pipeline: PublishPipeline,
    resolver: RedeliveryResolver,
    supervisor: Supervisor,
    session: Option<BrokerSession>,
    commands: CommandQueue,
    reporter: StatusReporter,
    transport_up: bool,

    /// Command lines toward the acquisition daemon.
    transport_tx: mpsc::Sender<String>,
    /// Handed to each broker session pump.
    session_tx: mpsc::Sender<SessionEvent>,
    /// Cloned into timer tasks so they can wake the loop.
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,

    flush_cancel: Option<CancellationToken>,
}

impl GatewayService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GatewayConfig,
        config_path: PathBuf,
        device_id: String,
        store: Option<Arc<LogStore>>,
        reporter: StatusReporter,
        transport_tx: mpsc::Sender<String>,
        session_tx: mpsc::Sender<SessionEvent>,
        events_tx: mpsc::Sender<Event>,
        events_rx: mpsc::Receiver<Event>,
    ) -> Self {
        let dns = config.network.dns.clone();
        let pipeline = PublishPipeline::new(store.clone());
        Self {
            config,
            config_path,
            device_id,
            dns,
            store,
            ingress: IngressQueue::new(),
            pipeline,
            resolver: RedeliveryResolver::new(),
            supervisor: Supervisor::new(),
            session: None,
            commands: CommandQueue::new(),
            reporter,
            transport_up: false,
            transport_tx,
            session_tx,
            events_tx,
            events_rx,
            flush_cancel: None,
        }
    }

    pub async fn run(mut self) {
        if !self.config.mqtt_broker.enabled {
            info!("MQTT module is disabled. Enable & re-run");
            return;
        }

        self.apply(SupervisorEvent::ConnectRequested).await;

        while let Some(event) = self.events_rx.recv().await {
            self.handle(event).await;
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Broker(session_event) => {
                // Events from a superseded session must not corrupt the
                // current connection state.
                if session_event.generation != self.supervisor.generation() {
                    debug!(
                        generation = session_event.generation,
                        current = self.supervisor.generation(),
                        "dropping stale session event"
                    );
                    return;
                }
                self.handle_broker(session_event.event).await;
            }
            Event::Transport(transport_event) => self.handle_transport(transport_event).await,
            Event::FlushTick { generation } => {
                if generation == self.supervisor.generation() {
                    self.flush().await;
                }
            }
            Event::ReconnectDue { generation } => {
                self.apply(SupervisorEvent::ReconnectTimerFired { generation })
                    .await;
            }
            Event::CommandRetryDue { seq } => self.command_retry(seq).await,
        }
    }

    /// Runs a supervisor transition and executes its side effects.
    async fn apply(&mut self, event: SupervisorEvent) {
        for effect in self.supervisor.apply(event) {
            match effect {
                SideEffect::OpenSession => self.open_session(),
                SideEffect::SubscribeConfigTopic => self.subscribe_config_topic().await,
                SideEffect::StartRedelivery => self.start_redelivery().await,
                SideEffect::StartFlushTicker => self.start_flush_ticker(),
                SideEffect::ReportConnectionLost => {
                    self.pipeline.on_connection_lost();
                    self.resolver.reset();
                    self.reporter.report(ERROR_BROKER_LOST, "broker conn lost");
                }
                SideEffect::ReportConnected => self.report_healthy_if_ready(),
                SideEffect::ScheduleReconnect { generation } => {
                    self.schedule_reconnect(generation)
                }
            }
        }
    }

    fn open_session(&mut self) {
        let settings = &self.config.mqtt_broker.config;
        info!(
            uri = settings.uri,
            port = settings.port,
            generation = self.supervisor.generation(),
            "connecting to broker"
        );
        self.session = Some(BrokerSession::open(
            settings,
            &self.device_id,
            self.supervisor.generation(),
            self.session_tx.clone(),
        ));
    }

    fn schedule_reconnect(&self, generation: u64) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            let _ = events.send(Event::ReconnectDue { generation }).await;
        });
    }

    fn start_flush_ticker(&mut self) {
        // Replace any ticker from a previous session.
        if let Some(cancel) = self.flush_cancel.take() {
            cancel.cancel();
        }

        let period =
            std::time::Duration::from_secs(self.config.mqtt_broker.config.post.time.max(1));
        let generation = self.supervisor.generation();
        let events = self.events_tx.clone();
        let cancel = CancellationToken::new();
        self.flush_cancel = Some(cancel.clone());

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The immediate first tick would flush an empty queue.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        if events.send(Event::FlushTick { generation }).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn cancel_flush_ticker(&mut self) {
        if let Some(cancel) = self.flush_cancel.take() {
            cancel.cancel();
        }
    }

    async fn handle_broker(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => self.apply(SupervisorEvent::BrokerConnected).await,
            BrokerEvent::Subscribed => debug!("config topic subscription confirmed"),
            BrokerEvent::PublishQueued(pkid) => self.pipeline.on_queued(pkid),
            BrokerEvent::PublishConfirmed(pkid) => {
                let replay_pending = !self.resolver.is_idle();
                match self.pipeline.on_confirmed(pkid, replay_pending) {
                    Ok(Some(confirmed)) => {
                        debug!(topic = confirmed.topic, "publish confirmed");
                        if confirmed.was_replay {
                            self.continue_redelivery().await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("failed to record publish confirmation: {e}"),
                }
            }
            BrokerEvent::Message { topic, payload } => {
                debug!(topic, "inbound config message");
                self.handle_config_message(&payload).await;
            }
            BrokerEvent::ConnectionLost(reason) => {
                warn!("broker connection lost: {reason}");
                self.apply(SupervisorEvent::ConnectionLost).await;
            }
        }
    }

    async fn subscribe_config_topic(&self) {
        let filter = format!(
            "{}/config/+/{}",
            self.config.mqtt_broker.config.tenant, self.device_id
        );
        if let Some(session) = &self.session {
            match session.subscribe(&filter).await {
                Ok(()) => info!(filter, "subscribed to device config"),
                Err(e) => warn!("config subscription failed: {e}"),
            }
        }
    }

    fn sensor_topic(&self) -> String {
        format!(
            "{}/sensors/{}",
            self.config.mqtt_broker.config.tenant, self.device_id
        )
    }

    // ---- periodic flush -------------------------------------------------

    /// Drains the ingress queue into one batched publish. Samples are
    /// already durable; a failed publish only costs the in-memory copy,
    /// redelivery picks them up from the store.
    async fn flush(&mut self) {
        if self.ingress.is_empty() {
            return;
        }

        let samples = self.ingress.drain_all();
        let count = samples.len();
        let payload = match serde_json::to_vec(&samples) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to serialize sensor batch: {e}");
                return;
            }
        };

        info!(count, "broadcasting sensors");
        let topic = self.sensor_topic();
        let state = self.supervisor.state();
        let client = self.session.as_ref().map(|s| s.client());
        match self.pipeline.publish(state, client, &topic, payload, None).await {
            Ok(()) => {}
            Err(PublishError::NotConnected) => {
                debug!("broker disconnected, aborting flush; samples stay in the store")
            }
            Err(e) => warn!("flush publish failed: {e}"),
        }
    }

    // ---- redelivery ------------------------------------------------------

    async fn start_redelivery(&mut self) {
        let Some(store) = self.store.clone() else {
            debug!("store degraded, redelivery disabled for this run");
            return;
        };
        let topic = self.sensor_topic();
        let action = self.resolver.begin(&store, &topic);
        self.run_replay_action(action).await;
    }

    async fn continue_redelivery(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let topic = self.sensor_topic();
        let action = self.resolver.on_batch_confirmed(&store, &topic);
        self.run_replay_action(action).await;
    }

    async fn run_replay_action(&mut self, action: Result<ReplayAction, StoreError>) {
        match action {
            Ok(ReplayAction::Publish {
                payload,
                high_water,
                count,
            }) => {
                info!(count, high_water, "replaying unconfirmed samples");
                let topic = self.sensor_topic();
                let state = self.supervisor.state();
                let client = self.session.as_ref().map(|s| s.client());
                if let Err(e) = self
                    .pipeline
                    .publish(state, client, &topic, payload, Some(high_water))
                    .await
                {
                    // The reconnect flow re-triggers replay from the last
                    // confirmed point; no resolver-side retry.
                    warn!("replay publish failed: {e}");
                    self.resolver.reset();
                }
            }
            Ok(ReplayAction::AlreadyResolving) => debug!("redelivery already in progress"),
            Ok(ReplayAction::NothingToReplay) => {
                info!("no prior posts, nothing to replay");
                self.write_held_confirmations();
            }
            Ok(ReplayAction::CaughtUp) => {
                info!("redelivery caught up");
                self.write_held_confirmations();
            }
            Err(e) => {
                warn!("redelivery query failed: {e}");
                self.resolver.reset();
            }
        }
    }

    /// Releases live confirmations the pipeline held back during the replay
    /// pass that just finished.
    fn write_held_confirmations(&mut self) {
        match self.pipeline.flush_deferred() {
            Ok(0) => {}
            Ok(count) => debug!(count, "recorded live confirmations held during replay"),
            Err(e) => warn!("failed to record held confirmations: {e}"),
        }
    }

    // ---- acquisition transport -------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.transport_up = true;
                self.report_healthy_if_ready();
                self.send_next_command().await;
            }
            TransportEvent::Disconnected => {
                self.transport_up = false;
                self.reporter
                    .report(ERROR_TRANSPORT_LOST, "acquisition link lost");
            }
            TransportEvent::Frame(frame) => match frame.ident {
                Ident::Acq => self.ingest_sample(frame),
                Ident::Ack => {
                    if let Some(line) = self.commands.acknowledge() {
                        debug!(line, "sensor command accepted");
                    }
                    self.send_next_command().await;
                }
                Ident::Nack => {
                    if let Some(line) = self.commands.acknowledge() {
                        warn!(line, "sensor command rejected");
                    }
                    self.send_next_command().await;
                }
                Ident::Cfg => self.echo_sensor_config(frame).await,
            },
        }
    }

    /// A sample goes two places at once: durably into the store and into
    /// the ingress queue for the next flush.
    fn ingest_sample(&mut self, frame: Frame) {
        let sample = match frame.into_sample() {
            Ok(sample) => sample,
            Err(e) => {
                warn!("dropping malformed sample: {e}");
                return;
            }
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.append_sample(&sample) {
                warn!("failed to persist sample: {e}");
            }
        }
        self.ingress.offer(sample);
    }

    /// The acquisition daemon confirmed a sensor reconfiguration; echo it
    /// on the config topic so the backend sees the effective settings.
    async fn echo_sensor_config(&mut self, frame: Frame) {
        let (Some(name), Some(period)) = (frame.name.clone(), frame.time) else {
            warn!("incomplete sensor config confirmation: {frame:?}");
            return;
        };

        let topic = format!(
            "{}/config/sensors/{}",
            self.config.mqtt_broker.config.tenant, self.device_id
        );
        let payload = serde_json::json!({
            "user": "device",
            "sensor": {
                "sensor": name,
                "period": period,
                "ts": chrono::Utc::now().timestamp(),
            }
        });
        let state = self.supervisor.state();
        let client = self.session.as_ref().map(|s| s.client());
        if let Err(e) = self
            .pipeline
            .publish(state, client, &topic, payload.to_string().into_bytes(), None)
            .await
        {
            warn!("sensor config echo failed: {e}");
        }
    }

    async fn send_next_command(&mut self) {
        if !self.transport_up {
            return;
        }
        let Some((line, seq)) = self.commands.next_to_send() else {
            return;
        };
        self.dispatch_command(line, seq).await;
    }

    async fn dispatch_command(&mut self, line: String, seq: u64) {
        if let Err(e) = self.transport_tx.send(line).await {
            warn!("failed to hand command to transport: {e}");
            return;
        }
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COMMAND_RETRY_DELAY).await;
            let _ = events.send(Event::CommandRetryDue { seq }).await;
        });
    }

    async fn command_retry(&mut self, seq: u64) {
        match self.commands.retry(seq) {
            RetryOutcome::Resend { line, seq } => {
                debug!(line, "re-sending unanswered sensor command");
                self.dispatch_command(line, seq).await;
            }
            RetryOutcome::Dropped(line) => {
                warn!(line, "sensor command dropped after repeated timeouts");
                self.send_next_command().await;
            }
            RetryOutcome::Idle => {}
        }
    }

    // ---- inbound configuration --------------------------------------------

    async fn handle_config_message(&mut self, payload: &[u8]) {
        let message: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Error config: not valid JSON ({e})");
                return;
            }
        };

        let directives = match config::parse_inbound(&message) {
            Ok(directives) => directives,
            Err(ConfigError::Rejected(reason)) => {
                warn!("Error config: {reason}");
                return;
            }
            Err(e) => {
                warn!("Error config: {e}");
                return;
            }
        };

        for directive in directives {
            match directive {
                ConfigDirective::SetDns(dns) => {
                    info!(dns, "applying DNS change");
                    self.dns = dns;
                }
                ConfigDirective::ConfigureSensor { sensor, period } => {
                    let line = match serde_json::to_string(&Frame::configure(&sensor, period)) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("failed to encode sensor command: {e}");
                            continue;
                        }
                    };
                    info!(sensor, period, "queueing acquisition period change");
                    self.commands.enqueue(line);
                    self.send_next_command().await;
                }
                ConfigDirective::UpdateBroker(patch) => self.reconfigure_broker(patch).await,
            }
        }
    }

    /// Persist the new broker settings, stop the flush ticker, drop the
    /// current session and reconnect with the merged config.
    async fn reconfigure_broker(&mut self, patch: serde_json::Value) {
        if let Err(e) = GatewayConfig::save_broker_patch(&self.config_path, &patch) {
            warn!("broker config not accepted: {e}");
            self.reporter
                .report(ERROR_SAVE_CONFIG, "failed to persist broker config");
            return;
        }

        self.cancel_flush_ticker();

        match GatewayConfig::load(&self.config_path) {
            Ok(config) => self.config = config,
            Err(e) => {
                warn!("reloading merged config failed: {e}");
                return;
            }
        }

        let Some(session) = &self.session else {
            self.apply(SupervisorEvent::ConnectRequested).await;
            return;
        };

        // In-flight publishes die with the session either way.
        self.pipeline.on_connection_lost();
        self.resolver.reset();

        info!("disconnecting current session before reconfiguration");
        if session.disconnect().await.is_ok() {
            // The old session stays alive until its pump reports the close;
            // that confirmation (or the fallback timer) reconnects.
            self.apply(SupervisorEvent::DisconnectRequested).await;
        } else {
            // Could not even queue the disconnect; retry on the usual
            // reconnect delay instead of racing the dead session.
            warn!("disconnect request failed, falling back to delayed reconnect");
            self.session = None;
            self.apply(SupervisorEvent::DisconnectFailed).await;
        }
    }

    // ---- status ------------------------------------------------------------

    /// Healthy means every collaborator is up: broker connected,
    /// acquisition link alive and the store usable.
    fn report_healthy_if_ready(&self) {
        if self.transport_up
            && self.store.is_some()
            && self.supervisor.state() == ConnectionState::Connected
        {
            self.reporter.report(STATUS_HEALTHY, "all subsystems up");
        }
    }
}

/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::{
    audio::{
        CaptureChannel, JackStatusReport, PortFilter, PortsReport, RecordingInfo,
        RecordingSummary, RunningState, VoiceStream, graph::GraphSnapshot,
        recorder::{self, WriterHandle},
    },
    config::Config,
    error::{ErrorKind, SkeletonCrewResult, ToolError, ToolResult},
    events::{Event, EventBridge},
    model::{JackConnection, JackPort, PortDirection, PortKind, TransportState},
};
use jack::{AudioIn, Client, ClientOptions, Control, NotificationHandler, Port, ProcessScope};
use ringbuf::{HeapCons, HeapRb, traits::Producer, traits::Split};
use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{Instant, interval},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

/// Reconnect back-off after losing the JACK server: 1, 2, 5, 10 s, then
/// every 30 s.
const RECONNECT_BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

const TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportReport {
    pub state: TransportState,
    pub frame: u64,
    pub sample_rate: u32,
}

enum JackAdapterApiMessage {
    Status(oneshot::Sender<JackStatusReport>),
    ListPorts(PortFilter, oneshot::Sender<ToolResult<Vec<JackPort>>>),
    Connect {
        source: String,
        sink: String,
        tx: oneshot::Sender<ToolResult<()>>,
    },
    Disconnect {
        source: String,
        sink: String,
        tx: oneshot::Sender<ToolResult<()>>,
    },
    TransportStart(oneshot::Sender<ToolResult<()>>),
    TransportStop(oneshot::Sender<ToolResult<()>>),
    TransportLocate {
        frame: u64,
        tx: oneshot::Sender<ToolResult<()>>,
    },
    TransportQuery(oneshot::Sender<ToolResult<TransportReport>>),
    RecordStart {
        sources: Vec<String>,
        path: PathBuf,
        tx: oneshot::Sender<ToolResult<RecordingInfo>>,
    },
    RecordStop(oneshot::Sender<ToolResult<RecordingSummary>>),
}

/// Handle to the adapter actor. The actor is the single writer of the local
/// JACK graph; every mutation funnels through it.
#[derive(Clone)]
pub struct JackAdapterApi {
    api_tx: mpsc::Sender<JackAdapterApiMessage>,
}

impl JackAdapterApi {
    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<ToolResult<T>>) -> JackAdapterApiMessage,
    ) -> ToolResult<T> {
        let (tx, rx) = oneshot::channel();
        self.api_tx.send(message(tx)).await.ok();
        rx.await
            .unwrap_or_else(|_| Err(ToolError::internal("JACK adapter is gone")))
    }

    #[instrument(skip(self))]
    pub async fn status(&self) -> JackStatusReport {
        let (tx, rx) = oneshot::channel();
        self.api_tx.send(JackAdapterApiMessage::Status(tx)).await.ok();
        rx.await.unwrap_or_else(|_| JackStatusReport::not_running())
    }

    #[instrument(skip(self))]
    pub async fn list_ports(&self, filter: PortFilter) -> ToolResult<Vec<JackPort>> {
        self.request(|tx| JackAdapterApiMessage::ListPorts(filter, tx))
            .await
    }

    #[instrument(skip(self))]
    pub async fn connect(&self, source: String, sink: String) -> ToolResult<()> {
        self.request(|tx| JackAdapterApiMessage::Connect { source, sink, tx })
            .await
    }

    #[instrument(skip(self))]
    pub async fn disconnect(&self, source: String, sink: String) -> ToolResult<()> {
        self.request(|tx| JackAdapterApiMessage::Disconnect { source, sink, tx })
            .await
    }

    #[instrument(skip(self))]
    pub async fn transport_start(&self) -> ToolResult<()> {
        self.request(JackAdapterApiMessage::TransportStart).await
    }

    #[instrument(skip(self))]
    pub async fn transport_stop(&self) -> ToolResult<()> {
        self.request(JackAdapterApiMessage::TransportStop).await
    }

    #[instrument(skip(self))]
    pub async fn transport_locate(&self, frame: u64) -> ToolResult<()> {
        self.request(|tx| JackAdapterApiMessage::TransportLocate { frame, tx })
            .await
    }

    #[instrument(skip(self))]
    pub async fn transport_query(&self) -> ToolResult<TransportReport> {
        self.request(JackAdapterApiMessage::TransportQuery).await
    }

    #[instrument(skip(self))]
    pub async fn record_start(
        &self,
        sources: Vec<String>,
        path: PathBuf,
    ) -> ToolResult<RecordingInfo> {
        self.request(|tx| JackAdapterApiMessage::RecordStart { sources, path, tx })
            .await
    }

    #[instrument(skip(self))]
    pub async fn record_stop(&self) -> ToolResult<RecordingSummary> {
        self.request(JackAdapterApiMessage::RecordStop).await
    }
}

pub fn start_jack_adapter(
    subsys: &SubsystemHandle,
    config: Config,
    events: EventBridge,
    voice_streams: Option<mpsc::Sender<VoiceStream>>,
) -> JackAdapterApi {
    let (api_tx, api_rx) = mpsc::channel(1024);
    subsys.start(SubsystemBuilder::new("jack-adapter", move |s| async move {
        JackAdapterActor {
            subsys: s,
            config,
            events,
            api_rx,
            voice_streams,
            active: None,
            notifications: None,
            backoff_step: 0,
            retry_at: Instant::now(),
            last_transport: None,
            recording: Arc::new(AtomicBool::new(false)),
            rec_consumers: None,
            rec_overflows: Vec::new(),
            rec_connections: Vec::new(),
            writer: None,
        }
        .run()
        .await
    }));
    JackAdapterApi { api_tx }
}

pub enum Notification {
    ThreadInit,
    Shutdown(jack::ClientStatus, String),
    SampleRate(jack::Frames),
    ClientRegistration(String, bool),
    PortRegistration(jack::PortId, bool),
    PortConnected(jack::PortId, jack::PortId, bool),
    GraphReorder,
    XRun,
}

struct AdapterNotificationHandler {
    tx: mpsc::Sender<Notification>,
}

impl NotificationHandler for AdapterNotificationHandler {
    fn thread_init(&self, _: &Client) {
        self.tx.try_send(Notification::ThreadInit).ok();
    }

    unsafe fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        self.tx
            .try_send(Notification::Shutdown(status, reason.to_owned()))
            .ok();
    }

    fn sample_rate(&mut self, _: &Client, srate: jack::Frames) -> Control {
        self.tx.try_send(Notification::SampleRate(srate)).ok();
        Control::Continue
    }

    fn client_registration(&mut self, _: &Client, name: &str, is_registered: bool) {
        self.tx
            .try_send(Notification::ClientRegistration(
                name.to_owned(),
                is_registered,
            ))
            .ok();
    }

    fn port_registration(&mut self, _: &Client, port_id: jack::PortId, is_registered: bool) {
        self.tx
            .try_send(Notification::PortRegistration(port_id, is_registered))
            .ok();
    }

    fn ports_connected(
        &mut self,
        _: &Client,
        port_id_a: jack::PortId,
        port_id_b: jack::PortId,
        are_connected: bool,
    ) {
        self.tx
            .try_send(Notification::PortConnected(
                port_id_a,
                port_id_b,
                are_connected,
            ))
            .ok();
    }

    fn graph_reorder(&mut self, _: &Client) -> Control {
        self.tx.try_send(Notification::GraphReorder).ok();
        Control::Continue
    }

    fn xrun(&mut self, _: &Client) -> Control {
        self.tx.try_send(Notification::XRun).ok();
        Control::Continue
    }
}

/// State owned by the JACK real-time thread. No allocation, no blocking:
/// it only copies input buffers into the pre-allocated capture rings.
struct CaptureHandler {
    voice: Option<(Port<AudioIn>, CaptureChannel)>,
    rec_ports: Vec<Port<AudioIn>>,
    rec_channels: Vec<CaptureChannel>,
    recording: Arc<AtomicBool>,
}

impl CaptureHandler {
    fn copy_into(channel: &mut CaptureChannel, input: &[f32]) {
        let pushed = channel.producer.push_slice(input);
        if pushed < input.len() {
            channel
                .overflows
                .fetch_add((input.len() - pushed) as u64, Ordering::Relaxed);
        }
    }
}

impl jack::ProcessHandler for CaptureHandler {
    fn process(&mut self, _: &Client, ps: &ProcessScope) -> Control {
        if let Some((port, channel)) = &mut self.voice {
            let input = port.as_slice(ps);
            Self::copy_into(channel, input);
        }
        if self.recording.load(Ordering::Relaxed) {
            for (port, channel) in self.rec_ports.iter().zip(self.rec_channels.iter_mut()) {
                let input = port.as_slice(ps);
                Self::copy_into(channel, input);
            }
        }
        Control::Continue
    }

    fn buffer_size(&mut self, _: &Client, buffer_len: jack::Frames) -> Control {
        // Cannot log here, this may run in the realtime context.
        let _ = buffer_len;
        Control::Continue
    }
}

struct ActiveJack {
    client: jack::AsyncClient<AdapterNotificationHandler, CaptureHandler>,
    sample_rate: u32,
}

struct JackAdapterActor {
    subsys: SubsystemHandle,
    config: Config,
    events: EventBridge,
    api_rx: mpsc::Receiver<JackAdapterApiMessage>,
    voice_streams: Option<mpsc::Sender<VoiceStream>>,
    active: Option<ActiveJack>,
    notifications: Option<mpsc::Receiver<Notification>>,
    backoff_step: usize,
    retry_at: Instant,
    last_transport: Option<(TransportState, u64)>,
    recording: Arc<AtomicBool>,
    rec_consumers: Option<Vec<HeapCons<f32>>>,
    rec_overflows: Vec<Arc<AtomicU64>>,
    rec_connections: Vec<JackConnection>,
    writer: Option<WriterHandle>,
}

impl JackAdapterActor {
    async fn run(mut self) -> SkeletonCrewResult<()> {
        info!("JACK adapter starting.");
        self.try_connect();

        let mut tick = interval(TICK);

        loop {
            select! {
                Some(msg) = self.api_rx.recv() => self.process_api_message(msg).await,
                notification = recv_notification(&mut self.notifications) => match notification {
                    Some(n) => self.process_notification(n),
                    None => self.on_jack_lost("notification channel closed"),
                },
                _ = tick.tick() => self.on_tick(),
                _ = self.subsys.on_shutdown_requested() => break,
            }
        }

        self.stop().await;
        info!("JACK adapter stopped.");
        Ok(())
    }

    async fn stop(&mut self) {
        if self.recording.swap(false, Ordering::Release)
            && let Some(writer) = self.writer.take()
        {
            match tokio::task::spawn_blocking(move || writer.finish()).await {
                Ok(Ok((_, summary))) => {
                    info!("Recording closed on shutdown: {}", summary.path);
                }
                Ok(Err(e)) => warn!("Recording writer failed on shutdown: {e}"),
                Err(e) => warn!("Recording writer task failed on shutdown: {e}"),
            }
        }
        self.active.take();
        self.notifications.take();
    }

    fn on_tick(&mut self) {
        if self.active.is_none() {
            if Instant::now() >= self.retry_at {
                self.try_connect();
            }
            return;
        }
        self.publish_transport_change();
    }

    fn publish_transport_change(&mut self) {
        let Ok(report) = self.transport_query() else {
            return;
        };
        let current = (report.state, report.frame);
        let changed = match self.last_transport {
            Some((state, _)) => state != report.state,
            None => true,
        };
        if changed {
            self.events.publish(Event::JackTransportChanged {
                state: report.state,
                frame: report.frame,
            });
        }
        self.last_transport = Some(current);
    }

    #[instrument(skip(self))]
    fn try_connect(&mut self) {
        let client_name = self.config.jack_client_name();
        match Client::new(&client_name, ClientOptions::default()) {
            Ok((client, status)) => {
                info!("JACK client created with status {status:?}");
                if let Err(e) = self.activate(client) {
                    warn!("Could not activate JACK client: {e}");
                    self.schedule_retry();
                } else {
                    self.backoff_step = 0;
                }
            }
            Err(e) => {
                debug!("JACK server not reachable: {e}");
                self.schedule_retry();
            }
        }
    }

    fn activate(&mut self, client: Client) -> Result<(), jack::Error> {
        let sample_rate = client.sample_rate() as u32;
        let capture_capacity = self
            .config
            .voice
            .as_ref()
            .map(|v| v.capture_queue_samples)
            .unwrap_or(65_536);

        let voice = match (&self.voice_streams, &self.config.voice) {
            (Some(streams), Some(voice_config)) => {
                let port = client.register_port(&voice_config.input_port, AudioIn::default())?;
                let (producer, consumer) = HeapRb::<f32>::new(capture_capacity).split();
                let overflows = Arc::new(AtomicU64::new(0));
                streams
                    .try_send(VoiceStream {
                        consumer,
                        sample_rate,
                        overflows: overflows.clone(),
                    })
                    .ok();
                Some((port, CaptureChannel { producer, overflows }))
            }
            _ => None,
        };

        let mut rec_ports = Vec::new();
        let mut rec_channels = Vec::new();
        let mut rec_consumers = Vec::new();
        let mut rec_overflows = Vec::new();
        for i in 0..self.config.jack.recorder_channels {
            let port = client.register_port(&format!("rec_in_{}", i + 1), AudioIn::default())?;
            let (producer, consumer) = HeapRb::<f32>::new(capture_capacity).split();
            let overflows = Arc::new(AtomicU64::new(0));
            rec_ports.push(port);
            rec_channels.push(CaptureChannel {
                producer,
                overflows: overflows.clone(),
            });
            rec_consumers.push(consumer);
            rec_overflows.push(overflows);
        }

        self.recording.store(false, Ordering::Release);
        let handler = CaptureHandler {
            voice,
            rec_ports,
            rec_channels,
            recording: self.recording.clone(),
        };

        let (notification_tx, notification_rx) = mpsc::channel(1024);
        let notification_handler = AdapterNotificationHandler {
            tx: notification_tx,
        };

        let active = client.activate_async(notification_handler, handler)?;
        self.active = Some(ActiveJack {
            client: active,
            sample_rate,
        });
        self.notifications = Some(notification_rx);
        self.rec_consumers = Some(rec_consumers);
        self.rec_overflows = rec_overflows;
        self.last_transport = None;
        info!("JACK adapter connected at {sample_rate} Hz.");
        Ok(())
    }

    fn schedule_retry(&mut self) {
        let delay = RECONNECT_BACKOFF[self.backoff_step.min(RECONNECT_BACKOFF.len() - 1)];
        self.backoff_step = (self.backoff_step + 1).min(RECONNECT_BACKOFF.len() - 1);
        self.retry_at = Instant::now() + delay;
        debug!("Next JACK connect attempt in {delay:?}");
    }

    fn on_jack_lost(&mut self, reason: &str) {
        if self.active.is_some() {
            warn!("Lost connection to JACK server: {reason}");
        }
        self.active.take();
        self.notifications.take();
        self.rec_consumers.take();
        self.rec_overflows.clear();
        self.rec_connections.clear();
        self.recording.store(false, Ordering::Release);
        if let Some(writer) = self.writer.take() {
            tokio::task::spawn_blocking(move || {
                if let Err(e) = writer.finish() {
                    warn!("Recording writer failed after JACK loss: {e}");
                }
            });
        }
        self.backoff_step = 0;
        self.schedule_retry();
    }

    fn process_notification(&mut self, notification: Notification) {
        match notification {
            Notification::ThreadInit => debug!("JACK process thread initialized"),
            Notification::Shutdown(status, reason) => {
                self.on_jack_lost(&format!("{reason} ({status:?})"));
            }
            Notification::SampleRate(srate) => {
                if let Some(active) = &mut self.active {
                    active.sample_rate = srate;
                }
            }
            Notification::ClientRegistration(name, registered) => {
                debug!(
                    "JACK client '{name}' {}",
                    if registered { "registered" } else { "unregistered" }
                );
            }
            Notification::PortRegistration(port_id, registered) => {
                if let Some(name) = self.port_name(port_id) {
                    self.events.publish(Event::JackPortChanged {
                        port: name,
                        registered,
                    });
                }
            }
            Notification::PortConnected(a, b, connected) => {
                if let Some((source, sink)) = self.ordered_pair(a, b) {
                    self.events.publish(Event::JackConnectionChanged {
                        source,
                        sink,
                        connected,
                    });
                }
            }
            Notification::GraphReorder => debug!("JACK graph reordered"),
            Notification::XRun => debug!("JACK xrun"),
        }
    }

    fn port_name(&self, port_id: jack::PortId) -> Option<String> {
        let active = self.active.as_ref()?;
        let port = active.client.as_client().port_by_id(port_id)?;
        port.name().ok()
    }

    fn ordered_pair(&self, a: jack::PortId, b: jack::PortId) -> Option<(String, String)> {
        let active = self.active.as_ref()?;
        let client = active.client.as_client();
        let port_a = client.port_by_id(a)?;
        let port_b = client.port_by_id(b)?;
        let a_is_source = port_a.flags().contains(jack::PortFlags::IS_OUTPUT);
        let (src, snk) = if a_is_source {
            (port_a, port_b)
        } else {
            (port_b, port_a)
        };
        Some((src.name().ok()?, snk.name().ok()?))
    }

    async fn process_api_message(&mut self, msg: JackAdapterApiMessage) {
        match msg {
            JackAdapterApiMessage::Status(tx) => {
                tx.send(self.status_report()).ok();
            }
            JackAdapterApiMessage::ListPorts(filter, tx) => {
                let result = self
                    .with_snapshot(|snapshot| Ok(snapshot.filtered(&filter)));
                tx.send(result).ok();
            }
            JackAdapterApiMessage::Connect { source, sink, tx } => {
                tx.send(self.connect_ports(&source, &sink)).ok();
            }
            JackAdapterApiMessage::Disconnect { source, sink, tx } => {
                tx.send(self.disconnect_ports(&source, &sink)).ok();
            }
            JackAdapterApiMessage::TransportStart(tx) => {
                tx.send(self.with_client(|client| {
                    client.transport().start().map_err(internal_jack_error)
                }))
                .ok();
            }
            JackAdapterApiMessage::TransportStop(tx) => {
                tx.send(self.with_client(|client| {
                    client.transport().stop().map_err(internal_jack_error)
                }))
                .ok();
            }
            JackAdapterApiMessage::TransportLocate { frame, tx } => {
                let frame = frame.min(u64::from(u32::MAX)) as u32;
                tx.send(self.with_client(|client| {
                    client
                        .transport()
                        .locate(frame)
                        .map_err(internal_jack_error)
                }))
                .ok();
            }
            JackAdapterApiMessage::TransportQuery(tx) => {
                tx.send(self.transport_query()).ok();
            }
            JackAdapterApiMessage::RecordStart { sources, path, tx } => {
                tx.send(self.record_start(sources, path)).ok();
            }
            JackAdapterApiMessage::RecordStop(tx) => {
                tx.send(self.record_stop().await).ok();
            }
        }
    }

    fn with_client<T>(
        &self,
        f: impl FnOnce(&Client) -> Result<T, ToolError>,
    ) -> Result<T, ToolError> {
        match &self.active {
            Some(active) => f(active.client.as_client()),
            None => Err(ToolError::jack_unavailable()),
        }
    }

    fn with_snapshot<T>(
        &self,
        f: impl FnOnce(&GraphSnapshot) -> Result<T, ToolError>,
    ) -> Result<T, ToolError> {
        self.with_client(|client| {
            let snapshot = build_snapshot(client);
            f(&snapshot)
        })
    }

    fn transport_query(&self) -> ToolResult<TransportReport> {
        self.with_client(|client| {
            let sample_rate = client.sample_rate() as u32;
            let query = client.transport().query().map_err(internal_jack_error)?;
            Ok(TransportReport {
                state: map_transport_state(query.state),
                frame: u64::from(query.pos.frame()),
                sample_rate,
            })
        })
    }

    fn status_report(&self) -> JackStatusReport {
        let Some(active) = &self.active else {
            return JackStatusReport::not_running();
        };
        let client = active.client.as_client();
        let snapshot = build_snapshot(client);
        let (transport_state, transport_frame) = client
            .transport()
            .query()
            .map(|q| (map_transport_state(q.state), u64::from(q.pos.frame())))
            .unwrap_or((TransportState::Stopped, 0));

        let mut source = Vec::new();
        let mut sink = Vec::new();
        for port in &snapshot.ports {
            match port.direction {
                PortDirection::Source => source.push(port.name.clone()),
                PortDirection::Sink => sink.push(port.name.clone()),
            }
        }
        let total = source.len() + sink.len();

        let capture_overflows = self
            .rec_overflows
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum();

        JackStatusReport {
            status: RunningState::Running,
            sample_rate: active.sample_rate,
            buffer_size: client.buffer_size(),
            ports: PortsReport {
                source,
                sink,
                total,
            },
            connections: snapshot.connection_map(),
            transport_state,
            transport_frame,
            capture_overflows,
        }
    }

    fn connect_ports(&mut self, source: &str, sink: &str) -> ToolResult<()> {
        self.with_client(|client| {
            let snapshot = build_snapshot(client);
            snapshot.check_connect(source, sink)?;
            client
                .connect_ports_by_name(source, sink)
                .map_err(internal_jack_error)
        })
    }

    fn disconnect_ports(&mut self, source: &str, sink: &str) -> ToolResult<()> {
        self.with_client(|client| {
            let snapshot = build_snapshot(client);
            snapshot.check_disconnect(source, sink)?;
            client
                .disconnect_ports_by_name(source, sink)
                .map_err(internal_jack_error)
        })
    }

    fn record_start(&mut self, sources: Vec<String>, path: PathBuf) -> ToolResult<RecordingInfo> {
        if self.writer.is_some() {
            return Err(ToolError::new(
                ErrorKind::AlreadyConnected,
                "a recording is already running",
            ));
        }
        if sources.is_empty() {
            return Err(ToolError::invalid_args("at least one source port required"));
        }
        if sources.len() > self.config.jack.recorder_channels {
            return Err(ToolError::invalid_args(format!(
                "at most {} recorder channels available",
                self.config.jack.recorder_channels
            )));
        }

        let client_name = self.config.jack_client_name();
        let sample_rate = self.with_client(|client| {
            let snapshot = build_snapshot(client);
            let mut pairs = Vec::new();
            for (i, source) in sources.iter().enumerate() {
                let sink = format!("{client_name}:rec_in_{}", i + 1);
                snapshot.check_connect(source, &sink)?;
                pairs.push(JackConnection {
                    source: source.clone(),
                    sink,
                });
            }
            for pair in &pairs {
                client
                    .connect_ports_by_name(&pair.source, &pair.sink)
                    .map_err(internal_jack_error)?;
            }
            Ok((client.sample_rate() as u32, pairs))
        });
        let (sample_rate, pairs) = sample_rate?;

        let consumers = match self.rec_consumers.take() {
            Some(mut all) => {
                // Channels beyond the recorded count stay parked, in order,
                // so a later take can still use them.
                let used: Vec<_> = all.drain(..sources.len()).collect();
                self.rec_consumers = Some(all);
                used
            }
            None => {
                return Err(ToolError::internal("recorder rings are unavailable"));
            }
        };

        let overflows = self
            .rec_overflows
            .iter()
            .take(sources.len())
            .cloned()
            .collect();

        let writer = recorder::spawn_writer(path.clone(), sample_rate, consumers, overflows)
            .map_err(|e| ToolError::internal(format!("could not start recording: {e}")))?;

        self.writer = Some(writer);
        self.rec_connections = pairs;
        self.recording.store(true, Ordering::Release);

        Ok(RecordingInfo {
            path: path.to_string_lossy().to_string(),
            channels: sources.len(),
            sample_rate,
        })
    }

    async fn record_stop(&mut self) -> ToolResult<RecordingSummary> {
        let Some(writer) = self.writer.take() else {
            return Err(ToolError::new(
                ErrorKind::NotConnected,
                "no recording is running",
            ));
        };

        self.recording.store(false, Ordering::Release);

        let connections = std::mem::take(&mut self.rec_connections);
        self.with_client(|client| {
            for pair in &connections {
                client
                    .disconnect_ports_by_name(&pair.source, &pair.sink)
                    .ok();
            }
            Ok(())
        })
        .ok();

        let result = tokio::task::spawn_blocking(move || writer.finish())
            .await
            .map_err(|e| ToolError::internal(format!("recording writer task failed: {e}")))?;

        match result {
            Ok((consumers, summary)) => {
                // Give the drained rings back, ahead of any parked ones, so
                // channel order keeps matching the rec_in ports.
                let mut all = consumers;
                if let Some(mut parked) = self.rec_consumers.take() {
                    all.append(&mut parked);
                }
                self.rec_consumers = Some(all);
                Ok(summary)
            }
            Err(e) => Err(ToolError::internal(format!("recording failed: {e}"))),
        }
    }
}

async fn recv_notification(
    rx: &mut Option<mpsc::Receiver<Notification>>,
) -> Option<Notification> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn internal_jack_error(e: jack::Error) -> ToolError {
    ToolError::internal(format!("JACK call failed: {e}"))
}

fn map_transport_state(state: jack::TransportState) -> TransportState {
    match state {
        jack::TransportState::Stopped => TransportState::Stopped,
        jack::TransportState::Starting => TransportState::Starting,
        _ => TransportState::Rolling,
    }
}

fn build_snapshot(client: &Client) -> GraphSnapshot {
    let names = client.ports(None, None, jack::PortFlags::empty());
    let mut ports = Vec::with_capacity(names.len());
    for name in names {
        let Some(port) = client.port_by_name(&name) else {
            continue;
        };
        let flags = port.flags();
        let direction = if flags.contains(jack::PortFlags::IS_OUTPUT) {
            PortDirection::Source
        } else {
            PortDirection::Sink
        };
        let kind = match port.port_type() {
            Ok(t) if t.to_lowercase().contains("midi") => PortKind::Midi,
            _ => PortKind::Audio,
        };
        ports.push(JackPort {
            name,
            direction,
            kind,
            physical: flags.contains(jack::PortFlags::IS_PHYSICAL),
            terminal: flags.contains(jack::PortFlags::IS_TERMINAL),
        });
    }

    let mut connections = BTreeSet::new();
    for source in ports.iter().filter(|p| p.direction == PortDirection::Source) {
        let Some(source_port) = client.port_by_name(&source.name) else {
            continue;
        };
        for sink in ports.iter().filter(|p| p.direction == PortDirection::Sink) {
            if source_port.is_connected_to(&sink.name).unwrap_or(false) {
                connections.insert(JackConnection {
                    source: source.name.clone(),
                    sink: sink.name.clone(),
                });
            }
        }
    }

    GraphSnapshot { ports, connections }
}

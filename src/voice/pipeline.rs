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
    audio::VoiceStream,
    config::VoiceConfig,
    discovery::DiscoveryApi,
    error::SkeletonCrewResult,
    events::{Event, EventBridge},
    gateway::client::GatewayClient,
    model::NodeId,
    time::wall_micros,
    tools::registry::ToolRegistry,
    voice::{
        recognizer::SpeechRecognizer,
        resample::{VoiceResampler, to_i16},
        wake::{AliasTable, GateEvent, WakeGate},
    },
};
use ringbuf::{HeapCons, traits::Consumer};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tokio::{select, sync::mpsc};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, warn};

const DRAIN_BUFFER: usize = 4096;
const IDLE_SLEEP: Duration = Duration::from_millis(5);
const NO_STREAM_SLEEP: Duration = Duration::from_millis(50);

/// A node-addressed command extracted from speech.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEvent {
    pub target_node: NodeId,
    pub command: String,
    pub raw_text: String,
    pub confidence: f32,
}

/// Builds a recognizer for the given sample rate. Kept as a factory so the
/// pipeline can rebuild its stages when the JACK stream is replaced.
pub type RecognizerFactory =
    Box<dyn Fn(u32) -> SkeletonCrewResult<Box<dyn SpeechRecognizer>> + Send + Sync>;

pub fn start_voice_pipeline(
    subsys: &SubsystemHandle,
    voice_config: VoiceConfig,
    local_node_id: NodeId,
    events: EventBridge,
    registry: Arc<ToolRegistry>,
    discovery: DiscoveryApi,
    gateway: GatewayClient,
    streams_rx: mpsc::Receiver<VoiceStream>,
    recognizer_factory: RecognizerFactory,
) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let shutdown = Arc::new(AtomicBool::new(false));

    {
        let voice_config = voice_config.clone();
        let events = events.clone();
        let shutdown = shutdown.clone();
        subsys.start(SubsystemBuilder::new("voice-pipeline", move |s| async move {
            let thread_shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name("voice-pipeline".to_owned())
                .spawn(move || {
                    run_pipeline(
                        voice_config,
                        streams_rx,
                        recognizer_factory,
                        events,
                        command_tx,
                        thread_shutdown,
                    )
                })?;

            s.on_shutdown_requested().await;
            shutdown.store(true, Ordering::Release);
            // Bounded drain: the thread notices the flag within one idle
            // sleep.
            if tokio::task::spawn_blocking(move || handle.join())
                .await
                .map(|r| r.is_err())
                .unwrap_or(true)
            {
                warn!("Voice pipeline thread did not shut down cleanly");
            }
            Ok::<(), crate::error::SkeletonCrewError>(())
        }));
    }

    subsys.start(SubsystemBuilder::new("voice-dispatcher", move |s| {
        dispatcher(s, local_node_id, registry, discovery, gateway, command_rx)
    }));
}

struct ActiveStream {
    consumer: HeapCons<f32>,
    resampler: VoiceResampler,
    recognizer: Box<dyn SpeechRecognizer>,
}

/// One pass over the capture ring: drain, resample, recognize, gate.
/// Returns `false` when the ring had nothing to process.
fn drain_once(
    stream: &mut ActiveStream,
    gate: &mut WakeGate,
    raw: &mut [f32],
    resampled: &mut Vec<f32>,
    pcm: &mut Vec<i16>,
    mut emit: impl FnMut(GateEvent),
) -> bool {
    let now = wall_micros().unwrap_or(0);
    if let Some(event) = gate.check_timeout(now) {
        emit(event);
    }

    let drained = stream.consumer.pop_slice(raw);
    if drained == 0 {
        return false;
    }

    resampled.clear();
    if let Err(e) = stream.resampler.process(&raw[..drained], resampled) {
        warn!("Voice resampling failed: {e}");
        return true;
    }
    if resampled.is_empty() {
        return true;
    }

    to_i16(resampled, pcm);
    for result in stream.recognizer.feed(pcm) {
        for event in gate.on_result(&result, wall_micros().unwrap_or(0)) {
            emit(event);
        }
    }
    true
}

fn run_pipeline(
    config: VoiceConfig,
    mut streams_rx: mpsc::Receiver<VoiceStream>,
    recognizer_factory: RecognizerFactory,
    events: EventBridge,
    command_tx: mpsc::Sender<CommandEvent>,
    shutdown: Arc<AtomicBool>,
) {
    info!("Voice pipeline thread started.");

    let aliases = AliasTable::from_config(&config.aliases);
    let mut gate = WakeGate::new(&config.wake_words, aliases, config.wake_window);

    let mut current: Option<ActiveStream> = None;
    let mut raw = vec![0f32; DRAIN_BUFFER];
    let mut resampled = Vec::with_capacity(DRAIN_BUFFER);
    let mut pcm = Vec::with_capacity(DRAIN_BUFFER);

    while !shutdown.load(Ordering::Acquire) {
        // A fresh stream arrives whenever the adapter (re-)connects.
        while let Ok(stream) = streams_rx.try_recv() {
            match build_stream(&config, stream, &recognizer_factory) {
                Ok(active) => {
                    info!("Voice pipeline attached to a new capture stream.");
                    current = Some(active);
                }
                Err(e) => {
                    warn!("Voice pipeline cannot use the capture stream: {e}");
                    current = None;
                }
            }
        }

        let Some(stream) = &mut current else {
            let now = wall_micros().unwrap_or(0);
            if let Some(event) = gate.check_timeout(now) {
                publish_gate_event(&events, &command_tx, event);
            }
            thread::sleep(NO_STREAM_SLEEP);
            continue;
        };

        let busy = drain_once(
            stream,
            &mut gate,
            &mut raw,
            &mut resampled,
            &mut pcm,
            |event| publish_gate_event(&events, &command_tx, event),
        );
        if !busy {
            thread::sleep(IDLE_SLEEP);
        }
    }

    info!("Voice pipeline thread stopped.");
}

fn build_stream(
    config: &VoiceConfig,
    stream: VoiceStream,
    recognizer_factory: &RecognizerFactory,
) -> SkeletonCrewResult<ActiveStream> {
    let resampler = VoiceResampler::new(stream.sample_rate, config.recognizer_sample_rate)?;
    let recognizer = recognizer_factory(config.recognizer_sample_rate)?;
    Ok(ActiveStream {
        consumer: stream.consumer,
        resampler,
        recognizer,
    })
}

fn publish_gate_event(
    events: &EventBridge,
    command_tx: &mpsc::Sender<CommandEvent>,
    event: GateEvent,
) {
    match event {
        GateEvent::Wake { node_id, phrase } => {
            events.publish(Event::VoiceWake { node_id, phrase });
        }
        GateEvent::Command {
            target_node,
            command,
            raw_text,
            confidence,
        } => {
            events.publish(Event::VoiceCommand {
                target_node: target_node.clone(),
                command: command.clone(),
                raw_text: raw_text.clone(),
                confidence,
            });
            if command_tx
                .blocking_send(CommandEvent {
                    target_node,
                    command,
                    raw_text,
                    confidence,
                })
                .is_err()
            {
                warn!("Voice dispatcher is gone, dropping command");
            }
        }
        GateEvent::WakeTimeout { node_id } => {
            events.publish(Event::VoiceWakeTimeout { node_id });
        }
    }
}

async fn dispatcher(
    subsys: SubsystemHandle,
    local_node_id: NodeId,
    registry: Arc<ToolRegistry>,
    discovery: DiscoveryApi,
    gateway: GatewayClient,
    mut command_rx: mpsc::Receiver<CommandEvent>,
) -> SkeletonCrewResult<()> {
    info!("Voice dispatcher started.");
    loop {
        select! {
            Some(command) = command_rx.recv() => {
                dispatch(&local_node_id, &registry, &discovery, &gateway, command).await;
            }
            _ = subsys.on_shutdown_requested() => break,
        }
    }
    info!("Voice dispatcher stopped.");
    Ok(())
}

async fn dispatch(
    local_node_id: &str,
    registry: &ToolRegistry,
    discovery: &DiscoveryApi,
    gateway: &GatewayClient,
    command: CommandEvent,
) {
    let caller = format!("voice:{local_node_id}");
    let args = json!({
        "command": command.command,
        "raw_text": command.raw_text,
        "confidence": command.confidence,
        "target_node": command.target_node,
    });

    if command.target_node == local_node_id {
        match registry
            .execute("trigger_voice_command", args, caller)
            .await
        {
            Ok(_) => debug!("Voice command '{}' executed locally", command.command),
            Err(e) => warn!("Voice command '{}' failed: {e}", command.command),
        }
        return;
    }

    let Some(node) = discovery.peek_node(&command.target_node) else {
        warn!(
            "Voice command for unknown node '{}' dropped",
            command.target_node
        );
        return;
    };
    match gateway
        .invoke(&node, "trigger_voice_command", args, &caller)
        .await
    {
        Ok(_) => debug!(
            "Voice command '{}' forwarded to '{}'",
            command.command, command.target_node
        ),
        Err(e) => warn!(
            "Voice command '{}' for '{}' failed: {e}",
            command.command, command.target_node
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::recognizer::{RecognizerResult, testing::ScriptedRecognizer};
    use ringbuf::{HeapRb, traits::Producer, traits::Split};

    fn active_stream(script: Vec<RecognizerResult>, samples: usize) -> ActiveStream {
        let (mut producer, consumer) = HeapRb::<f32>::new(65_536).split();
        let audio = vec![0.1f32; samples];
        producer.push_slice(&audio);
        // Producer dropped: the test drains what was pushed.
        ActiveStream {
            consumer,
            resampler: VoiceResampler::new(16_000, 16_000).expect("resampler"),
            recognizer: Box::new(ScriptedRecognizer::new(script)),
        }
    }

    fn gate() -> WakeGate {
        let wake_words = [("indigo".to_owned(), "computer indigo".to_owned())]
            .into_iter()
            .collect();
        let aliases = AliasTable::from_config(&[crate::config::AliasConfig {
            phrase: "play".to_owned(),
            command: "jack_transport_start".to_owned(),
            node: None,
        }]);
        WakeGate::new(&wake_words, aliases, Duration::from_secs(5))
    }

    #[test]
    fn the_full_stage_chain_emits_wake_then_command() {
        let mut stream = active_stream(
            vec![
                RecognizerResult::partial("computer indigo"),
                RecognizerResult::final_with_confidence("computer indigo play", 0.9),
            ],
            8192,
        );
        let mut gate = gate();
        let mut emitted = Vec::new();
        let mut raw = vec![0f32; DRAIN_BUFFER];
        let mut resampled = Vec::new();
        let mut pcm = Vec::new();

        while drain_once(
            &mut stream,
            &mut gate,
            &mut raw,
            &mut resampled,
            &mut pcm,
            |e| emitted.push(e),
        ) {}

        assert_eq!(emitted.len(), 2);
        assert!(matches!(emitted[0], GateEvent::Wake { .. }));
        match &emitted[1] {
            GateEvent::Command {
                target_node,
                command,
                raw_text,
                ..
            } => {
                assert_eq!(target_node, "indigo");
                assert_eq!(command, "jack_transport_start");
                assert_eq!(raw_text, "play");
            }
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn an_empty_ring_reports_idle() {
        let mut stream = active_stream(vec![], 0);
        let mut gate = gate();
        let mut raw = vec![0f32; DRAIN_BUFFER];
        let mut resampled = Vec::new();
        let mut pcm = Vec::new();
        assert!(!drain_once(
            &mut stream,
            &mut gate,
            &mut raw,
            &mut resampled,
            &mut pcm,
            |_| panic!("no events expected"),
        ));
    }
}

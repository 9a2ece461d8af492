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
    audio::adapter::JackAdapterApi,
    config::Config,
    error::{ErrorKind, SkeletonCrewResult},
    events::{Event, EventBridge},
    model::TransportState,
    time::{Scheduler, ScheduleHandle, SkewReport, micros_to_wire_seconds, wall_micros, wire_seconds_to_micros},
    transport::wire::{self, TransportMessage},
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    Start,
    Stop,
    LocateStart { frame: u64 },
}

impl AgentAction {
    pub fn name(&self) -> &'static str {
        match self {
            AgentAction::Start => "start",
            AgentAction::Stop => "stop",
            AgentAction::LocateStart { .. } => "locate_start",
        }
    }
}

/// A target instant that already passed at receive time is rejected; the
/// currently armed action (if any) stays untouched.
pub fn resolve_arm(target_micros: u64, now_micros: u64) -> Result<(), ErrorKind> {
    if target_micros < now_micros {
        Err(ErrorKind::TargetInPast)
    } else {
        Ok(())
    }
}

pub fn start_transport_agent(
    subsys: &SubsystemHandle,
    config: Config,
    adapter: JackAdapterApi,
    scheduler: Scheduler,
    events: EventBridge,
) {
    subsys.start(SubsystemBuilder::new("transport-agent", move |s| async move {
        let (fire_tx, fire_rx) = mpsc::channel(64);
        TransportAgentActor {
            subsys: s,
            config,
            adapter,
            scheduler,
            events,
            armed: None,
            fire_tx,
            fire_rx,
            malformed: 0,
            rejected_past: 0,
        }
        .run()
        .await
    }));
}

struct Armed {
    target_micros: u64,
    handle: ScheduleHandle,
}

struct TransportAgentActor {
    subsys: SubsystemHandle,
    config: Config,
    adapter: JackAdapterApi,
    scheduler: Scheduler,
    events: EventBridge,
    armed: Option<Armed>,
    fire_tx: mpsc::Sender<(AgentAction, SkewReport)>,
    fire_rx: mpsc::Receiver<(AgentAction, SkewReport)>,
    malformed: u64,
    rejected_past: u64,
}

impl TransportAgentActor {
    async fn run(mut self) -> SkeletonCrewResult<()> {
        let port = self.config.transport.agent_port;
        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        ))
        .await?;
        info!("Transport agent listening on port {port}.");

        let mut buf = [0u8; 1024];
        loop {
            select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => match wire::decode(&buf[..len]) {
                        Ok(message) => self.process_message(message, from, &socket).await,
                        Err(e) => {
                            self.malformed += 1;
                            debug!(
                                "Dropping malformed transport message from {from} ({} total): {e}",
                                self.malformed
                            );
                        }
                    },
                    Err(e) => warn!("Transport agent receive failed: {e}"),
                },
                Some((action, report)) = self.fire_rx.recv() => self.fire(action, report).await,
                _ = self.subsys.on_shutdown_requested() => break,
            }
        }

        if let Some(armed) = self.armed.take() {
            armed.handle.cancel();
        }
        info!("Transport agent stopped.");
        Ok(())
    }

    async fn process_message(
        &mut self,
        message: TransportMessage,
        from: SocketAddr,
        socket: &UdpSocket,
    ) {
        debug!("Transport message from {from}: {message:?}");
        match message {
            TransportMessage::Start { target_instant } => {
                self.arm_or_fire(AgentAction::Start, target_instant).await;
            }
            TransportMessage::Stop { target_instant } => {
                self.arm_or_fire(AgentAction::Stop, target_instant).await;
            }
            TransportMessage::Locate { frame } => {
                if let Err(e) = self.adapter.transport_locate(frame.max(0) as u64).await {
                    warn!("Transport locate failed: {e}");
                }
            }
            TransportMessage::LocateStart {
                frame,
                target_instant,
            } => {
                self.arm_or_fire(
                    AgentAction::LocateStart {
                        frame: frame.max(0) as u64,
                    },
                    Some(target_instant),
                )
                .await;
            }
            TransportMessage::Query => self.reply_state(from, socket).await,
            TransportMessage::State { .. } => {
                // Replies are for coordinators; an agent receiving one is
                // just someone misconfiguring endpoints.
                debug!("Ignoring /transport/state sent to an agent by {from}");
            }
        }
    }

    async fn arm_or_fire(&mut self, action: AgentAction, target_instant: Option<f64>) {
        let Ok(now) = wall_micros() else {
            warn!("Cannot read the wall clock, dropping transport command");
            return;
        };

        let Some(instant) = target_instant else {
            self.fire(
                action,
                SkewReport {
                    target_micros: now,
                    fired_micros: now,
                },
            )
            .await;
            return;
        };

        let target_micros = wire_seconds_to_micros(instant);
        if let Err(kind) = resolve_arm(target_micros, now) {
            self.rejected_past += 1;
            warn!(
                "Rejecting {} for {:.6}: {kind} ({} total)",
                action.name(),
                instant,
                self.rejected_past
            );
            return;
        }

        if let Some(previous) = self.armed.take() {
            previous.handle.cancel();
            debug!(
                "Superseding armed action at {} with {} at {target_micros}",
                previous.target_micros,
                action.name()
            );
        }

        let fire_tx = self.fire_tx.clone();
        let handle = self.scheduler.schedule(
            target_micros,
            Box::new(move |report| {
                fire_tx.try_send((action, report)).ok();
            }),
        );
        self.armed = Some(Armed {
            target_micros,
            handle,
        });
        info!(
            "Armed {} for {:.6} ({} µs ahead)",
            action.name(),
            instant,
            target_micros.saturating_sub(now)
        );
    }

    async fn fire(&mut self, action: AgentAction, report: SkewReport) {
        self.armed = None;

        let result = match action {
            AgentAction::Start => self.adapter.transport_start().await,
            AgentAction::Stop => self.adapter.transport_stop().await,
            AgentAction::LocateStart { frame } => match self.adapter.transport_locate(frame).await
            {
                Ok(()) => self.adapter.transport_start().await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            warn!("Transport {} failed: {e}", action.name());
        }

        let skew = report.skew_micros();
        let threshold = self.config.transport.skew_warn_threshold.as_micros() as i64;
        if skew.abs() > threshold {
            warn!(
                "Transport {} fired {} µs off target (threshold {} µs)",
                action.name(),
                skew,
                threshold
            );
        }
        self.events.publish(Event::TransportSkewReported {
            action: action.name().to_owned(),
            target_micros: report.target_micros,
            fired_micros: report.fired_micros,
            skew_micros: skew,
        });
    }

    async fn reply_state(&mut self, from: SocketAddr, socket: &UdpSocket) {
        let (state, frame) = match self.adapter.transport_query().await {
            Ok(report) => (report.state, report.frame),
            Err(_) => (TransportState::Stopped, 0),
        };
        let now = wall_micros().map(micros_to_wire_seconds).unwrap_or(0.0);
        let reply = TransportMessage::State {
            state,
            frame: frame as i64,
            now,
        };
        match wire::encode(&reply) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, from).await {
                    warn!("Could not reply to transport query from {from}: {e}");
                }
            }
            Err(e) => warn!("Could not encode transport state reply: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_targets_are_rejected() {
        assert_eq!(resolve_arm(999, 1_000), Err(ErrorKind::TargetInPast));
    }

    #[test]
    fn present_and_future_targets_are_accepted() {
        assert_eq!(resolve_arm(1_000, 1_000), Ok(()));
        assert_eq!(resolve_arm(2_000, 1_000), Ok(()));
    }

    #[test]
    fn action_names_are_stable() {
        assert_eq!(AgentAction::Start.name(), "start");
        assert_eq!(AgentAction::Stop.name(), "stop");
        assert_eq!(AgentAction::LocateStart { frame: 0 }.name(), "locate_start");
    }
}

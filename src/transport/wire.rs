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
    error::{SkeletonCrewError, SkeletonCrewResult},
    model::TransportState,
};
use rosc::{OscMessage, OscPacket, OscType, decoder, encoder};

/// The address vocabulary is stable for interoperability with existing OSC
/// tools; see the agent for the state machine behind it.
pub const ADDR_START: &str = "/transport/start";
pub const ADDR_STOP: &str = "/transport/stop";
pub const ADDR_LOCATE: &str = "/transport/locate";
pub const ADDR_LOCATE_START: &str = "/transport/locate_start";
pub const ADDR_QUERY: &str = "/transport/query";
pub const ADDR_STATE: &str = "/transport/state";

/// Typed view of the transport wire protocol. Instants are seconds since
/// the Unix epoch as doubles.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Start { target_instant: Option<f64> },
    Stop { target_instant: Option<f64> },
    Locate { frame: i64 },
    LocateStart { frame: i64, target_instant: f64 },
    Query,
    State { state: TransportState, frame: i64, now: f64 },
}

pub fn encode(message: &TransportMessage) -> SkeletonCrewResult<Vec<u8>> {
    let (addr, args) = match message {
        TransportMessage::Start { target_instant } => (
            ADDR_START,
            target_instant.iter().map(|t| OscType::Double(*t)).collect(),
        ),
        TransportMessage::Stop { target_instant } => (
            ADDR_STOP,
            target_instant.iter().map(|t| OscType::Double(*t)).collect(),
        ),
        TransportMessage::Locate { frame } => (ADDR_LOCATE, vec![OscType::Long(*frame)]),
        TransportMessage::LocateStart {
            frame,
            target_instant,
        } => (
            ADDR_LOCATE_START,
            vec![OscType::Long(*frame), OscType::Double(*target_instant)],
        ),
        TransportMessage::Query => (ADDR_QUERY, vec![]),
        TransportMessage::State { state, frame, now } => (
            ADDR_STATE,
            vec![
                OscType::String(state.to_string()),
                OscType::Long(*frame),
                OscType::Double(*now),
            ],
        ),
    };
    let packet = OscPacket::Message(OscMessage {
        addr: addr.to_owned(),
        args,
    });
    Ok(encoder::encode(&packet)?)
}

pub fn decode(buf: &[u8]) -> SkeletonCrewResult<TransportMessage> {
    let (_, packet) = decoder::decode_udp(buf)?;
    let OscPacket::Message(message) = packet else {
        return Err(malformed("bundles are not part of the transport protocol"));
    };
    decode_message(message)
}

fn decode_message(message: OscMessage) -> SkeletonCrewResult<TransportMessage> {
    match message.addr.as_str() {
        ADDR_START => Ok(TransportMessage::Start {
            target_instant: optional_instant(&message.args)?,
        }),
        ADDR_STOP => Ok(TransportMessage::Stop {
            target_instant: optional_instant(&message.args)?,
        }),
        ADDR_LOCATE => match message.args.as_slice() {
            [frame] => Ok(TransportMessage::Locate {
                frame: as_long(frame)
                    .ok_or_else(|| malformed("locate: frame must be an integer"))?,
            }),
            _ => Err(malformed("locate: expected exactly one argument")),
        },
        ADDR_LOCATE_START => match message.args.as_slice() {
            [frame, instant] => Ok(TransportMessage::LocateStart {
                frame: as_long(frame)
                    .ok_or_else(|| malformed("locate_start: frame must be an integer"))?,
                target_instant: as_double(instant)
                    .ok_or_else(|| malformed("locate_start: target must be a timestamp"))?,
            }),
            _ => Err(malformed("locate_start: expected frame and target instant")),
        },
        ADDR_QUERY => Ok(TransportMessage::Query),
        ADDR_STATE => match message.args.as_slice() {
            [state, frame, now] => Ok(TransportMessage::State {
                state: parse_state(state)?,
                frame: as_long(frame)
                    .ok_or_else(|| malformed("state: frame must be an integer"))?,
                now: as_double(now).ok_or_else(|| malformed("state: now must be a timestamp"))?,
            }),
            _ => Err(malformed("state: expected state, frame and timestamp")),
        },
        other => Err(malformed(format!("unknown address pattern {other}"))),
    }
}

fn optional_instant(args: &[OscType]) -> SkeletonCrewResult<Option<f64>> {
    match args {
        [] => Ok(None),
        [instant] => as_double(instant)
            .map(Some)
            .ok_or_else(|| malformed("target instant must be a timestamp")),
        _ => Err(malformed("expected at most one argument")),
    }
}

// Be liberal in what we accept: some OSC tools only emit 32 bit types.
fn as_double(arg: &OscType) -> Option<f64> {
    match arg {
        OscType::Double(d) => Some(*d),
        OscType::Float(f) => Some(f64::from(*f)),
        OscType::Long(l) => Some(*l as f64),
        OscType::Int(i) => Some(f64::from(*i)),
        _ => None,
    }
}

fn as_long(arg: &OscType) -> Option<i64> {
    match arg {
        OscType::Long(l) => Some(*l),
        OscType::Int(i) => Some(i64::from(*i)),
        _ => None,
    }
}

fn parse_state(arg: &OscType) -> SkeletonCrewResult<TransportState> {
    let OscType::String(s) = arg else {
        return Err(malformed("state must be a string"));
    };
    match s.as_str() {
        "stopped" => Ok(TransportState::Stopped),
        "rolling" => Ok(TransportState::Rolling),
        "starting" => Ok(TransportState::Starting),
        "stopping" => Ok(TransportState::Stopping),
        other => Err(malformed(format!("unknown transport state '{other}'"))),
    }
}

fn malformed(message: impl Into<String>) -> SkeletonCrewError {
    SkeletonCrewError::Other(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_messages_round_trip() {
        let messages = [
            TransportMessage::Start {
                target_instant: Some(1_754_000_000.25),
            },
            TransportMessage::Start {
                target_instant: None,
            },
            TransportMessage::Stop {
                target_instant: Some(1_754_000_010.5),
            },
            TransportMessage::Locate { frame: 96_000 },
            TransportMessage::LocateStart {
                frame: 0,
                target_instant: 1_754_000_003.0,
            },
            TransportMessage::Query,
            TransportMessage::State {
                state: TransportState::Rolling,
                frame: 48_000,
                now: 1_754_000_001.125,
            },
        ];
        for original in messages {
            let bytes = encode(&original).expect("encode");
            let decoded = decode(&bytes).expect("decode");
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn timestamps_keep_double_precision() {
        let instant = 1_754_000_123.456_789;
        let bytes = encode(&TransportMessage::Start {
            target_instant: Some(instant),
        })
        .expect("encode");
        match decode(&bytes).expect("decode") {
            TransportMessage::Start {
                target_instant: Some(t),
            } => assert!((t - instant).abs() < 1e-9),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn int_arguments_are_accepted_for_frames() {
        let packet = OscPacket::Message(OscMessage {
            addr: ADDR_LOCATE.to_owned(),
            args: vec![OscType::Int(4_800)],
        });
        let bytes = encoder::encode(&packet).expect("encode");
        assert_eq!(
            decode(&bytes).expect("decode"),
            TransportMessage::Locate { frame: 4_800 }
        );
    }

    #[test]
    fn unknown_addresses_are_malformed() {
        let packet = OscPacket::Message(OscMessage {
            addr: "/transport/fly".to_owned(),
            args: vec![],
        });
        let bytes = encoder::encode(&packet).expect("encode");
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn wrong_argument_types_are_malformed() {
        let packet = OscPacket::Message(OscMessage {
            addr: ADDR_LOCATE.to_owned(),
            args: vec![OscType::String("zero".to_owned())],
        });
        let bytes = encoder::encode(&packet).expect("encode");
        assert!(decode(&bytes).is_err());
    }
}

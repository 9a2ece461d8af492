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

pub mod client;
pub mod server;

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remote invocation request. Authentication is out of scope: the LAN is
/// trusted and callers are identified by node id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    pub caller_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "outcome")]
pub enum InvocationResponse {
    Ok {
        request_id: String,
        result: Value,
    },
    Error {
        request_id: String,
        error_kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responses_tag_their_outcome() {
        let ok = InvocationResponse::Ok {
            request_id: "r1".to_owned(),
            result: json!({"connected": true}),
        };
        let value = serde_json::to_value(&ok).expect("serialize");
        assert_eq!(value["outcome"], "ok");

        let err = InvocationResponse::Error {
            request_id: "r2".to_owned(),
            error_kind: ErrorKind::JackUnavailable,
            message: "JACK server is not reachable".to_owned(),
            retryable: true,
        };
        let value = serde_json::to_value(&err).expect("serialize");
        assert_eq!(value["outcome"], "error");
        assert_eq!(value["errorKind"], "jack_unavailable");
    }

    #[test]
    fn requests_round_trip() {
        let request = InvocationRequest {
            request_id: "abc123".to_owned(),
            tool_name: "connect_jack_ports".to_owned(),
            args: json!({"source": "system:capture_1", "sink": "voice_in:in_1"}),
            caller_id: "indigo".to_owned(),
        };
        let json = serde_json::to_string(&request).expect("serialize");
        let back: InvocationRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, request);
    }
}

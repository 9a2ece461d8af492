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
    error::{ErrorKind, SkeletonCrewError, SkeletonCrewResult, ToolError, ToolResult},
    gateway::{InvocationRequest, InvocationResponse},
    model::{NodeDescriptor, ServiceDescriptor},
};
use rand::Rng;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, instrument};

/// Client side of the remote invocation protocol. Cheap to clone; carries
/// the local node id as the caller identity.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    local_node_id: String,
    default_timeout: Duration,
}

impl GatewayClient {
    pub fn new(local_node_id: String, default_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            local_node_id,
            default_timeout,
        }
    }

    /// Invokes a tool on a peer with the default timeout.
    pub async fn invoke(
        &self,
        node: &NodeDescriptor,
        tool: &str,
        args: Value,
        caller_id: &str,
    ) -> ToolResult<Value> {
        self.invoke_with_timeout(node, tool, args, caller_id, self.default_timeout)
            .await
    }

    /// A request that outlives `timeout` fails locally with
    /// `remote_timeout`; the server side still completes and records its
    /// own history.
    #[instrument(skip(self, args), fields(node = %node.id))]
    pub async fn invoke_with_timeout(
        &self,
        node: &NodeDescriptor,
        tool: &str,
        args: Value,
        caller_id: &str,
        timeout: Duration,
    ) -> ToolResult<Value> {
        let request = InvocationRequest {
            request_id: new_request_id(),
            tool_name: tool.to_owned(),
            args,
            caller_id: caller_id.to_owned(),
        };
        let url = format!("{}/invoke", node.control_endpoint());
        debug!("Invoking '{tool}' at {url}");

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::new(
                        ErrorKind::RemoteTimeout,
                        format!("'{tool}' on '{}' did not answer within {timeout:?}", node.id),
                    )
                } else {
                    ToolError::internal(format!("request to '{}' failed: {e}", node.id))
                }
            })?;

        let response: InvocationResponse = response
            .json()
            .await
            .map_err(|e| ToolError::internal(format!("invalid response from '{}': {e}", node.id)))?;

        match response {
            InvocationResponse::Ok { result, .. } => Ok(result),
            InvocationResponse::Error {
                error_kind,
                message,
                retryable,
                ..
            } => Err(ToolError {
                kind: error_kind,
                message,
                retryable,
            }),
        }
    }

    /// Full service snapshot of a peer, used to warm the local projection.
    pub async fn fetch_services(
        &self,
        node: &NodeDescriptor,
    ) -> SkeletonCrewResult<Vec<ServiceDescriptor>> {
        let result = self
            .invoke(
                node,
                "list_services",
                json!({ "node": node.id }),
                &self.local_node_id,
            )
            .await
            .map_err(|e| SkeletonCrewError::Other(e.to_string()))?;
        Ok(serde_json::from_value(result)?)
    }
}

fn new_request_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

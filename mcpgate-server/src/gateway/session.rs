// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{GatewayEvent, GatewayStatsInternal, StreamUpdate};
use crate::transport::EventStream;

/// Exclusive owner of one SSE stream. Dropping it closes the stream.
#[derive(Debug)]
pub struct SessionHandle {
    task: JoinHandle<()>,
    stats: Arc<GatewayStatsInternal>,
}

impl SessionHandle {
    /// Pumps `stream` into the gateway's event channel, tagged with the
    /// record's generation.
    pub(crate) fn spawn(
        connection_id: String,
        generation: u64,
        mut stream: EventStream,
        events: mpsc::UnboundedSender<GatewayEvent>,
        stats: Arc<GatewayStatsInternal>,
    ) -> Self {
        stats.open_sessions.fetch_add(1, Ordering::Relaxed);
        stats.sessions_opened.fetch_add(1, Ordering::Relaxed);

        let task = tokio::spawn(async move {
            let report = |update| GatewayEvent::Stream {
                connection_id: connection_id.clone(),
                generation,
                update,
            };

            while let Some(item) = stream.next().await {
                let (update, last) = match item {
                    Ok(message) => (StreamUpdate::Message(message), false),
                    Err(err) => (StreamUpdate::Failed(err), true),
                };
                if events.send(report(update)).is_err() || last {
                    return;
                }
            }

            let _ = events.send(report(StreamUpdate::Ended));
        });

        Self { task, stats }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
        self.stats.open_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

// Copyright 2025 Sushanth (https://github.com/sushanthpy)
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

//! Subscriber sinks.
//!
//! A sink receives whole batches. Returning an error counts as a failed
//! delivery; enough consecutive failures unregister the subscriber.

use crate::update::UpdateBatch;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Subscriber disconnected")]
    Disconnected,

    #[error("Subscriber queue is full")]
    Full,

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Subscriber panicked during delivery")]
    Panicked,

    #[error("{0}")]
    Other(String),
}

/// Receiver of update batches
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn deliver(&self, batch: &UpdateBatch) -> Result<(), SinkError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "sink"
    }
}

/// Sink forwarding batches into a bounded channel without waiting
#[derive(Debug, Clone)]
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<UpdateBatch>,
}

impl ChannelSink {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<UpdateBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl UpdateSink for ChannelSink {
    async fn deliver(&self, batch: &UpdateBatch) -> Result<(), SinkError> {
        self.tx.try_send(batch.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Disconnected,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Sink calling a synchronous closure
pub struct CallbackSink<F> {
    name: String,
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: Fn(&UpdateBatch) -> Result<(), SinkError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

#[async_trait]
impl<F> UpdateSink for CallbackSink<F>
where
    F: Fn(&UpdateBatch) -> Result<(), SinkError> + Send + Sync,
{
    async fn deliver(&self, batch: &UpdateBatch) -> Result<(), SinkError> {
        (self.callback)(batch)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

//! Re-frames the backend's event stream into the client's NDJSON stream.
//!
//! A relay task per streaming exchange pulls backend frames and pushes encoded
//! client frames into a bounded channel. The channel is the only buffer: when
//! it is full the task stops reading from the backend, and when the client
//! goes away the task drops the backend stream, which cancels the request.

use std::{sync::Arc, time::Instant};

use axum::body::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, BackendStream},
    errors::AppError,
    metrics::{AppMetrics, InflightGuard},
    models::{ClientFrame, ResponseShape, StreamFrame, Usage},
    translate::{fragment_frame, terminal_frame},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Opened,
    Relaying,
    Completed,
    Aborted,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RelayState::Completed | RelayState::Aborted)
    }
}

#[derive(Debug)]
pub enum Termination {
    Completed,
    BackendFailed(BackendError),
    ClientDisconnected,
}

impl Termination {
    pub fn outcome(&self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::BackendFailed(_) => "backend_error",
            Termination::ClientDisconnected => "client_disconnected",
        }
    }
}

#[derive(Debug)]
pub enum Step {
    /// Nothing to send for this backend event.
    Skip,
    Forward(ClientFrame),
    /// The single `done = true` frame, and why the stream ended.
    Terminate(ClientFrame, Termination),
}

/// Per-exchange state machine, independent of any I/O.
#[derive(Debug)]
pub struct Relay {
    state: RelayState,
    shape: ResponseShape,
    model_alias: String,
    started: Instant,
    usage: Option<Usage>,
}

impl Relay {
    pub fn new(shape: ResponseShape, model_alias: impl Into<String>, started: Instant) -> Self {
        Self {
            state: RelayState::Idle,
            shape,
            model_alias: model_alias.into(),
            started,
            usage: None,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn shape(&self) -> ResponseShape {
        self.shape
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Token counts from the backend's final frame, when it sent any.
    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// Feeds the next backend event; `None` is end of input.
    pub fn on_backend(&mut self, event: Option<Result<StreamFrame, BackendError>>) -> Step {
        if self.state.is_terminal() {
            return Step::Skip;
        }
        if self.state == RelayState::Idle {
            self.state = RelayState::Opened;
        }

        match event {
            Some(Ok(StreamFrame::Delta { content, .. })) => {
                self.state = RelayState::Relaying;
                if content.is_empty() {
                    Step::Skip
                } else {
                    Step::Forward(fragment_frame(self.shape, &self.model_alias, content))
                }
            }
            Some(Ok(StreamFrame::Finished {
                finish_reason,
                usage,
            })) => {
                self.state = RelayState::Completed;
                self.usage = usage;
                let reason = finish_reason.unwrap_or_else(|| "stop".to_owned());
                Step::Terminate(self.terminal(Some(reason), usage), Termination::Completed)
            }
            None => {
                self.state = RelayState::Completed;
                Step::Terminate(
                    self.terminal(Some("stop".to_owned()), None),
                    Termination::Completed,
                )
            }
            Some(Err(error)) => {
                self.state = RelayState::Aborted;
                Step::Terminate(
                    self.terminal(Some("error".to_owned()), None),
                    Termination::BackendFailed(error),
                )
            }
        }
    }

    pub fn on_client_gone(&mut self) {
        if !self.state.is_terminal() {
            self.state = RelayState::Aborted;
        }
    }

    fn terminal(&self, reason: Option<String>, usage: Option<Usage>) -> ClientFrame {
        terminal_frame(
            self.shape,
            &self.model_alias,
            reason,
            usage,
            self.started.elapsed(),
        )
    }
}

/// Starts the relay task and returns the client-facing body stream.
///
/// The in-flight guard is held by the task, so the gauge drops only when the
/// exchange is over.
pub fn spawn_relay(
    frames: BackendStream,
    relay: Relay,
    metrics: Arc<AppMetrics>,
    inflight: InflightGuard,
    window: usize,
) -> ReceiverStream<Bytes> {
    let (tx, rx) = mpsc::channel(window.max(1));
    tokio::spawn(pump(frames, relay, tx, metrics, inflight));
    ReceiverStream::new(rx)
}

async fn pump(
    mut frames: BackendStream,
    mut relay: Relay,
    tx: mpsc::Sender<Bytes>,
    metrics: Arc<AppMetrics>,
    inflight: InflightGuard,
) {
    let endpoint = relay.shape().endpoint();
    let mut relayed = 0_u64;

    let termination = loop {
        let event = tokio::select! {
            biased;
            _ = tx.closed() => break Termination::ClientDisconnected,
            event = frames.next() => event,
        };

        match relay.on_backend(event) {
            Step::Skip => continue,
            Step::Forward(frame) => {
                if tx.send(encode_frame(&frame)).await.is_err() {
                    break Termination::ClientDisconnected;
                }
                relayed += 1;
                metrics.observe_streamed_frame(endpoint);
            }
            Step::Terminate(frame, termination) => {
                if tx.send(encode_frame(&frame)).await.is_err() {
                    break Termination::ClientDisconnected;
                }
                metrics.observe_streamed_frame(endpoint);
                break termination;
            }
        }
    };

    // Dropping the stream closes the backend connection.
    drop(frames);

    let outcome = match &termination {
        Termination::Completed => {
            if let Some(usage) = relay.usage() {
                metrics.observe_usage(&usage);
            }
            debug!(endpoint, frames = relayed, "stream completed");
            "success"
        }
        Termination::BackendFailed(error) => {
            let kind = AppError::from(error.clone()).kind();
            metrics.observe_error(kind);
            warn!(
                endpoint,
                frames = relayed,
                stage = error.stage(),
                error = %error,
                "backend stream failed, terminated client stream"
            );
            kind
        }
        Termination::ClientDisconnected => {
            relay.on_client_gone();
            debug!(endpoint, frames = relayed, "client disconnected, backend stream cancelled");
            termination.outcome()
        }
    };
    // Headers went out as 200; the outcome label carries how the stream ended.
    metrics.observe_request(endpoint, 200, outcome, relay.elapsed());
    metrics.observe_stream_end(endpoint, termination.outcome());

    // The client sees end of body only after the exchange is fully accounted.
    drop(inflight);
    drop(tx);
}

/// One NDJSON line.
pub fn encode_frame(frame: &ClientFrame) -> Bytes {
    let mut line = match serde_json::to_vec(frame) {
        Ok(serialized) => serialized,
        Err(error) => serde_json::json!({
            "error": format!("serialization error: {error}"),
            "done": frame.done(),
        })
        .to_string()
        .into_bytes(),
    };
    line.push(b'\n');
    Bytes::from(line)
}

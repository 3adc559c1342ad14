//! One supervised push channel per session: open, identify, heartbeat,
//! reconnect with backoff, and forward typed events in arrival order.

pub mod transport;

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{FrameError, IdentifyPayload, InboundEvent, InboundFrame, OutboundFrame},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{config::RealtimeConfig, error::TransportError};

pub use transport::{ChannelConnector, ChannelIo, Frame, FrameSink, FrameStream, WsConnector};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Everything the channel tells its owner, on one ordered queue.
#[derive(Debug, Clone)]
pub enum ChannelNotice {
    StateChanged(ConnectionState),
    Push {
        event: InboundEvent,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Server clock reading carried by a `pong`.
    ServerTime(DateTime<Utc>),
    ConnectionLost {
        attempts: u32,
    },
}

#[derive(Clone)]
struct Publisher {
    state: Arc<watch::Sender<ConnectionState>>,
    notices: mpsc::UnboundedSender<ChannelNotice>,
}

impl Publisher {
    fn publish(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "realtime: state transition");
            self.notify(ChannelNotice::StateChanged(next));
        }
    }

    fn notify(&self, notice: ChannelNotice) {
        // the owner is gone during teardown; nothing left to tell
        let _ = self.notices.send(notice);
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct RealtimeChannel {
    config: RealtimeConfig,
    user_id: UserId,
    url: watch::Sender<Url>,
    connector: Arc<dyn ChannelConnector>,
    publisher: Publisher,
    cancel: CancellationToken,
    running: Option<Running>,
}

impl RealtimeChannel {
    pub fn new(
        config: RealtimeConfig,
        url: Url,
        user_id: UserId,
        connector: Arc<dyn ChannelConnector>,
        notices: mpsc::UnboundedSender<ChannelNotice>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (url, _) = watch::channel(url);
        Self {
            config,
            user_id,
            url,
            connector,
            publisher: Publisher {
                state: Arc::new(state),
                notices,
            },
            cancel,
            running: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.publisher.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.publisher.state.subscribe()
    }

    /// Takes effect on the next connection attempt.
    pub fn set_url(&self, url: Url) {
        self.url.send_replace(url);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Starts the supervisor unless one is already running. After `Failed`
    /// this is the manual retry, with a fresh attempt counter.
    pub fn connect(&mut self) {
        if self.is_running() {
            debug!("realtime: connect ignored, supervisor already running");
            return;
        }
        if self.cancel.is_cancelled() {
            warn!("realtime: connect ignored, session is shut down");
            return;
        }

        let cancel = self.cancel.child_token();
        let supervisor = Supervisor {
            config: self.config,
            user_id: self.user_id,
            url: self.url.subscribe(),
            connector: Arc::clone(&self.connector),
            publisher: self.publisher.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run());
        self.running = Some(Running { cancel, task });
    }

    /// Closes the transport, stops heartbeat and reconnect timers, and waits
    /// for the supervisor to finish.
    pub async fn disconnect(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Err(err) = running.task.await {
                error!(error = %err, "realtime: supervisor task failed");
            }
        }
        self.publisher.publish(ConnectionState::Disconnected);
    }
}

enum SessionEnd {
    Cancelled,
    Dropped {
        reason: String,
        /// The server sent something or the session outlived one heartbeat
        /// period. A session that ends before either counts as a failed
        /// attempt.
        healthy: bool,
    },
}

struct Supervisor {
    config: RealtimeConfig,
    user_id: UserId,
    url: watch::Receiver<Url>,
    connector: Arc<dyn ChannelConnector>,
    publisher: Publisher,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let policy = self.config.reconnect;
        let mut failures: u32 = 0;
        loop {
            self.publisher.publish(ConnectionState::Connecting);
            let url = self.url.borrow().clone();
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = tokio::time::timeout(
                    self.config.connect_timeout(),
                    self.connector.connect(&url),
                ) => opened,
            };

            match opened {
                Ok(Ok(io)) => {
                    self.publisher.publish(ConnectionState::Connected);
                    info!(user_id = self.user_id.0, "realtime: channel open");
                    match self.run_session(io).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Dropped {
                            reason,
                            healthy: true,
                        } => {
                            failures = 0;
                            warn!(user_id = self.user_id.0, reason = %reason, "realtime: channel dropped");
                        }
                        SessionEnd::Dropped {
                            reason,
                            healthy: false,
                        } => {
                            failures += 1;
                            warn!(
                                attempt = failures,
                                max_attempts = policy.max_attempts,
                                reason = %reason,
                                "realtime: channel dropped right after opening"
                            );
                        }
                    }
                }
                Ok(Err(err)) => {
                    failures += 1;
                    warn!(
                        attempt = failures,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "realtime: connect failed"
                    );
                }
                Err(_) => {
                    failures += 1;
                    warn!(
                        attempt = failures,
                        max_attempts = policy.max_attempts,
                        timeout_ms = self.config.connect_timeout_ms,
                        "realtime: connect timed out"
                    );
                }
            }

            self.publisher.publish(ConnectionState::Reconnecting);
            if failures >= policy.max_attempts {
                error!(
                    attempts = failures,
                    "realtime: reconnect attempts exhausted, giving up"
                );
                self.publisher.publish(ConnectionState::Failed);
                self.publisher
                    .notify(ChannelNotice::ConnectionLost { attempts: failures });
                return;
            }

            let delay = policy.delay_before_attempt(failures + 1);
            info!(
                attempt = failures + 1,
                delay_ms = delay.as_millis() as u64,
                "realtime: reconnect scheduled"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.publisher.publish(ConnectionState::Disconnected);
    }

    async fn run_session(&self, io: ChannelIo) -> SessionEnd {
        let ChannelIo {
            mut sink,
            mut stream,
        } = io;

        let identify = OutboundFrame::Identify(IdentifyPayload {
            user_id: self.user_id,
        });
        if let Err(err) = send_frame(&mut sink, &identify).await {
            return SessionEnd::Dropped {
                reason: err.to_string(),
                healthy: false,
            };
        }

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed_acks: u32 = 0;
        let mut healthy = false;
        let dropped = |reason: String, healthy: bool| SessionEnd::Dropped { reason, healthy };

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    close_quietly(&mut sink).await;
                    return SessionEnd::Cancelled;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Frame::Text(text))) => {
                        healthy = true;
                        self.dispatch(&text, &mut missed_acks);
                    }
                    Some(Ok(Frame::Close)) => return dropped("closed by server".into(), healthy),
                    Some(Err(err)) => return dropped(err.to_string(), healthy),
                    None => return dropped("stream ended".into(), healthy),
                },
                _ = heartbeat.tick() => {
                    healthy = true;
                    if missed_acks >= self.config.max_missed_acks {
                        warn!(missed_acks, "realtime: heartbeat unanswered, channel is stale");
                        close_quietly(&mut sink).await;
                        return dropped("stale heartbeat".into(), healthy);
                    }
                    let ping = OutboundFrame::Ping { timestamp: Utc::now() };
                    if let Err(err) = send_frame(&mut sink, &ping).await {
                        return dropped(err.to_string(), healthy);
                    }
                    missed_acks += 1;
                }
            }
        }
    }

    fn dispatch(&self, text: &str, missed_acks: &mut u32) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::Pong { timestamp }) => {
                *missed_acks = 0;
                if let Some(timestamp) = timestamp {
                    self.publisher.notify(ChannelNotice::ServerTime(timestamp));
                }
            }
            Ok(InboundFrame::Event { event, timestamp }) => {
                self.publisher
                    .notify(ChannelNotice::Push { event, timestamp });
            }
            Err(FrameError::UnknownType(kind)) => {
                warn!(kind = %kind, "realtime: dropping event of unknown type");
            }
            Err(err) => {
                warn!(error = %err, "realtime: dropping malformed frame");
            }
        }
    }
}

async fn send_frame(sink: &mut FrameSink, frame: &OutboundFrame) -> Result<(), TransportError> {
    let text = frame
        .to_text()
        .map_err(|err| TransportError::Send(err.to_string()))?;
    sink.send(Frame::Text(text)).await
}

async fn close_quietly(sink: &mut FrameSink) {
    let closing = async {
        let _ = sink.send(Frame::Close).await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(CLOSE_GRACE, closing).await.is_err() {
        debug!("realtime: close handshake timed out");
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod channel_tests;

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod ws_tests;

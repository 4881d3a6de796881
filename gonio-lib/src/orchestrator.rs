//! Runs sessions one after another on behalf of a front end.
//!
//! Requests go in over an mpsc channel, [`Notice`]s come back out. At most one
//! session exists at a time, and a new one is created only after the previous
//! session has closed its channel.

use crate::channel::Channel;
use crate::session::{ProtocolSession, SessionConfig, SessionEvent, SessionHandle, SessionOutcome};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum Request {
    Start(SessionConfig),
    /// Cooperative stop of the running session
    Stop,
    /// Stops the running session, waits for it, then exits
    Shutdown,
}

#[derive(Debug)]
pub enum Notice {
    Session(SessionEvent),
    Finished(Box<SessionOutcome>),
    /// A start request arrived while a session was running
    Busy(String),
    /// The session task died without an outcome
    Lost(String),
}

/// Front-end side of a running [`Controller`].
pub struct ControllerHandle {
    requests: mpsc::Sender<Request>,
    notices: mpsc::UnboundedReceiver<Notice>,
}

impl ControllerHandle {
    pub async fn start(&self, config: SessionConfig) -> bool {
        self.requests.send(Request::Start(config)).await.is_ok()
    }

    pub async fn stop(&self) -> bool {
        self.requests.send(Request::Stop).await.is_ok()
    }

    pub async fn shutdown(&self) -> bool {
        self.requests.send(Request::Shutdown).await.is_ok()
    }

    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.recv().await
    }
}

/// Owns the channel factory and the running session.
pub struct Controller<F> {
    factory: F,
    requests: mpsc::Receiver<Request>,
    notices: mpsc::UnboundedSender<Notice>,
    active: Option<SessionHandle>,
}

impl<C, F> Controller<F>
where
    C: Channel + 'static,
    F: FnMut() -> C + Send + 'static,
{
    /// Spawns a controller creating a fresh channel for every session.
    pub fn spawn(factory: F) -> (ControllerHandle, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let controller = Self {
            factory,
            requests: request_rx,
            notices: notice_tx,
            active: None,
        };
        let task = tokio::spawn(controller.run());
        (
            ControllerHandle {
                requests: request_tx,
                notices: notice_rx,
            },
            task,
        )
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Start(config)) => self.start(config),
                    Some(Request::Stop) => match &self.active {
                        Some(active) => {
                            info!("stop requested");
                            active.stop();
                        }
                        None => debug!("stop requested with no session running"),
                    },
                    Some(Request::Shutdown) | None => {
                        if let Some(active) = self.active.take() {
                            info!("shutting down, stopping the running session");
                            active.stop();
                            self.drain(active).await;
                        }
                        break;
                    }
                },
                event = next_event(&mut self.active), if self.active.is_some() => match event {
                    Some(event) => self.notify(Notice::Session(event)),
                    None => {
                        if let Some(active) = self.active.take() {
                            self.finish(active).await;
                        }
                    }
                },
            }
        }
        debug!("controller exited");
    }

    fn start(&mut self, config: SessionConfig) {
        if self.active.is_some() {
            warn!(name = %config.name, "session already running, start request rejected");
            self.notify(Notice::Busy(config.name));
            return;
        }
        info!(operation = %config.operation, name = %config.name, "starting session");
        let channel = (self.factory)();
        self.active = Some(ProtocolSession::new(channel, config).spawn());
    }

    /// Forwards the remaining events of `active`, then its outcome.
    async fn drain(&mut self, mut active: SessionHandle) {
        while let Some(event) = active.next_event().await {
            self.notify(Notice::Session(event));
        }
        self.finish(active).await;
    }

    async fn finish(&mut self, active: SessionHandle) {
        match active.join().await {
            Ok(outcome) => self.notify(Notice::Finished(Box::new(outcome))),
            Err(e) => {
                error!("session task failed: {}", e);
                self.notify(Notice::Lost(e.to_string()));
            }
        }
    }

    fn notify(&self, notice: Notice) {
        // Front end gone; keep running so the session still closes cleanly.
        let _ = self.notices.send(notice);
    }
}

async fn next_event(active: &mut Option<SessionHandle>) -> Option<SessionEvent> {
    match active {
        Some(active) => active.next_event().await,
        None => std::future::pending().await,
    }
}

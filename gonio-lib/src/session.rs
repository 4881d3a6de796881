//! One run of the rig: open, handshake, stream, stop, close.
//!
//! Measurement and calibration share the same state machine; a
//! [`SessionConfig`] carries everything that differs between them.
//!
//! ```text
//! Idle -> Opening -> AwaitingAck -> Streaming -> StoppingDevice -> Closing -> Done
//!            \____________\______________\______________________/
//!                                    Failed
//! ```
//!
//! Every path ends in `Closing`: the channel is closed whatever happened and
//! the samples collected so far are always part of the outcome.

use crate::ack::{AckWaiter, SharedAssembler};
use crate::channel::Channel;
use crate::constants::{ACK_TIMEOUT, POLL_INTERVAL};
use crate::error::SessionError;
use crate::frame::FrameAssembler;
use crate::geometry::{SampleSet, SphericalSample};
use crate::photometry::{self, PhotometryReport, Resolution};
use crate::protocol::{
    Command, IntensityConversion, Parsed, Record, RecordLayout, RecordParser, ScanConfig, Vocabulary,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The two operations the rig supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Operation {
    #[strum(to_string = "measure")]
    Measure,
    #[strum(to_string = "calibrate")]
    Calibrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Idle,
    Opening,
    AwaitingAck,
    Streaming,
    StoppingDevice,
    Closing,
    Done,
    Failed,
}

/// Per-operation behaviour of a [`ProtocolSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Run name used in log lines and result file names
    pub name: String,
    pub operation: Operation,
    pub command: Command,
    /// Tokens sent right after the command
    pub start_tokens: Vec<String>,
    pub layout: RecordLayout,
    /// Run the photometry engine on completion at this resolution
    pub photometry: Option<Resolution>,
    pub vocabulary: Vocabulary,
    pub ack_timeout: Duration,
    pub poll_interval: Duration,
}

impl SessionConfig {
    pub fn measure(scan: ScanConfig, conversion: IntensityConversion) -> Self {
        Self {
            name: Operation::Measure.to_string(),
            operation: Operation::Measure,
            command: Command::Start,
            start_tokens: scan.tokens().to_vec(),
            layout: RecordLayout::Measurement(conversion),
            photometry: Some(Resolution::new(scan.res_theta, scan.res_phi)),
            vocabulary: Vocabulary::default(),
            ack_timeout: ACK_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn calibrate() -> Self {
        Self {
            name: Operation::Calibrate.to_string(),
            operation: Operation::Calibrate,
            command: Command::Calibrate,
            start_tokens: Vec::new(),
            layout: RecordLayout::Calibration,
            photometry: None,
            vocabulary: Vocabulary::default(),
            ack_timeout: ACK_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_vocabulary(mut self, vocabulary: Vocabulary) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn without_photometry(mut self) -> Self {
        self.photometry = None;
        self
    }
}

/// Cooperative stop request, checked once per streaming iteration.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress reported while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    State(SessionState),
    Log(String),
    Sample(SphericalSample),
}

/// Everything a finished session hands to the result sink.
#[derive(Debug)]
pub struct SessionOutcome {
    pub name: String,
    pub operation: Operation,
    /// `Done`, or `Failed` when a phase failed fatally
    pub final_state: SessionState,
    pub samples: SampleSet,
    pub stopped_by_user: bool,
    pub had_error: bool,
    pub device_unresponsive: bool,
    pub malformed_records: usize,
    /// Last offset streamed by a calibration
    pub calibration_offset: Option<f64>,
    pub photometry: Option<PhotometryReport>,
    pub errors: Vec<SessionError>,
}

impl SessionOutcome {
    /// Neither stopped by the user nor cut short by an error.
    pub fn ended_normally(&self) -> bool {
        !self.stopped_by_user && !self.had_error
    }

    /// Usable, but some records were dropped or nothing was collected.
    pub fn is_degraded(&self) -> bool {
        self.malformed_records > 0
            || match self.operation {
                Operation::Measure => self.samples.is_empty(),
                Operation::Calibrate => self.calibration_offset.is_none(),
            }
    }
}

/// Handle to a session running on its own task.
pub struct SessionHandle {
    stop: StopSignal,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Next progress event; `None` once the session has finished.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub async fn join(self) -> Result<SessionOutcome, SessionError> {
        Ok(self.task.await?)
    }

    pub async fn stop_and_join(self) -> Result<SessionOutcome, SessionError> {
        self.stop();
        self.join().await
    }
}

/// Drives one measurement or calibration over an exclusively owned channel.
pub struct ProtocolSession<C> {
    config: SessionConfig,
    channel: C,
    stop: StopSignal,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl<C: Channel + 'static> ProtocolSession<C> {
    pub fn new(channel: C, config: SessionConfig) -> Self {
        Self {
            config,
            channel,
            stop: StopSignal::default(),
            events: None,
        }
    }

    /// Runs the session on a dedicated task, reporting progress as events.
    pub fn spawn(mut self) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        let stop = self.stop.clone();
        SessionHandle {
            stop,
            events: rx,
            task: tokio::spawn(self.run()),
        }
    }

    pub async fn run(self) -> SessionOutcome {
        let Self {
            config,
            channel,
            stop,
            events,
        } = self;
        let mut run = Run::new(config, events);

        let assembler: SharedAssembler<C> = Arc::new(Mutex::new(
            FrameAssembler::new(channel, run.config.vocabulary.separator)
                .with_poll_interval(run.config.poll_interval),
        ));
        let waiter = AckWaiter::new(
            Arc::clone(&assembler),
            run.config.vocabulary.clone(),
            run.config.ack_timeout,
        );
        let mut parser = RecordParser::new(run.config.vocabulary.clone(), run.config.layout);

        run.log(format!("Starting {} {}...", run.config.operation, run.config.name));

        run.transition(SessionState::Opening);
        let opened = match assembler.lock().await.channel_mut().open().await {
            Ok(()) => true,
            Err(e) => {
                run.fail(SessionError::ChannelUnavailable(e));
                false
            }
        };

        if opened {
            if let Some(early) = run.start_device(&assembler, &waiter).await {
                run.stream(&assembler, &mut parser, &stop, early).await;
            }
            if let Some(m) = parser.finish() {
                run.malformed(m.position, m.reason);
            }
            if (run.stopped_by_user || run.had_error) && !run.device_unresponsive {
                run.stop_device(&assembler, &waiter).await;
            }
        }

        run.transition(SessionState::Closing);
        assembler.lock().await.channel_mut().close().await;
        let final_state = if run.failed {
            SessionState::Failed
        } else {
            SessionState::Done
        };
        run.transition(final_state);
        run.log(format!("Stopped {}: {}.", run.config.operation, run.config.name));

        run.into_outcome(final_state)
    }
}

/// Mutable bookkeeping of one run.
struct Run {
    config: SessionConfig,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    state: SessionState,
    samples: Vec<SphericalSample>,
    offset: Option<f64>,
    malformed: usize,
    errors: Vec<SessionError>,
    stopped_by_user: bool,
    had_error: bool,
    device_unresponsive: bool,
    failed: bool,
}

impl Run {
    fn new(config: SessionConfig, events: Option<mpsc::UnboundedSender<SessionEvent>>) -> Self {
        Self {
            config,
            events,
            state: SessionState::Idle,
            samples: Vec::new(),
            offset: None,
            malformed: 0,
            errors: Vec::new(),
            stopped_by_user: false,
            had_error: false,
            device_unresponsive: false,
            failed: false,
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // The receiver going away must not disturb the run.
            let _ = events.send(event);
        }
    }

    fn log(&self, line: String) {
        info!(session = %self.config.name, "{}", line);
        self.emit(SessionEvent::Log(line));
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.config.name, from = %self.state, to = %next, "state transition");
        self.state = next;
        self.emit(SessionEvent::State(next));
    }

    fn fail(&mut self, err: SessionError) {
        error!(session = %self.config.name, state = %self.state, "{}", err);
        self.emit(SessionEvent::Log(err.to_string()));
        self.had_error = true;
        self.failed = true;
        self.errors.push(err);
        self.transition(SessionState::Failed);
    }

    fn malformed(&mut self, position: usize, reason: String) {
        warn!(session = %self.config.name, position, %reason, "malformed record skipped");
        self.malformed += 1;
        self.errors.push(SessionError::MalformedRecord { position, reason });
    }

    /// Feeds tokens to the parser in order. Returns true once `END` is seen;
    /// anything after it is ignored.
    fn feed(&mut self, parser: &mut RecordParser, tokens: &[String]) -> bool {
        for (i, token) in tokens.iter().enumerate() {
            for parsed in parser.push(token) {
                match parsed {
                    Parsed::Pending => {}
                    Parsed::Record(Record::Sample(sample)) => {
                        self.samples.push(sample);
                        self.emit(SessionEvent::Sample(sample));
                    }
                    Parsed::Record(Record::Offset(offset)) => {
                        debug!(offset, "calibration offset received");
                        self.offset = Some(offset);
                    }
                    Parsed::Malformed(m) => self.malformed(m.position, m.reason),
                    Parsed::Ack => debug!("ignoring late ACK"),
                    Parsed::Stray => debug!(%token, "ignoring token outside a record"),
                    Parsed::End => {
                        let ignored = tokens.len() - i - 1;
                        if ignored > 0 {
                            debug!(ignored, "ignoring tokens after END");
                        }
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Sends the command and its arguments, then waits for the ACK.
    ///
    /// Returns the tokens that arrived with the acknowledgement, or `None`
    /// when streaming must not start.
    async fn start_device<C: Channel + 'static>(
        &mut self,
        assembler: &SharedAssembler<C>,
        waiter: &AckWaiter<C>,
    ) -> Option<Vec<String>> {
        let separator = self.config.vocabulary.separator;
        let command = self.config.vocabulary.command(self.config.command).to_string();
        let args = self.config.start_tokens.clone();

        let sent = {
            let mut assembler = assembler.lock().await;
            let mut sent = assembler.discard().await;
            if sent.is_ok() {
                self.log("Starting device...".to_string());
                sent = assembler.channel_mut().send(&format!("{command}{separator}")).await;
            }
            for (i, arg) in args.iter().enumerate() {
                if sent.is_err() {
                    break;
                }
                self.log(format!("Sending configuration... ({}/{})", i + 1, args.len()));
                debug!(token = %arg, "configuration token");
                sent = assembler.channel_mut().send(&format!("{arg}{separator}")).await;
            }
            sent
        };
        if let Err(e) = sent {
            self.fail(SessionError::StreamIo(e));
            return None;
        }

        self.transition(SessionState::AwaitingAck);
        self.log("Waiting acknowledgement...".to_string());
        match waiter.wait(&command).await {
            Ok(early) => {
                self.log("Acknowledgement received.".to_string());
                Some(early)
            }
            Err(err @ SessionError::HandshakeTimeout { .. }) => {
                self.device_unresponsive = true;
                self.log("The device doesn't answer.".to_string());
                self.fail(err);
                None
            }
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    /// Collects records until `END`, a stop request, or an I/O error.
    async fn stream<C: Channel + 'static>(
        &mut self,
        assembler: &SharedAssembler<C>,
        parser: &mut RecordParser,
        stop: &StopSignal,
        early: Vec<String>,
    ) {
        self.transition(SessionState::Streaming);
        if !early.is_empty() {
            debug!(count = early.len(), "processing tokens received with the acknowledgement");
        }
        let mut ended = self.feed(parser, &early);

        while !ended {
            if stop.is_stopped() {
                self.stopped_by_user = true;
                self.log(format!("Finishing {}: {}...", self.config.operation, self.config.name));
                return;
            }
            let polled = assembler.lock().await.poll_frame().await;
            match polled {
                Ok(Some(frame)) => ended = self.feed(parser, &frame.tokens),
                Ok(None) => {}
                Err(e) => {
                    self.fail(SessionError::StreamIo(e));
                    return;
                }
            }
        }
        info!(
            session = %self.config.name,
            samples = self.samples.len(),
            "end of stream"
        );
    }

    /// Sends `STOP` and waits for its acknowledgement. Failure is reported
    /// but never blocks closing.
    async fn stop_device<C: Channel + 'static>(
        &mut self,
        assembler: &SharedAssembler<C>,
        waiter: &AckWaiter<C>,
    ) {
        self.transition(SessionState::StoppingDevice);
        self.log("Stopping device...".to_string());
        let separator = self.config.vocabulary.separator;
        let command = self.config.vocabulary.command(Command::Stop).to_string();

        let sent = assembler
            .lock()
            .await
            .channel_mut()
            .send(&format!("{command}{separator}"))
            .await;
        let result = match sent {
            Ok(()) => waiter.wait(&command).await.map(|late| {
                if !late.is_empty() {
                    debug!(count = late.len(), "discarding tokens received while stopping");
                }
            }),
            Err(e) => Err(SessionError::StreamIo(e)),
        };
        match result {
            Ok(()) => self.log("Device stopped.".to_string()),
            Err(e) => {
                warn!(session = %self.config.name, "stop handshake failed: {}", e);
                if matches!(e, SessionError::HandshakeTimeout { .. }) {
                    self.device_unresponsive = true;
                }
                self.had_error = true;
                self.errors.push(SessionError::StopHandshake(e.to_string()));
                self.emit(SessionEvent::Log("The device could not be stopped.".to_string()));
            }
        }
    }

    fn into_outcome(mut self, final_state: SessionState) -> SessionOutcome {
        let samples = SampleSet::new(std::mem::take(&mut self.samples));

        let photometry = match (self.config.operation, self.config.photometry) {
            (Operation::Measure, Some(resolution)) => {
                let report = photometry::analyze(&samples, resolution);
                self.log(format!(
                    "Expected number of measures: {} (semi-sphere), {} (sphere); received {}.",
                    report.expected_semi_sphere, report.expected_full_sphere, report.actual_count
                ));
                match &report.flux {
                    Ok(flux) => self.log(format!("Luminous flux: {flux:.2} lm")),
                    Err(e) => {
                        warn!(session = %self.config.name, "{}", e);
                        self.errors.push(SessionError::Photometry(e.clone()));
                    }
                }
                self.log(format!(
                    "FWHM: {:.2} deg (horizontal), {:.2} deg (vertical)",
                    report.fwhm.horizontal, report.fwhm.vertical
                ));
                Some(report)
            }
            _ => None,
        };

        if self.config.operation == Operation::Calibrate {
            match self.offset {
                Some(offset) => self.log(format!("Calibration offset: {offset}")),
                None => self.log("No calibration offset received.".to_string()),
            }
        }

        SessionOutcome {
            name: self.config.name,
            operation: self.config.operation,
            final_state,
            samples,
            stopped_by_user: self.stopped_by_user,
            had_error: self.had_error,
            device_unresponsive: self.device_unresponsive,
            malformed_records: self.malformed,
            calibration_offset: self.offset,
            photometry,
            errors: self.errors,
        }
    }
}

// src/bridge/mod.rs - Device session actor: flashing and the live terminal
//! One task owns the serial connection. Web handlers and the CLI talk to it
//! through [`BridgeHandle`], so flash traffic and terminal bytes never interleave.

pub mod flasher;
pub mod repl;
pub mod slip;
pub mod state;
pub mod terminal;

use crate::config::{Config, FlashConfig, FlashTuning};
use crate::firmware::TransferError;
use crate::hardware::{self, Connector, Transport, TransportError};
use crate::linker::CompiledProgram;
use futures_core::Stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub use flasher::{CancelToken, FlashProgress, FlashReport, Flasher};
pub use repl::RawRepl;
pub use state::BridgeState;
pub use terminal::{TerminalBuffer, TerminalSnapshot};

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 256;
const READ_CHUNK: usize = 1024;
/// Raw REPL marker for "program finished, ready for the next one".
const RUN_FINISHED: &[u8] = &[repl::CTRL_D, b'>'];

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot go from {from} to {to}")]
    InvalidTransition { from: BridgeState, to: BridgeState },
    #[error("no board connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection lost after {written} bytes of firmware were written: {source}")]
    FlashInterrupted { written: u64, source: TransportError },
    #[error("flash cancelled")]
    Cancelled,
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("device protocol error: {0}")]
    Protocol(String),
    #[error("bridge task has stopped")]
    ActorGone,
}

/// Broadcast to every observer of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Device output, as received (may end mid-line).
    Output { text: String },
    StateChanged { state: BridgeState },
    /// The link dropped outside of a flash.
    Disconnected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    Written { bytes: usize, digest: String },
    /// The board already holds this exact program.
    Unchanged { digest: String },
}

/// Requests handled by the session task.
#[derive(Debug)]
enum BridgeCommand {
    Connect {
        respond_to: oneshot::Sender<Result<(), BridgeError>>,
    },
    Flash {
        image: Vec<u8>,
        expected: u64,
        progress: watch::Sender<FlashProgress>,
        cancel: CancelToken,
        respond_to: oneshot::Sender<Result<FlashReport, BridgeError>>,
    },
    Run {
        program: CompiledProgram,
        respond_to: oneshot::Sender<Result<(), BridgeError>>,
    },
    Save {
        program: CompiledProgram,
        respond_to: oneshot::Sender<Result<SaveOutcome, BridgeError>>,
    },
    Stop {
        respond_to: oneshot::Sender<Result<(), BridgeError>>,
    },
    SendInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), BridgeError>>,
    },
    Clear {
        respond_to: oneshot::Sender<()>,
    },
    Snapshot {
        respond_to: oneshot::Sender<TerminalSnapshot>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
}

/// A flash queued on the session.
pub struct FlashTask {
    pub progress: watch::Receiver<FlashProgress>,
    cancel: CancelToken,
    result: oneshot::Receiver<Result<FlashReport, BridgeError>>,
}

impl FlashTask {
    /// Abort if the flash region has not been erased yet; later it has no effect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<FlashReport, BridgeError> {
        self.result.await.map_err(|_| BridgeError::ActorGone)?
    }
}

/// Cloneable front door to the session task.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<BridgeCommand>,
    state: watch::Receiver<BridgeState>,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeHandle {
    /// Start the session task. Must be called inside a tokio runtime.
    pub fn spawn(connector: Arc<dyn Connector>, config: &Config) -> Self {
        let (commands, inbox) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state) = watch::channel(BridgeState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let session = DeviceSession {
            connector,
            device: config.device.clone(),
            tuning: config.flash.clone(),
            transport: None,
            state: BridgeState::Disconnected,
            state_tx,
            terminal: TerminalBuffer::new(config.terminal.max_lines),
            events: events.clone(),
            run_tail: Vec::new(),
            last_saved: None,
        };
        tokio::spawn(session.run(inbox));
        Self { commands, state, events }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> BridgeCommand) -> Result<T, BridgeError> {
        let (respond_to, response) = oneshot::channel();
        self.commands.send(make(respond_to)).await.map_err(|_| BridgeError::ActorGone)?;
        response.await.map_err(|_| BridgeError::ActorGone)
    }

    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.request(|respond_to| BridgeCommand::Connect { respond_to }).await?
    }

    /// Queue `image` for flashing; `expected` is the release's declared size.
    pub async fn flash(&self, image: Vec<u8>, expected: u64) -> Result<FlashTask, BridgeError> {
        let (progress_tx, progress) = watch::channel(FlashProgress { written: 0, total: image.len() as u64 });
        let cancel = CancelToken::new();
        let (respond_to, result) = oneshot::channel();
        let command = BridgeCommand::Flash {
            image,
            expected,
            progress: progress_tx,
            cancel: cancel.clone(),
            respond_to,
        };
        self.commands.send(command).await.map_err(|_| BridgeError::ActorGone)?;
        Ok(FlashTask { progress, cancel, result })
    }

    /// Upload and start `program`, stopping any program already running.
    pub async fn run(&self, program: CompiledProgram) -> Result<(), BridgeError> {
        self.request(|respond_to| BridgeCommand::Run { program, respond_to }).await?
    }

    /// Store `program` as the board's boot program and reboot into it.
    pub async fn save(&self, program: CompiledProgram) -> Result<SaveOutcome, BridgeError> {
        self.request(|respond_to| BridgeCommand::Save { program, respond_to }).await?
    }

    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.request(|respond_to| BridgeCommand::Stop { respond_to }).await?
    }

    pub async fn send_input(&self, data: impl Into<Vec<u8>>) -> Result<(), BridgeError> {
        let data = data.into();
        self.request(|respond_to| BridgeCommand::SendInput { data, respond_to }).await?
    }

    /// Drop buffered terminal output. The device is not touched.
    pub async fn clear(&self) -> Result<(), BridgeError> {
        self.request(|respond_to| BridgeCommand::Clear { respond_to }).await
    }

    pub async fn snapshot(&self) -> Result<TerminalSnapshot, BridgeError> {
        self.request(|respond_to| BridgeCommand::Snapshot { respond_to }).await
    }

    /// Close the link. Safe in any state.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.request(|respond_to| BridgeCommand::Disconnect { respond_to }).await
    }

    pub fn status(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Device output from now on. Ends when the link drops or the session stops.
    pub fn terminal_stream(&self) -> impl Stream<Item = String> + Send + 'static {
        let mut events = self.events.subscribe();
        async_stream::stream! {
            loop {
                match events.recv().await {
                    Ok(BridgeEvent::Output { text }) => yield text,
                    Ok(BridgeEvent::Disconnected { .. }) => break,
                    Ok(BridgeEvent::StateChanged { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Terminal stream fell behind, {} chunks skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// State owned by the session task.
struct DeviceSession {
    connector: Arc<dyn Connector>,
    device: FlashConfig,
    tuning: FlashTuning,
    transport: Option<Box<dyn Transport>>,
    state: BridgeState,
    state_tx: watch::Sender<BridgeState>,
    terminal: TerminalBuffer,
    events: broadcast::Sender<BridgeEvent>,
    /// Last byte seen while running, to catch a finish marker split across reads.
    run_tail: Vec<u8>,
    last_saved: Option<String>,
}

impl DeviceSession {
    async fn run(mut self, mut inbox: mpsc::Receiver<BridgeCommand>) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let relaying = matches!(self.state, BridgeState::Connected | BridgeState::Running);
            let transport = if relaying { self.transport.as_mut() } else { None };
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                read = read_some(transport, &mut buf) => match read {
                    Ok(0) => self.lost("end of stream".to_string()),
                    Ok(n) => self.relay(&buf[..n]),
                    Err(e) => self.lost(e.to_string()),
                },
            }
        }
        self.transport = None;
        tracing::debug!("Bridge task stopped");
    }

    async fn handle(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::Connect { respond_to } => {
                let _ = respond_to.send(self.connect().await);
            }
            BridgeCommand::Flash { image, expected, progress, cancel, respond_to } => {
                let _ = respond_to.send(self.flash(&image, expected, &progress, &cancel).await);
            }
            BridgeCommand::Run { program, respond_to } => {
                let _ = respond_to.send(self.run_program(&program).await);
            }
            BridgeCommand::Save { program, respond_to } => {
                let _ = respond_to.send(self.save(&program).await);
            }
            BridgeCommand::Stop { respond_to } => {
                let _ = respond_to.send(self.stop().await);
            }
            BridgeCommand::SendInput { data, respond_to } => {
                let _ = respond_to.send(self.send_input(&data).await);
            }
            BridgeCommand::Clear { respond_to } => {
                self.terminal.clear();
                let _ = respond_to.send(());
            }
            BridgeCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.terminal.snapshot());
            }
            BridgeCommand::Disconnect { respond_to } => {
                self.disconnect();
                let _ = respond_to.send(());
            }
        }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.tuning.command_timeout_ms)
    }

    fn transition(&mut self, next: BridgeState) -> Result<(), BridgeError> {
        if !self.state.can_transition_to(next) {
            return Err(BridgeError::InvalidTransition { from: self.state, to: next });
        }
        tracing::info!("Bridge {} -> {}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.events.send(BridgeEvent::StateChanged { state: next });
        Ok(())
    }

    /// Record a failed operation: the link is closed and only `disconnect` leaves `Error`.
    fn fail(&mut self, error: &BridgeError) {
        tracing::error!("Bridge operation failed: {}", error);
        self.transport = None;
        if self.transition(BridgeState::Error).is_err() {
            tracing::warn!("Bridge already in {}", self.state);
        }
    }

    fn lost(&mut self, reason: String) {
        tracing::warn!("Lost connection to the board: {}", reason);
        self.transport = None;
        self.last_saved = None;
        self.run_tail.clear();
        let _ = self.events.send(BridgeEvent::Disconnected { reason });
        let _ = self.transition(BridgeState::Disconnected);
    }

    fn relay(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.terminal.push_bytes(bytes);
        let text = String::from_utf8_lossy(bytes).into_owned();
        tracing::trace!("Device -> {:?}", text);
        let _ = self.events.send(BridgeEvent::Output { text });

        if self.state == BridgeState::Running {
            self.run_tail.extend_from_slice(bytes);
            if hardware::contains(&self.run_tail, RUN_FINISHED) {
                tracing::info!("Program finished");
                self.run_tail.clear();
                let _ = self.transition(BridgeState::Connected);
            } else {
                let keep = self.run_tail.len().saturating_sub(RUN_FINISHED.len() - 1);
                self.run_tail.drain(..keep);
            }
        }
    }

    async fn connect(&mut self) -> Result<(), BridgeError> {
        self.transition(BridgeState::Connecting)?;
        match self.connector.open(&self.device).await {
            Ok(transport) => {
                tracing::info!("Connected to {}", transport.name());
                self.transport = Some(transport);
                self.last_saved = None;
                self.transition(BridgeState::Connected)
            }
            Err(e) => {
                let error = BridgeError::from(e);
                self.fail(&error);
                Err(error)
            }
        }
    }

    fn disconnect(&mut self) {
        self.transport = None;
        self.last_saved = None;
        self.run_tail.clear();
        if self.state != BridgeState::Disconnected {
            let _ = self.transition(BridgeState::Disconnected);
        }
    }

    /// Stop a running program so the link is free for another operation.
    async fn quiesce(&mut self) -> Result<(), BridgeError> {
        if self.state != BridgeState::Running {
            return Ok(());
        }
        let timeout = self.command_timeout();
        let result = match self.transport.as_deref_mut() {
            Some(transport) => {
                let mut repl = RawRepl::new(transport, timeout);
                match repl.interrupt().await {
                    Ok(()) => repl.exit().await,
                    Err(e) => Err(e),
                }
            }
            None => Err(BridgeError::NotConnected),
        };
        if let Err(e) = result {
            self.fail(&e);
            return Err(e);
        }
        self.run_tail.clear();
        self.transition(BridgeState::Connected)
    }

    async fn stop(&mut self) -> Result<(), BridgeError> {
        match self.state {
            BridgeState::Running => self.quiesce().await,
            BridgeState::Connected => Ok(()),
            from => Err(BridgeError::InvalidTransition { from, to: BridgeState::Connected }),
        }
    }

    async fn flash(
        &mut self,
        image: &[u8],
        expected: u64,
        progress: &watch::Sender<FlashProgress>,
        cancel: &CancelToken,
    ) -> Result<FlashReport, BridgeError> {
        if !self.state.can_transition_to(BridgeState::Flashing) && self.state != BridgeState::Running {
            return Err(BridgeError::InvalidTransition { from: self.state, to: BridgeState::Flashing });
        }
        self.quiesce().await?;
        self.transition(BridgeState::Flashing)?;

        let result = match self.transport.as_deref_mut() {
            Some(transport) => {
                Flasher::new(transport, &self.device, &self.tuning)
                    .flash(image, expected, progress, cancel)
                    .await
            }
            None => Err(BridgeError::NotConnected),
        };

        match &result {
            Ok(report) => {
                tracing::info!("Flash complete: {} bytes at {:#x}", report.written, report.address);
                self.transition(BridgeState::Connected)?;
            }
            Err(BridgeError::Cancelled) => {
                // The board may already sit in the ROM loader.
                if let Some(transport) = self.transport.as_deref_mut() {
                    if let Err(e) = transport.hard_reset().await {
                        tracing::warn!("Reset after cancelled flash failed: {}", e);
                    }
                }
                self.transition(BridgeState::Connected)?;
            }
            Err(e) => self.fail(e),
        }
        result
    }

    async fn run_program(&mut self, program: &CompiledProgram) -> Result<(), BridgeError> {
        if !self.state.can_transition_to(BridgeState::Running) && self.state != BridgeState::Running {
            return Err(BridgeError::InvalidTransition { from: self.state, to: BridgeState::Running });
        }
        self.quiesce().await?;
        self.transition(BridgeState::Running)?;

        let timeout = self.command_timeout();
        let result = match self.transport.as_deref_mut() {
            Some(transport) => {
                let mut repl = RawRepl::new(transport, timeout);
                match repl.enter().await {
                    Ok(()) => repl.send(program.source().as_bytes()).await,
                    Err(e) => Err(e),
                }
            }
            None => Err(BridgeError::NotConnected),
        };

        match result {
            Ok(leftover) => {
                tracing::info!("Started program ({} bytes, {})", program.len(), program.digest());
                self.run_tail.clear();
                self.relay(&leftover);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn save(&mut self, program: &CompiledProgram) -> Result<SaveOutcome, BridgeError> {
        if !self.state.is_connected() || self.state == BridgeState::Flashing {
            return Err(BridgeError::InvalidTransition { from: self.state, to: BridgeState::Running });
        }
        let digest = program.digest();
        if self.last_saved.as_deref() == Some(digest.as_str()) {
            tracing::info!("Board already holds program {}, skipping upload", digest);
            return Ok(SaveOutcome::Unchanged { digest });
        }
        self.quiesce().await?;
        self.transition(BridgeState::Running)?;

        let timeout = self.command_timeout();
        let result = match self.transport.as_deref_mut() {
            Some(transport) => write_boot_program(transport, timeout, program).await,
            None => Err(BridgeError::NotConnected),
        };

        match result {
            Ok(()) => {
                self.run_tail.clear();
                self.last_saved = Some(digest.clone());
                Ok(SaveOutcome::Written { bytes: program.len(), digest })
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn send_input(&mut self, data: &[u8]) -> Result<(), BridgeError> {
        if !matches!(self.state, BridgeState::Connected | BridgeState::Running) {
            return Err(BridgeError::NotConnected);
        }
        let result = match self.transport.as_deref_mut() {
            Some(transport) => transport.write_all(data).await,
            None => return Err(BridgeError::NotConnected),
        };
        if let Err(e) = result {
            let error = BridgeError::from(e);
            self.lost(error.to_string());
            return Err(error);
        }
        Ok(())
    }
}

async fn read_some(transport: Option<&mut Box<dyn Transport>>, buf: &mut [u8]) -> Result<usize, TransportError> {
    match transport {
        Some(transport) => transport.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Replace `main.py` and soft-reboot so the board runs it from now on.
async fn write_boot_program(
    transport: &mut dyn Transport,
    timeout: Duration,
    program: &CompiledProgram,
) -> Result<(), BridgeError> {
    let mut repl = RawRepl::new(transport, timeout);
    repl.enter().await?;
    repl.write_file(repl::MAIN_FILE, program.source().as_bytes()).await?;
    repl.exit().await?;
    repl.soft_reset().await?;
    tracing::info!("Saved program {} as {}", program.digest(), repl::MAIN_FILE);
    Ok(())
}

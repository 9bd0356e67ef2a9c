//! Transport/session glue: owns the SSH reducer, the framer and the flow
//! controller, pumps bytes between them and a transport binding, and
//! exposes a command/event channel pair to the embedder.

use std::time::Instant;

use bytes::Bytes;
use mana_common::DiagnosticRecord;
use mana_ssh::{ClientSession, Intent, SessionEvent};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::binding::{CloseSummary, Disposer, TransportBinding};
use crate::control::{ControlMessage, CLOSE_CODE_CODEC_MISMATCH};
use crate::flow::{FlowConfig, FlowController, FlowUpdate};
use crate::framer::{FrameEngine, FramerConfig, FramerOutput};
use crate::resume::ResumeStore;
use crate::state::{ConnectionBus, ConnectionStateMachine};
use crate::TransportError;

#[derive(Debug)]
pub enum ConduitCommand {
    /// Forward a user intent to the SSH reducer.
    Intent(Intent),
    /// Page visibility changed (grants pause while hidden).
    SetVisibility { hidden: bool },
    /// Network reachability changed.
    SetOnline { online: bool },
    /// Disconnect and shut the conduit down.
    Close,
}

pub struct ConduitHandles {
    pub command_tx: UnboundedSender<ConduitCommand>,
    /// SSH session events, in emission order.
    pub event_rx: UnboundedReceiver<SessionEvent>,
    /// Connection state machine observers.
    pub bus: ConnectionBus,
    pub task: JoinHandle<Result<(), TransportError>>,
}

pub struct SshConduit<B: TransportBinding> {
    session: ClientSession,
    engine: FrameEngine,
    flow: FlowController,
    machine: ConnectionStateMachine,
    binding: B,
    inbound_rx: UnboundedReceiver<Bytes>,
    close_rx: UnboundedReceiver<CloseSummary>,
    command_rx: UnboundedReceiver<ConduitCommand>,
    event_tx: UnboundedSender<SessionEvent>,
    epoch: Instant,
    _disposers: Vec<Disposer>,
}

impl<B: TransportBinding + Send + 'static> SshConduit<B> {
    pub fn spawn(
        session: ClientSession,
        mut binding: B,
        framer: FramerConfig,
        flow: FlowConfig,
        resume: Box<dyn ResumeStore>,
    ) -> ConduitHandles {
        let (machine, bus) = ConnectionStateMachine::setup();
        let (command_tx, command_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let (close_tx, close_rx) = unbounded_channel();

        let data_disposer = binding.on_data(Box::new(move |bytes| {
            let _ = inbound_tx.send(bytes);
        }));
        let close_disposer = binding.on_close(Box::new(move |summary| {
            let _ = close_tx.send(summary);
        }));

        let conduit = SshConduit {
            session,
            engine: FrameEngine::new(framer, resume),
            flow: FlowController::new(flow),
            machine,
            binding,
            inbound_rx,
            close_rx,
            command_rx,
            event_tx,
            epoch: Instant::now(),
            _disposers: vec![data_disposer, close_disposer],
        };
        let task = tokio::spawn(conduit.run());

        ConduitHandles {
            command_tx,
            event_rx,
            bus,
            task,
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn run(mut self) -> Result<(), TransportError> {
        let result = self.run_inner().await;
        if let Err(error) = &result {
            error!(%error, "conduit terminated");
            self.machine
                .diagnostic(DiagnosticRecord::error("transport", error.to_string()))
                .await;
        }
        self.machine.close().await;
        self.session.close(Some("transport closed"));
        self.forward_session_events().await;
        result
    }

    async fn run_inner(&mut self) -> Result<(), TransportError> {
        self.machine.socket_opened().await;
        let now = self.now();
        let outputs = self.engine.start(now)?;
        if self.apply_outputs(outputs).await? {
            return Ok(());
        }
        self.machine.hello_sent().await;
        self.drain_session().await?;

        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_bytes = self.inbound_rx.recv() => {
                    match maybe_bytes {
                        Some(bytes) => {
                            let now = self.now();
                            let outputs = self.engine.on_bytes(&bytes, now)?;
                            if self.apply_outputs(outputs).await? {
                                break;
                            }
                        }
                        None => {
                            self.machine.socket_closed(true).await;
                            break;
                        }
                    }
                }
                Some(command) = self.command_rx.recv() => {
                    if self.handle_command(command).await? {
                        break;
                    }
                }
                Some(summary) = self.close_rx.recv() => {
                    info!(?summary, "transport closed by peer");
                    self.machine.socket_closed(true).await;
                    break;
                }
                _ = ticker.tick() => {
                    let now = self.now();
                    let update = self.flow.note_buffered(self.binding.buffered_bytes(), now);
                    self.apply_flow_update(update).await?;
                    let outputs = self.engine.tick(now)?;
                    if self.apply_outputs(outputs).await? {
                        break;
                    }
                }
            }
            self.drain_session().await?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: ConduitCommand) -> Result<bool, TransportError> {
        let now = self.now();
        match command {
            ConduitCommand::Intent(intent) => {
                if let Err(error) = self.session.command(intent) {
                    debug!(%error, "intent rejected");
                    self.machine
                        .diagnostic(DiagnosticRecord::warning("intent", error.to_string()))
                        .await;
                }
                Ok(false)
            }
            ConduitCommand::SetVisibility { hidden } => {
                let update = self.flow.set_visibility_hidden(hidden, now);
                self.apply_flow_update(update).await?;
                Ok(false)
            }
            ConduitCommand::SetOnline { online } => {
                let update = self.flow.set_offline(!online, now);
                self.apply_flow_update(update).await?;
                Ok(false)
            }
            ConduitCommand::Close => {
                let _ = self.session.command(Intent::Disconnect { reason: None });
                self.drain_session().await?;
                Ok(true)
            }
        }
    }

    /// Forward session events to the embedder, account inbound channel
    /// data with the flow controller, and ship queued packets.
    async fn drain_session(&mut self) -> Result<(), TransportError> {
        let now = self.now();
        while let Some(event) = self.session.next_event() {
            match &event {
                SessionEvent::OutboundData { payload, .. } => {
                    self.send_ssh(payload.clone()).await?;
                }
                SessionEvent::ChannelData { id, data } => {
                    if let Some(grant) = self.flow.on_inbound_data(id.0, data.len(), now) {
                        let output = self.engine.send_control(&ControlMessage::Flow(grant))?;
                        self.apply_output(output).await?;
                    }
                }
                _ => {}
            }
            let _ = self.event_tx.send(event);
        }
        for packet in self.session.flush_outbound() {
            self.send_ssh(packet).await?;
        }
        Ok(())
    }

    async fn forward_session_events(&mut self) {
        while let Some(event) = self.session.next_event() {
            let _ = self.event_tx.send(event);
        }
    }

    async fn send_ssh(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let outputs = self.engine.send_ssh(payload)?;
        self.apply_outputs(outputs).await?;
        Ok(())
    }

    async fn apply_flow_update(&mut self, update: FlowUpdate) -> Result<(), TransportError> {
        for record in update.diagnostics {
            self.machine.policy(record).await;
        }
        for grant in update.grants {
            let output = self.engine.send_control(&ControlMessage::Flow(grant))?;
            self.apply_output(output).await?;
        }
        Ok(())
    }

    async fn apply_outputs(&mut self, outputs: Vec<FramerOutput>) -> Result<bool, TransportError> {
        for output in outputs {
            if self.apply_output(output).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns `true` when the connection should come down.
    async fn apply_output(&mut self, output: FramerOutput) -> Result<bool, TransportError> {
        match output {
            FramerOutput::Send(bytes) => {
                self.binding.send(bytes)?;
                Ok(false)
            }
            FramerOutput::SshData(bytes) => {
                if let Err(error) = self.session.receive(&bytes) {
                    // The reducer has already failed itself and emitted
                    // its terminal events; surface the cause.
                    self.machine
                        .diagnostic(DiagnosticRecord::error("ssh", error.to_string()))
                        .await;
                }
                Ok(false)
            }
            FramerOutput::HelloReceived(hello) => {
                self.machine
                    .hello_received(hello.session, hello.capabilities)
                    .await;
                Ok(false)
            }
            FramerOutput::FlowGranted(grant) => {
                self.machine
                    .policy(DiagnosticRecord::info(
                        "flow",
                        format!("peer granted {} bytes on channel {}", grant.credit, grant.id),
                    ))
                    .await;
                Ok(false)
            }
            FramerOutput::Reconnect => {
                self.machine.heartbeats_lost().await;
                Ok(true)
            }
            FramerOutput::Closed { code, reason } => {
                self.machine
                    .diagnostic(DiagnosticRecord::warning(
                        "close-hint",
                        format!("peer closed: {code} {reason}"),
                    ))
                    .await;
                self.machine.socket_closed(false).await;
                // Any CLOSE_HINT to the peer was sent by an earlier
                // output of the same batch.
                if code == CLOSE_CODE_CODEC_MISMATCH {
                    return Err(TransportError::CodecMismatch(reason));
                }
                Ok(true)
            }
            FramerOutput::Diagnostic(record) => {
                self.machine.diagnostic(record).await;
                Ok(false)
            }
        }
    }
}

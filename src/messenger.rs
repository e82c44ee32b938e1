//! Demultiplexes inbound frames to per-channel inboxes and serializes all
//! outbound traffic through one writer queue.

use crate::cryptor::Cryptor;
use crate::frame::{self, FrameReassembler, LinkFrame};
use crate::transport::Transport;
use crate::{ChannelId, FrameRxError, LinkError, CONTROL_CHANNEL};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};

/// The inbound side of one channel, a queue of complete messages plus at
/// most one waiting receiver.
#[derive(Default)]
struct Inbox {
    /// Messages received before anyone asked for them
    queue: VecDeque<LinkFrame>,
    /// The receiver armed for the next message, at most one per channel
    waiter: Option<oneshot::Sender<LinkFrame>>,
}

/// An outbound message queued for the writer together with its completion
type Outbound = (LinkFrame, oneshot::Sender<Result<(), LinkError>>);

/// Resolves once the queued message has been written to the transport.
pub struct SendPromise(oneshot::Receiver<Result<(), LinkError>>);

impl SendPromise {
    /// Wait for the send to complete
    pub async fn wait(self) -> Result<(), LinkError> {
        self.0.await.unwrap_or(Err(LinkError::Aborted))
    }
}

/// Moves messages between the transport and the channels of one session.
pub struct Messenger {
    /// The transport the session runs over
    transport: Arc<dyn Transport>,
    /// The record layer shared by the pump and the writer
    cryptor: std::sync::Mutex<Cryptor>,
    /// The per-channel inboxes
    inboxes: std::sync::Mutex<HashMap<ChannelId, Inbox>>,
    /// The queue feeding the writer task, dropped on stop
    tx_queue: std::sync::Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    /// The receiving end of the writer queue, taken by the writer task
    tx_source: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    /// Set once the handshake has completed and the encryption gate opens
    auth_complete: AtomicBool,
}

impl Messenger {
    /// Construct a new self over the given transport and record layer
    pub fn new(transport: Arc<dyn Transport>, cryptor: Cryptor) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            transport,
            cryptor: std::sync::Mutex::new(cryptor),
            inboxes: std::sync::Mutex::new(HashMap::new()),
            tx_queue: std::sync::Mutex::new(Some(tx)),
            tx_source: std::sync::Mutex::new(Some(rx)),
            auth_complete: AtomicBool::new(false),
        }
    }

    /// Mark the handshake complete, opening the encryption gate
    pub fn set_auth_complete(&self) {
        self.auth_complete.store(true, Ordering::SeqCst);
    }

    /// Has the handshake completed?
    pub fn auth_complete(&self) -> bool {
        self.auth_complete.load(Ordering::SeqCst)
    }

    /// Drive the handshake one step with an optional blob from the peer
    pub fn handshake_step(&self, data: Option<&[u8]>) -> Result<Option<Vec<u8>>, LinkError> {
        let mut cryptor = self.cryptor.lock().unwrap();
        Ok(cryptor.handshake_step(data)?)
    }

    /// Is the handshake still in progress?
    pub fn is_handshaking(&self) -> bool {
        self.cryptor.lock().unwrap().is_handshaking()
    }

    /// Arm the one-shot receive for a channel. Arming a second receive while
    /// one is outstanding is a programming error and surfaces as
    /// [LinkError::ProtocolViolation].
    pub async fn receive(&self, channel: ChannelId) -> Result<LinkFrame, LinkError> {
        let rx = {
            let mut inboxes = self.inboxes.lock().unwrap();
            let inbox = inboxes.entry(channel).or_default();
            if let Some(msg) = inbox.queue.pop_front() {
                return Ok(msg);
            }
            if inbox.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
                return Err(LinkError::ProtocolViolation(format!(
                    "channel {} already has a receive armed",
                    channel
                )));
            }
            let (tx, rx) = oneshot::channel();
            inbox.waiter = Some(tx);
            rx
        };
        rx.await.map_err(|_| LinkError::Aborted)
    }

    /// Queue a message for transmission. The returned promise resolves after
    /// the bytes reach the transport, which gates ordering-sensitive
    /// follow-ups. The encryption gate is enforced here.
    pub fn send(&self, frame: LinkFrame) -> Result<SendPromise, LinkError> {
        let encrypted = frame.header.frame.get_encryption();
        let auth = self.auth_complete();
        if encrypted && !auth {
            return Err(LinkError::ProtocolViolation(
                "encrypted message before authentication completed".to_string(),
            ));
        }
        if !encrypted && auth && frame.header.channel_id != CONTROL_CHANNEL {
            return Err(LinkError::ProtocolViolation(
                "plaintext service message after authentication".to_string(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        let queue = self.tx_queue.lock().unwrap();
        queue
            .as_ref()
            .ok_or(LinkError::Aborted)?
            .send((frame, tx))
            .map_err(|_| LinkError::Aborted)?;
        Ok(SendPromise(rx))
    }

    /// The writer task body. Drains the queue in order, fragmenting and
    /// encrypting each message, and resolves its promise. Returns when the
    /// messenger is stopped or the transport fails.
    pub async fn run_writer(&self) -> Result<(), LinkError> {
        let mut source = {
            let mut s = self.tx_source.lock().unwrap();
            s.take().ok_or(LinkError::ProtocolViolation(
                "writer started twice".to_string(),
            ))?
        };
        while let Some((frame, promise)) = source.recv().await {
            let r = self.write_one(frame).await;
            let failed = r.is_err();
            let _ = promise.send(r);
            if failed {
                break;
            }
        }
        // anything still queued resolves aborted
        source.close();
        while let Ok((_, promise)) = source.try_recv() {
            let _ = promise.send(Err(LinkError::Aborted));
        }
        Ok(())
    }

    /// Fragment, encrypt and write one message
    async fn write_one(&self, frame: LinkFrame) -> Result<(), LinkError> {
        let encrypted = frame.header.frame.get_encryption();
        for fragment in frame.fragment() {
            let wire = if encrypted {
                let payload = {
                    let mut cryptor = self.cryptor.lock().unwrap();
                    cryptor.encrypt(&fragment.data)?
                };
                fragment.encode(&payload)
            } else {
                fragment.encode(&fragment.data)
            };
            self.transport.write(&wire).await.map_err(LinkError::Tx)?;
        }
        Ok(())
    }

    /// The pump task body. Reads frames, decrypts, reassembles per channel
    /// and delivers complete messages to the inboxes. Returns the error that
    /// ended the session.
    pub async fn run_pump(&self) -> LinkError {
        let mut reassembly: HashMap<ChannelId, FrameReassembler> = HashMap::new();
        loop {
            match self.pump_one(&mut reassembly).await {
                Ok(()) => {}
                Err(e) => {
                    self.drop_waiters();
                    return e;
                }
            }
        }
    }

    /// Read and deliver a single frame
    async fn pump_one(
        &self,
        reassembly: &mut HashMap<ChannelId, FrameReassembler>,
    ) -> Result<(), LinkError> {
        let wire = frame::read_frame(self.transport.as_ref())
            .await
            .map_err(LinkError::Rx)?;
        let encrypted = wire.header.frame.get_encryption();
        let auth = self.auth_complete();
        if encrypted && !auth {
            return Err(LinkError::ProtocolViolation(
                "encrypted frame before authentication completed".to_string(),
            ));
        }
        if !auth && wire.header.channel_id != CONTROL_CHANNEL {
            return Err(LinkError::ProtocolViolation(format!(
                "frame for channel {} before authentication completed",
                wire.header.channel_id
            )));
        }
        let data = if encrypted {
            let mut cryptor = self.cryptor.lock().unwrap();
            cryptor.decrypt(&wire.payload)?
        } else {
            wire.payload
        };
        if data.is_empty() {
            // a record that carried only tls bookkeeping
            return Ok(());
        }
        let r = reassembly.entry(wire.header.channel_id).or_default();
        let complete = r
            .push(wire.header.frame.get_frame_type(), wire.total, data)
            .map_err(LinkError::Rx)?;
        if let Some(data) = complete {
            if data.len() < 2 {
                return Err(LinkError::Rx(FrameRxError::ProtocolViolation(
                    "message too short for a message id".to_string(),
                )));
            }
            self.deliver(LinkFrame {
                header: wire.header,
                data,
            });
        }
        Ok(())
    }

    /// Hand a complete message to its channel
    fn deliver(&self, msg: LinkFrame) {
        let mut inboxes = self.inboxes.lock().unwrap();
        let inbox = inboxes.entry(msg.header.channel_id).or_default();
        if let Some(waiter) = inbox.waiter.take() {
            if let Err(msg) = waiter.send(msg) {
                inbox.queue.push_back(msg);
            }
        } else {
            inbox.queue.push_back(msg);
        }
    }

    /// Resolve all armed receives with an abort
    fn drop_waiters(&self) {
        let mut inboxes = self.inboxes.lock().unwrap();
        for inbox in inboxes.values_mut() {
            inbox.waiter = None;
        }
    }

    /// Stop the messenger. Armed receives resolve aborted, new sends are
    /// refused and the writer task drains out.
    pub fn stop(&self) {
        self.drop_waiters();
        let mut q = self.tx_queue.lock().unwrap();
        *q = None;
        drop(q);
        let mut s = self.tx_source.lock().unwrap();
        if let Some(mut source) = s.take() {
            source.close();
            while let Ok((_, promise)) = source.try_recv() {
                let _ = promise.send(Err(LinkError::Aborted));
            }
        }
    }
}

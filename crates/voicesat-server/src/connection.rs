//! Per-connection handling.
//!
//! [`ProtocolGate`] decides what each inbound frame means for a connection
//! in its current handshake state. [`serve_connection`] drives the socket:
//! it answers what the gate answers, forwards the rest to the satellite
//! and writes whatever the satellite queues for this peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use voicesat_protocol::{
    ConnectResponse, DisconnectRequest, DisconnectResponse, Frame, FrameCodec, Message,
    PingRequest, PingResponse, ProtocolError,
};

use crate::device::DeviceIdentity;
use crate::error::{ServerError, ServerResult};
use crate::satellite::{ConnectionId, SatelliteHandle};
use crate::signals::ShutdownHandle;

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    AwaitingHello,
    AwaitingAuth,
    Authenticated,
    Closed,
}

/// Why the gate closed a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer asked to disconnect, or acknowledged our request.
    PeerDisconnect,
    /// Wrong password in the connect request.
    BadPassword,
    /// A message arrived out of handshake order.
    Handshake {
        expected: &'static str,
        got: &'static str,
    },
    /// A payload failed to decode before the peer was authenticated.
    Malformed(String),
}

/// What to do with one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Answer the peer directly.
    Reply(Vec<Message>),
    /// Answer the peer; it is now authenticated.
    Authenticated(Vec<Message>),
    /// Hand the message to the satellite.
    Forward(Message),
    /// Send `reply`, then close.
    Close {
        reply: Vec<Message>,
        reason: CloseReason,
    },
    /// Nothing to do.
    Ignore,
}

/// Connection handshake and routing rules.
#[derive(Debug)]
pub struct ProtocolGate {
    state: GateState,
    identity: Arc<DeviceIdentity>,
    password: Option<String>,
}

impl ProtocolGate {
    pub fn new(identity: Arc<DeviceIdentity>, password: Option<String>) -> Self {
        Self {
            state: GateState::AwaitingHello,
            identity,
            password,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == GateState::Authenticated
    }

    /// Decodes and routes one frame.
    ///
    /// A payload that fails to decode closes the connection during the
    /// handshake and is skipped afterwards.
    pub fn on_frame(&mut self, frame: Frame) -> GateDecision {
        match Message::decode(frame) {
            Ok(message) => self.on_message(message),
            Err(e) if self.is_authenticated() && !e.is_fatal() => {
                warn!(error = %e, "Skipping undecodable message");
                GateDecision::Ignore
            }
            Err(e) => self.close(Vec::new(), CloseReason::Malformed(e.to_string())),
        }
    }

    /// Routes one decoded message.
    pub fn on_message(&mut self, message: Message) -> GateDecision {
        match (self.state, message) {
            (GateState::Closed, _) => GateDecision::Ignore,

            (_, Message::DisconnectRequest(_)) => {
                info!("Peer requested disconnect");
                self.close(
                    vec![DisconnectResponse {}.into()],
                    CloseReason::PeerDisconnect,
                )
            }
            (_, Message::DisconnectResponse(_)) => {
                self.close(Vec::new(), CloseReason::PeerDisconnect)
            }
            (_, Message::Unknown { type_id, .. }) => {
                debug!(type_id, "Ignoring unknown message type");
                GateDecision::Ignore
            }

            (GateState::AwaitingHello, Message::HelloRequest(hello)) => {
                info!(
                    client = %hello.client_info,
                    api = %format!("{}.{}", hello.api_version_major, hello.api_version_minor),
                    "Hello"
                );
                self.state = GateState::AwaitingAuth;
                GateDecision::Reply(vec![self.identity.hello_response().into()])
            }
            (GateState::AwaitingHello, other) => self.close(
                Vec::new(),
                CloseReason::Handshake {
                    expected: "HelloRequest",
                    got: other.name(),
                },
            ),

            (GateState::AwaitingAuth, Message::ConnectRequest(connect)) => {
                let accepted = self
                    .password
                    .as_deref()
                    .is_none_or(|expected| expected == connect.password);
                if accepted {
                    self.state = GateState::Authenticated;
                    GateDecision::Authenticated(vec![
                        ConnectResponse {
                            invalid_password: false,
                        }
                        .into(),
                    ])
                } else {
                    self.close(
                        vec![
                            ConnectResponse {
                                invalid_password: true,
                            }
                            .into(),
                        ],
                        CloseReason::BadPassword,
                    )
                }
            }

            (_, Message::PingRequest(_)) => GateDecision::Reply(vec![PingResponse {}.into()]),
            (_, Message::PingResponse(_)) => GateDecision::Ignore,
            (_, Message::DeviceInfoRequest(_)) => {
                GateDecision::Reply(vec![self.identity.device_info().into()])
            }

            (GateState::AwaitingAuth, other) => self.close(
                Vec::new(),
                CloseReason::Handshake {
                    expected: "ConnectRequest",
                    got: other.name(),
                },
            ),

            (GateState::Authenticated, Message::HelloRequest(_) | Message::ConnectRequest(_)) => {
                debug!("Ignoring repeated handshake message");
                GateDecision::Ignore
            }
            (GateState::Authenticated, message) => GateDecision::Forward(message),
        }
    }

    fn close(&mut self, reply: Vec<Message>, reason: CloseReason) -> GateDecision {
        self.state = GateState::Closed;
        GateDecision::Close { reply, reason }
    }
}

/// Everything a connection task needs besides its socket.
#[derive(Clone)]
pub struct ConnectionContext {
    pub identity: Arc<DeviceIdentity>,
    pub password: Option<String>,
    pub ping_interval: Duration,
    pub keepalive_timeout: Duration,
    pub outbound_capacity: usize,
    pub satellite: SatelliteHandle,
    pub shutdown: ShutdownHandle,
}

type Transport = Framed<TcpStream, FrameCodec>;

/// Serves one peer until it leaves, misbehaves or the server shuts down.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    ctx: ConnectionContext,
) -> ServerResult<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let mut transport = Framed::new(stream, FrameCodec::new());
    let mut attached = false;

    let result = run(&mut transport, peer, id, &ctx, &mut attached).await;
    if attached {
        ctx.satellite.detach(id).await;
    }

    match &result {
        Ok(()) => info!("Connection closed"),
        Err(e) if e.is_disconnect() => info!(reason = %e, "Connection closed"),
        Err(e) => warn!(error = %e, "Connection closed with error"),
    }
    result
}

async fn run(
    transport: &mut Transport,
    peer: SocketAddr,
    id: ConnectionId,
    ctx: &ConnectionContext,
    attached: &mut bool,
) -> ServerResult<()> {
    let mut gate = ProtocolGate::new(ctx.identity.clone(), ctx.password.clone());
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(ctx.outbound_capacity.max(1));

    let mut last_seen = Instant::now();
    let mut keepalive = tokio::time::interval_at(Instant::now() + ctx.ping_interval, ctx.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = ctx.shutdown.wait().wait();
    tokio::pin!(shutdown);

    info!("Connection accepted");
    loop {
        tokio::select! {
            frame = transport.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        debug!("Peer closed the stream");
                        return Ok(());
                    }
                };
                last_seen = Instant::now();

                match gate.on_frame(frame) {
                    GateDecision::Reply(replies) => send_all(transport, replies).await?,
                    GateDecision::Authenticated(replies) => {
                        send_all(transport, replies).await?;
                        info!("Peer authenticated");
                        ctx.satellite.attach(id, outbound_tx.clone()).await?;
                        *attached = true;
                    }
                    GateDecision::Forward(message) => {
                        ctx.satellite.inbound(id, message).await?;
                    }
                    GateDecision::Close { reply, reason } => {
                        send_all(transport, reply).await?;
                        return close_result(reason, peer);
                    }
                    GateDecision::Ignore => {}
                }
            }

            Some(message) = outbound_rx.recv() => {
                transport.send(message.to_frame()).await?;
            }

            _ = keepalive.tick() => {
                if last_seen.elapsed() >= ctx.keepalive_timeout {
                    return Err(ServerError::KeepaliveTimeout {
                        seconds: ctx.keepalive_timeout.as_secs(),
                    });
                }
                if gate.is_authenticated() {
                    transport.send(Message::from(PingRequest {}).to_frame()).await?;
                }
            }

            _ = &mut shutdown => {
                if gate.is_authenticated() {
                    transport.send(Message::from(DisconnectRequest {}).to_frame()).await?;
                }
                return Err(ServerError::Shutdown);
            }
        }
    }
}

async fn send_all(transport: &mut Transport, messages: Vec<Message>) -> Result<(), ProtocolError> {
    for message in messages {
        transport.feed(message.to_frame()).await?;
    }
    transport.flush().await
}

fn close_result(reason: CloseReason, peer: SocketAddr) -> ServerResult<()> {
    match reason {
        CloseReason::PeerDisconnect => Ok(()),
        CloseReason::BadPassword => Err(ServerError::auth(peer.to_string())),
        CloseReason::Handshake { expected, got } => Err(ServerError::handshake(expected, got)),
        CloseReason::Malformed(message) => Err(ServerError::Malformed(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use voicesat_protocol::{
        ConnectRequest, DeviceInfoRequest, HelloRequest, HelloResponse, ListEntitiesRequest,
        SubscribeVoiceAssistantRequest,
    };

    use crate::config::ServerConfig;

    fn gate(password: Option<&str>) -> ProtocolGate {
        let mut config = ServerConfig::default().with_name("Kitchen");
        if let Some(password) = password {
            config = config.with_password(password);
        }
        let identity = DeviceIdentity::new(&config, "aa:bb:cc:dd:ee:ff".to_string());
        ProtocolGate::new(Arc::new(identity), password.map(str::to_string))
    }

    fn hello() -> Message {
        HelloRequest {
            client_info: "hub".to_string(),
            api_version_major: 1,
            api_version_minor: 10,
        }
        .into()
    }

    fn connect(password: &str) -> Message {
        ConnectRequest {
            password: password.to_string(),
        }
        .into()
    }

    #[test]
    fn handshake_without_password() {
        let mut gate = gate(None);
        match gate.on_message(hello()) {
            GateDecision::Reply(replies) => {
                assert!(matches!(
                    &replies[..],
                    [Message::HelloResponse(HelloResponse { name, api_version_major: 1, .. })]
                        if name == "kitchen-ddeeff"
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(gate.state(), GateState::AwaitingAuth);

        let decision = gate.on_message(connect("anything"));
        assert_eq!(
            decision,
            GateDecision::Authenticated(vec![
                ConnectResponse {
                    invalid_password: false
                }
                .into()
            ])
        );
        assert!(gate.is_authenticated());
    }

    #[test]
    fn wrong_password_closes() {
        let mut gate = gate(Some("secret"));
        gate.on_message(hello());
        let decision = gate.on_message(connect("nope"));
        assert_eq!(
            decision,
            GateDecision::Close {
                reply: vec![
                    ConnectResponse {
                        invalid_password: true
                    }
                    .into()
                ],
                reason: CloseReason::BadPassword,
            }
        );
        assert_eq!(gate.state(), GateState::Closed);
        assert_eq!(gate.on_message(hello()), GateDecision::Ignore);
    }

    #[test]
    fn right_password_authenticates() {
        let mut gate = gate(Some("secret"));
        gate.on_message(hello());
        assert!(matches!(
            gate.on_message(connect("secret")),
            GateDecision::Authenticated(_)
        ));
    }

    #[test]
    fn message_before_hello_closes() {
        let mut gate = gate(None);
        let decision = gate.on_message(ListEntitiesRequest {}.into());
        assert_eq!(
            decision,
            GateDecision::Close {
                reply: Vec::new(),
                reason: CloseReason::Handshake {
                    expected: "HelloRequest",
                    got: "ListEntitiesRequest",
                },
            }
        );
    }

    #[test]
    fn unknown_messages_are_ignored_in_every_state() {
        let unknown = || Message::Unknown {
            type_id: 9999,
            payload: Bytes::from_static(b"\x01"),
        };
        let mut gate = gate(None);
        assert_eq!(gate.on_message(unknown()), GateDecision::Ignore);
        gate.on_message(hello());
        assert_eq!(gate.on_message(unknown()), GateDecision::Ignore);
        gate.on_message(connect(""));
        assert_eq!(gate.on_message(unknown()), GateDecision::Ignore);
        assert!(gate.is_authenticated());
    }

    #[test]
    fn ping_and_device_info_before_connect() {
        let mut gate = gate(None);
        gate.on_message(hello());
        assert_eq!(
            gate.on_message(PingRequest {}.into()),
            GateDecision::Reply(vec![PingResponse {}.into()])
        );
        assert!(matches!(
            gate.on_message(DeviceInfoRequest {}.into()),
            GateDecision::Reply(replies) if matches!(&replies[..], [Message::DeviceInfoResponse(_)])
        ));
        assert_eq!(gate.state(), GateState::AwaitingAuth);
    }

    #[test]
    fn authenticated_messages_are_forwarded() {
        let mut gate = gate(None);
        gate.on_message(hello());
        gate.on_message(connect(""));

        let subscribe: Message = SubscribeVoiceAssistantRequest {
            subscribe: true,
            flags: 3,
        }
        .into();
        assert_eq!(
            gate.on_message(subscribe.clone()),
            GateDecision::Forward(subscribe)
        );
        assert_eq!(gate.on_message(PingResponse {}.into()), GateDecision::Ignore);
    }

    #[test]
    fn disconnect_is_acknowledged() {
        let mut gate = gate(None);
        gate.on_message(hello());
        gate.on_message(connect(""));
        assert_eq!(
            gate.on_message(DisconnectRequest {}.into()),
            GateDecision::Close {
                reply: vec![DisconnectResponse {}.into()],
                reason: CloseReason::PeerDisconnect,
            }
        );
    }

    #[test]
    fn malformed_payload_depends_on_state() {
        // Type 1 (hello) with a truncated varint field.
        let broken = || Frame::new(1, Bytes::from_static(&[0x10]));

        let mut fresh = gate(None);
        assert!(matches!(
            fresh.on_frame(broken()),
            GateDecision::Close {
                reason: CloseReason::Malformed(_),
                ..
            }
        ));

        let mut ready = gate(None);
        ready.on_message(hello());
        ready.on_message(connect(""));
        assert_eq!(ready.on_frame(broken()), GateDecision::Ignore);
        assert!(ready.is_authenticated());
    }
}

//! Unix-socket transport to distributors: one framed connection per distributor,
//! reconnecting while the daemon runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use upc_core::{InboundMessage, OutboundMessage, Transport};

use crate::config::DistributorConfig;
use crate::service::Service;
use crate::wire::{self, FrameDecodeError, LEN_SIZE};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 8192;

/// Routes engine sends to the writer task of the matching connection.
#[derive(Default)]
pub struct SocketTransport {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<OutboundMessage>>>,
}

impl SocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, peer_id: &str, tx: mpsc::UnboundedSender<OutboundMessage>) {
        self.senders.lock().insert(peer_id.to_string(), tx);
    }

    fn detach(&self, peer_id: &str) {
        self.senders.lock().remove(peer_id);
    }
}

impl Transport for SocketTransport {
    fn send(&self, peer_id: &str, message: OutboundMessage) {
        let senders = self.senders.lock();
        match senders.get(peer_id) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    log::warn!("connection to {} closing, message dropped", peer_id);
                }
            }
            None => log::warn!("{} to {} dropped: not connected", message.kind(), peer_id),
        }
    }
}

/// What to do each time the connection comes up.
#[derive(Debug, Clone)]
pub struct AutoRegister {
    pub instance: String,
    pub vapid: Option<String>,
    pub features: Vec<String>,
}

/// Live connection: unroutes the peer and stops its writer when dropped, including
/// when the connection task is aborted.
struct Attached<'a> {
    transport: &'a SocketTransport,
    peer_id: &'a str,
    writer: JoinHandle<()>,
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.transport.detach(self.peer_id);
        self.writer.abort();
    }
}

/// Keep a connection to `distributor` open. On every connect the peer is (re)bound and
/// the configured instance registered, then inbound frames are fed to the engine.
pub async fn run_connection(
    distributor: DistributorConfig,
    transport: Arc<SocketTransport>,
    service: Arc<Service>,
    auto: AutoRegister,
) {
    loop {
        match UnixStream::connect(&distributor.socket).await {
            Ok(stream) => {
                log::info!("connected to {} at {}", distributor.id, distributor.socket.display());
                let (reader, writer) = stream.into_split();
                let (tx, rx) = mpsc::unbounded_channel();
                transport.attach(&distributor.id, tx);
                let _attached = Attached {
                    transport: &transport,
                    peer_id: &distributor.id,
                    writer: tokio::spawn(write_frames(writer, rx)),
                };

                let id = distributor.id.clone();
                let protocol = distributor.protocol;
                service.run(move |c| c.bind_peer(&id, protocol)).await;
                if let Err(e) = service
                    .register(
                        auto.instance.clone(),
                        None,
                        auto.vapid.clone(),
                        auto.features.clone(),
                    )
                    .await
                {
                    log::error!("register {} failed: {}", auto.instance, e);
                }

                if let Err(e) = read_frames(reader, &distributor.id, &service).await {
                    log::warn!("connection to {} lost: {}", distributor.id, e);
                }
            }
            Err(e) => log::debug!("cannot reach {}: {}", distributor.id, e),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<OutboundMessage>) {
    while let Some(msg) = rx.recv().await {
        let frame = match wire::encode_frame(&msg) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("cannot encode {}: {}", msg.kind(), e);
                continue;
            }
        };
        if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    peer_id: &str,
    service: &Service,
) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        loop {
            match wire::decode_frame::<InboundMessage>(&buf) {
                Ok((msg, used)) => {
                    buf.drain(..used);
                    log::debug!("{} from {}", msg.kind(), peer_id);
                    let from = peer_id.to_string();
                    service.run(move |c| c.handle(&from, msg)).await;
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(FrameDecodeError::Decode(e)) => {
                    // The whole frame is buffered; skip it.
                    let len = wire::frame_len([buf[0], buf[1], buf[2], buf[3]])?;
                    buf.drain(..LEN_SIZE + len);
                    log::warn!("undecodable frame from {}: {}", peer_id, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("closed by peer");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;
    use upc_core::{
        Connector, ConnectorConfig, DefaultKeyManager, PeerProtocol, PushEvent, Store,
    };

    async fn read_outbound(stream: &mut UnixStream) -> OutboundMessage {
        let mut header = [0u8; LEN_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let mut payload = vec![0u8; wire::frame_len(header).unwrap()];
        stream.read_exact(&mut payload).await.unwrap();
        bincode::deserialize(&payload).unwrap()
    }

    async fn write_inbound(stream: &mut UnixStream, msg: &InboundMessage) {
        stream
            .write_all(&wire::encode_frame(msg).unwrap())
            .await
            .unwrap();
    }

    #[test]
    fn send_without_connection_is_dropped() {
        let t = SocketTransport::new();
        t.send("nobody", OutboundMessage::Link { link_token: "x".into() });
        assert!(t.senders.lock().is_empty());
    }

    #[tokio::test]
    async fn handshake_register_and_ack_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("dist.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let store = Arc::new(Store::in_memory());
        let keys = Arc::new(DefaultKeyManager::plain(Arc::clone(&store)));
        let connector = Arc::new(Connector::new(store, keys, ConnectorConfig::default()));
        let transport = Arc::new(SocketTransport::new());
        let (service, mut events) = Service::new(connector, transport.clone());

        tokio::spawn(run_connection(
            DistributorConfig {
                id: "dist".into(),
                socket: socket.clone(),
                protocol: PeerProtocol::Handshake,
                features: Vec::new(),
            },
            transport.clone(),
            Arc::new(service),
            AutoRegister {
                instance: "default".into(),
                vapid: None,
                features: Vec::new(),
            },
        ));

        let exchange = async {
            let (mut peer, _) = listener.accept().await.unwrap();
            let link_token = match read_outbound(&mut peer).await {
                OutboundMessage::Link { link_token } => link_token,
                other => panic!("expected LINK, got {:?}", other),
            };
            write_inbound(
                &mut peer,
                &InboundMessage::Linked {
                    link_token,
                    auth_token: "auth".into(),
                },
            )
            .await;
            let token = match read_outbound(&mut peer).await {
                OutboundMessage::Register {
                    token, auth_token, ..
                } => {
                    assert_eq!(auth_token.as_deref(), Some("auth"));
                    token
                }
                other => panic!("expected REGISTER, got {:?}", other),
            };
            write_inbound(
                &mut peer,
                &InboundMessage::NewEndpoint {
                    token: token.clone(),
                    endpoint: "https://push/abc".into(),
                    message_id: Some("m1".into()),
                },
            )
            .await;
            assert_eq!(
                read_outbound(&mut peer).await,
                OutboundMessage::MessageAck {
                    token,
                    message_id: "m1".into()
                }
            );
            match events.recv().await {
                Some(PushEvent::NewEndpoint { instance, endpoint }) => {
                    assert_eq!(instance, "default");
                    assert_eq!(endpoint.url, "https://push/abc");
                }
                other => panic!("expected endpoint event, got {:?}", other),
            }
        };
        tokio::time::timeout(Duration::from_secs(10), exchange)
            .await
            .expect("exchange timed out");
    }
}

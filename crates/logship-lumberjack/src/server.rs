use crate::frame::{encode_ack, Frame, FrameDecoder};
use crate::tls;
use bytes::BytesMut;
use futures::StreamExt;
use logship_core::config::{CompressionWrapper, LumberjackInputConfig};
use logship_core::{Event, InputError, ShipError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deadline for each decode pass on a connection.
const READ_DEADLINE: Duration = Duration::from_secs(30);

/// Lumberjack protocol listener. Accepted connections are decoded
/// independently; every decoded event is delivered to the provided channel
/// in connection order.
pub struct LumberjackServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    wrapper: CompressionWrapper,
}

impl LumberjackServer {
    /// Bind the listener and prepare the TLS acceptor. Failures here are
    /// configuration errors and fatal at startup.
    pub async fn bind(config: &LumberjackInputConfig) -> Result<Self, ShipError> {
        let server_config = tls::server_config(&config.tls)?;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ShipError::Config(format!("Failed to bind {}: {}", addr, e)))?;
        info!(address = %addr, "Lumberjack listener started");
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            wrapper: config.compression_wrapper,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled. Each connection runs in its own
    /// task; per-connection errors never take the listener down.
    pub async fn run(
        self,
        sender: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Result<(), InputError> {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let acceptor = self.acceptor.clone();
                            let sender = sender.clone();
                            let wrapper = self.wrapper;
                            connections.spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, peer, acceptor, wrapper, sender).await
                                {
                                    warn!(peer = %peer, error = %e, "Connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                        }
                    }
                }
                // Reap finished connection tasks so the set does not grow.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        connections.shutdown().await;
        Ok(())
    }
}

/// Per-connection sequence tracking.
struct ConnState {
    last_received: u32,
    last_ack: u32,
    window_size: u32,
    seen_since_ack: u32,
}

enum SeqClass {
    Accept,
    Duplicate,
    Gap,
}

impl ConnState {
    fn new() -> Self {
        Self {
            last_received: 0,
            last_ack: 0,
            window_size: 1,
            seen_since_ack: 0,
        }
    }

    /// Sequences must be gap-free after the first accepted frame.
    /// Duplicates (at or behind the cursor) are dropped silently. The wrap
    /// from u32::MAX continues at 1.
    fn classify(&self, seq: u32) -> SeqClass {
        if self.last_received == 0 {
            return SeqClass::Accept;
        }
        let expected = if self.last_received == u32::MAX {
            1
        } else {
            self.last_received + 1
        };
        if seq == expected {
            SeqClass::Accept
        } else if self.last_received.wrapping_sub(seq) < u32::MAX / 2 {
            SeqClass::Duplicate
        } else {
            SeqClass::Gap
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    wrapper: CompressionWrapper,
    sender: mpsc::Sender<Event>,
) -> Result<(), InputError> {
    let tls_stream = acceptor.accept(stream).await.map_err(|e| InputError::Listener {
        addr: peer.to_string(),
        message: format!("TLS accept: {}", e),
    })?;
    debug!(peer = %peer, "Connection established");

    let (read_half, mut write_half) = tokio::io::split(tls_stream);
    let mut frames = FramedRead::new(read_half, FrameDecoder::new(wrapper));
    let mut state = ConnState::new();

    loop {
        let next = match timeout(READ_DEADLINE, frames.next()).await {
            Err(_) => {
                warn!(peer = %peer, "Read deadline exceeded");
                return Ok(());
            }
            Ok(None) => {
                debug!(peer = %peer, "Connection closed");
                return Ok(());
            }
            Ok(Some(Err(e))) => {
                return Err(InputError::Listener {
                    addr: peer.to_string(),
                    message: e.to_string(),
                });
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let mut flat = Vec::new();
        flatten_frame(next, &mut flat);
        for frame in flat {
            process_frame(frame, &peer, &mut state, &mut write_half, &sender).await?;
        }
    }
}

/// Unfold compressed frames (including tolerated nested ones) into a flat
/// sequence.
fn flatten_frame(frame: Frame, out: &mut Vec<Frame>) {
    match frame {
        Frame::Compressed(inner) => {
            for sub in inner {
                flatten_frame(sub, out);
            }
        }
        other => out.push(other),
    }
}

async fn process_frame<W: AsyncWrite + Unpin>(
    frame: Frame,
    peer: &SocketAddr,
    state: &mut ConnState,
    writer: &mut W,
    sender: &mpsc::Sender<Event>,
) -> Result<(), InputError> {
    match frame {
        Frame::Window(size) => {
            state.window_size = size.max(1);
        }
        Frame::Compressed(_) => unreachable!("compressed frames are flattened"),
        Frame::Ack(seq) => {
            warn!(peer = %peer, seq, "Ignoring unexpected ack from client");
        }
        data @ (Frame::Data { .. } | Frame::Json { .. }) => {
            let Some((seq, mut event)) = data.into_event() else {
                return Ok(());
            };
            match state.classify(seq) {
                SeqClass::Duplicate => {
                    debug!(peer = %peer, seq, "Dropping duplicate");
                    return Ok(());
                }
                SeqClass::Gap => {
                    return Err(InputError::Listener {
                        addr: peer.to_string(),
                        message: format!(
                            "sequence gap: got {} after {}",
                            seq, state.last_received
                        ),
                    });
                }
                SeqClass::Accept => {}
            }

            if event.host.is_empty() {
                event.host = peer.ip().to_string();
            }
            if event.source.is_empty() {
                event.source = format!("lumberjack://{}", peer);
            }
            sender
                .send(event)
                .await
                .map_err(|_| InputError::ChannelClosed)?;

            state.last_received = seq;
            state.seen_since_ack += 1;
            if state.seen_since_ack >= state.window_size {
                let mut ack = BytesMut::new();
                encode_ack(&mut ack, 1, state.last_received);
                writer.write_all(&ack).await.map_err(|e| InputError::Listener {
                    addr: peer.to_string(),
                    message: format!("writing ack: {}", e),
                })?;
                writer.flush().await.map_err(|e| InputError::Listener {
                    addr: peer.to_string(),
                    message: format!("flushing ack: {}", e),
                })?;
                state.last_ack = state.last_received;
                state.seen_since_ack = 0;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_data, encode_window};
    use crate::tls::client_config;
    use logship_core::config::TlsConfig;
    use std::io::Write as _;
    use tokio::io::AsyncReadExt;

    fn write_pem(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    async fn start_server() -> (SocketAddr, mpsc::Receiver<Event>, CancellationToken) {
        let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_file = write_pem(&signed.cert.pem());
        let key_file = write_pem(&signed.key_pair.serialize_pem());

        let tls_config = TlsConfig {
            ssl_cert_file: Some(cert_file.path().to_string_lossy().to_string()),
            ssl_key_file: Some(key_file.path().to_string_lossy().to_string()),
            ..Default::default()
        };
        let server_config = tls::server_config(&tls_config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = LumberjackServer {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            wrapper: CompressionWrapper::Zlib,
        };

        let (sender, receiver) = mpsc::channel(100);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = server.run(sender, run_cancel).await;
        });
        // The PEM material was loaded eagerly; the temp files may go.
        drop(cert_file);
        drop(key_file);
        (addr, receiver, cancel)
    }

    async fn tls_connect(addr: SocketAddr) -> tokio_rustls::client::TlsStream<TcpStream> {
        let tls = TlsConfig {
            tls_skip_verify: true,
            ..Default::default()
        };
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config(&tls).unwrap()));
        let tcp = TcpStream::connect(addr).await.unwrap();
        connector
            .connect(tls::server_name("localhost").unwrap(), tcp)
            .await
            .unwrap()
    }

    fn data_frame(seq: u32, line: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_data(
            &mut buf,
            seq,
            &[
                ("line".to_string(), line.to_string()),
                ("type".to_string(), "app".to_string()),
            ],
        );
        buf
    }

    #[tokio::test]
    async fn test_in_order_delivery_and_ack() {
        let (addr, mut receiver, cancel) = start_server().await;
        let mut stream = tls_connect(addr).await;

        let mut wire = BytesMut::new();
        encode_window(&mut wire, 1, 3);
        for i in 1..=3u32 {
            wire.unsplit(data_frame(i, &format!("L{}", i)));
        }
        stream.write_all(&wire).await.unwrap();
        stream.flush().await.unwrap();

        for i in 1..=3u32 {
            let event = receiver.recv().await.unwrap();
            assert_eq!(event.line, format!("L{}", i));
            assert_eq!(event.event_type, "app");
        }

        let mut ack = [0u8; 6];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"1A\x00\x00\x00\x03");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_gap_closes_connection() {
        let (addr, mut receiver, cancel) = start_server().await;
        let mut stream = tls_connect(addr).await;

        let mut wire = BytesMut::new();
        encode_window(&mut wire, 1, 10);
        for i in 1..=3u32 {
            wire.unsplit(data_frame(i, &format!("L{}", i)));
        }
        wire.unsplit(data_frame(5, "L5"));
        stream.write_all(&wire).await.unwrap();
        stream.flush().await.unwrap();

        for i in 1..=3u32 {
            assert_eq!(receiver.recv().await.unwrap().line, format!("L{}", i));
        }

        // The connection is closed on the gap and nothing for 5 arrives.
        let mut probe = [0u8; 1];
        let n = stream.read(&mut probe).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(receiver.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_duplicates_dropped() {
        let (addr, mut receiver, cancel) = start_server().await;
        let mut stream = tls_connect(addr).await;

        let mut wire = BytesMut::new();
        encode_window(&mut wire, 1, 10);
        wire.unsplit(data_frame(1, "L1"));
        wire.unsplit(data_frame(2, "L2"));
        wire.unsplit(data_frame(2, "L2 again"));
        wire.unsplit(data_frame(3, "L3"));
        stream.write_all(&wire).await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(receiver.recv().await.unwrap().line, "L1");
        assert_eq!(receiver.recv().await.unwrap().line, "L2");
        assert_eq!(receiver.recv().await.unwrap().line, "L3");
        assert!(receiver.try_recv().is_err());
        cancel.cancel();
    }
}

use crate::frame;
use crate::tls;
use bytes::BytesMut;
use logship_core::config::{CompressionWrapper, LumberjackOutputConfig};
use logship_core::{Event, OutputError, ShipError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Write syscalls are capped at this many bytes.
const WRITE_CHUNK: usize = 16 * 1024;

/// Lumberjack protocol client: TLS dial with failover hosts, throttled
/// reconnect, windowed sends with explicit acknowledgement.
pub struct LumberjackClient {
    hosts: Vec<String>,
    port: u16,
    connect_timeout: Duration,
    send_timeout: Duration,
    persistent: bool,
    protocol_version: u8,
    compression: bool,
    wrapper: CompressionWrapper,
    connector: TlsConnector,
    conn: Option<TlsStream<TcpStream>>,
    msg_sequence: u32,
    last_ack: u32,
    connect_failures: u32,
}

impl LumberjackClient {
    pub fn new(config: &LumberjackOutputConfig) -> Result<Self, ShipError> {
        let client_config = tls::client_config(&config.tls)?;
        Ok(Self {
            hosts: config.host.clone().into_vec(),
            port: config.port,
            connect_timeout: Duration::from_secs(config.connect_timeout),
            send_timeout: Duration::from_secs(config.timeout),
            persistent: config.persistent,
            protocol_version: config.protocol_version,
            compression: config.compression,
            wrapper: config.compression_wrapper,
            connector: TlsConnector::from(Arc::new(client_config)),
            conn: None,
            msg_sequence: 0,
            last_ack: 0,
            connect_failures: 0,
        })
    }

    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    pub fn sequence(&self) -> u32 {
        self.msg_sequence
    }

    #[cfg(test)]
    pub(crate) fn set_sequence(&mut self, seq: u32) {
        self.msg_sequence = seq;
        self.last_ack = seq;
    }

    /// Sequences are uint32, increment per event, and wrap back to 1,
    /// never 0.
    fn next_seq(&mut self) -> u32 {
        self.msg_sequence = match self.msg_sequence.checked_add(1) {
            Some(seq) => seq,
            None => 1,
        };
        self.msg_sequence
    }

    fn throttle_delay(&self) -> Option<Duration> {
        if self.connect_failures > 50 {
            Some(Duration::from_secs(600))
        } else if self.connect_failures > 10 {
            Some(Duration::from_secs(60))
        } else {
            None
        }
    }

    /// Ensure a live connection, reusing a persistent one when present.
    /// The host list is rotated on each failed attempt, so the next try
    /// starts at the next host.
    async fn connect(&mut self) -> Result<(), OutputError> {
        if self.conn.is_some() {
            return Ok(());
        }

        if let Some(delay) = self.throttle_delay() {
            warn!(
                failures = self.connect_failures,
                delay_secs = delay.as_secs(),
                "Throttling reconnect attempts"
            );
            tokio::time::sleep(delay).await;
        }

        for _ in 0..self.hosts.len() {
            let host = self.hosts[0].clone();
            match self.try_connect(&host).await {
                Ok(stream) => {
                    info!(host = %host, port = self.port, "Connected");
                    self.conn = Some(stream);
                    self.connect_failures = 0;
                    return Ok(());
                }
                Err(e) => {
                    warn!(host = %host, port = self.port, error = %e, "Connect failed");
                    self.hosts.rotate_left(1);
                }
            }
        }

        self.connect_failures += 1;
        Err(OutputError::Connect {
            addr: format!("{:?}:{}", self.hosts, self.port),
            message: format!("all hosts unreachable (attempt {})", self.connect_failures),
        })
    }

    async fn try_connect(&self, host: &str) -> Result<TlsStream<TcpStream>, OutputError> {
        let name = tls::server_name(host).map_err(|e| OutputError::Connect {
            addr: host.to_string(),
            message: e.to_string(),
        })?;
        let tcp = timeout(self.connect_timeout, TcpStream::connect((host, self.port)))
            .await
            .map_err(|_| OutputError::Timeout(self.connect_timeout))?
            .map_err(|e| OutputError::Connect {
                addr: format!("{}:{}", host, self.port),
                message: e.to_string(),
            })?;
        timeout(self.connect_timeout, self.connector.connect(name, tcp))
            .await
            .map_err(|_| OutputError::Timeout(self.connect_timeout))?
            .map_err(|e| OutputError::Connect {
                addr: format!("{}:{}", host, self.port),
                message: format!("TLS handshake: {}", e),
            })
    }

    /// Send a batch of up to `max_window_size` events and wait for the ack
    /// of the last sequence. Any failure discards the connection and
    /// surfaces an error; the caller stashes the events.
    pub async fn send(&mut self, events: &[Event]) -> Result<(), OutputError> {
        if events.is_empty() {
            return Ok(());
        }
        self.connect().await?;

        let mut body = BytesMut::new();
        let mut last_seq = self.msg_sequence;
        for event in events {
            last_seq = self.next_seq();
            match self.protocol_version {
                2 => {
                    let json = event
                        .to_json()
                        .map_err(|e| OutputError::Serialization(e.to_string()))?;
                    frame::encode_json(&mut body, last_seq, &json);
                }
                _ => frame::encode_data(&mut body, last_seq, &event.to_pairs()),
            }
        }

        let mut wire = BytesMut::new();
        frame::encode_window(&mut wire, self.protocol_version, events.len() as u32);
        if self.compression {
            frame::encode_compressed(&mut wire, self.protocol_version, &body, self.wrapper)
                .map_err(|e| OutputError::Write(e.to_string()))?;
        } else {
            wire.unsplit(body);
        }

        let result = self.write_and_await_ack(&wire, last_seq).await;
        if result.is_err() || !self.persistent {
            self.conn = None;
        }
        result?;

        self.last_ack = last_seq;
        debug!(events = events.len(), last_ack = self.last_ack, "Batch acknowledged");
        Ok(())
    }

    async fn write_and_await_ack(&mut self, wire: &[u8], want_seq: u32) -> Result<(), OutputError> {
        let send_timeout = self.send_timeout;
        let conn = self.conn.as_mut().ok_or_else(|| OutputError::Write(
            "connection lost before write".to_string(),
        ))?;

        timeout(send_timeout, async {
            for chunk in wire.chunks(WRITE_CHUNK) {
                conn.write_all(chunk)
                    .await
                    .map_err(|e| OutputError::Write(e.to_string()))?;
            }
            conn.flush()
                .await
                .map_err(|e| OutputError::Write(e.to_string()))?;

            let mut ack = [0u8; 6];
            conn.read_exact(&mut ack)
                .await
                .map_err(|e| OutputError::Write(format!("reading ack: {}", e)))?;
            if !matches!(ack[0], b'1' | b'2') || ack[1] != b'A' {
                return Err(OutputError::Protocol(format!(
                    "expected ack frame, got 0x{:02x}{:02x}",
                    ack[0], ack[1]
                )));
            }
            let got = u32::from_be_bytes([ack[2], ack[3], ack[4], ack[5]]);
            if got != want_seq {
                return Err(OutputError::AckMismatch {
                    expected: want_seq,
                    got,
                });
            }
            Ok(())
        })
        .await
        .map_err(|_| OutputError::Timeout(send_timeout))?
    }
}

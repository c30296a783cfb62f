use async_trait::async_trait;
use logship_core::config::SocketOutputConfig;
use logship_core::{Event, Output, OutputError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Plain socket output: newline-delimited JSON over TCP. The host list is
/// rotated on connect failure, like the Lumberjack client.
pub struct SocketOutput {
    hosts: Vec<String>,
    port: u16,
    connect_timeout: Duration,
    send_timeout: Duration,
    persistent: bool,
    conn: Option<TcpStream>,
}

impl SocketOutput {
    pub fn new(config: &SocketOutputConfig) -> Self {
        Self {
            hosts: config.host.clone().into_vec(),
            port: config.port,
            connect_timeout: Duration::from_secs(config.connect_timeout),
            send_timeout: Duration::from_secs(config.timeout),
            persistent: config.persistent,
            conn: None,
        }
    }

    async fn connect(&mut self) -> Result<(), OutputError> {
        if self.conn.is_some() {
            return Ok(());
        }
        for _ in 0..self.hosts.len() {
            let host = self.hosts[0].clone();
            match timeout(self.connect_timeout, TcpStream::connect((host.as_str(), self.port)))
                .await
            {
                Ok(Ok(stream)) => {
                    debug!(host = %host, port = self.port, "Connected");
                    self.conn = Some(stream);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(host = %host, port = self.port, error = %e, "Connect failed");
                    self.hosts.rotate_left(1);
                }
                Err(_) => {
                    warn!(host = %host, port = self.port, "Connect timed out");
                    self.hosts.rotate_left(1);
                }
            }
        }
        Err(OutputError::Connect {
            addr: format!("{:?}:{}", self.hosts, self.port),
            message: "all hosts unreachable".to_string(),
        })
    }

    async fn write_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        let send_timeout = self.send_timeout;
        let conn = self.conn.as_mut().expect("connected");
        timeout(send_timeout, async {
            for event in events {
                let json = event
                    .to_json()
                    .map_err(|e| OutputError::Serialization(e.to_string()))?;
                conn.write_all(json.as_bytes())
                    .await
                    .map_err(|e| OutputError::Write(e.to_string()))?;
                conn.write_all(b"\n")
                    .await
                    .map_err(|e| OutputError::Write(e.to_string()))?;
            }
            conn.flush().await.map_err(|e| OutputError::Write(e.to_string()))
        })
        .await
        .map_err(|_| OutputError::Timeout(send_timeout))?
    }
}

#[async_trait]
impl Output for SocketOutput {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn push(&mut self, events: &[Event]) -> Result<(), OutputError> {
        self.connect().await?;
        let result = self.write_events(events).await;
        if result.is_err() || !self.persistent {
            self.conn = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::config::{CommonOutputConfig, OneOrMany};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn config(port: u16) -> SocketOutputConfig {
        SocketOutputConfig {
            common: CommonOutputConfig {
                types: OneOrMany::One("*".to_string()),
            },
            host: OneOrMany::One("127.0.0.1".to_string()),
            port,
            timeout: 5,
            connect_timeout: 1,
            persistent: true,
        }
    }

    #[tokio::test]
    async fn test_sends_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let reader = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let mut received = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                received.push(line);
                if received.len() == 2 {
                    break;
                }
            }
            received
        });

        let mut output = SocketOutput::new(&config(port));
        let events: Vec<Event> = (1..=2)
            .map(|i| Event::from_line("h", "/f", format!("L{}", i)))
            .collect();
        output.push(&events).await.unwrap();

        let received = reader.await.unwrap();
        assert_eq!(received.len(), 2);
        assert!(received[0].contains("\"line\":\"L1\""));
    }

    #[tokio::test]
    async fn test_unreachable_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut output = SocketOutput::new(&config(port));
        let event = Event::from_line("h", "/f", "x".to_string());
        assert!(output.push(std::slice::from_ref(&event)).await.is_err());
    }
}

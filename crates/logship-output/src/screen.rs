use async_trait::async_trait;
use logship_core::config::{ScreenOutputConfig, ScreenTarget};
use logship_core::{Event, Output, OutputError};
use tokio::io::AsyncWriteExt;

/// Foreground diagnostic output: one JSON document per line to stdout or
/// stderr.
pub struct ScreenOutput {
    target: ScreenTarget,
}

impl ScreenOutput {
    pub fn new(config: &ScreenOutputConfig) -> Self {
        Self {
            target: config.send_to,
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        match self.target {
            ScreenTarget::Stdout => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await
            }
            ScreenTarget::Stderr => {
                let mut stderr = tokio::io::stderr();
                stderr.write_all(line.as_bytes()).await?;
                stderr.write_all(b"\n").await?;
                stderr.flush().await
            }
        }
    }
}

#[async_trait]
impl Output for ScreenOutput {
    fn name(&self) -> &'static str {
        "screen"
    }

    async fn push(&mut self, events: &[Event]) -> Result<(), OutputError> {
        for event in events {
            let json = event
                .to_json()
                .map_err(|e| OutputError::Serialization(e.to_string()))?;
            self.write_line(&json)
                .await
                .map_err(|e| OutputError::Write(e.to_string()))?;
        }
        Ok(())
    }
}

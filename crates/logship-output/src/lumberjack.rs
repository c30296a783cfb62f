use async_trait::async_trait;
use logship_core::config::LumberjackOutputConfig;
use logship_core::{Event, Output, OutputError, ShipError};
use logship_lumberjack::LumberjackClient;

/// Lumberjack output adapter: the pipeline hands over windows of up to
/// `max_window_size` events and each window is shipped as one sequenced,
/// acknowledged batch.
pub struct LumberjackOutput {
    client: LumberjackClient,
    max_window_size: usize,
}

impl LumberjackOutput {
    pub fn new(config: &LumberjackOutputConfig) -> Result<Self, ShipError> {
        Ok(Self {
            client: LumberjackClient::new(config)?,
            max_window_size: config.max_window_size,
        })
    }
}

#[async_trait]
impl Output for LumberjackOutput {
    fn name(&self) -> &'static str {
        "lumberjack"
    }

    fn max_window_size(&self) -> usize {
        self.max_window_size
    }

    async fn push(&mut self, events: &[Event]) -> Result<(), OutputError> {
        self.client.send(events).await
    }
}

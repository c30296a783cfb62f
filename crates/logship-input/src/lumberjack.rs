use async_trait::async_trait;
use logship_core::config::LumberjackInputConfig;
use logship_core::{Event, Input, InputError, ShipError};
use logship_lumberjack::LumberjackServer;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

const CHANNEL_SIZE: usize = 10_000;

/// One bound Lumberjack listener. The listener task runs once per
/// configured input; each worker in the input's group pulls from a shared
/// consumer handle.
pub struct LumberjackSource {
    receiver: Arc<Mutex<mpsc::Receiver<Event>>>,
}

impl LumberjackSource {
    /// Bind the listener and start serving. Bind failures are fatal at
    /// startup.
    pub async fn start(
        config: &LumberjackInputConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ShipError> {
        let server = LumberjackServer::bind(config).await?;
        let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
        tokio::spawn(async move {
            if let Err(e) = server.run(sender, cancel).await {
                error!(error = %e, "Lumberjack listener terminated");
            }
        });
        Ok(Self {
            receiver: Arc::new(Mutex::new(receiver)),
        })
    }

    pub fn consumer(&self) -> LumberjackInput {
        LumberjackInput {
            receiver: self.receiver.clone(),
        }
    }
}

/// Pull side of a Lumberjack listener.
pub struct LumberjackInput {
    receiver: Arc<Mutex<mpsc::Receiver<Event>>>,
}

#[async_trait]
impl Input for LumberjackInput {
    fn name(&self) -> &'static str {
        "lumberjack"
    }

    async fn pull(&mut self, max_events: usize) -> Result<Vec<Event>, InputError> {
        let mut receiver = self.receiver.lock().await;
        let mut events = Vec::new();
        while events.len() < max_events {
            match receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if events.is_empty() {
                        return Err(InputError::ChannelClosed);
                    }
                    break;
                }
            }
        }
        Ok(events)
    }
}

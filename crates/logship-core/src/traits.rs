use crate::error::{InputError, OutputError};
use crate::event::Event;
use async_trait::async_trait;

/// Trait for input adapters.
///
/// A pull returns up to `max_events` complete logical events, in source
/// order. An empty vector means the input is idle. A fatal error
/// (`InputError::is_fatal`) marks the input for destruction on the next
/// pipeline tick; anything else is logged and retried.
#[async_trait]
pub trait Input: Send {
    /// Adapter name, for logging
    fn name(&self) -> &'static str;

    async fn pull(&mut self, max_events: usize) -> Result<Vec<Event>, InputError>;
}

/// Trait for output adapters.
///
/// `push` either delivers the whole batch or fails; any error is treated as
/// "stash and retry" by the pipeline. Adapters that cannot batch advertise a
/// `max_window_size` of 0 and are fed one event per call.
#[async_trait]
pub trait Output: Send {
    /// Adapter name, for logging
    fn name(&self) -> &'static str;

    /// Maximum events per push; 0 means single-event pushes
    fn max_window_size(&self) -> usize {
        0
    }

    async fn push(&mut self, events: &[Event]) -> Result<(), OutputError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SinkOutput {
        pushed: usize,
    }

    #[async_trait]
    impl Output for SinkOutput {
        fn name(&self) -> &'static str {
            "sink"
        }

        async fn push(&mut self, events: &[Event]) -> Result<(), OutputError> {
            self.pushed += events.len();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_window_size() {
        let mut sink = SinkOutput { pushed: 0 };
        assert_eq!(sink.max_window_size(), 0);
        let event = Event::from_line("h", "/f", "x".to_string());
        sink.push(std::slice::from_ref(&event)).await.unwrap();
        assert_eq!(sink.pushed, 1);
    }
}

//! Handling of commands received from the cloud channel.

use std::future::Future;

use serde_json::Value;
use tracing::info;

use cloudlink_common::InboundCommand;

/// Error returned by a [`CommandHandler`].
///
/// Any handler error stops the bridge.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Unsupported command: {0}")]
    Unsupported(String),
}

/// Consumes decoded commands, one at a time, in arrival order.
pub trait CommandHandler {
    fn handle(&self, command: InboundCommand) -> impl Future<Output = Result<(), CommandError>>;
}

/// Logs every command and accepts it.
#[derive(Debug, Clone, Default)]
pub struct LogCommandHandler;

impl CommandHandler for LogCommandHandler {
    async fn handle(&self, command: InboundCommand) -> Result<(), CommandError> {
        let action = match command.get("action") {
            Some(Value::String(action)) => action.clone(),
            Some(other) => other.to_string(),
            None => "<none>".to_string(),
        };
        info!(action = %action, fields = command.len(), "Command received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudlink_common::decode_command;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_log_handler_accepts_anything() {
        let handler = LogCommandHandler;

        let write = decode_command(r#"{"action":"write","address":3}"#).unwrap();
        assert!(handler.handle(write).await.is_ok());

        let bare = decode_command("{}").unwrap();
        assert!(handler.handle(bare).await.is_ok());

        assert!(logs_contain("action=write"));
        assert!(logs_contain("action=<none>"));
    }
}

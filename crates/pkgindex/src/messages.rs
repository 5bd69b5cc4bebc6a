//
// messages.rs
//
// Fire-and-forget notifications surfaced to the protocol layer
//

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// Shown to the user ("cache built for root X")
    Info,
    /// Log-level detail ("cached unit Y")
    Log,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: MessageLevel,
    pub message: String,
}

/// Sends notifications without ever blocking the caller.
///
/// Every message is mirrored to `log`; when no receiver is attached, or the
/// receiver has gone away, only the log line remains.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<Notification>>,
}

impl Notifier {
    /// Create a notifier and the receiver the protocol layer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier that only logs.
    pub fn log_only() -> Self {
        Self::default()
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        self.send(MessageLevel::Info, message);
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        log::trace!("{}", message);
        self.send(MessageLevel::Log, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.send(MessageLevel::Error, message);
    }

    fn send(&self, level: MessageLevel, message: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Notification { level, message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_delivers_in_order() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.info("cache built for root /w");
        notifier.log("cached unit M/a");
        notifier.error("rebuild failed: boom");

        let levels: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|n| n.level)
            .collect();
        assert_eq!(
            levels,
            vec![MessageLevel::Info, MessageLevel::Log, MessageLevel::Error]
        );
    }

    #[test]
    fn test_dropped_receiver_does_not_block() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.error("nobody is listening");
        Notifier::log_only().info("log only");
    }
}

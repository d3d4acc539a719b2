use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process-wide shutdown flag tripped by Ctrl+C.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Signal that also listens for Ctrl+C.
    pub fn new() -> Self {
        let signal = Self::default();
        let trigger = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl+c received; shutting down");
                trigger.trigger();
            }
        });
        signal
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token cancelled together with this signal.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_cancels_handed_out_tokens() {
        let signal = ShutdownSignal::default();
        let token = signal.token();
        assert!(!signal.triggered());
        signal.trigger();
        signal.wait().await;
        assert!(token.is_cancelled());
        assert!(signal.triggered());
    }
}

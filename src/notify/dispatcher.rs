use super::providers::{build_provider, NotificationProvider};
use super::NotificationEvent;
use crate::config::notify::{DispatchMode, NotifyConfig};
use crate::constants::NOTIFICATION_TIMEOUT;
use anyhow::Result;
use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Pushes broadcast engine events to the configured providers.
pub struct NotificationDispatcher {
    mode: DispatchMode,
    providers: Vec<Box<dyn NotificationProvider>>,
    receiver: broadcast::Receiver<NotificationEvent>,
}

impl NotificationDispatcher {
    pub fn new(
        config: &NotifyConfig,
        receiver: broadcast::Receiver<NotificationEvent>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(NOTIFICATION_TIMEOUT)
            .build()?;
        let mut providers = Vec::with_capacity(config.providers.len());
        for p in &config.providers {
            match build_provider(p, client.clone()) {
                Ok(provider) => providers.push(provider),
                Err(e) => warn!("Notification provider {} disabled: {}", p.name(), e),
            }
        }
        Ok(Self::with_providers(config.mode, providers, receiver))
    }

    pub fn with_providers(
        mode: DispatchMode,
        providers: Vec<Box<dyn NotificationProvider>>,
        receiver: broadcast::Receiver<NotificationEvent>,
    ) -> Self {
        Self {
            mode,
            providers,
            receiver,
        }
    }

    /// Runs until every sender is gone.
    pub async fn run(self) {
        let Self {
            mode,
            providers,
            receiver,
        } = self;
        let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        info!("Notification dispatcher started ({:?}): {}", mode, names.join(", "));

        let mut stream = BroadcastStream::new(receiver);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(event) => {
                    deliver(mode, &providers, &event).await;
                }
                Err(e) => {
                    warn!("Notification stream lagged: {}", e);
                }
            }
        }
        info!("Notification dispatcher stopped.");
    }
}

/// Sends one event. Returns how many providers acknowledged it.
pub async fn deliver(
    mode: DispatchMode,
    providers: &[Box<dyn NotificationProvider>],
    event: &NotificationEvent,
) -> usize {
    if providers.is_empty() {
        return 0;
    }
    let title = event.title();
    let content = event.content();
    let mut delivered = 0;

    for provider in providers {
        let outcome =
            tokio::time::timeout(NOTIFICATION_TIMEOUT, provider.send(&title, &content)).await;
        match outcome {
            Ok(Ok(())) => {
                info!("Notification delivered via {}: {}", provider.name(), title);
                delivered += 1;
                if mode == DispatchMode::Fallback {
                    return delivered;
                }
            }
            Ok(Err(e)) => warn!("Notification via {} failed: {}", provider.name(), e),
            Err(_) => warn!("Notification via {} timed out", provider.name()),
        }
    }

    if delivered == 0 {
        error!("All {} notification providers failed for {}", providers.len(), title);
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubProvider {
        name: &'static str,
        ok: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NotificationProvider for StubProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _title: &str, _content: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ok {
                Ok(())
            } else {
                Err(anyhow::anyhow!("boom"))
            }
        }
    }

    fn stubs(results: &[bool]) -> (Vec<Box<dyn NotificationProvider>>, Vec<Arc<AtomicUsize>>) {
        let mut providers: Vec<Box<dyn NotificationProvider>> = Vec::new();
        let mut counters = Vec::new();
        for (i, ok) in results.iter().enumerate() {
            let calls = Arc::new(AtomicUsize::new(0));
            counters.push(calls.clone());
            providers.push(Box::new(StubProvider {
                name: ["a", "b", "c"][i],
                ok: *ok,
                calls,
            }));
        }
        (providers, counters)
    }

    fn event() -> NotificationEvent {
        NotificationEvent::new(
            NotificationKind::DriftDetected,
            "BNB/USDC",
            serde_json::json!({"level": 2}),
        )
    }

    #[tokio::test]
    async fn test_fallback_stops_at_first_success() {
        let (providers, calls) = stubs(&[false, true, true]);
        let delivered = deliver(DispatchMode::Fallback, &providers, &event()).await;
        assert_eq!(delivered, 1);
        assert_eq!(calls[0].load(Ordering::SeqCst), 1);
        assert_eq!(calls[1].load(Ordering::SeqCst), 1);
        assert_eq!(calls[2].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_broadcast_uses_every_provider() {
        let (providers, calls) = stubs(&[true, false, true]);
        let delivered = deliver(DispatchMode::Broadcast, &providers, &event()).await;
        assert_eq!(delivered, 2);
        assert!(calls.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn test_dispatcher_drains_until_senders_drop() {
        let (tx, rx) = broadcast::channel(8);
        let (providers, calls) = stubs(&[true]);
        let dispatcher = NotificationDispatcher::with_providers(DispatchMode::Fallback, providers, rx);
        let handle = tokio::spawn(dispatcher.run());

        tx.send(event()).unwrap();
        tx.send(event()).unwrap();
        drop(tx);

        handle.await.unwrap();
        assert_eq!(calls[0].load(Ordering::SeqCst), 2);
    }
}

//! Runs engine calls off the async reactor and routes the resulting actions.
//! Application events go through a channel to a single consumer task, so events
//! produced before the consumer is attached are queued and delivered in order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use upc_core::{
    Action, Connector, FailedReason, PushEndpoint, PushEvent, PushMessage, PushReceiver, Transport,
};

pub struct Service {
    connector: Arc<Connector>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<PushEvent>,
}

impl Service {
    /// Returns the service and the receiving end of its event queue.
    pub fn new(
        connector: Arc<Connector>,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<PushEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                connector,
                transport,
                events,
            },
            rx,
        )
    }

    async fn blocking<R, F>(&self, f: F) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Connector) -> R + Send + 'static,
    {
        let connector = Arc::clone(&self.connector);
        Ok(tokio::task::spawn_blocking(move || f(&connector)).await?)
    }

    /// Run one engine call and perform its actions.
    pub async fn run<F>(&self, f: F)
    where
        F: FnOnce(&Connector) -> Vec<Action> + Send + 'static,
    {
        match self.blocking(f).await {
            Ok(actions) => self.dispatch(actions),
            Err(e) => log::error!("engine task failed: {}", e),
        }
    }

    pub async fn register(
        &self,
        instance: String,
        message_for_peer: Option<String>,
        vapid: Option<String>,
        features: Vec<String>,
    ) -> anyhow::Result<()> {
        let actions = self
            .blocking(move |c| {
                c.register_with_features(
                    &instance,
                    message_for_peer.as_deref(),
                    vapid.as_deref(),
                    &features,
                )
            })
            .await??;
        self.dispatch(actions);
        Ok(())
    }

    fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { peer_id, message } => self.transport.send(&peer_id, message),
                Action::Deliver(event) => {
                    if self.events.send(event).is_err() {
                        log::warn!("event consumer gone, dropping event");
                    }
                }
            }
        }
    }
}

/// Drain the event queue into `receiver` until every sender is dropped.
pub fn spawn_consumer(
    mut rx: mpsc::UnboundedReceiver<PushEvent>,
    receiver: Arc<dyn PushReceiver>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            event.dispatch(receiver.as_ref());
        }
    })
}

/// Consumer for the standalone daemon: reports events in the log.
pub struct LogReceiver;

impl PushReceiver for LogReceiver {
    fn on_new_endpoint(&self, endpoint: &PushEndpoint, instance: &str) {
        log::info!("[{}] endpoint {}", instance, endpoint.url);
        if let Some(keys) = &endpoint.pub_key_set {
            log::info!("[{}] p256dh={} auth={}", instance, keys.pub_key, keys.auth);
        }
    }

    fn on_message(&self, message: &PushMessage, instance: &str) {
        if message.verified {
            log::info!(
                "[{}] message: {}",
                instance,
                String::from_utf8_lossy(&message.content)
            );
        } else {
            log::warn!(
                "[{}] unverified message ({} bytes)",
                instance,
                message.content.len()
            );
        }
    }

    fn on_registration_failed(&self, reason: FailedReason, instance: &str) {
        if reason.is_retryable() {
            log::warn!("[{}] registration failed: {}, retry later", instance, reason);
        } else {
            log::error!("[{}] registration failed: {}", instance, reason);
        }
    }

    fn on_unregistered(&self, instance: &str) {
        log::info!("[{}] unregistered", instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use upc_core::{
        ConnectorConfig, DefaultKeyManager, OutboundMessage, PeerProtocol, Store,
    };

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<OutboundMessage>>,
        events: Mutex<Vec<String>>,
    }

    impl Transport for Recorder {
        fn send(&self, _peer_id: &str, message: OutboundMessage) {
            self.sent.lock().push(message);
        }
    }

    impl PushReceiver for Recorder {
        fn on_new_endpoint(&self, endpoint: &PushEndpoint, instance: &str) {
            self.events.lock().push(format!("endpoint {} {}", instance, endpoint.url));
        }
        fn on_message(&self, _message: &PushMessage, instance: &str) {
            self.events.lock().push(format!("message {}", instance));
        }
        fn on_registration_failed(&self, reason: FailedReason, instance: &str) {
            self.events.lock().push(format!("failed {} {}", instance, reason));
        }
        fn on_unregistered(&self, instance: &str) {
            self.events.lock().push(format!("unregistered {}", instance));
        }
    }

    fn service(recorder: &Arc<Recorder>) -> (Service, mpsc::UnboundedReceiver<PushEvent>) {
        let store = Arc::new(Store::in_memory());
        let keys = Arc::new(DefaultKeyManager::plain(Arc::clone(&store)));
        let connector = Arc::new(Connector::new(store, keys, ConnectorConfig::default()));
        Service::new(connector, recorder.clone())
    }

    #[tokio::test]
    async fn events_queued_until_consumer_attached() {
        let recorder = Arc::new(Recorder::default());
        let (svc, rx) = service(&recorder);
        svc.register("a".into(), None, None, Vec::new()).await.unwrap();
        svc.register("b".into(), None, None, Vec::new()).await.unwrap();
        assert!(recorder.events.lock().is_empty());

        drop(svc);
        spawn_consumer(rx, recorder.clone()).await.unwrap();
        assert_eq!(
            *recorder.events.lock(),
            vec!["failed a NO_PEER_SELECTED", "failed b NO_PEER_SELECTED"]
        );
    }

    #[tokio::test]
    async fn sends_reach_transport() {
        let recorder = Arc::new(Recorder::default());
        let (svc, _rx) = service(&recorder);
        svc.run(|c| c.bind_peer("dist", PeerProtocol::Legacy)).await;
        svc.register("a".into(), Some("hi".into()), None, vec!["bytes".into()])
            .await
            .unwrap();
        let sent = recorder.sent.lock();
        match sent.as_slice() {
            [OutboundMessage::Register { features, .. }] => assert_eq!(features, &["bytes"]),
            other => panic!("expected REGISTER, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn register_error_surfaces() {
        let recorder = Arc::new(Recorder::default());
        let (svc, _rx) = service(&recorder);
        assert!(svc
            .register("a".into(), None, Some("bad".into()), Vec::new())
            .await
            .is_err());
    }
}

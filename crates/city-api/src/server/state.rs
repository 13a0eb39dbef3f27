/// Coordinator as the server runs it.
pub type ClassroomSession = SessionCoordinator<ChannelOutbox, MoveStore>;

#[derive(Clone)]
struct AppState {
    session: std::sync::Arc<Mutex<ClassroomSession>>,
    deliveries: broadcast::Sender<Delivery>,
}

impl AppState {
    fn new(config: &SessionConfig, store: MoveStore) -> Result<Self, ServerError> {
        let (deliveries, _) = broadcast::channel(DELIVERY_BUFFER);
        let outbox = ChannelOutbox::new(deliveries.clone());
        let session = SessionCoordinator::from_config(config, outbox, store)?;
        info!(
            session_id = %session.session_id(),
            agents = session.city().total_agents(),
            blocks = session.city().total_blocks(),
            store = %session.move_log().describe(),
            "session initialized"
        );

        Ok(Self {
            session: std::sync::Arc::new(Mutex::new(session)),
            deliveries,
        })
    }
}

/// Outbox that fans deliveries out to every connected socket; each socket
/// keeps only what is addressed to it.
#[derive(Debug, Clone)]
pub struct ChannelOutbox {
    tx: broadcast::Sender<Delivery>,
}

impl ChannelOutbox {
    pub fn new(tx: broadcast::Sender<Delivery>) -> Self {
        Self { tx }
    }

    fn send(&self, delivery: Delivery) {
        // No subscribers just means nobody is connected.
        let _ = self.tx.send(delivery);
    }
}

impl Outbox for ChannelOutbox {
    fn emit_to(&mut self, participant_id: &str, event: OutboundEvent) {
        self.send(Delivery {
            target: Some(participant_id.to_string()),
            event,
        });
    }

    fn broadcast_all(&mut self, event: OutboundEvent) {
        self.send(Delivery {
            target: None,
            event,
        });
    }
}

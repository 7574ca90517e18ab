use crate::service::{ProtocolMessage, ProtocolType, ServiceAddress};
use hsnet_common::Result;
use tracing::info;

/// Application side of an endpoint
pub trait DataHandler: Send {
    /// A message arrived on an established conversation
    fn handle_data_message(&mut self, msg: &ProtocolMessage);

    /// Decide whether a new inbound conversation from `sender` is accepted
    ///
    /// Consulted when the inbound policy is `handler`. `payload` is the
    /// first message, piggybacked on the handshake.
    fn handle_authenticated_data_from(&mut self, _sender: &ServiceAddress, _payload: &[u8]) -> bool {
        true
    }

    fn intro_set_published(&mut self) {}

    fn intro_set_publish_fail(&mut self) {}
}

/// Logs inbound data and accepts everyone
#[derive(Debug, Default)]
pub struct LoggingHandler {
    pub received: u64,
}

impl DataHandler for LoggingHandler {
    fn handle_data_message(&mut self, msg: &ProtocolMessage) {
        self.received += 1;
        match msg.protocol {
            ProtocolType::Text => info!(
                "Message from {}: {}",
                msg.sender_address(),
                String::from_utf8_lossy(&msg.payload)
            ),
            _ => info!(
                "{} bytes of {:?} from {}",
                msg.payload.len(),
                msg.protocol,
                msg.sender_address()
            ),
        }
    }

    fn intro_set_published(&mut self) {
        info!("Introset published");
    }
}

/// Moves the endpoint into a network namespace
pub trait NetworkIsolation: Send {
    fn isolate(&mut self, netns: &str) -> Result<()>;
}

//! Process-wide publisher.
//!
//! One broker client behind a mutex; every publish from any thread goes
//! through it, so the client's channel is only ever touched by one thread at a
//! time. Publishing never raises: the outcome is logged and reported as a
//! boolean.

use std::sync::{Arc, Mutex};

use tracing::{error, info};

use edas_core::Envelope;

use crate::broker::{BrokerClient, ClientSettings, Connector};

#[derive(Debug)]
pub struct Publisher {
    client: Mutex<BrokerClient>,
}

impl Publisher {
    /// Create the publisher and try to connect.
    ///
    /// An unreachable broker is logged and tolerated; the first submit will
    /// try again.
    pub fn connect(connector: Arc<dyn Connector>, settings: ClientSettings) -> Self {
        let mut client = BrokerClient::new(connector, settings);
        if let Err(err) = client.connect() {
            error!(error = %err, "publisher started without a broker connection");
        }
        Self {
            client: Mutex::new(client),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.lock().map(|c| c.is_connected()).unwrap_or(false)
    }

    /// Publish an envelope on its app's exchange.
    ///
    /// The envelope's `request_id` travels as the correlation id. Returns
    /// whether the broker confirmed the message.
    pub fn submit_event(&self, envelope: &Envelope) -> bool {
        let body = match envelope.try_to_json() {
            Ok(body) => body,
            Err(err) => {
                error!(
                    event = %envelope.event(),
                    message_id = %envelope.message_id(),
                    error = %err,
                    "event could not be serialized"
                );
                return false;
            }
        };

        info!(
            event = %envelope.event(),
            message_id = %envelope.message_id(),
            body = %body,
            "submitting event"
        );

        let Ok(mut client) = self.client.lock() else {
            error!(event = %envelope.event(), "publisher lock poisoned; event dropped");
            return false;
        };

        let exchange = envelope.exchange().as_str();
        match client.publish(body.as_bytes(), exchange, "", envelope.request_id()) {
            Ok(()) => {
                info!(
                    event = %envelope.event(),
                    message_id = %envelope.message_id(),
                    exchange,
                    "event submitted"
                );
                true
            }
            Err(err) => {
                error!(
                    event = %envelope.event(),
                    message_id = %envelope.message_id(),
                    exchange,
                    error = %err,
                    kind = %err.kind(),
                    "event not submitted"
                );
                false
            }
        }
    }

    /// Close the connection. A later submit reconnects.
    pub fn close(&self) {
        if let Ok(mut client) = self.client.lock() {
            client.close();
        }
    }
}

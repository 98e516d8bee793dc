pub mod client;

use tokio::sync::oneshot;

/// A telemetry publish received from the broker.
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Outcome of an outbound publish; the error carries the transport's reason.
pub type PublishResult = Result<(), String>;

/// A publish requested by the command router.
///
/// `reply` resolves once the client has accepted the publish, or, when
/// `ack_required` is set, once the broker has acknowledged it.
pub struct OutboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub ack_required: bool,
    pub reply: oneshot::Sender<PublishResult>,
}

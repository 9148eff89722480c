use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MessageId;

/// An inbound message that has already had its business effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub message_id: MessageId,
    pub routing_key: String,
    pub processed_at: DateTime<Utc>,
}

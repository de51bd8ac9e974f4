use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported broker kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueType {
    /// In-process broker, for local runs and tests.
    #[default]
    Memory,
    Kafka,
    #[serde(rename = "pubsub")]
    PubSub,
    AwsSqs,
    #[serde(rename = "rabbitmq")]
    RabbitMq,
    ServiceBus,
}

impl QueueType {
    pub const ALL: [QueueType; 6] = [
        QueueType::Memory,
        QueueType::Kafka,
        QueueType::PubSub,
        QueueType::AwsSqs,
        QueueType::RabbitMq,
        QueueType::ServiceBus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Memory => "memory",
            QueueType::Kafka => "kafka",
            QueueType::PubSub => "pubsub",
            QueueType::AwsSqs => "aws-sqs",
            QueueType::RabbitMq => "rabbitmq",
            QueueType::ServiceBus => "service-bus",
        }
    }
}

impl FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "memory" => Ok(QueueType::Memory),
            "kafka" => Ok(QueueType::Kafka),
            "pubsub" | "pub-sub" => Ok(QueueType::PubSub),
            "aws-sqs" | "sqs" => Ok(QueueType::AwsSqs),
            "rabbitmq" | "rabbit" => Ok(QueueType::RabbitMq),
            "service-bus" | "servicebus" => Ok(QueueType::ServiceBus),
            other => Err(format!(
                "unknown queue type '{}' (expected one of: {})",
                other,
                QueueType::ALL.map(|q| q.as_str()).join(", ")
            )),
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When received messages are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Each message right after it was processed.
    PerMessage,
    /// The whole receive batch once every message in it was processed
    /// (offset commit style).
    PerBatch,
}

/// Delivery model of a broker kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub receive_batch_size: usize,
    pub ack_mode: AckMode,
    pub send_batch_size: usize,
    pub linger: Duration,
    /// Whether the request topic is created on startup.
    pub provision_topic: bool,
}

impl BackendProfile {
    pub fn for_queue(queue: QueueType) -> Self {
        match queue {
            QueueType::Memory => Self {
                receive_batch_size: 16,
                ack_mode: AckMode::PerMessage,
                send_batch_size: 16,
                linger: Duration::ZERO,
                provision_topic: false,
            },
            QueueType::Kafka => Self {
                receive_batch_size: 500,
                ack_mode: AckMode::PerBatch,
                send_batch_size: 100,
                linger: Duration::from_millis(5),
                provision_topic: true,
            },
            QueueType::PubSub => Self {
                receive_batch_size: 100,
                ack_mode: AckMode::PerMessage,
                send_batch_size: 100,
                linger: Duration::from_millis(10),
                provision_topic: true,
            },
            // SQS caps both ReceiveMessage and SendMessageBatch at 10
            QueueType::AwsSqs => Self {
                receive_batch_size: 10,
                ack_mode: AckMode::PerBatch,
                send_batch_size: 10,
                linger: Duration::ZERO,
                provision_topic: true,
            },
            QueueType::RabbitMq => Self {
                receive_batch_size: 1,
                ack_mode: AckMode::PerMessage,
                send_batch_size: 1,
                linger: Duration::ZERO,
                provision_topic: true,
            },
            QueueType::ServiceBus => Self {
                receive_batch_size: 32,
                ack_mode: AckMode::PerMessage,
                send_batch_size: 100,
                linger: Duration::from_millis(10),
                provision_topic: false,
            },
        }
    }

    pub fn with_send_batch_size(mut self, size: usize) -> Self {
        self.send_batch_size = size;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

//! Kafka backend.
//!
//! [`KafkaSettings`] is plain configuration and always available. The
//! [`KafkaBroker`] itself links librdkafka and is only built with the `kafka`
//! feature.
//!
//! One consumer (joined to `group_id`, auto-commit off) serves every receive
//! loop of the adapter. Acknowledging a receipt commits the offset after it,
//! per partition, so an unacknowledged message is redelivered to the group
//! after a restart or rebalance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_KAFKA_SERVERS: &str = "localhost:9092";
pub const DEFAULT_KAFKA_GROUP_ID: &str = "js-executor-group";

/// Connection and topic provisioning settings for Kafka.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    /// Comma separated `host:port` list.
    pub servers: String,
    pub group_id: String,
    pub client_id: String,
    /// Partitions of a topic created by `ensure_topic`.
    pub topic_partitions: i32,
    pub replication_factor: i32,
    /// Extra librdkafka properties, applied to every client.
    pub properties: BTreeMap<String, String>,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            servers: DEFAULT_KAFKA_SERVERS.to_string(),
            group_id: DEFAULT_KAFKA_GROUP_ID.to_string(),
            client_id: "kafka-js-executor".to_string(),
            topic_partitions: 100,
            replication_factor: 1,
            properties: BTreeMap::new(),
        }
    }
}

impl KafkaSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.servers.trim().is_empty() {
            return Err("kafka servers must not be empty".into());
        }
        if self.group_id.trim().is_empty() {
            return Err("kafka group id must not be empty".into());
        }
        if self.topic_partitions < 1 || self.replication_factor < 1 {
            return Err(format!(
                "kafka topics need at least one partition and replica (got {} / {})",
                self.topic_partitions, self.replication_factor
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "kafka")]
pub use self::broker::KafkaBroker;

#[cfg(feature = "kafka")]
mod broker {
    use futures::FutureExt;
    use jsexec_common::Headers;
    use parking_lot::Mutex;
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::client::DefaultClientContext;
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
    use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
    use rdkafka::message::{BorrowedMessage, Header, Headers as _, Message, OwnedHeaders};
    use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
    use rdkafka::util::Timeout;
    use rdkafka::{Offset, TopicPartitionList};
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::KafkaSettings;
    use crate::error::{AdapterError, Result};
    use crate::queue::{Broker, InboundMessage, OutboundMessage, Receipt};

    /// How long a produced message may wait in the local queue.
    const SEND_TIMEOUT: Duration = Duration::from_secs(30);
    const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

    struct Clients {
        consumer: StreamConsumer,
        producer: FutureProducer,
        admin: AdminClient<DefaultClientContext>,
    }

    #[derive(Debug, Clone)]
    struct Position {
        topic: String,
        partition: i32,
        offset: i64,
    }

    /// [`Broker`] on top of rdkafka's async consumer and producer.
    pub struct KafkaBroker {
        settings: KafkaSettings,
        clients: Mutex<Option<Arc<Clients>>>,
        subscribed: Mutex<BTreeSet<String>>,
        in_flight: Mutex<HashMap<Receipt, Position>>,
        next_receipt: AtomicU64,
    }

    impl KafkaBroker {
        pub fn new(settings: KafkaSettings) -> Self {
            Self {
                settings,
                clients: Mutex::new(None),
                subscribed: Mutex::new(BTreeSet::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_receipt: AtomicU64::new(0),
            }
        }

        pub fn settings(&self) -> &KafkaSettings {
            &self.settings
        }

        fn client_config(&self) -> ClientConfig {
            let mut config = ClientConfig::new();
            config
                .set("bootstrap.servers", &self.settings.servers)
                .set("client.id", &self.settings.client_id);
            for (key, value) in &self.settings.properties {
                config.set(key, value);
            }
            config
        }

        fn consumer_config(&self) -> ClientConfig {
            let mut config = self.client_config();
            config
                .set("group.id", &self.settings.group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", "earliest");
            config
        }

        fn build_clients(&self) -> KafkaResult<Clients> {
            Ok(Clients {
                consumer: self.consumer_config().create()?,
                producer: self.client_config().create()?,
                admin: self.client_config().create()?,
            })
        }

        fn clients(&self) -> Result<Arc<Clients>> {
            self.clients.lock().clone().ok_or(AdapterError::Closed)
        }

        fn subscribe(&self, clients: &Clients, topic: &str) -> Result<()> {
            let mut subscribed = self.subscribed.lock();
            if subscribed.contains(topic) {
                return Ok(());
            }
            subscribed.insert(topic.to_string());

            let topics: Vec<String> = subscribed.iter().cloned().collect();
            let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
            if let Err(e) = clients.consumer.subscribe(&topics) {
                subscribed.remove(topic);
                return Err(classify(e));
            }
            tracing::info!(topic, group = %self.settings.group_id, "Subscribed to Kafka topic");
            Ok(())
        }

        fn track(&self, message: &BorrowedMessage<'_>) -> InboundMessage {
            let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed);
            self.in_flight.lock().insert(
                receipt,
                Position {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                },
            );

            InboundMessage {
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                headers: read_headers(message),
                receipt,
            }
        }

        /// Offsets to commit for `receipts`: one past the highest per partition.
        fn commit_list(&self, receipts: &[Receipt]) -> Result<Option<TopicPartitionList>> {
            let mut next: HashMap<(String, i32), i64> = HashMap::new();
            {
                let mut in_flight = self.in_flight.lock();
                for receipt in receipts {
                    if let Some(position) = in_flight.remove(receipt) {
                        let offset = next
                            .entry((position.topic, position.partition))
                            .or_insert(position.offset + 1);
                        *offset = (*offset).max(position.offset + 1);
                    }
                }
            }
            if next.is_empty() {
                return Ok(None);
            }

            let mut list = TopicPartitionList::new();
            for ((topic, partition), offset) in next {
                list.add_partition_offset(&topic, partition, Offset::Offset(offset))
                    .map_err(|e| AdapterError::Ack(e.to_string()))?;
            }
            Ok(Some(list))
        }
    }

    impl Broker for KafkaBroker {
        async fn connect(&self) -> Result<()> {
            if self.clients.lock().is_some() {
                return Ok(());
            }
            let clients = self
                .build_clients()
                .map_err(|e| AdapterError::Connection(e.to_string()))?;
            *self.clients.lock() = Some(Arc::new(clients));
            tracing::info!(servers = %self.settings.servers, "Connected to Kafka");
            Ok(())
        }

        async fn ensure_topic(&self, topic: &str) -> Result<()> {
            let clients = self.clients()?;
            let new_topic = NewTopic::new(
                topic,
                self.settings.topic_partitions,
                TopicReplication::Fixed(self.settings.replication_factor),
            );

            let results = clients
                .admin
                .create_topics([&new_topic], &AdminOptions::new())
                .await
                .map_err(|e| AdapterError::Provision {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;

            for result in results {
                match result {
                    Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                    Err((name, code)) => {
                        return Err(AdapterError::Provision {
                            topic: name,
                            reason: code.to_string(),
                        })
                    }
                }
            }
            Ok(())
        }

        async fn receive(&self, topic: &str, max: usize, wait: Duration) -> Result<Vec<InboundMessage>> {
            let clients = self.clients()?;
            self.subscribe(&clients, topic)?;

            let first = match tokio::time::timeout(wait, clients.consumer.recv()).await {
                Err(_) => return Ok(Vec::new()),
                Ok(received) => received.map_err(classify)?,
            };
            let mut batch = vec![self.track(&first)];
            drop(first);

            // Take whatever else is already buffered, without waiting
            while batch.len() < max {
                match clients.consumer.recv().now_or_never() {
                    Some(Ok(message)) => batch.push(self.track(&message)),
                    Some(Err(e)) => {
                        tracing::warn!("Kafka consume error after {} messages: {}", batch.len(), e);
                        break;
                    }
                    None => break,
                }
            }
            Ok(batch)
        }

        async fn ack(&self, _topic: &str, receipts: &[Receipt]) -> Result<()> {
            let clients = self.clients()?;
            let Some(list) = self.commit_list(receipts)? else {
                return Ok(());
            };
            clients
                .consumer
                .commit(&list, CommitMode::Async)
                .map_err(|e| match classify(e) {
                    AdapterError::Fatal(reason) => AdapterError::Fatal(reason),
                    other => AdapterError::Ack(other.to_string()),
                })
        }

        async fn publish(&self, messages: &[OutboundMessage]) -> Result<()> {
            let clients = self.clients()?;

            let deliveries = messages.iter().map(|message| {
                let record = FutureRecord::to(&message.topic)
                    .key(&message.key)
                    .payload(&message.payload)
                    .headers(write_headers(&message.headers));
                clients.producer.send(record, Timeout::After(SEND_TIMEOUT))
            });

            for delivery in futures::future::join_all(deliveries).await {
                delivery.map_err(|(e, _)| AdapterError::Send(e.to_string()))?;
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            let Some(clients) = self.clients.lock().take() else {
                return Ok(());
            };
            clients.consumer.unsubscribe();
            self.subscribed.lock().clear();
            self.in_flight.lock().clear();

            let producer = clients.producer.clone();
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(CLOSE_FLUSH_TIMEOUT)))
                .await
                .map_err(|e| AdapterError::Connection(e.to_string()))?
                .map_err(|e| AdapterError::Send(format!("flush on close: {}", e)))
        }
    }

    fn read_headers(message: &BorrowedMessage<'_>) -> Headers {
        let mut headers = Headers::new();
        if let Some(list) = message.headers() {
            for header in list.iter() {
                if let Some(value) = header.value {
                    headers.insert(header.key.to_string(), value.to_vec());
                }
            }
        }
        headers
    }

    fn write_headers(headers: &Headers) -> OwnedHeaders {
        headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(headers.len()), |owned, (key, value)| {
                owned.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_slice()),
                })
            })
    }

    /// Authentication and authorization failures will not go away by retrying.
    fn classify(error: KafkaError) -> AdapterError {
        match error.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed,
            ) => AdapterError::Fatal(error.to_string()),
            _ => AdapterError::Connection(error.to_string()),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn broker() -> KafkaBroker {
            let mut settings = KafkaSettings::default();
            settings
                .properties
                .insert("socket.timeout.ms".into(), "5000".into());
            KafkaBroker::new(settings)
        }

        #[test]
        fn consumer_commits_manually() {
            let config = broker().consumer_config();
            assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
            assert_eq!(config.get("group.id"), Some("js-executor-group"));
            assert_eq!(config.get("enable.auto.commit"), Some("false"));
            assert_eq!(config.get("socket.timeout.ms"), Some("5000"));
        }

        #[test]
        fn commit_list_keeps_highest_offset_per_partition() {
            let broker = broker();
            {
                let mut in_flight = broker.in_flight.lock();
                for (receipt, partition, offset) in [(1, 0, 10), (2, 0, 12), (3, 1, 4)] {
                    in_flight.insert(
                        receipt,
                        Position {
                            topic: "js_eval.requests".into(),
                            partition,
                            offset,
                        },
                    );
                }
            }

            let list = broker.commit_list(&[1, 2, 3, 99]).unwrap().unwrap();
            let offsets = list.to_topic_map();
            assert_eq!(offsets[&("js_eval.requests".to_string(), 0)], Offset::Offset(13));
            assert_eq!(offsets[&("js_eval.requests".to_string(), 1)], Offset::Offset(5));
            assert!(broker.in_flight.lock().is_empty());
            assert!(broker.commit_list(&[1]).unwrap().is_none());
        }

        #[tokio::test]
        async fn operations_before_connect_are_closed() {
            let broker = broker();
            assert!(matches!(broker.ensure_topic("t").await, Err(AdapterError::Closed)));
            assert!(matches!(
                broker.receive("t", 1, Duration::from_millis(1)).await,
                Err(AdapterError::Closed)
            ));
            assert!(matches!(broker.publish(&[]).await, Err(AdapterError::Closed)));
            assert!(broker.close().await.is_ok());
        }

        #[test]
        fn authorization_failures_are_fatal() {
            let fatal = classify(KafkaError::MessageConsumption(
                RDKafkaErrorCode::TopicAuthorizationFailed,
            ));
            assert!(fatal.is_fatal());

            let transient = classify(KafkaError::MessageConsumption(
                RDKafkaErrorCode::BrokerTransportFailure,
            ));
            assert!(!transient.is_fatal());
        }
    }
}

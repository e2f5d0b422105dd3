//! Broker adapter: wraps `tokio-nsq` behind the small trait surface
//! `app.rs`'s message loop actually needs (spec.md §4.E "Entry contract").
//!
//! `tokio-nsq` is the one dependency this crate reaches for outside the
//! teacher and the rest of the example pack. Nothing in either talks to an
//! NSQ-shaped broker. See `DESIGN.md`.

use std::time::Duration;

use async_trait::async_trait;
use tokio_nsq::{
    NSQChannel, NSQConsumerConfig, NSQConsumerConfigSources, NSQConsumerLookupConfig, NSQProducerConfig, NSQTopic,
};
use tracing::warn;

/// One delivered message. `attempts` is 1-based, matching the broker's own
/// delivery-attempt counter.
#[async_trait]
pub trait Message: Send {
    fn body(&self) -> &[u8];
    fn attempts(&self) -> u32;
    async fn touch(&mut self) -> Result<(), anyhow::Error>;
    async fn finish(&mut self) -> Result<(), anyhow::Error>;
    async fn requeue(&mut self, delay: Duration, backoff: bool) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait Consumer: Send {
    /// Await the next delivery, or `None` once the consumer has been told to
    /// stop accepting new deliveries (spec.md §4.F shutdown).
    async fn next(&mut self) -> Option<Box<dyn Message>>;
}

pub struct NsqMessage(tokio_nsq::NSQMessage);

#[async_trait]
impl Message for NsqMessage {
    fn body(&self) -> &[u8] {
        &self.0.body
    }

    fn attempts(&self) -> u32 {
        self.0.attempt as u32
    }

    async fn touch(&mut self) -> Result<(), anyhow::Error> {
        self.0.touch().await;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), anyhow::Error> {
        self.0.finish().await;
        Ok(())
    }

    async fn requeue(&mut self, delay: Duration, backoff: bool) -> Result<(), anyhow::Error> {
        self.0.requeue(delay, backoff).await;
        Ok(())
    }
}

pub struct NsqConsumer {
    inner: tokio_nsq::NSQConsumer,
}

impl NsqConsumer {
    pub fn new(lookupd_http: &str, topic: &str, channel: &str, max_in_flight: usize) -> Result<Self, anyhow::Error> {
        let topic = NSQTopic::new(topic.to_string()).map_err(|e| anyhow::anyhow!("invalid NSQ topic: {e:?}"))?;
        let channel = NSQChannel::new(channel.to_string()).map_err(|e| anyhow::anyhow!("invalid NSQ channel: {e:?}"))?;

        let sources = NSQConsumerConfigSources::Lookup(
            NSQConsumerLookupConfig::new().set_addresses(vec![lookupd_http.to_string()]),
        );

        let config = NSQConsumerConfig::new(topic, channel)
            .set_max_in_flight(max_in_flight)
            .set_sources(sources);

        Ok(Self { inner: config.build() })
    }
}

#[async_trait]
impl Consumer for NsqConsumer {
    async fn next(&mut self) -> Option<Box<dyn Message>> {
        self.inner.consume_filtered().await.map(|msg| Box::new(NsqMessage(msg)) as Box<dyn Message>)
    }
}

pub struct NsqProducer {
    inner: tokio_nsq::NSQProducer,
}

impl NsqProducer {
    pub fn new(nsqd_tcp_address: &str) -> Self {
        let inner = NSQProducerConfig::new(nsqd_tcp_address.to_string()).build();
        Self { inner }
    }
}

#[async_trait]
impl Producer for NsqProducer {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), anyhow::Error> {
        let target = NSQTopic::new(topic.to_string()).map_err(|e| anyhow::anyhow!("invalid NSQ topic: {e:?}"))?;
        self.inner
            .publish(&target, body)
            .await
            .map_err(|e| anyhow::anyhow!("NSQ publish failed: {e:?}"))
    }
}

impl NsqProducer {
    pub async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            warn!(error = ?e, "error closing NSQ producer");
        }
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// A broker-independent in-memory message, used so `app::process_message`
    /// can be unit-tested without an nsqd instance.
    pub struct FakeMessage {
        pub body: Vec<u8>,
        pub attempts: u32,
        pub touched: Mutex<u32>,
        pub finished: Mutex<bool>,
        pub requeued: Mutex<Option<(Duration, bool)>>,
        pub fail_touch: bool,
    }

    #[async_trait]
    impl Message for FakeMessage {
        fn body(&self) -> &[u8] {
            &self.body
        }

        fn attempts(&self) -> u32 {
            self.attempts
        }

        async fn touch(&mut self) -> Result<(), anyhow::Error> {
            if self.fail_touch {
                return Err(anyhow::anyhow!("touch failed: stream closed"));
            }
            *self.touched.lock().unwrap() += 1;
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), anyhow::Error> {
            *self.finished.lock().unwrap() = true;
            Ok(())
        }

        async fn requeue(&mut self, delay: Duration, backoff: bool) -> Result<(), anyhow::Error> {
            *self.requeued.lock().unwrap() = Some((delay, backoff));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeProducer {
        pub published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Producer for FakeProducer {
        async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), anyhow::Error> {
            self.published.lock().unwrap().push((topic.to_string(), body));
            Ok(())
        }
    }
}

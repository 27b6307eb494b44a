//! In-process, topic-addressed publish/subscribe.
//!
//! Every topic owns a bounded channel and a dedicated dispatcher task:
//! events of one topic are delivered FIFO, each handler running to
//! completion before the next event is taken. Delivery is at-least-once
//! per subscriber, so handlers must be idempotent. Nothing is ordered
//! across topics.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use strum::{Display, EnumIter, IntoEnumIterator};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gordon_common::models::ImagePushedEvent;
use gordon_common::DomainName;

use crate::telemetry::{bump, Counters};
use crate::{Error, ErrorKind};

pub const TOPIC_CAPACITY: usize = 100;
const PUBLISH_DEADLINE: Duration = Duration::from_millis(500);
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum Topic {
    ImagePushed,
    ConfigReload,
    ManualReload,
    ManualDeploy,
    ContainerDeployed,
    ContainerRemoved,
}

#[derive(Debug, Clone)]
pub enum Event {
    ImagePushed(ImagePushedEvent),
    ConfigReload {
        domains: BTreeSet<DomainName>,
    },
    ManualReload,
    ManualDeploy {
        domain: DomainName,
    },
    ContainerDeployed {
        domain: DomainName,
        container_id: String,
    },
    ContainerRemoved {
        domain: DomainName,
        container_id: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::ImagePushed(_) => Topic::ImagePushed,
            Self::ConfigReload { .. } => Topic::ConfigReload,
            Self::ManualReload => Topic::ManualReload,
            Self::ManualDeploy { .. } => Topic::ManualDeploy,
            Self::ContainerDeployed { .. } => Topic::ContainerDeployed,
            Self::ContainerRemoved { .. } => Topic::ContainerRemoved,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

struct TopicChannel {
    sender: mpsc::Sender<Event>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
}

pub struct EventBus {
    topics: HashMap<Topic, TopicChannel>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl EventBus {
    pub fn new(counters: Arc<Counters>) -> Arc<Self> {
        let topics = Topic::iter()
            .map(|topic| {
                let (sender, receiver) = mpsc::channel(TOPIC_CAPACITY);
                (
                    topic,
                    TopicChannel {
                        sender,
                        receiver: Mutex::new(Some(receiver)),
                        handlers: Mutex::new(Vec::new()),
                    },
                )
            })
            .collect();
        Arc::new(Self {
            topics,
            dispatchers: Mutex::new(Vec::new()),
            counters,
        })
    }

    /// Attach a handler to a topic. Handlers must be registered before
    /// [`EventBus::start`].
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        self.topics[&topic]
            .handlers
            .lock()
            .expect("bus handler lock poisoned")
            .push(handler);
    }

    /// Enqueue an event. Blocks the caller up to a short deadline when
    /// the topic buffer is full, then fails with `BusBackpressure`.
    pub async fn publish(&self, event: Event) -> Result<(), Error> {
        let topic = event.topic();
        let sender = &self.topics[&topic].sender;
        match sender.send_timeout(event, PUBLISH_DEADLINE).await {
            Ok(()) => {
                bump(&self.counters.bus_published);
                Ok(())
            }
            Err(err) => {
                bump(&self.counters.bus_backpressure);
                warn!(%topic, "event bus backpressure: {err}");
                Err(Error::from_kind(ErrorKind::BusBackpressure))
            }
        }
    }

    /// Spawn one dispatcher task per topic. On cancellation each
    /// dispatcher drains what is already queued within a bounded grace
    /// period before exiting.
    pub fn start(&self, cancel: CancellationToken) {
        let mut dispatchers = self.dispatchers.lock().expect("bus dispatcher lock poisoned");
        for (topic, channel) in &self.topics {
            let topic = *topic;
            let mut receiver = channel
                .receiver
                .lock()
                .expect("bus receiver lock poisoned")
                .take()
                .expect("bus already started");
            let handlers = channel
                .handlers
                .lock()
                .expect("bus handler lock poisoned")
                .clone();
            let cancel = cancel.clone();

            dispatchers.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        event = receiver.recv() => event,
                        _ = cancel.cancelled() => break,
                    };
                    let Some(event) = event else { break };
                    dispatch(topic, &handlers, event).await;
                }

                // Drain whatever was queued before cancellation.
                let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
                receiver.close();
                while let Ok(Some(event)) =
                    tokio::time::timeout_at(deadline, receiver.recv()).await
                {
                    dispatch(topic, &handlers, event).await;
                }
                debug!(%topic, "dispatcher stopped");
            }));
        }
    }

    /// Wait for all dispatchers to finish their drain.
    pub async fn stop(&self) {
        let dispatchers = std::mem::take(
            &mut *self.dispatchers.lock().expect("bus dispatcher lock poisoned"),
        );
        for dispatcher in dispatchers {
            let _ = dispatcher.await;
        }
    }
}

async fn dispatch(topic: Topic, handlers: &[Arc<dyn EventHandler>], event: Event) {
    for handler in handlers {
        handler.handle(event.clone()).await;
    }
    debug!(%topic, subscribers = handlers.len(), "event delivered");
}

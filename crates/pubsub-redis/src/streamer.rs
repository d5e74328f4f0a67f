//! Consumer of one stream through a consumer group.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backend::{Connector, GroupCreated, StreamConnection, StreamEntry};
use crate::{Error, GroupMembership, ReconnectPolicy, StreamHandler, StreamerConfig};

const CONSUMER_NAME_LEN: usize = 6;

/// A random alphanumeric consumer name.
pub(crate) fn generate_consumer_name() -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(CONSUMER_NAME_LEN)
        .collect()
}

/// Where a [`Streamer`] is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamerState {
    /// Not connected. Initial state, and the state between reconnects.
    Disconnected,

    /// Opening the connection and creating the group.
    Connecting,

    /// Reading new entries.
    Consuming,

    /// Claiming entries abandoned by other consumers.
    Claiming,

    /// Shutdown requested, waiting for the loop to exit.
    ShuttingDown,

    /// Shut down cleanly.
    Stopped,

    /// Gave up after too many consecutive failures.
    Failed {
        /// Consecutive failures.
        attempts: u32,
        /// The last failure.
        last_error: String,
    },
}

impl StreamerState {
    /// Whether no further transitions will happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }

    /// `Ok` for a clean stop, the failure otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReconnectAttemptsExceeded`] for [`StreamerState::Failed`].
    pub fn outcome(&self) -> Result<(), Error> {
        match self {
            Self::Failed {
                attempts,
                last_error,
            } => Err(Error::ReconnectAttemptsExceeded {
                attempts: *attempts,
                last_error: last_error.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Consumes a stream as one member of a consumer group.
///
/// A single supervising task connects, creates the group, then alternates
/// between claiming idle entries of other consumers and reading new ones.
/// Entries are acknowledged once the handler succeeds, and deleted too when
/// the group is [`GroupMembership::Shared`]. Failures are retried with
/// backoff until the policy runs out, after which the streamer settles in
/// [`StreamerState::Failed`].
pub struct Streamer<C: Connector> {
    /// Consumer settings
    config: StreamerConfig,

    /// Name of this consumer within the group
    consumer: String,

    /// Reconnect policy
    policy: ReconnectPolicy,

    /// Connection factory
    connector: Arc<C>,

    /// Current connection, replaced wholesale on reconnect
    connection: Arc<Mutex<Option<C::Connection>>>,

    /// Lifecycle state
    state: Arc<watch::Sender<StreamerState>>,

    /// Stop signal for the supervising task
    cancel: CancellationToken,

    /// Supervising task
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Streamer<C> {
    /// Creates a streamer. Nothing is consumed until [`Streamer::start`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for empty names, a zero block
    /// duration or a policy allowing no attempts.
    pub fn new(config: StreamerConfig, policy: ReconnectPolicy, connector: C) -> Result<Self, Error> {
        config.validate()?;

        if policy.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_reconnect_attempts must be positive".to_owned(),
            ));
        }

        let consumer = config
            .consumer_name
            .clone()
            .unwrap_or_else(generate_consumer_name);

        let (state, _) = watch::channel(StreamerState::Disconnected);

        Ok(Self {
            config,
            consumer,
            policy,
            connector: Arc::new(connector),
            connection: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Name of this consumer within the group.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> StreamerState {
        self.state.borrow().clone()
    }

    /// Receiver of state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<StreamerState> {
        self.state.subscribe()
    }

    /// Starts consuming, delivering entries to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if called more than once, including
    /// after shutdown.
    pub async fn start<H: StreamHandler>(&self, handler: H) -> Result<(), Error> {
        let mut task = self.task.lock().await;
        if task.is_some() || self.cancel.is_cancelled() {
            return Err(Error::AlreadyStarted);
        }

        let worker = Worker {
            stream: self.config.stream.clone(),
            group: self.config.group.clone(),
            consumer: self.consumer.clone(),
            block: self.config.block(),
            membership: self.config.membership,
            policy: self.policy,
            connector: self.connector.clone(),
            connection: self.connection.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            handler,
        };

        let span = info_span!(
            "streamer",
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.consumer
        );
        *task = Some(tokio::spawn(worker.run().instrument(span)));

        Ok(())
    }

    /// Resolves once the streamer has stopped or failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReconnectAttemptsExceeded`] if the streamer gave up.
    pub async fn wait(&self) -> Result<(), Error> {
        let mut changes = self.state.subscribe();
        match changes.wait_for(StreamerState::is_terminal).await {
            Ok(state) => state.outcome(),
            Err(_) => Ok(()),
        }
    }

    /// Stops consuming.
    ///
    /// Lets the current iteration finish, waits for the supervising task to
    /// exit, leaves the group (destroying it when exclusive) and releases the
    /// connection. Takes at most one block duration plus the handler time of
    /// the entries in flight when the backend answers. A failed streamer
    /// stays [`StreamerState::Failed`].
    pub async fn shutdown(&self) {
        let task = self.task.lock().await.take();

        if !self.state().is_terminal() {
            self.state.send_replace(StreamerState::ShuttingDown);
        }
        self.cancel.cancel();

        if let Some(task) = task {
            if let Err(error) = task.await {
                error!(%error, "streamer task panicked");
            }
        }

        let connection = self.connection.lock().await.take();
        if let Some(mut connection) = connection {
            let left = match self.config.membership {
                GroupMembership::Shared => {
                    connection
                        .delete_consumer(&self.config.stream, &self.config.group, &self.consumer)
                        .await
                }
                GroupMembership::Exclusive => {
                    connection
                        .destroy_group(&self.config.stream, &self.config.group)
                        .await
                }
            };

            if let Err(error) = left {
                warn!(consumer = %self.consumer, %error, "failed to leave consumer group");
            }
        }

        self.state.send_if_modified(|state| {
            if matches!(state, StreamerState::Failed { .. } | StreamerState::Stopped) {
                false
            } else {
                *state = StreamerState::Stopped;
                true
            }
        });

        info!(stream = %self.config.stream, consumer = %self.consumer, "streamer stopped");
    }
}

/// State owned by the supervising task.
struct Worker<C: Connector, H> {
    stream: String,
    group: String,
    consumer: String,
    block: Duration,
    membership: GroupMembership,
    policy: ReconnectPolicy,
    connector: Arc<C>,
    connection: Arc<Mutex<Option<C::Connection>>>,
    state: Arc<watch::Sender<StreamerState>>,
    cancel: CancellationToken,
    handler: H,
}

impl<C: Connector, H: StreamHandler> Worker<C, H> {
    async fn run(self) {
        let mut failures = 0;

        while !self.cancel.is_cancelled() {
            self.set(StreamerState::Connecting);

            let error = match self.consume(&mut failures).await {
                Ok(()) => break,
                Err(error) => error,
            };

            self.connection.lock().await.take();
            failures += 1;

            if error.is_fatal() || failures >= self.policy.max_attempts {
                error!(attempts = failures, %error, "giving up on stream");
                self.set(StreamerState::Failed {
                    attempts: failures,
                    last_error: error.to_string(),
                });
                return;
            }

            let delay = self.policy.delay(failures - 1);
            warn!(attempt = failures, ?delay, %error, "stream connection failed, retrying");
            self.set(StreamerState::Disconnected);

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        debug!("consume loop exited");
    }

    /// Connects and consumes until cancelled or until an operation fails.
    async fn consume(&self, failures: &mut u32) -> Result<(), Error> {
        let connection = self.connector.connect().await?;
        let mut slot = self.connection.lock().await;
        let connection = slot.insert(connection);

        match connection.create_group(&self.stream, &self.group).await? {
            GroupCreated::Created => info!("consumer group created"),
            GroupCreated::AlreadyExists => debug!("consumer group already exists"),
        }

        *failures = 0;
        self.set(StreamerState::Consuming);
        info!("consuming stream");

        let mut last_claim: Option<Instant> = None;

        while !self.cancel.is_cancelled() {
            if last_claim.is_none_or(|at| at.elapsed() >= self.block) {
                self.set(StreamerState::Claiming);
                let claimed = connection
                    .autoclaim(&self.stream, &self.group, &self.consumer, self.block)
                    .await?;
                if !claimed.is_empty() {
                    info!(count = claimed.len(), "claimed idle entries");
                }
                self.process(connection, claimed).await?;
                last_claim = Some(Instant::now());
                self.set(StreamerState::Consuming);
            }

            let entries = connection
                .read_group(&self.stream, &self.group, &self.consumer, self.block)
                .await?;
            self.process(connection, entries).await?;
        }

        Ok(())
    }

    async fn process(
        &self,
        connection: &mut C::Connection,
        entries: Vec<StreamEntry>,
    ) -> Result<(), Error> {
        for entry in entries {
            match self.handler.handle(&entry).await {
                Ok(()) => {
                    match self.membership {
                        GroupMembership::Shared => {
                            connection
                                .ack_and_delete(&self.stream, &self.group, &entry.id)
                                .await?;
                        }
                        GroupMembership::Exclusive => {
                            connection.ack(&self.stream, &self.group, &entry.id).await?;
                        }
                    }
                    debug!(id = %entry.id, "entry acknowledged");
                }
                Err(error) => {
                    warn!(id = %entry.id, %error, "handler failed, entry left pending");
                }
            }
        }

        Ok(())
    }

    fn set(&self, state: StreamerState) {
        self.state.send_if_modified(|current| {
            let stopping = *current == StreamerState::ShuttingDown && !state.is_terminal();
            if stopping || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

//! Event stream consumer: follows `/api/events` over HTTP, folds every event
//! into a [`Reconciler`], and reconnects with bounded exponential backoff.
//!
//! Events published while disconnected are lost and the table keeps what it
//! had. After every (re)connect the client reads `/api/status`; if the server
//! has moved on to a session the table does not belong to, the table is
//! rebuilt from `/api/results`.

use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{retry, Error as SseError, Event, EventSource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::reconciler::{ConnectionState, Reconciler};
use crate::types::{ResultRecord, ScanEvent, SessionSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct StreamClient {
    client: Client,
    url: String,
    /// `/api` root next to the events endpoint, when the URL has that shape.
    api_base: Option<String>,
    policy: ReconnectPolicy,
}

impl StreamClient {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ClientError::StreamDisconnected(e.to_string()))?;
        let url = url.into();
        let api_base = url
            .trim_end_matches('/')
            .strip_suffix("/events")
            .map(str::to_string);
        Ok(Self {
            client,
            url,
            api_base,
            policy,
        })
    }

    /// Follow the stream until `cancel` fires or reconnect attempts run out.
    /// `observer` sees the reconciler after every applied event and every
    /// connection change.
    pub async fn run<F>(
        &self,
        reconciler: &mut Reconciler,
        cancel: &CancellationToken,
        mut observer: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&Reconciler, Option<&ScanEvent>),
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let mut opened = false;
            match self
                .stream_once(reconciler, cancel, &mut observer, &mut opened)
                .await
            {
                Ok(()) if cancel.is_cancelled() => return Ok(()),
                Ok(()) => debug!(url = %self.url, "event stream ended by server"),
                Err(e) => warn!(url = %self.url, error = %e, "event stream error"),
            }
            if opened {
                attempt = 0;
            }

            attempt += 1;
            reconciler.set_connection(ConnectionState::Disconnected { attempt });
            observer(&*reconciler, None);
            if let Some(max) = self.policy.max_attempts {
                if attempt > max {
                    return Err(ClientError::RetriesExhausted(max));
                }
            }
            let delay = self.policy.delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to event stream");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection lifetime. `opened` is set once the server accepted
    /// the stream.
    async fn stream_once<F>(
        &self,
        reconciler: &mut Reconciler,
        cancel: &CancellationToken,
        observer: &mut F,
        opened: &mut bool,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&Reconciler, Option<&ScanEvent>),
    {
        let mut source = EventSource::new(self.client.get(&self.url))
            .map_err(|e| ClientError::StreamDisconnected(e.to_string()))?;
        // Reconnects are driven by `ReconnectPolicy`, not the event source.
        source.set_retry_policy(Box::new(retry::Never));

        let result = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                next = source.next() => next,
            };
            match next {
                Some(Ok(Event::Open)) => {
                    *opened = true;
                    info!(url = %self.url, "event stream connected");
                    reconciler.set_connection(ConnectionState::Connected);
                    if let Err(e) = self.resync(reconciler).await {
                        warn!(error = %e, "could not resync with server state");
                    }
                    observer(&*reconciler, None);
                }
                Some(Ok(Event::Message(msg))) => {
                    if msg.data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ScanEvent>(&msg.data) {
                        Ok(event) => {
                            reconciler.apply(event.clone());
                            observer(&*reconciler, Some(&event));
                        }
                        Err(e) => warn!(error = %e, "skipping unparseable event"),
                    }
                }
                Some(Err(SseError::StreamEnded)) | None => break Ok(()),
                Some(Err(SseError::InvalidStatusCode(status, _))) => {
                    break Err(ClientError::BadStatus(status.as_u16()))
                }
                Some(Err(e)) => break Err(ClientError::StreamDisconnected(e.to_string())),
            }
        };
        source.close();
        result
    }

    /// Bring the table in line with the server's current session. A no-op
    /// while the table already belongs to it.
    async fn resync(&self, reconciler: &mut Reconciler) -> Result<(), reqwest::Error> {
        let Some(base) = &self.api_base else {
            return Ok(());
        };
        let snapshot: SessionSnapshot = self
            .client
            .get(format!("{base}/status"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if snapshot.session_id == 0 || reconciler.session() == Some(snapshot.session_id) {
            return Ok(());
        }
        let rows: Vec<ResultRecord> = self
            .client
            .get(format!("{base}/results"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(
            session = snapshot.session_id,
            rows = rows.len(),
            "joined session from server state"
        );
        reconciler.join_session(snapshot.session_id, snapshot.scanning);
        for row in rows {
            reconciler.apply(ScanEvent::Result(row));
        }
        Ok(())
    }
}

//! Cyclic campaign dispatch.
//!
//! Every session with a campaign gets a [`CampaignQueue`] (messages plus
//! the cursor of the next one to send) and a [`Ticker`] that fires once per
//! campaign interval. A tick never waits for the send it starts; instead a
//! per-session in-flight slot makes later ticks skip until the send has
//! finished, so a session never has two sends outstanding, even across a
//! campaign replacement.

use crate::error::{Result, SessionError};
use crate::registry::SessionRegistry;
use crate::ticker::{TickControl, Ticker};
use crate::transport::{Destination, TransportHandle};
use courier_storage::{Campaign, SessionId, SessionState};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// In-memory dispatch queue of one session
#[derive(Debug)]
pub struct CampaignQueue {
    destination: Destination,
    label: String,
    messages: Vec<String>,
    cursor: AtomicUsize,
}

impl CampaignQueue {
    fn from_campaign(campaign: &Campaign) -> Self {
        Self {
            destination: Destination::resolve(&campaign.target),
            label: campaign.label.clone(),
            messages: campaign.messages.clone(),
            cursor: AtomicUsize::new(campaign.clamped_cursor()),
        }
    }

    /// Index of the next message
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Outgoing text for the message at the cursor
    fn current_content(&self) -> String {
        let message = &self.messages[self.cursor() % self.messages.len()];
        format!("{} {}", self.label, message)
    }

    /// Move past the message just sent, wrapping to the start
    fn advance(&self) -> usize {
        let next = (self.cursor() + 1) % self.messages.len();
        self.cursor.store(next, Ordering::SeqCst);
        next
    }
}

struct CampaignRun {
    queue: Arc<CampaignQueue>,
    ticker: Option<Ticker>,
}

/// State shared between the scheduler and its tick and send tasks
struct Dispatcher {
    registry: Arc<SessionRegistry>,
    runs: DashMap<SessionId, CampaignRun>,
    /// Sessions with a send outstanding
    sending: DashSet<SessionId>,
}

impl Dispatcher {
    fn is_current(&self, id: &SessionId, queue: &Arc<CampaignQueue>) -> bool {
        self.runs
            .get(id)
            .map(|run| Arc::ptr_eq(&run.queue, queue))
            .unwrap_or(false)
    }
}

/// Per-session campaign dispatcher
pub struct MessageScheduler {
    inner: Arc<Dispatcher>,
}

impl MessageScheduler {
    /// Create a scheduler reading campaigns from `registry`
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            inner: Arc::new(Dispatcher {
                registry,
                runs: DashMap::new(),
                sending: DashSet::new(),
            }),
        }
    }

    /// Start (or restart) dispatching a session's campaign through `handle`.
    ///
    /// An existing queue is reused so a campaign interrupted by a reconnect
    /// resumes where it left off; otherwise the queue starts at the
    /// persisted cursor.
    pub async fn start(&self, id: &SessionId, handle: Arc<dyn TransportHandle>) -> Result<()> {
        let session = self.inner.registry.get(id).await?;
        let campaign = session.campaign.ok_or_else(|| {
            SessionError::InvalidCampaign(format!("session {} has no campaign", id))
        })?;
        if campaign.messages.is_empty() {
            return Err(SessionError::InvalidCampaign(format!(
                "session {} has an empty message list",
                id
            )));
        }

        let period = campaign.interval();
        let mut run = self.inner.runs.entry(id.clone()).or_insert_with(|| CampaignRun {
            queue: Arc::new(CampaignQueue::from_campaign(&campaign)),
            ticker: None,
        });
        if let Some(previous) = run.ticker.take() {
            previous.cancel();
        }

        let queue = run.queue.clone();
        let dispatcher = self.inner.clone();
        let tick_id = id.clone();
        run.ticker = Some(Ticker::spawn(period, move || {
            tick(
                dispatcher.clone(),
                tick_id.clone(),
                queue.clone(),
                handle.clone(),
            )
        }));

        info!(
            "Message dispatch started for session {} (every {:?}, cursor {}/{})",
            id,
            period,
            run.queue.cursor() + 1,
            run.queue.messages.len()
        );
        Ok(())
    }

    /// Cancel the pending tick but keep the queue for a later resume
    pub fn pause(&self, id: &SessionId) {
        if let Some(mut run) = self.inner.runs.get_mut(id) {
            if let Some(ticker) = run.ticker.take() {
                ticker.cancel();
                debug!("Message dispatch paused for session {}", id);
            }
        }
    }

    /// Cancel the pending tick and discard the queue. A send already in
    /// flight finishes but no longer records its cursor.
    pub fn stop(&self, id: &SessionId) {
        if let Some((_, run)) = self.inner.runs.remove(id) {
            if let Some(ticker) = run.ticker {
                ticker.cancel();
            }
            info!("Message dispatch stopped for session {}", id);
        }
    }

    /// Cancel every ticker, keeping nothing
    pub fn shutdown(&self) {
        for entry in self.inner.runs.iter() {
            if let Some(ticker) = entry.value().ticker.as_ref() {
                ticker.cancel();
            }
        }
        self.inner.runs.clear();
    }

    /// Whether a ticker is currently scheduled for the session
    pub fn is_running(&self, id: &SessionId) -> bool {
        self.inner
            .runs
            .get(id)
            .and_then(|run| run.ticker.as_ref().map(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Whether a send is outstanding for the session
    pub fn is_sending(&self, id: &SessionId) -> bool {
        self.inner.sending.contains(id)
    }

    /// Queue of the session, if one exists
    pub fn queue(&self, id: &SessionId) -> Option<Arc<CampaignQueue>> {
        self.inner.runs.get(id).map(|run| run.queue.clone())
    }
}

async fn tick(
    dispatcher: Arc<Dispatcher>,
    id: SessionId,
    queue: Arc<CampaignQueue>,
    handle: Arc<dyn TransportHandle>,
) -> TickControl {
    match dispatcher.registry.state(&id).await {
        None | Some(SessionState::Stopped) => {
            debug!("Session {} is stopped, dropping its dispatch queue", id);
            // Only drop the run this ticker belongs to
            dispatcher
                .runs
                .remove_if(&id, |_, run| Arc::ptr_eq(&run.queue, &queue));
            return TickControl::Stop;
        }
        Some(SessionState::Connected) => {}
        Some(state) => {
            debug!("Session {} is {}, skipping dispatch", id, state);
            return TickControl::Stop;
        }
    }

    // Claim the slot before anything can suspend
    if !dispatcher.sending.insert(id.clone()) {
        debug!("Send still in flight for session {}, skipping tick", id);
        return TickControl::Continue;
    }

    tokio::spawn(dispatch(dispatcher, id, queue, handle));
    TickControl::Continue
}

async fn dispatch(
    dispatcher: Arc<Dispatcher>,
    id: SessionId,
    queue: Arc<CampaignQueue>,
    handle: Arc<dyn TransportHandle>,
) {
    let position = queue.cursor();
    let content = queue.current_content();

    match handle.send_message(&queue.destination, &content).await {
        Ok(ack) => {
            info!(
                "Message sent for session {} [{}/{}] to {} ({})",
                id,
                position + 1,
                queue.messages.len(),
                queue.destination,
                ack.message_id
            );
            let next = queue.advance();
            if next == 0 {
                info!("All messages sent for session {}, restarting from the first", id);
            }

            // Checked under the registry lock so a replaced campaign keeps its cursor
            let recorded = dispatcher
                .registry
                .update(&id, |session| match session.campaign.as_mut() {
                    Some(campaign)
                        if dispatcher.is_current(&id, &queue) && next < campaign.messages.len() =>
                    {
                        campaign.cursor = next;
                        Ok(true)
                    }
                    _ => Ok(false),
                })
                .await;
            match recorded {
                Ok(true) => {}
                Ok(false) => debug!("Campaign of session {} replaced while sending", id),
                Err(SessionError::NotFound(_)) => {
                    debug!("Session {} removed while sending", id);
                }
                Err(e) => warn!("Failed to record cursor for session {}: {}", id, e),
            }
        }
        Err(e) => {
            error!(
                "Error sending message [{}/{}] for session {}: {}",
                position + 1,
                queue.messages.len(),
                id,
                e
            );
        }
    }

    dispatcher.sending.remove(&id);
}

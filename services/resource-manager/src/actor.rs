//! Actor runtime for agents and resource pools.
//!
//! - `Actor` trait: one message at a time, plus an optional timer deadline
//! - `ActorHandle`: `tell` (non-blocking enqueue) and `ask` (request/reply)
//! - `spawn`: runs the actor loop on the tokio runtime

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of an actor.
///
/// Actors process messages one at a time and own their state. Timers are
/// expressed as a deadline: when [`Actor::next_deadline`] passes without a
/// message arriving, [`Actor::on_deadline`] runs.
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}

    /// The next instant at which the actor wants to be woken.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    /// Called once the deadline has passed. Same return contract as `handle`.
    async fn on_deadline(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        Ok(true)
    }
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    pub actor_id: String,
    pub shutdown: watch::Receiver<bool>,
    pub messages_processed: u64,
    pub last_message_at: Option<Instant>,
    pub state: ActorState,
}

impl ActorContext {
    pub fn new(actor_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            shutdown,
            messages_processed: 0,
            last_message_at: None,
            state: ActorState::Starting,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ActorError {
    /// The message failed; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// The actor cannot continue.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    ActorStopped,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .finish()
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message, waiting for mailbox capacity.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::ActorStopped)
    }

    /// Enqueue a message without waiting.
    pub fn tell(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// Send a message carrying a reply channel and wait for the reply.
    pub async fn ask<R, F>(&self, make: F) -> Result<R, ActorError>
    where
        R: Send + 'static,
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| ActorError::ActorStopped)
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// True once the actor loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns an actor and returns its handle and task.
pub fn spawn<A: Actor>(
    actor: A,
    mailbox_size: usize,
    shutdown: watch::Receiver<bool>,
) -> (ActorHandle<A::Message>, JoinHandle<()>) {
    let actor_id = format!("{}_{}", actor.name(), generate_actor_id());
    let (tx, rx) = mpsc::channel(mailbox_size);

    let loop_id = actor_id.clone();
    let task = tokio::spawn(async move {
        run_actor_loop(actor, rx, shutdown, loop_id).await;
    });

    debug!(actor_id = %actor_id, "spawned actor");
    (ActorHandle { tx, actor_id }, task)
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "actor failed to start");
        return;
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "actor started");

    loop {
        let deadline = actor.next_deadline();
        let outcome = tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "actor received shutdown signal");
                    break;
                }
                continue;
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        ctx.messages_processed += 1;
                        ctx.last_message_at = Some(Instant::now());
                        actor.handle(msg, &mut ctx).await
                    }
                    None => {
                        debug!(actor_id = %actor_id, "actor mailbox closed");
                        break;
                    }
                }
            }

            _ = sleep_until_deadline(deadline) => {
                actor.on_deadline(&mut ctx).await
            }
        };

        match outcome {
            Ok(true) => {}
            Ok(false) => {
                debug!(actor_id = %actor_id, "actor requested stop");
                break;
            }
            Err(ActorError::Permanent(reason)) => {
                error!(actor_id = %actor_id, error = %reason, "actor failed");
                ctx.state = ActorState::Failed;
                break;
            }
            Err(e) => {
                error!(actor_id = %actor_id, error = %e, "actor error");
            }
        }
    }

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    ctx.state = ActorState::Stopped;

    debug!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

//! Gossip engine skeleton
//!
//! Every epidemic protocol runs as two concurrent roles: an active role
//! that initiates one exchange per period against a selected target, and a
//! passive role that blocks on inbound exchanges. The engine owns the
//! lifecycle (`Created -> Started -> Terminated`, each transition exactly
//! once), the cycle clock, and cooperative termination through a
//! [`CancellationToken`] checked at every blocking wait.
//!
//! The cycle clock is monotonic: the next cycle instant advances by exactly
//! one period per completed cycle instead of drifting with wall-clock
//! jitter. Failed cycles retry on a short fixed delay, for up to half a
//! period's worth of attempts once a peer has ever been reached, and
//! indefinitely before that (bootstrap mode).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;

/// Fixed delay between fast retries after a failed cycle.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// What an active cycle accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// An exchange with a target completed.
    Exchanged,
    /// Nothing to do this cycle (e.g. no news to spread).
    Idle,
}

/// One epidemic protocol: the exchange logic the engine drives.
#[async_trait]
pub trait EpidemicProtocol: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Called once at start, before either role launches. A failure aborts
    /// the start.
    fn init(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Run one active exchange against one selected target. `budget` bounds
    /// every network wait: it is the time remaining until the next scheduled
    /// cycle.
    async fn active_cycle(&self, budget: Duration) -> Result<CycleOutcome, EngineError>;

    /// Block for one inbound exchange and serve it. Must return promptly
    /// once `cancel` fires.
    async fn passive_cycle(&self, cancel: CancellationToken) -> Result<(), EngineError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EngineState {
    Created,
    Started,
    Terminated,
}

/// Drives one protocol instance: two spawned roles plus the cycle clock.
pub struct Engine<P: EpidemicProtocol> {
    protocol: Arc<P>,
    period: Mutex<Duration>,
    state: Mutex<EngineState>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: EpidemicProtocol> Engine<P> {
    pub fn new(protocol: Arc<P>, period: Duration) -> Self {
        Self {
            protocol,
            period: Mutex::new(period),
            state: Mutex::new(EngineState::Created),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn period(&self) -> Duration {
        *self.period.lock()
    }

    /// Reconfigure the cycle period. Fails once the engine has started.
    pub fn set_period(&self, period: Duration) -> Result<(), EngineError> {
        if *self.state.lock() != EngineState::Created {
            return Err(EngineError::ConfigFrozen);
        }
        *self.period.lock() = period;
        Ok(())
    }

    /// Launch both roles. Fails if already started or terminated, or if the
    /// protocol's init hook fails.
    pub fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            match *state {
                EngineState::Created => {}
                EngineState::Started => return Err(EngineError::AlreadyStarted),
                EngineState::Terminated => return Err(EngineError::AlreadyTerminated),
            }
            self.protocol.init()?;
            *state = EngineState::Started;
        }

        let period = *self.period.lock();
        info!(protocol = self.protocol.name(), ?period, "starting protocol");

        let active = tokio::spawn(active_loop(
            self.protocol.clone(),
            period,
            self.cancel.clone(),
        ));
        let passive = tokio::spawn(passive_loop(self.protocol.clone(), self.cancel.clone()));
        let mut tasks = self.tasks.lock();
        tasks.push(active);
        tasks.push(passive);
        Ok(())
    }

    /// Signal both roles to stop. Fails if the engine never started.
    pub fn terminate(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        match *state {
            EngineState::Started => {
                *state = EngineState::Terminated;
                info!(protocol = self.protocol.name(), "terminating protocol");
                self.cancel.cancel();
                Ok(())
            }
            EngineState::Created => Err(EngineError::NotStarted),
            EngineState::Terminated => Err(EngineError::AlreadyTerminated),
        }
    }

    /// Wait for both roles to finish after [`Engine::terminate`].
    pub async fn join(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn active_loop<P: EpidemicProtocol>(
    protocol: Arc<P>,
    period: Duration,
    cancel: CancellationToken,
) {
    let retry_delay = RETRY_DELAY.min(period);
    // Fast retries stop after roughly half a period's worth of attempts.
    let max_retries =
        ((period.as_millis() / 2) / retry_delay.as_millis().max(1)).max(1) as u32;

    let mut next_cycle = Instant::now();
    let mut ever_exchanged = false;
    let mut fast_retries = 0u32;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_cycle) => {}
            _ = cancel.cancelled() => break,
        }

        let scheduled_next = next_cycle + period;
        let budget = scheduled_next
            .saturating_duration_since(Instant::now())
            .max(retry_delay);

        tokio::select! {
            outcome = protocol.active_cycle(budget) => match outcome {
                Ok(CycleOutcome::Exchanged) => {
                    ever_exchanged = true;
                    fast_retries = 0;
                    next_cycle = scheduled_next;
                }
                Ok(CycleOutcome::Idle) => {
                    fast_retries = 0;
                    next_cycle = scheduled_next;
                }
                Err(e) => {
                    if !ever_exchanged {
                        // Bootstrap mode: keep hammering until someone answers.
                        debug!(protocol = protocol.name(), error = %e, "cycle failed, bootstrapping");
                        next_cycle = Instant::now() + retry_delay;
                    } else if fast_retries < max_retries {
                        fast_retries += 1;
                        debug!(
                            protocol = protocol.name(),
                            error = %e,
                            attempt = fast_retries,
                            "cycle failed, fast retry"
                        );
                        next_cycle = Instant::now() + retry_delay;
                    } else {
                        warn!(
                            protocol = protocol.name(),
                            error = %e,
                            "cycle failed, falling back to regular cadence"
                        );
                        fast_retries = 0;
                        next_cycle = scheduled_next;
                    }
                }
            },
            _ = cancel.cancelled() => break,
        }

        // A long exchange may overrun its slot; never schedule into the past.
        let now = Instant::now();
        if next_cycle < now {
            next_cycle = now;
        }
    }
    debug!(protocol = protocol.name(), "active role stopped");
}

async fn passive_loop<P: EpidemicProtocol>(protocol: Arc<P>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = protocol.passive_cycle(cancel.clone()) => match result {
                Ok(()) => {}
                Err(EngineError::Net(cloudgossip_net::NetError::Terminated)) => break,
                Err(e) => {
                    // A failed inbound exchange never takes the role down.
                    error!(protocol = protocol.name(), error = %e, "passive exchange failed");
                }
            },
        }
    }
    debug!(protocol = protocol.name(), "passive role stopped");
}

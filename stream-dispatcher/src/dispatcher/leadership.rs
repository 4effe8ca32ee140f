use std::future::Future;

use assignment_coordination::leader_election::LeadershipEvent;
use metrics::gauge;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics_const::LEADER_GAUGE;

/// At most one leadership tenure runs at a time.
#[derive(Debug, Default)]
pub struct LeaderSlot {
    current: Option<(u64, CancellationToken)>,
    generation: u64,
}

impl LeaderSlot {
    /// Claim the slot. `None` when a tenure is already running.
    pub fn promote(&mut self, parent: &CancellationToken) -> Option<(u64, CancellationToken)> {
        if self.current.is_some() {
            return None;
        }
        self.generation += 1;
        let token = parent.child_token();
        self.current = Some((self.generation, token.clone()));
        Some((self.generation, token))
    }

    /// Cancel and clear the running tenure. Returns whether there was one.
    pub fn retire(&mut self) -> bool {
        match self.current.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// A tenure ended on its own. Frees the slot if it still holds it.
    pub fn finished(&mut self, generation: u64) -> bool {
        match &self.current {
            Some((current, _)) if *current == generation => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.current.is_some()
    }
}

/// Start `run` on every promotion and cancel it on retirement, until
/// `cancel` fires or the event channel closes.
pub async fn follow_leadership<F, Fut>(
    mut events: mpsc::Receiver<LeadershipEvent>,
    cancel: CancellationToken,
    run: F,
) where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut slot = LeaderSlot::default();
    let mut tenures: JoinSet<(u64, Result<()>)> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(LeadershipEvent::Promoted) => {
                    let Some((generation, token)) = slot.promote(&cancel) else {
                        tracing::debug!("already leading, ignoring promotion");
                        continue;
                    };
                    tracing::info!(generation, "promoted, starting dispatcher");
                    gauge!(LEADER_GAUGE).set(1.0);
                    let tenure = run(token);
                    tenures.spawn(async move {
                        let outcome = match tokio::spawn(tenure).await {
                            Ok(result) => result,
                            Err(e) => Err(Error::invalid_state(format!("task panicked: {e}"))),
                        };
                        (generation, outcome)
                    });
                }
                Some(LeadershipEvent::Retired) => {
                    if slot.retire() {
                        tracing::info!("retired, stopping dispatcher");
                    }
                    gauge!(LEADER_GAUGE).set(0.0);
                }
                None => break,
            },
            Some(joined) = tenures.join_next(), if !tenures.is_empty() => {
                let Ok((generation, outcome)) = joined else {
                    continue;
                };
                if let Err(e) = outcome {
                    tracing::error!(generation, error = %e, "dispatcher run failed");
                }
                if slot.finished(generation) {
                    gauge!(LEADER_GAUGE).set(0.0);
                }
            }
        }
    }

    slot.retire();
    gauge!(LEADER_GAUGE).set(0.0);
    while tenures.join_next().await.is_some() {}
}

//! Cheap "can this run right now?" gates.
//!
//! A blocked precondition never consumes a retry: the command stays queued and
//! is reconsidered once the reported `retry_in` has elapsed.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{clock::Clock, registry::CommandRegistry};

/// Floor applied to `retry_in` so a misbehaving gate cannot spin the loop.
pub const MIN_PRECONDITION_RETRY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PreconditionResult {
    pub can_run: bool,
    pub retry_in: Duration,
}

impl PreconditionResult {
    pub fn ready() -> Self {
        Self {
            can_run: true,
            retry_in: Duration::ZERO,
        }
    }

    pub fn retry_in(retry_in: Duration) -> Self {
        Self {
            can_run: false,
            retry_in,
        }
    }
}

pub trait Precondition: Send + Sync + fmt::Debug {
    fn can_execute(&self) -> PreconditionResult;
}

/// Switchable gate for a rate-limited provider: once banned, every command
/// declaring it waits until the ban lifts.
#[derive(Debug)]
pub struct BanPrecondition {
    clock: Arc<dyn Clock>,
    banned_until: Mutex<Option<DateTime<Utc>>>,
}

impl BanPrecondition {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            banned_until: Mutex::new(None),
        }
    }

    pub fn ban_for(&self, duration: Duration) {
        let until = self.clock.now() + to_chrono(duration);
        let mut guard = self
            .banned_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(until);
    }

    pub fn lift(&self) {
        let mut guard = self
            .banned_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
    }
}

impl Precondition for BanPrecondition {
    fn can_execute(&self) -> PreconditionResult {
        let until = *self
            .banned_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match until {
            Some(until) => {
                let now = self.clock.now();
                match (until - now).to_std() {
                    Ok(remaining) if !remaining.is_zero() => {
                        PreconditionResult::retry_in(remaining)
                    }
                    _ => PreconditionResult::ready(),
                }
            }
            None => PreconditionResult::ready(),
        }
    }
}

/// Outcome of gating one candidate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GateVerdict {
    Clear,
    Blocked { precondition: String, retry_in: Duration },
    Unknown { precondition: String },
}

/// Dispatcher-side cache of blocked precondition names with their expiry.
#[derive(Debug, Default)]
pub struct PreconditionGate {
    blocked: HashMap<String, DateTime<Utc>>,
}

impl PreconditionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names still blocked at `now`; expired entries are dropped.
    pub fn blocked(&mut self, now: DateTime<Utc>) -> HashSet<String> {
        self.blocked.retain(|_, until| *until > now);
        self.blocked.keys().cloned().collect()
    }

    pub fn evaluate(
        &mut self,
        names: &[String],
        registry: &CommandRegistry,
        now: DateTime<Utc>,
    ) -> GateVerdict {
        for name in names {
            if let Some(until) = self.blocked.get(name)
                && *until > now
            {
                let retry_in = (*until - now).to_std().unwrap_or(MIN_PRECONDITION_RETRY);
                return GateVerdict::Blocked {
                    precondition: name.clone(),
                    retry_in: retry_in.max(MIN_PRECONDITION_RETRY),
                };
            }

            let Some(precondition) = registry.precondition(name) else {
                return GateVerdict::Unknown {
                    precondition: name.clone(),
                };
            };

            let result = precondition.can_execute();
            if !result.can_run {
                let retry_in = result.retry_in.max(MIN_PRECONDITION_RETRY);
                debug!(
                    target: "kura::dispatch",
                    precondition = %name,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "precondition blocked"
                );
                self.blocked.insert(name.clone(), now + to_chrono(retry_in));
                return GateVerdict::Blocked {
                    precondition: name.clone(),
                    retry_in,
                };
            }
        }
        GateVerdict::Clear
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry_with(ban: Arc<BanPrecondition>) -> CommandRegistry {
        CommandRegistry::builder()
            .precondition("AniDbUdpBan", ban)
            .build()
            .expect("registry builds")
    }

    #[test]
    fn ban_blocks_until_it_expires() {
        let clock = ManualClock::default();
        let ban = BanPrecondition::new(Arc::new(clock.clone()));
        assert!(ban.can_execute().can_run);

        ban.ban_for(Duration::from_secs(35));
        let result = ban.can_execute();
        assert!(!result.can_run);
        assert_eq!(result.retry_in, Duration::from_secs(35));

        clock.advance(chrono::Duration::seconds(35));
        assert!(ban.can_execute().can_run);
    }

    #[test]
    fn gate_caches_blocks_with_expiry() {
        let clock = ManualClock::default();
        let ban = Arc::new(BanPrecondition::new(Arc::new(clock.clone())));
        let registry = registry_with(ban.clone());
        let mut gate = PreconditionGate::new();
        let names = vec!["AniDbUdpBan".to_string()];

        assert_eq!(gate.evaluate(&names, &registry, clock.now()), GateVerdict::Clear);

        ban.ban_for(Duration::from_secs(10));
        assert!(matches!(
            gate.evaluate(&names, &registry, clock.now()),
            GateVerdict::Blocked { .. }
        ));
        assert!(gate.blocked(clock.now()).contains("AniDbUdpBan"));

        // Lifting the ban early does not bypass the cached block.
        ban.lift();
        assert!(matches!(
            gate.evaluate(&names, &registry, clock.now()),
            GateVerdict::Blocked { .. }
        ));

        clock.advance(chrono::Duration::seconds(10));
        assert!(gate.blocked(clock.now()).is_empty());
        assert_eq!(gate.evaluate(&names, &registry, clock.now()), GateVerdict::Clear);
    }

    #[test]
    fn unregistered_precondition_is_reported() {
        let registry = CommandRegistry::builder().build().expect("empty registry");
        let mut gate = PreconditionGate::new();
        let verdict = gate.evaluate(&["Gone".to_string()], &registry, Utc::now());
        assert_eq!(
            verdict,
            GateVerdict::Unknown {
                precondition: "Gone".into()
            }
        );
    }
}

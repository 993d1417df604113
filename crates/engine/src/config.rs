//! Engine tunables.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Finalizer token this engine owns on every record.
    pub finalizer: String,
    /// Wait while a parent or sibling is missing or not ready.
    pub dependency_retry: Duration,
    /// Wait after a transient failure.
    pub error_retry: Duration,
    /// Fractional jitter applied to every timed retry, e.g. 0.1 for +-10%.
    pub jitter: f64,
    /// Steady-state re-assert interval for converged records.
    pub resync: Duration,
    /// Poll interval for running replication executions.
    pub execution_poll: Duration,
    pub helm_timeout: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            finalizer: "registries.berth.dev/finalizer".to_string(),
            dependency_retry: Duration::from_secs(30),
            error_retry: Duration::from_secs(30),
            jitter: 0.1,
            resync: Duration::from_secs(300),
            execution_poll: Duration::from_secs(15),
            helm_timeout: Duration::from_secs(300),
            workers: 4,
            queue_capacity: 2048,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl EngineConfig {
    /// Defaults overridden by `BERTH_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |key: &str, dflt: Duration| env_parse::<u64>(key).map(Duration::from_secs).unwrap_or(dflt);
        Self {
            finalizer: std::env::var("BERTH_FINALIZER").ok().filter(|s| !s.trim().is_empty()).unwrap_or(d.finalizer),
            dependency_retry: secs("BERTH_DEPENDENCY_RETRY_SECS", d.dependency_retry),
            error_retry: secs("BERTH_ERROR_RETRY_SECS", d.error_retry),
            jitter: env_parse::<f64>("BERTH_RETRY_JITTER").map(|j| j.clamp(0.0, 0.5)).unwrap_or(d.jitter),
            resync: secs("BERTH_RESYNC_SECS", d.resync),
            execution_poll: secs("BERTH_EXECUTION_POLL_SECS", d.execution_poll),
            helm_timeout: secs("BERTH_HELM_TIMEOUT_SECS", d.helm_timeout),
            workers: env_parse::<usize>("BERTH_WORKERS").filter(|w| *w > 0).unwrap_or(d.workers),
            queue_capacity: env_parse::<usize>("BERTH_QUEUE_CAP").filter(|c| *c > 0).unwrap_or(d.queue_capacity),
        }
    }

    /// `d` spread uniformly over `d * (1 +- jitter)`.
    pub fn jittered(&self, d: Duration) -> Duration {
        if self.jitter <= 0.0 || d.is_zero() {
            return d;
        }
        let f = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        d.mul_f64((1.0 + f).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_band() {
        let c = EngineConfig::default();
        for _ in 0..200 {
            let d = c.jittered(Duration::from_secs(30));
            assert!(d >= Duration::from_secs(27) && d <= Duration::from_secs(33), "{:?}", d);
        }
        let none = EngineConfig { jitter: 0.0, ..EngineConfig::default() };
        assert_eq!(none.jittered(Duration::from_secs(30)), Duration::from_secs(30));
    }
}

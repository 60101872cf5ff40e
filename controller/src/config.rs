use std::collections::BTreeMap;
use std::str::FromStr;

use crate::util::Error;

/// Process-wide configuration, loaded once in `main` via [`Config::from_env`].
///
/// Every field here has a documented environment variable and default.
/// Engine, elector, and supervisor constructors take an already-validated
/// `Config` (or a narrower slice of it) rather than reading the environment
/// themselves, so tests can build them in isolation.
#[derive(Debug, Clone)]
pub struct Config {
    pub watch_namespace: String,
    pub app_selector: String,
    pub rollout_annotation_key: String,
    pub debounce_seconds: u64,
    pub leader_election_enabled: bool,
    pub leader_election_lease_name: String,
    pub leader_election_identity: String,
    pub lease_duration_seconds: u64,
    pub renew_deadline_seconds: u64,
    pub retry_period_seconds: u64,
    pub controller_stop_timeout_seconds: u64,
    pub health_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Config, Error> {
        let cfg = Config {
            watch_namespace: env_or("WATCH_NAMESPACE", "shipshape"),
            app_selector: env_or("APP_SELECTOR", "app=helloworld"),
            rollout_annotation_key: env_or("ROLLOUT_ANNOTATION_KEY", "shipshape.io/restartedAt"),
            debounce_seconds: env_parse_or("DEBOUNCE_SECONDS", 5)?,
            leader_election_enabled: env_parse_or("LEADER_ELECTION_ENABLED", true)?,
            leader_election_lease_name: env_or(
                "LEADER_ELECTION_LEASE_NAME",
                "helloworld-controller-leader",
            ),
            leader_election_identity: resolve_identity(),
            lease_duration_seconds: env_parse_or("LEADER_ELECTION_LEASE_DURATION_SECONDS", 15)?,
            renew_deadline_seconds: env_parse_or("LEADER_ELECTION_RENEW_DEADLINE_SECONDS", 10)?,
            retry_period_seconds: env_parse_or("LEADER_ELECTION_RETRY_PERIOD_SECONDS", 2)?,
            controller_stop_timeout_seconds: env_parse_or(
                "LEADER_ELECTION_CONTROLLER_STOP_TIMEOUT_SECONDS",
                45,
            )?,
            health_port: env_parse_or("HEALTH_PORT", 8080)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.watch_namespace.trim().is_empty() {
            return Err(Error::Config("WATCH_NAMESPACE must not be empty".into()));
        }
        self.selector_clauses()?;
        if self.leader_election_enabled
            && !(self.retry_period_seconds < self.renew_deadline_seconds
                && self.renew_deadline_seconds < self.lease_duration_seconds)
        {
            return Err(Error::Config(format!(
                "leader election timings must satisfy retry_period({}) < renew_deadline({}) < lease_duration({})",
                self.retry_period_seconds, self.renew_deadline_seconds, self.lease_duration_seconds
            )));
        }
        Ok(())
    }

    /// Parses `APP_SELECTOR` into its `k=v` clauses, requiring at least one.
    pub fn selector_clauses(&self) -> Result<BTreeMap<String, String>, Error> {
        parse_selector(&self.app_selector)
    }
}

fn parse_selector(raw: &str) -> Result<BTreeMap<String, String>, Error> {
    let mut clauses = BTreeMap::new();
    for clause in raw.split(',') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let Some((k, v)) = clause.split_once('=') else {
            return Err(Error::Config(format!(
                "APP_SELECTOR clause {clause:?} is not of the form k=v"
            )));
        };
        clauses.insert(k.trim().to_string(), v.trim().to_string());
    }
    if clauses.is_empty() {
        return Err(Error::Config(
            "APP_SELECTOR must contain at least one k=v clause".into(),
        ));
    }
    Ok(clauses)
}

fn resolve_identity() -> String {
    std::env::var("LEADER_ELECTION_IDENTITY")
        .or_else(|_| std::env::var("HOSTNAME"))
        .or_else(|_| std::env::var("POD_NAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: FromStr>(key: &str, default: T) -> Result<T, Error> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{key}={raw:?} is not a valid value"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            watch_namespace: "shipshape".into(),
            app_selector: "app=helloworld".into(),
            rollout_annotation_key: "shipshape.io/restartedAt".into(),
            debounce_seconds: 5,
            leader_election_enabled: true,
            leader_election_lease_name: "helloworld-controller-leader".into(),
            leader_election_identity: "unknown".into(),
            lease_duration_seconds: 15,
            renew_deadline_seconds: 10,
            retry_period_seconds: 2,
            controller_stop_timeout_seconds: 45,
            health_port: 8080,
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn empty_namespace_is_rejected() {
        let mut cfg = base();
        cfg.watch_namespace = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn selector_without_clauses_is_rejected() {
        let mut cfg = base();
        cfg.app_selector = "".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn selector_parses_multiple_clauses() {
        let mut cfg = base();
        cfg.app_selector = "app=helloworld, tier=web".into();
        let clauses = cfg.selector_clauses().unwrap();
        assert_eq!(clauses.get("app").map(String::as_str), Some("helloworld"));
        assert_eq!(clauses.get("tier").map(String::as_str), Some("web"));
    }

    #[test]
    fn timing_invariant_violation_is_rejected() {
        let mut cfg = base();
        cfg.renew_deadline_seconds = cfg.lease_duration_seconds;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn timing_invariant_ignored_when_leader_election_disabled() {
        let mut cfg = base();
        cfg.leader_election_enabled = false;
        cfg.retry_period_seconds = 100;
        cfg.renew_deadline_seconds = 1;
        cfg.lease_duration_seconds = 1;
        assert!(cfg.validate().is_ok());
    }
}

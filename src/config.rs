use std::path::PathBuf;
use std::time::Duration;
use crate::backend;
use crate::error::{Error, Result};
use crate::event::Kinds;

#[derive(Clone, Debug)]
pub struct Config {
    pub capacity:          usize,
    pub kinds:             Kinds,
    pub bootstrap:         bool,
    pub backend:           backend::Kind,
    pub bytecode:          Option<PathBuf>,
    pub batch:             usize,
    pub block_timeout:     Duration,
    pub exit_grace:        Duration,
    pub exit_retain:       usize,
    pub cache_limit:       usize,
    pub threads:           bool,
    pub snapshot_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity:          1024,
            kinds:             Kinds::ALL,
            bootstrap:         true,
            backend:           backend::Kind::Auto,
            bytecode:          None,
            batch:             256,
            block_timeout:     Duration::from_millis(100),
            exit_grace:        Duration::from_secs(1),
            exit_retain:       4096,
            cache_limit:       65536,
            threads:           false,
            snapshot_interval: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(invalid("queue capacity must be at least 1"));
        }

        if self.batch == 0 {
            return Err(invalid("batch size must be at least 1"));
        }

        if self.exit_retain == 0 {
            return Err(invalid("exit retention must be at least 1"));
        }

        if self.cache_limit == 0 {
            return Err(invalid("cache limit must be at least 1"));
        }

        if self.backend == backend::Kind::Ebpf && self.bytecode.is_none() {
            return Err(invalid("ebpf backend requires a bytecode path"));
        }

        if self.snapshot_interval == Some(Duration::ZERO) {
            return Err(invalid("snapshot interval must be non-zero"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::Config(message.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_accept_defaults() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.bootstrap);
        assert_eq!(config.kinds, Kinds::ALL);
    }

    #[test]
    fn should_reject_zero_capacity() {
        let config = Config { capacity: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn should_reject_zero_exit_retention() {
        let config = Config { exit_retain: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn should_require_bytecode_for_ebpf() {
        let mut config = Config { backend: backend::Kind::Ebpf, ..Config::default() };
        assert!(config.validate().is_err());

        config.bytecode = Some("probe.o".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_reject_zero_snapshot_interval() {
        let config = Config { snapshot_interval: Some(Duration::ZERO), ..Config::default() };
        assert!(config.validate().is_err());
    }
}

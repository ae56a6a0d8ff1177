//! Runtime configuration, defaulting to port 12345, one worker thread per
//! available core, and stdout logging, filled in from environment variables
//! and then a small hand-rolled argument scan -- no CLI-parsing crate in the
//! pack is a clean fit for a server this small.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use crate::logging::LogLevel;

const DEFAULT_PORT: u16 = 12345;
const DEFAULT_RESOURCE_ROOT: &str = "./resources";

pub struct Config {
    pub listen_addr: SocketAddrV4,
    pub loopback_only: bool,
    pub thread_count: usize,
    pub resource_root: PathBuf,
    pub use_poll: bool,
    pub log_dir: Option<PathBuf>,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT),
            loopback_only: false,
            thread_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            resource_root: PathBuf::from(DEFAULT_RESOURCE_ROOT),
            use_poll: false,
            log_dir: None,
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    /// Reads `PORT`, `LOOPBACK_ONLY`, `THREAD_COUNT`, `RESOURCE_ROOT`,
    /// `USE_POLL`, `LOG_DIR`, `LOG_LEVEL`, falling back to the defaults
    /// above for anything unset or unparsable.
    pub fn from_env() -> Config {
        let mut cfg = Config::default();

        if let Some(port) = env_parsed::<u16>("PORT") {
            cfg.listen_addr.set_port(port);
        }
        if let Some(flag) = env_bool("LOOPBACK_ONLY") {
            cfg.loopback_only = flag;
        }
        if cfg.loopback_only {
            cfg.listen_addr.set_ip(Ipv4Addr::LOCALHOST);
        }
        if let Some(n) = env_parsed::<usize>("THREAD_COUNT") {
            cfg.thread_count = n;
        }
        if let Ok(root) = std::env::var("RESOURCE_ROOT") {
            cfg.resource_root = PathBuf::from(root);
        }
        if let Some(flag) = env_bool("USE_POLL") {
            cfg.use_poll = flag;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            cfg.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = std::env::var("LOG_LEVEL").ok().and_then(|s| parse_log_level(&s)) {
            cfg.log_level = level;
        }

        cfg
    }

    /// Overrides whatever `from_env` produced with `--flag value` pairs,
    /// the same handful of knobs `from_env` reads. Unrecognised flags are
    /// left for the caller to report; this never panics on bad input.
    pub fn apply_args(&mut self, args: &[String]) {
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args.get(i + 1);
            let mut consumed_value = false;

            match flag {
                "--port" => {
                    if let Some(p) = value.and_then(|v| v.parse().ok()) {
                        self.listen_addr.set_port(p);
                        consumed_value = true;
                    }
                }
                "--loopback-only" => {
                    self.loopback_only = true;
                    self.listen_addr.set_ip(Ipv4Addr::LOCALHOST);
                }
                "--threads" => {
                    if let Some(n) = value.and_then(|v| v.parse().ok()) {
                        self.thread_count = n;
                        consumed_value = true;
                    }
                }
                "--resource-root" => {
                    if let Some(v) = value {
                        self.resource_root = PathBuf::from(v);
                        consumed_value = true;
                    }
                }
                "--use-poll" => self.use_poll = true,
                "--log-dir" => {
                    if let Some(v) = value {
                        self.log_dir = Some(PathBuf::from(v));
                        consumed_value = true;
                    }
                }
                "--log-level" => {
                    if let Some(level) = value.and_then(|v| parse_log_level(v)) {
                        self.log_level = level;
                        consumed_value = true;
                    }
                }
                _ => {}
            }

            i += if consumed_value { 2 } else { 1 };
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
}

fn parse_log_level(s: &str) -> Option<LogLevel> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(LogLevel::Trace),
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warn),
        "error" | "fatal" => Some(LogLevel::Error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_port_and_resource_root() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr.port(), 12345);
        assert_eq!(cfg.resource_root, PathBuf::from("./resources"));
    }

    #[test]
    fn apply_args_overrides_port_and_flags() {
        let mut cfg = Config::default();
        cfg.apply_args(&[
            "--port".to_string(),
            "8080".to_string(),
            "--loopback-only".to_string(),
            "--threads".to_string(),
            "4".to_string(),
        ]);
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert!(cfg.loopback_only);
        assert_eq!(cfg.listen_addr.ip(), &Ipv4Addr::LOCALHOST);
        assert_eq!(cfg.thread_count, 4);
    }
}

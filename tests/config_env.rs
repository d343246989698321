//! Configuration tests that depend on process environment.
//!
//! These mutate `XDG_CONFIG_HOME`, so they run serially.

#![cfg(target_os = "linux")]

use std::env;

use devstack::core::{Config, PullPolicy};
use serial_test::serial;
use tempfile::TempDir;

struct ConfigHome {
    dir: TempDir,
    previous: Option<String>,
}

impl ConfigHome {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let previous = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", dir.path());
        Self { dir, previous }
    }
}

impl Drop for ConfigHome {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => env::set_var("XDG_CONFIG_HOME", value),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }
    }
}

#[test]
#[serial]
fn test_load_without_file_uses_defaults() {
    let home = ConfigHome::new();

    let path = Config::config_path().unwrap();
    assert!(path.starts_with(home.dir.path()));
    assert!(path.ends_with("devstack/config.toml"));

    let config = Config::load().unwrap();
    assert_eq!(config.engine.binary, "docker");
    assert!(config.general.parallel);
}

#[test]
#[serial]
fn test_save_then_load() {
    let _home = ConfigHome::new();

    let mut config = Config::default();
    config.engine.binary = "podman".to_string();
    config.engine.pull = PullPolicy::Always;
    config.general.state_dir = Some("~/devstack-state".to_string());
    config.save().unwrap();

    let loaded = Config::load().unwrap();
    assert_eq!(loaded.engine.binary, "podman");
    assert_eq!(loaded.engine.pull, PullPolicy::Always);
    assert!(loaded.state_dir(None).unwrap().ends_with("devstack-state"));
}

#[test]
#[serial]
fn test_malformed_config_is_an_error() {
    let home = ConfigHome::new();
    let dir = home.dir.path().join("devstack");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.toml"), "[engine\nbinary = ").unwrap();

    assert!(Config::load().is_err());
}

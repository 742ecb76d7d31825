//! The shipped configuration file parses and matches the built-in defaults.

use std::time::Duration;

use acq_shot::config::AppConfig;
use acq_shot::protocol::Vocabulary;

const SHIPPED: &str = include_str!("../config/acq_shot.toml");

#[test]
fn test_shipped_config_parses() {
    let config: AppConfig = toml::from_str(SHIPPED).expect("Failed to parse shipped config");
    config.validate().unwrap();

    assert_eq!(config.application.log_format, "compact");
    assert_eq!(config.network.reply_timeout, Duration::from_secs(2));
    assert_eq!(config.capture.poll_interval, Duration::from_millis(500));
    assert_eq!(config.capture.post, 100_000);
    assert_eq!(config.stream.queue_depth, 64);
    assert!(config.stream.runtime.is_none());
    assert!(config.uuts.is_empty());
}

#[test]
fn test_shipped_firmware_table_matches_defaults() {
    let config: AppConfig = toml::from_str(SHIPPED).unwrap();
    let shipped = &config.firmware;
    let builtin = Vocabulary::default();

    assert_eq!(shipped.version, builtin.version);
    assert_eq!(shipped.prompt_pattern, builtin.prompt_pattern);
    assert_eq!(shipped.arm, builtin.arm);
    assert_eq!(shipped.transient_template, builtin.transient_template);
    assert_eq!(shipped.routing.root_soft, builtin.routing.root_soft);
    assert_eq!(shipped.routing.root_front_panel, builtin.routing.root_front_panel);
    assert_eq!(
        shipped.routing.root_clock_front_panel,
        builtin.routing.root_clock_front_panel
    );
    assert_eq!(shipped.routing.clock_rate_param, builtin.routing.clock_rate_param);
    assert_eq!(shipped.routing.daisy_member, builtin.routing.daisy_member);
    assert_eq!(shipped.states.triggered, builtin.states.triggered);
}

#[test]
fn test_load_from_shipped_path() {
    let config = AppConfig::load_from("config/acq_shot.toml").unwrap();
    assert_eq!(config.application.name, "acq-shot");
}

#[test]
fn test_units_section() {
    let config: AppConfig = toml::from_str(
        r#"
        [[uuts]]
        id = "acq2106_001"

        [[uuts]]
        id = "acq2106_002"
        host = "10.12.196.2"
        control_port = 54220
    "#,
    )
    .unwrap();
    config.validate().unwrap();

    let first = config.uut(&"acq2106_001".into()).endpoint();
    assert_eq!(first.control_addr(), "acq2106_001:4220");
    let second = config.uut(&"acq2106_002".into()).endpoint();
    assert_eq!(second.control_addr(), "10.12.196.2:54220");
    assert_eq!(second.data_addr(), "10.12.196.2:4210");
}

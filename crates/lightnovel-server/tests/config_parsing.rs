use std::{env, fs, time::Duration};

use lightnovel_server::AppConfig;
use lightnovel_server::cache::KeyFamily;
use lightnovel_server::config::loader::load_config;

// Both checks mutate process environment, so they run in one test.
#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("lightnovel.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 9001

[redis]
enabled = false
url = "redis://cache.internal:6379"
timeout_ms = 500

[cache]
key_prefix = "ln-test:"
default_ttl_secs = 120

[cache.ttl]
chapter_detail_secs = 7200

[scheduler]
workers = 3

[realtime]
send_queue_capacity = 32
pong_wait_secs = 20

[logging]
level = "debug"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses, unspecified fields keep their defaults
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.port, 9001);
    assert!(!cfg.redis.enabled);
    assert_eq!(cfg.redis.pool_size, 100);
    assert_eq!(cfg.cache.key_prefix, "ln-test:");
    assert_eq!(cfg.cache.ttl_for(KeyFamily::ChapterDetail), Duration::from_secs(7200));
    assert_eq!(cfg.cache.ttl_for(KeyFamily::NovelDetail), Duration::from_secs(1800));
    assert_eq!(cfg.scheduler.workers, 3);
    assert_eq!(cfg.realtime.send_queue_capacity, 32);
    assert_eq!(cfg.realtime.heartbeat().ping_period, Duration::from_secs(18));
    assert_eq!(cfg.logging.level, "debug");

    // 2) Env override should win over file
    unsafe {
        env::set_var("LIGHTNOVEL__REALTIME__SEND_QUEUE_CAPACITY", "64");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.realtime.send_queue_capacity, 64);
    unsafe {
        env::remove_var("LIGHTNOVEL__REALTIME__SEND_QUEUE_CAPACITY");
    }

    // 3) Invalid values are rejected
    let invalid = r#"
[realtime]
send_queue_capacity = 0
"#;
    fs::write(&path, invalid).expect("write toml");
    let err = load_config(path.to_str()).expect_err("zero queue capacity must fail");
    assert!(err.contains("send_queue_capacity"));
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("absent.toml");
    let cfg = load_config(path.to_str()).expect("defaults load");
    assert_eq!(cfg.server.port, 8080);
    assert_eq!(cfg.cache.key_prefix, "lightnovel:");
}

#[test]
fn serialized_config_loads_back() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("generated.toml");

    let mut cfg = AppConfig::default();
    cfg.server.port = 9100;
    cfg.redis.enabled = false;
    cfg.cache.key_prefix = "ln-gen:".to_string();
    cfg.cache.ttl.search_result_secs = 45;
    cfg.scheduler.workers = 6;
    cfg.realtime.pong_wait_secs = 30;

    let rendered = toml::to_string_pretty(&cfg).expect("render toml");
    assert!(rendered.contains("[cache.ttl]"));
    fs::write(&path, rendered).expect("write toml");

    let loaded = load_config(path.to_str()).expect("generated config loads");
    assert_eq!(loaded.server.port, 9100);
    assert!(!loaded.redis.enabled);
    assert_eq!(loaded.cache.key_prefix, "ln-gen:");
    assert_eq!(loaded.cache.ttl_for(KeyFamily::SearchResult), Duration::from_secs(45));
    assert_eq!(loaded.scheduler.workers, 6);
    assert_eq!(loaded.realtime.heartbeat().ping_period, Duration::from_secs(27));
}

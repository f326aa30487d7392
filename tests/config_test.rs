use std::time::Duration;

use reconcile_rs::Error;
use reconcile_rs::config::{
    Config, ControllerConfig, DEFAULT_CACHE_SYNC_TIMEOUT, DEFAULT_MAX_CONCURRENT_RECONCILES,
};

#[test]
fn toml_fills_defaults_for_missing_fields() {
    let config = ControllerConfig::from_toml(r#"name = "pods""#).unwrap();

    assert_eq!(config, ControllerConfig::named("pods"));
    assert_eq!(
        config.max_concurrent_reconciles,
        DEFAULT_MAX_CONCURRENT_RECONCILES
    );
    assert_eq!(config.cache_sync_timeout(), DEFAULT_CACHE_SYNC_TIMEOUT);
    assert!(config.recover_panic);
    assert!(config.leader_elected);
    assert!(!config.enable_warmup);
}

#[test]
fn toml_overrides_every_field() {
    let config = ControllerConfig::from_toml(
        r#"
        name = "nodes"
        max_concurrent_reconciles = 8
        cache_sync_timeout_ms = 1500
        recover_panic = false
        leader_elected = false
        enable_warmup = true
        "#,
    )
    .unwrap();

    assert_eq!(config.name, "nodes");
    assert_eq!(config.max_concurrent_reconciles, 8);
    assert_eq!(config.cache_sync_timeout(), Duration::from_millis(1500));
    assert!(!config.recover_panic);
    assert!(!config.leader_elected);
    assert!(config.enable_warmup);
}

#[test]
fn toml_rejects_unknown_fields_and_bad_values() {
    assert!(ControllerConfig::from_toml("name = \"x\"\nworkers = 3").is_err());
    assert!(ControllerConfig::from_toml("max_concurrent_reconciles = 3").is_err());
    assert!(ControllerConfig::from_toml("name = \"\"").is_err());
    assert!(ControllerConfig::from_toml("name = \"x\"\nmax_concurrent_reconciles = 0").is_err());
}

#[test]
fn load_reads_file_and_reports_missing_file() {
    let path = std::env::temp_dir().join(format!("reconcile-config-{}.toml", std::process::id()));
    std::fs::write(&path, "name = \"from-file\"\nmax_concurrent_reconciles = 2\n").unwrap();

    let config = ControllerConfig::load(&path).unwrap();
    assert_eq!(config.name, "from-file");
    assert_eq!(config.max_concurrent_reconciles, 2);

    std::fs::remove_file(&path).unwrap();
    assert!(matches!(ControllerConfig::load(&path), Err(Error::Io(_))));
}

// Env vars are process-global; everything touching them lives in one test.
#[test]
fn controller_config_from_env() {
    unsafe {
        std::env::remove_var("RECONCILE_NAME");
    }
    assert!(ControllerConfig::from_env().is_err());

    unsafe {
        std::env::set_var("RECONCILE_NAME", "from-env");
        std::env::set_var("RECONCILE_MAX_CONCURRENT", "4");
        std::env::set_var("RECONCILE_ENABLE_WARMUP", "true");
    }
    let config = ControllerConfig::from_env().unwrap();
    assert_eq!(config.name, "from-env");
    assert_eq!(config.max_concurrent_reconciles, 4);
    assert!(config.enable_warmup);
    assert!(config.recover_panic);

    unsafe {
        std::env::set_var("RECONCILE_MAX_CONCURRENT", "lots");
    }
    assert!(ControllerConfig::from_env().is_err());

    unsafe {
        std::env::remove_var("RECONCILE_NAME");
        std::env::remove_var("RECONCILE_MAX_CONCURRENT");
        std::env::remove_var("RECONCILE_ENABLE_WARMUP");
    }

    let process = Config::from_env().unwrap();
    assert!(!process.log_level.is_empty());
}

//! Configuration loading from YAML files.

use std::io::Write;

use courier_core::CourierConfig;

fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("temp file");
    file.write_all(contents.as_bytes()).expect("write yaml");
    file.flush().expect("flush yaml");
    file
}

#[test]
fn load_without_file_yields_defaults() {
    let config = CourierConfig::load(None).unwrap();
    assert_eq!(config.database.schema, "courier");
    assert_eq!(config.database.pool_size, 10);
    assert!(config.database.auto_provision);
    assert_eq!(config.durability.promotion_interval_ms, 1_000);
    assert_eq!(config.tenancy.default_tenant, "default");
    assert!(!config.tenancy.strict);
}

#[test]
fn yaml_overrides_selected_fields_only() {
    let file = write_yaml(
        r#"
database:
  url: postgres://localhost/app
  schema: app_messaging
  pool_size: 4
durability:
  promotion_interval_ms: 250
  handled_retention_seconds: 60
tenancy:
  strict: true
"#,
    );

    let config = CourierConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.database.url, "postgres://localhost/app");
    assert_eq!(config.database.schema, "app_messaging");
    assert_eq!(config.database.pool_size, 4);
    assert_eq!(config.durability.promotion_interval_ms, 250);
    assert_eq!(config.durability.handled_retention_seconds, 60);
    // untouched fields keep their defaults
    assert_eq!(config.durability.reassignment_interval_ms, 5_000);
    assert_eq!(config.listener.max_concurrent_messages, 10);
    assert!(config.tenancy.strict);
}

#[test]
fn invalid_schema_name_is_rejected_at_load() {
    let file = write_yaml(
        r#"
database:
  schema: "app; DROP TABLE nodes"
"#,
    );
    let err = CourierConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("schema"), "got: {err}");
}

#[test]
fn staleness_below_heartbeat_is_rejected_at_load() {
    let file = write_yaml(
        r#"
durability:
  heartbeat_interval_ms: 5000
  node_staleness_ms: 5000
"#,
    );
    assert!(CourierConfig::load(Some(file.path())).is_err());
}

#[test]
fn node_record_retention_must_cover_staleness() {
    let file = write_yaml(
        r#"
durability:
  node_staleness_ms: 60000
  node_record_retention_seconds: 30
"#,
    );
    assert!(CourierConfig::load(Some(file.path())).is_err());
}

#[test]
fn zero_pool_size_is_rejected() {
    let file = write_yaml(
        r#"
database:
  pool_size: 0
"#,
    );
    assert!(CourierConfig::load(Some(file.path())).is_err());
}

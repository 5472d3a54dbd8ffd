use ace::config::Config;
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn load(contents: &str) -> anyhow::Result<Config> {
    let file = write_config(contents);
    Config::from_file(file.path().to_str().unwrap())
}

#[test]
fn test_empty_file_yields_defaults() {
    let config = load("").unwrap();
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 5000);
    assert_eq!(config.block_rows, 10_000);
    assert_eq!(config.batch_size, 1_000);
    assert_eq!(config.worker_pool_size, 32);
    assert!((config.max_cpu_ratio - 0.6).abs() < f64::EPSILON);
    assert!(!config.auto_repair.enabled);
    assert!(config.schedule.jobs.is_empty());
}

#[test]
fn test_values_override_defaults() {
    let config = load(
        r#"
port = 8443
block_rows = 5000
max_cpu_ratio = 0.25

[tls]
cert_path = "certs/server.crt"
key_path = "certs/server.key"
ca_path = "certs/clients.crt"
"#,
    )
    .unwrap();
    assert_eq!(config.port, 8443);
    assert_eq!(config.block_rows, 5000);
    assert_eq!(config.tls.ca_path, "certs/clients.crt");
}

#[test]
fn test_rejects_port_zero() {
    assert!(load("port = 0").is_err());
}

#[test]
fn test_rejects_bad_cpu_ratio() {
    assert!(load("max_cpu_ratio = 0.0").is_err());
    assert!(load("max_cpu_ratio = 1.5").is_err());
}

#[test]
fn test_auto_repair_requires_cluster_and_intervals() {
    let err = load(
        r#"
[auto_repair]
enabled = true
dbname = "demo"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("cluster_name"));

    let err = load(
        r#"
[auto_repair]
enabled = true
cluster_name = "demo"
dbname = "demo"
poll_interval = "not-a-time"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("poll_interval"));
}

#[test]
fn test_schedule_entry_must_reference_a_job() {
    let err = load(
        r#"
[[schedule.entries]]
job_name = "ghost"
enabled = true
run_frequency = "5m"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn test_schedule_entry_needs_a_trigger() {
    let err = load(
        r#"
[[schedule.jobs]]
name = "nightly"
cluster_name = "demo"
table_name = "public.t"

[[schedule.entries]]
job_name = "nightly"
enabled = true
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("crontab_schedule or run_frequency"));
}

#[test]
fn test_crontab_and_interval_triggers_parse() {
    let config = load(
        r#"
[[schedule.jobs]]
name = "nightly"
cluster_name = "demo"
table_name = "public.t"

[[schedule.entries]]
job_name = "nightly"
enabled = true
crontab_schedule = "0 2 * * *"

[[schedule.jobs]]
name = "frequent"
cluster_name = "demo"
table_name = "public.u"

[[schedule.entries]]
job_name = "frequent"
enabled = false
run_frequency = "1h 30m"
"#,
    )
    .unwrap();
    assert_eq!(config.schedule.jobs.len(), 2);
    assert_eq!(config.schedule.entries.len(), 2);
}

#[test]
fn test_rejects_invalid_crontab() {
    let err = load(
        r#"
[[schedule.jobs]]
name = "bad"
cluster_name = "demo"
table_name = "public.t"

[[schedule.entries]]
job_name = "bad"
enabled = true
crontab_schedule = "not a crontab"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("crontab"));
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(Config::from_file("/definitely/not/here.toml").is_err());
}

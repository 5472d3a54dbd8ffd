use ace::core::scheduler::timeparse::parse_time_string;
use std::time::Duration;

#[test]
fn test_single_units() {
    assert_eq!(parse_time_string("45s").unwrap(), Duration::from_secs(45));
    assert_eq!(parse_time_string("10m").unwrap(), Duration::from_secs(600));
    assert_eq!(parse_time_string("2h").unwrap(), Duration::from_secs(7200));
    assert_eq!(parse_time_string("1d").unwrap(), Duration::from_secs(86_400));
    assert_eq!(parse_time_string("1w").unwrap(), Duration::from_secs(604_800));
}

#[test]
fn test_units_are_additive() {
    assert_eq!(
        parse_time_string("1h 30m").unwrap(),
        Duration::from_secs(5400)
    );
    assert_eq!(
        parse_time_string("1w 2d 3h 4m 5s").unwrap(),
        Duration::from_secs(604_800 + 2 * 86_400 + 3 * 3600 + 4 * 60 + 5)
    );
}

#[test]
fn test_uppercase_units_accepted() {
    assert_eq!(parse_time_string("5M").unwrap(), Duration::from_secs(300));
}

#[test]
fn test_whitespace_is_tolerated() {
    assert_eq!(
        parse_time_string("  2m   10s ").unwrap(),
        Duration::from_secs(130)
    );
}

#[test]
fn test_rejects_empty_and_garbage() {
    assert!(parse_time_string("").is_err());
    assert!(parse_time_string("   ").is_err());
    assert!(parse_time_string("5x").is_err());
    assert!(parse_time_string("m").is_err());
    assert!(parse_time_string("ten minutes").is_err());
}

#[test]
fn test_rejects_zero_interval() {
    assert!(parse_time_string("0s").is_err());
    assert!(parse_time_string("0h 0m").is_err());
}

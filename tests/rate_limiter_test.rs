use std::sync::Arc;
use std::time::Duration;

use reconcile_rs::queue::{
    BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};

#[test]
fn exponential_doubles_per_failure_and_caps() {
    let limiter = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_millis(30));
    let item = "a".to_string();

    assert_eq!(limiter.when(&item), Duration::from_millis(5));
    assert_eq!(limiter.when(&item), Duration::from_millis(10));
    assert_eq!(limiter.when(&item), Duration::from_millis(20));
    assert_eq!(limiter.when(&item), Duration::from_millis(30));
    assert_eq!(limiter.when(&item), Duration::from_millis(30));
    assert_eq!(limiter.num_requeues(&item), 5);
}

#[test]
fn exponential_tracks_items_independently() {
    let limiter = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
    let a = "a".to_string();
    let b = "b".to_string();

    limiter.when(&a);
    limiter.when(&a);
    assert_eq!(limiter.when(&b), Duration::from_millis(5));
    assert_eq!(limiter.num_requeues(&a), 2);
    assert_eq!(limiter.num_requeues(&b), 1);
}

#[test]
fn forget_resets_backoff_and_is_idempotent() {
    let limiter = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
    let item = 7u32;

    limiter.when(&item);
    limiter.when(&item);
    limiter.forget(&item);
    limiter.forget(&item);

    assert_eq!(limiter.num_requeues(&item), 0);
    assert_eq!(limiter.when(&item), Duration::from_millis(5));
}

#[test]
fn exponential_survives_many_failures() {
    let limiter = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
    let item = "hot".to_string();
    let mut last = Duration::ZERO;
    for _ in 0..200 {
        last = limiter.when(&item);
    }
    assert_eq!(last, Duration::from_secs(1000));
}

#[test]
fn bucket_allows_burst_then_spaces_out() {
    let limiter = BucketRateLimiter::new(10, 3);
    let item = "x".to_string();

    for _ in 0..3 {
        assert_eq!(RateLimiter::<String>::when(&limiter, &item), Duration::ZERO);
    }
    let wait = RateLimiter::<String>::when(&limiter, &item);
    assert!(wait > Duration::from_millis(50), "{wait:?}");
    assert!(wait <= Duration::from_millis(100), "{wait:?}");
    assert_eq!(RateLimiter::<String>::num_requeues(&limiter, &item), 0);
}

#[test]
fn bucket_with_zero_rate_still_limits() {
    let limiter = BucketRateLimiter::new(0, 0);
    let item = "x".to_string();

    assert_eq!(RateLimiter::<String>::when(&limiter, &item), Duration::ZERO);
    assert!(RateLimiter::<String>::when(&limiter, &item) > Duration::ZERO);
}

#[test]
fn max_of_picks_longest_delay() {
    let limiter: MaxOfRateLimiter<String> = MaxOfRateLimiter::new(vec![
        Arc::new(ExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        )),
        Arc::new(ExponentialFailureRateLimiter::new(
            Duration::from_millis(40),
            Duration::from_secs(1),
        )),
    ]);
    let item = "a".to_string();

    assert_eq!(limiter.when(&item), Duration::from_millis(40));
    assert_eq!(limiter.when(&item), Duration::from_millis(80));
    assert_eq!(limiter.num_requeues(&item), 2);

    limiter.forget(&item);
    assert_eq!(limiter.num_requeues(&item), 0);
}

#[test]
fn default_limiter_starts_small() {
    let limiter = default_controller_rate_limiter::<String>();
    let item = "a".to_string();

    assert_eq!(limiter.when(&item), Duration::from_millis(5));
    assert_eq!(limiter.when(&item), Duration::from_millis(10));
    limiter.forget(&item);
    assert_eq!(limiter.num_requeues(&item), 0);
}

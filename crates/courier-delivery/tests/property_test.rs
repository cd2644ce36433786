//! Property tests for retry bounds, deduplication and queue transitions.
//!
//! Run against the in-memory store so each case stays cheap.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use courier_core::{
    CoreError, CustomerId, EventType, NewDestination, QueueStatus, Region, ResponseSnapshot,
};
use courier_delivery::{
    retry::{RetryContext, RetryDecision, RetryPolicy, DEFAULT_BACKOFF_SECONDS},
    router::{RouteRequest, Router},
    storage::{mock::MockDeliveryStorage, DeliveryStorage},
    DeliveryError,
};
use courier_testing::{fixtures::new_queue_item, DestinationBuilder, TestClock};
use proptest::prelude::*;
use serde_json::json;

fn unsafe_url() -> impl Strategy<Value = String> {
    prop_oneof![
        (any::<[u8; 3]>()).prop_map(|[b, c, d]| format!("https://10.{b}.{c}.{d}/hook")),
        (any::<[u8; 2]>()).prop_map(|[c, d]| format!("https://169.254.{c}.{d}/latest")),
        (any::<[u8; 3]>()).prop_map(|[b, c, d]| format!("https://127.{b}.{c}.{d}/hook")),
        "[a-z]{1,12}".prop_map(|label| format!("http://{label}.example.com/hook")),
        "[a-z]{1,12}".prop_map(|label| format!("https://{label}.internal/hook")),
        Just("https://[::1]/hook".to_string()),
        Just("https://localhost:8443/hook".to_string()),
    ]
}

fn retryable_error() -> impl Strategy<Value = DeliveryError> {
    prop_oneof![
        (500_u16..600).prop_map(|status| DeliveryError::server_error(status, "boom")),
        Just(DeliveryError::network("connection reset")),
        Just(DeliveryError::timeout(30)),
        proptest::option::of(0_u64..7200)
            .prop_map(|hint| DeliveryError::too_many_requests(hint, "slow down")),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn attempts_never_exceed_retry_budget(
        max_retries in 0_u32..12,
        errors in prop::collection::vec(retryable_error(), 20),
    ) {
        let mut attempts = 0_u32;
        for error in errors {
            attempts += 1;
            let decision = RetryContext::new(attempts, max_retries, error, Utc::now(), RetryPolicy::default())
                .decide_retry();
            if let RetryDecision::GiveUp { retries_exhausted, .. } = decision {
                prop_assert!(retries_exhausted);
                break;
            }
        }
        prop_assert_eq!(attempts, max_retries + 1);
    }

    #[test]
    fn delay_is_at_least_the_scheduled_backoff(
        attempt in 1_u32..20,
        error in retryable_error(),
    ) {
        let failed_at = Utc::now();
        let context = RetryContext::new(attempt, 100, error.clone(), failed_at, RetryPolicy::default());
        let index = usize::try_from(attempt.min(6) - 1).unwrap_or(5);
        let backoff = DEFAULT_BACKOFF_SECONDS[index];

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at, delay } => {
                let expected = backoff.max(error.retry_after_seconds().unwrap_or(0));
                prop_assert_eq!(delay.as_secs(), expected);
                prop_assert_eq!(next_attempt_at, failed_at + ChronoDuration::seconds(expected as i64));
            },
            RetryDecision::GiveUp { .. } => prop_assert!(false, "retryable error within budget gave up"),
        }
    }

    #[test]
    fn client_rejections_never_retry(status in 400_u16..500, attempt in 1_u32..5) {
        prop_assume!(status != 429);
        let context = RetryContext::new(
            attempt,
            10,
            DeliveryError::client_rejected(status, "nope"),
            Utc::now(),
            RetryPolicy::default(),
        );
        let is_final_rejection = matches!(
            context.decide_retry(),
            RetryDecision::GiveUp { retries_exhausted: false, .. }
        );
        prop_assert!(is_final_rejection);
    }

    #[test]
    fn dedup_key_is_stable_and_day_scoped(
        user_id in 1_i64..1_000_000,
        course in "[a-zA-Z0-9:+_-]{1,40}",
        day_offset in 0_i64..3650,
    ) {
        let customer = CustomerId::new();
        let base = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default();
        let day = base + ChronoDuration::days(day_offset);
        let next_day = day + ChronoDuration::days(1);

        let key = Router::dedup_key(customer, user_id, &course, EventType::CourseCompletion, day);
        prop_assert_eq!(
            &key,
            &Router::dedup_key(customer, user_id, &course, EventType::CourseCompletion, day)
        );
        prop_assert_ne!(
            &key,
            &Router::dedup_key(customer, user_id, &course, EventType::CourseEnrollment, day)
        );
        prop_assert_ne!(
            &key,
            &Router::dedup_key(customer, user_id, &course, EventType::CourseCompletion, next_day)
        );
        let day_suffix = day.format("%Y-%m-%d").to_string();
        prop_assert!(key.ends_with(&day_suffix));
    }

    #[test]
    fn repeated_enqueues_create_one_item_per_day(repeats in 1_usize..8, hour in 0_u32..24) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let storage = MockDeliveryStorage::new();
            let destination = DestinationBuilder::new().build();
            storage.add_destination(destination.clone()).await;
            let router = Router::new(Arc::new(storage.clone()), Arc::new(TestClock::new()));

            let occurred_at = NaiveDate::from_ymd_opt(2024, 5, 1)
                .and_then(|d| d.and_hms_opt(hour, 0, 0))
                .map(|t| t.and_utc())
                .unwrap();

            let mut created = 0;
            for _ in 0..repeats {
                let request = RouteRequest {
                    customer_id: destination.customer_id,
                    user_id: 7,
                    course_key: "course-v1:X+Y+Z".to_string(),
                    event_type: EventType::CourseCompletion,
                    region: Region::Us,
                    occurred_at,
                    payload: json!({}),
                };
                if router.enqueue(request).await.is_ok() {
                    created += 1;
                }
            }

            prop_assert_eq!(created, 1);
            prop_assert_eq!(storage.items().await.len(), 1);
            Ok(())
        })?;
    }

    #[test]
    fn unsafe_destination_never_receives_items(url in unsafe_url(), region in prop_oneof![
        Just(Region::Us),
        Just(Region::Eu),
        Just(Region::Other),
    ]) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let storage = MockDeliveryStorage::new();
            let customer = CustomerId::new();
            let new = NewDestination::new(customer, region, url.clone());
            let created = storage.create_destination(&new, Utc::now()).await;
            prop_assert!(matches!(created, Err(CoreError::ConfigurationInvalid(_))), "accepted {}", url);

            let router = Router::new(Arc::new(storage.clone()), Arc::new(TestClock::new()));
            let request = RouteRequest {
                customer_id: customer,
                user_id: 7,
                course_key: "course-v1:X+Y+Z".to_string(),
                event_type: EventType::CourseCompletion,
                region,
                occurred_at: Utc::now(),
                payload: json!({}),
            };
            let not_configured = matches!(router.enqueue(request).await, Err(CoreError::NotConfigured { .. }));
            prop_assert!(not_configured);
            prop_assert!(storage.items().await.is_empty());
            Ok(())
        })?;
    }

    #[test]
    fn terminal_items_reject_every_transition(outcome in 0_u8..3) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let storage = MockDeliveryStorage::new();
            let destination = DestinationBuilder::new().build();
            storage.add_destination(destination.clone()).await;
            let now = Utc::now();
            let item = storage.enqueue(new_queue_item(&destination), now).await.unwrap();
            let attempt = storage.claim(item.id, now).await.unwrap().unwrap().attempt_count;

            let snapshot = ResponseSnapshot::new(200, "ok");
            let applied = match outcome {
                0 => storage.mark_success(item.id, attempt, snapshot.clone(), now).await.unwrap(),
                1 => storage.mark_failed(item.id, attempt, "gave up".into(), None, now).await.unwrap(),
                _ => storage.cancel(item.id, attempt, "gone".into(), now).await.unwrap(),
            };
            prop_assert!(applied);
            let terminal = storage.item(item.id).await.unwrap();

            let later = now + ChronoDuration::hours(1);
            prop_assert!(storage.claim(item.id, later).await.unwrap().is_none());
            prop_assert!(!storage.renew_claim(item.id, attempt, later).await.unwrap());
            prop_assert!(!storage.mark_success(item.id, attempt, snapshot.clone(), later).await.unwrap());
            prop_assert!(!storage.schedule_retry(item.id, attempt, later, "again".into(), None).await.unwrap());
            prop_assert!(!storage.mark_failed(item.id, attempt, "again".into(), None, later).await.unwrap());
            prop_assert!(!storage.cancel(item.id, attempt, "again".into(), later).await.unwrap());
            prop_assert!(!storage.release_rate_limited(item.id, attempt, later).await.unwrap());

            let after = storage.item(item.id).await.unwrap();
            prop_assert_eq!(after.status, terminal.status);
            prop_assert_ne!(after.status, QueueStatus::Processing);
            prop_assert_eq!(after.attempt_count, terminal.attempt_count);
            prop_assert_eq!(after.completed_at, terminal.completed_at);
            Ok(())
        })?;
    }
}

//! Integration tests for bucket, global and sublimit scheduling
//!
//! All tests run with paused Tokio time, so dispatch offsets recorded by the
//! scripted transport are exact.

use std::time::Duration;

use fantasy_core::domain::{RateLimitData, RateLimitScope, RequestMethod};
use fantasy_core::ports::events::RestEvent;
use fantasy_rest::{RejectOnRateLimit, RequestOptions, RestError, RestOptions};
use futures_util::future::join_all;
use serde_json::json;

use crate::common::{self, json_reply, reply, Reply, ScriptedTransport};

const MESSAGES: &str = "/channels/111111111111111111/messages";
const CHANNEL: &str = "/channels/111111111111111111";
const GUILD: &str = "/guilds/222222222222222222";
const INTERACTION: &str = "/interactions/333333333333333333/aW50ZXJhY3Rpb24/callback";

fn exhausted_bucket(reset_after: &str) -> Reply {
    Reply::Now(reply(
        200,
        &[
            ("X-RateLimit-Limit", "1"),
            ("X-RateLimit-Remaining", "0"),
            ("X-RateLimit-Reset-After", reset_after),
        ],
    ))
}

fn rate_limited_events(events: &std::sync::Mutex<Vec<RestEvent>>) -> Vec<RateLimitData> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            RestEvent::RateLimited(data) => Some(data.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_same_bucket_requests_run_in_submission_order() {
    let transport = ScriptedTransport::new();
    for _ in 0..5 {
        transport.script(
            MESSAGES,
            Reply::After(Duration::from_millis(10), reply(200, &[])),
        );
    }
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());

    let requests = (0..5).map(|n| {
        manager.post(
            MESSAGES,
            RequestOptions::default().json(json!({ "n": n })),
        )
    });
    let results = join_all(requests).await;
    assert!(results.iter().all(Result::is_ok));

    let order: Vec<i64> = transport
        .dispatched()
        .iter()
        .map(|d| d.body.as_ref().unwrap()["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    assert_eq!(transport.dispatch_times_ms(), vec![0, 10, 20, 30, 40]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_bucket_waits_for_reset_plus_offset() {
    let transport = ScriptedTransport::new();
    transport.script(MESSAGES, exhausted_bucket("2"));
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());
    let events = common::record_events(&manager);

    let (first, second) = tokio::join!(
        manager.get(MESSAGES, RequestOptions::default()),
        manager.get(MESSAGES, RequestOptions::default()),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(transport.dispatch_times_ms(), vec![0, 2050]);

    let limited = rate_limited_events(&events);
    assert_eq!(limited.len(), 1);
    assert!(!limited[0].global);
    assert_eq!(limited[0].limit, Some(1));
    assert_eq!(limited[0].time_to_reset, Duration::from_millis(2050));
    assert_eq!(limited[0].route, "/channels/:id/messages");
    assert_eq!(limited[0].major_parameter, "111111111111111111");
    assert_eq!(limited[0].hash, "Global(GET:/channels/:id/messages)");
}

#[tokio::test(start_paused = true)]
async fn test_global_budget_delays_other_buckets() {
    let transport = ScriptedTransport::new();
    let manager = common::scripted_manager(
        common::scripted_config()
            .rate_limiting_global_requests_per_second(1)
            .build(),
        transport.clone(),
    );

    let (guild, channel) = tokio::join!(
        manager.get(GUILD, RequestOptions::default()),
        manager.get(CHANNEL, RequestOptions::default()),
    );
    guild.unwrap();
    channel.unwrap();

    let dispatched = transport.dispatched();
    assert_eq!(dispatched[0].route, GUILD);
    assert_eq!(dispatched[1].route, CHANNEL);
    assert_eq!(transport.dispatch_times_ms(), vec![0, 1050]);
}

#[tokio::test(start_paused = true)]
async fn test_global_429_blocks_every_handler() {
    let transport = ScriptedTransport::new();
    transport.script(
        GUILD,
        Reply::Now(json_reply(
            429,
            json!({"message": "You are being rate limited.", "retry_after": 1.0, "global": true}),
            &[
                ("Retry-After", "1"),
                ("X-RateLimit-Global", "true"),
                ("X-RateLimit-Scope", "global"),
            ],
        )),
    );
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());
    let events = common::record_events(&manager);

    let (guild, channel) = tokio::join!(
        manager.get(GUILD, RequestOptions::default()),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.get(CHANNEL, RequestOptions::default()).await
        },
    );
    guild.unwrap();
    channel.unwrap();

    let times = transport.dispatch_times_ms();
    assert_eq!(times[0], 0);
    assert!(times[1..].iter().all(|&t| t >= 1050));
    assert_eq!(&times[1..], &[1100, 1100]);

    let limited = rate_limited_events(&events);
    assert_eq!(limited.len(), 2);
    assert!(limited.iter().all(|d| d.global));
}

#[tokio::test(start_paused = true)]
async fn test_reject_on_rate_limit_routes() {
    let transport = ScriptedTransport::new();
    transport.script(MESSAGES, exhausted_bucket("5"));
    let options = RestOptions::from(common::scripted_config().build())
        .with_reject_on_rate_limit(RejectOnRateLimit::Routes(vec!["/channels".into()]));
    let manager = common::scripted_manager_with(options, transport.clone());

    manager.get(MESSAGES, RequestOptions::default()).await.unwrap();
    let err = manager
        .get(MESSAGES, RequestOptions::default())
        .await
        .unwrap_err();

    match err {
        RestError::RateLimited(err) => {
            assert_eq!(err.name(), "RateLimitError[/channels/:id/messages]");
            assert!(!err.data.global);
            assert_eq!(err.data.time_to_reset, Duration::from_millis(5050));
            assert_eq!(err.data.method, RequestMethod::Get);
        }
        other => panic!("expected a rate limit error, got {other:?}"),
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reject_on_unexpected_429() {
    let transport = ScriptedTransport::new();
    transport.script(
        MESSAGES,
        Reply::Now(reply(429, &[("Retry-After", "2"), ("X-RateLimit-Scope", "shared")])),
    );
    let options = RestOptions::from(common::scripted_config().build())
        .with_reject_on_rate_limit(RejectOnRateLimit::Always);
    let manager = common::scripted_manager_with(options, transport.clone());

    let err = manager
        .get(MESSAGES, RequestOptions::default())
        .await
        .unwrap_err();
    let RestError::RateLimited(err) = err else {
        panic!("expected a rate limit error");
    };
    assert_eq!(err.data.retry_after, Duration::from_millis(2050));
    assert_eq!(err.data.sublimit_timeout, Duration::from_millis(2050));
    assert_eq!(err.data.scope, RateLimitScope::Shared);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_429_is_retried_after_retry_after() {
    let transport = ScriptedTransport::new();
    transport.script(MESSAGES, Reply::Now(reply(429, &[("Retry-After", "1")])));
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());

    manager.get(MESSAGES, RequestOptions::default()).await.unwrap();
    assert_eq!(transport.dispatch_times_ms(), vec![0, 1050]);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_retries_bound_429_loops() {
    let transport = ScriptedTransport::new();
    for _ in 0..2 {
        transport.script(MESSAGES, Reply::Now(reply(429, &[("Retry-After", "0.5")])));
    }
    let manager = common::scripted_manager(
        common::scripted_config()
            .rate_limiting_rate_limit_retries(Some(1))
            .build(),
        transport.clone(),
    );

    let err = manager
        .get(MESSAGES, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RestError::RateLimited(_)));
    assert_eq!(transport.dispatch_times_ms(), vec![0, 550]);
}

#[tokio::test(start_paused = true)]
async fn test_sublimit_does_not_block_primary_queue() {
    let transport = ScriptedTransport::new();
    transport.script(CHANNEL, Reply::Now(reply(429, &[("Retry-After", "5")])));
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());

    let (rename, fetch, topic) = tokio::join!(
        manager.patch(CHANNEL, RequestOptions::default().json(json!({"name": "renamed"}))),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.get(CHANNEL, RequestOptions::default()).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            manager
                .patch(CHANNEL, RequestOptions::default().json(json!({"topic": "news"})))
                .await
        },
    );
    rename.unwrap();
    fetch.unwrap();
    topic.unwrap();

    let dispatched = transport.dispatched();
    let summary: Vec<(RequestMethod, u128)> = dispatched
        .iter()
        .map(|d| (d.method, d.at.as_millis()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (RequestMethod::Patch, 0),
            (RequestMethod::Get, 10),
            (RequestMethod::Patch, 5050),
            (RequestMethod::Patch, 5050),
        ]
    );
    assert_eq!(dispatched[2].body, Some(json!({"name": "renamed"})));
    assert_eq!(dispatched[3].body, Some(json!({"topic": "news"})));
}

#[tokio::test(start_paused = true)]
async fn test_bucket_hash_update_routes_next_request() {
    let transport = ScriptedTransport::new();
    for _ in 0..2 {
        transport.script(
            "/gateway/bot",
            Reply::Now(reply(200, &[("X-RateLimit-Bucket", "abc")])),
        );
    }
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());

    manager
        .get("/gateway/bot", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(
        manager.bucket_hash(RequestMethod::Get, "/gateway/bot").as_deref(),
        Some("abc")
    );

    manager
        .get("/gateway/bot", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(
        manager.handler_ids(),
        vec![
            "Global(GET:/gateway/bot):global".to_string(),
            "abc:global".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_burst_routes_are_not_queued() {
    let transport = ScriptedTransport::new();
    for _ in 0..2 {
        transport.script(
            INTERACTION,
            Reply::After(Duration::from_millis(100), reply(204, &[])),
        );
    }
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());

    let (a, b) = tokio::join!(
        manager.post(INTERACTION, RequestOptions::default().json(json!({"type": 1}))),
        manager.post(INTERACTION, RequestOptions::default().json(json!({"type": 4}))),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(transport.dispatch_times_ms(), vec![0, 0]);
    assert_eq!(
        manager.handler_ids(),
        vec!["Global(POST:/interactions/:id/:token/callback):burst".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_burst_429_is_retried() {
    let transport = ScriptedTransport::new();
    transport.script(INTERACTION, Reply::Now(reply(429, &[("Retry-After", "1")])));
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());

    manager
        .post(INTERACTION, RequestOptions::default().json(json!({"type": 1})))
        .await
        .unwrap();
    assert_eq!(transport.dispatch_times_ms(), vec![0, 1050]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_request_warning_interval() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.script(
            GUILD,
            Reply::Now(json_reply(403, json!({"code": 50013, "message": "Missing Permissions"}), &[])),
        );
    }
    let manager = common::scripted_manager(
        common::scripted_config()
            .rate_limiting_invalid_request_warning_interval(2)
            .build(),
        transport.clone(),
    );
    let events = common::record_events(&manager);

    for _ in 0..3 {
        let err = manager
            .get(GUILD, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::Api(ref api) if api.status == 403));
    }

    let warnings: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            RestEvent::InvalidRequestWarning(warning) => Some(*warning),
            _ => None,
        })
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].count, 2);
    assert_eq!(warnings[0].remaining_time, Duration::from_secs(600));
}

#[tokio::test(start_paused = true)]
async fn test_response_events_describe_each_attempt() {
    let transport = ScriptedTransport::new();
    transport.script(MESSAGES, Reply::Now(reply(500, &[])));
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());
    let events = common::record_events(&manager);

    manager
        .post(MESSAGES, RequestOptions::default().json(json!({"content": "hi"})))
        .await
        .unwrap();

    let responses: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            RestEvent::Response(response) => Some(response.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(responses.len(), 2);
    assert_eq!((responses[0].status, responses[0].retries), (500, 0));
    assert_eq!((responses[1].status, responses[1].retries), (204, 1));
    assert_eq!(responses[1].method, RequestMethod::Post);
    assert_eq!(responses[1].path, MESSAGES);
    assert_eq!(responses[1].route, "/channels/:id/messages");
    assert_eq!(responses[1].body.json, Some(json!({"content": "hi"})));
}

#[tokio::test(start_paused = true)]
async fn test_huge_retry_after_is_clamped() {
    let transport = ScriptedTransport::new();
    transport.script(GUILD, Reply::Now(reply(429, &[("Retry-After", "1e20")])));
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());

    manager.get(GUILD, RequestOptions::default()).await.unwrap();
    assert_eq!(transport.dispatch_times_ms(), vec![0, 86_400_050]);
}

#[tokio::test(start_paused = true)]
async fn test_huge_reset_after_is_clamped() {
    let transport = ScriptedTransport::new();
    transport.script(
        GUILD,
        Reply::Now(reply(
            200,
            &[("X-RateLimit-Remaining", "0"), ("X-RateLimit-Reset-After", "1e20")],
        )),
    );
    let manager = common::scripted_manager(common::scripted_config().build(), transport.clone());

    manager.get(GUILD, RequestOptions::default()).await.unwrap();
    manager.get(GUILD, RequestOptions::default()).await.unwrap();
    assert_eq!(transport.dispatch_times_ms(), vec![0, 86_400_050]);
}

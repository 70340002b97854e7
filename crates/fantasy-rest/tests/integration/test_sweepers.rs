//! Integration tests for the periodic hash and handler sweepers

use std::time::Duration;

use fantasy_core::config::ConfigBuilder;
use fantasy_core::domain::RequestMethod;
use fantasy_core::ports::events::{RestEvent, SweptHash};
use fantasy_rest::{RequestOptions, RestError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::common::{self, reply, Reply, ScriptedTransport};

const GATEWAY_BOT: &str = "/gateway/bot";
const MESSAGES: &str = "/channels/111111111111111111/messages";

fn sweeping_config() -> ConfigBuilder {
    common::scripted_config()
        .sweepers_hash_sweep_interval_ms(1000)
        .sweepers_hash_lifetime_ms(500)
        .sweepers_handler_sweep_interval_ms(1000)
}

#[tokio::test(start_paused = true)]
async fn test_stale_hashes_and_idle_handlers_are_swept() {
    let transport = ScriptedTransport::new();
    transport.script(
        GATEWAY_BOT,
        Reply::Now(reply(200, &[("X-RateLimit-Bucket", "abc")])),
    );
    let manager = common::scripted_manager(sweeping_config().build(), transport.clone());
    let events = common::record_events(&manager);

    manager
        .get(GATEWAY_BOT, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(
        manager.bucket_hash(RequestMethod::Get, GATEWAY_BOT).as_deref(),
        Some("abc")
    );

    sleep(Duration::from_millis(1100)).await;

    assert_eq!(manager.bucket_hash(RequestMethod::Get, GATEWAY_BOT), None);
    assert!(manager.handler_ids().is_empty());

    let events = events.lock().unwrap();
    assert!(events.contains(&RestEvent::HashSweep(vec![SweptHash {
        key: "GET:/gateway/bot".into(),
        hash: "abc".into(),
    }])));
    assert!(events.contains(&RestEvent::HandlerSweep(vec![
        "Global(GET:/gateway/bot):global".into()
    ])));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_handler_survives_until_reset() {
    let transport = ScriptedTransport::new();
    transport.script(
        MESSAGES,
        Reply::Now(reply(
            200,
            &[("X-RateLimit-Remaining", "0"), ("X-RateLimit-Reset-After", "5")],
        )),
    );
    let manager = common::scripted_manager(sweeping_config().build(), transport.clone());

    manager.get(MESSAGES, RequestOptions::default()).await.unwrap();

    sleep(Duration::from_millis(1100)).await;
    assert_eq!(
        manager.handler_ids(),
        vec!["Global(GET:/channels/:id/messages):111111111111111111".to_string()]
    );

    sleep(Duration::from_millis(5000)).await;
    assert!(manager.handler_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_busy_handler_is_kept() {
    let transport = ScriptedTransport::new();
    transport.script(MESSAGES, Reply::Hang);
    let manager = common::scripted_manager(sweeping_config().build(), transport.clone());
    let signal = CancellationToken::new();

    let (result, ids) = tokio::join!(
        manager.get(MESSAGES, RequestOptions::default().signal(signal.clone())),
        async {
            sleep(Duration::from_millis(1100)).await;
            let ids = manager.handler_ids();
            signal.cancel();
            ids
        },
    );

    assert!(matches!(result, Err(RestError::Cancelled)));
    assert_eq!(ids.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cleared_handler_sweeper_stops_sweeping() {
    let transport = ScriptedTransport::new();
    let manager = common::scripted_manager(sweeping_config().build(), transport.clone());
    let events = common::record_events(&manager);

    manager.get(MESSAGES, RequestOptions::default()).await.unwrap();
    manager.clear_handler_sweeper();

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(manager.handler_ids().len(), 1);

    let events = events.lock().unwrap();
    assert!(!events
        .iter()
        .any(|event| matches!(event, RestEvent::HandlerSweep(_))));
    assert!(events
        .iter()
        .any(|event| matches!(event, RestEvent::HashSweep(_))));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_both_sweepers() {
    let transport = ScriptedTransport::new();
    transport.script(
        GATEWAY_BOT,
        Reply::Now(reply(200, &[("X-RateLimit-Bucket", "abc")])),
    );
    let manager = common::scripted_manager(sweeping_config().build(), transport.clone());

    manager
        .get(GATEWAY_BOT, RequestOptions::default())
        .await
        .unwrap();
    manager.shutdown();

    sleep(Duration::from_millis(3000)).await;
    assert_eq!(
        manager.bucket_hash(RequestMethod::Get, GATEWAY_BOT).as_deref(),
        Some("abc")
    );
    assert_eq!(manager.handler_ids().len(), 1);
}

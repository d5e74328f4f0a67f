//! Checks against a real Redis server. Set `REDIS_URL` to run them.

use std::time::Duration;

use relay_common::StreamMessage;
use relay_pubsub::Subscriber;
use relay_pubsub::conformance::TestHandler;
use relay_pubsub_redis::{
    Connector, GroupCreated, RedisConfig, RedisConnector, RedisSubscriber, RedisSubscriberConfig,
    StreamConnection, StreamerState,
};
use serial_test::serial;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn redis_config() -> Option<RedisConfig> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL is not set, skipping");
        return None;
    };

    Some(RedisConfig {
        url,
        ..RedisConfig::default()
    })
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", fastrand::u32(..))
}

#[tokio::test]
#[serial]
async fn test_consumer_group_commands() {
    let Some(config) = redis_config() else {
        return;
    };
    let stream = unique("relay-test");
    let connector = RedisConnector::new(&config, Duration::from_secs(2)).unwrap();
    let mut connection = connector.connect().await.unwrap();

    assert_eq!(
        connection.create_group(&stream, "g").await.unwrap(),
        GroupCreated::Created
    );
    assert_eq!(
        connection.create_group(&stream, "g").await.unwrap(),
        GroupCreated::AlreadyExists
    );

    connection
        .add(&stream, &[("payload", "m1")], None)
        .await
        .unwrap();

    let entries = connection
        .read_group(&stream, "g", "a", Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload(), Some("m1"));

    assert!(
        connection
            .autoclaim(&stream, "g", "b", Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty()
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    let claimed = connection
        .autoclaim(&stream, "g", "b", Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    connection
        .ack_and_delete(&stream, "g", &claimed[0].id)
        .await
        .unwrap();
    assert!(
        connection
            .read_group(&stream, "g", "a", Duration::from_millis(50))
            .await
            .unwrap()
            .is_empty()
    );

    connection.delete_consumer(&stream, "g", "a").await.unwrap();
    connection.delete_consumer(&stream, "g", "b").await.unwrap();
    connection.destroy_group(&stream, "g").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_private_groups_keep_entries_for_each_other() {
    let Some(config) = redis_config() else {
        return;
    };
    let stream = unique("relay-fanout");
    let connector = RedisConnector::new(&config, Duration::from_secs(2)).unwrap();
    let mut connection = connector.connect().await.unwrap();

    connection.create_group(&stream, "a").await.unwrap();
    connection.create_group(&stream, "b").await.unwrap();
    connection
        .add(&stream, &[("payload", "m1")], Some(100))
        .await
        .unwrap();

    for group in ["a", "b"] {
        let entries = connection
            .read_group(&stream, group, "c", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1, "group {group} missed the entry");
        connection.ack(&stream, group, &entries[0].id).await.unwrap();
    }

    connection.destroy_group(&stream, "a").await.unwrap();
    connection.destroy_group(&stream, "b").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_subscriber_round_trip() {
    let Some(redis) = redis_config() else {
        return;
    };
    let config = RedisSubscriberConfig {
        redis,
        stream: unique("relay-broadcast"),
        block_ms: 200,
        ..RedisSubscriberConfig::default()
    };
    let handler = TestHandler::new();
    let subscriber = RedisSubscriber::new(&config, handler.clone()).unwrap();
    let (errors, _errors_rx) = mpsc::channel(2);

    subscriber.start(errors).await.unwrap();
    for streamer in [subscriber.ingress(), subscriber.fanout()] {
        let mut changes = streamer.state_changes();
        timeout(
            Duration::from_secs(5),
            changes.wait_for(|state| *state == StreamerState::Consuming),
        )
        .await
        .expect("streamer is not consuming")
        .unwrap();
    }
    subscriber.subscribe("room").await.unwrap();

    subscriber
        .broadcast(&StreamMessage::new("room", "\"hi\""))
        .await
        .unwrap();

    let message = handler.receive().await.expect("broadcast not delivered");
    assert_eq!(message.data, "\"hi\"");

    subscriber.shutdown().await.unwrap();
    assert_eq!(subscriber.ingress().state(), StreamerState::Stopped);
    assert_eq!(subscriber.fanout().state(), StreamerState::Stopped);
}

use async_trait::async_trait;
use parking_lot::Mutex;
use parse_server_rs::auth::Auth;
use parse_server_rs::database::FindOptions;
use parse_server_rs::types::JsonObject;
use parse_server_rs::{Config, ParseError, PushController, PushQueue};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;

use test_utils::shared::{obj, setup_builder, test_options};

#[derive(Default)]
struct CollectingQueue {
    enqueued: Mutex<Vec<(JsonObject, JsonObject, String)>>,
}

#[async_trait]
impl PushQueue for CollectingQueue {
    async fn enqueue(
        &self,
        body: &JsonObject,
        query: &JsonObject,
        push_status_id: &str,
        _auth: &Auth,
    ) -> Result<(), ParseError> {
        self.enqueued
            .lock()
            .push((body.clone(), query.clone(), push_status_id.to_string()));
        Ok(())
    }
}

async fn setup() -> (Arc<Config>, Arc<CollectingQueue>) {
    let queue = Arc::new(CollectingQueue::default());
    let config = setup_builder(test_options())
        .push_queue(queue.clone())
        .build()
        .unwrap();
    for (id, token, device_type, badge) in [
        ("i1", Some("t1"), "ios", 1),
        ("i2", None, "ios", 1),
        ("i3", Some("t3"), "android", 5),
    ] {
        let mut installation = obj(json!({
            "objectId": id,
            "installationId": id,
            "deviceType": device_type,
            "badge": badge
        }));
        if let Some(token) = token {
            installation.insert("deviceToken".to_string(), json!(token));
        }
        config
            .database
            .create("_Installation", installation, None)
            .await
            .unwrap();
    }
    (config, queue)
}

async fn badges(config: &Config) -> Vec<(String, Value)> {
    let mut rows: Vec<(String, Value)> = config
        .database
        .find("_Installation", JsonObject::new(), &FindOptions::master())
        .await
        .unwrap()
        .into_iter()
        .map(|row| {
            (
                row["objectId"].as_str().unwrap_or_default().to_string(),
                row.get("badge").cloned().unwrap_or(Value::Null),
            )
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

async fn push_status(config: &Config, id: &str) -> JsonObject {
    let mut rows = config
        .database
        .find(
            "_PushStatus",
            obj(json!({"objectId": id})),
            &FindOptions::master(),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    rows.remove(0)
}

#[tokio::test]
async fn test_badge_increment_only_reaches_devices_with_tokens() {
    let (config, queue) = setup().await;
    let controller = PushController::new(config.clone());

    let id = controller
        .send_push(
            obj(json!({"data": {"alert": "hi", "badge": "Increment"}})),
            obj(json!({"deviceType": "ios"})),
            &Auth::master(),
        )
        .await
        .unwrap();

    assert_eq!(
        badges(&config).await,
        vec![
            ("i1".to_string(), json!(2)),
            ("i2".to_string(), json!(1)),
            ("i3".to_string(), json!(5)),
        ]
    );

    let enqueued = queue.enqueued.lock().clone();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].1, obj(json!({"deviceType": "ios"})));
    assert_eq!(enqueued[0].2, id);

    let status = push_status(&config, &id).await;
    assert_eq!(status["status"], json!("pending"));
    assert_eq!(status["query"], json!(r#"{"deviceType":"ios"}"#));
    assert_eq!(status["payload"], json!(r#"{"alert":"hi","badge":"Increment"}"#));
}

#[tokio::test]
async fn test_badge_set_applies_to_every_matching_device() {
    let (config, _queue) = setup().await;
    let controller = PushController::new(config.clone());

    controller
        .send_push(
            obj(json!({"data": {"alert": "reset", "badge": 7}})),
            JsonObject::new(),
            &Auth::master(),
        )
        .await
        .unwrap();

    assert_eq!(
        badges(&config).await,
        vec![
            ("i1".to_string(), json!(7)),
            ("i2".to_string(), json!(1)),
            ("i3".to_string(), json!(7)),
        ]
    );
}

#[tokio::test]
async fn test_invalid_badge_is_rejected_before_anything_is_written() {
    let (config, queue) = setup().await;
    let controller = PushController::new(config.clone());

    let err = controller
        .send_push(
            obj(json!({"data": {"badge": "lots"}})),
            JsonObject::new(),
            &Auth::master(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), 115);
    assert!(queue.enqueued.lock().is_empty());

    let statuses = config
        .database
        .find("_PushStatus", JsonObject::new(), &FindOptions::master())
        .await
        .unwrap();
    assert!(statuses.is_empty());
}

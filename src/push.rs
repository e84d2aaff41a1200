// src/push.rs
//
// Push enqueue: validates the push body, records a `_PushStatus` row, applies
// badge updates to the targeted installations and hands the push to a queue.
// Delivery itself belongs to whatever sits behind `PushQueue`.

use crate::auth::Auth;
use crate::config::Config;
use crate::database::UpdateOptions;
use crate::error::ParseError;
use crate::rest_query::{RestOptions, RestQuery};
use crate::rest_write::RestWrite;
use crate::types::{JsonObject, ParseDate};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::{Arc, OnceLock};

/// Hands validated pushes to the delivery side.
#[async_trait]
pub trait PushQueue: Send + Sync {
    async fn enqueue(
        &self,
        body: &JsonObject,
        query: &JsonObject,
        push_status_id: &str,
        auth: &Auth,
    ) -> Result<(), ParseError>;
}

fn offset_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(.+)([+-])\d\d:\d\d$").expect("valid regex"))
}

/// A badge change to apply to every targeted installation.
#[derive(Debug, Clone, PartialEq)]
enum BadgeUpdate {
    Increment(Value),
    Set(Value),
}

impl BadgeUpdate {
    fn from_value(badge: &Value) -> Result<Option<Self>, ParseError> {
        if !crate::types::is_truthy(Some(badge)) {
            return Ok(None);
        }
        let invalid = || {
            ParseError::PushMisconfigured(
                "Invalid value for badge, expected number or 'Increment' or {increment: number}"
                    .to_string(),
            )
        };
        match badge {
            Value::String(s) if s.eq_ignore_ascii_case("increment") => {
                Ok(Some(BadgeUpdate::Increment(json!(1))))
            }
            Value::Object(op) => {
                let is_increment = op
                    .get("__op")
                    .and_then(Value::as_str)
                    .is_some_and(|name| name.eq_ignore_ascii_case("increment"));
                match op.get("amount") {
                    Some(amount)
                        if is_increment && number_of(amount).is_some_and(|n| n != 0.0) =>
                    {
                        Ok(Some(BadgeUpdate::Increment(amount.clone())))
                    }
                    _ => Err(invalid()),
                }
            }
            other => match number_of(other) {
                Some(n) if n != 0.0 => Ok(Some(BadgeUpdate::Set(
                    other.as_f64().map(|_| other.clone()).unwrap_or_else(|| json!(n)),
                ))),
                _ => Err(invalid()),
            },
        }
    }

    fn to_update(&self) -> JsonObject {
        let value = match self {
            BadgeUpdate::Increment(amount) => json!({ "__op": "Increment", "amount": amount }),
            BadgeUpdate::Set(badge) => badge.clone(),
        };
        let mut update = JsonObject::new();
        update.insert("badge".to_string(), value);
        update
    }
}

/// A number, or a string holding one.
fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses a push date: seconds since the epoch, or an ISO-8601 string with or
/// without a timezone. The flag is true when no timezone was given.
fn parse_push_date(value: &Value) -> Option<(DateTime<Utc>, bool)> {
    match value {
        Value::Number(n) => {
            let millis = (n.as_f64()? * 1000.0).round() as i64;
            DateTime::from_timestamp_millis(millis).map(|date| (date, false))
        }
        Value::String(s) => {
            let has_timezone = s.ends_with('Z') || offset_regex().is_match(s);
            if has_timezone {
                return DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|date| (date.with_timezone(&Utc), false));
            }
            let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|date| date.and_hms_opt(0, 0, 0))
                })?;
            Some((naive.and_utc(), true))
        }
        _ => None,
    }
}

fn expiration_time(body: &JsonObject) -> Result<Option<i64>, ParseError> {
    let Some(value) = body.get("expiration_time") else {
        return Ok(None);
    };
    let date = match value {
        Value::Number(_) | Value::String(_) => parse_push_date(value),
        _ => None,
    };
    date.map(|(date, _)| Some(date.timestamp_millis()))
        .ok_or_else(|| {
            ParseError::PushMisconfigured(format!("{} is not valid time.", describe(value)))
        })
}

fn expiration_interval(body: &JsonObject) -> Result<Option<i64>, ParseError> {
    let Some(value) = body.get("expiration_interval") else {
        return Ok(None);
    };
    match value.as_f64() {
        Some(interval) if interval > 0.0 => Ok(Some(interval.round() as i64)),
        _ => Err(ParseError::PushMisconfigured(
            "expiration_interval must be a number greater than 0".to_string(),
        )),
    }
}

/// `push_time` in the form stored on `_PushStatus`; local times keep no `Z`.
fn push_time(body: &JsonObject) -> Result<Option<String>, ParseError> {
    let Some(value) = body.get("push_time") else {
        return Ok(None);
    };
    let (date, is_local) = parse_push_date(value).ok_or_else(|| {
        ParseError::PushMisconfigured(format!("{} is not valid time.", describe(value)))
    })?;
    let iso = ParseDate::from_datetime(date).iso;
    Ok(Some(if is_local {
        iso.trim_end_matches('Z').to_string()
    } else {
        iso
    }))
}

/// Fingerprint of the alert, used to group pushes with the same message.
fn push_hash(data: &JsonObject) -> String {
    let alert = match data.get("alert") {
        Some(Value::String(alert)) => alert.clone(),
        Some(alert @ Value::Object(_)) => alert.to_string(),
        _ => String::new(),
    };
    hex::encode(Sha256::digest(alert.as_bytes()))
}

pub struct PushController {
    config: Arc<Config>,
}

impl PushController {
    pub fn new(config: Arc<Config>) -> Self {
        PushController { config }
    }

    /// Validates and enqueues a push to the installations matching `query`.
    /// Returns the objectId of the `_PushStatus` row tracking it.
    pub async fn send_push(
        &self,
        body: JsonObject,
        query: JsonObject,
        auth: &Auth,
    ) -> Result<String, ParseError> {
        self.send_push_at(body, query, auth, Utc::now()).await
    }

    pub async fn send_push_at(
        &self,
        mut body: JsonObject,
        query: JsonObject,
        auth: &Auth,
        now: DateTime<Utc>,
    ) -> Result<String, ParseError> {
        let Some(queue) = self.config.push_queue.clone() else {
            return Err(ParseError::PushMisconfigured(
                "Missing push configuration".to_string(),
            ));
        };

        let mut expiration = expiration_time(&body)?;
        let interval = expiration_interval(&body)?;
        if expiration.is_some() && interval.is_some() {
            return Err(ParseError::PushMisconfigured(
                "Both expiration_time and expiration_interval cannot be set".to_string(),
            ));
        }
        if let Some(interval) = interval {
            if !body.contains_key("push_time") {
                expiration = Some(now.timestamp_millis() + interval * 1000);
            }
        }
        set_or_remove(&mut body, "expiration_time", expiration.map(|ms| json!(ms)));
        set_or_remove(&mut body, "expiration_interval", interval.map(|s| json!(s)));
        if let Some(time) = push_time(&body)? {
            body.insert("push_time".to_string(), json!(time));
        }

        let badge = match body.get("data").and_then(|data| data.get("badge")) {
            Some(badge) => BadgeUpdate::from_value(badge)?,
            None => None,
        };

        let status_id = self.set_initial_status(&body, &query, now).await?;
        log::debug!("push status {} created", status_id);
        self.touch_audience(&body);

        match self.dispatch(&body, &query, auth, badge, &queue, &status_id).await {
            Ok(()) => Ok(status_id),
            Err(err) => {
                self.mark_failed(&status_id, &err).await;
                Err(err)
            }
        }
    }

    async fn dispatch(
        &self,
        body: &JsonObject,
        query: &JsonObject,
        auth: &Auth,
        badge: Option<BadgeUpdate>,
        queue: &Arc<dyn PushQueue>,
        status_id: &str,
    ) -> Result<(), ParseError> {
        if let Some(badge) = badge {
            // Only installations that can actually receive the push.
            let mut update_where = query.clone();
            if !update_where.contains_key("deviceToken") {
                update_where.insert("deviceToken".to_string(), json!({ "$exists": true }));
            }
            let mut rest_query = RestQuery::new(
                self.config.clone(),
                Auth::master(),
                "_Installation",
                update_where,
                RestOptions::default(),
            )?;
            rest_query.build_rest_where().await?;
            RestWrite::new(
                self.config.clone(),
                Auth::master(),
                "_Installation",
                Some(rest_query.rest_where().clone()),
                badge.to_update(),
                None,
            )?
            .many(true)
            .execute()
            .await?;
        }
        if body.contains_key("push_time") && self.config.options.has_push_scheduled_support {
            return Ok(());
        }
        queue.enqueue(body, query, status_id, auth).await
    }

    async fn set_initial_status(
        &self,
        body: &JsonObject,
        query: &JsonObject,
        now: DateTime<Utc>,
    ) -> Result<String, ParseError> {
        let created_at = ParseDate::from_datetime(now).iso;
        let mut push_time = created_at.clone();
        let mut status = "pending";
        if let Some(time) = body.get("push_time").and_then(Value::as_str) {
            if self.config.options.has_push_scheduled_support {
                push_time = time.to_string();
                status = "scheduled";
            } else {
                log::warn!("push_time set but scheduled push is not supported, sending now");
            }
        }
        let data = body
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let object_id = crate::crypto::new_object_id(self.config.options.object_id_size);

        let mut object = JsonObject::new();
        object.insert("objectId".to_string(), json!(object_id));
        object.insert("createdAt".to_string(), json!(created_at));
        object.insert("updatedAt".to_string(), json!(created_at));
        object.insert("pushTime".to_string(), json!(push_time));
        object.insert(
            "query".to_string(),
            json!(Value::Object(query.clone()).to_string()),
        );
        object.insert(
            "payload".to_string(),
            json!(Value::Object(data.clone()).to_string()),
        );
        object.insert("source".to_string(), json!("rest"));
        for (key, column) in [
            ("expiration_time", "expiry"),
            ("expiration_interval", "expiration_interval"),
        ] {
            if let Some(value) = body.get(key) {
                object.insert(column.to_string(), value.clone());
            }
        }
        object.insert("status".to_string(), json!(status));
        object.insert("numSent".to_string(), json!(0));
        object.insert("pushHash".to_string(), json!(push_hash(&data)));
        object.insert("ACL".to_string(), json!({}));

        self.config
            .database
            .create("_PushStatus", object, None)
            .await?;
        Ok(object_id)
    }

    /// Records that an audience was used, in the background.
    fn touch_audience(&self, body: &JsonObject) {
        let Some(audience_id) = body.get("audience_id").and_then(Value::as_str) else {
            return;
        };
        let mut query = JsonObject::new();
        query.insert("objectId".to_string(), json!(audience_id));
        let mut update = JsonObject::new();
        update.insert("lastUsed".to_string(), ParseDate::now().to_value());
        update.insert(
            "timesUsed".to_string(),
            json!({ "__op": "Increment", "amount": 1 }),
        );
        let config = self.config.clone();
        tokio::spawn(async move {
            let write = match RestWrite::new(
                config,
                Auth::master(),
                "_Audience",
                Some(query),
                update,
                None,
            ) {
                Ok(write) => write,
                Err(err) => {
                    log::warn!("failed to update audience: {}", err);
                    return;
                }
            };
            if let Err(err) = write.execute().await {
                log::warn!("failed to update audience: {}", err);
            }
        });
    }

    async fn mark_failed(&self, status_id: &str, err: &ParseError) {
        let mut query = JsonObject::new();
        query.insert("objectId".to_string(), json!(status_id));
        let mut update = JsonObject::new();
        update.insert("status".to_string(), json!("failed"));
        update.insert("updatedAt".to_string(), json!(ParseDate::now().iso));
        update.insert("errorMessage".to_string(), json!(err.to_json().to_string()));
        if let Err(update_err) = self
            .config
            .database
            .update("_PushStatus", query, update, &UpdateOptions::default(), false)
            .await
        {
            log::error!("failed to mark push {} as failed: {}", status_id, update_err);
        }
    }
}

fn set_or_remove(body: &mut JsonObject, key: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            body.insert(key.to_string(), value);
        }
        None => {
            body.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryStorageAdapter;
    use crate::config::ServerOptions;
    use crate::database::FindOptions;
    use crate::types::as_object;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingQueue {
        pushes: Mutex<Vec<(JsonObject, String)>>,
    }

    #[async_trait]
    impl PushQueue for RecordingQueue {
        async fn enqueue(
            &self,
            body: &JsonObject,
            _query: &JsonObject,
            push_status_id: &str,
            _auth: &Auth,
        ) -> Result<(), ParseError> {
            self.pushes
                .lock()
                .push((body.clone(), push_status_id.to_string()));
            Ok(())
        }
    }

    fn config_with(queue: Option<Arc<RecordingQueue>>, scheduled: bool) -> Arc<Config> {
        let mut options = ServerOptions::new("app", "http://localhost:1337/parse");
        options.has_push_scheduled_support = scheduled;
        let mut builder = Config::builder(Arc::new(InMemoryStorageAdapter::new())).options(options);
        if let Some(queue) = queue {
            builder = builder.push_queue(queue);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_badge_values() {
        assert_eq!(
            BadgeUpdate::from_value(&json!("Increment")).unwrap(),
            Some(BadgeUpdate::Increment(json!(1)))
        );
        assert_eq!(
            BadgeUpdate::from_value(&json!({"__op": "Increment", "amount": 3})).unwrap(),
            Some(BadgeUpdate::Increment(json!(3)))
        );
        assert_eq!(
            BadgeUpdate::from_value(&json!(5)).unwrap(),
            Some(BadgeUpdate::Set(json!(5)))
        );
        assert_eq!(BadgeUpdate::from_value(&json!(0)).unwrap(), None);
        assert_eq!(BadgeUpdate::from_value(&json!("lots")).unwrap_err().code(), 115);
    }

    #[test]
    fn test_push_times() {
        let body = as_object(&json!({"push_time": "2017-09-06T13:42:48"}));
        assert_eq!(
            push_time(&body).unwrap(),
            Some("2017-09-06T13:42:48.000".to_string())
        );
        let body = as_object(&json!({"push_time": "2017-09-06T13:42:48+02:00"}));
        assert_eq!(
            push_time(&body).unwrap(),
            Some("2017-09-06T11:42:48.000Z".to_string())
        );
        let body = as_object(&json!({"push_time": 1504705368}));
        assert_eq!(
            push_time(&body).unwrap(),
            Some("2017-09-06T13:42:48.000Z".to_string())
        );
        let body = as_object(&json!({"expiration_time": "soon"}));
        assert_eq!(
            expiration_time(&body).unwrap_err(),
            ParseError::PushMisconfigured("soon is not valid time.".to_string())
        );
    }

    #[test]
    fn test_push_hash() {
        assert_eq!(
            push_hash(&JsonObject::new()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(
            push_hash(&as_object(&json!({"alert": "hi"}))),
            push_hash(&as_object(&json!({"alert": "bye"})))
        );
    }

    #[tokio::test]
    async fn test_missing_queue() {
        let controller = PushController::new(config_with(None, false));
        let err = controller
            .send_push(JsonObject::new(), JsonObject::new(), &Auth::master())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::PushMisconfigured("Missing push configuration".to_string())
        );
    }

    #[tokio::test]
    async fn test_conflicting_expiration() {
        let queue = Arc::new(RecordingQueue::default());
        let controller = PushController::new(config_with(Some(queue), false));
        let err = controller
            .send_push(
                as_object(&json!({"expiration_time": 1504705368, "expiration_interval": 60})),
                JsonObject::new(),
                &Auth::master(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.message(),
            "Both expiration_time and expiration_interval cannot be set"
        );
    }

    #[tokio::test]
    async fn test_send_records_status_and_enqueues() {
        let queue = Arc::new(RecordingQueue::default());
        let config = config_with(Some(queue.clone()), false);
        let controller = PushController::new(config.clone());
        let now = DateTime::from_timestamp(1_504_705_368, 0).unwrap();

        let id = controller
            .send_push_at(
                as_object(&json!({"data": {"alert": "hello"}, "expiration_interval": 60})),
                as_object(&json!({"deviceType": "ios"})),
                &Auth::master(),
                now,
            )
            .await
            .unwrap();

        let pushes = queue.pushes.lock().clone();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1, id);
        assert_eq!(
            pushes[0].0.get("expiration_time"),
            Some(&json!(1_504_705_428_000i64))
        );

        let rows = config
            .database
            .find(
                "_PushStatus",
                as_object(&json!({"objectId": id})),
                &FindOptions::master(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("status"), Some(&json!("pending")));
        assert_eq!(rows[0].get("numSent"), Some(&json!(0)));
        assert_eq!(rows[0].get("source"), Some(&json!("rest")));
        assert_eq!(rows[0].get("expiration_interval"), Some(&json!(60)));
        assert_eq!(
            rows[0].get("pushHash"),
            Some(&json!(push_hash(&as_object(&json!({"alert": "hello"})))))
        );
    }

    #[tokio::test]
    async fn test_scheduled_push_is_not_enqueued() {
        let queue = Arc::new(RecordingQueue::default());
        let config = config_with(Some(queue.clone()), true);
        let controller = PushController::new(config.clone());
        let id = controller
            .send_push(
                as_object(&json!({"data": {"alert": "later"}, "push_time": "2030-01-01T10:00:00"})),
                JsonObject::new(),
                &Auth::master(),
            )
            .await
            .unwrap();

        assert!(queue.pushes.lock().is_empty());
        let rows = config
            .database
            .find(
                "_PushStatus",
                as_object(&json!({"objectId": id})),
                &FindOptions::master(),
            )
            .await
            .unwrap();
        assert_eq!(rows[0].get("status"), Some(&json!("scheduled")));
        assert_eq!(rows[0].get("pushTime"), Some(&json!("2030-01-01T10:00:00.000")));
    }
}

use async_trait::async_trait;
use parse_server_rs::auth::Auth;
use parse_server_rs::config::{EmailAdapter, ServerOptions};
use parse_server_rs::database::FindOptions;
use parse_server_rs::rest;
use parse_server_rs::types::JsonObject;
use parse_server_rs::ParseError;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use test_utils::shared::{obj, setup_builder, setup_config, str_field, test_options, SERVER_URL};

async fn signup(
    config: &Arc<parse_server_rs::Config>,
    username: &str,
    password: &str,
) -> (String, String) {
    let response = rest::create(
        config,
        &Auth::nobody(),
        "_User",
        obj(json!({"username": username, "password": password})),
    )
    .await
    .expect("signup failed");
    (
        str_field(&response.response, "objectId").to_string(),
        str_field(&response.response, "sessionToken").to_string(),
    )
}

async fn stored_user(config: &Arc<parse_server_rs::Config>, user_id: &str) -> JsonObject {
    config
        .database
        .find("_User", obj(json!({"objectId": user_id})), &FindOptions::master())
        .await
        .unwrap()
        .into_iter()
        .next()
        .expect("user not stored")
}

#[tokio::test]
async fn test_signup_returns_session() {
    let config = setup_config();
    let response = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"username": "bob", "password": "secret"})),
    )
    .await
    .unwrap();

    assert_eq!(response.status, 201);
    let user_id = str_field(&response.response, "objectId").to_string();
    assert_eq!(response.response["username"], json!("bob"));
    assert!(response.response.contains_key("createdAt"));
    assert!(!response.response.contains_key("password"));
    let token = str_field(&response.response, "sessionToken").to_string();
    assert!(token.starts_with("r:"));
    assert_eq!(
        response.location,
        Some(format!("{}/users/{}", SERVER_URL, user_id))
    );

    let auth = Auth::for_session_token(&config, &token, None).await.unwrap();
    assert_eq!(auth.user_id(), Some(user_id.as_str()));
    assert_eq!(auth.user.as_ref().unwrap()["username"], json!("bob"));

    // The hash is stored, never the password itself
    let stored = stored_user(&config, &user_id).await;
    assert!(str_field(&stored, "password").starts_with("$2b$"));
    assert_eq!(stored["ACL"][&user_id], json!({"read": true, "write": true}));
    assert_eq!(stored["ACL"]["*"], json!({"read": true}));

    let sessions = config
        .database
        .find("_Session", obj(json!({"sessionToken": token})), &FindOptions::master())
        .await
        .unwrap();
    assert_eq!(
        sessions[0]["createdWith"],
        json!({"action": "signup", "authProvider": "password"})
    );
}

#[tokio::test]
async fn test_signup_requires_username_and_password() {
    let config = setup_config();
    let err = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"password": "secret"})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), 200);

    let err = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"username": "bob"})),
    )
    .await
    .unwrap_err();
    assert_eq!(err, ParseError::PasswordMissing("password is required".to_string()));
}

#[tokio::test]
async fn test_username_and_email_taken() {
    let config = setup_config();
    rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"username": "bob", "password": "a", "email": "bob@example.com"})),
    )
    .await
    .unwrap();

    let err = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"username": "bob", "password": "b"})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), 202);

    let err = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"username": "robert", "password": "b", "email": "bob@example.com"})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), 203);

    let err = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"username": "rob", "password": "b", "email": "not-an-email"})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), 125);
}

#[tokio::test]
async fn test_auth_data_signup_then_login() {
    let config = setup_config();
    let signup = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"authData": {"anonymous": {"id": "device-1"}}})),
    )
    .await
    .unwrap();
    assert_eq!(signup.status, 201);
    let user_id = str_field(&signup.response, "objectId").to_string();
    let first_token = str_field(&signup.response, "sessionToken").to_string();
    // Username is generated when none is given
    assert_eq!(str_field(&signup.response, "username").len(), 25);

    let login = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"authData": {"anonymous": {"id": "device-1"}}})),
    )
    .await
    .unwrap();
    assert_eq!(login.status, 200);
    assert_eq!(login.response["objectId"], json!(user_id));
    assert!(!login.response.contains_key("password"));
    let second_token = str_field(&login.response, "sessionToken").to_string();
    assert_ne!(first_token, second_token);
    assert_eq!(
        login.location,
        Some(format!("{}/users/{}", SERVER_URL, user_id))
    );

    let sessions = config
        .database
        .find(
            "_Session",
            obj(json!({"sessionToken": second_token})),
            &FindOptions::master(),
        )
        .await
        .unwrap();
    assert_eq!(
        sessions[0]["createdWith"],
        json!({"action": "login", "authProvider": "anonymous"})
    );

    let users = config
        .database
        .find("_User", JsonObject::new(), &FindOptions::master())
        .await
        .unwrap();
    assert_eq!(users.len(), 1);
}

#[tokio::test]
async fn test_unsupported_auth_provider() {
    let config = setup_config();
    let err = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"authData": {"myspace": {"id": "42"}}})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), 252);
}

#[tokio::test]
async fn test_user_cannot_lock_themselves_out() {
    let config = setup_config();
    let (user_id, token) = signup(&config, "carol", "pw").await;
    let auth = Auth::for_session_token(&config, &token, None).await.unwrap();

    let response = rest::update(
        &config,
        &auth,
        "_User",
        obj(json!({"objectId": user_id})),
        obj(json!({"ACL": {}})),
    )
    .await
    .unwrap();
    assert_eq!(response.status, 200);

    let stored = stored_user(&config, &user_id).await;
    let acl = stored["ACL"].as_object().unwrap();
    assert_eq!(acl.len(), 1);
    assert_eq!(acl[&user_id], json!({"read": true, "write": true}));
}

#[tokio::test]
async fn test_other_users_cannot_be_modified() {
    let config = setup_config();
    let (victim_id, _) = signup(&config, "victim", "pw").await;
    let (_, token) = signup(&config, "mallory", "pw").await;
    let auth = Auth::for_session_token(&config, &token, None).await.unwrap();

    let err = rest::update(
        &config,
        &auth,
        "_User",
        obj(json!({"objectId": victim_id})),
        obj(json!({"username": "owned"})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), 206);
}

#[tokio::test]
async fn test_password_history_and_session_revocation() {
    let options = ServerOptions::from_json(&json!({
        "appId": "test-app",
        "serverURL": SERVER_URL,
        "passwordPolicy": {"maxPasswordHistory": 2}
    }))
    .unwrap();
    let config = setup_builder(options).build().unwrap();
    let (user_id, token) = signup(&config, "dave", "first").await;
    let auth = Auth::for_session_token(&config, &token, None).await.unwrap();

    let changed = rest::update(
        &config,
        &auth,
        "_User",
        obj(json!({"objectId": user_id})),
        obj(json!({"password": "second"})),
    )
    .await
    .unwrap();
    // A password change revokes old sessions and hands the user a new one
    let new_token = str_field(&changed.response, "sessionToken").to_string();
    assert_ne!(new_token, token);
    let err = Auth::for_session_token(&config, &token, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 209);
    assert!(Auth::for_session_token(&config, &new_token, None).await.is_ok());

    let err = rest::update(
        &config,
        &auth,
        "_User",
        obj(json!({"objectId": user_id})),
        obj(json!({"password": "first"})),
    )
    .await
    .unwrap_err();
    assert_eq!(
        err,
        ParseError::ValidationError(
            "New password should not be the same as last 2 passwords.".to_string()
        )
    );

    rest::update(
        &config,
        &auth,
        "_User",
        obj(json!({"objectId": user_id})),
        obj(json!({"password": "third"})),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_clients_cannot_verify_their_own_email() {
    let config = setup_config();
    let err = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"username": "eve", "password": "pw", "emailVerified": true})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), 119);
}

struct ChannelEmailAdapter {
    sender: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl EmailAdapter for ChannelEmailAdapter {
    async fn send_verification_email(
        &self,
        user: &JsonObject,
        link: &str,
    ) -> Result<(), ParseError> {
        let email = user
            .get("email")
            .and_then(|e| e.as_str())
            .unwrap_or_default()
            .to_string();
        self.sender
            .send((email, link.to_string()))
            .map_err(|e| ParseError::InternalServerError(e.to_string()))
    }
}

#[tokio::test]
async fn test_verification_email_is_sent() {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let options = ServerOptions {
        verify_user_emails: true,
        ..test_options()
    };
    let config = setup_builder(options)
        .email_adapter(Arc::new(ChannelEmailAdapter { sender }))
        .build()
        .unwrap();

    let response = rest::create(
        &config,
        &Auth::nobody(),
        "_User",
        obj(json!({"username": "frank", "password": "pw", "email": "frank@example.com"})),
    )
    .await
    .unwrap();
    let user_id = str_field(&response.response, "objectId").to_string();

    let (email, link) = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("no verification email sent")
        .unwrap();
    assert_eq!(email, "frank@example.com");

    let stored = stored_user(&config, &user_id).await;
    assert_eq!(stored["emailVerified"], json!(false));
    let token = str_field(&stored, "_email_verify_token");
    assert_eq!(
        link,
        format!(
            "{}/apps/test-app/verify_email?token={}&username=frank",
            SERVER_URL, token
        )
    );
}

#[tokio::test]
async fn test_sessions_are_scoped_to_their_user() {
    let config = setup_config();
    let (_, alice_token) = signup(&config, "alice", "pw").await;
    let (_, bob_token) = signup(&config, "bobby", "pw").await;
    let alice = Auth::for_session_token(&config, &alice_token, None).await.unwrap();
    let bob = Auth::for_session_token(&config, &bob_token, None).await.unwrap();

    let err = rest::find(
        &config,
        &Auth::nobody(),
        "_Session",
        JsonObject::new(),
        Default::default(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), 209);

    let mine = rest::find(&config, &alice, "_Session", JsonObject::new(), Default::default())
        .await
        .unwrap();
    assert_eq!(mine.results.len(), 1);
    assert_eq!(mine.results[0]["sessionToken"], json!(alice_token));
    let session_id = mine.results[0]["objectId"].as_str().unwrap().to_string();

    let err = rest::del(&config, &bob, "_Session", &session_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 101);

    rest::del(&config, &alice, "_Session", &session_id)
        .await
        .unwrap();
    let err = Auth::for_session_token(&config, &alice_token, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 209);
}

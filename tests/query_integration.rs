use parse_server_rs::auth::Auth;
use parse_server_rs::rest;
use parse_server_rs::rest_query::{RestOptions, RestQuery};
use parse_server_rs::triggers::{TriggerRegistry, TriggerRequest, TriggerResult, TriggerType};
use parse_server_rs::types::{JsonObject, Pointer, RelationOp};
use parse_server_rs::{Config, ParseError};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use test_utils::shared::{obj, setup_builder, setup_config, str_field, test_options};

async fn create(config: &Arc<Config>, class_name: &str, data: Value) -> String {
    let response = rest::create(config, &Auth::master(), class_name, obj(data))
        .await
        .expect("create failed");
    str_field(&response.response, "objectId").to_string()
}

/// Two authors and three posts, one of them pointing at an author that does not exist.
async fn seed(config: &Arc<Config>) -> (String, String) {
    let ann = create(config, "Author", json!({"name": "ann"})).await;
    let bob = create(config, "Author", json!({"name": "bob"})).await;
    for (title, author, views) in [("p1", ann.as_str(), 10), ("p2", bob.as_str(), 20), ("p3", "gone", 30)] {
        create(
            config,
            "Post",
            json!({
                "title": title,
                "views": views,
                "author": Pointer::new("Author", author).to_value()
            }),
        )
        .await;
    }
    (ann, bob)
}

fn titles(results: &[Value]) -> Vec<&str> {
    results
        .iter()
        .map(|r| r["title"].as_str().unwrap_or_default())
        .collect()
}

fn options(value: Value) -> RestOptions {
    RestOptions::from_value(&value).unwrap()
}

#[tokio::test]
async fn test_in_query_with_include() {
    let config = setup_config();
    let (ann, _) = seed(&config).await;

    let response = rest::find(
        &config,
        &Auth::nobody(),
        "Post",
        obj(json!({"author": {"$inQuery": {"where": {"name": "ann"}, "className": "Author"}}})),
        options(json!({"include": "author"})),
    )
    .await
    .unwrap();

    assert_eq!(titles(&response.results), vec!["p1"]);
    let author = &response.results[0]["author"];
    assert_eq!(author["__type"], json!("Object"));
    assert_eq!(author["className"], json!("Author"));
    assert_eq!(author["objectId"], json!(ann));
    assert_eq!(author["name"], json!("ann"));
}

#[tokio::test]
async fn test_not_in_query_rewrites_to_nin() {
    let config = setup_config();
    let (ann, _) = seed(&config).await;

    let mut query = RestQuery::new(
        config.clone(),
        Auth::master(),
        "Post",
        obj(json!({"author": {"$notInQuery": {"where": {"name": "ann"}, "className": "Author"}}})),
        RestOptions::default(),
    )
    .unwrap();
    query.build_rest_where().await.unwrap();
    assert_eq!(
        Value::Object(query.rest_where().clone()),
        json!({"author": {"$nin": [Pointer::new("Author", ann).to_value()]}})
    );

    let response = query.execute().await.unwrap();
    let mut found = titles(&response.results);
    found.sort();
    assert_eq!(found, vec!["p2", "p3"]);
}

#[tokio::test]
async fn test_select_and_dont_select() {
    let config = setup_config();
    seed(&config).await;
    create(&config, "Favorite", json!({"title": "p2"})).await;

    let response = rest::find(
        &config,
        &Auth::master(),
        "Post",
        obj(json!({"title": {"$select": {"query": {"className": "Favorite"}, "key": "title"}}})),
        RestOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(titles(&response.results), vec!["p2"]);

    let response = rest::find(
        &config,
        &Auth::master(),
        "Post",
        obj(json!({"title": {"$dontSelect": {"query": {"className": "Favorite"}, "key": "title"}}})),
        options(json!({"order": "title"})),
    )
    .await
    .unwrap();
    assert_eq!(titles(&response.results), vec!["p1", "p3"]);

    let err = rest::find(
        &config,
        &Auth::master(),
        "Post",
        obj(json!({"title": {"$select": {"query": {"className": "Favorite"}}}})),
        RestOptions::default(),
    )
    .await
    .unwrap_err();
    assert_eq!(
        err,
        ParseError::InvalidQuery("improper usage of $select".to_string())
    );
}

#[tokio::test]
async fn test_include_drops_dangling_pointers() {
    let config = setup_config();
    seed(&config).await;

    let response = rest::find(
        &config,
        &Auth::master(),
        "Post",
        JsonObject::new(),
        options(json!({"include": "author", "order": "title"})),
    )
    .await
    .unwrap();
    assert_eq!(titles(&response.results), vec!["p1", "p2", "p3"]);
    assert_eq!(response.results[0]["author"]["name"], json!("ann"));
    assert_eq!(response.results[1]["author"]["name"], json!("bob"));
    assert!(response.results[2].get("author").is_none());
}

#[tokio::test]
async fn test_keys_order_limit_and_count() {
    let config = setup_config();
    seed(&config).await;

    let response = rest::find(
        &config,
        &Auth::master(),
        "Post",
        JsonObject::new(),
        options(json!({"keys": "title,author.name", "order": "-views", "limit": 2, "count": 1})),
    )
    .await
    .unwrap();
    assert_eq!(titles(&response.results), vec!["p3", "p2"]);
    assert_eq!(response.count, Some(3));
    assert!(response.results[1].get("views").is_none());
    assert!(response.results[1].get("objectId").is_some());
    assert_eq!(response.results[1]["author"]["name"], json!("bob"));

    let response = rest::find(
        &config,
        &Auth::master(),
        "Post",
        obj(json!({"views": {"$gte": 20}})),
        options(json!({"limit": 0, "count": true})),
    )
    .await
    .unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.count, Some(2));
    assert_eq!(response.to_value(), json!({"results": [], "count": 2}));
}

#[tokio::test]
async fn test_get_by_object_id() {
    let config = setup_config();
    let (ann, _) = seed(&config).await;
    let response = rest::get(&config, &Auth::nobody(), "Author", &ann, RestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0]["name"], json!("ann"));
}

#[tokio::test]
async fn test_acl_hides_objects() {
    let config = setup_config();
    create(
        &config,
        "Note",
        json!({"text": "private", "ACL": {"u1": {"read": true, "write": true}}}),
    )
    .await;
    create(&config, "Note", json!({"text": "public"})).await;

    let owner = Auth::for_user(obj(json!({"objectId": "u1"})));
    let stranger = Auth::for_user(obj(json!({"objectId": "u2"})));

    let seen = rest::find(&config, &owner, "Note", JsonObject::new(), RestOptions::default())
        .await
        .unwrap();
    assert_eq!(seen.results.len(), 2);

    let seen = rest::find(&config, &stranger, "Note", JsonObject::new(), RestOptions::default())
        .await
        .unwrap();
    assert_eq!(seen.results.len(), 1);
    assert_eq!(seen.results[0]["text"], json!("public"));
}

#[tokio::test]
async fn test_after_find_replaces_results() {
    let triggers = Arc::new(TriggerRegistry::new());
    triggers.register(
        TriggerType::AfterFind,
        "Author",
        |request: TriggerRequest| async move {
            let objects = request
                .objects
                .into_iter()
                .map(|mut object| {
                    let name = object["name"].as_str().unwrap_or_default().to_uppercase();
                    object.insert("name".to_string(), json!(name));
                    object
                })
                .collect();
            Ok::<_, ParseError>(TriggerResult::Objects(objects))
        },
    );
    let config = setup_builder(test_options()).triggers(triggers).build().unwrap();
    create(&config, "Author", json!({"name": "ann"})).await;

    let response = rest::find(
        &config,
        &Auth::master(),
        "Author",
        JsonObject::new(),
        RestOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(response.results[0]["name"], json!("ANN"));
}

#[tokio::test]
async fn test_after_find_failure_keeps_results() {
    let triggers = Arc::new(TriggerRegistry::new());
    triggers.register(
        TriggerType::AfterFind,
        "Author",
        |_request: TriggerRequest| async move {
            Err::<TriggerResult, _>(ParseError::ScriptFailed("boom".to_string()))
        },
    );
    let config = setup_builder(test_options()).triggers(triggers).build().unwrap();
    create(&config, "Author", json!({"name": "ann"})).await;

    let response = rest::find(
        &config,
        &Auth::master(),
        "Author",
        JsonObject::new(),
        RestOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(response.results[0]["name"], json!("ann"));
}

#[tokio::test]
async fn test_relation_redirect() {
    let config = setup_config();
    let (ann, bob) = seed(&config).await;
    let team = create(
        &config,
        "Team",
        json!({
            "name": "writers",
            "members": RelationOp::add(vec![
                Pointer::new("Author", ann.as_str()),
                Pointer::new("Author", bob.as_str()),
            ])
            .to_value()
        }),
    )
    .await;

    let response = rest::find(
        &config,
        &Auth::master(),
        "Team",
        obj(json!({"$relatedTo": {
            "object": Pointer::new("Team", team).to_value(),
            "key": "members"
        }})),
        options(json!({"redirectClassNameForKey": "members", "order": "name"})),
    )
    .await
    .unwrap();
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0]["name"], json!("ann"));
    assert_eq!(response.results[0]["className"], json!("Author"));
}

#[tokio::test]
async fn test_session_user_in_query_resolves_to_pointers() {
    let config = setup_config();
    config
        .database
        .create("_User", obj(json!({"objectId": "bob1", "username": "bob", "name": "Bob"})), None)
        .await
        .unwrap();
    config
        .database
        .create("_User", obj(json!({"objectId": "amy1", "username": "amy", "name": "Amy"})), None)
        .await
        .unwrap();

    let mut query = RestQuery::new(
        config.clone(),
        Auth::master(),
        "_Session",
        obj(json!({"user": {"$inQuery": {"where": {"name": "Bob"}, "className": "_User"}}})),
        RestOptions::default(),
    )
    .unwrap();
    query.build_rest_where().await.unwrap();
    assert_eq!(
        Value::Object(query.rest_where().clone()),
        json!({"user": {"$in": [Pointer::new("_User", "bob1").to_value()]}})
    );
}

#[tokio::test]
async fn test_nested_in_query_under_or_with_sibling_not_in_query() {
    let config = setup_config();
    let red = create(&config, "Team", json!({"name": "red"})).await;
    let blue = create(&config, "Team", json!({"name": "blue"})).await;
    let mut authors = Vec::new();
    for (name, team) in [("ann", &red), ("bob", &blue), ("cat", &red)] {
        let id = create(
            &config,
            "Author",
            json!({"name": name, "team": Pointer::new("Team", team.as_str()).to_value()}),
        )
        .await;
        authors.push(id);
    }
    let (ann, bob, cat) = (&authors[0], &authors[1], &authors[2]);
    for (title, author) in [("p1", ann), ("p2", bob), ("p3", cat), ("p4", bob)] {
        create(
            &config,
            "Post",
            json!({"title": title, "author": Pointer::new("Author", author.as_str()).to_value()}),
        )
        .await;
    }

    let mut query = RestQuery::new(
        config.clone(),
        Auth::master(),
        "Post",
        obj(json!({
            "$or": [
                {"author": {"$inQuery": {
                    "where": {"team": {"$inQuery": {"where": {"name": "red"}, "className": "Team"}}},
                    "className": "Author"
                }}},
                {"title": "p4"}
            ],
            "author": {"$notInQuery": {"where": {"name": "cat"}, "className": "Author"}}
        })),
        RestOptions::default(),
    )
    .unwrap();
    tokio::time::timeout(Duration::from_secs(5), query.build_rest_where())
        .await
        .expect("rewriting sub-queries did not finish")
        .unwrap();

    let rewritten = Value::Object(query.rest_where().clone());
    let text = rewritten.to_string();
    assert!(!text.contains("$inQuery"));
    assert!(!text.contains("$notInQuery"));
    assert_eq!(
        rewritten["author"],
        json!({"$nin": [Pointer::new("Author", cat.as_str()).to_value()]})
    );
    let mut red_authors: Vec<&str> = rewritten["$or"][0]["author"]["$in"]
        .as_array()
        .unwrap()
        .iter()
        .map(|pointer| pointer["objectId"].as_str().unwrap())
        .collect();
    red_authors.sort();
    let mut expected = vec![ann.as_str(), cat.as_str()];
    expected.sort();
    assert_eq!(red_authors, expected);
    assert_eq!(rewritten["$or"][1], json!({"title": "p4"}));

    let response = query.execute().await.unwrap();
    let mut found = titles(&response.results);
    found.sort();
    assert_eq!(found, vec!["p1", "p4"]);
}

#[tokio::test]
async fn test_keys_projection_keeps_acl() {
    let config = setup_config();
    create(
        &config,
        "Note",
        json!({"text": "mine", "mood": "calm", "ACL": {"u1": {"read": true, "write": true}}}),
    )
    .await;

    let response = rest::find(
        &config,
        &Auth::master(),
        "Note",
        JsonObject::new(),
        options(json!({"keys": "text"})),
    )
    .await
    .unwrap();
    let note = &response.results[0];
    assert_eq!(note["text"], json!("mine"));
    assert!(note.get("mood").is_none());
    assert_eq!(note["ACL"], json!({"u1": {"read": true, "write": true}}));
}

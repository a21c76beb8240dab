//! Endpoint behavior of a single node, driven through the router.

mod common;

use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, Utc};
use common::{days_ago, get_json, post_json, today, TestNode, TEST_KEY_BITS};
use labshare_crypto::{
    unwrap_shared_key, EncryptedPayload, IvMode, KeyPair, SignedMessage,
};
use labshare_federation::Requester;
use labshare_server::variants::TsvVariantStore;
use labshare_types::{Identity, RequestId};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn signed_by(node: &TestNode, message: SignedMessage) -> Value {
    let mut message = message;
    node.state.keyring.sign(&mut message).unwrap();
    message.into_value()
}

fn signed_with(pair: &KeyPair, message: SignedMessage) -> Value {
    let mut message = message;
    message.sign(pair).unwrap();
    message.into_value()
}

fn reply(body: Value) -> SignedMessage {
    SignedMessage::from_value(body).unwrap()
}

#[tokio::test]
async fn health_reports_node_name() {
    let node = TestNode::new("LabA").await;
    let (status, body) = get_json(node.router(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node"], "LabA");
}

#[tokio::test]
async fn check_node_answers_known_peer_with_signed_reply() {
    let a = TestNode::new("LabA").await;
    let b = TestNode::new("LabB").await;
    a.introduce(&b);

    let request_id = RequestId::generate();
    let body = signed_by(
        &b,
        SignedMessage::new()
            .with("request_node", json!("LabB"))
            .with("request_id", json!(request_id.as_str())),
    );
    let (status, body) = post_json(a.router(), "/check-node", &body).await;
    assert_eq!(status, StatusCode::OK);

    let answer = reply(body);
    assert!(answer.verify(&a.public_key()).unwrap());
    assert_eq!(answer.get("result"), Some(&json!(true)));
    assert_eq!(answer.get_str("request_id"), Some(request_id.as_str()));
}

#[tokio::test]
async fn check_node_rejects_unknown_tampered_and_stale_requests() {
    let a = TestNode::new("LabA").await;
    let b = TestNode::new("LabB").await;
    let stranger = TestNode::new("LabZ").await;
    a.introduce(&b);

    let unknown = signed_by(
        &stranger,
        SignedMessage::new()
            .with("request_node", json!("LabZ"))
            .with("request_id", json!(RequestId::generate().as_str())),
    );
    let (status, _) = post_json(a.router(), "/check-node", &unknown).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut tampered = signed_by(
        &b,
        SignedMessage::new()
            .with("request_node", json!("LabB"))
            .with("request_id", json!(RequestId::generate().as_str())),
    );
    tampered["request_id"] = json!(RequestId::generate().as_str());
    let (status, _) = post_json(a.router(), "/check-node", &tampered).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let an_hour_ago = Utc::now().naive_utc() - ChronoDuration::hours(1);
    let stale = signed_by(
        &b,
        SignedMessage::new()
            .with("request_node", json!("LabB"))
            .with("request_id", json!(RequestId::generate_at(an_hour_ago).as_str())),
    );
    let (status, body) = post_json(a.router(), "/check-node", &stale).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("request_id"));

    let (status, _) = post_json(a.router(), "/check-node", &json!({"request_node": "LabB"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

fn check_user_request(requester: &TestNode, identity: &Identity) -> Value {
    signed_by(
        requester,
        SignedMessage::new()
            .with("user_id", json!(identity.to_string()))
            .with("node", json!(identity.node()))
            .with("request_node", json!(requester.name()))
            .with("request_id", json!(RequestId::generate().as_str())),
    )
}

#[tokio::test]
async fn check_user_vouches_only_for_live_local_identities() {
    let a = TestNode::new("LabA").await;
    let b = TestNode::new("LabB").await;
    a.introduce(&b);

    let (fresh, pair) = a.register_user(today());
    let (status, body) = post_json(a.router(), "/check-user", &check_user_request(&b, &fresh)).await;
    assert_eq!(status, StatusCode::OK);
    let answer = reply(body);
    assert!(answer.verify(&a.public_key()).unwrap());
    assert_eq!(
        answer.get_str("result"),
        Some(pair.public().to_pem().unwrap().as_str())
    );

    let (expired, _) = a.register_user(days_ago(31));
    let (status, body) =
        post_json(a.router(), "/check-user", &check_user_request(&b, &expired)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply(body).get("result"), Some(&json!(false)));

    let unknown = Identity::generate("LabA");
    let (status, body) =
        post_json(a.router(), "/check-user", &check_user_request(&b, &unknown)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply(body).get("result"), Some(&json!(false)));

    let foreign = Identity::generate("LabC");
    let (status, _) = post_json(a.router(), "/check-user", &check_user_request(&b, &foreign)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn identity_expiring_today_is_still_authorized() {
    let a = TestNode::new("LabA").await;
    let b = TestNode::new("LabB").await;
    a.introduce(&b);

    let (identity, _) = a.register_user(days_ago(30));
    let (_, body) = post_json(a.router(), "/check-user", &check_user_request(&b, &identity)).await;
    assert!(reply(body).get_str("result").is_some());
}

#[tokio::test]
async fn update_keys_requires_the_previous_peer_key() {
    let a = TestNode::new("LabA").await;
    let b = TestNode::new("LabB").await;
    a.introduce(&b);

    let next = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let announcement = SignedMessage::new()
        .with("node", json!("LabB"))
        .with("public_key", json!(next.public().to_pem().unwrap()))
        .with("request_id", json!(RequestId::generate().as_str()));

    let forged = signed_with(&next, announcement.clone());
    let (status, _) = post_json(a.router(), "/update-keys", &forged).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(a.stored_key("LabB"), b.public_key());

    let genuine = signed_by(&b, announcement);
    let (status, _) = post_json(a.router(), "/update-keys", &genuine).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&a.stored_key("LabB"), next.public());
}

#[tokio::test]
async fn add_node_registers_peer_introduced_by_known_node() {
    let a = TestNode::new("LabA").await;
    let b = TestNode::new("LabB").await;
    let c = TestNode::new("LabC").await;
    a.introduce(&b);

    let introduce = |name: &str, address: &str, key: String| {
        signed_by(
            &b,
            SignedMessage::new()
                .with("laboratory-name", json!(name))
                .with("address", json!(address))
                .with("public_key", json!(key))
                .with("request_node", json!("LabB"))
                .with("request_id", json!(RequestId::generate().as_str())),
        )
    };

    let body = introduce("LabC", &c.address, c.public_key().to_pem().unwrap());
    let (status, _) = post_json(a.router(), "/add-node", &body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(a.state.directory.get("LabC").unwrap(), Some(c.record()));
    assert_eq!(a.stored_key("LabC"), c.public_key());

    let body = introduce("LabA", &a.address, a.public_key().to_pem().unwrap());
    let (status, _) = post_json(a.router(), "/add-node", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let body = introduce("../etc", "http://127.0.0.1:1", c.public_key().to_pem().unwrap());
    let (status, _) = post_json(a.router(), "/add-node", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn add_node_cannot_replace_a_known_key() {
    let a = TestNode::new("LabA").await;
    let b = TestNode::new("LabB").await;
    let c = TestNode::new("LabC").await;
    a.introduce(&b);
    a.introduce(&c);

    let attacker = KeyPair::generate(TEST_KEY_BITS).unwrap();
    for name in ["LabC", "LabB"] {
        let body = signed_by(
            &b,
            SignedMessage::new()
                .with("laboratory-name", json!(name))
                .with("address", json!("http://127.0.0.1:1"))
                .with("public_key", json!(attacker.public().to_pem().unwrap()))
                .with("request_node", json!("LabB"))
                .with("request_id", json!(RequestId::generate().as_str())),
        );
        let (status, body) = post_json(a.router(), "/add-node", &body).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].is_string());
    }

    assert_eq!(a.stored_key("LabB"), b.public_key());
    assert_eq!(a.stored_key("LabC"), c.public_key());
    assert_eq!(a.state.directory.get("LabC").unwrap(), Some(c.record()));
}

#[tokio::test]
async fn user_key_update_is_signed_with_current_key() {
    let a = TestNode::new("LabA").await;
    let (identity, current) = a.register_user(today());
    let next = KeyPair::generate(TEST_KEY_BITS).unwrap();

    let update = SignedMessage::new()
        .with("user_id", json!(identity.to_string()))
        .with("public_key", json!(next.public().to_pem().unwrap()))
        .with("request_id", json!(RequestId::generate().as_str()));

    let (status, _) =
        post_json(a.router(), "/update-user-key", &signed_with(&next, update.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) =
        post_json(a.router(), "/update-user-key", &signed_with(&current, update)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["expires_on"].is_string());

    let stored = a
        .state
        .trust
        .lookup_local(&identity, today())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&stored, next.public());
}

#[tokio::test]
async fn public_variants_respect_daily_quota() {
    let a = TestNode::with_config("LabA", |c| c.variants.public_daily_limit = 2).await;
    let query = json!({"chrom": "21", "start": 9825797});

    let (status, body) = post_json(a.router(), "/variants", &query).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!([["21", "9825797", "A", "G"]]));
    let request_id = RequestId::from_raw(body["request_id"].as_str().unwrap());
    assert!(request_id.issued_at().is_ok());

    let (status, _) = post_json(a.router(), "/variants", &json!({"chrom": "21", "start": "9825800"})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_json(a.router(), "/variants", &query).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].is_string());

    let conn = a.state.pool.get().unwrap();
    labshare_server::quota::reset(&conn, 2).unwrap();
    let (status, _) = post_json(a.router(), "/variants", &query).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn failed_public_lookup_keeps_its_quota() {
    let mut a = TestNode::with_config("LabA", |c| c.variants.public_daily_limit = 1).await;
    let missing = tempfile::tempdir().unwrap();
    a.state.variants = Arc::new(TsvVariantStore::new(missing.path().join("variants.tsv")));
    let query = json!({"chrom": "21", "start": 9825797});

    let (status, _) = post_json(a.router(), "/variants", &query).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let (status, _) = post_json(a.router(), "/variants", &query).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    a.state.variants = Arc::new(common::sample_variants());
    let (status, _) = post_json(a.router(), "/variants", &query).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = post_json(a.router(), "/variants", &query).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

async fn private_query_round_trip(iv_mode: IvMode) {
    let a = TestNode::with_config("LabA", |c| c.crypto.iv_mode = iv_mode).await;
    let (identity, pair) = a.register_user(today());
    let keys = tempfile::tempdir().unwrap();
    let requester =
        Requester::enroll(keys.path(), identity, pair, iv_mode, Duration::from_secs(5)).unwrap();

    let (query, request_id) = requester
        .build_private_query("21", Some(9825790), Some(9825800))
        .unwrap();
    let (status, body) = post_json(a.router(), "/variants-private", &query.into_value()).await;
    assert_eq!(status, StatusCode::OK);

    let answer = reply(body);
    let rows = requester
        .open_response(&answer, &request_id, &a.public_key())
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec!["21", "9825797", "A", "G"],
            vec!["21", "9825800", "C", "T"],
        ]
    );
}

#[tokio::test]
async fn tampered_or_unsigned_private_reply_is_refused() {
    let a = TestNode::new("LabA").await;
    let (identity, pair) = a.register_user(today());
    let keys = tempfile::tempdir().unwrap();
    let requester =
        Requester::enroll(keys.path(), identity, pair, IvMode::Fixed, Duration::from_secs(5))
            .unwrap();

    let (query, request_id) = requester.build_private_query("22", Some(100), None).unwrap();
    let (status, body) = post_json(a.router(), "/variants-private", &query.into_value()).await;
    assert_eq!(status, StatusCode::OK);
    let answer = reply(body);

    let mut tampered = answer.clone();
    tampered.insert("request_id", json!(RequestId::generate().as_str()));
    assert!(requester
        .open_response(&tampered, &request_id, &a.public_key())
        .is_err());

    let mut unsigned = answer.clone().into_value();
    unsigned.as_object_mut().unwrap().remove("signature");
    let unsigned = SignedMessage::from_value(unsigned).unwrap();
    assert!(requester
        .open_response(&unsigned, &request_id, &a.public_key())
        .is_err());

    // Signed by the right node, but the requester expected a different one.
    let other = KeyPair::generate(TEST_KEY_BITS).unwrap();
    assert!(requester
        .open_response(&answer, &request_id, other.public())
        .is_err());
}

#[tokio::test]
async fn private_query_is_decrypted_by_requester_with_fixed_iv() {
    private_query_round_trip(IvMode::Fixed).await;
}

#[tokio::test]
async fn private_query_is_decrypted_by_requester_with_random_iv() {
    private_query_round_trip(IvMode::Random).await;
}

#[tokio::test]
async fn private_query_from_expired_or_forged_user_is_forbidden() {
    let a = TestNode::new("LabA").await;

    let (expired, expired_pair) = a.register_user(days_ago(40));
    let query = SignedMessage::new()
        .with("user_id", json!(expired.to_string()))
        .with("chrom", json!("21"))
        .with("request_id", json!(RequestId::generate().as_str()));
    let (status, _) =
        post_json(a.router(), "/variants-private", &signed_with(&expired_pair, query)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (live, _) = a.register_user(today());
    let impostor = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let query = SignedMessage::new()
        .with("user_id", json!(live.to_string()))
        .with("chrom", json!("21"))
        .with("request_id", json!(RequestId::generate().as_str()));
    let (status, _) =
        post_json(a.router(), "/variants-private", &signed_with(&impostor, query.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = post_json(a.router(), "/variants-private", &query.into_value()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

fn user_request(identity: &Identity, pair: &KeyPair) -> SignedMessage {
    let mut message = SignedMessage::new()
        .with("user_id", json!(identity.to_string()))
        .with("request_id", json!(RequestId::generate().as_str()));
    message.sign(pair).unwrap();
    message
}

#[tokio::test]
async fn uploaded_data_is_stored_decrypted() {
    let a = TestNode::new("LabA").await;
    let (identity, pair) = a.register_user(today());

    let request = user_request(&identity, &pair);
    let (status, body) = post_json(a.router(), "/data-key", &request.clone().into_value()).await;
    assert_eq!(status, StatusCode::OK);
    let answer = reply(body);
    answer.verify_strict(&a.public_key()).unwrap();
    assert_eq!(answer.get_str("request_id"), request.get_str("request_id"));
    let key = unwrap_shared_key(answer.get_str("encryption_key").unwrap(), &pair).unwrap();

    let payload = EncryptedPayload::with_shared_key(b"sample 17: BRCA1 c.68_69del", &key, IvMode::Fixed);
    let upload = SignedMessage::new()
        .with("user_id", json!(identity.to_string()))
        .with("data", json!(payload.ciphertext()))
        .with("request_id", json!(RequestId::generate().as_str()));
    let (status, body) = post_json(a.router(), "/data", &signed_with(&pair, upload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply(body).get("result"), Some(&json!(true)));

    let stored: Vec<_> = std::fs::read_dir(&a.state.data_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(stored.len(), 1);
    assert!(stored[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .ends_with(&format!("{identity}.dat")));
    assert_eq!(std::fs::read(&stored[0]).unwrap(), b"sample 17: BRCA1 c.68_69del");
}

#[tokio::test]
async fn data_endpoints_refuse_unauthorized_users_and_bad_ciphertext() {
    let a = TestNode::new("LabA").await;

    let (expired, expired_pair) = a.register_user(days_ago(40));
    let (status, _) = post_json(
        a.router(),
        "/data-key",
        &user_request(&expired, &expired_pair).into_value(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (identity, pair) = a.register_user(today());
    let upload = SignedMessage::new()
        .with("user_id", json!(identity.to_string()))
        .with("data", json!("not hex at all"))
        .with("request_id", json!(RequestId::generate().as_str()));

    let impostor = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let (status, _) = post_json(a.router(), "/data", &signed_with(&impostor, upload.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = post_json(a.router(), "/data", &signed_with(&pair, upload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("decrypt"));
    assert_eq!(std::fs::read_dir(&a.state.data_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn nodes_is_empty_before_first_probe() {
    let a = TestNode::new("LabA").await;
    let (status, body) = get_json(a.router(), "/nodes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use clubhouse_api::middleware::Claims;
use clubhouse_api::{app, AppState, AuthConfig, LedgerSettings, Repositories};
use clubhouse_core::models::{
    BillingPeriod, Booking, BookingStatus, Offer, Partner, PayoutStatus, PricingSnapshot, SubscriptionStatus,
};
use clubhouse_core::payment::{CheckoutPaymentStatus, CheckoutSession, ConnectedAccount, ProcessorSubscription};
use clubhouse_core::MockPaymentProcessor;
use clubhouse_store::InMemoryStore;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
    processor: Arc<MockPaymentProcessor>,
}

fn test_app() -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let processor = Arc::new(MockPaymentProcessor::new());
    let state = AppState::new(
        Repositories::shared(store.clone()),
        processor.clone(),
        &LedgerSettings::default(),
        AuthConfig {
            secret: SECRET.to_string(),
        },
    )
    .unwrap();
    TestApp {
        router: app(state),
        store,
        processor,
    }
}

fn token(user_id: Uuid, role: &str) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        exp: (Utc::now() + Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn post(uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(t) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", t));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, bearer: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
        .body(Body::empty())
        .unwrap()
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send(router, req).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

struct Seeded {
    owner: Uuid,
    partner: Partner,
    offer: Offer,
    booking: Booking,
}

/// Partner with a charges-enabled account, one offer, one booking paid last month.
fn seed(t: &TestApp, amount: i64) -> Seeded {
    let owner = Uuid::new_v4();
    let partner = Partner {
        id: Uuid::new_v4(),
        owner_user_id: owner,
        name: "Harbour Yoga".to_string(),
        email: "owner@harbour.example".into(),
        connected_account_id: Some("acct_harbour".to_string()),
        charges_enabled: true,
        pending_penalties: 0,
    };
    t.store.seed_partner(partner.clone());
    t.processor.add_account(ConnectedAccount {
        id: "acct_harbour".to_string(),
        charges_enabled: true,
        payouts_enabled: true,
    });

    let offer = Offer {
        id: Uuid::new_v4(),
        partner_id: partner.id,
        title: "Sunrise flow".to_string(),
        base_price: amount,
        promo_price: None,
        commission_bps: None,
    };
    t.store.seed_offer(offer.clone());

    let subscriber = Uuid::new_v4();
    t.store.seed_subscriber(subscriber, "member@club.example", Some("Ada"));
    let last_month = BillingPeriod::prior_month(Utc::now().date_naive()).unwrap();
    let created_at = last_month.start_at() + Duration::days(1);
    let booking = Booking {
        id: Uuid::new_v4(),
        partner_id: partner.id,
        offer_id: offer.id,
        subscriber_id: subscriber,
        amount,
        status: BookingStatus::Paid,
        pricing: PricingSnapshot {
            unit_amount: amount,
            quantity: 1,
            total_amount: amount,
            commission_bps: 2000,
            platform_fee: amount / 5,
            partner_earnings: amount - amount / 5,
        },
        payment_intent_id: Some("pi_1".to_string()),
        cancellation: None,
        created_at,
        updated_at: created_at,
    };
    t.store.seed_booking(booking.clone());

    Seeded {
        owner,
        partner,
        offer,
        booking,
    }
}

#[tokio::test]
async fn test_health_is_public() {
    let t = test_app();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send_json(&t.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test]
async fn test_missing_or_bad_token_is_401() {
    let t = test_app();
    let body = json!({ "partner_id": Uuid::new_v4(), "amount": 100 });

    let (status, payload) = send_json(&t.router, post("/v1/wallet/debit", None, body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["success"], false);
    assert_eq!(payload["code"], "unauthenticated");

    let (status, _) = send_json(&t.router, post("/v1/wallet/debit", Some("not-a-jwt"), body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_quote_uses_default_commission() {
    let t = test_app();
    let s = seed(&t, 2_999);
    let user = token(Uuid::new_v4(), "MEMBER");

    let (status, body) = send_json(
        &t.router,
        post("/v1/bookings/quote", Some(&user), json!({ "offer_id": s.offer.id, "quantity": 3 })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_amount"], 8_997);
    assert_eq!(body["data"]["platform_fee"], 1_799);
    assert_eq!(body["data"]["partner_earnings"], 7_198);
}

#[tokio::test]
async fn test_record_booking_requires_operator() {
    let t = test_app();
    let s = seed(&t, 5_000);
    let body = json!({ "offer_id": s.offer.id, "subscriber_id": Uuid::new_v4(), "status": "paid" });

    let member = token(Uuid::new_v4(), "MEMBER");
    let (status, _) = send_json(&t.router, post("/v1/bookings", Some(&member), body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let service = token(Uuid::new_v4(), "SERVICE");
    let (status, payload) = send_json(&t.router, post("/v1/bookings", Some(&service), body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(payload["data"]["pricing"]["platform_fee"], 1_000);
}

#[tokio::test]
async fn test_partner_cancels_own_booking() {
    let t = test_app();
    let s = seed(&t, 10_000);
    t.processor.set_fee("pi_1", 320);
    let uri = format!("/v1/bookings/{}/cancel", s.booking.id);
    let reason = json!({ "reason": "Instructor is unwell today" });

    let stranger = token(Uuid::new_v4(), "PARTNER");
    let (status, _) = send_json(&t.router, post(&uri, Some(&stranger), reason.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let owner = token(s.owner, "PARTNER");
    let (status, body) = send_json(&t.router, post(&uri, Some(&owner), reason.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "cancelled");
    assert_eq!(body["data"]["penalty"], 820);
    assert_eq!(t.store.partner(s.partner.id).unwrap().pending_penalties, 820);

    let (status, body) = send_json(&t.router, post(&uri, Some(&owner), reason)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "already_cancelled");
    assert_eq!(t.processor.refunds().len(), 1);
}

#[tokio::test]
async fn test_short_reason_is_400() {
    let t = test_app();
    let s = seed(&t, 10_000);
    let owner = token(s.owner, "PARTNER");
    let uri = format!("/v1/bookings/{}/cancel", s.booking.id);

    let (status, body) = send_json(&t.router, post(&uri, Some(&owner), json!({ "reason": "   too short " }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn test_malformed_requests_use_error_envelope() {
    let t = test_app();
    let s = seed(&t, 10_000);
    let owner = token(s.owner, "PARTNER");
    let uri = format!("/v1/bookings/{}/cancel", s.booking.id);

    let (status, body) = send_json(&t.router, post(&uri, Some(&owner), json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "validation_error");
    assert!(body["error"].as_str().unwrap().contains("reason"));

    let (status, body) = send_json(
        &t.router,
        post("/v1/bookings/not-a-uuid/cancel", Some(&owner), json!({ "reason": "Venue flooded, cannot host" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "validation_error");

    let admin = token(Uuid::new_v4(), "ADMIN");
    let (status, body) = send_json(
        &t.router,
        post("/v1/admin/payouts/generate?date=yesterday", Some(&admin), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
    assert_eq!(t.store.booking(s.booking.id).unwrap().status, BookingStatus::Paid);
}

#[tokio::test]
async fn test_insufficient_wallet_is_200_with_success_false() {
    let t = test_app();
    let s = seed(&t, 1_000);
    let user = Uuid::new_v4();
    t.store.seed_wallet(user, s.partner.id, 300);

    let (status, body) = send_json(
        &t.router,
        post(
            "/v1/wallet/debit",
            Some(&token(user, "MEMBER")),
            json!({ "partner_id": s.partner.id, "amount": 500 }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "insufficient_funds");
    assert_eq!(body["balance"], 300);
    assert_eq!(t.store.wallet_balance(user, s.partner.id), Some(300));
}

#[tokio::test]
async fn test_unsynced_subscription_reports_needs_sync() {
    let t = test_app();
    t.processor.add_session(CheckoutSession {
        id: "cs_1".to_string(),
        payment_status: CheckoutPaymentStatus::Paid,
        subscription: Some(ProcessorSubscription {
            id: "sub_unknown".to_string(),
            status: SubscriptionStatus::Active,
            current_period_end: None,
            cancel_at_period_end: false,
        }),
    });

    let (status, body) = send_json(
        &t.router,
        post(
            "/v1/subscriptions/verify",
            Some(&token(Uuid::new_v4(), "MEMBER")),
            json!({ "session_id": "cs_1" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["needsSync"], true);
}

#[tokio::test]
async fn test_admin_jobs_are_operator_only() {
    let t = test_app();
    let member = token(Uuid::new_v4(), "MEMBER");
    let (status, _) = send_json(&t.router, post("/v1/admin/payouts/generate", Some(&member), json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = token(Uuid::new_v4(), "ADMIN");
    let (status, body) = send_json(&t.router, post("/v1/admin/reconciliation/sweep", Some(&admin), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["examined"], 0);
}

#[tokio::test]
async fn test_monthly_payout_end_to_end() {
    let t = test_app();
    let s = seed(&t, 10_000);
    let admin = token(Uuid::new_v4(), "ADMIN");
    let today = Utc::now().date_naive();

    let (status, body) = send_json(
        &t.router,
        post(&format!("/v1/admin/payouts/generate?date={}", today), Some(&admin), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["created"], 1);
    assert_eq!(body["data"]["total_transferable"], 8_000);

    let (status, body) = send_json(&t.router, post("/v1/admin/payouts/execute", Some(&admin), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["paid"], 1);

    let payout = t.store.payouts().remove(0);
    assert_eq!(payout.status, PayoutStatus::Paid);
    assert_eq!(t.processor.transfers()[0].amount, 8_000);

    let (status, text) = send(&t.router, get(&format!("/v1/statements/{}", payout.id), &token(s.owner, "PARTNER"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(text).unwrap().contains("Harbour Yoga"));

    let (status, _) = send(
        &t.router,
        get(&format!("/v1/statements/{}", payout.id), &token(Uuid::new_v4(), "PARTNER")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

mod common;

use axum::http::{Method, StatusCode};
use assert_matches::assert_matches;
use checkout_payments::{
    config::GatewayMode,
    entities::{payment, transaction},
    gateway::{CardData, GatewayError, HttpGateway, IntegritySigner, PaymentGateway, PaymentRequest},
};
use common::{
    checkout_body, line_item, response_json, test_config, TestApp, APPROVED_CARD,
    TEST_INTEGRITY_SECRET,
};
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::{json, Value};
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn mount_acceptance_and_tokenization(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/merchants/pub_test_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "presigned_acceptance": { "acceptance_token": "acc_tok_123" } }
        })))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/tokens/cards"))
        .and(header("authorization", "Bearer pub_test_key"))
        .and(body_partial_json(json!({
            "number": APPROVED_CARD,
            "cvc": "123",
            "exp_month": "08",
            "exp_year": "29",
            "card_holder": "ANA GOMEZ"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "status": "CREATED",
            "data": { "id": "tok_test_123" }
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn charge_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.expect("request recording");
    let charge = requests
        .iter()
        .find(|r| r.method.as_str() == "POST" && r.url.path() == "/transactions")
        .expect("charge submitted");
    serde_json::from_slice(&charge.body).expect("charge body is json")
}

#[tokio::test]
async fn live_checkout_sends_a_signed_charge() {
    let server = MockServer::start().await;
    mount_acceptance_and_tokenization(&server).await;

    Mock::given(method("POST"))
        .and(path("/transactions"))
        .and(header("authorization", "Bearer pub_test_key"))
        .and(body_partial_json(json!({
            "acceptance_token": "acc_tok_123",
            "amount_in_cents": 10_000_000,
            "currency": "COP",
            "customer_email": "ana@example.com",
            "public_key": "pub_test_key",
            "payment_method": { "type": "CARD", "installments": 1, "token": "tok_test_123" }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": {
                "id": "12-1718-555",
                "status": "APPROVED",
                "payment_method": { "type": "CARD", "token": "tok_test_123" }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::with_processor(&server.uri()).await;
    let mouse = app.seed_product("Wireless Mouse", 10, dec!(50000)).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/transactions/complete-payment",
            Some(checkout_body(
                vec![line_item(mouse.id, 2, "50000")],
                "100000",
                APPROVED_CARD,
            )),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["data"]["payment"]["status"], "APPROVED");
    assert_eq!(body["data"]["payment"]["gateway_transaction_id"], "12-1718-555");
    assert_eq!(body["data"]["payment"]["card_metadata"]["token"], "tok_test_123");
    assert_eq!(body["data"]["transaction"]["status"], "COMPLETED");
    assert_eq!(app.stock_of(mouse.id).await, 8);

    let charge = charge_body(&server).await;
    let reference = charge["reference"].as_str().unwrap();
    assert_eq!(
        reference,
        body["data"]["transaction"]["transaction_number"].as_str().unwrap()
    );

    let signer = IntegritySigner::new(TEST_INTEGRITY_SECRET).unwrap();
    let expected = signer.sign_fields([
        ("acceptance_token", "acc_tok_123"),
        ("amount_in_cents", "10000000"),
        ("currency", "COP"),
        ("public_key", "pub_test_key"),
        ("reference", reference),
    ]);
    assert_eq!(charge["signature"], expected.as_str());
}

#[tokio::test]
async fn usd_checkout_is_charged_in_cop() {
    let server = MockServer::start().await;
    mount_acceptance_and_tokenization(&server).await;

    Mock::given(method("POST"))
        .and(path("/transactions"))
        .and(body_partial_json(json!({ "amount_in_cents": 10_200_000, "currency": "COP" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": { "id": "12-1718-556", "status": "DECLINED" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::with_processor(&server.uri()).await;
    let cable = app.seed_product("USB Cable", 3, dec!(25.50)).await;

    let mut request = checkout_body(vec![line_item(cable.id, 1, "25.50")], "25.50", APPROVED_CARD);
    request["currency"] = json!("USD");

    let response = app
        .request(Method::POST, "/api/v1/transactions/complete-payment", Some(request))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["data"]["transaction"]["currency"], "USD");
    assert_eq!(body["data"]["payment"]["status"], "DECLINED");
    assert_eq!(body["data"]["transaction"]["status"], "FAILED");
    assert_eq!(app.stock_of(cable.id).await, 3);
}

#[tokio::test]
async fn processor_rejection_is_recorded_as_declined() {
    let server = MockServer::start().await;
    mount_acceptance_and_tokenization(&server).await;

    Mock::given(method("POST"))
        .and(path("/transactions"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": {
                "type": "INPUT_VALIDATION_ERROR",
                "messages": { "signature": ["La firma es inválida"] }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::with_processor(&server.uri()).await;
    let mouse = app.seed_product("Wireless Mouse", 10, dec!(50000)).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/transactions/complete-payment",
            Some(checkout_body(
                vec![line_item(mouse.id, 1, "50000")],
                "50000",
                APPROVED_CARD,
            )),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["data"]["payment"]["status"], "DECLINED");
    assert_eq!(body["data"]["transaction"]["status"], "FAILED");

    let audit = &body["data"]["payment"]["gateway_response"]["error"];
    assert_eq!(audit["type"], "PROCESSOR_REJECTED");
    assert_eq!(audit["stage"], "SIGNED");
    assert!(audit["message"].as_str().unwrap().contains("La firma es inválida"));
    assert!(body["data"]["payment"]["gateway_transaction_id"].is_null());
    assert_eq!(app.stock_of(mouse.id).await, 10);
}

#[tokio::test]
async fn unreachable_acceptance_endpoint_is_recorded_as_declined() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/merchants/pub_test_key"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/transactions"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let app = TestApp::with_processor(&server.uri()).await;
    let mouse = app.seed_product("Wireless Mouse", 10, dec!(50000)).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/transactions/complete-payment",
            Some(checkout_body(
                vec![line_item(mouse.id, 1, "50000")],
                "50000",
                APPROVED_CARD,
            )),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["data"]["payment"]["status"], "DECLINED");
    assert_eq!(body["data"]["payment"]["gateway_response"]["error"]["stage"], "INIT");
    assert_eq!(app.stock_of(mouse.id).await, 10);
}

#[tokio::test]
async fn processor_is_never_called_when_stock_is_short() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let app = TestApp::with_processor(&server.uri()).await;
    let mouse = app.seed_product("Wireless Mouse", 1, dec!(50000)).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/transactions/complete-payment",
            Some(checkout_body(
                vec![line_item(mouse.id, 2, "50000")],
                "100000",
                APPROVED_CARD,
            )),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let transactions = transaction::Entity::find().count(&*app.state.db).await.unwrap();
    let payments = payment::Entity::find().count(&*app.state.db).await.unwrap();
    assert_eq!((transactions, payments), (0, 0));
}

#[tokio::test]
async fn gateway_status_uses_the_private_key() {
    let server = MockServer::start().await;
    mount_acceptance_and_tokenization(&server).await;

    Mock::given(method("POST"))
        .and(path("/transactions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": { "id": "12-1718-557", "status": "APPROVED" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/transactions/12-1718-557"))
        .and(header("authorization", "Bearer prv_test_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "12-1718-557", "status": "VOIDED" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::with_processor(&server.uri()).await;
    let mouse = app.seed_product("Wireless Mouse", 10, dec!(50000)).await;

    let created = response_json(
        app.request(
            Method::POST,
            "/api/v1/transactions/complete-payment",
            Some(checkout_body(
                vec![line_item(mouse.id, 1, "50000")],
                "50000",
                APPROVED_CARD,
            )),
        )
        .await,
    )
    .await;
    let payment_id = created["data"]["payment"]["id"].as_str().unwrap();

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/transactions/payment/{}/gateway-status", payment_id),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["data"]["status"], "VOIDED");

    // The lookup is read-only; the local payment keeps its recorded outcome.
    let stored = app
        .state
        .services
        .transactions
        .find_payment(payment_id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status.to_string(), "APPROVED");
}

#[tokio::test]
async fn amount_below_minimum_never_reaches_the_processor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = test_config().gateway;
    config.mode = GatewayMode::Live;
    config.base_url = server.uri();
    let gateway = HttpGateway::new(&config).unwrap();

    let request = PaymentRequest {
        amount_in_cents: 500,
        currency: "COP".into(),
        reference: "TXN-1718000000000-AB12CD".into(),
        customer_email: "ana@example.com".into(),
        description: None,
    };
    let card = CardData::new(APPROVED_CARD, "123", "08", "29", "ANA GOMEZ");

    let result = gateway.process_payment(&request, &card).await;
    assert_matches!(
        result,
        Err(GatewayError::AmountTooLow {
            amount_in_cents: 500,
            minimum: 1000
        })
    );
}

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use qualipharm_store::api::{build_app, AppState};
use qualipharm_store::config::{AppConfig, GatewayCredentials};
use qualipharm_store::domain::aggregates::{Profile, ProfileDraft, Role};
use qualipharm_store::publisher::EventPublisher;
use qualipharm_store::store::{MemoryStore, Store};

struct TestApp {
    app: Router,
    admin: Profile,
    customer: Profile,
    seller: Profile,
    clerk: Profile,
}

async fn test_app(approval_rate: f64) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let register = |email: &str, role| {
        Profile::register(ProfileDraft {
            email: email.into(),
            first_name: "Test".into(),
            last_name: "User".into(),
            role,
            ..Default::default()
        })
        .expect("profile")
    };
    let admin = register("admin@qualipharm.test", Role::Administrator);
    let customer = register("cliente@qualipharm.test", Role::Customer);
    let seller = register("vendedor@qualipharm.test", Role::Seller);
    let clerk = register("bodega@qualipharm.test", Role::Inventory);
    for profile in [&admin, &customer, &seller, &clerk] {
        store.create_profile(profile).await.expect("seed profile");
    }

    let config = AppConfig {
        payment_approval_rate: approval_rate,
        gateways: GatewayCredentials { stripe_secret_key: Some("sk_test".into()), ..Default::default() },
        ..Default::default()
    };
    let app = build_app(AppState::new(store, config, EventPublisher::disabled()));
    TestApp { app, admin, customer, seller, clerk }
}

async fn send(app: &Router, method: &str, uri: &str, caller: Option<&Profile>, headers: &[(&str, &str)], body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(profile) = caller {
        builder = builder.header("x-profile-id", profile.id.to_string());
    }
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder.header("content-type", "application/json").body(Body::from(json.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body bytes");
    let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).expect("json body") };
    (status, json)
}

fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        other => other.to_string().parse().expect("decimal number"),
    }
}

/// Creates a product priced at `price` with one lot of `stock` units.
async fn stocked_product(t: &TestApp, code: &str, price: &str, stock: u32) -> String {
    let (status, body) = send(
        &t.app,
        "POST",
        "/api/products",
        Some(&t.admin),
        &[],
        Some(json!({ "code": code, "name": format!("Product {code}"), "sale_price": price })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let id = body["data"]["id"].as_str().expect("product id").to_string();

    let expires_on = (Utc::now().date_naive() + Duration::days(365)).to_string();
    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/api/products/{id}/lots"),
        Some(&t.admin),
        &[],
        Some(json!({ "quantity": stock, "expires_on": expires_on })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    id
}

async fn stock_of(t: &TestApp, product_id: &str) -> u64 {
    let (status, body) = send(&t.app, "GET", &format!("/api/products/{product_id}"), None, &[], None).await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["stock"].as_u64().expect("stock")
}

#[tokio::test]
async fn health_reports_store_and_echoes_request_id() {
    let t = test_app(1.0).await;
    let request = Request::builder().uri("/api/health").header("x-request-id", "abc-123").body(Body::empty()).unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "abc-123");
    let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["meta"]["request_id"], "abc-123");
}

#[tokio::test]
async fn cart_refuses_to_pass_stock() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "PARA-500", "2.50", 2).await;

    for expected in [1, 2] {
        let (status, body) = send(&t.app, "POST", "/api/cart/s-1/items", None, &[], Some(json!({ "product_id": product }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["item_count"], expected);
    }
    let (status, body) = send(&t.app, "POST", "/api/cart/s-1/items", None, &[], Some(json!({ "product_id": product }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "insufficient_stock");

    let (status, _) = send(&t.app, "PUT", &format!("/api/cart/s-1/items/{product}"), None, &[], Some(json!({ "quantity": 5 }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = send(&t.app, "GET", "/api/cart/s-1", None, &[], None).await;
    assert_eq!(body["data"]["item_count"], 2);
    assert_eq!(decimal(&body["data"]["total"]), Decimal::new(500, 2));
}

#[tokio::test]
async fn repeated_order_request_is_placed_once() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "IBU-400", "4.00", 5).await;
    let order = json!({ "items": [{ "product_id": product, "quantity": 2, "unit_price": "4.00" }], "discount": "1.00" });

    let (status, first) = send(&t.app, "POST", "/api/orders", Some(&t.customer), &[("idempotency-key", "order-1")], Some(order.clone())).await;
    assert_eq!(status, StatusCode::CREATED, "{first}");
    assert_eq!(first["data"]["status"], "pendiente");
    assert_eq!(decimal(&first["data"]["total"]["amount"]), Decimal::new(700, 2));

    let (status, second) = send(&t.app, "POST", "/api/orders", Some(&t.customer), &[("idempotency-key", "order-1")], Some(order)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["id"], first["data"]["id"]);
    assert_eq!(stock_of(&t, &product).await, 3);
}

#[tokio::test]
async fn insufficient_stock_on_any_line_changes_nothing() {
    let t = test_app(1.0).await;
    let plenty = stocked_product(&t, "AMOX", "8.00", 10).await;
    let scarce = stocked_product(&t, "LORA", "3.00", 1).await;
    let order = json!({ "items": [
        { "product_id": plenty, "quantity": 4, "unit_price": "8.00" },
        { "product_id": scarce, "quantity": 2, "unit_price": "3.00" }
    ]});

    let (status, body) = send(&t.app, "POST", "/api/orders", Some(&t.customer), &[], Some(order)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "insufficient_stock");
    assert!(body["error"]["message"].as_str().unwrap().contains(&scarce));

    assert_eq!(stock_of(&t, &plenty).await, 10);
    assert_eq!(stock_of(&t, &scarce).await, 1);
    let (_, orders) = send(&t.app, "GET", "/api/orders", Some(&t.admin), &[], None).await;
    assert_eq!(orders["data"]["total"], 0);
}

#[tokio::test]
async fn customers_cancel_their_own_orders_and_stock_returns() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "CETI", "5.00", 6).await;
    let (_, placed) = send(
        &t.app,
        "POST",
        "/api/orders",
        Some(&t.customer),
        &[],
        Some(json!({ "items": [{ "product_id": product, "quantity": 4, "unit_price": "5.00" }] })),
    )
    .await;
    let order_id = placed["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(stock_of(&t, &product).await, 2);

    let uri = format!("/api/orders/{order_id}/status");
    let (status, _) = send(&t.app, "PUT", &uri, Some(&t.customer), &[], Some(json!({ "status": "confirmada" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&t.app, "PUT", &uri, Some(&t.customer), &[], Some(json!({ "status": "cancelada" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelada");
    assert_eq!(stock_of(&t, &product).await, 6);

    let (status, body) = send(&t.app, "PUT", &uri, Some(&t.admin), &[], Some(json!({ "status": "cancelada" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn customers_only_see_their_own_orders() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "OMEP", "6.00", 5).await;
    let other = Uuid::now_v7();
    let (status, _) = send(
        &t.app,
        "POST",
        "/api/orders",
        Some(&t.customer),
        &[],
        Some(json!({ "customer_id": other, "items": [{ "product_id": product, "quantity": 1, "unit_price": "6.00" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, placed) = send(
        &t.app,
        "POST",
        "/api/orders",
        Some(&t.admin),
        &[],
        Some(json!({ "items": [{ "product_id": product, "quantity": 1, "unit_price": "6.00" }] })),
    )
    .await;
    let admin_order = placed["data"]["id"].as_str().unwrap();

    let (status, _) = send(&t.app, "GET", &format!("/api/orders/{admin_order}"), Some(&t.customer), &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, mine) = send(&t.app, "GET", "/api/orders", Some(&t.customer), &[], None).await;
    assert_eq!(mine["data"]["total"], 0);
}

#[tokio::test]
async fn catalog_writes_need_a_privileged_caller() {
    let t = test_app(1.0).await;
    let product = json!({ "code": "X-1", "name": "Gauze", "sale_price": "1.00" });

    let (status, body) = send(&t.app, "POST", "/api/products", None, &[], Some(product.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, body) = send(&t.app, "POST", "/api/products", Some(&t.customer), &[], Some(product)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let (status, _) = send(&t.app, "GET", "/api/users", Some(&t.customer), &[], None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn listing_reflects_new_stock_and_deactivation() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "VITC", "9.99", 3).await;

    let (_, listed) = send(&t.app, "GET", "/api/products?search=vitc", None, &[], None).await;
    assert_eq!(listed["data"]["total"], 1);
    assert_eq!(listed["data"]["data"][0]["stock"], 3);

    let expires_on = (Utc::now().date_naive() + Duration::days(30)).to_string();
    send(&t.app, "POST", &format!("/api/products/{product}/lots"), Some(&t.admin), &[], Some(json!({ "quantity": 2, "expires_on": expires_on }))).await;
    let (_, listed) = send(&t.app, "GET", "/api/products?search=vitc", None, &[], None).await;
    assert_eq!(listed["data"]["data"][0]["stock"], 5);

    let (status, _) = send(&t.app, "DELETE", &format!("/api/products/{product}"), Some(&t.admin), &[], None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, listed) = send(&t.app, "GET", "/api/products?search=vitc", None, &[], None).await;
    assert_eq!(listed["data"]["total"], 0);
    let (status, _) = send(&t.app, "GET", &format!("/api/products/{product}"), None, &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn approved_cash_payment_places_order_and_records_sale() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "GASA", "10.00", 4).await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/api/payment",
        None,
        &[],
        Some(json!({
            "paymentMethod": "efectivo",
            "userId": t.customer.id,
            "items": [{ "productId": product, "quantity": 2 }],
            "shippingAddress": "Av. 10 de Agosto",
            "shippingCity": "Quito"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["status"], "completed");
    assert!(body["data"]["payment_id"].as_str().unwrap().starts_with("PAY_"));
    assert_eq!(decimal(&body["data"]["sale"]["taxes"]), Decimal::new(300, 2));
    assert_eq!(decimal(&body["data"]["sale"]["total"]), Decimal::new(2300, 2));
    assert_eq!(stock_of(&t, &product).await, 2);

    let payment_id = body["data"]["payment_id"].as_str().unwrap();
    let (status, tracked) = send(&t.app, "GET", &format!("/api/payments/status/{payment_id}"), None, &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tracked["data"]["status"], "pending");
}

#[tokio::test]
async fn declined_payment_is_a_bad_request() {
    let t = test_app(0.0).await;
    let product = stocked_product(&t, "JER", "1.00", 4).await;
    let (status, body) = send(
        &t.app,
        "POST",
        "/api/payment",
        None,
        &[],
        Some(json!({ "paymentMethod": "cash", "customerId": t.customer.id, "items": [{ "productId": product, "quantity": 1 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "payment_declined");
    assert_eq!(stock_of(&t, &product).await, 4);
}

#[tokio::test]
async fn card_payment_completes_on_confirmation() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "TERM", "15.00", 3).await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/api/payment",
        None,
        &[],
        Some(json!({ "paymentMethod": "tarjeta", "customerEmail": t.customer.email, "items": [{ "productId": product, "quantity": 1 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    assert!(body["data"]["client_secret"].as_str().unwrap().contains("_secret_"));
    assert_eq!(stock_of(&t, &product).await, 3);

    let payment_id = body["data"]["payment_id"].as_str().unwrap().to_string();
    let (status, confirmed) = send(&t.app, "PUT", "/api/payment", None, &[], Some(json!({ "paymentIntentId": payment_id }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["data"]["replayed"], false);
    assert_eq!(stock_of(&t, &product).await, 2);

    let (_, again) = send(&t.app, "PUT", "/api/payment", None, &[], Some(json!({ "paymentId": payment_id }))).await;
    assert_eq!(again["data"]["replayed"], true);
    assert_eq!(again["data"]["order"]["id"], confirmed["data"]["order"]["id"]);
    assert_eq!(stock_of(&t, &product).await, 2);
}

#[tokio::test]
async fn payment_methods_follow_configured_gateways() {
    let t = test_app(1.0).await;
    let (status, body) = send(&t.app, "GET", "/api/payments/methods", None, &[], None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["data"]["methods"].as_array().unwrap().iter().map(|m| m["id"].as_str().unwrap()).collect();
    assert_eq!(ids, ["card", "bank_transfer", "cash"]);
}

#[tokio::test]
async fn self_registration_is_limited_to_customers() {
    let t = test_app(1.0).await;
    let (status, body) = send(
        &t.app,
        "POST",
        "/api/users",
        None,
        &[],
        Some(json!({ "email": "new@qualipharm.test", "first_name": "Ana", "last_name": "Vera" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["role"], "cliente");

    let seller = json!({ "email": "seller@qualipharm.test", "first_name": "Luis", "last_name": "Paz", "role": "vendedor" });
    let (status, _) = send(&t.app, "POST", "/api/users", None, &[], Some(seller.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&t.app, "POST", "/api/users", Some(&t.admin), &[], Some(seller)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        &t.app,
        "POST",
        "/api/users",
        None,
        &[],
        Some(json!({ "email": "NEW@qualipharm.test", "first_name": "Ana", "last_name": "Vera" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, listed) = send(&t.app, "GET", "/api/users?role=vendedor", Some(&t.admin), &[], None).await;
    assert_eq!(listed["data"]["total"], 1);
}

#[tokio::test]
async fn malformed_bodies_are_validation_errors_with_an_envelope() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "ASA", "1.50", 3).await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/api/orders",
        Some(&t.customer),
        &[("x-request-id", "neg-qty")],
        Some(json!({ "items": [{ "product_id": product, "quantity": -1, "unit_price": "1.50" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(body["meta"]["request_id"], "neg-qty");

    let (status, body) = send(
        &t.app,
        "POST",
        "/api/payment",
        None,
        &[],
        Some(json!({ "paymentMethod": "bitcoin", "customerId": t.customer.id, "items": [{ "productId": product, "quantity": 1 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
    assert!(body["meta"]["request_id"].is_string());

    let (status, body) = send(&t.app, "GET", "/api/orders/not-a-uuid", Some(&t.admin), &[], None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, body) = send(&t.app, "GET", "/api/orders?status=unknown", Some(&t.admin), &[], None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(stock_of(&t, &product).await, 3);
}

#[tokio::test]
async fn sub_cent_prices_are_rejected() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "ZINC", "2.00", 3).await;
    let (status, body) = send(
        &t.app,
        "POST",
        "/api/orders",
        Some(&t.customer),
        &[],
        Some(json!({ "items": [{ "product_id": product, "quantity": 1, "unit_price": "1.005" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(stock_of(&t, &product).await, 3);
}

#[tokio::test]
async fn only_sellers_place_orders_for_someone_else() {
    let t = test_app(1.0).await;
    let product = stocked_product(&t, "SUERO", "2.00", 5).await;
    let order = json!({ "customer_id": t.customer.id, "items": [{ "product_id": product, "quantity": 1, "unit_price": "2.00" }] });

    let (status, body) = send(&t.app, "POST", "/api/orders", Some(&t.clerk), &[], Some(order.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");
    assert_eq!(stock_of(&t, &product).await, 5);

    let (status, body) = send(&t.app, "POST", "/api/orders", Some(&t.seller), &[], Some(order)).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["customer_id"], t.customer.id.to_string());
    assert_eq!(stock_of(&t, &product).await, 4);
}

#[tokio::test]
async fn payment_methods_quote_fees_for_an_amount() {
    let t = test_app(1.0).await;
    let (status, body) = send(&t.app, "GET", "/api/payments/methods?amount=23.00", None, &[], None).await;
    assert_eq!(status, StatusCode::OK);
    let methods = body["data"]["methods"].as_array().unwrap();
    let card = methods.iter().find(|m| m["id"] == "card").unwrap();
    assert_eq!(decimal(&card["quote"]["fee"]), Decimal::new(97, 2));
    assert_eq!(decimal(&card["quote"]["total_with_fees"]), Decimal::new(2397, 2));
    let cash = methods.iter().find(|m| m["id"] == "cash").unwrap();
    assert_eq!(decimal(&cash["quote"]["total_with_fees"]), Decimal::new(2300, 2));

    let (_, plain) = send(&t.app, "GET", "/api/payments/methods", None, &[], None).await;
    assert!(plain["data"]["methods"][0].get("quote").is_none());

    let (status, body) = send(&t.app, "GET", "/api/payments/methods?amount=-1", None, &[], None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

//! Integration flows for the order placement and settlement pipeline.
//! They need a real Postgres; set TEST_DATABASE_URL (or DATABASE_URL) to run,
//! otherwise each test skips cleanly.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum_checkout_api::{
    config::{AppConfig, GatewayConfig},
    db::{create_orm_conn, create_pool, run_migrations},
    dto::orders::{CreateOrderRequest, OrderLineRequest},
    entity::{
        addresses::ActiveModel as AddressActive,
        coupons::ActiveModel as CouponActive,
        inventory::{ActiveModel as InventoryActive, Entity as Inventory},
        orders::Entity as Orders,
        products::ActiveModel as ProductActive,
        purchase_events::{Column as EventCol, Entity as PurchaseEvents},
        users::ActiveModel as UserActive,
    },
    error::{AppError, AppResult},
    gateway::{self, PaymentGateway, RemoteOrder, RemoteOrderRequest, RemotePayment},
    middleware::auth::AuthUser,
    services::{inventory_service, order_service, webhook_service},
    state::AppState,
};
use chrono::{Duration, Utc};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Set, Statement};
use serde_json::Value;
use uuid::Uuid;

const WEBHOOK_SECRET: &str = "whsec_test";

/// Tests share one database; serialize them so truncation cannot race.
static DB_GUARD: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Deterministic stand-in for the remote processor. Remembers the notes of
/// the last created order so `fetch_payment` can echo them back, the way the
/// real gateway round-trips metadata.
struct TestGateway {
    last_notes: Mutex<Value>,
}

impl TestGateway {
    fn new() -> Self {
        Self {
            last_notes: Mutex::new(Value::Null),
        }
    }
}

#[async_trait]
impl PaymentGateway for TestGateway {
    async fn create_remote_order(&self, req: RemoteOrderRequest) -> AppResult<RemoteOrder> {
        *self.last_notes.lock().unwrap() = req.notes.clone();
        Ok(RemoteOrder {
            id: format!("order_gw_{}", Uuid::new_v4().simple()),
            amount: req.amount_minor,
            currency: req.currency,
        })
    }

    async fn fetch_payment(&self, payment_id: &str) -> AppResult<RemotePayment> {
        Ok(RemotePayment {
            id: payment_id.to_string(),
            order_id: None,
            status: "captured".into(),
            notes: self.last_notes.lock().unwrap().clone(),
        })
    }
}

async fn setup_state(database_url: &str) -> anyhow::Result<AppState> {
    let pool = create_pool(database_url).await?;
    let orm = create_orm_conn(database_url).await?;
    run_migrations(&orm).await?;

    let backend = orm.get_database_backend();
    orm.execute(Statement::from_string(
        backend,
        "TRUNCATE TABLE purchase_events, order_summaries, order_items, orders, coupons, addresses, inventory, products, users, audit_logs CASCADE",
    ))
    .await?;

    let config = AppConfig {
        database_url: database_url.to_string(),
        host: "127.0.0.1".into(),
        port: 0,
        jwt_secret: "test-secret".into(),
        gateway: GatewayConfig {
            base_url: "http://gateway.invalid".into(),
            key_id: "key_test".into(),
            key_secret: "key_secret_test".into(),
            webhook_secret: Some(WEBHOOK_SECRET.into()),
            currency: "INR".into(),
        },
    };

    Ok(AppState {
        pool,
        orm,
        config: Arc::new(config),
        gateway: Arc::new(TestGateway::new()),
    })
}

fn test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
}

async fn create_user(state: &AppState, email: &str) -> anyhow::Result<Uuid> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(email.to_string()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(user.id)
}

async fn create_address(state: &AppState, user_id: Uuid) -> anyhow::Result<Uuid> {
    let address = AddressActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        recipient: Set("Test Buyer".into()),
        line1: Set("1 Test Lane".into()),
        line2: Set(None),
        city: Set("Pune".into()),
        region: Set("MH".into()),
        postal_code: Set("411001".into()),
        country: Set("IN".into()),
        phone: Set(None),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(address.id)
}

async fn create_product(
    state: &AppState,
    name: &str,
    price: f64,
    stock: i32,
) -> anyhow::Result<Uuid> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        description: Set(None),
        price: Set(price),
        image_url: Set(Some(format!("https://img.example/{name}.png"))),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    InventoryActive {
        product_id: Set(product.id),
        stock: Set(stock),
        reserved: Set(0),
        updated_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(product.id)
}

async fn inventory_row(state: &AppState, product_id: Uuid) -> anyhow::Result<(i32, i32)> {
    let row = Inventory::find_by_id(product_id)
        .one(&state.orm)
        .await?
        .expect("inventory row");
    Ok((row.stock, row.reserved))
}

fn captured_body(order_id: Uuid, gateway_order_id: &str, payment_id: &str) -> Vec<u8> {
    serde_json::json!({
        "event": "payment.captured",
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "order_id": gateway_order_id,
                    "notes": { "order_id": order_id }
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn end_to_end_checkout_and_idempotent_finalization() -> anyhow::Result<()> {
    let Some(url) = test_database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL to run integration flow tests.");
        return Ok(());
    };
    let _guard = DB_GUARD.lock().await;
    let state = setup_state(&url).await?;

    let user_id = create_user(&state, "buyer@example.com").await?;
    let address_id = create_address(&state, user_id).await?;
    let product_a = create_product(&state, "Widget A", 100.0, 5).await?;
    let product_b = create_product(&state, "Widget B", 250.0, 1).await?;
    let buyer = AuthUser { user_id };

    let resp = order_service::create_order(
        &state,
        &buyer,
        CreateOrderRequest {
            items: vec![
                OrderLineRequest {
                    product_id: product_a,
                    quantity: 2,
                },
                OrderLineRequest {
                    product_id: product_b,
                    quantity: 1,
                },
            ],
            shipping_address_id: address_id,
            billing_address_id: None,
            coupon_code: None,
        },
    )
    .await?;
    let created = resp.data.unwrap();

    // subtotal 450, shipping 50, tax 81, total 581 -> 58100 minor units
    assert_eq!(created.amount, 58100);
    assert!(created.order_number.starts_with("ORD-"));

    let order = Orders::find_by_id(created.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(order.subtotal, 450.0);
    assert_eq!(order.shipping, 50.0);
    assert_eq!(order.tax, 81.0);
    assert_eq!(order.total, 581.0);
    assert_eq!(order.payment_status, "pending");

    assert_eq!(inventory_row(&state, product_a).await?, (5, 2));
    assert_eq!(inventory_row(&state, product_b).await?, (1, 1));

    // Gateway confirms the payment.
    let body = captured_body(created.order_id, &created.gateway_order_id, "pay_e2e_1");
    let signature = gateway::sign_payload(&body, WEBHOOK_SECRET);
    let ack = webhook_service::handle_webhook(&state, &body, Some(&signature)).await?;
    assert_eq!(ack.data.unwrap().result, "processed");

    assert_eq!(inventory_row(&state, product_a).await?, (3, 0));
    assert_eq!(inventory_row(&state, product_b).await?, (0, 0));

    let order = Orders::find_by_id(created.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(order.order_status, "paid");
    assert_eq!(order.payment_status, "paid");
    assert_eq!(order.gateway_payment_id.as_deref(), Some("pay_e2e_1"));

    let events = PurchaseEvents::find()
        .filter(EventCol::OrderId.eq(created.order_id))
        .count(&state.orm)
        .await?;
    assert_eq!(events, 2);

    // Redelivery of the same event must be a no-op.
    let ack = webhook_service::handle_webhook(&state, &body, Some(&signature)).await?;
    assert_eq!(ack.data.unwrap().result, "already_processed");
    assert_eq!(inventory_row(&state, product_a).await?, (3, 0));
    assert_eq!(inventory_row(&state, product_b).await?, (0, 0));
    let events = PurchaseEvents::find()
        .filter(EventCol::OrderId.eq(created.order_id))
        .count(&state.orm)
        .await?;
    assert_eq!(events, 2);

    // The buyer-side mirror followed the transitions.
    let list = order_service::list_orders(&state, &buyer, Default::default()).await?;
    let summaries = list.data.unwrap().items;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].payment_status, "paid");
    assert_eq!(summaries[0].total, 581.0);

    Ok(())
}

#[tokio::test]
async fn tampered_webhook_signature_is_rejected_before_any_state_change() -> anyhow::Result<()> {
    let Some(url) = test_database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL to run integration flow tests.");
        return Ok(());
    };
    let _guard = DB_GUARD.lock().await;
    let state = setup_state(&url).await?;

    let user_id = create_user(&state, "buyer@example.com").await?;
    let address_id = create_address(&state, user_id).await?;
    let product = create_product(&state, "Widget", 100.0, 3).await?;
    let buyer = AuthUser { user_id };

    let created = order_service::create_order(
        &state,
        &buyer,
        CreateOrderRequest {
            items: vec![OrderLineRequest {
                product_id: product,
                quantity: 1,
            }],
            shipping_address_id: address_id,
            billing_address_id: None,
            coupon_code: None,
        },
    )
    .await?
    .data
    .unwrap();

    let body = captured_body(created.order_id, &created.gateway_order_id, "pay_bad");
    let signature = gateway::sign_payload(&body, "some-other-secret");

    let err = webhook_service::handle_webhook(&state, &body, Some(&signature))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized));

    let err = webhook_service::handle_webhook(&state, &body, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized));

    // Nothing was finalized.
    let order = Orders::find_by_id(created.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(order.payment_status, "pending");
    assert_eq!(inventory_row(&state, product).await?, (3, 1));

    Ok(())
}

#[tokio::test]
async fn webhook_without_notes_falls_back_to_payment_fetch() -> anyhow::Result<()> {
    let Some(url) = test_database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL to run integration flow tests.");
        return Ok(());
    };
    let _guard = DB_GUARD.lock().await;
    let state = setup_state(&url).await?;

    let user_id = create_user(&state, "buyer@example.com").await?;
    let address_id = create_address(&state, user_id).await?;
    let product = create_product(&state, "Widget", 120.0, 2).await?;
    let buyer = AuthUser { user_id };

    let created = order_service::create_order(
        &state,
        &buyer,
        CreateOrderRequest {
            items: vec![OrderLineRequest {
                product_id: product,
                quantity: 1,
            }],
            shipping_address_id: address_id,
            billing_address_id: None,
            coupon_code: None,
        },
    )
    .await?
    .data
    .unwrap();

    // Slim payload without notes: the service must fetch the payment record.
    let body = serde_json::json!({
        "event": "payment.captured",
        "payload": { "payment": { "entity": { "id": "pay_slim_1" } } }
    })
    .to_string()
    .into_bytes();
    let signature = gateway::sign_payload(&body, WEBHOOK_SECRET);

    let ack = webhook_service::handle_webhook(&state, &body, Some(&signature)).await?;
    assert_eq!(ack.data.unwrap().result, "processed");

    let order = Orders::find_by_id(created.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(order.payment_status, "paid");

    Ok(())
}

#[tokio::test]
async fn concurrent_orders_for_last_unit_one_wins() -> anyhow::Result<()> {
    let Some(url) = test_database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL to run integration flow tests.");
        return Ok(());
    };
    let _guard = DB_GUARD.lock().await;
    let state = setup_state(&url).await?;

    let user_id = create_user(&state, "buyer@example.com").await?;
    let address_id = create_address(&state, user_id).await?;
    let product = create_product(&state, "Last Widget", 99.0, 1).await?;
    let buyer = AuthUser { user_id };

    let request = || CreateOrderRequest {
        items: vec![OrderLineRequest {
            product_id: product,
            quantity: 1,
        }],
        shipping_address_id: address_id,
        billing_address_id: None,
        coupon_code: None,
    };

    let (first, second) = tokio::join!(
        order_service::create_order(&state, &buyer, request()),
        order_service::create_order(&state, &buyer, request()),
    );

    let results = [first, second];
    let won = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(won, 1, "exactly one of two racing orders must succeed");

    let lost = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one racing order must lose");
    match lost {
        AppError::InsufficientStock {
            product_id,
            requested,
            available,
        } => {
            assert_eq!(*product_id, product);
            assert_eq!(*requested, 1);
            assert_eq!(*available, 0);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }

    assert_eq!(inventory_row(&state, product).await?, (1, 1));

    Ok(())
}

#[tokio::test]
async fn coupon_usage_limit_gates_redemption_and_rolls_back_reservation() -> anyhow::Result<()> {
    let Some(url) = test_database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL to run integration flow tests.");
        return Ok(());
    };
    let _guard = DB_GUARD.lock().await;
    let state = setup_state(&url).await?;

    let user_id = create_user(&state, "buyer@example.com").await?;
    let address_id = create_address(&state, user_id).await?;
    let product = create_product(&state, "Widget", 200.0, 10).await?;
    let buyer = AuthUser { user_id };

    let now = Utc::now();
    CouponActive {
        code: Set("ONCE".into()),
        kind: Set("percent".into()),
        value: Set(10.0),
        min_subtotal: Set(None),
        max_discount: Set(None),
        valid_from: Set((now - Duration::days(1)).into()),
        valid_until: Set((now + Duration::days(1)).into()),
        usage_limit: Set(Some(1)),
        usage_count: Set(0),
        active: Set(true),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    let request = || CreateOrderRequest {
        items: vec![OrderLineRequest {
            product_id: product,
            quantity: 1,
        }],
        shipping_address_id: address_id,
        billing_address_id: None,
        coupon_code: Some("ONCE".into()),
    };

    let first = order_service::create_order(&state, &buyer, request()).await?;
    // 200 - 20 discount + 50 shipping + 32.4 tax
    assert_eq!(first.data.unwrap().amount, 26240);
    assert_eq!(inventory_row(&state, product).await?, (10, 1));

    let err = order_service::create_order(&state, &buyer, request())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    // The losing order's reservation rolled back with the transaction.
    assert_eq!(inventory_row(&state, product).await?, (10, 1));

    Ok(())
}

#[tokio::test]
async fn failed_payment_keeps_reservation_until_release() -> anyhow::Result<()> {
    let Some(url) = test_database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL to run integration flow tests.");
        return Ok(());
    };
    let _guard = DB_GUARD.lock().await;
    let state = setup_state(&url).await?;

    let user_id = create_user(&state, "buyer@example.com").await?;
    let address_id = create_address(&state, user_id).await?;
    let product = create_product(&state, "Widget", 150.0, 4).await?;
    let buyer = AuthUser { user_id };

    let created = order_service::create_order(
        &state,
        &buyer,
        CreateOrderRequest {
            items: vec![OrderLineRequest {
                product_id: product,
                quantity: 2,
            }],
            shipping_address_id: address_id,
            billing_address_id: None,
            coupon_code: None,
        },
    )
    .await?
    .data
    .unwrap();

    let body = serde_json::json!({
        "event": "payment.failed",
        "payload": {
            "payment": {
                "entity": {
                    "id": "pay_failed_1",
                    "notes": { "order_id": created.order_id }
                }
            }
        }
    })
    .to_string()
    .into_bytes();
    let signature = gateway::sign_payload(&body, WEBHOOK_SECRET);

    let ack = webhook_service::handle_webhook(&state, &body, Some(&signature)).await?;
    assert_eq!(ack.data.unwrap().result, "failure_recorded");

    let order = Orders::find_by_id(created.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(order.payment_status, "failed");
    // No inventory change on failure; the hold stays for the expiry sweep.
    assert_eq!(inventory_row(&state, product).await?, (4, 2));

    // The expiry sweep collaborator gives the units back.
    inventory_service::release(
        &state.orm,
        &[inventory_service::ReserveLine {
            product_id: product,
            quantity: 2,
        }],
    )
    .await?;
    assert_eq!(inventory_row(&state, product).await?, (4, 0));

    Ok(())
}

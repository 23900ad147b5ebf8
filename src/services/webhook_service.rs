//! Webhook intake and order finalization. This module is the only writer of
//! the `pending -> paid` transition.
//!
//! Gateways redeliver events, sometimes out of order, so everything here is
//! idempotent: the already-paid check under a row lock is the entire defense
//! against double-decrementing stock for one payment.

use chrono::Utc;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::webhooks::{WebhookAck, WebhookEvent},
    entity::{
        order_items::{Column as OrderItemCol, Entity as OrderItems},
        order_summaries::{Column as SummaryCol, Entity as OrderSummaries},
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders},
        purchase_events::ActiveModel as PurchaseEventActive,
    },
    error::{AppError, AppResult},
    gateway::verify_webhook_signature,
    response::{ApiResponse, Meta},
    services::inventory_service::{self, DecrementLine},
    state::AppState,
};

#[derive(Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    AlreadyProcessed,
}

/// Entry point for the gateway callback. Signature first, state changes
/// never before it.
pub async fn handle_webhook(
    state: &AppState,
    raw_body: &[u8],
    signature: Option<&str>,
) -> AppResult<ApiResponse<WebhookAck>> {
    match state.config.gateway.webhook_secret.as_deref() {
        Some(secret) => {
            let sig = signature.ok_or(AppError::Unauthorized)?;
            if !verify_webhook_signature(raw_body, sig, secret) {
                return Err(AppError::Unauthorized);
            }
        }
        None => {
            tracing::warn!(
                "webhook accepted WITHOUT signature verification: no webhook secret configured (test mode)"
            );
        }
    }

    let event: WebhookEvent = serde_json::from_slice(raw_body)
        .map_err(|_| AppError::BadRequest("malformed webhook payload".into()))?;

    match event.event.as_str() {
        "payment.captured" => {
            let payment = event
                .payload
                .payment
                .ok_or_else(|| AppError::BadRequest("event carries no payment entity".into()))?
                .entity;

            // The order id was planted in the payment notes at creation time.
            // Some gateways strip notes from slim webhook payloads, so fall
            // back to fetching the payment record before giving up.
            let order_id = match payment.notes.order_id {
                Some(id) => id,
                None => {
                    let fetched = state.gateway.fetch_payment(&payment.id).await?;
                    serde_json::from_value::<crate::dto::webhooks::PaymentNotes>(fetched.notes)
                        .ok()
                        .and_then(|n| n.order_id)
                        .ok_or_else(|| {
                            AppError::BadRequest("payment notes carry no order id".into())
                        })?
                }
            };

            let outcome = finalize_order(state, order_id, &payment.id, signature).await?;
            let result = match outcome {
                FinalizeOutcome::Finalized => "processed",
                FinalizeOutcome::AlreadyProcessed => "already_processed",
            };
            Ok(ApiResponse::success(
                "Ok",
                WebhookAck {
                    result: result.into(),
                },
                Some(Meta::empty()),
            ))
        }
        "payment.failed" => {
            let payment = event
                .payload
                .payment
                .ok_or_else(|| AppError::BadRequest("event carries no payment entity".into()))?
                .entity;
            let order_id = payment
                .notes
                .order_id
                .ok_or_else(|| AppError::BadRequest("payment notes carry no order id".into()))?;

            mark_payment_failed(state, order_id, &payment.id).await?;
            Ok(ApiResponse::success(
                "Ok",
                WebhookAck {
                    result: "failure_recorded".into(),
                },
                Some(Meta::empty()),
            ))
        }
        other => {
            tracing::debug!(event = other, "ignoring unhandled webhook event");
            Ok(ApiResponse::success(
                "Ok",
                WebhookAck {
                    result: "ignored".into(),
                },
                Some(Meta::empty()),
            ))
        }
    }
}

/// Finalize exactly once. The paid transition, the permanent inventory
/// decrement, the buyer-summary mirror and the purchase events commit as one
/// transaction; a redelivery that arrives later sees `paid` and does nothing.
pub async fn finalize_order(
    state: &AppState,
    order_id: Uuid,
    payment_id: &str,
    signature: Option<&str>,
) -> AppResult<FinalizeOutcome> {
    let txn = state.orm.begin().await?;

    let order = Orders::find()
        .filter(OrderCol::Id.eq(order_id))
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;

    if order.payment_status == "paid" {
        txn.rollback().await.ok();
        tracing::info!(order_id = %order_id, payment_id, "duplicate finalization ignored");
        return Ok(FinalizeOutcome::AlreadyProcessed);
    }

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&txn)
        .await?;

    let decrement_lines: Vec<DecrementLine> = items
        .iter()
        .map(|item| DecrementLine {
            product_id: item.product_id,
            quantity: item.quantity,
            reserved_amount: item.quantity,
        })
        .collect();
    inventory_service::decrement_in(&txn, &decrement_lines).await?;

    let user_id = order.user_id;
    let now = Utc::now();

    let mut active: OrderActive = order.into();
    active.payment_status = Set("paid".into());
    active.order_status = Set("paid".into());
    active.gateway_payment_id = Set(Some(payment_id.to_string()));
    active.gateway_signature = Set(signature.map(str::to_string));
    active.paid_at = Set(Some(now.into()));
    active.updated_at = Set(now.into());
    active.update(&txn).await?;

    OrderSummaries::update_many()
        .col_expr(SummaryCol::OrderStatus, Expr::value("paid"))
        .col_expr(SummaryCol::PaymentStatus, Expr::value("paid"))
        .col_expr(SummaryCol::UpdatedAt, Expr::value(now))
        .filter(SummaryCol::OrderId.eq(order_id))
        .exec(&txn)
        .await?;

    for item in &items {
        PurchaseEventActive {
            id: Set(Uuid::new_v4()),
            product_id: Set(item.product_id),
            user_id: Set(user_id),
            order_id: Set(order_id),
            created_at: Set(now.into()),
        }
        .insert(&txn)
        .await?;
    }

    txn.commit().await?;

    tracing::info!(order_id = %order_id, payment_id, "order finalized");

    if let Err(err) = log_audit(
        &state.pool,
        Some(user_id),
        "order_paid",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order_id, "payment_id": payment_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    trigger_receipt(order_id, user_id);

    Ok(FinalizeOutcome::Finalized)
}

/// Record a failed payment. The reservation stays until the expiry sweep
/// releases it; a `failed` arriving after `paid` (out-of-order redelivery)
/// is ignored.
pub async fn mark_payment_failed(
    state: &AppState,
    order_id: Uuid,
    payment_id: &str,
) -> AppResult<()> {
    let txn = state.orm.begin().await?;

    let order = Orders::find()
        .filter(OrderCol::Id.eq(order_id))
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;

    if order.payment_status == "paid" {
        txn.rollback().await.ok();
        tracing::warn!(order_id = %order_id, payment_id, "payment.failed after finalization ignored");
        return Ok(());
    }

    let now = Utc::now();
    let mut active: OrderActive = order.into();
    active.payment_status = Set("failed".into());
    active.gateway_payment_id = Set(Some(payment_id.to_string()));
    active.updated_at = Set(now.into());
    active.update(&txn).await?;

    OrderSummaries::update_many()
        .col_expr(SummaryCol::PaymentStatus, Expr::value("failed"))
        .col_expr(SummaryCol::UpdatedAt, Expr::value(now))
        .filter(SummaryCol::OrderId.eq(order_id))
        .exec(&txn)
        .await?;

    txn.commit().await?;

    tracing::info!(order_id = %order_id, payment_id, "payment failure recorded");
    Ok(())
}

/// Fire-and-forget receipt trigger for the email collaborator. Failures are
/// logged and can never affect finalization, which already committed.
fn trigger_receipt(order_id: Uuid, user_id: Uuid) {
    tokio::spawn(async move {
        tracing::info!(order_id = %order_id, user_id = %user_id, "receipt notification queued");
    });
}

//! Order creation and owner-scoped reads. This module is the only writer of
//! new orders.
//!
//! Creation runs as: validate -> snapshot catalog/address state -> price ->
//! open the remote gateway order -> one storage transaction that reserves
//! inventory, redeems the coupon, and persists the order aggregate plus the
//! buyer summary. An unpaid remote order is a harmless orphan, so a rolled
//! back transaction leaves nothing to compensate.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{CreateOrderRequest, CreateOrderResponse, OrderList, OrderWithItems},
    entity::{
        addresses::{Column as AddrCol, Entity as Addresses, Model as AddressModel},
        coupons::{Column as CouponCol, Entity as Coupons, Model as CouponModel},
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        order_summaries::{
            ActiveModel as SummaryActive, Column as SummaryCol, Entity as OrderSummaries,
            Model as SummaryModel,
        },
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        products::{Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    gateway::RemoteOrderRequest,
    middleware::auth::AuthUser,
    models::{Address, Coupon, CouponKind, Order, OrderItem, OrderSummary},
    pricing::{self, PricedLine},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    services::inventory_service::{self, ReserveLine},
    state::AppState,
};

const MAX_ORDER_LINES: usize = 25;

/// Line-item snapshot taken at creation time; later catalog edits never
/// touch it.
struct ItemSnapshot {
    product_id: Uuid,
    name: String,
    unit_price: f64,
    quantity: i32,
    image_url: Option<String>,
}

pub async fn create_order(
    state: &AppState,
    user: &AuthUser,
    payload: CreateOrderRequest,
) -> AppResult<ApiResponse<CreateOrderResponse>> {
    validate_request(&payload)?;

    let shipping = resolve_address(&state.orm, user.user_id, payload.shipping_address_id).await?;
    let billing = match payload.billing_address_id {
        Some(id) if id != payload.shipping_address_id => {
            resolve_address(&state.orm, user.user_id, id).await?
        }
        _ => shipping.clone(),
    };

    let snapshots = snapshot_products(&state.orm, &payload.items).await?;

    let coupon = match payload.coupon_code.as_deref() {
        Some(code) => Some(load_coupon(&state.orm, code).await?),
        None => None,
    };

    let priced_lines: Vec<PricedLine> = snapshots
        .iter()
        .map(|s| PricedLine {
            unit_price: s.unit_price,
            quantity: s.quantity,
        })
        .collect();
    let quote = pricing::price(&priced_lines, coupon.as_ref(), Utc::now())?;

    let order_id = Uuid::new_v4();
    let order_number = build_order_number(order_id);
    let amount_minor = pricing::to_minor_units(quote.total);

    // Open the remote order first: if anything after this fails, the unpaid
    // remote order simply expires on the gateway's side.
    let remote = state
        .gateway
        .create_remote_order(RemoteOrderRequest {
            amount_minor,
            currency: state.config.gateway.currency.clone(),
            receipt: order_number.clone(),
            notes: serde_json::json!({ "order_id": order_id }),
        })
        .await?;

    let reserve_lines: Vec<ReserveLine> = snapshots
        .iter()
        .map(|s| ReserveLine {
            product_id: s.product_id,
            quantity: s.quantity,
        })
        .collect();

    let shipping_json = serde_json::to_value(&shipping).map_err(anyhow::Error::from)?;
    let billing_json = serde_json::to_value(&billing).map_err(anyhow::Error::from)?;

    // Reservation, coupon redemption and persistence commit or roll back as
    // one unit; a lost race can never leak a reservation.
    let mut attempt: u32 = 0;
    let order = loop {
        let txn = state.orm.begin().await?;
        let result = persist_order(
            &txn,
            user.user_id,
            order_id,
            &order_number,
            &remote.id,
            &quote,
            payload.coupon_code.as_deref(),
            &snapshots,
            &reserve_lines,
            &shipping_json,
            &billing_json,
        )
        .await;

        match result {
            Ok(order) => match txn.commit().await {
                Ok(()) => break order,
                Err(err) if inventory_service::is_retryable(&err) => {
                    inventory_service::backoff_or_give_up(&mut attempt, &err).await?;
                }
                Err(err) => return Err(err.into()),
            },
            Err(AppError::OrmError(err)) if inventory_service::is_retryable(&err) => {
                txn.rollback().await.ok();
                inventory_service::backoff_or_give_up(&mut attempt, &err).await?;
            }
            Err(other) => {
                txn.rollback().await.ok();
                return Err(other);
            }
        }
    };

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_created",
        Some("orders"),
        Some(serde_json::json!({
            "order_id": order.id,
            "order_number": order.order_number,
            "total": order.total,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    tracing::info!(
        order_id = %order.id,
        order_number = %order.order_number,
        total = order.total,
        "order created"
    );

    Ok(ApiResponse::success(
        "Order created",
        CreateOrderResponse {
            order_id: order.id,
            order_number: order.order_number,
            gateway_order_id: remote.id,
            gateway_key: state.config.gateway.key_id.clone(),
            amount: amount_minor,
            currency: state.config.gateway.currency.clone(),
        },
        Some(Meta::empty()),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn persist_order<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    order_id: Uuid,
    order_number: &str,
    gateway_order_id: &str,
    quote: &pricing::Quote,
    coupon_code: Option<&str>,
    snapshots: &[ItemSnapshot],
    reserve_lines: &[ReserveLine],
    shipping_json: &serde_json::Value,
    billing_json: &serde_json::Value,
) -> AppResult<OrderModel> {
    inventory_service::reserve_in(conn, reserve_lines).await?;

    if let Some(code) = coupon_code {
        redeem_coupon(conn, code).await?;
    }

    let order = OrderActive {
        id: Set(order_id),
        user_id: Set(user_id),
        order_number: Set(order_number.to_string()),
        order_status: Set("created".into()),
        payment_status: Set("pending".into()),
        subtotal: Set(quote.subtotal),
        discount: Set(quote.discount),
        shipping: Set(quote.shipping),
        tax: Set(quote.tax),
        total: Set(quote.total),
        coupon_code: Set(coupon_code.map(str::to_string)),
        shipping_address: Set(shipping_json.clone()),
        billing_address: Set(billing_json.clone()),
        gateway_order_id: Set(Some(gateway_order_id.to_string())),
        gateway_payment_id: Set(None),
        gateway_signature: Set(None),
        paid_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(conn)
    .await?;

    for snap in snapshots {
        OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(snap.product_id),
            name: Set(snap.name.clone()),
            unit_price: Set(snap.unit_price),
            quantity: Set(snap.quantity),
            image_url: Set(snap.image_url.clone()),
            created_at: NotSet,
        }
        .insert(conn)
        .await?;
    }

    SummaryActive {
        order_id: Set(order.id),
        user_id: Set(user_id),
        order_number: Set(order_number.to_string()),
        total: Set(quote.total),
        order_status: Set("created".into()),
        payment_status: Set("pending".into()),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(conn)
    .await?;

    Ok(order)
}

/// The increment itself is the gate: zero rows affected means the limit was
/// hit by a concurrent redemption, and the whole order rolls back.
async fn redeem_coupon<C: ConnectionTrait>(conn: &C, code: &str) -> AppResult<()> {
    let result = Coupons::update_many()
        .col_expr(
            CouponCol::UsageCount,
            Expr::col(CouponCol::UsageCount).add(1),
        )
        .filter(
            Condition::all().add(CouponCol::Code.eq(code)).add(
                Condition::any()
                    .add(CouponCol::UsageLimit.is_null())
                    .add(Expr::col(CouponCol::UsageCount).lt(Expr::col(CouponCol::UsageLimit))),
            ),
        )
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(AppError::BadRequest(format!(
            "coupon {code} usage limit reached"
        )));
    }
    Ok(())
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all().add(SummaryCol::UserId.eq(user.user_id));
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(SummaryCol::OrderStatus.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);

    let mut finder = OrderSummaries::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(SummaryCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(SummaryCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(summary_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Ok", OrderList { items }, Some(meta)))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(id)),
        )
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("order".into()))?;

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "Ok",
        OrderWithItems {
            order: order_from_entity(order)?,
            items,
        },
        Some(Meta::empty()),
    ))
}

fn validate_request(payload: &CreateOrderRequest) -> AppResult<()> {
    if payload.items.is_empty() {
        return Err(AppError::Unprocessable("order has no items".into()));
    }
    if payload.items.len() > MAX_ORDER_LINES {
        return Err(AppError::Unprocessable(format!(
            "order exceeds {MAX_ORDER_LINES} lines"
        )));
    }
    let mut seen = HashSet::new();
    for line in &payload.items {
        if line.quantity <= 0 {
            return Err(AppError::Unprocessable(format!(
                "quantity for product {} must be positive",
                line.product_id
            )));
        }
        if !seen.insert(line.product_id) {
            return Err(AppError::Unprocessable(format!(
                "product {} appears more than once",
                line.product_id
            )));
        }
    }
    Ok(())
}

async fn resolve_address(
    orm: &crate::db::OrmConn,
    user_id: Uuid,
    address_id: Uuid,
) -> AppResult<Address> {
    let model: AddressModel = Addresses::find()
        .filter(
            Condition::all()
                .add(AddrCol::UserId.eq(user_id))
                .add(AddrCol::Id.eq(address_id)),
        )
        .one(orm)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("address {address_id}")))?;

    Ok(Address {
        recipient: model.recipient,
        line1: model.line1,
        line2: model.line2,
        city: model.city,
        region: model.region,
        postal_code: model.postal_code,
        country: model.country,
        phone: model.phone,
    })
}

async fn snapshot_products(
    orm: &crate::db::OrmConn,
    lines: &[crate::dto::orders::OrderLineRequest],
) -> AppResult<Vec<ItemSnapshot>> {
    let ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
    let products: HashMap<Uuid, _> = Products::find()
        .filter(ProdCol::Id.is_in(ids))
        .all(orm)
        .await?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    let mut snapshots = Vec::with_capacity(lines.len());
    for line in lines {
        let product = products
            .get(&line.product_id)
            .ok_or_else(|| AppError::NotFound(format!("product {}", line.product_id)))?;
        snapshots.push(ItemSnapshot {
            product_id: product.id,
            name: product.name.clone(),
            unit_price: product.price,
            quantity: line.quantity,
            image_url: product.image_url.clone(),
        });
    }
    Ok(snapshots)
}

async fn load_coupon(orm: &crate::db::OrmConn, code: &str) -> AppResult<Coupon> {
    let model = Coupons::find_by_id(code.to_string())
        .one(orm)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("coupon {code}")))?;
    coupon_from_entity(model)
}

fn coupon_from_entity(model: CouponModel) -> AppResult<Coupon> {
    let kind = match model.kind.as_str() {
        "percent" => CouponKind::Percent,
        "flat" => CouponKind::Flat,
        other => {
            return Err(AppError::Internal(anyhow::anyhow!(
                "coupon {} has unknown kind {other}",
                model.code
            )));
        }
    };
    Ok(Coupon {
        code: model.code,
        kind,
        value: model.value,
        min_subtotal: model.min_subtotal,
        max_discount: model.max_discount,
        valid_from: model.valid_from.with_timezone(&Utc),
        valid_until: model.valid_until.with_timezone(&Utc),
        usage_limit: model.usage_limit,
        usage_count: model.usage_count,
        active: model.active,
    })
}

pub(crate) fn order_from_entity(model: OrderModel) -> AppResult<Order> {
    let shipping_address: Address =
        serde_json::from_value(model.shipping_address).map_err(anyhow::Error::from)?;
    let billing_address: Address =
        serde_json::from_value(model.billing_address).map_err(anyhow::Error::from)?;

    Ok(Order {
        id: model.id,
        user_id: model.user_id,
        order_number: model.order_number,
        order_status: model.order_status,
        payment_status: model.payment_status,
        subtotal: model.subtotal,
        discount: model.discount,
        shipping: model.shipping,
        tax: model.tax,
        total: model.total,
        coupon_code: model.coupon_code,
        shipping_address,
        billing_address,
        gateway_order_id: model.gateway_order_id,
        gateway_payment_id: model.gateway_payment_id,
        paid_at: model.paid_at.map(|dt| dt.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    })
}

pub(crate) fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        name: model.name,
        unit_price: model.unit_price,
        quantity: model.quantity,
        image_url: model.image_url,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

pub(crate) fn summary_from_entity(model: SummaryModel) -> OrderSummary {
    OrderSummary {
        order_id: model.order_id,
        order_number: model.order_number,
        total: model.total,
        order_status: model.order_status,
        payment_status: model.payment_status,
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    }
}

fn build_order_number(order_id: Uuid) -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = order_id.to_string();
    let short = &suffix[..8];
    format!("ORD-{date}-{}", short.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::orders::OrderLineRequest;

    fn request(items: Vec<OrderLineRequest>) -> CreateOrderRequest {
        CreateOrderRequest {
            items,
            shipping_address_id: Uuid::new_v4(),
            billing_address_id: None,
            coupon_code: None,
        }
    }

    #[test]
    fn order_number_is_date_plus_id_prefix() {
        let id = Uuid::new_v4();
        let number = build_order_number(id);
        assert!(number.starts_with("ORD-"));
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
        assert_eq!(
            parts[2].to_lowercase(),
            id.to_string()[..8].to_string()
        );
    }

    #[test]
    fn empty_order_rejected() {
        assert!(matches!(
            validate_request(&request(vec![])),
            Err(AppError::Unprocessable(_))
        ));
    }

    #[test]
    fn non_positive_quantity_rejected() {
        let req = request(vec![OrderLineRequest {
            product_id: Uuid::new_v4(),
            quantity: 0,
        }]);
        assert!(matches!(
            validate_request(&req),
            Err(AppError::Unprocessable(_))
        ));
    }

    #[test]
    fn duplicate_product_rejected() {
        let id = Uuid::new_v4();
        let req = request(vec![
            OrderLineRequest {
                product_id: id,
                quantity: 1,
            },
            OrderLineRequest {
                product_id: id,
                quantity: 2,
            },
        ]);
        assert!(matches!(
            validate_request(&req),
            Err(AppError::Unprocessable(_))
        ));
    }

    #[test]
    fn oversized_order_rejected() {
        let items = (0..MAX_ORDER_LINES + 1)
            .map(|_| OrderLineRequest {
                product_id: Uuid::new_v4(),
                quantity: 1,
            })
            .collect();
        assert!(matches!(
            validate_request(&request(items)),
            Err(AppError::Unprocessable(_))
        ));
    }
}

//! Inventory Ledger: the only writer of `stock` and `reserved`.
//!
//! Every operation is all-or-nothing across the lines it is given. The
//! `*_in` variants run over a caller-supplied connection so orchestrating
//! services can fold them into a larger transaction; the standalone wrappers
//! open their own transaction and retry contention with bounded backoff.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    TransactionTrait,
};
use uuid::Uuid;

use crate::{
    db::OrmConn,
    entity::inventory::{Column as InvCol, Entity as Inventory, Model as InventoryModel},
    error::{AppError, AppResult},
};

#[derive(Debug, Clone, Copy)]
pub struct ReserveLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct DecrementLine {
    pub product_id: Uuid,
    pub quantity: i32,
    pub reserved_amount: i32,
}

/// product id -> units newly reserved by this call.
pub type ReservedMap = HashMap<Uuid, i32>;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(25);

/// Reserve units for every line, or nothing at all. The affected rows are
/// locked `FOR UPDATE` in ascending product-id order so two concurrent
/// reservations against overlapping products serialize instead of
/// deadlocking. The first shortfall aborts the whole batch and names the
/// product and its availability.
pub async fn reserve_in<C: ConnectionTrait>(
    conn: &C,
    lines: &[ReserveLine],
) -> AppResult<ReservedMap> {
    let rows = lock_rows(conn, lines.iter().map(|l| l.product_id)).await?;

    for line in lines {
        let available = rows
            .get(&line.product_id)
            .map(|r| r.stock - r.reserved)
            .unwrap_or(0);
        if available < line.quantity {
            return Err(AppError::InsufficientStock {
                product_id: line.product_id,
                requested: line.quantity,
                available,
            });
        }
    }

    let now = Utc::now();
    for line in lines {
        Inventory::update_many()
            .col_expr(
                InvCol::Reserved,
                Expr::col(InvCol::Reserved).add(line.quantity),
            )
            .col_expr(InvCol::UpdatedAt, Expr::value(now))
            .filter(InvCol::ProductId.eq(line.product_id))
            .exec(conn)
            .await?;
    }

    Ok(lines.iter().map(|l| (l.product_id, l.quantity)).collect())
}

/// Convert reservations into permanent stock deductions. A line whose
/// bookkeeping does not match (`reserved < reserved_amount`, or the decrement
/// would drive `stock` negative) is an invariant violation: it surfaces as an
/// internal error and aborts the transaction rather than being swallowed.
pub async fn decrement_in<C: ConnectionTrait>(
    conn: &C,
    lines: &[DecrementLine],
) -> AppResult<()> {
    let rows = lock_rows(conn, lines.iter().map(|l| l.product_id)).await?;

    for line in lines {
        let row = rows.get(&line.product_id).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "inventory row missing for product {} during decrement",
                line.product_id
            ))
        })?;
        if row.reserved < line.reserved_amount || row.stock < line.quantity {
            return Err(AppError::Internal(anyhow::anyhow!(
                "inventory invariant violated for product {}: stock={} reserved={} decrement qty={} reserved_amount={}",
                line.product_id,
                row.stock,
                row.reserved,
                line.quantity,
                line.reserved_amount
            )));
        }
    }

    let now = Utc::now();
    for line in lines {
        Inventory::update_many()
            .col_expr(InvCol::Stock, Expr::col(InvCol::Stock).sub(line.quantity))
            .col_expr(
                InvCol::Reserved,
                Expr::col(InvCol::Reserved).sub(line.reserved_amount),
            )
            .col_expr(InvCol::UpdatedAt, Expr::value(now))
            .filter(InvCol::ProductId.eq(line.product_id))
            .exec(conn)
            .await?;
    }

    Ok(())
}

/// Give reserved units back to the shelf without touching `stock`. Used when
/// an in-flight order is cancelled or expires.
pub async fn release_in<C: ConnectionTrait>(conn: &C, lines: &[ReserveLine]) -> AppResult<()> {
    let rows = lock_rows(conn, lines.iter().map(|l| l.product_id)).await?;

    for line in lines {
        let reserved = rows.get(&line.product_id).map(|r| r.reserved).unwrap_or(0);
        if reserved < line.quantity {
            return Err(AppError::Internal(anyhow::anyhow!(
                "release of {} units exceeds reservation {} for product {}",
                line.quantity,
                reserved,
                line.product_id
            )));
        }
    }

    let now = Utc::now();
    for line in lines {
        Inventory::update_many()
            .col_expr(
                InvCol::Reserved,
                Expr::col(InvCol::Reserved).sub(line.quantity),
            )
            .col_expr(InvCol::UpdatedAt, Expr::value(now))
            .filter(InvCol::ProductId.eq(line.product_id))
            .exec(conn)
            .await?;
    }

    Ok(())
}

/// Standalone reservation in its own transaction, retried on contention.
pub async fn reserve(orm: &OrmConn, lines: &[ReserveLine]) -> AppResult<ReservedMap> {
    let mut attempt: u32 = 0;
    loop {
        let txn = orm.begin().await?;
        match reserve_in(&txn, lines).await {
            Ok(map) => match txn.commit().await {
                Ok(()) => return Ok(map),
                Err(err) if is_retryable(&err) => {
                    backoff_or_give_up(&mut attempt, &err).await?;
                }
                Err(err) => return Err(err.into()),
            },
            Err(AppError::OrmError(err)) if is_retryable(&err) => {
                txn.rollback().await.ok();
                backoff_or_give_up(&mut attempt, &err).await?;
            }
            Err(other) => {
                txn.rollback().await.ok();
                return Err(other);
            }
        }
    }
}

/// Standalone release in its own transaction, retried on contention.
pub async fn release(orm: &OrmConn, lines: &[ReserveLine]) -> AppResult<()> {
    let mut attempt: u32 = 0;
    loop {
        let txn = orm.begin().await?;
        match release_in(&txn, lines).await {
            Ok(()) => match txn.commit().await {
                Ok(()) => return Ok(()),
                Err(err) if is_retryable(&err) => {
                    backoff_or_give_up(&mut attempt, &err).await?;
                }
                Err(err) => return Err(err.into()),
            },
            Err(AppError::OrmError(err)) if is_retryable(&err) => {
                txn.rollback().await.ok();
                backoff_or_give_up(&mut attempt, &err).await?;
            }
            Err(other) => {
                txn.rollback().await.ok();
                return Err(other);
            }
        }
    }
}

pub(crate) async fn backoff_or_give_up(attempt: &mut u32, err: &DbErr) -> AppResult<()> {
    *attempt += 1;
    if *attempt >= MAX_ATTEMPTS {
        tracing::warn!(error = %err, attempts = *attempt, "inventory transaction contention exhausted retries");
        return Err(AppError::Contention);
    }
    tracing::debug!(error = %err, attempt = *attempt, "retrying inventory transaction");
    tokio::time::sleep(BASE_BACKOFF * 2u32.pow(*attempt - 1)).await;
    Ok(())
}

pub(crate) fn is_retryable(err: &DbErr) -> bool {
    let msg = err.to_string();
    msg.contains("40001") || msg.contains("40P01") || msg.contains("deadlock")
}

async fn lock_rows<C: ConnectionTrait>(
    conn: &C,
    product_ids: impl Iterator<Item = Uuid>,
) -> Result<HashMap<Uuid, InventoryModel>, DbErr> {
    let ids: Vec<Uuid> = product_ids.collect();
    let rows = Inventory::find()
        .filter(InvCol::ProductId.is_in(ids))
        .order_by_asc(InvCol::ProductId)
        .lock(LockType::Update)
        .all(conn)
        .await?;
    Ok(rows.into_iter().map(|r| (r.product_id, r)).collect())
}

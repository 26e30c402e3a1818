use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use sea_orm::sea_query::LockType;
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::{
    audit,
    checkout,
    dto::{
        admin::{DashboardStats, InventoryAdjustRequest, OrderStatusCounts, RoleCounts},
        orders::{OrderDetail, OrderList, UpdateOrderStatusRequest},
        products::ProductList,
    },
    entity::{
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders},
        payments::{ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments},
        products::{ActiveModel as ProductActive, Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::{OrderStatus, PaymentMethod, PaymentStatus, Product},
    response::{ApiResponse, Meta},
    routes::params::{LowStockQuery, OrderListQuery},
    services::order_service::{cancel_locked, load_detail, paginate_orders},
    state::AppState,
};

pub const DEFAULT_LOW_STOCK_THRESHOLD: i32 = 5;

pub async fn list_all_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    ensure_admin(user)?;
    let mut condition = Condition::all();
    if let Some(status) = query.status {
        condition = condition.add(OrderCol::Status.eq(status));
    }
    paginate_orders(state, condition, &query).await
}

pub async fn get_order_admin(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderDetail>> {
    ensure_admin(user)?;
    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;
    let detail = load_detail(&state.orm, order).await?;
    Ok(ApiResponse::single("Order found", detail))
}

/// Moves an order along its lifecycle. Cancelling restores stock like a buyer cancellation,
/// and delivering a cash-on-delivery order settles its payment.
pub async fn update_order_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<OrderDetail>> {
    ensure_admin(user)?;
    payload.validate()?;

    let txn = state.orm.begin().await?;
    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    let previous = order.status;

    let order = if payload.status == OrderStatus::Cancelled {
        cancel_locked(&txn, order, payload.reason).await?
    } else {
        let payment = Payments::find()
            .filter(PaymentCol::OrderId.eq(order.id))
            .lock(LockType::Update)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("order {} has no payment", id)))?;

        checkout::ensure_status_change(order.status, payload.status, payment.method, payment.status)?;

        let now = Utc::now().fixed_offset();
        if payload.status == OrderStatus::Delivered
            && payment.method == PaymentMethod::CashOnDelivery
            && payment.status != PaymentStatus::Paid
        {
            let mut active: PaymentActive = payment.into();
            active.status = Set(PaymentStatus::Paid);
            active.verified_by = Set(Some(user.user_id));
            active.verified_at = Set(Some(now));
            active.updated_at = Set(now);
            active.update(&txn).await?;
        }

        let mut active: OrderActive = order.into();
        active.status = Set(payload.status);
        active.updated_at = Set(now);
        active.update(&txn).await?
    };

    let detail = load_detail(&txn, order).await?;
    txn.commit().await?;

    tracing::info!(
        order_id = %id,
        from = previous.as_str(),
        to = payload.status.as_str(),
        "order status updated"
    );
    audit::record(
        state,
        Some(user.user_id),
        "order_status_update",
        "orders",
        serde_json::json!({ "order_id": id, "from": previous, "to": payload.status }),
    )
    .await;

    Ok(ApiResponse::single("Order updated", detail))
}

pub async fn list_low_stock(
    state: &AppState,
    user: &AuthUser,
    query: LowStockQuery,
) -> AppResult<ApiResponse<ProductList>> {
    ensure_admin(user)?;
    let page = query.pagination();
    let threshold = query.threshold.unwrap_or(DEFAULT_LOW_STOCK_THRESHOLD).max(0);

    let finder = Products::find()
        .filter(ProdCol::Stock.lte(threshold))
        .order_by_asc(ProdCol::Stock)
        .order_by_asc(ProdCol::Name);
    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(page.limit_u64())
        .offset(page.offset_u64())
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Product::from)
        .collect();

    Ok(ApiResponse::success(
        "Low stock products",
        ProductList { items },
        Some(Meta::for_page(&page, total)),
    ))
}

pub async fn adjust_inventory(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: InventoryAdjustRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    let txn = state.orm.begin().await?;

    let product = Products::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    let new_stock = product
        .stock
        .checked_add(payload.delta)
        .filter(|s| *s >= 0)
        .ok_or_else(|| AppError::BadRequest("stock cannot be negative".into()))?;

    let mut active: ProductActive = product.into();
    active.stock = Set(new_stock);
    active.updated_at = Set(Utc::now().into());
    let updated = active.update(&txn).await?;

    txn.commit().await?;

    audit::record(
        state,
        Some(user.user_id),
        "inventory_adjust",
        "products",
        serde_json::json!({ "product_id": updated.id, "delta": payload.delta }),
    )
    .await;

    Ok(ApiResponse::single("Inventory updated", Product::from(updated)))
}

#[derive(Debug, FromRow)]
struct StatsRow {
    buyers: i64,
    sellers: i64,
    admins: i64,
    products: i64,
    pending: i64,
    processing: i64,
    shipped: i64,
    delivered: i64,
    cancelled: i64,
    paid_revenue: i64,
    pending_payments: i64,
}

impl From<StatsRow> for DashboardStats {
    fn from(row: StatsRow) -> Self {
        Self {
            users: RoleCounts {
                buyers: row.buyers,
                sellers: row.sellers,
                admins: row.admins,
            },
            products: row.products,
            orders: OrderStatusCounts {
                pending: row.pending,
                processing: row.processing,
                shipped: row.shipped,
                delivered: row.delivered,
                cancelled: row.cancelled,
            },
            paid_revenue: row.paid_revenue,
            pending_payments: row.pending_payments,
        }
    }
}

pub async fn dashboard_stats(
    state: &AppState,
    user: &AuthUser,
) -> AppResult<ApiResponse<DashboardStats>> {
    ensure_admin(user)?;
    let pool = state.orm.get_postgres_connection_pool();

    let row = sqlx::query_as::<_, StatsRow>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM users WHERE role = 'buyer') AS buyers,
            (SELECT COUNT(*) FROM users WHERE role = 'seller') AS sellers,
            (SELECT COUNT(*) FROM users WHERE role = 'admin') AS admins,
            (SELECT COUNT(*) FROM products) AS products,
            (SELECT COUNT(*) FROM orders WHERE status = 'pending') AS pending,
            (SELECT COUNT(*) FROM orders WHERE status = 'processing') AS processing,
            (SELECT COUNT(*) FROM orders WHERE status = 'shipped') AS shipped,
            (SELECT COUNT(*) FROM orders WHERE status = 'delivered') AS delivered,
            (SELECT COUNT(*) FROM orders WHERE status = 'cancelled') AS cancelled,
            (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM payments WHERE status = 'paid') AS paid_revenue,
            (SELECT COUNT(*) FROM payments WHERE status = 'pending') AS pending_payments
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(ApiResponse::single("Dashboard", DashboardStats::from(row)))
}

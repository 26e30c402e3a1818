use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use uuid::Uuid;
use validator::Validate;

use crate::{
    audit,
    checkout::{self, CheckoutError},
    dto::orders::{
        CancelOrderRequest, CheckoutRequest, OrderDetail, OrderList, SellerOrderLine,
        SellerOrderList, SubmitPaymentRequest,
    },
    entity::{
        cart_items::{Column as CartItemCol, Entity as CartItems},
        carts::{Column as CartCol, Entity as Carts},
        order_items::{ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems},
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        payments::{ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments},
        products::{Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_any_role, ensure_role},
    models::{Order, OrderItem, OrderStatus, Payment, PaymentMethod, PaymentStatus, UserRole},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, Pagination, SortOrder},
    state::AppState,
};

/// Converts the buyer's cart into an order in a single transaction.
///
/// Product rows are locked `FOR UPDATE` in id order, validated, and decremented with a
/// conditional update so stock can never go negative even if a lock is bypassed.
pub async fn checkout(
    state: &AppState,
    user: &AuthUser,
    payload: CheckoutRequest,
) -> AppResult<ApiResponse<OrderDetail>> {
    ensure_role(user, UserRole::Buyer)?;
    payload.validate()?;

    let txn = state.orm.begin().await?;

    let cart = Carts::find()
        .filter(CartCol::BuyerId.eq(user.user_id))
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(CheckoutError::EmptyCart)?;

    let cart_items = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart.id))
        .order_by_asc(CartItemCol::CreatedAt)
        .all(&txn)
        .await?;
    if cart_items.is_empty() {
        return Err(CheckoutError::EmptyCart.into());
    }

    let product_ids: BTreeSet<Uuid> = cart_items.iter().map(|i| i.product_id).collect();
    let products: HashMap<Uuid, _> = Products::find()
        .filter(ProdCol::Id.is_in(product_ids))
        .order_by_asc(ProdCol::Id)
        .lock(LockType::Update)
        .all(&txn)
        .await?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    let lines = checkout::build_lines(&cart_items, &products)?;
    let totals = checkout::compute_totals(&lines, &state.config.shipping)?;

    let now = Utc::now();
    let order_id = Uuid::new_v4();
    let shipping_address = serde_json::to_value(&payload.shipping_address)
        .map_err(|e| AppError::Internal(e.into()))?;

    let order = OrderActive {
        id: Set(order_id),
        order_number: Set(checkout::order_number(order_id, now)),
        buyer_id: Set(user.user_id),
        subtotal: Set(totals.subtotal),
        shipping_fee: Set(totals.shipping_fee),
        total: Set(totals.total),
        status: Set(OrderStatus::Pending),
        shipping_address: Set(shipping_address),
        notes: Set(payload.notes),
        cancel_reason: Set(None),
        cancelled_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut items: Vec<OrderItem> = Vec::with_capacity(lines.len());
    for line in &lines {
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(Some(line.product_id)),
            seller_id: Set(line.seller_id),
            product_name: Set(line.product_name.clone()),
            variant: Set(line.variant.clone()),
            quantity: Set(line.quantity),
            unit_price: Set(line.unit_price),
            line_total: Set(line.line_total),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
        items.push(OrderItem::from(item));

        let updated = Products::update_many()
            .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).sub(line.quantity))
            .col_expr(ProdCol::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(ProdCol::Id.eq(line.product_id))
            .filter(ProdCol::Stock.gte(line.quantity))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(AppError::BadRequest(format!(
                "Insufficient stock for {}",
                line.product_name
            )));
        }
    }

    let payment = PaymentActive {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        method: Set(payload.payment_method),
        amount: Set(totals.total),
        status: Set(PaymentStatus::Pending),
        reference: Set(None),
        proof_url: Set(None),
        notes: Set(None),
        submitted_at: Set(None),
        verified_by: Set(None),
        verified_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    CartItems::delete_many()
        .filter(CartItemCol::CartId.eq(cart.id))
        .exec(&txn)
        .await?;

    txn.commit().await?;

    tracing::info!(
        order_id = %order.id,
        order_number = %order.order_number,
        buyer_id = %user.user_id,
        total = order.total,
        lines = items.len(),
        "order placed"
    );

    audit::record(
        state,
        Some(user.user_id),
        "order_checkout",
        "orders",
        serde_json::json!({ "order_id": order.id, "total": order.total }),
    )
    .await;

    Ok(ApiResponse::single(
        "Checkout success",
        OrderDetail {
            order: Order::from(order),
            items,
            payment: Some(Payment::from(payment)),
        },
    ))
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let mut condition = Condition::all().add(OrderCol::BuyerId.eq(user.user_id));
    if let Some(status) = query.status {
        condition = condition.add(OrderCol::Status.eq(status));
    }
    paginate_orders(state, condition, &query).await
}

/// Shared by the buyer and admin order listings.
pub async fn paginate_orders(
    state: &AppState,
    condition: Condition,
    query: &OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let page = query.pagination();
    let mut finder = Orders::find().filter(condition);
    finder = match query.sort_order.unwrap_or_default() {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(page.limit_u64())
        .offset(page.offset_u64())
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Order::from)
        .collect();

    Ok(ApiResponse::success(
        "Orders",
        OrderList { items: orders },
        Some(Meta::for_page(&page, total)),
    ))
}

/// Buyers see their own orders; admins see any.
pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderDetail>> {
    let mut finder = Orders::find_by_id(id);
    if !user.is_admin() {
        finder = finder.filter(OrderCol::BuyerId.eq(user.user_id));
    }
    let order = finder.one(&state.orm).await?.ok_or(AppError::NotFound)?;

    let detail = load_detail(&state.orm, order).await?;
    Ok(ApiResponse::single("OK", detail))
}

pub async fn load_detail<C>(conn: &C, order: OrderModel) -> AppResult<OrderDetail>
where
    C: ConnectionTrait,
{
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .order_by_asc(OrderItemCol::CreatedAt)
        .all(conn)
        .await?
        .into_iter()
        .map(OrderItem::from)
        .collect();

    let payment = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .one(conn)
        .await?
        .map(Payment::from);

    Ok(OrderDetail {
        order: Order::from(order),
        items,
        payment,
    })
}

/// Cancels a locked order and puts its stock back.
///
/// Lines whose product has since been deleted are skipped. A pending payment is marked failed.
/// Callers must already hold the order row lock; product rows and then the payment row are
/// locked here.
pub async fn cancel_locked(
    txn: &DatabaseTransaction,
    order: OrderModel,
    reason: Option<String>,
) -> AppResult<OrderModel> {
    if !order.status.can_cancel() {
        return Err(AppError::BadRequest(format!(
            "Order can no longer be cancelled (status: {})",
            order.status.as_str()
        )));
    }

    let now = Utc::now().fixed_offset();
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(txn)
        .await?;

    // Products are touched in id order, matching the lock order of checkout.
    let mut restock: BTreeMap<Uuid, i32> = BTreeMap::new();
    for item in &items {
        if let Some(product_id) = item.product_id {
            *restock.entry(product_id).or_insert(0) += item.quantity;
        }
    }
    for (product_id, quantity) in restock {
        Products::update_many()
            .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).add(quantity))
            .col_expr(ProdCol::UpdatedAt, Expr::value(now))
            .filter(ProdCol::Id.eq(product_id))
            .exec(txn)
            .await?;
    }

    let payment = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .lock(LockType::Update)
        .one(txn)
        .await?;
    if let Some(payment) = payment.filter(|p| p.status == PaymentStatus::Pending) {
        let mut active: PaymentActive = payment.into();
        active.status = Set(PaymentStatus::Failed);
        active.notes = Set(Some("Order cancelled".to_string()));
        active.updated_at = Set(now);
        active.update(txn).await?;
    }

    let mut active: OrderActive = order.into();
    active.status = Set(OrderStatus::Cancelled);
    active.cancel_reason = Set(reason);
    active.cancelled_at = Set(Some(now));
    active.updated_at = Set(now);
    Ok(active.update(txn).await?)
}

pub async fn cancel_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: CancelOrderRequest,
) -> AppResult<ApiResponse<OrderDetail>> {
    payload.validate()?;
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .filter(OrderCol::BuyerId.eq(user.user_id))
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    let order = cancel_locked(&txn, order, payload.reason).await?;
    let detail = load_detail(&txn, order).await?;
    txn.commit().await?;

    tracing::info!(order_id = %id, buyer_id = %user.user_id, "order cancelled by buyer");
    audit::record(
        state,
        Some(user.user_id),
        "order_cancel",
        "orders",
        serde_json::json!({ "order_id": id }),
    )
    .await;

    Ok(ApiResponse::single("Order cancelled", detail))
}

/// Buyer-side bank transfer confirmation; the payment goes back to `pending` for review.
pub async fn submit_payment(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: SubmitPaymentRequest,
) -> AppResult<ApiResponse<Payment>> {
    payload.validate()?;
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .filter(OrderCol::BuyerId.eq(user.user_id))
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    if order.status == OrderStatus::Cancelled {
        return Err(AppError::BadRequest("Order is cancelled".into()));
    }

    let payment = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    if payment.method != PaymentMethod::BankTransfer {
        return Err(AppError::BadRequest(
            "Only bank transfer payments take a transfer proof".into(),
        ));
    }
    if payment.status == PaymentStatus::Paid {
        return Err(AppError::BadRequest("Payment already verified".into()));
    }

    let now = Utc::now().fixed_offset();
    let mut active: PaymentActive = payment.into();
    active.reference = Set(Some(payload.reference));
    active.proof_url = Set(payload.proof_url);
    active.status = Set(PaymentStatus::Pending);
    active.submitted_at = Set(Some(now));
    active.updated_at = Set(now);
    let payment = active.update(&txn).await?;
    txn.commit().await?;

    audit::record(
        state,
        Some(user.user_id),
        "payment_submit",
        "payments",
        serde_json::json!({ "order_id": id, "payment_id": payment.id }),
    )
    .await;

    Ok(ApiResponse::single("Payment submitted", Payment::from(payment)))
}

pub async fn list_seller_orders(
    state: &AppState,
    user: &AuthUser,
    pagination: Pagination,
) -> AppResult<ApiResponse<SellerOrderList>> {
    ensure_any_role(user, &[UserRole::Seller, UserRole::Admin])?;
    let page = pagination.normalize();

    let total = OrderItems::find()
        .filter(OrderItemCol::SellerId.eq(user.user_id))
        .count(&state.orm)
        .await? as i64;

    let rows = OrderItems::find()
        .filter(OrderItemCol::SellerId.eq(user.user_id))
        .order_by_desc(OrderItemCol::CreatedAt)
        .find_also_related(Orders)
        .limit(page.limit_u64())
        .offset(page.offset_u64())
        .all(&state.orm)
        .await?;

    let items = rows
        .into_iter()
        .filter_map(|(item, order)| {
            let order = order?;
            Some(SellerOrderLine {
                order_id: order.id,
                order_number: order.order_number,
                order_status: order.status,
                product_id: item.product_id,
                product_name: item.product_name,
                variant: item.variant,
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_total: item.line_total,
                ordered_at: order.created_at.with_timezone(&Utc),
            })
        })
        .collect();

    Ok(ApiResponse::success(
        "Seller orders",
        SellerOrderList { items },
        Some(Meta::for_page(&page, total)),
    ))
}

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use sea_orm::sea_query::LockType;
use uuid::Uuid;
use validator::Validate;

use crate::{
    audit,
    dto::{
        orders::OrderDetail,
        payments::{PaymentList, VerifyPaymentRequest},
    },
    entity::{
        orders::{ActiveModel as OrderActive, Entity as Orders},
        payments::{ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::{OrderStatus, Payment, PaymentMethod, PaymentStatus},
    response::{ApiResponse, Meta},
    routes::params::PaymentListQuery,
    services::order_service::load_detail,
    state::AppState,
};

pub async fn list_payments(
    state: &AppState,
    user: &AuthUser,
    query: PaymentListQuery,
) -> AppResult<ApiResponse<PaymentList>> {
    ensure_admin(user)?;
    let page = query.pagination();

    let mut condition = Condition::all();
    if let Some(status) = query.status {
        condition = condition.add(PaymentCol::Status.eq(status));
    }

    let finder = Payments::find()
        .filter(condition)
        .order_by_desc(PaymentCol::CreatedAt);
    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(page.limit_u64())
        .offset(page.offset_u64())
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Payment::from)
        .collect();

    Ok(ApiResponse::success(
        "Payments",
        PaymentList { items },
        Some(Meta::for_page(&page, total)),
    ))
}

/// Manual confirmation of a bank transfer. A paid verification moves a pending order to processing.
///
/// Locks the order row before the payment row, like every other order mutation.
pub async fn verify_payment(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: VerifyPaymentRequest,
) -> AppResult<ApiResponse<OrderDetail>> {
    ensure_admin(user)?;
    payload.validate()?;
    if payload.status == PaymentStatus::Pending {
        return Err(AppError::BadRequest(
            "Verification status must be paid or failed".into(),
        ));
    }

    let txn = state.orm.begin().await?;

    let order_id = Payments::find_by_id(id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?
        .order_id;
    let order = Orders::find_by_id(order_id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    let payment = Payments::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    if payment.method != PaymentMethod::BankTransfer {
        return Err(AppError::BadRequest(
            "Only bank transfer payments are verified manually".into(),
        ));
    }
    if payment.status != PaymentStatus::Pending {
        return Err(AppError::BadRequest("Payment has already been verified".into()));
    }
    if order.status == OrderStatus::Cancelled {
        return Err(AppError::BadRequest("Order is cancelled".into()));
    }

    let now = Utc::now().fixed_offset();
    let mut active: PaymentActive = payment.into();
    active.status = Set(payload.status);
    active.notes = Set(payload.notes);
    active.verified_by = Set(Some(user.user_id));
    active.verified_at = Set(Some(now));
    active.updated_at = Set(now);
    let payment = active.update(&txn).await?;

    let order = if payment.status == PaymentStatus::Paid && order.status == OrderStatus::Pending {
        let mut active: OrderActive = order.into();
        active.status = Set(OrderStatus::Processing);
        active.updated_at = Set(now);
        active.update(&txn).await?
    } else {
        order
    };

    let detail = load_detail(&txn, order).await?;
    txn.commit().await?;

    tracing::info!(
        payment_id = %id,
        order_id = %payment.order_id,
        status = ?payment.status,
        "payment verified"
    );
    audit::record(
        state,
        Some(user.user_id),
        "payment_verify",
        "payments",
        serde_json::json!({ "payment_id": id, "status": payment.status }),
    )
    .await;

    Ok(ApiResponse::single("Payment verified", detail))
}

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
    sea_query::{LockType, OnConflict},
};
use sea_orm::ActiveValue::NotSet;
use uuid::Uuid;
use validator::Validate;

use crate::{
    audit,
    checkout::{ensure_purchasable, validate_variant},
    dto::cart::{AddCartItemRequest, CartLineView, CartView, UpdateCartItemRequest},
    entity::{
        cart_items::{ActiveModel as CartItemActive, Column as CartItemCol, Entity as CartItems},
        carts::{ActiveModel as CartActive, Column as CartCol, Entity as Carts, Model as CartModel},
        products::{Entity as Products, Model as ProductModel},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_role},
    models::{Product, UserRole},
    response::ApiResponse,
    state::AppState,
};

/// Returns the buyer's cart, creating it on first use. Safe under concurrent first requests.
pub async fn get_or_create_cart<C>(conn: &C, buyer_id: Uuid) -> AppResult<CartModel>
where
    C: ConnectionTrait,
{
    if let Some(cart) = find_cart(conn, buyer_id).await? {
        return Ok(cart);
    }

    let active = CartActive {
        id: Set(Uuid::new_v4()),
        buyer_id: Set(buyer_id),
        created_at: NotSet,
        updated_at: NotSet,
    };
    Carts::insert(active)
        .on_conflict(OnConflict::column(CartCol::BuyerId).do_nothing().to_owned())
        .exec_without_returning(conn)
        .await?;

    find_cart(conn, buyer_id)
        .await?
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("cart missing after insert")))
}

pub async fn find_cart<C>(conn: &C, buyer_id: Uuid) -> AppResult<Option<CartModel>>
where
    C: ConnectionTrait,
{
    Ok(Carts::find()
        .filter(CartCol::BuyerId.eq(buyer_id))
        .one(conn)
        .await?)
}

async fn build_view(state: &AppState, cart: &CartModel) -> AppResult<CartView> {
    let rows = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart.id))
        .order_by_asc(CartItemCol::CreatedAt)
        .find_also_related(Products)
        .all(&state.orm)
        .await?;

    let mut items = Vec::with_capacity(rows.len());
    let mut subtotal: i64 = 0;
    let mut item_count: i64 = 0;
    for (item, product) in rows {
        let Some(product) = product else { continue };
        let line_total = product.price.saturating_mul(i64::from(item.quantity));
        subtotal = subtotal.saturating_add(line_total);
        item_count += i64::from(item.quantity);
        items.push(CartLineView {
            id: item.id,
            product: Product::from(product),
            quantity: item.quantity,
            variant: item.variant,
            line_total,
        });
    }

    Ok(CartView {
        id: cart.id,
        items,
        subtotal,
        item_count,
    })
}

/// Quantity of `product_id` already in the cart, excluding the line `skip`.
async fn quantity_in_cart<C>(
    conn: &C,
    cart_id: Uuid,
    product_id: Uuid,
    skip: Option<Uuid>,
) -> AppResult<i64>
where
    C: ConnectionTrait,
{
    let mut finder = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart_id))
        .filter(CartItemCol::ProductId.eq(product_id));
    if let Some(skip) = skip {
        finder = finder.filter(CartItemCol::Id.ne(skip));
    }
    Ok(finder
        .all(conn)
        .await?
        .iter()
        .map(|i| i64::from(i.quantity))
        .sum())
}

async fn load_product<C>(conn: &C, product_id: Uuid) -> AppResult<ProductModel>
where
    C: ConnectionTrait,
{
    Products::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| AppError::BadRequest("product not found".to_string()))
}

/// Locks the buyer's cart row so concurrent edits of the same cart run one at a time.
async fn lock_cart(txn: &DatabaseTransaction, buyer_id: Uuid) -> AppResult<CartModel> {
    let cart = get_or_create_cart(txn, buyer_id).await?;
    Carts::find_by_id(cart.id)
        .lock(LockType::Update)
        .one(txn)
        .await?
        .ok_or(AppError::NotFound)
}

async fn touch<C>(conn: &C, cart: &CartModel) -> AppResult<()>
where
    C: ConnectionTrait,
{
    let mut active: CartActive = cart.clone().into();
    active.updated_at = Set(Utc::now().into());
    active.update(conn).await?;
    Ok(())
}

pub async fn view_cart(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<CartView>> {
    ensure_role(user, UserRole::Buyer)?;
    let cart = get_or_create_cart(&state.orm, user.user_id).await?;
    let view = build_view(state, &cart).await?;
    Ok(ApiResponse::single("OK", view))
}

pub async fn add_item(
    state: &AppState,
    user: &AuthUser,
    payload: AddCartItemRequest,
) -> AppResult<ApiResponse<CartView>> {
    ensure_role(user, UserRole::Buyer)?;
    payload.validate()?;

    let product = load_product(&state.orm, payload.product_id).await?;
    let variant = payload
        .variant
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    validate_variant(&product, variant.as_deref())?;

    let txn = state.orm.begin().await?;
    let cart = lock_cart(&txn, user.user_id).await?;

    let mut finder = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart.id))
        .filter(CartItemCol::ProductId.eq(product.id));
    finder = match variant.as_deref() {
        Some(v) => finder.filter(CartItemCol::Variant.eq(v)),
        None => finder.filter(CartItemCol::Variant.is_null()),
    };
    let existing = finder.one(&txn).await?;

    let in_cart = quantity_in_cart(&txn, cart.id, product.id, None).await?;
    ensure_purchasable(&product, in_cart + i64::from(payload.quantity))?;

    match existing {
        Some(item) => {
            let quantity = item.quantity + payload.quantity;
            let mut active: CartItemActive = item.into();
            active.quantity = Set(quantity);
            active.updated_at = Set(Utc::now().into());
            active.update(&txn).await?;
        }
        None => {
            CartItemActive {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                product_id: Set(product.id),
                quantity: Set(payload.quantity),
                variant: Set(variant.clone()),
                created_at: NotSet,
                updated_at: NotSet,
            }
            .insert(&txn)
            .await
            .map_err(|e| AppError::conflict_on_unique(e, "Cart line already exists"))?;
        }
    }
    touch(&txn, &cart).await?;
    txn.commit().await?;

    audit::record(
        state,
        Some(user.user_id),
        "cart_add",
        "cart_items",
        serde_json::json!({
            "product_id": product.id,
            "quantity": payload.quantity,
            "variant": variant,
        }),
    )
    .await;

    let view = build_view(state, &cart).await?;
    Ok(ApiResponse::single("Added to cart", view))
}

pub async fn update_item(
    state: &AppState,
    user: &AuthUser,
    item_id: Uuid,
    payload: UpdateCartItemRequest,
) -> AppResult<ApiResponse<CartView>> {
    ensure_role(user, UserRole::Buyer)?;
    payload.validate()?;

    let txn = state.orm.begin().await?;
    let cart = lock_cart(&txn, user.user_id).await?;
    let item = CartItems::find_by_id(item_id)
        .filter(CartItemCol::CartId.eq(cart.id))
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    let product = load_product(&txn, item.product_id).await?;
    let others = quantity_in_cart(&txn, cart.id, product.id, Some(item.id)).await?;
    ensure_purchasable(&product, others + i64::from(payload.quantity))?;

    let mut active: CartItemActive = item.into();
    active.quantity = Set(payload.quantity);
    active.updated_at = Set(Utc::now().into());
    active.update(&txn).await?;
    touch(&txn, &cart).await?;
    txn.commit().await?;

    let view = build_view(state, &cart).await?;
    Ok(ApiResponse::single("Cart updated", view))
}

pub async fn remove_item(
    state: &AppState,
    user: &AuthUser,
    item_id: Uuid,
) -> AppResult<ApiResponse<CartView>> {
    ensure_role(user, UserRole::Buyer)?;
    let cart = find_cart(&state.orm, user.user_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let result = CartItems::delete_many()
        .filter(CartItemCol::Id.eq(item_id))
        .filter(CartItemCol::CartId.eq(cart.id))
        .exec(&state.orm)
        .await?;
    if result.rows_affected == 0 {
        return Err(AppError::NotFound);
    }
    touch(&state.orm, &cart).await?;

    audit::record(
        state,
        Some(user.user_id),
        "cart_remove",
        "cart_items",
        serde_json::json!({ "item_id": item_id }),
    )
    .await;

    let view = build_view(state, &cart).await?;
    Ok(ApiResponse::single("Removed from cart", view))
}

pub async fn clear_cart(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<CartView>> {
    ensure_role(user, UserRole::Buyer)?;
    let cart = get_or_create_cart(&state.orm, user.user_id).await?;
    CartItems::delete_many()
        .filter(CartItemCol::CartId.eq(cart.id))
        .exec(&state.orm)
        .await?;
    touch(&state.orm, &cart).await?;

    Ok(ApiResponse::single(
        "Cart cleared",
        CartView {
            id: cart.id,
            items: Vec::new(),
            subtotal: 0,
            item_count: 0,
        },
    ))
}

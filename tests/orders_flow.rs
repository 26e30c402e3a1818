use marketplace_api::{
    config::AppConfig,
    db::{create_orm_conn, run_migrations},
    dto::{
        auth::RegisterRequest,
        cart::AddCartItemRequest,
        orders::{
            CancelOrderRequest, CheckoutRequest, OrderDetail, SubmitPaymentRequest,
            UpdateOrderStatusRequest,
        },
        payments::VerifyPaymentRequest,
        products::{CreateProductRequest, UpdateProductRequest},
        users::UpdateUserRequest,
    },
    entity::{
        cart_items::{Column as CartItemCol, Entity as CartItems},
        products::Entity as Products,
        users::ActiveModel as UserActive,
    },
    error::AppError,
    middleware::auth::AuthUser,
    models::{OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress, UserRole},
    routes::params::Pagination,
    services::{
        admin_service, auth_service, cart_service, order_service, payment_service, product_service,
        user_service,
    },
    state::AppState,
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

// Each test creates its own users and products, so runs never need to truncate.
async fn setup_state() -> anyhow::Result<Option<AppState>> {
    let database_url = match std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!(
                "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
            );
            return Ok(None);
        }
    };

    let config = AppConfig::from_lookup(|key| match key {
        "DATABASE_URL" => Some(database_url.clone()),
        "JWT_SECRET" => Some("test-secret".to_string()),
        "SHIPPING_FLAT_FEE" => Some("20000".to_string()),
        "FREE_SHIPPING_THRESHOLD" => Some("500000".to_string()),
        _ => None,
    })?;
    let orm = create_orm_conn(&config.database_url).await?;
    run_migrations(&orm).await?;
    Ok(Some(AppState::new(orm, config)))
}

async fn create_user(state: &AppState, role: UserRole) -> anyhow::Result<AuthUser> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("{} tester", role.as_str())),
        email: Set(format!("{}-{}@example.com", role.as_str(), Uuid::new_v4())),
        password_hash: Set("dummy".into()),
        role: Set(role),
        phone: Set(None),
        is_active: Set(true),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(AuthUser {
        user_id: user.id,
        role,
    })
}

async fn create_product(
    state: &AppState,
    seller: &AuthUser,
    price: i64,
    stock: i32,
    variants: Vec<String>,
) -> anyhow::Result<Uuid> {
    let resp = product_service::create_product(
        state,
        seller,
        CreateProductRequest {
            name: "Test Widget".into(),
            description: Some("A product for testing".into()),
            price,
            stock,
            category_id: None,
            status: None,
            variants,
            images: vec![],
        },
    )
    .await?;
    Ok(resp.data.expect("product").id)
}

async fn stock_of(state: &AppState, product_id: Uuid) -> anyhow::Result<i32> {
    let product = Products::find_by_id(product_id)
        .one(&state.orm)
        .await?
        .expect("product exists");
    Ok(product.stock)
}

fn checkout_request(method: PaymentMethod) -> CheckoutRequest {
    CheckoutRequest {
        shipping_address: ShippingAddress {
            recipient_name: "Test Buyer".into(),
            phone: "08123456789".into(),
            street: "Jl. Testing 1".into(),
            city: "Bandung".into(),
            province: None,
            postal_code: "40111".into(),
            country: None,
        },
        payment_method: method,
        notes: None,
    }
}

async fn add(
    state: &AppState,
    buyer: &AuthUser,
    product_id: Uuid,
    quantity: i32,
    variant: Option<&str>,
) -> Result<(), AppError> {
    cart_service::add_item(
        state,
        buyer,
        AddCartItemRequest {
            product_id,
            quantity,
            variant: variant.map(str::to_string),
        },
    )
    .await
    .map(|_| ())
}

#[tokio::test]
async fn checkout_cancel_and_bank_transfer_lifecycle() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let buyer = create_user(&state, UserRole::Buyer).await?;
    let admin = create_user(&state, UserRole::Admin).await?;

    let product_id = create_product(&state, &seller, 100_000, 10, vec!["S".into(), "M".into()]).await?;

    // Two lines of the same product in different variants share one stock pool.
    add(&state, &buyer, product_id, 2, Some("S")).await?;
    add(&state, &buyer, product_id, 1, Some("M")).await?;
    add(&state, &buyer, product_id, 1, Some("S")).await?;
    assert!(matches!(
        add(&state, &buyer, product_id, 1, Some("XXL")).await,
        Err(AppError::BadRequest(_))
    ));
    assert!(matches!(
        add(&state, &buyer, product_id, 7, Some("M")).await,
        Err(AppError::BadRequest(_))
    ));

    let cart = cart_service::view_cart(&state, &buyer).await?.data.expect("cart");
    assert_eq!(cart.items.len(), 2);
    assert_eq!(cart.item_count, 4);
    assert_eq!(cart.subtotal, 400_000);

    let detail = order_service::checkout(&state, &buyer, checkout_request(PaymentMethod::BankTransfer))
        .await?
        .data
        .expect("order detail");
    assert_eq!(detail.order.status, OrderStatus::Pending);
    assert_eq!(detail.order.subtotal, 400_000);
    assert_eq!(detail.order.shipping_fee, 20_000);
    assert_eq!(detail.order.total, 420_000);
    assert!(detail.order.order_number.starts_with("ORD-"));
    assert_eq!(detail.items.len(), 2);
    let payment = detail.payment.expect("payment");
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount, 420_000);

    assert_eq!(stock_of(&state, product_id).await?, 6);
    let cart = cart_service::view_cart(&state, &buyer).await?.data.expect("cart");
    assert!(cart.items.is_empty());

    // Empty cart cannot be checked out again.
    assert!(matches!(
        order_service::checkout(&state, &buyer, checkout_request(PaymentMethod::BankTransfer)).await,
        Err(AppError::BadRequest(_))
    ));

    // Buyer cancellation restores stock and fails the pending payment.
    let cancelled = order_service::cancel_order(
        &state,
        &buyer,
        detail.order.id,
        CancelOrderRequest {
            reason: Some("changed my mind".into()),
        },
    )
    .await?
    .data
    .expect("cancelled order");
    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.order.cancel_reason.as_deref(), Some("changed my mind"));
    assert_eq!(cancelled.payment.expect("payment").status, PaymentStatus::Failed);
    assert_eq!(stock_of(&state, product_id).await?, 10);

    assert!(matches!(
        order_service::cancel_order(&state, &buyer, detail.order.id, CancelOrderRequest::default()).await,
        Err(AppError::BadRequest(_))
    ));

    // Second order: transfer proof, admin verification, then shipping.
    add(&state, &buyer, product_id, 5, Some("M")).await?;
    let detail = order_service::checkout(&state, &buyer, checkout_request(PaymentMethod::BankTransfer))
        .await?
        .data
        .expect("order detail");
    assert_eq!(detail.order.shipping_fee, 0, "500k subtotal ships free");
    assert_eq!(stock_of(&state, product_id).await?, 5);

    // Unpaid bank transfers cannot start processing.
    assert!(matches!(
        admin_service::update_order_status(
            &state,
            &admin,
            detail.order.id,
            UpdateOrderStatusRequest {
                status: OrderStatus::Processing,
                reason: None,
            },
        )
        .await,
        Err(AppError::BadRequest(_))
    ));

    let payment = order_service::submit_payment(
        &state,
        &buyer,
        detail.order.id,
        SubmitPaymentRequest {
            reference: "TRX-0001".into(),
            proof_url: Some("https://example.com/proof.jpg".into()),
        },
    )
    .await?
    .data
    .expect("payment");
    assert_eq!(payment.reference.as_deref(), Some("TRX-0001"));

    let verified = payment_service::verify_payment(
        &state,
        &admin,
        payment.id,
        VerifyPaymentRequest {
            status: PaymentStatus::Paid,
            notes: None,
        },
    )
    .await?
    .data
    .expect("verified order");
    assert_eq!(verified.order.status, OrderStatus::Processing);
    assert_eq!(verified.payment.expect("payment").status, PaymentStatus::Paid);

    for next in [OrderStatus::Shipped, OrderStatus::Delivered] {
        let updated = admin_service::update_order_status(
            &state,
            &admin,
            detail.order.id,
            UpdateOrderStatusRequest {
                status: next,
                reason: None,
            },
        )
        .await?
        .data
        .expect("order");
        assert_eq!(updated.order.status, next);
    }

    assert!(matches!(
        order_service::cancel_order(&state, &buyer, detail.order.id, CancelOrderRequest::default()).await,
        Err(AppError::BadRequest(_))
    ));

    let seller_lines = order_service::list_seller_orders(&state, &seller, Pagination::default())
        .await?
        .data
        .expect("seller lines");
    assert_eq!(seller_lines.items.len(), 3);

    Ok(())
}

#[tokio::test]
async fn cash_on_delivery_is_settled_on_delivery() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let buyer = create_user(&state, UserRole::Buyer).await?;
    let admin = create_user(&state, UserRole::Admin).await?;
    let product_id = create_product(&state, &seller, 50_000, 3, vec![]).await?;

    add(&state, &buyer, product_id, 1, None).await?;
    let detail = order_service::checkout(&state, &buyer, checkout_request(PaymentMethod::CashOnDelivery))
        .await?
        .data
        .expect("order detail");

    assert!(matches!(
        order_service::submit_payment(
            &state,
            &buyer,
            detail.order.id,
            SubmitPaymentRequest {
                reference: "N/A".into(),
                proof_url: None,
            },
        )
        .await,
        Err(AppError::BadRequest(_))
    ));

    let payment_id = detail.payment.as_ref().expect("payment").id;
    assert!(matches!(
        payment_service::verify_payment(
            &state,
            &admin,
            payment_id,
            VerifyPaymentRequest {
                status: PaymentStatus::Failed,
                notes: None,
            },
        )
        .await,
        Err(AppError::BadRequest(_))
    ));

    let mut last = None;
    for next in [OrderStatus::Processing, OrderStatus::Shipped, OrderStatus::Delivered] {
        last = admin_service::update_order_status(
            &state,
            &admin,
            detail.order.id,
            UpdateOrderStatusRequest {
                status: next,
                reason: None,
            },
        )
        .await?
        .data;
    }
    let delivered = last.expect("delivered order");
    assert_eq!(delivered.order.status, OrderStatus::Delivered);
    assert_eq!(delivered.payment.expect("payment").status, PaymentStatus::Paid);
    assert_eq!(stock_of(&state, product_id).await?, 2);

    Ok(())
}

#[tokio::test]
async fn concurrent_checkouts_never_oversell() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let product_id = create_product(&state, &seller, 10_000, 5, vec![]).await?;

    let mut buyers = Vec::new();
    for _ in 0..4 {
        let buyer = create_user(&state, UserRole::Buyer).await?;
        add(&state, &buyer, product_id, 2, None).await?;
        buyers.push(buyer);
    }

    let handles: Vec<_> = buyers
        .into_iter()
        .map(|buyer| {
            let state = state.clone();
            tokio::spawn(async move {
                order_service::checkout(&state, &buyer, checkout_request(PaymentMethod::CashOnDelivery))
                    .await
                    .is_ok()
            })
        })
        .collect();

    let mut placed = 0;
    for handle in handles {
        if handle.await? {
            placed += 1;
        }
    }

    assert_eq!(placed, 2);
    assert_eq!(stock_of(&state, product_id).await?, 1);

    Ok(())
}

/// Errors a caller is expected to see when two requests race on the same order.
fn is_client_error(err: &AppError) -> bool {
    matches!(err, AppError::BadRequest(_) | AppError::NotFound)
}

async fn place_order(
    state: &AppState,
    buyer: &AuthUser,
    lines: &[(Uuid, i32)],
    method: PaymentMethod,
) -> anyhow::Result<OrderDetail> {
    for (product_id, quantity) in lines {
        add(state, buyer, *product_id, *quantity, None).await?;
    }
    let detail = order_service::checkout(state, buyer, checkout_request(method))
        .await?
        .data
        .expect("order detail");
    Ok(detail)
}

#[tokio::test]
async fn order_lines_keep_checkout_snapshot() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let buyer = create_user(&state, UserRole::Buyer).await?;
    let product_id = create_product(&state, &seller, 75_000, 10, vec![]).await?;
    let detail = place_order(&state, &buyer, &[(product_id, 2)], PaymentMethod::BankTransfer).await?;

    product_service::update_product(
        &state,
        &seller,
        product_id,
        UpdateProductRequest {
            name: Some("Renamed Widget".into()),
            price: Some(99_000),
            ..Default::default()
        },
    )
    .await?;

    let reread = order_service::get_order(&state, &buyer, detail.order.id)
        .await?
        .data
        .expect("order detail");
    assert_eq!(reread.items.len(), 1);
    assert_eq!(reread.items[0].product_name, "Test Widget");
    assert_eq!(reread.items[0].unit_price, 75_000);
    assert_eq!(reread.items[0].line_total, 150_000);
    assert_eq!(reread.order.subtotal, 150_000);

    Ok(())
}

#[tokio::test]
async fn admin_cancellation_restores_stock_and_fails_payment() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let buyer = create_user(&state, UserRole::Buyer).await?;
    let admin = create_user(&state, UserRole::Admin).await?;
    let product_id = create_product(&state, &seller, 10_000, 8, vec![]).await?;
    let detail = place_order(&state, &buyer, &[(product_id, 3)], PaymentMethod::BankTransfer).await?;
    assert_eq!(stock_of(&state, product_id).await?, 5);

    let cancelled = admin_service::update_order_status(
        &state,
        &admin,
        detail.order.id,
        UpdateOrderStatusRequest {
            status: OrderStatus::Cancelled,
            reason: Some("out of delivery area".into()),
        },
    )
    .await?
    .data
    .expect("order detail");

    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.order.cancel_reason.as_deref(), Some("out of delivery area"));
    assert!(cancelled.order.cancelled_at.is_some());
    assert_eq!(cancelled.payment.expect("payment").status, PaymentStatus::Failed);
    assert_eq!(stock_of(&state, product_id).await?, 8);

    Ok(())
}

#[tokio::test]
async fn cancelling_after_product_deletion_skips_missing_line() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let buyer = create_user(&state, UserRole::Buyer).await?;
    let kept = create_product(&state, &seller, 10_000, 5, vec![]).await?;
    let removed = create_product(&state, &seller, 20_000, 5, vec![]).await?;
    let detail =
        place_order(&state, &buyer, &[(kept, 2), (removed, 1)], PaymentMethod::CashOnDelivery).await?;

    product_service::delete_product(&state, &seller, removed).await?;

    let cancelled = order_service::cancel_order(&state, &buyer, detail.order.id, CancelOrderRequest::default())
        .await?
        .data
        .expect("order detail");
    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
    assert_eq!(stock_of(&state, kept).await?, 5);

    let orphan = cancelled
        .items
        .iter()
        .find(|item| item.unit_price == 20_000)
        .expect("line of deleted product");
    assert_eq!(orphan.product_id, None);
    assert_eq!(orphan.product_name, "Test Widget");
    assert!(Products::find_by_id(removed).one(&state.orm).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn admins_cannot_demote_or_deactivate_themselves() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let admin = create_user(&state, UserRole::Admin).await?;
    let seller = create_user(&state, UserRole::Seller).await?;

    for payload in [
        UpdateUserRequest {
            role: Some(UserRole::Buyer),
            is_active: None,
        },
        UpdateUserRequest {
            role: None,
            is_active: Some(false),
        },
    ] {
        assert!(matches!(
            user_service::update_user(&state, &admin, admin.user_id, payload).await,
            Err(AppError::BadRequest(_))
        ));
    }

    let updated = user_service::update_user(
        &state,
        &admin,
        seller.user_id,
        UpdateUserRequest {
            role: None,
            is_active: Some(false),
        },
    )
    .await?
    .data
    .expect("user");
    assert!(!updated.is_active);

    let me = user_service::get_user(&state, &admin, admin.user_id)
        .await?
        .data
        .expect("user");
    assert_eq!(me.role, UserRole::Admin);
    assert!(me.is_active);

    Ok(())
}

#[tokio::test]
async fn duplicate_email_registration_conflicts() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let email = format!("dup-{}@example.com", Uuid::new_v4());
    let request = |email: String| RegisterRequest {
        name: "Dup Tester".into(),
        email,
        password: "password123".into(),
        role: None,
        phone: None,
    };

    auth_service::register_user(&state, request(email.clone())).await?;
    assert!(matches!(
        auth_service::register_user(&state, request(email.to_uppercase())).await,
        Err(AppError::Conflict(_))
    ));

    Ok(())
}

#[tokio::test]
async fn blank_product_name_is_rejected() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let result = product_service::create_product(
        &state,
        &seller,
        CreateProductRequest {
            name: "   ".into(),
            description: None,
            price: 1_000,
            stock: 1,
            category_id: None,
            status: None,
            variants: vec![],
            images: vec![],
        },
    )
    .await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    let product_id = create_product(&state, &seller, 1_000, 1, vec![]).await?;
    let result = product_service::update_product(
        &state,
        &seller,
        product_id,
        UpdateProductRequest {
            name: Some("  ".into()),
            ..Default::default()
        },
    )
    .await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    Ok(())
}

#[tokio::test]
async fn verification_racing_cancellation_never_deadlocks() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let admin = create_user(&state, UserRole::Admin).await?;
    let product_id = create_product(&state, &seller, 10_000, 1_000, vec![]).await?;

    let rounds = 20;
    for _ in 0..rounds {
        let buyer = create_user(&state, UserRole::Buyer).await?;
        let detail = place_order(&state, &buyer, &[(product_id, 1)], PaymentMethod::BankTransfer).await?;
        let payment = order_service::submit_payment(
            &state,
            &buyer,
            detail.order.id,
            SubmitPaymentRequest {
                reference: "TRX-RACE".into(),
                proof_url: None,
            },
        )
        .await?
        .data
        .expect("payment");

        let verify = {
            let (state, admin) = (state.clone(), admin.clone());
            tokio::spawn(async move {
                payment_service::verify_payment(
                    &state,
                    &admin,
                    payment.id,
                    VerifyPaymentRequest {
                        status: PaymentStatus::Paid,
                        notes: None,
                    },
                )
                .await
                .map(|_| ())
            })
        };
        let cancel = {
            let (state, buyer) = (state.clone(), buyer.clone());
            let order_id = detail.order.id;
            tokio::spawn(async move {
                order_service::cancel_order(&state, &buyer, order_id, CancelOrderRequest::default())
                    .await
                    .map(|_| ())
            })
        };

        for result in [verify.await?, cancel.await?] {
            if let Err(err) = result {
                assert!(is_client_error(&err), "unexpected error: {err:?}");
            }
        }

        let order = order_service::get_order(&state, &buyer, detail.order.id)
            .await?
            .data
            .expect("order detail");
        let payment = order.payment.expect("payment");
        match order.order.status {
            OrderStatus::Cancelled => assert_ne!(payment.status, PaymentStatus::Pending),
            OrderStatus::Processing => assert_eq!(payment.status, PaymentStatus::Paid),
            other => panic!("unexpected status {other:?}"),
        }
    }

    Ok(())
}

#[tokio::test]
async fn cancellation_racing_checkout_never_deadlocks() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let a = create_product(&state, &seller, 10_000, 1_000, vec![]).await?;
    let b = create_product(&state, &seller, 10_000, 1_000, vec![]).await?;
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };

    let rounds = 20;
    for _ in 0..rounds {
        // Lines stored high id first, the reverse of checkout's lock order.
        let canceller = create_user(&state, UserRole::Buyer).await?;
        let placed =
            place_order(&state, &canceller, &[(hi, 1), (lo, 1)], PaymentMethod::CashOnDelivery).await?;

        let shopper = create_user(&state, UserRole::Buyer).await?;
        add(&state, &shopper, lo, 1, None).await?;
        add(&state, &shopper, hi, 1, None).await?;

        let cancel = {
            let state = state.clone();
            let order_id = placed.order.id;
            tokio::spawn(async move {
                order_service::cancel_order(&state, &canceller, order_id, CancelOrderRequest::default())
                    .await
                    .map(|_| ())
            })
        };
        let checkout = {
            let state = state.clone();
            tokio::spawn(async move {
                order_service::checkout(&state, &shopper, checkout_request(PaymentMethod::CashOnDelivery))
                    .await
                    .map(|_| ())
            })
        };

        cancel.await?.map_err(|e| anyhow::anyhow!("cancel failed: {e:?}"))?;
        checkout.await?.map_err(|e| anyhow::anyhow!("checkout failed: {e:?}"))?;
    }

    // Each round's cancelled order gave its units back; each shopper kept one of each.
    assert_eq!(stock_of(&state, lo).await?, 1_000 - rounds);
    assert_eq!(stock_of(&state, hi).await?, 1_000 - rounds);

    Ok(())
}

#[tokio::test]
async fn concurrent_adds_merge_into_one_line() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let seller = create_user(&state, UserRole::Seller).await?;
    let buyer = create_user(&state, UserRole::Buyer).await?;
    let product_id = create_product(&state, &seller, 10_000, 100, vec!["Red".into()]).await?;

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let (state, buyer) = (state.clone(), buyer.clone());
            tokio::spawn(async move { add(&state, &buyer, product_id, 2, Some("Red")).await })
        })
        .collect();
    for handle in handles {
        handle.await?.map_err(|e| anyhow::anyhow!("add failed: {e:?}"))?;
    }

    let lines = CartItems::find()
        .filter(CartItemCol::ProductId.eq(product_id))
        .all(&state.orm)
        .await?;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].quantity, 10);

    Ok(())
}

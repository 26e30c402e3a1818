use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        admin::{DashboardStats, InventoryAdjustRequest, OrderStatusCounts, RoleCounts},
        auth::{LoginRequest, LoginResponse, RegisterRequest},
        cart::{AddCartItemRequest, CartLineView, CartView, UpdateCartItemRequest},
        categories::{CategoryList, CreateCategoryRequest, UpdateCategoryRequest},
        orders::{
            CancelOrderRequest, CheckoutRequest, OrderDetail, OrderList, SellerOrderLine,
            SellerOrderList, SubmitPaymentRequest, UpdateOrderStatusRequest,
        },
        payments::{PaymentList, VerifyPaymentRequest},
        products::{CreateProductRequest, ProductList, UpdateProductRequest},
        users::{UpdateUserRequest, UserList},
    },
    models::{
        Category, Order, OrderItem, OrderStatus, Payment, PaymentMethod, PaymentStatus, Product,
        ProductStatus, ShippingAddress, User, UserRole,
    },
    response::{ApiResponse, Meta},
    routes::{
        admin, auth, cart, categories, health, orders, params, products as product_routes, seller,
    },
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::register,
        auth::login,
        auth::me,
        categories::list_categories,
        categories::get_category,
        categories::create_category,
        categories::update_category,
        categories::delete_category,
        product_routes::list_products,
        product_routes::list_my_products,
        product_routes::get_product,
        product_routes::create_product,
        product_routes::update_product,
        product_routes::delete_product,
        cart::view_cart,
        cart::add_item,
        cart::update_item,
        cart::remove_item,
        cart::clear_cart,
        orders::list_orders,
        orders::checkout,
        orders::get_order,
        orders::cancel_order,
        orders::submit_payment,
        seller::list_seller_orders,
        admin::list_all_orders,
        admin::get_order_admin,
        admin::update_order_status,
        admin::list_payments,
        admin::verify_payment,
        admin::list_users,
        admin::get_user,
        admin::update_user,
        admin::list_low_stock,
        admin::adjust_inventory,
        admin::dashboard_stats
    ),
    components(
        schemas(
            User,
            UserRole,
            Category,
            Product,
            ProductStatus,
            Order,
            OrderStatus,
            OrderItem,
            Payment,
            PaymentMethod,
            PaymentStatus,
            ShippingAddress,
            RegisterRequest,
            LoginRequest,
            LoginResponse,
            CreateCategoryRequest,
            UpdateCategoryRequest,
            CategoryList,
            CreateProductRequest,
            UpdateProductRequest,
            ProductList,
            AddCartItemRequest,
            UpdateCartItemRequest,
            CartView,
            CartLineView,
            CheckoutRequest,
            CancelOrderRequest,
            SubmitPaymentRequest,
            UpdateOrderStatusRequest,
            OrderDetail,
            OrderList,
            SellerOrderLine,
            SellerOrderList,
            VerifyPaymentRequest,
            PaymentList,
            UpdateUserRequest,
            UserList,
            InventoryAdjustRequest,
            RoleCounts,
            OrderStatusCounts,
            DashboardStats,
            params::SortOrder,
            params::ProductSortBy,
            Meta,
            ApiResponse<Product>,
            ApiResponse<ProductList>,
            ApiResponse<OrderDetail>,
            ApiResponse<OrderList>,
            ApiResponse<CartView>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Registration, login and current user"),
        (name = "Categories", description = "Product categories"),
        (name = "Products", description = "Catalog and seller product management"),
        (name = "Cart", description = "Buyer shopping cart"),
        (name = "Orders", description = "Checkout, order history, cancellation and payment"),
        (name = "Seller", description = "Seller order lines"),
        (name = "Admin", description = "Order, payment, user and inventory administration"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}

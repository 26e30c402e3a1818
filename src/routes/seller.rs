use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};

use crate::{
    dto::orders::SellerOrderList,
    error::AppResult,
    middleware::auth::AuthUser,
    response::ApiResponse,
    routes::params::Pagination,
    services::order_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/orders", get(list_seller_orders))
}

/// Order lines containing the seller's products, newest first.
#[utoipa::path(
    get,
    path = "/api/seller/orders",
    params(Pagination),
    responses(
        (status = 200, description = "Order lines for the current seller", body = ApiResponse<SellerOrderList>),
        (status = 403, description = "Sellers only")
    ),
    security(("bearer_auth" = [])),
    tag = "Seller"
)]
pub async fn list_seller_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(pagination): Query<Pagination>,
) -> AppResult<Json<ApiResponse<SellerOrderList>>> {
    let resp = order_service::list_seller_orders(&state, &user, pagination).await?;
    Ok(Json(resp))
}

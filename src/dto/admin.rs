use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct InventoryAdjustRequest {
    pub delta: i32,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct RoleCounts {
    pub buyers: i64,
    pub sellers: i64,
    pub admins: i64,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct OrderStatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub shipped: i64,
    pub delivered: i64,
    pub cancelled: i64,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct DashboardStats {
    pub users: RoleCounts,
    pub products: i64,
    pub orders: OrderStatusCounts,
    pub paid_revenue: i64,
    pub pending_payments: i64,
}

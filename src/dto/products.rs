use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{Product, ProductStatus};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 200), custom(function = "super::validate_not_blank"))]
    pub name: String,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[validate(range(min = 0))]
    pub price: i64,
    #[validate(range(min = 0))]
    pub stock: i32,
    pub category_id: Option<Uuid>,
    pub status: Option<ProductStatus>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateProductRequest {
    #[validate(length(min = 1, max = 200), custom(function = "super::validate_not_blank"))]
    pub name: Option<String>,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[validate(range(min = 0))]
    pub price: Option<i64>,
    #[validate(range(min = 0))]
    pub stock: Option<i32>,
    pub category_id: Option<Uuid>,
    pub status: Option<ProductStatus>,
    pub variants: Option<Vec<String>>,
    pub images: Option<Vec<String>>,
}

#[derive(Serialize, ToSchema)]
#[serde(transparent)]
pub struct ProductList {
    #[schema(value_type = Vec<Product>)]
    pub items: Vec<Product>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(name: &str) -> CreateProductRequest {
        CreateProductRequest {
            name: name.to_string(),
            description: None,
            price: 1000,
            stock: 1,
            category_id: None,
            status: None,
            variants: vec![],
            images: vec![],
        }
    }

    #[test]
    fn blank_names_are_rejected() {
        assert!(create("Mug").validate().is_ok());
        assert!(create("").validate().is_err());
        let errors = create("   ").validate().unwrap_err();
        assert!(errors.field_errors().contains_key("name"));

        let update = UpdateProductRequest {
            name: Some(" \t ".into()),
            ..Default::default()
        };
        assert!(update.validate().is_err());
        assert!(UpdateProductRequest::default().validate().is_ok());
    }
}

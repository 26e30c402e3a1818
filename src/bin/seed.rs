use marketplace_api::{
    config::AppConfig,
    db::{create_orm_conn, run_migrations},
    entity::{
        categories::{self, Entity as Categories},
        products::{self, Entity as Products},
        users::{self, Entity as Users},
    },
    models::{ProductStatus, UserRole},
    services::{auth_service::hash_password, category_service::slugify},
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let orm = create_orm_conn(&config.database_url).await?;
    run_migrations(&orm).await?;

    let admin_id = ensure_user(&orm, "Admin", "admin@example.com", "admin123", UserRole::Admin).await?;
    let seller_id =
        ensure_user(&orm, "Ferris Goods", "seller@example.com", "seller123", UserRole::Seller).await?;
    let buyer_id = ensure_user(&orm, "Buyer", "buyer@example.com", "buyer123", UserRole::Buyer).await?;

    let apparel = ensure_category(&orm, "Apparel").await?;
    let kitchen = ensure_category(&orm, "Kitchen").await?;
    let books = ensure_category(&orm, "Books").await?;

    let catalog = [
        ("Axum Hoodie", "Warm hoodie for Rustaceans", 550_000, 50, apparel, &["S", "M", "L", "XL"][..]),
        ("Ferris Mug", "Coffee tastes better with Ferris", 120_000, 100, kitchen, &[][..]),
        ("Rust Sticker Pack", "Decorate your laptop", 50_000, 200, apparel, &[][..]),
        ("E-book: Async Rust", "Learn async Rust patterns", 250_000, 75, books, &[][..]),
    ];
    for (name, desc, price, stock, category_id, variants) in catalog {
        ensure_product(&orm, seller_id, category_id, name, desc, price, stock, variants).await?;
    }
    println!("Seeded products");

    println!("Seed completed. Admin ID: {admin_id}, Seller ID: {seller_id}, Buyer ID: {buyer_id}");
    Ok(())
}

async fn ensure_user(
    orm: &DatabaseConnection,
    name: &str,
    email: &str,
    password: &str,
    role: UserRole,
) -> anyhow::Result<Uuid> {
    if let Some(existing) = Users::find()
        .filter(users::Column::Email.eq(email))
        .one(orm)
        .await?
    {
        println!("User {email} already exists");
        return Ok(existing.id);
    }

    let password_hash = hash_password(password).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let user = users::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        email: Set(email.to_string()),
        password_hash: Set(password_hash),
        role: Set(role),
        phone: Set(None),
        is_active: Set(true),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(orm)
    .await?;

    println!("Ensured user {email} (role={})", role.as_str());
    Ok(user.id)
}

async fn ensure_category(orm: &DatabaseConnection, name: &str) -> anyhow::Result<Uuid> {
    let slug = slugify(name);
    if let Some(existing) = Categories::find()
        .filter(categories::Column::Slug.eq(slug.as_str()))
        .one(orm)
        .await?
    {
        return Ok(existing.id);
    }

    let category = categories::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        slug: Set(slug),
        description: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(orm)
    .await?;
    Ok(category.id)
}

#[allow(clippy::too_many_arguments)]
async fn ensure_product(
    orm: &DatabaseConnection,
    seller_id: Uuid,
    category_id: Uuid,
    name: &str,
    description: &str,
    price: i64,
    stock: i32,
    variants: &[&str],
) -> anyhow::Result<()> {
    let exists = Products::find()
        .filter(products::Column::SellerId.eq(seller_id))
        .filter(products::Column::Name.eq(name))
        .one(orm)
        .await?
        .is_some();
    if exists {
        return Ok(());
    }

    products::ActiveModel {
        id: Set(Uuid::new_v4()),
        seller_id: Set(seller_id),
        category_id: Set(Some(category_id)),
        name: Set(name.to_string()),
        description: Set(Some(description.to_string())),
        price: Set(price),
        stock: Set(stock),
        status: Set(ProductStatus::Active),
        variants: Set(serde_json::json!(variants)),
        images: Set(serde_json::json!([])),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(orm)
    .await?;
    Ok(())
}

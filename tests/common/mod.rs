//! Shared test harness: an in-memory SQLite store with the schema created
//! from the entities, plus seed helpers.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, QueryFilter, Schema, Set,
};
use uuid::Uuid;

use storefront_api::cache::{CacheBackend, InMemoryCache};
use storefront_api::config::AppConfig;
use storefront_api::entities::promo_code::DiscountType;
use storefront_api::entities::{
    customer, order_status_history, product, promo_code, Customer, Order, OrderItem,
    OrderStatusHistory, Product, PromoCode,
};
use storefront_api::services::orders::OrderService;

pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub cache: Arc<dyn CacheBackend>,
    pub orders: OrderService,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut opt = ConnectOptions::new("sqlite::memory:".to_owned());
        opt.max_connections(1).sqlx_logging(false);
        let db = Database::connect(opt).await.expect("sqlite connect");

        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        for stmt in [
            schema.create_table_from_entity(Customer),
            schema.create_table_from_entity(Product),
            schema.create_table_from_entity(PromoCode),
            schema.create_table_from_entity(Order),
            schema.create_table_from_entity(OrderItem),
            schema.create_table_from_entity(OrderStatusHistory),
        ] {
            db.execute(backend.build(&stmt)).await.expect("create table");
        }

        let db = Arc::new(db);
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());
        let config = AppConfig::with_database_url("sqlite::memory:");
        let orders = OrderService::new(db.clone(), cache.clone(), None, &config)
            .expect("order service");

        Self { db, cache, orders }
    }

    pub async fn seed_customer(&self) -> customer::Model {
        customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(format!("{}@example.com", Uuid::new_v4().simple())),
            name: Set("Test Customer".to_string()),
            is_active: Set(true),
            is_blocked: Set(false),
            is_deleted: Set(false),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("seed customer")
    }

    pub async fn seed_blocked_customer(&self) -> customer::Model {
        customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(format!("{}@example.com", Uuid::new_v4().simple())),
            name: Set("Blocked Customer".to_string()),
            is_active: Set(true),
            is_blocked: Set(true),
            is_deleted: Set(false),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("seed blocked customer")
    }

    pub async fn seed_product(
        &self,
        name: &str,
        price: Decimal,
        weight_kg: Decimal,
        stock: i32,
    ) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
            name: Set(name.to_string()),
            price: Set(price),
            weight_kg: Set(weight_kg),
            stock: Set(stock),
            is_in_stock: Set(stock > 0),
            track_inventory: Set(true),
            is_blocked: Set(false),
            is_deleted: Set(false),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_promo(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        min_purchase: Decimal,
        max_discount: Option<Decimal>,
        usage_limit: Option<i32>,
    ) -> promo_code::Model {
        let now = Utc::now();
        promo_code::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            max_discount_amount: Set(max_discount),
            min_purchase_amount: Set(min_purchase),
            starts_at: Set(now - Duration::days(1)),
            ends_at: Set(now + Duration::days(30)),
            usage_limit: Set(usage_limit),
            usage_count: Set(0),
            is_deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("seed promo code")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        Product::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("query product")
            .expect("product exists")
            .stock
    }

    pub async fn promo_usage_of(&self, promo_id: Uuid) -> i32 {
        PromoCode::find_by_id(promo_id)
            .one(&*self.db)
            .await
            .expect("query promo")
            .expect("promo exists")
            .usage_count
    }

    pub async fn history_of(&self, order_id: Uuid) -> Vec<order_status_history::Model> {
        use sea_orm::QueryOrder;
        OrderStatusHistory::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db)
            .await
            .expect("query history")
    }

    pub async fn order_count(&self) -> u64 {
        use sea_orm::PaginatorTrait;
        Order::find().count(&*self.db).await.expect("count orders")
    }
}

//! SeaORM-backed billing storage.
//!
//! ```rust,ignore
//! let store = SeaOrmSubscriptionStore::new(db.clone());
//! let directory = SeaOrmUserDirectory::new(db.clone());
//! let lifecycle = SubscriptionLifecycle::new(store, directory, gateway, catalog, checkout);
//! ```
//!
//! Billing owns the `billing_*` tables. `users` and `workspaces` belong to the
//! identity side of the platform; [`SeaOrmUserDirectory`] only reads them and
//! writes the workspace tier label.

use async_trait::async_trait;
use sea_orm::{
    entity::prelude::*, sea_query::OnConflict, ActiveValue::NotSet, ConnectionTrait,
    DatabaseConnection, QueryOrder, Schema, Set, TransactionTrait,
};

use super::error::{BillingError, Result};
use super::storage::{BillingUser, Subscription, SubscriptionStatus, SubscriptionStore, UserDirectory};
use crate::utils::now_unix;

mod entity {
    use sea_orm::entity::prelude::*;

    pub mod billing_customer {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_customers")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            #[sea_orm(indexed)]
            pub stripe_customer_id: Option<String>,
            /// Survives subscription row deletion.
            pub ever_subscribed: bool,
            pub updated_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod billing_subscription {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_subscriptions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            #[sea_orm(indexed)]
            pub user_id: String,
            pub plan_id: String,
            #[sea_orm(unique)]
            pub stripe_subscription_id: Option<String>,
            pub stripe_customer_id: Option<String>,
            pub status: String,
            pub current_period_start: i64,
            pub current_period_end: i64,
            pub cancel_at_period_end: bool,
            pub canceled_at: Option<i64>,
            pub trial_start: Option<i64>,
            pub trial_end: Option<i64>,
            pub created_at: i64,
            pub updated_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod billing_processed_event {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_processed_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_id: String,
            pub processed_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod user {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "users")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub email: String,
            pub name: Option<String>,
            pub trial_end_date: Option<i64>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod workspace {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "workspaces")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            #[sea_orm(indexed)]
            pub owner_id: String,
            pub tier: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{billing_customer, billing_processed_event, billing_subscription, user, workspace};

/// Negative values become 0.
#[inline]
fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Values above `i64::MAX` saturate.
#[inline]
fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[inline]
fn db_err(e: DbErr) -> BillingError {
    BillingError::storage(e)
}

fn model_to_subscription(model: billing_subscription::Model) -> Result<Subscription> {
    let status = SubscriptionStatus::parse(&model.status).ok_or_else(|| {
        BillingError::storage(format!(
            "Unknown subscription status '{}' on row {}",
            model.status, model.id
        ))
    })?;

    Ok(Subscription {
        id: model.id,
        user_id: model.user_id,
        plan_id: model.plan_id,
        gateway_subscription_id: model.stripe_subscription_id,
        gateway_customer_id: model.stripe_customer_id,
        status,
        current_period_start: i64_to_u64(model.current_period_start),
        current_period_end: i64_to_u64(model.current_period_end),
        cancel_at_period_end: model.cancel_at_period_end,
        canceled_at: model.canceled_at.map(i64_to_u64),
        trial_start: model.trial_start.map(i64_to_u64),
        trial_end: model.trial_end.map(i64_to_u64),
        created_at: i64_to_u64(model.created_at),
        updated_at: i64_to_u64(model.updated_at),
    })
}

fn subscription_to_active_model(subscription: &Subscription) -> billing_subscription::ActiveModel {
    billing_subscription::ActiveModel {
        id: Set(subscription.id.clone()),
        user_id: Set(subscription.user_id.clone()),
        plan_id: Set(subscription.plan_id.clone()),
        stripe_subscription_id: Set(subscription.gateway_subscription_id.clone()),
        stripe_customer_id: Set(subscription.gateway_customer_id.clone()),
        status: Set(subscription.status.as_str().to_string()),
        current_period_start: Set(u64_to_i64(subscription.current_period_start)),
        current_period_end: Set(u64_to_i64(subscription.current_period_end)),
        cancel_at_period_end: Set(subscription.cancel_at_period_end),
        canceled_at: Set(subscription.canceled_at.map(u64_to_i64)),
        trial_start: Set(subscription.trial_start.map(u64_to_i64)),
        trial_end: Set(subscription.trial_end.map(u64_to_i64)),
        created_at: Set(u64_to_i64(subscription.created_at)),
        updated_at: Set(u64_to_i64(subscription.updated_at)),
    }
}

fn rows_to_subscriptions(rows: Vec<billing_subscription::Model>) -> Result<Vec<Subscription>> {
    rows.into_iter().map(model_to_subscription).collect()
}

/// Create the `billing_*` tables when they do not exist yet.
///
/// Deployments with a migration pipeline can skip this.
pub async fn ensure_billing_tables(db: &DatabaseConnection) -> Result<()> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut statements = vec![
        schema.create_table_from_entity(billing_customer::Entity),
        schema.create_table_from_entity(billing_subscription::Entity),
        schema.create_table_from_entity(billing_processed_event::Entity),
    ];
    for stmt in &mut statements {
        stmt.if_not_exists();
        db.execute(backend.build(&*stmt))
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

// =============================================================================
// SeaOrmSubscriptionStore
// =============================================================================

/// SeaORM implementation of [`SubscriptionStore`].
#[derive(Clone, Debug)]
pub struct SeaOrmSubscriptionStore {
    db: DatabaseConnection,
}

impl SeaOrmSubscriptionStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Upsert the customer row, touching only `columns` on conflict.
    async fn upsert_customer<C>(
        conn: &C,
        model: billing_customer::ActiveModel,
        columns: Vec<billing_customer::Column>,
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        billing_customer::Entity::insert(model)
            .on_conflict(
                OnConflict::column(billing_customer::Column::UserId)
                    .update_columns(columns)
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for SeaOrmSubscriptionStore {
    async fn get_customer_id(&self, user_id: &str) -> Result<Option<String>> {
        let customer = billing_customer::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        Ok(customer.and_then(|c| c.stripe_customer_id))
    }

    async fn set_customer_id(&self, user_id: &str, customer_id: &str) -> Result<()> {
        tracing::debug!(user_id = %user_id, customer_id = %customer_id, "setting stripe customer id");

        let model = billing_customer::ActiveModel {
            user_id: Set(user_id.to_string()),
            stripe_customer_id: Set(Some(customer_id.to_string())),
            ever_subscribed: Set(false),
            updated_at: Set(u64_to_i64(now_unix())),
        };
        Self::upsert_customer(
            &self.db,
            model,
            vec![
                billing_customer::Column::StripeCustomerId,
                billing_customer::Column::UpdatedAt,
            ],
        )
        .await
    }

    async fn clear_customer_id(&self, user_id: &str) -> Result<()> {
        billing_customer::Entity::update_many()
            .col_expr(
                billing_customer::Column::StripeCustomerId,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                billing_customer::Column::UpdatedAt,
                Expr::value(u64_to_i64(now_unix())),
            )
            .filter(billing_customer::Column::UserId.eq(user_id))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<String>> {
        let customer = billing_customer::Entity::find()
            .filter(billing_customer::Column::StripeCustomerId.eq(customer_id))
            .one(&self.db)
            .await
            .map_err(db_err)?;

        Ok(customer.map(|c| c.user_id))
    }

    async fn active_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        let row = billing_subscription::Entity::find()
            .filter(billing_subscription::Column::UserId.eq(user_id))
            .filter(billing_subscription::Column::Status.is_in([
                SubscriptionStatus::Active.as_str(),
                SubscriptionStatus::Trialing.as_str(),
            ]))
            .order_by_desc(billing_subscription::Column::CreatedAt)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        row.map(model_to_subscription).transpose()
    }

    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let rows = billing_subscription::Entity::find()
            .filter(billing_subscription::Column::UserId.eq(user_id))
            .order_by_desc(billing_subscription::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?;

        rows_to_subscriptions(rows)
    }

    async fn subscription_by_gateway_id(
        &self,
        gateway_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let row = billing_subscription::Entity::find()
            .filter(billing_subscription::Column::StripeSubscriptionId.eq(gateway_subscription_id))
            .one(&self.db)
            .await
            .map_err(db_err)?;

        row.map(model_to_subscription).transpose()
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        tracing::debug!(
            user_id = %subscription.user_id,
            plan_id = %subscription.plan_id,
            status = %subscription.status,
            "inserting subscription"
        );

        let txn = self.db.begin().await.map_err(db_err)?;

        billing_subscription::Entity::insert(subscription_to_active_model(subscription))
            .exec_without_returning(&txn)
            .await
            .map_err(db_err)?;

        let marker = billing_customer::ActiveModel {
            user_id: Set(subscription.user_id.clone()),
            stripe_customer_id: NotSet,
            ever_subscribed: Set(true),
            updated_at: Set(u64_to_i64(now_unix())),
        };
        Self::upsert_customer(
            &txn,
            marker,
            vec![
                billing_customer::Column::EverSubscribed,
                billing_customer::Column::UpdatedAt,
            ],
        )
        .await?;

        txn.commit().await.map_err(db_err)
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        tracing::debug!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            "updating subscription"
        );

        billing_subscription::Entity::update(subscription_to_active_model(subscription))
            .exec(&self.db)
            .await
            .map_err(|e| match e {
                DbErr::RecordNotUpdated => BillingError::storage(format!(
                    "Subscription row {} does not exist",
                    subscription.id
                )),
                other => db_err(other),
            })?;
        Ok(())
    }

    async fn has_ever_subscribed(&self, user_id: &str) -> Result<bool> {
        let customer = billing_customer::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        Ok(customer.is_some_and(|c| c.ever_subscribed))
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        let event = billing_processed_event::Entity::find_by_id(event_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        Ok(event.is_some())
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        let model = billing_processed_event::ActiveModel {
            event_id: Set(event_id.to_string()),
            processed_at: Set(u64_to_i64(now_unix())),
        };

        billing_processed_event::Entity::insert(model)
            .on_conflict(
                OnConflict::column(billing_processed_event::Column::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// =============================================================================
// SeaOrmUserDirectory
// =============================================================================

/// Reads `users` and `workspaces`; writes only `workspaces.tier`.
#[derive(Clone, Debug)]
pub struct SeaOrmUserDirectory {
    db: DatabaseConnection,
}

impl SeaOrmUserDirectory {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserDirectory for SeaOrmUserDirectory {
    async fn get_user(&self, user_id: &str) -> Result<Option<BillingUser>> {
        let model = user::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        Ok(model.map(|u| BillingUser {
            id: u.id,
            email: u.email,
            name: u.name,
            trial_end: u.trial_end_date.map(i64_to_u64),
        }))
    }

    async fn workspace_owner(&self, workspace_id: &str) -> Result<Option<String>> {
        let model = workspace::Entity::find_by_id(workspace_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;

        Ok(model.map(|w| w.owner_id))
    }

    async fn owned_workspaces(&self, owner_id: &str) -> Result<Vec<String>> {
        let rows = workspace::Entity::find()
            .filter(workspace::Column::OwnerId.eq(owner_id))
            .order_by_asc(workspace::Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(|w| w.id).collect())
    }

    async fn set_workspace_tier(&self, owner_id: &str, tier: &str) -> Result<()> {
        let result = workspace::Entity::update_many()
            .col_expr(workspace::Column::Tier, Expr::value(tier))
            .filter(workspace::Column::OwnerId.eq(owner_id))
            .exec(&self.db)
            .await
            .map_err(db_err)?;

        tracing::debug!(
            owner_id = %owner_id,
            tier = %tier,
            workspaces = result.rows_affected,
            "updated workspace tier"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{Database, DbBackend};

    async fn setup() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        ensure_billing_tables(&db).await.unwrap();

        let schema = Schema::new(DbBackend::Sqlite);
        let backend = db.get_database_backend();
        db.execute(backend.build(&schema.create_table_from_entity(user::Entity)))
            .await
            .unwrap();
        db.execute(backend.build(&schema.create_table_from_entity(workspace::Entity)))
            .await
            .unwrap();
        db
    }

    fn row(id: &str, user_id: &str, status: SubscriptionStatus, created_at: u64) -> Subscription {
        Subscription {
            id: id.to_string(),
            user_id: user_id.to_string(),
            plan_id: "pro".to_string(),
            gateway_subscription_id: Some(format!("sub_{}", id)),
            gateway_customer_id: Some("cus_1".to_string()),
            status,
            current_period_start: created_at,
            current_period_end: created_at + 30 * 86_400,
            cancel_at_period_end: false,
            canceled_at: None,
            trial_start: None,
            trial_end: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn test_ensure_tables_is_idempotent() {
        let db = setup().await;
        ensure_billing_tables(&db).await.unwrap();
    }

    #[tokio::test]
    async fn test_customer_handle_roundtrip() {
        let store = SeaOrmSubscriptionStore::new(setup().await);

        assert_eq!(store.get_customer_id("u1").await.unwrap(), None);
        store.set_customer_id("u1", "cus_1").await.unwrap();
        store.set_customer_id("u1", "cus_2").await.unwrap();
        assert_eq!(store.get_customer_id("u1").await.unwrap().as_deref(), Some("cus_2"));
        assert_eq!(store.find_user_by_customer("cus_2").await.unwrap().as_deref(), Some("u1"));

        store.clear_customer_id("u1").await.unwrap();
        assert_eq!(store.get_customer_id("u1").await.unwrap(), None);
        assert_eq!(store.find_user_by_customer("cus_2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_marks_ever_subscribed_and_keeps_customer() {
        let store = SeaOrmSubscriptionStore::new(setup().await);
        store.set_customer_id("u1", "cus_1").await.unwrap();
        assert!(!store.has_ever_subscribed("u1").await.unwrap());

        store
            .insert_subscription(&row("s1", "u1", SubscriptionStatus::Active, 1_000))
            .await
            .unwrap();

        assert!(store.has_ever_subscribed("u1").await.unwrap());
        assert_eq!(store.get_customer_id("u1").await.unwrap().as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn test_ever_subscribed_survives_row_deletion() {
        let db = setup().await;
        let store = SeaOrmSubscriptionStore::new(db.clone());
        store
            .insert_subscription(&row("s1", "u1", SubscriptionStatus::Active, 1_000))
            .await
            .unwrap();

        billing_subscription::Entity::delete_many().exec(&db).await.unwrap();

        assert!(store.subscriptions_for_user("u1").await.unwrap().is_empty());
        assert!(store.has_ever_subscribed("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_active_subscription_and_ordering() {
        let store = SeaOrmSubscriptionStore::new(setup().await);
        store
            .insert_subscription(&row("old", "u1", SubscriptionStatus::Canceled, 1_000))
            .await
            .unwrap();
        store
            .insert_subscription(&row("new", "u1", SubscriptionStatus::Trialing, 2_000))
            .await
            .unwrap();

        let active = store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(active.id, "new");

        let rows = store.subscriptions_for_user("u1").await.unwrap();
        assert_eq!(rows.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["new", "old"]);

        let by_gateway = store.subscription_by_gateway_id("sub_old").await.unwrap().unwrap();
        assert_eq!(by_gateway.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_update_subscription() {
        let store = SeaOrmSubscriptionStore::new(setup().await);
        let mut sub = row("s1", "u1", SubscriptionStatus::Active, 1_000);
        store.insert_subscription(&sub).await.unwrap();

        sub.status = SubscriptionStatus::Canceled;
        sub.canceled_at = Some(5_000);
        sub.updated_at = 5_000;
        store.update_subscription(&sub).await.unwrap();

        assert_eq!(store.active_subscription("u1").await.unwrap(), None);
        let stored = store.subscription_by_gateway_id("sub_s1").await.unwrap().unwrap();
        assert_eq!(stored, sub);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_storage_error() {
        let store = SeaOrmSubscriptionStore::new(setup().await);
        let err = store
            .update_subscription(&row("ghost", "u1", SubscriptionStatus::Active, 1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Storage { .. }));
    }

    #[tokio::test]
    async fn test_processed_events_are_idempotent() {
        let store = SeaOrmSubscriptionStore::new(setup().await);
        assert!(!store.is_event_processed("evt_1").await.unwrap());
        store.mark_event_processed("evt_1").await.unwrap();
        store.mark_event_processed("evt_1").await.unwrap();
        assert!(store.is_event_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_user_directory() {
        let db = setup().await;
        user::Entity::insert(user::ActiveModel {
            id: Set("u1".to_string()),
            email: Set("owner@example.com".to_string()),
            name: Set(None),
            trial_end_date: Set(Some(9_000)),
        })
        .exec(&db)
        .await
        .unwrap();
        for id in ["w2", "w1"] {
            workspace::Entity::insert(workspace::ActiveModel {
                id: Set(id.to_string()),
                owner_id: Set("u1".to_string()),
                tier: Set("free".to_string()),
            })
            .exec(&db)
            .await
            .unwrap();
        }

        let directory = SeaOrmUserDirectory::new(db.clone());
        let owner = directory.get_user("u1").await.unwrap().unwrap();
        assert_eq!(owner.trial_end, Some(9_000));
        assert_eq!(directory.workspace_owner("w1").await.unwrap().as_deref(), Some("u1"));
        assert_eq!(directory.owned_workspaces("u1").await.unwrap(), vec!["w1", "w2"]);

        directory.set_workspace_tier("u1", "Pro").await.unwrap();
        let tiers: Vec<String> = workspace::Entity::find()
            .all(&db)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.tier)
            .collect();
        assert!(tiers.iter().all(|t| t == "Pro"));
    }
}

//! Queue of firewall rule mutations for the legacy per-session grant strategy
//!
//! The tunnel manager enqueues requests; the firewall agent picks them up on
//! check-in, applies them, reloads its rule engine and resolves the row.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::info;
use uuid::Uuid;

use crate::entities::grant_request::{self, Column, GrantAction, GrantStatus};

#[derive(Clone, Debug)]
pub struct GrantQueue {
    db: DatabaseConnection,
}

impl GrantQueue {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        target: &str,
        action: GrantAction,
        rule_label: &str,
        now: DateTime<Utc>,
    ) -> Result<grant_request::Model, DbErr> {
        let request = grant_request::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            target: Set(target.to_string()),
            action: Set(action),
            rule_label: Set(rule_label.to_string()),
            status: Set(GrantStatus::Pending),
            error: Set(None),
            created_at: Set(now),
            completed_at: Set(None),
        }
        .insert(&self.db)
        .await?;

        info!(
            "Queued {:?} for {} (label {}, request {})",
            action, target, rule_label, request.id
        );
        Ok(request)
    }

    pub async fn get(&self, id: &str) -> Result<Option<grant_request::Model>, DbErr> {
        grant_request::Entity::find_by_id(id).one(&self.db).await
    }

    /// Pending requests for a firewall, oldest first (the agent's view)
    pub async fn pending_for(&self, target: &str) -> Result<Vec<grant_request::Model>, DbErr> {
        grant_request::Entity::find()
            .filter(Column::Target.eq(target))
            .filter(Column::Status.eq(GrantStatus::Pending))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
    }

    /// Resolve a pending request. `error = None` marks it completed.
    pub async fn resolve(
        &self,
        id: &str,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let status = if error.is_some() {
            GrantStatus::Failed
        } else {
            GrantStatus::Completed
        };

        let result = grant_request::Entity::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::Error, Expr::value(error))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(GrantStatus::Pending))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }
}

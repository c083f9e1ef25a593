//! Durable registry of tunnel sessions
//!
//! Every mutation is a single conditional statement filtered on `status = 'active'`,
//! so a row that has been closed by a concurrent invocation is never touched again.
//! Creation leans on the partial unique indexes instead of check-then-insert.

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, SqlErr,
};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::tunnel_session::{self, Column, SessionStatus};
use crate::TunnelSession;

/// Errors returned by the session store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Port {0} is already held by an active session")]
    PortTaken(u16),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} is closed")]
    NotActive(String),

    #[error("Invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("Concurrent update conflict for {0}")]
    Conflict(String),
}

/// Parameters for a new session row
#[derive(Debug, Clone)]
pub struct NewSession {
    pub target: String,
    pub source_ip: String,
    pub tunnel_port: u16,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
}

/// Result of an idempotent-by-key create
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A new row was inserted
    Created(TunnelSession),
    /// An active row already existed for (target, source_ip); its expiry was extended
    Extended(TunnelSession),
}

impl CreateOutcome {
    pub fn session(&self) -> &TunnelSession {
        match self {
            CreateOutcome::Created(session) | CreateOutcome::Extended(session) => session,
        }
    }

    pub fn into_session(self) -> TunnelSession {
        match self {
            CreateOutcome::Created(session) | CreateOutcome::Extended(session) => session,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

enum UniqueViolation {
    Port,
    Key,
}

fn unique_violation(err: &DbErr) -> Option<UniqueViolation> {
    match err.sql_err() {
        // SQLite names the columns, PostgreSQL names the index; both mention tunnel_port
        Some(SqlErr::UniqueConstraintViolation(detail)) if detail.contains("tunnel_port") => {
            Some(UniqueViolation::Port)
        }
        Some(SqlErr::UniqueConstraintViolation(_)) => Some(UniqueViolation::Key),
        _ => None,
    }
}

/// Handle to the session table. Cheap to clone; every component receives its own.
#[derive(Clone, Debug)]
pub struct SessionStore {
    db: DatabaseConnection,
}

impl SessionStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create a session, or extend the active one for the same (target, source_ip).
    ///
    /// Returns [`StoreError::PortTaken`] when another active session won the port;
    /// the caller is expected to allocate a different port and retry.
    pub async fn create(&self, new: NewSession) -> Result<CreateOutcome, StoreError> {
        if new.ttl <= Duration::zero() {
            return Err(StoreError::InvalidExpiry(format!(
                "ttl must be positive, got {}s",
                new.ttl.num_seconds()
            )));
        }
        let expires_at = new.now + new.ttl;

        // Extra rounds cover losing the key race to a concurrent insert,
        // or the existing row being closed between lookup and extension.
        for _ in 0..3 {
            if let Some(existing) = self.find_active(&new.target, &new.source_ip).await? {
                let wanted = existing.expires_at.max(expires_at);
                if let Some(extended) = self.extend_active(&existing.id, wanted, new.now).await? {
                    info!(
                        "Extended session {} for {} from {} until {}",
                        extended.id, extended.target, extended.source_ip, extended.expires_at
                    );
                    return Ok(CreateOutcome::Extended(extended));
                }
                continue;
            }

            let row = tunnel_session::ActiveModel {
                id: Set(Uuid::new_v4().to_string()),
                target: Set(new.target.clone()),
                source_ip: Set(new.source_ip.clone()),
                tunnel_port: Set(i32::from(new.tunnel_port)),
                proxy_route: Set(None),
                rule_label: Set(None),
                status: Set(SessionStatus::Active),
                closed_reason: Set(None),
                created_at: Set(new.now),
                expires_at: Set(expires_at),
                last_activity: Set(new.now),
                closed_at: Set(None),
            };

            match row.insert(&self.db).await {
                Ok(session) => {
                    info!(
                        "Created session {} for {} from {} on port {}",
                        session.id, session.target, session.source_ip, session.tunnel_port
                    );
                    return Ok(CreateOutcome::Created(session));
                }
                Err(err) => match unique_violation(&err) {
                    Some(UniqueViolation::Port) => {
                        debug!("Port {} lost to a concurrent session", new.tunnel_port);
                        return Err(StoreError::PortTaken(new.tunnel_port));
                    }
                    Some(UniqueViolation::Key) => {
                        debug!(
                            "Concurrent session created for {} from {}, extending it instead",
                            new.target, new.source_ip
                        );
                        continue;
                    }
                    None => return Err(err.into()),
                },
            }
        }

        Err(StoreError::Conflict(format!(
            "{} from {}",
            new.target, new.source_ip
        )))
    }

    /// Set a new expiry on an active session
    pub async fn extend(
        &self,
        id: &str,
        new_expiry: DateTime<Utc>,
    ) -> Result<TunnelSession, StoreError> {
        let session = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !session.is_active() {
            return Err(StoreError::NotActive(id.to_string()));
        }
        if new_expiry <= session.created_at {
            return Err(StoreError::InvalidExpiry(format!(
                "{} is not after creation time {}",
                new_expiry, session.created_at
            )));
        }

        let result = tunnel_session::Entity::update_many()
            .col_expr(Column::ExpiresAt, Expr::value(new_expiry))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(SessionStatus::Active))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotActive(id.to_string()));
        }

        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn extend_active(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<TunnelSession>, StoreError> {
        let result = tunnel_session::Entity::update_many()
            .col_expr(Column::ExpiresAt, Expr::value(expires_at))
            .col_expr(Column::LastActivity, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(SessionStatus::Active))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        Ok(self.get(id).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<TunnelSession>, StoreError> {
        Ok(tunnel_session::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn find_active(
        &self,
        target: &str,
        source_ip: &str,
    ) -> Result<Option<TunnelSession>, StoreError> {
        Ok(tunnel_session::Entity::find()
            .filter(Column::Target.eq(target))
            .filter(Column::SourceIp.eq(source_ip))
            .filter(Column::Status.eq(SessionStatus::Active))
            .one(&self.db)
            .await?)
    }

    pub async fn list_active(&self) -> Result<Vec<TunnelSession>, StoreError> {
        Ok(tunnel_session::Entity::find()
            .filter(Column::Status.eq(SessionStatus::Active))
            .order_by_asc(Column::TunnelPort)
            .all(&self.db)
            .await?)
    }

    pub async fn list_active_for_target(
        &self,
        target: &str,
    ) -> Result<Vec<TunnelSession>, StoreError> {
        Ok(tunnel_session::Entity::find()
            .filter(Column::Target.eq(target))
            .filter(Column::Status.eq(SessionStatus::Active))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// Most recently created sessions regardless of status
    pub async fn list_recent(&self, limit: u64) -> Result<Vec<TunnelSession>, StoreError> {
        Ok(tunnel_session::Entity::find()
            .order_by_desc(Column::CreatedAt)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Ports currently held by active sessions
    pub async fn active_ports(&self) -> Result<BTreeSet<u16>, StoreError> {
        let ports: Vec<i32> = tunnel_session::Entity::find()
            .select_only()
            .column(Column::TunnelPort)
            .filter(Column::Status.eq(SessionStatus::Active))
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(ports
            .into_iter()
            .filter_map(|port| u16::try_from(port).ok())
            .collect())
    }

    /// The active session holding `port`, if any
    pub async fn find_active_by_port(&self, port: u16) -> Result<Option<TunnelSession>, StoreError> {
        Ok(tunnel_session::Entity::find()
            .filter(Column::TunnelPort.eq(i32::from(port)))
            .filter(Column::Status.eq(SessionStatus::Active))
            .one(&self.db)
            .await?)
    }

    /// Clear `label` from an active session. Only one caller can win: returns
    /// `true` for the call that cleared it, `false` if it was already taken.
    pub async fn take_rule_label(&self, id: &str, label: &str) -> Result<bool, StoreError> {
        let result = tunnel_session::Entity::update_many()
            .col_expr(Column::RuleLabel, Expr::value(Option::<String>::None))
            .filter(Column::Id.eq(id))
            .filter(Column::RuleLabel.eq(label))
            .filter(Column::Status.eq(SessionStatus::Active))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Record observed activity. `last_activity` only ever moves forward.
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = tunnel_session::Entity::update_many()
            .col_expr(Column::LastActivity, Expr::value(at))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(SessionStatus::Active))
            .filter(Column::LastActivity.lt(at))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    pub async fn set_rule_label(&self, id: &str, label: Option<&str>) -> Result<(), StoreError> {
        let result = tunnel_session::Entity::update_many()
            .col_expr(Column::RuleLabel, Expr::value(label.map(str::to_string)))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(SessionStatus::Active))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotActive(id.to_string()));
        }
        Ok(())
    }

    /// Mark the session usable by recording its public route
    pub async fn set_proxy_route(&self, id: &str, route: &str) -> Result<(), StoreError> {
        let result = tunnel_session::Entity::update_many()
            .col_expr(Column::ProxyRoute, Expr::value(route.to_string()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(SessionStatus::Active))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotActive(id.to_string()));
        }
        Ok(())
    }

    /// Close an active session. Returns `false` if it was already closed (or unknown),
    /// which makes closing idempotent for concurrent reapers.
    pub async fn close(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = tunnel_session::Entity::update_many()
            .col_expr(Column::Status, Expr::value(SessionStatus::Closed))
            .col_expr(Column::ClosedReason, Expr::value(reason.to_string()))
            .col_expr(Column::ClosedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(SessionStatus::Active))
            .exec(&self.db)
            .await?;

        let closed = result.rows_affected > 0;
        if closed {
            info!("Closed session {} ({})", id, reason);
        }
        Ok(closed)
    }

    /// Delete a still-active row. Only used to roll back a request that failed
    /// before the session ever became usable.
    pub async fn discard(&self, id: &str) -> Result<bool, StoreError> {
        let result = tunnel_session::Entity::delete_many()
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(SessionStatus::Active))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }
}

//! PostgreSQL `FloatStore`.
//!
//! Gated writes are conditional `UPDATE ... WHERE <precondition> RETURNING`
//! statements inside one transaction. When the update matches no row the
//! current state is read back to report the precise domain error; the
//! transaction is dropped (rolled back) on every error path.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::*;
use crate::store::*;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============ Row mapping ============

fn text_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: UnknownVariant| sqlx::Error::Decode(Box::new(e)))
}

fn optional_text_column<T>(row: &PgRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| value.parse())
        .transpose()
        .map_err(|e: UnknownVariant| sqlx::Error::Decode(Box::new(e)))
}

impl<'r> FromRow<'r, PgRow> for Agent {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            phone: row.try_get("phone")?,
            full_name: row.try_get("full_name")?,
            nrc_number: row.try_get("nrc_number")?,
            business_name: row.try_get("business_name")?,
            phone_verified: row.try_get("phone_verified")?,
            status: text_column(row, "status")?,
            reviewed_by: row.try_get("reviewed_by")?,
            reviewed_at: row.try_get("reviewed_at")?,
            status_reason: row.try_get("status_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for FloatAccount {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            agent_id: row.try_get("agent_id")?,
            current_balance: row.try_get("current_balance")?,
            welcome_bonus: row.try_get("welcome_bonus")?,
            daily_quota_remaining: row.try_get("daily_quota_remaining")?,
            daily_quota_limit: row.try_get("daily_quota_limit")?,
            last_quota_reset: row.try_get("last_quota_reset")?,
            utc_offset_minutes: row.try_get("utc_offset_minutes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for FloatTransaction {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            transaction_type: text_column(row, "transaction_type")?,
            amount_zmw: row.try_get("amount_zmw")?,
            requests_allocated: row.try_get("requests_allocated")?,
            status: text_column(row, "status")?,
            reference: row.try_get("reference")?,
            ticket_request_id: row.try_get("ticket_request_id")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for TicketRequest {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            origin: row.try_get("origin")?,
            destination: row.try_get("destination")?,
            travel_date: row.try_get("travel_date")?,
            passenger_count: row.try_get("passenger_count")?,
            passenger_names: row.try_get("passenger_names")?,
            contact_name: row.try_get("contact_name")?,
            contact_phone: row.try_get("contact_phone")?,
            contact_email: row.try_get("contact_email")?,
            status: text_column(row, "status")?,
            agent_id: row.try_get("agent_id")?,
            agent_claimed_at: row.try_get("agent_claimed_at")?,
            request_expires_at: row.try_get("request_expires_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for RequestView {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            agent_id: row.try_get("agent_id")?,
            ticket_request_id: row.try_get("ticket_request_id")?,
            transaction_id: row.try_get("transaction_id")?,
            viewed_at: row.try_get("viewed_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for ProcessedTicket {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            ticket_request_id: row.try_get("ticket_request_id")?,
            agent_id: row.try_get("agent_id")?,
            receipt_url: row.try_get("receipt_url")?,
            ticket_number: row.try_get("ticket_number")?,
            amount_paid: row.try_get("amount_paid")?,
            metadata: row.try_get("metadata")?,
            receipt_verification_status: text_column(row, "receipt_verification_status")?,
            verified_by: row.try_get("verified_by")?,
            verified_at: row.try_get("verified_at")?,
            rejection_reason: row.try_get("rejection_reason")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Booking {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            booking_reference: row.try_get("booking_reference")?,
            status: text_column(row, "status")?,
            assigned_agent_id: row.try_get("assigned_agent_id")?,
            assignment_status: optional_text_column(row, "assignment_status")?,
            assignment_response_deadline: row.try_get("assignment_response_deadline")?,
            assigned_at: row.try_get("assigned_at")?,
            assigned_by: row.try_get("assigned_by")?,
            escalated: row.try_get("escalated")?,
            escalated_at: row.try_get("escalated_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for AssignmentHistory {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            booking_id: row.try_get("booking_id")?,
            agent_id: row.try_get("agent_id")?,
            action: text_column(row, "action")?,
            performed_by: row.try_get("performed_by")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for PerformanceTier {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            agent_id: row.try_get("agent_id")?,
            tier: text_column(row, "tier")?,
            total_requests_completed: row.try_get("total_requests_completed")?,
            cost_per_request: row.try_get("cost_per_request")?,
            bonus_percentage: row.try_get("bonus_percentage")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Bonus {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            bonus_type: text_column(row, "bonus_type")?,
            amount: row.try_get("amount")?,
            description: row.try_get("description")?,
            claimed: row.try_get("claimed")?,
            claimed_at: row.try_get("claimed_at")?,
            expires_at: row.try_get("expires_at")?,
            dedupe_key: row.try_get("dedupe_key")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

// ============ Shared statements ============

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

async fn insert_transaction(
    conn: &mut PgConnection,
    transaction: &FloatTransaction,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO float_transactions
            (id, agent_id, transaction_type, amount_zmw, requests_allocated,
             status, reference, ticket_request_id, created_at, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(transaction.id)
    .bind(transaction.agent_id)
    .bind(transaction.transaction_type.as_str())
    .bind(&transaction.amount_zmw)
    .bind(transaction.requests_allocated)
    .bind(transaction.status.as_str())
    .bind(&transaction.reference)
    .bind(transaction.ticket_request_id)
    .bind(transaction.created_at)
    .bind(transaction.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Adds a credit to the account; quota stays within `[0, limit]`.
async fn apply_credit(
    conn: &mut PgConnection,
    transaction: &FloatTransaction,
    now: DateTime<Utc>,
) -> Result<FloatAccount, AppError> {
    sqlx::query_as::<_, FloatAccount>(
        r#"
        UPDATE float_accounts
        SET current_balance = current_balance + $2,
            daily_quota_remaining =
                LEAST(daily_quota_limit, GREATEST(0, daily_quota_remaining + $3)),
            updated_at = $4
        WHERE agent_id = $1
        RETURNING *
        "#,
    )
    .bind(transaction.agent_id)
    .bind(&transaction.amount_zmw)
    .bind(transaction.requests_allocated)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Float account for {}", transaction.agent_id)))
}

/// Conditional debit; on a miss the current row decides which error applies.
async fn debit(
    conn: &mut PgConnection,
    charge: &Charge,
    ticket_request_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<FloatTransaction>, AppError> {
    let debited = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE float_accounts fa
        SET current_balance = fa.current_balance - $2,
            daily_quota_remaining = fa.daily_quota_remaining - $3,
            updated_at = $4
        FROM agents a
        WHERE fa.agent_id = $1
          AND a.id = fa.agent_id
          AND a.status = 'approved'
          AND fa.current_balance >= $2
          AND fa.daily_quota_remaining >= $3
        RETURNING fa.agent_id
        "#,
    )
    .bind(charge.agent_id)
    .bind(&charge.amount)
    .bind(charge.quota_cost)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    if debited.is_none() {
        let row = sqlx::query(
            r#"
            SELECT a.status, fa.current_balance, fa.daily_quota_remaining
            FROM agents a
            LEFT JOIN float_accounts fa ON fa.agent_id = a.id
            WHERE a.id = $1
            "#,
        )
        .bind(charge.agent_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Err(AppError::AgentNotEligible);
        };
        let status: AgentStatus = text_column(&row, "status")?;
        let balance: Option<BigDecimal> = row.try_get("current_balance")?;
        let quota: Option<i32> = row.try_get("daily_quota_remaining")?;
        return Err(match (status, balance, quota) {
            (AgentStatus::Approved, Some(balance), Some(_)) if balance < charge.amount => {
                AppError::InsufficientFunds
            }
            (AgentStatus::Approved, Some(_), Some(quota)) if quota < charge.quota_cost => {
                AppError::QuotaExhausted
            }
            (AgentStatus::Approved, Some(_), Some(_)) => {
                AppError::Conflict("account changed during debit".to_string())
            }
            _ => AppError::AgentNotEligible,
        });
    }

    if charge.is_free() {
        return Ok(None);
    }
    let transaction = charge.usage_transaction(ticket_request_id, now);
    insert_transaction(&mut *conn, &transaction).await?;
    Ok(Some(transaction))
}

async fn insert_history(
    conn: &mut PgConnection,
    entry: &AssignmentHistory,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO assignment_history
            (id, booking_id, agent_id, action, performed_by, notes, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id)
    .bind(entry.booking_id)
    .bind(entry.agent_id)
    .bind(entry.action.as_str())
    .bind(&entry.performed_by)
    .bind(&entry.notes)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_request(
    conn: &mut PgConnection,
    request_id: Uuid,
) -> Result<TicketRequest, AppError> {
    sqlx::query_as::<_, TicketRequest>("SELECT * FROM ticket_requests WHERE id = $1")
        .bind(request_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Ticket request {}", request_id)))
}

fn assignment_label(status: Option<AssignmentStatus>) -> &'static str {
    status.map(|s| s.as_str()).unwrap_or("none")
}

#[async_trait]
impl FloatStore for PgStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO agents
                (id, phone, full_name, nrc_number, business_name, phone_verified,
                 status, reviewed_by, reviewed_at, status_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(agent.id)
        .bind(&agent.phone)
        .bind(&agent.full_name)
        .bind(&agent.nrc_number)
        .bind(&agent.business_name)
        .bind(agent.phone_verified)
        .bind(agent.status.as_str())
        .bind(&agent.reviewed_by)
        .bind(agent.reviewed_at)
        .bind(&agent.status_reason)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::BadRequest(format!("Phone {} is already registered", agent.phone))
            } else {
                AppError::from(e)
            }
        })?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>, AppError> {
        Ok(
            sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn mark_phone_verified(
        &self,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE agents SET phone_verified = TRUE, updated_at = $2 WHERE id = $1",
        )
        .bind(agent_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_agent(
        &self,
        change: &AgentStatusChange,
        opening: Option<&AccountOpening>,
    ) -> Result<Option<Agent>, AppError> {
        let from: Vec<String> = change.from.iter().map(|s| s.as_str().to_string()).collect();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Agent>(
            r#"
            UPDATE agents
            SET status = $2, reviewed_by = $3, reviewed_at = $4,
                status_reason = $5, updated_at = $4
            WHERE id = $1 AND status = ANY($6)
            RETURNING *
            "#,
        )
        .bind(change.agent_id)
        .bind(change.to.as_str())
        .bind(&change.reviewer)
        .bind(change.at)
        .bind(&change.reason)
        .bind(&from)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(agent) = updated else {
            return Ok(None);
        };

        if let Some(opening) = opening {
            let account = &opening.account;
            sqlx::query(
                r#"
                INSERT INTO float_accounts
                    (agent_id, current_balance, welcome_bonus, daily_quota_remaining,
                     daily_quota_limit, last_quota_reset, utc_offset_minutes,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (agent_id) DO NOTHING
                "#,
            )
            .bind(account.agent_id)
            .bind(&account.current_balance)
            .bind(&account.welcome_bonus)
            .bind(account.daily_quota_remaining)
            .bind(account.daily_quota_limit)
            .bind(account.last_quota_reset)
            .bind(account.utc_offset_minutes)
            .bind(account.created_at)
            .bind(account.updated_at)
            .execute(&mut *tx)
            .await?;

            let performance = &opening.performance;
            sqlx::query(
                r#"
                INSERT INTO performance_tiers
                    (agent_id, tier, total_requests_completed, cost_per_request,
                     bonus_percentage, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (agent_id) DO NOTHING
                "#,
            )
            .bind(performance.agent_id)
            .bind(performance.tier.as_str())
            .bind(performance.total_requests_completed)
            .bind(&performance.cost_per_request)
            .bind(&performance.bonus_percentage)
            .bind(performance.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(agent))
    }

    async fn find_reassignment_candidate(
        &self,
        booking_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, AppError> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT a.id
            FROM agents a
            LEFT JOIN performance_tiers p ON p.agent_id = a.id
            WHERE a.status = 'approved'
              AND a.id <> $2
              AND NOT EXISTS (
                  SELECT 1 FROM assignment_history h
                  WHERE h.booking_id = $1 AND h.agent_id = a.id
              )
            ORDER BY COALESCE(p.total_requests_completed, 0) DESC, a.created_at ASC
            LIMIT 1
            "#,
        )
        .bind(booking_id)
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn get_account(&self, agent_id: Uuid) -> Result<Option<FloatAccount>, AppError> {
        Ok(
            sqlx::query_as::<_, FloatAccount>("SELECT * FROM float_accounts WHERE agent_id = $1")
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn reset_daily_quota(
        &self,
        agent_id: Uuid,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<FloatAccount>, AppError> {
        Ok(sqlx::query_as::<_, FloatAccount>(
            r#"
            UPDATE float_accounts
            SET daily_quota_remaining = daily_quota_limit,
                last_quota_reset = $2,
                updated_at = $3
            WHERE agent_id = $1 AND last_quota_reset < $2
            RETURNING *
            "#,
        )
        .bind(agent_id)
        .bind(today)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn post_credit(&self, transaction: &FloatTransaction) -> Result<FloatAccount, AppError> {
        let now = transaction.completed_at.unwrap_or(transaction.created_at);
        let mut tx = self.pool.begin().await?;
        let account = apply_credit(&mut tx, transaction, now).await?;
        insert_transaction(&mut tx, transaction).await?;
        tx.commit().await?;
        Ok(account)
    }

    async fn insert_pending_transaction(
        &self,
        transaction: &FloatTransaction,
    ) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_transaction(&mut conn, transaction)
            .await
            .map_err(|e| {
                if e.as_database_error()
                    .and_then(|d| d.code())
                    .map(|code| code == "23503")
                    .unwrap_or(false)
                {
                    AppError::NotFound(format!("Float account for {}", transaction.agent_id))
                } else {
                    AppError::from(e)
                }
            })
    }

    async fn settle_transaction(
        &self,
        transaction_id: Uuid,
        outcome: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<FloatTransaction>, AppError> {
        let mut tx = self.pool.begin().await?;
        let settled = sqlx::query_as::<_, FloatTransaction>(
            r#"
            UPDATE float_transactions
            SET status = $2, completed_at = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(transaction_id)
        .bind(outcome.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(settled) = settled else {
            return Ok(None);
        };
        if outcome == TransactionStatus::Completed {
            apply_credit(&mut tx, &settled, now).await?;
        }
        tx.commit().await?;
        Ok(Some(settled))
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<FloatTransaction>, AppError> {
        Ok(sqlx::query_as::<_, FloatTransaction>(
            "SELECT * FROM float_transactions WHERE id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_transactions(
        &self,
        agent_id: Uuid,
        limit: i64,
    ) -> Result<Vec<FloatTransaction>, AppError> {
        Ok(sqlx::query_as::<_, FloatTransaction>(
            r#"
            SELECT * FROM float_transactions
            WHERE agent_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(agent_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing transactions for agent {}", agent_id))?)
    }

    async fn reconcile_balance(
        &self,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Reconciliation>, AppError> {
        let mut tx = self.pool.begin().await?;
        let account = sqlx::query_as::<_, FloatAccount>(
            "SELECT * FROM float_accounts WHERE agent_id = $1 FOR UPDATE",
        )
        .bind(agent_id)
        .fetch_optional(&mut *tx)
        .await
        .context("locking float account for reconciliation")?;
        let Some(account) = account else {
            return Ok(None);
        };

        let ledger_sum = sqlx::query_scalar::<_, BigDecimal>(
            r#"
            SELECT COALESCE(SUM(amount_zmw), 0)
            FROM float_transactions
            WHERE agent_id = $1 AND status = 'completed'
            "#,
        )
        .bind(agent_id)
        .fetch_one(&mut *tx)
        .await
        .context("summing completed transactions")?;

        let derived = &account.welcome_bonus + &ledger_sum;
        let drift = &account.current_balance - &derived;
        let corrected = drift != BigDecimal::from(0);
        if corrected {
            sqlx::query(
                "UPDATE float_accounts SET current_balance = $2, updated_at = $3 WHERE agent_id = $1",
            )
            .bind(agent_id)
            .bind(&derived)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(Some(Reconciliation {
            agent_id,
            recorded_balance: account.current_balance,
            derived_balance: derived,
            drift,
            corrected,
        }))
    }

    async fn insert_ticket_request(&self, request: &TicketRequest) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO ticket_requests
                (id, origin, destination, travel_date, passenger_count, passenger_names,
                 contact_name, contact_phone, contact_email, status, agent_id,
                 agent_claimed_at, request_expires_at, completed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(request.id)
        .bind(&request.origin)
        .bind(&request.destination)
        .bind(request.travel_date)
        .bind(request.passenger_count)
        .bind(&request.passenger_names)
        .bind(&request.contact_name)
        .bind(&request.contact_phone)
        .bind(&request.contact_email)
        .bind(request.status.as_str())
        .bind(request.agent_id)
        .bind(request.agent_claimed_at)
        .bind(request.request_expires_at)
        .bind(request.completed_at)
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ticket_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<TicketRequest>, AppError> {
        Ok(
            sqlx::query_as::<_, TicketRequest>("SELECT * FROM ticket_requests WHERE id = $1")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_open_requests(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TicketRequest>, AppError> {
        Ok(sqlx::query_as::<_, TicketRequest>(
            r#"
            SELECT * FROM ticket_requests
            WHERE status = 'open' AND request_expires_at > $1
            ORDER BY request_expires_at, created_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn record_view(
        &self,
        request_id: Uuid,
        charge: &Charge,
        now: DateTime<Utc>,
    ) -> Result<ViewRecord, AppError> {
        let mut tx = self.pool.begin().await?;
        let request = fetch_request(&mut tx, request_id).await?;
        if let Some(reason) = request.unavailable_reason(now) {
            return Err(reason);
        }

        let existing = sqlx::query_as::<_, RequestView>(
            "SELECT * FROM request_views WHERE agent_id = $1 AND ticket_request_id = $2",
        )
        .bind(charge.agent_id)
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(view) = existing {
            return Ok(ViewRecord {
                request,
                view,
                transaction: None,
                newly_charged: false,
            });
        }

        let transaction = debit(&mut tx, charge, request_id, now).await?;
        let view = RequestView {
            agent_id: charge.agent_id,
            ticket_request_id: request_id,
            transaction_id: transaction.as_ref().map(|t| t.id),
            viewed_at: now,
        };
        sqlx::query(
            r#"
            INSERT INTO request_views (agent_id, ticket_request_id, transaction_id, viewed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(view.agent_id)
        .bind(view.ticket_request_id)
        .bind(view.transaction_id)
        .bind(view.viewed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict("concurrent view of the same request".to_string())
            } else {
                AppError::from(e)
            }
        })?;

        tx.commit().await?;
        Ok(ViewRecord {
            request,
            view,
            transaction,
            newly_charged: true,
        })
    }

    async fn claim_request(
        &self,
        request_id: Uuid,
        charge: &Charge,
        now: DateTime<Utc>,
    ) -> Result<ClaimRecord, AppError> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query_as::<_, TicketRequest>(
            r#"
            UPDATE ticket_requests
            SET status = 'claimed_by_agent', agent_id = $2, agent_claimed_at = $3
            WHERE id = $1 AND status = 'open' AND request_expires_at > $3
            RETURNING *
            "#,
        )
        .bind(request_id)
        .bind(charge.agent_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(request) = claimed else {
            let current = fetch_request(&mut tx, request_id).await?;
            return Err(current
                .unavailable_reason(now)
                .unwrap_or_else(|| AppError::Conflict("claim lost a race".to_string())));
        };

        let transaction = debit(&mut tx, charge, request_id, now).await?;
        tx.commit().await?;
        Ok(ClaimRecord {
            request,
            transaction,
        })
    }

    async fn complete_request(
        &self,
        ticket: &ProcessedTicket,
        now: DateTime<Utc>,
    ) -> Result<CompletionRecord, AppError> {
        let mut tx = self.pool.begin().await?;
        let completed = sqlx::query_as::<_, TicketRequest>(
            r#"
            UPDATE ticket_requests
            SET status = 'completed', completed_at = $3
            WHERE id = $1 AND agent_id = $2
              AND status = 'claimed_by_agent' AND request_expires_at > $3
              AND EXISTS (SELECT 1 FROM agents WHERE id = $2 AND status = 'approved')
            RETURNING *
            "#,
        )
        .bind(ticket.ticket_request_id)
        .bind(ticket.agent_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(request) = completed else {
            let agent_status = sqlx::query_scalar::<_, String>(
                "SELECT status FROM agents WHERE id = $1",
            )
            .bind(ticket.agent_id)
            .fetch_optional(&mut *tx)
            .await?;
            if agent_status.as_deref() != Some(AgentStatus::Approved.as_str()) {
                return Err(AppError::AgentNotEligible);
            }
            let current = fetch_request(&mut tx, ticket.ticket_request_id).await?;
            if current.agent_id != Some(ticket.agent_id) {
                return Err(AppError::NotFound(format!(
                    "Ticket request {} is not claimed by this agent",
                    ticket.ticket_request_id
                )));
            }
            return Err(match current.status {
                TicketRequestStatus::ClaimedByAgent | TicketRequestStatus::Expired => {
                    AppError::RequestExpired
                }
                other => AppError::InvalidTransition(format!("ticket request is {}", other)),
            });
        };

        sqlx::query(
            r#"
            INSERT INTO processed_tickets
                (id, ticket_request_id, agent_id, receipt_url, ticket_number, amount_paid,
                 metadata, receipt_verification_status, verified_by, verified_at,
                 rejection_reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(ticket.id)
        .bind(ticket.ticket_request_id)
        .bind(ticket.agent_id)
        .bind(&ticket.receipt_url)
        .bind(&ticket.ticket_number)
        .bind(&ticket.amount_paid)
        .bind(&ticket.metadata)
        .bind(ticket.receipt_verification_status.as_str())
        .bind(&ticket.verified_by)
        .bind(ticket.verified_at)
        .bind(&ticket.rejection_reason)
        .bind(ticket.created_at)
        .execute(&mut *tx)
        .await?;

        let total_completed = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE performance_tiers
            SET total_requests_completed = total_requests_completed + 1, updated_at = $2
            WHERE agent_id = $1
            RETURNING total_requests_completed
            "#,
        )
        .bind(ticket.agent_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::AgentNotEligible)?;

        tx.commit().await?;
        Ok(CompletionRecord {
            request,
            ticket: ticket.clone(),
            total_completed,
        })
    }

    async fn expire_request(
        &self,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TicketRequest>, AppError> {
        Ok(sqlx::query_as::<_, TicketRequest>(
            r#"
            UPDATE ticket_requests
            SET status = 'expired'
            WHERE id = $1
              AND status IN ('open', 'claimed_by_agent')
              AND request_expires_at <= $2
            RETURNING *
            "#,
        )
        .bind(request_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn expire_due_requests(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ticket_requests
            SET status = 'expired'
            WHERE status IN ('open', 'claimed_by_agent') AND request_expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_processed_ticket(
        &self,
        ticket_id: Uuid,
    ) -> Result<Option<ProcessedTicket>, AppError> {
        Ok(
            sqlx::query_as::<_, ProcessedTicket>("SELECT * FROM processed_tickets WHERE id = $1")
                .bind(ticket_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn review_processed_ticket(
        &self,
        ticket_id: Uuid,
        outcome: ReceiptVerificationStatus,
        reviewer: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessedTicket>, AppError> {
        Ok(sqlx::query_as::<_, ProcessedTicket>(
            r#"
            UPDATE processed_tickets
            SET receipt_verification_status = $2, verified_by = $3,
                verified_at = $4, rejection_reason = $5
            WHERE id = $1 AND receipt_verification_status = 'pending'
            RETURNING *
            "#,
        )
        .bind(ticket_id)
        .bind(outcome.as_str())
        .bind(reviewer)
        .bind(now)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn get_performance(&self, agent_id: Uuid) -> Result<Option<PerformanceTier>, AppError> {
        Ok(sqlx::query_as::<_, PerformanceTier>(
            "SELECT * FROM performance_tiers WHERE agent_id = $1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn upgrade_tier(
        &self,
        agent_id: Uuid,
        tier: Tier,
        cost_per_request: &BigDecimal,
        bonus_percentage: &BigDecimal,
        now: DateTime<Utc>,
    ) -> Result<Option<PerformanceTier>, AppError> {
        let lower: Vec<String> = tier.lower().iter().map(|t| t.as_str().to_string()).collect();
        Ok(sqlx::query_as::<_, PerformanceTier>(
            r#"
            UPDATE performance_tiers
            SET tier = $2, cost_per_request = $3, bonus_percentage = $4, updated_at = $5
            WHERE agent_id = $1 AND tier = ANY($6)
            RETURNING *
            "#,
        )
        .bind(agent_id)
        .bind(tier.as_str())
        .bind(cost_per_request)
        .bind(bonus_percentage)
        .bind(now)
        .bind(&lower)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn insert_bonus(&self, bonus: &Bonus) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO bonuses
                (id, agent_id, bonus_type, amount, description, claimed, claimed_at,
                 expires_at, dedupe_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (dedupe_key) DO NOTHING
            "#,
        )
        .bind(bonus.id)
        .bind(bonus.agent_id)
        .bind(bonus.bonus_type.as_str())
        .bind(&bonus.amount)
        .bind(&bonus.description)
        .bind(bonus.claimed)
        .bind(bonus.claimed_at)
        .bind(bonus.expires_at)
        .bind(&bonus.dedupe_key)
        .bind(bonus.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_bonuses(&self, agent_id: Uuid) -> Result<Vec<Bonus>, AppError> {
        Ok(sqlx::query_as::<_, Bonus>(
            "SELECT * FROM bonuses WHERE agent_id = $1 ORDER BY created_at DESC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn claim_bonus(
        &self,
        agent_id: Uuid,
        bonus_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Bonus, FloatTransaction), AppError> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query_as::<_, Bonus>(
            r#"
            UPDATE bonuses
            SET claimed = TRUE, claimed_at = $3
            WHERE id = $1 AND agent_id = $2 AND claimed = FALSE
              AND (expires_at IS NULL OR expires_at > $3)
            RETURNING *
            "#,
        )
        .bind(bonus_id)
        .bind(agent_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(bonus) = claimed else {
            let current = sqlx::query_as::<_, Bonus>(
                "SELECT * FROM bonuses WHERE id = $1 AND agent_id = $2",
            )
            .bind(bonus_id)
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?;
            return Err(match current {
                None => AppError::NotFound(format!("Bonus {}", bonus_id)),
                Some(b) if b.claimed => AppError::AlreadyClaimedBonus,
                Some(_) => AppError::BonusExpired,
            });
        };

        let transaction = FloatTransaction::completed(
            agent_id,
            TransactionType::Bonus,
            bonus.amount.clone(),
            0,
            Some(format!("bonus:{}", bonus_id)),
            now,
        );
        apply_credit(&mut tx, &transaction, now).await?;
        insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;
        Ok((bonus, transaction))
    }

    async fn credit_referral(
        &self,
        referral: &Referral,
    ) -> Result<(FloatTransaction, FloatTransaction), AppError> {
        let now = referral.credited_at.unwrap_or(referral.created_at);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO referrals
                (id, referrer_id, referred_id, status, referrer_amount, referred_amount,
                 created_at, credited_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(referral.id)
        .bind(referral.referrer_id)
        .bind(referral.referred_id)
        .bind(referral.status.as_str())
        .bind(&referral.referrer_amount)
        .bind(&referral.referred_amount)
        .bind(referral.created_at)
        .bind(referral.credited_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::ReferralExists
            } else {
                AppError::from(e)
            }
        })?;

        let reference = Some(format!("referral:{}", referral.id));
        let referrer_tx = FloatTransaction::completed(
            referral.referrer_id,
            TransactionType::Referral,
            referral.referrer_amount.clone(),
            0,
            reference.clone(),
            now,
        );
        let referred_tx = FloatTransaction::completed(
            referral.referred_id,
            TransactionType::Referral,
            referral.referred_amount.clone(),
            0,
            reference,
            now,
        );

        // Lock accounts in id order so two referrals between the same pair cannot deadlock.
        let (first, second) = if referral.referrer_id < referral.referred_id {
            (&referrer_tx, &referred_tx)
        } else {
            (&referred_tx, &referrer_tx)
        };
        apply_credit(&mut tx, first, now).await?;
        apply_credit(&mut tx, second, now).await?;
        insert_transaction(&mut tx, &referrer_tx).await?;
        insert_transaction(&mut tx, &referred_tx).await?;

        tx.commit().await?;
        Ok((referrer_tx, referred_tx))
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO bookings
                (id, booking_reference, status, assigned_agent_id, assignment_status,
                 assignment_response_deadline, assigned_at, assigned_by, escalated,
                 escalated_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(booking.id)
        .bind(&booking.booking_reference)
        .bind(booking.status.as_str())
        .bind(booking.assigned_agent_id)
        .bind(booking.assignment_status.map(|s| s.as_str()))
        .bind(booking.assignment_response_deadline)
        .bind(booking.assigned_at)
        .bind(&booking.assigned_by)
        .bind(booking.escalated)
        .bind(booking.escalated_at)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, AppError> {
        Ok(
            sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
                .bind(booking_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn assign_booking(&self, offer: &AssignmentOffer) -> Result<Booking, AppError> {
        let mut tx = self.pool.begin().await?;

        let status = sqlx::query_scalar::<_, String>("SELECT status FROM agents WHERE id = $1")
            .bind(offer.agent_id)
            .fetch_optional(&mut *tx)
            .await?;
        if status.as_deref() != Some(AgentStatus::Approved.as_str()) {
            return Err(AppError::AgentNotEligible);
        }

        let assigned = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET assigned_agent_id = $2,
                assignment_status = 'pending',
                assignment_response_deadline = $3,
                assigned_at = $4,
                assigned_by = $5,
                updated_at = $4
            WHERE id = $1
              AND status = 'confirmed'
              AND (assignment_status IS NULL OR assignment_status IN ('rejected', 'expired'))
            RETURNING *
            "#,
        )
        .bind(offer.booking_id)
        .bind(offer.agent_id)
        .bind(offer.deadline)
        .bind(offer.at)
        .bind(&offer.assigned_by)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(booking) = assigned else {
            let current = sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
                .bind(offer.booking_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Booking {}", offer.booking_id)))?;
            if current.status != BookingStatus::Confirmed {
                return Err(AppError::InvalidTransition(format!(
                    "booking is {}, only confirmed bookings can be assigned",
                    current.status
                )));
            }
            return Err(AppError::Conflict(format!(
                "booking assignment is already {}",
                assignment_label(current.assignment_status)
            )));
        };

        insert_history(
            &mut tx,
            &AssignmentHistory::record(
                offer.booking_id,
                offer.agent_id,
                AssignmentAction::Assigned,
                &offer.assigned_by,
                Some(format!("deadline {}", offer.deadline.to_rfc3339())),
                offer.at,
            ),
        )
        .await?;

        tx.commit().await?;
        Ok(booking)
    }

    async fn respond_assignment(
        &self,
        booking_id: Uuid,
        agent_id: Uuid,
        accept: bool,
        now: DateTime<Utc>,
    ) -> Result<Booking, AppError> {
        let (status, action) = if accept {
            (AssignmentStatus::Accepted, AssignmentAction::Accepted)
        } else {
            (AssignmentStatus::Rejected, AssignmentAction::Rejected)
        };
        let mut tx = self.pool.begin().await?;

        let responded = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET assignment_status = $3,
                updated_at = $4,
                escalated = escalated OR $5,
                escalated_at = CASE WHEN $5 THEN $4 ELSE escalated_at END
            WHERE id = $1
              AND assigned_agent_id = $2
              AND assignment_status = 'pending'
              AND assignment_response_deadline > $4
            RETURNING *
            "#,
        )
        .bind(booking_id)
        .bind(agent_id)
        .bind(status.as_str())
        .bind(now)
        .bind(!accept)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(booking) = responded else {
            let current = sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
                .bind(booking_id)
                .fetch_optional(&mut *tx)
                .await?
                .filter(|b| b.assigned_agent_id == Some(agent_id))
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "Booking {} is not assigned to this agent",
                        booking_id
                    ))
                })?;
            if current.assignment_status != Some(AssignmentStatus::Pending) {
                return Err(AppError::InvalidTransition(format!(
                    "assignment is {}",
                    assignment_label(current.assignment_status)
                )));
            }
            return Err(AppError::AssignmentExpired);
        };

        let actor = agent_id.to_string();
        insert_history(
            &mut tx,
            &AssignmentHistory::record(booking_id, agent_id, action, &actor, None, now),
        )
        .await?;
        if !accept {
            insert_history(
                &mut tx,
                &AssignmentHistory::record(
                    booking_id,
                    agent_id,
                    AssignmentAction::Escalated,
                    "system",
                    Some("rejected by agent".to_string()),
                    now,
                ),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(booking)
    }

    async fn expire_assignment(
        &self,
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>, AppError> {
        let mut tx = self.pool.begin().await?;
        let expired = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET assignment_status = 'expired', escalated = TRUE,
                escalated_at = $2, updated_at = $2
            WHERE id = $1
              AND assignment_status = 'pending'
              AND assignment_response_deadline <= $2
              AND assigned_agent_id IS NOT NULL
            RETURNING *
            "#,
        )
        .bind(booking_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(booking) = expired else {
            return Ok(None);
        };
        let Some(agent_id) = booking.assigned_agent_id else {
            return Ok(None);
        };

        insert_history(
            &mut tx,
            &AssignmentHistory::record(
                booking_id,
                agent_id,
                AssignmentAction::Expired,
                "system",
                None,
                now,
            ),
        )
        .await?;
        insert_history(
            &mut tx,
            &AssignmentHistory::record(
                booking_id,
                agent_id,
                AssignmentAction::Escalated,
                "system",
                Some("response deadline elapsed".to_string()),
                now,
            ),
        )
        .await?;

        tx.commit().await?;
        Ok(Some(booking))
    }

    async fn list_overdue_assignments(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM bookings
            WHERE assignment_status = 'pending' AND assignment_response_deadline <= $1
            ORDER BY assignment_response_deadline
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_agent_assignments(&self, agent_id: Uuid) -> Result<Vec<Booking>, AppError> {
        Ok(sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE assigned_agent_id = $1 ORDER BY assigned_at DESC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn assignment_history(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<AssignmentHistory>, AppError> {
        Ok(sqlx::query_as::<_, AssignmentHistory>(
            "SELECT * FROM assignment_history WHERE booking_id = $1 ORDER BY created_at, id",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

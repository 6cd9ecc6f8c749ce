//! Postgres backend.
//!
//! Schema is created on connect. All transitions are compare-and-set
//! UPDATEs; a zero-row result is disambiguated into not-found versus
//! state-moved-on by re-reading the record. Flag resolution and its deal
//! reconciliation run in one transaction under row locks, and action
//! appends serialize on a table lock so the hash chain never forks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealdesk_core::audit::{compute_action_hash, ActionAppend, ActionKind, ComplianceAction};
use dealdesk_core::reconciler;
use dealdesk_core::store::{
    ActionStore, DealStore, FlagStore, InstrumentStore, QueryWindow, RequirementStore,
    RequirementsUpsert, SettlementStore, StoreError, StoreResult,
};
use dealdesk_core::types::{
    ChecklistEntry, ComplianceFlag, ComplianceStatus, Deal, DealStatus, EscrowMilestone,
    FlagResolution, FundingInstrument, FundingRequirement, InstrumentStage, ReleaseStatus,
    RequirementStatus, SettlementInstruction, SettlementPayload, SettlementRail, Severity,
    VerificationStatus,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

pub struct PostgresBackOfficeStore {
    pool: PgPool,
}

impl PostgresBackOfficeStore {
    /// Connect and create the schema if it does not exist yet.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(backend)?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(max_connections, "postgres store connected");
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS desk_deals (
                deal_id             TEXT PRIMARY KEY,
                counterparty        TEXT NOT NULL,
                commodity           TEXT NOT NULL,
                value_minor         BIGINT NOT NULL,
                currency            TEXT NOT NULL,
                origin_country      TEXT NOT NULL,
                destination_country TEXT NOT NULL,
                incoterm            TEXT,
                quantity_mt         DOUBLE PRECISION NOT NULL,
                payment_terms       TEXT NOT NULL,
                status              TEXT NOT NULL,
                compliance_status   TEXT NOT NULL,
                created_at          TIMESTAMPTZ NOT NULL,
                updated_at          TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS desk_flags (
                flag_id          TEXT PRIMARY KEY,
                deal_id          TEXT NOT NULL REFERENCES desk_deals(deal_id),
                rule_code        TEXT NOT NULL,
                rationale        TEXT NOT NULL,
                severity         TEXT NOT NULL,
                blocks_execution BOOLEAN NOT NULL,
                resolved         BOOLEAN NOT NULL,
                resolved_by      TEXT,
                resolved_at      TIMESTAMPTZ,
                resolution_notes TEXT,
                raised_at        TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS desk_requirements (
                requirement_id   TEXT PRIMARY KEY,
                deal_id          TEXT NOT NULL REFERENCES desk_deals(deal_id),
                requirement_type TEXT NOT NULL,
                label            TEXT NOT NULL,
                is_critical      BOOLEAN NOT NULL,
                status           TEXT NOT NULL,
                due_date         TIMESTAMPTZ,
                reviewer         TEXT,
                created_at       TIMESTAMPTZ NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL,
                UNIQUE (deal_id, requirement_type, label)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS desk_instruments (
                instrument_id           TEXT PRIMARY KEY,
                deal_id                 TEXT NOT NULL REFERENCES desk_deals(deal_id),
                instrument_type         TEXT NOT NULL,
                issuing_bank            TEXT NOT NULL,
                issuing_bank_bic        TEXT NOT NULL,
                advising_bank           TEXT,
                beneficiary             TEXT NOT NULL,
                amount_minor            BIGINT NOT NULL,
                currency                TEXT NOT NULL,
                issued_at               TIMESTAMPTZ,
                expires_at              TIMESTAMPTZ,
                stage                   TEXT NOT NULL,
                verification_status     TEXT NOT NULL,
                human_approval_required BOOLEAN NOT NULL,
                approved_by             TEXT,
                approved_at             TIMESTAMPTZ,
                approval_notes          TEXT,
                rejected_by             TEXT,
                rejected_at             TIMESTAMPTZ,
                rejection_reason        TEXT,
                last_verified_at        TIMESTAMPTZ,
                created_at              TIMESTAMPTZ NOT NULL,
                updated_at              TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS desk_settlements (
                settlement_id  TEXT PRIMARY KEY,
                deal_id        TEXT NOT NULL REFERENCES desk_deals(deal_id),
                rail           TEXT NOT NULL,
                payload        JSONB NOT NULL,
                checklist      JSONB NOT NULL,
                is_validated   BOOLEAN NOT NULL,
                revision       INTEGER NOT NULL,
                created_at     TIMESTAMPTZ NOT NULL,
                revalidated_at TIMESTAMPTZ
            )"#,
            r#"CREATE TABLE IF NOT EXISTS desk_milestones (
                milestone_id   TEXT PRIMARY KEY,
                settlement_id  TEXT NOT NULL REFERENCES desk_settlements(settlement_id),
                deal_id        TEXT NOT NULL,
                label          TEXT NOT NULL,
                sequence       INTEGER NOT NULL,
                release_status TEXT NOT NULL,
                created_at     TIMESTAMPTZ NOT NULL,
                updated_at     TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS desk_actions (
                action_id     TEXT PRIMARY KEY,
                sequence      BIGINT NOT NULL UNIQUE,
                deal_id       TEXT,
                actor         TEXT NOT NULL,
                kind          TEXT NOT NULL,
                detail        TEXT NOT NULL,
                payload       JSONB NOT NULL,
                occurred_at   TIMESTAMPTZ NOT NULL,
                previous_hash TEXT,
                hash          TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_desk_flags_deal ON desk_flags(deal_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_desk_actions_deal ON desk_actions(deal_id)"#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value, what: &str) -> StoreResult<T> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::Serialization(format!("{what} decode failed: {e}")))
}

fn encode<T: serde::Serialize>(value: &T, what: &str) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::Serialization(format!("{what} encode failed: {e}")))
}

fn enum_str<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Serialization(format!(
            "expected string encoding, got {other}"
        ))),
    }
}

fn enum_parse<T: serde::de::DeserializeOwned>(value: &str, what: &str) -> StoreResult<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| StoreError::Serialization(format!("unknown {what}: {value}")))
}

fn window_args(window: QueryWindow) -> (i64, i64) {
    (window.limit as i64, window.offset as i64)
}

fn deal_from_row(row: &PgRow) -> StoreResult<Deal> {
    Ok(Deal {
        deal_id: row.try_get("deal_id").map_err(backend)?,
        counterparty: row.try_get("counterparty").map_err(backend)?,
        commodity: row.try_get("commodity").map_err(backend)?,
        value_minor: row.try_get("value_minor").map_err(backend)?,
        currency: row.try_get("currency").map_err(backend)?,
        origin_country: row.try_get("origin_country").map_err(backend)?,
        destination_country: row.try_get("destination_country").map_err(backend)?,
        incoterm: row.try_get("incoterm").map_err(backend)?,
        quantity_mt: row.try_get("quantity_mt").map_err(backend)?,
        payment_terms: row.try_get("payment_terms").map_err(backend)?,
        status: enum_parse(row.try_get::<String, _>("status").map_err(backend)?.as_str(), "deal status")?,
        compliance_status: enum_parse(
            row.try_get::<String, _>("compliance_status")
                .map_err(backend)?
                .as_str(),
            "compliance status",
        )?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn flag_from_row(row: &PgRow) -> StoreResult<ComplianceFlag> {
    Ok(ComplianceFlag {
        flag_id: row.try_get("flag_id").map_err(backend)?,
        deal_id: row.try_get("deal_id").map_err(backend)?,
        rule_code: row.try_get("rule_code").map_err(backend)?,
        rationale: row.try_get("rationale").map_err(backend)?,
        severity: enum_parse::<Severity>(
            row.try_get::<String, _>("severity").map_err(backend)?.as_str(),
            "severity",
        )?,
        blocks_execution: row.try_get("blocks_execution").map_err(backend)?,
        resolved: row.try_get("resolved").map_err(backend)?,
        resolved_by: row.try_get("resolved_by").map_err(backend)?,
        resolved_at: row.try_get("resolved_at").map_err(backend)?,
        resolution_notes: row.try_get("resolution_notes").map_err(backend)?,
        raised_at: row.try_get("raised_at").map_err(backend)?,
    })
}

fn requirement_from_row(row: &PgRow) -> StoreResult<FundingRequirement> {
    Ok(FundingRequirement {
        requirement_id: row.try_get("requirement_id").map_err(backend)?,
        deal_id: row.try_get("deal_id").map_err(backend)?,
        requirement_type: row.try_get("requirement_type").map_err(backend)?,
        label: row.try_get("label").map_err(backend)?,
        is_critical: row.try_get("is_critical").map_err(backend)?,
        status: enum_parse::<RequirementStatus>(
            row.try_get::<String, _>("status").map_err(backend)?.as_str(),
            "requirement status",
        )?,
        due_date: row.try_get("due_date").map_err(backend)?,
        reviewer: row.try_get("reviewer").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn instrument_from_row(row: &PgRow) -> StoreResult<FundingInstrument> {
    Ok(FundingInstrument {
        instrument_id: row.try_get("instrument_id").map_err(backend)?,
        deal_id: row.try_get("deal_id").map_err(backend)?,
        instrument_type: row.try_get("instrument_type").map_err(backend)?,
        issuing_bank: row.try_get("issuing_bank").map_err(backend)?,
        issuing_bank_bic: row.try_get("issuing_bank_bic").map_err(backend)?,
        advising_bank: row.try_get("advising_bank").map_err(backend)?,
        beneficiary: row.try_get("beneficiary").map_err(backend)?,
        amount_minor: row.try_get("amount_minor").map_err(backend)?,
        currency: row.try_get("currency").map_err(backend)?,
        issued_at: row.try_get("issued_at").map_err(backend)?,
        expires_at: row.try_get("expires_at").map_err(backend)?,
        stage: enum_parse::<InstrumentStage>(
            row.try_get::<String, _>("stage").map_err(backend)?.as_str(),
            "instrument stage",
        )?,
        verification_status: enum_parse::<VerificationStatus>(
            row.try_get::<String, _>("verification_status")
                .map_err(backend)?
                .as_str(),
            "verification status",
        )?,
        human_approval_required: row.try_get("human_approval_required").map_err(backend)?,
        approved_by: row.try_get("approved_by").map_err(backend)?,
        approved_at: row.try_get("approved_at").map_err(backend)?,
        approval_notes: row.try_get("approval_notes").map_err(backend)?,
        rejected_by: row.try_get("rejected_by").map_err(backend)?,
        rejected_at: row.try_get("rejected_at").map_err(backend)?,
        rejection_reason: row.try_get("rejection_reason").map_err(backend)?,
        last_verified_at: row.try_get("last_verified_at").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn settlement_from_row(row: &PgRow) -> StoreResult<SettlementInstruction> {
    Ok(SettlementInstruction {
        settlement_id: row.try_get("settlement_id").map_err(backend)?,
        deal_id: row.try_get("deal_id").map_err(backend)?,
        rail: enum_parse::<SettlementRail>(
            row.try_get::<String, _>("rail").map_err(backend)?.as_str(),
            "settlement rail",
        )?,
        payload: decode::<SettlementPayload>(
            row.try_get("payload").map_err(backend)?,
            "settlement payload",
        )?,
        checklist: decode::<Vec<ChecklistEntry>>(
            row.try_get("checklist").map_err(backend)?,
            "settlement checklist",
        )?,
        is_validated: row.try_get("is_validated").map_err(backend)?,
        revision: row.try_get::<i32, _>("revision").map_err(backend)? as u32,
        created_at: row.try_get("created_at").map_err(backend)?,
        revalidated_at: row.try_get("revalidated_at").map_err(backend)?,
    })
}

fn milestone_from_row(row: &PgRow) -> StoreResult<EscrowMilestone> {
    Ok(EscrowMilestone {
        milestone_id: row.try_get("milestone_id").map_err(backend)?,
        settlement_id: row.try_get("settlement_id").map_err(backend)?,
        deal_id: row.try_get("deal_id").map_err(backend)?,
        label: row.try_get("label").map_err(backend)?,
        sequence: row.try_get::<i32, _>("sequence").map_err(backend)? as u32,
        release_status: enum_parse::<ReleaseStatus>(
            row.try_get::<String, _>("release_status")
                .map_err(backend)?
                .as_str(),
            "release status",
        )?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn action_from_row(row: &PgRow) -> StoreResult<ComplianceAction> {
    let kind_str: String = row.try_get("kind").map_err(backend)?;
    let kind = ActionKind::parse(&kind_str)
        .ok_or_else(|| StoreError::Serialization(format!("unknown action kind: {kind_str}")))?;
    Ok(ComplianceAction {
        action_id: row.try_get("action_id").map_err(backend)?,
        sequence: row.try_get::<i64, _>("sequence").map_err(backend)? as u64,
        deal_id: row.try_get("deal_id").map_err(backend)?,
        actor: row.try_get("actor").map_err(backend)?,
        kind,
        detail: row.try_get("detail").map_err(backend)?,
        payload: row.try_get("payload").map_err(backend)?,
        occurred_at: row.try_get("occurred_at").map_err(backend)?,
        previous_hash: row.try_get("previous_hash").map_err(backend)?,
        hash: row.try_get("hash").map_err(backend)?,
    })
}

#[async_trait]
impl DealStore for PostgresBackOfficeStore {
    async fn create_deal(&self, deal: Deal) -> StoreResult<Deal> {
        let result = sqlx::query(
            r#"INSERT INTO desk_deals
               (deal_id, counterparty, commodity, value_minor, currency, origin_country,
                destination_country, incoterm, quantity_mt, payment_terms, status,
                compliance_status, created_at, updated_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
               ON CONFLICT (deal_id) DO NOTHING"#,
        )
        .bind(&deal.deal_id)
        .bind(&deal.counterparty)
        .bind(&deal.commodity)
        .bind(deal.value_minor)
        .bind(&deal.currency)
        .bind(&deal.origin_country)
        .bind(&deal.destination_country)
        .bind(&deal.incoterm)
        .bind(deal.quantity_mt)
        .bind(&deal.payment_terms)
        .bind(enum_str(&deal.status)?)
        .bind(enum_str(&deal.compliance_status)?)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "deal {} already exists",
                deal.deal_id
            )));
        }
        Ok(deal)
    }

    async fn get_deal(&self, deal_id: &str) -> StoreResult<Deal> {
        let row = sqlx::query("SELECT * FROM desk_deals WHERE deal_id = $1")
            .bind(deal_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("deal {deal_id}")))?;
        deal_from_row(&row)
    }

    async fn list_deals(&self, window: QueryWindow) -> StoreResult<Vec<Deal>> {
        let (limit, offset) = window_args(window);
        let rows = sqlx::query(
            "SELECT * FROM desk_deals ORDER BY created_at DESC, deal_id LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(deal_from_row).collect()
    }

    async fn set_deal_state(
        &self,
        deal_id: &str,
        expected: (DealStatus, ComplianceStatus),
        next: (DealStatus, ComplianceStatus),
        at: DateTime<Utc>,
    ) -> StoreResult<Deal> {
        let row = sqlx::query(
            r#"UPDATE desk_deals
               SET status = $1, compliance_status = $2, updated_at = $3
               WHERE deal_id = $4 AND status = $5 AND compliance_status = $6
               RETURNING *"#,
        )
        .bind(enum_str(&next.0)?)
        .bind(enum_str(&next.1)?)
        .bind(at)
        .bind(deal_id)
        .bind(enum_str(&expected.0)?)
        .bind(enum_str(&expected.1)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => deal_from_row(&row),
            None => {
                let current = self.get_deal(deal_id).await?;
                Err(StoreError::InvariantViolation(format!(
                    "deal {deal_id} is ({:?}, {:?}), expected ({:?}, {:?})",
                    current.status, current.compliance_status, expected.0, expected.1
                )))
            }
        }
    }
}

#[async_trait]
impl FlagStore for PostgresBackOfficeStore {
    async fn insert_flags(&self, flags: Vec<ComplianceFlag>) -> StoreResult<Vec<ComplianceFlag>> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for flag in &flags {
            sqlx::query(
                r#"INSERT INTO desk_flags
                   (flag_id, deal_id, rule_code, rationale, severity, blocks_execution,
                    resolved, resolved_by, resolved_at, resolution_notes, raised_at)
                   VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)"#,
            )
            .bind(&flag.flag_id)
            .bind(&flag.deal_id)
            .bind(&flag.rule_code)
            .bind(&flag.rationale)
            .bind(enum_str(&flag.severity)?)
            .bind(flag.blocks_execution)
            .bind(flag.resolved)
            .bind(&flag.resolved_by)
            .bind(flag.resolved_at)
            .bind(&flag.resolution_notes)
            .bind(flag.raised_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(flags)
    }

    async fn get_flag(&self, flag_id: &str) -> StoreResult<ComplianceFlag> {
        let row = sqlx::query("SELECT * FROM desk_flags WHERE flag_id = $1")
            .bind(flag_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("flag {flag_id}")))?;
        flag_from_row(&row)
    }

    async fn list_flags(&self, deal_id: &str) -> StoreResult<Vec<ComplianceFlag>> {
        let rows = sqlx::query(
            "SELECT * FROM desk_flags WHERE deal_id = $1 ORDER BY raised_at, flag_id",
        )
        .bind(deal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(flag_from_row).collect()
    }

    async fn resolve_and_reconcile(
        &self,
        flag_id: &str,
        resolved_by: &str,
        notes: &str,
        resolved_at: DateTime<Utc>,
    ) -> StoreResult<FlagResolution> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query("SELECT * FROM desk_flags WHERE flag_id = $1 FOR UPDATE")
            .bind(flag_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("flag {flag_id}")))?;
        let flag = flag_from_row(&row)?;
        if flag.resolved {
            return Err(StoreError::Conflict(format!(
                "flag {flag_id} is already resolved"
            )));
        }

        let row = sqlx::query(
            r#"UPDATE desk_flags
               SET resolved = TRUE, resolved_by = $1, resolved_at = $2, resolution_notes = $3
               WHERE flag_id = $4
               RETURNING *"#,
        )
        .bind(resolved_by)
        .bind(resolved_at)
        .bind(notes)
        .bind(flag_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        let flag = flag_from_row(&row)?;

        let row = sqlx::query("SELECT * FROM desk_deals WHERE deal_id = $1 FOR UPDATE")
            .bind(&flag.deal_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("deal {}", flag.deal_id)))?;
        let deal = deal_from_row(&row)?;

        let counts = sqlx::query(
            r#"SELECT COUNT(*) FILTER (WHERE blocks_execution) AS blocking, COUNT(*) AS total
               FROM desk_flags WHERE deal_id = $1 AND NOT resolved"#,
        )
        .bind(&flag.deal_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        let blocking: i64 = counts.try_get("blocking").map_err(backend)?;
        let total: i64 = counts.try_get("total").map_err(backend)?;

        let (status, compliance) =
            reconciler::reconcile_after_resolution(deal.status, blocking as usize, total as usize);
        let row = sqlx::query(
            r#"UPDATE desk_deals
               SET status = $1, compliance_status = $2, updated_at = $3
               WHERE deal_id = $4
               RETURNING *"#,
        )
        .bind(enum_str(&status)?)
        .bind(enum_str(&compliance)?)
        .bind(resolved_at)
        .bind(&flag.deal_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        let deal = deal_from_row(&row)?;

        tx.commit().await.map_err(backend)?;
        Ok(FlagResolution { flag, deal })
    }
}

#[async_trait]
impl RequirementStore for PostgresBackOfficeStore {
    async fn upsert_requirements(
        &self,
        deal_id: &str,
        requirements: Vec<FundingRequirement>,
    ) -> StoreResult<RequirementsUpsert> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut inserted = 0usize;
        for requirement in &requirements {
            if requirement.deal_id != deal_id {
                return Err(StoreError::InvalidInput(format!(
                    "requirement {} does not belong to deal {deal_id}",
                    requirement.requirement_id
                )));
            }
            let result = sqlx::query(
                r#"INSERT INTO desk_requirements
                   (requirement_id, deal_id, requirement_type, label, is_critical, status,
                    due_date, reviewer, created_at, updated_at)
                   VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
                   ON CONFLICT (deal_id, requirement_type, label) DO NOTHING"#,
            )
            .bind(&requirement.requirement_id)
            .bind(&requirement.deal_id)
            .bind(&requirement.requirement_type)
            .bind(&requirement.label)
            .bind(requirement.is_critical)
            .bind(enum_str(&requirement.status)?)
            .bind(requirement.due_date)
            .bind(&requirement.reviewer)
            .bind(requirement.created_at)
            .bind(requirement.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
            inserted += result.rows_affected() as usize;
        }
        let rows = sqlx::query(
            "SELECT * FROM desk_requirements WHERE deal_id = $1 ORDER BY created_at, requirement_id",
        )
        .bind(deal_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        let requirements = rows
            .iter()
            .map(requirement_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(RequirementsUpsert {
            inserted,
            requirements,
        })
    }

    async fn get_requirement(&self, requirement_id: &str) -> StoreResult<FundingRequirement> {
        let row = sqlx::query("SELECT * FROM desk_requirements WHERE requirement_id = $1")
            .bind(requirement_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("requirement {requirement_id}")))?;
        requirement_from_row(&row)
    }

    async fn list_requirements(&self, deal_id: &str) -> StoreResult<Vec<FundingRequirement>> {
        let rows = sqlx::query(
            "SELECT * FROM desk_requirements WHERE deal_id = $1 ORDER BY created_at, requirement_id",
        )
        .bind(deal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(requirement_from_row).collect()
    }

    async fn transition_requirement(
        &self,
        requirement_id: &str,
        expected: RequirementStatus,
        next: RequirementStatus,
        reviewer: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<FundingRequirement> {
        let row = sqlx::query(
            r#"UPDATE desk_requirements
               SET status = $1, reviewer = COALESCE($2, reviewer), updated_at = $3
               WHERE requirement_id = $4 AND status = $5
               RETURNING *"#,
        )
        .bind(enum_str(&next)?)
        .bind(reviewer)
        .bind(at)
        .bind(requirement_id)
        .bind(enum_str(&expected)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => requirement_from_row(&row),
            None => {
                let current = self.get_requirement(requirement_id).await?;
                Err(StoreError::InvariantViolation(format!(
                    "requirement {requirement_id} is {:?}, expected {:?}",
                    current.status, expected
                )))
            }
        }
    }
}

#[async_trait]
impl InstrumentStore for PostgresBackOfficeStore {
    async fn create_instrument(
        &self,
        instrument: FundingInstrument,
    ) -> StoreResult<FundingInstrument> {
        sqlx::query(
            r#"INSERT INTO desk_instruments
               (instrument_id, deal_id, instrument_type, issuing_bank, issuing_bank_bic,
                advising_bank, beneficiary, amount_minor, currency, issued_at, expires_at,
                stage, verification_status, human_approval_required, approved_by, approved_at,
                approval_notes, rejected_by, rejected_at, rejection_reason, last_verified_at,
                created_at, updated_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23)"#,
        )
        .bind(&instrument.instrument_id)
        .bind(&instrument.deal_id)
        .bind(&instrument.instrument_type)
        .bind(&instrument.issuing_bank)
        .bind(&instrument.issuing_bank_bic)
        .bind(&instrument.advising_bank)
        .bind(&instrument.beneficiary)
        .bind(instrument.amount_minor)
        .bind(&instrument.currency)
        .bind(instrument.issued_at)
        .bind(instrument.expires_at)
        .bind(enum_str(&instrument.stage)?)
        .bind(enum_str(&instrument.verification_status)?)
        .bind(instrument.human_approval_required)
        .bind(&instrument.approved_by)
        .bind(instrument.approved_at)
        .bind(&instrument.approval_notes)
        .bind(&instrument.rejected_by)
        .bind(instrument.rejected_at)
        .bind(&instrument.rejection_reason)
        .bind(instrument.last_verified_at)
        .bind(instrument.created_at)
        .bind(instrument.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(instrument)
    }

    async fn get_instrument(&self, instrument_id: &str) -> StoreResult<FundingInstrument> {
        let row = sqlx::query("SELECT * FROM desk_instruments WHERE instrument_id = $1")
            .bind(instrument_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("instrument {instrument_id}")))?;
        instrument_from_row(&row)
    }

    async fn list_instruments(&self, deal_id: &str) -> StoreResult<Vec<FundingInstrument>> {
        let rows = sqlx::query(
            "SELECT * FROM desk_instruments WHERE deal_id = $1 ORDER BY created_at, instrument_id",
        )
        .bind(deal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(instrument_from_row).collect()
    }

    async fn set_verification(
        &self,
        instrument_id: &str,
        expected_from: &[VerificationStatus],
        to: VerificationStatus,
        actor: Option<&str>,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<FundingInstrument> {
        let expected: Vec<String> = expected_from
            .iter()
            .map(enum_str)
            .collect::<StoreResult<_>>()?;
        let row = match to {
            VerificationStatus::HumanApproved => sqlx::query(
                r#"UPDATE desk_instruments
                   SET verification_status = $1, approved_by = $2, approved_at = $3,
                       approval_notes = $4, updated_at = $3
                   WHERE instrument_id = $5 AND verification_status = ANY($6)
                   RETURNING *"#,
            )
            .bind(enum_str(&to)?)
            .bind(actor)
            .bind(at)
            .bind(notes)
            .bind(instrument_id)
            .bind(&expected)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?,
            VerificationStatus::HumanRejected => sqlx::query(
                r#"UPDATE desk_instruments
                   SET verification_status = $1, rejected_by = $2, rejected_at = $3,
                       rejection_reason = $4, updated_at = $3
                   WHERE instrument_id = $5 AND verification_status = ANY($6)
                   RETURNING *"#,
            )
            .bind(enum_str(&to)?)
            .bind(actor)
            .bind(at)
            .bind(notes)
            .bind(instrument_id)
            .bind(&expected)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?,
            _ => sqlx::query(
                r#"UPDATE desk_instruments
                   SET verification_status = $1, last_verified_at = $2, updated_at = $2
                   WHERE instrument_id = $3 AND verification_status = ANY($4)
                   RETURNING *"#,
            )
            .bind(enum_str(&to)?)
            .bind(at)
            .bind(instrument_id)
            .bind(&expected)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?,
        };
        match row {
            Some(row) => instrument_from_row(&row),
            None => {
                let current = self.get_instrument(instrument_id).await?;
                Err(StoreError::InvariantViolation(format!(
                    "instrument {instrument_id} is {:?}, expected one of {:?}",
                    current.verification_status, expected_from
                )))
            }
        }
    }

    async fn set_stage(
        &self,
        instrument_id: &str,
        expected: InstrumentStage,
        next: InstrumentStage,
        at: DateTime<Utc>,
    ) -> StoreResult<FundingInstrument> {
        let row = sqlx::query(
            r#"UPDATE desk_instruments
               SET stage = $1, updated_at = $2
               WHERE instrument_id = $3 AND stage = $4
               RETURNING *"#,
        )
        .bind(enum_str(&next)?)
        .bind(at)
        .bind(instrument_id)
        .bind(enum_str(&expected)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => instrument_from_row(&row),
            None => {
                let current = self.get_instrument(instrument_id).await?;
                Err(StoreError::InvariantViolation(format!(
                    "instrument {instrument_id} is {:?}, expected {:?}",
                    current.stage, expected
                )))
            }
        }
    }
}

#[async_trait]
impl SettlementStore for PostgresBackOfficeStore {
    async fn create_settlement(
        &self,
        instruction: SettlementInstruction,
    ) -> StoreResult<SettlementInstruction> {
        sqlx::query(
            r#"INSERT INTO desk_settlements
               (settlement_id, deal_id, rail, payload, checklist, is_validated, revision,
                created_at, revalidated_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"#,
        )
        .bind(&instruction.settlement_id)
        .bind(&instruction.deal_id)
        .bind(enum_str(&instruction.rail)?)
        .bind(encode(&instruction.payload, "settlement payload")?)
        .bind(encode(&instruction.checklist, "settlement checklist")?)
        .bind(instruction.is_validated)
        .bind(instruction.revision as i32)
        .bind(instruction.created_at)
        .bind(instruction.revalidated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(instruction)
    }

    async fn get_settlement(&self, settlement_id: &str) -> StoreResult<SettlementInstruction> {
        let row = sqlx::query("SELECT * FROM desk_settlements WHERE settlement_id = $1")
            .bind(settlement_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("settlement {settlement_id}")))?;
        settlement_from_row(&row)
    }

    async fn list_settlements(&self, deal_id: &str) -> StoreResult<Vec<SettlementInstruction>> {
        let rows = sqlx::query(
            "SELECT * FROM desk_settlements WHERE deal_id = $1 ORDER BY created_at, settlement_id",
        )
        .bind(deal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(settlement_from_row).collect()
    }

    async fn replace_checklist(
        &self,
        settlement_id: &str,
        expected_revision: u32,
        checklist: Vec<ChecklistEntry>,
        is_validated: bool,
        revalidated_at: DateTime<Utc>,
    ) -> StoreResult<SettlementInstruction> {
        let row = sqlx::query(
            r#"UPDATE desk_settlements
               SET checklist = $1, is_validated = $2, revision = revision + 1, revalidated_at = $3
               WHERE settlement_id = $4 AND revision = $5
               RETURNING *"#,
        )
        .bind(encode(&checklist, "settlement checklist")?)
        .bind(is_validated)
        .bind(revalidated_at)
        .bind(settlement_id)
        .bind(expected_revision as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => settlement_from_row(&row),
            None => {
                let current = self.get_settlement(settlement_id).await?;
                Err(StoreError::InvariantViolation(format!(
                    "settlement {settlement_id} is at revision {}, expected {expected_revision}",
                    current.revision
                )))
            }
        }
    }

    async fn create_milestones(
        &self,
        milestones: Vec<EscrowMilestone>,
    ) -> StoreResult<Vec<EscrowMilestone>> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for milestone in &milestones {
            sqlx::query(
                r#"INSERT INTO desk_milestones
                   (milestone_id, settlement_id, deal_id, label, sequence, release_status,
                    created_at, updated_at)
                   VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"#,
            )
            .bind(&milestone.milestone_id)
            .bind(&milestone.settlement_id)
            .bind(&milestone.deal_id)
            .bind(&milestone.label)
            .bind(milestone.sequence as i32)
            .bind(enum_str(&milestone.release_status)?)
            .bind(milestone.created_at)
            .bind(milestone.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(milestones)
    }

    async fn get_milestone(&self, milestone_id: &str) -> StoreResult<EscrowMilestone> {
        let row = sqlx::query("SELECT * FROM desk_milestones WHERE milestone_id = $1")
            .bind(milestone_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("milestone {milestone_id}")))?;
        milestone_from_row(&row)
    }

    async fn list_milestones(&self, settlement_id: &str) -> StoreResult<Vec<EscrowMilestone>> {
        let rows = sqlx::query(
            "SELECT * FROM desk_milestones WHERE settlement_id = $1 ORDER BY sequence",
        )
        .bind(settlement_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(milestone_from_row).collect()
    }

    async fn transition_milestone(
        &self,
        milestone_id: &str,
        expected: ReleaseStatus,
        next: ReleaseStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<EscrowMilestone> {
        let row = sqlx::query(
            r#"UPDATE desk_milestones
               SET release_status = $1, updated_at = $2
               WHERE milestone_id = $3 AND release_status = $4
               RETURNING *"#,
        )
        .bind(enum_str(&next)?)
        .bind(at)
        .bind(milestone_id)
        .bind(enum_str(&expected)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => milestone_from_row(&row),
            None => {
                let current = self.get_milestone(milestone_id).await?;
                Err(StoreError::InvariantViolation(format!(
                    "milestone {milestone_id} is {:?}, expected {:?}",
                    current.release_status, expected
                )))
            }
        }
    }
}

#[async_trait]
impl ActionStore for PostgresBackOfficeStore {
    async fn append_action(&self, event: ActionAppend) -> StoreResult<ComplianceAction> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        // Serialize appends so the chain never forks under concurrency.
        sqlx::query("LOCK TABLE desk_actions IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let head = sqlx::query("SELECT sequence FROM desk_actions ORDER BY sequence DESC LIMIT 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        let sequence = match head {
            Some(row) => {
                let seq: i64 = row.try_get("sequence").map_err(backend)?;
                seq as u64 + 1
            }
            None => 1,
        };
        // Chain per deal: the previous hash is the same deal's most recent
        // action, so a per-deal listing verifies even when deals interleave.
        let previous_hash: Option<String> = sqlx::query(
            r#"SELECT hash FROM desk_actions WHERE deal_id IS NOT DISTINCT FROM $1
               ORDER BY sequence DESC LIMIT 1"#,
        )
        .bind(&event.deal_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?
        .map(|row| row.try_get("hash").map_err(backend))
        .transpose()?;
        let hash = compute_action_hash(&event, previous_hash.as_deref(), sequence)?;
        let action_id = format!("act-{}", uuid::Uuid::new_v4());

        sqlx::query(
            r#"INSERT INTO desk_actions
               (action_id, sequence, deal_id, actor, kind, detail, payload, occurred_at,
                previous_hash, hash)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)"#,
        )
        .bind(&action_id)
        .bind(sequence as i64)
        .bind(&event.deal_id)
        .bind(&event.actor)
        .bind(event.kind.as_str())
        .bind(&event.detail)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .bind(&previous_hash)
        .bind(&hash)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        Ok(ComplianceAction {
            action_id,
            sequence,
            deal_id: event.deal_id,
            actor: event.actor,
            kind: event.kind,
            detail: event.detail,
            payload: event.payload,
            occurred_at: event.occurred_at,
            previous_hash,
            hash,
        })
    }

    async fn list_actions(
        &self,
        deal_id: &str,
        window: QueryWindow,
    ) -> StoreResult<Vec<ComplianceAction>> {
        let (limit, offset) = window_args(window);
        let rows = sqlx::query(
            r#"SELECT * FROM desk_actions WHERE deal_id = $1
               ORDER BY sequence DESC LIMIT $2 OFFSET $3"#,
        )
        .bind(deal_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(action_from_row).collect()
    }

    async fn latest_action_hash(&self) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT hash FROM desk_actions ORDER BY sequence DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|r| r.try_get::<String, _>("hash").map_err(backend))
            .transpose()
    }
}

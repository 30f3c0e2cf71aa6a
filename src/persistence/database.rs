use crate::core::types::{
    Decision, DecisionOutcome, Position, Scenario, SentimentReading, Trade, UnitId,
};
use crate::evolution::performance::PerformanceRecord;
use crate::evolution::versions::PromptVersion;
use crate::feedback::threshold::ThresholdChange;
use crate::ledger::book::ScenarioBook;
use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        // Append-only logs use BIGSERIAL ids; head tables (positions,
        // ledger_state, performance_records) are keyed by their natural id
        // and upserted. Decimals are stored as text.

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sentiment_readings (
                id BIGSERIAL PRIMARY KEY,
                sector TEXT NOT NULL,
                raw DOUBLE PRECISION NOT NULL,
                score DOUBLE PRECISION NOT NULL,
                prompt_version INT NOT NULL,
                ts_ms BIGINT NOT NULL,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id BIGSERIAL PRIMARY KEY,
                scenario TEXT NOT NULL,
                ticker TEXT NOT NULL,
                sector TEXT NOT NULL,
                delta_value TEXT NOT NULL,
                reading_ts_ms BIGINT NOT NULL,
                ts_ms BIGINT NOT NULL,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                scenario TEXT NOT NULL,
                ticker TEXT NOT NULL,
                sector TEXT NOT NULL,
                value TEXT NOT NULL,
                cost_basis TEXT NOT NULL,
                last_trade_ts BIGINT NOT NULL,
                PRIMARY KEY (scenario, ticker)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_state (
                scenario TEXT PRIMARY KEY,
                cash TEXT NOT NULL,
                last_mark_ts BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                unit TEXT NOT NULL,
                version INT NOT NULL,
                predicted DOUBLE PRECISION NOT NULL,
                basket JSONB NOT NULL,
                ts_ms BIGINT NOT NULL,
                due_ts_ms BIGINT NOT NULL,
                evaluated BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outcomes (
                id BIGSERIAL PRIMARY KEY,
                decision_id TEXT NOT NULL,
                unit TEXT NOT NULL,
                version INT NOT NULL,
                predicted DOUBLE PRECISION NOT NULL,
                realized DOUBLE PRECISION NOT NULL,
                correct BOOLEAN NOT NULL,
                ts_ms BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prompt_versions (
                unit TEXT NOT NULL,
                version INT NOT NULL,
                payload TEXT NOT NULL,
                created_from INT,
                reason TEXT NOT NULL,
                correct_at INT NOT NULL,
                total_at INT NOT NULL,
                ts_ms BIGINT NOT NULL,
                PRIMARY KEY (unit, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS performance_records (
                unit TEXT NOT NULL,
                version INT NOT NULL,
                correct INT NOT NULL,
                total INT NOT NULL,
                frozen BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (unit, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threshold_changes (
                version INT PRIMARY KEY,
                created_from INT NOT NULL,
                previous DOUBLE PRECISION NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                win_rate DOUBLE PRECISION NOT NULL,
                evaluations INT NOT NULL,
                ts_ms BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database tables initialized");
        Ok(())
    }

    // --- Scoring ---

    pub async fn save_reading(&self, reading: &SentimentReading) -> Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO sentiment_readings (sector, raw, score, prompt_version, ts_ms)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&reading.sector)
        .bind(reading.raw)
        .bind(reading.score)
        .bind(reading.prompt_version as i32)
        .bind(reading.ts_ms)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => {
                metrics::counter!("database_queries_total", "table" => "sentiment_readings", "status" => "success").increment(1);
            }
            Err(_) => {
                metrics::counter!("database_queries_total", "table" => "sentiment_readings", "status" => "error").increment(1);
            }
        }
        res?;
        Ok(())
    }

    // --- Ledger ---

    pub async fn save_trades(&self, trades: &[Trade]) -> Result<()> {
        let start = std::time::Instant::now();
        for trade in trades {
            let res = sqlx::query(
                r#"
                INSERT INTO trades (scenario, ticker, sector, delta_value, reading_ts_ms, ts_ms)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(trade.scenario.as_str())
            .bind(&trade.ticker)
            .bind(&trade.sector)
            .bind(trade.delta_value.to_string())
            .bind(trade.reading_ts_ms)
            .bind(trade.ts_ms)
            .execute(&self.pool)
            .await;

            match res {
                Ok(_) => {
                    metrics::counter!("database_queries_total", "table" => "trades", "status" => "success").increment(1);
                }
                Err(_) => {
                    metrics::counter!("database_queries_total", "table" => "trades", "status" => "error").increment(1);
                }
            }
            res?;
        }
        metrics::histogram!("database_query_duration_seconds", "table" => "trades")
            .record(start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Persist a book head: cash plus the full position set. Positions the
    /// book no longer holds are removed.
    pub async fn save_ledger_state(&self, book: &ScenarioBook) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_state (scenario, cash, last_mark_ts)
            VALUES ($1, $2, $3)
            ON CONFLICT (scenario) DO UPDATE SET
                cash = EXCLUDED.cash,
                last_mark_ts = EXCLUDED.last_mark_ts,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(book.scenario.as_str())
        .bind(book.cash.to_string())
        .bind(book.last_mark_ts)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM positions WHERE scenario = $1")
            .bind(book.scenario.as_str())
            .execute(&self.pool)
            .await?;

        for position in book.positions.values() {
            sqlx::query(
                r#"
                INSERT INTO positions (scenario, ticker, sector, value, cost_basis, last_trade_ts)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(position.scenario.as_str())
            .bind(&position.ticker)
            .bind(&position.sector)
            .bind(position.value.to_string())
            .bind(position.cost_basis.to_string())
            .bind(position.last_trade_ts)
            .execute(&self.pool)
            .await?;
        }

        metrics::counter!("database_queries_total", "table" => "positions", "status" => "success").increment(1);
        Ok(())
    }

    pub async fn load_ledger_state(&self, scenario: Scenario) -> Result<Option<(Decimal, i64)>> {
        let row = sqlx::query("SELECT cash, last_mark_ts FROM ledger_state WHERE scenario = $1")
            .bind(scenario.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| {
            let cash_str: String = r.get("cash");
            let cash = Decimal::from_str_exact(&cash_str).unwrap_or(Decimal::ZERO);
            let last_mark_ts: i64 = r.get("last_mark_ts");
            (cash, last_mark_ts)
        }))
    }

    pub async fn load_positions(&self, scenario: Scenario) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT scenario, ticker, sector, value, cost_basis, last_trade_ts
            FROM positions
            WHERE scenario = $1
            "#,
        )
        .bind(scenario.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::new();
        for row in rows {
            let scenario_str: String = row.get("scenario");
            let scenario: Scenario = match scenario_str.parse() {
                Ok(sc) => sc,
                Err(e) => {
                    warn!("Skipping position row: {}", e);
                    continue;
                }
            };
            let value_str: String = row.get("value");
            let cost_str: String = row.get("cost_basis");
            positions.push(Position {
                scenario,
                ticker: row.get("ticker"),
                sector: row.get("sector"),
                value: Decimal::from_str_exact(&value_str).unwrap_or(Decimal::ZERO),
                cost_basis: Decimal::from_str_exact(&cost_str).unwrap_or(Decimal::ZERO),
                last_trade_ts: row.get("last_trade_ts"),
            });
        }
        Ok(positions)
    }

    // --- Decisions & outcomes ---

    pub async fn save_decision(&self, decision: &Decision) -> Result<()> {
        let basket = serde_json::to_value(&decision.basket).unwrap_or(serde_json::Value::Null);
        let res = sqlx::query(
            r#"
            INSERT INTO decisions (id, unit, version, predicted, basket, ts_ms, due_ts_ms, evaluated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&decision.id)
        .bind(decision.unit.to_string())
        .bind(decision.version as i32)
        .bind(decision.predicted)
        .bind(basket)
        .bind(decision.ts_ms)
        .bind(decision.due_ts_ms)
        .bind(decision.evaluated)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => {
                metrics::counter!("database_queries_total", "table" => "decisions", "status" => "success").increment(1);
            }
            Err(_) => {
                metrics::counter!("database_queries_total", "table" => "decisions", "status" => "error").increment(1);
            }
        }
        res?;
        Ok(())
    }

    /// Check-and-set close. Returns false when the decision was already
    /// evaluated, so a replayed scan cannot double-close.
    pub async fn mark_decision_evaluated(&self, decision_id: &str) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE decisions SET evaluated = TRUE WHERE id = $1 AND evaluated = FALSE",
        )
        .bind(decision_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn load_open_decisions(&self) -> Result<Vec<Decision>> {
        let rows = sqlx::query(
            r#"
            SELECT id, unit, version, predicted, basket, ts_ms, due_ts_ms, evaluated
            FROM decisions
            WHERE evaluated = FALSE
            ORDER BY due_ts_ms
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut decisions = Vec::new();
        for row in rows {
            let unit_str: String = row.get("unit");
            let Some(unit) = UnitId::parse(&unit_str) else {
                warn!("Skipping decision with unparsable unit: {}", unit_str);
                continue;
            };
            let basket_json: serde_json::Value = row.get("basket");
            let basket = serde_json::from_value(basket_json).unwrap_or_default();
            let version: i32 = row.get("version");
            decisions.push(Decision {
                id: row.get("id"),
                unit,
                version: version as u32,
                predicted: row.get("predicted"),
                basket,
                ts_ms: row.get("ts_ms"),
                due_ts_ms: row.get("due_ts_ms"),
                evaluated: row.get("evaluated"),
            });
        }
        Ok(decisions)
    }

    pub async fn save_outcome(&self, outcome: &DecisionOutcome) -> Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO outcomes (decision_id, unit, version, predicted, realized, correct, ts_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&outcome.decision_id)
        .bind(outcome.unit.to_string())
        .bind(outcome.version as i32)
        .bind(outcome.predicted)
        .bind(outcome.realized_pct)
        .bind(outcome.correct)
        .bind(outcome.ts_ms)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => {
                metrics::counter!("database_queries_total", "table" => "outcomes", "status" => "success").increment(1);
            }
            Err(_) => {
                metrics::counter!("database_queries_total", "table" => "outcomes", "status" => "error").increment(1);
            }
        }
        res?;
        Ok(())
    }

    // --- Evolution ---

    pub async fn save_prompt_version(&self, version: &PromptVersion) -> Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO prompt_versions (unit, version, payload, created_from, reason, correct_at, total_at, ts_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (unit, version) DO NOTHING
            "#,
        )
        .bind(version.unit.to_string())
        .bind(version.version as i32)
        .bind(&version.payload)
        .bind(version.created_from.map(|v| v as i32))
        .bind(&version.reason)
        .bind(version.correct_at_creation as i32)
        .bind(version.total_at_creation as i32)
        .bind(version.created_ts_ms)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => {
                metrics::counter!("database_queries_total", "table" => "prompt_versions", "status" => "success").increment(1);
            }
            Err(_) => {
                metrics::counter!("database_queries_total", "table" => "prompt_versions", "status" => "error").increment(1);
            }
        }
        res?;
        Ok(())
    }

    pub async fn load_prompt_versions(&self) -> Result<Vec<PromptVersion>> {
        let rows = sqlx::query(
            r#"
            SELECT unit, version, payload, created_from, reason, correct_at, total_at, ts_ms
            FROM prompt_versions
            ORDER BY unit, version
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut versions = Vec::new();
        for row in rows {
            let unit_str: String = row.get("unit");
            let Some(unit) = UnitId::parse(&unit_str) else {
                warn!("Skipping prompt version with unparsable unit: {}", unit_str);
                continue;
            };
            let version: i32 = row.get("version");
            let created_from: Option<i32> = row.get("created_from");
            let correct_at: i32 = row.get("correct_at");
            let total_at: i32 = row.get("total_at");
            versions.push(PromptVersion {
                unit,
                version: version as u32,
                payload: row.get("payload"),
                created_from: created_from.map(|v| v as u32),
                reason: row.get("reason"),
                correct_at_creation: correct_at as u32,
                total_at_creation: total_at as u32,
                created_ts_ms: row.get("ts_ms"),
            });
        }
        Ok(versions)
    }

    pub async fn upsert_performance(&self, record: &PerformanceRecord) -> Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO performance_records (unit, version, correct, total, frozen)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (unit, version) DO UPDATE SET
                correct = EXCLUDED.correct,
                total = EXCLUDED.total,
                frozen = EXCLUDED.frozen
            "#,
        )
        .bind(record.unit.to_string())
        .bind(record.version as i32)
        .bind(record.correct as i32)
        .bind(record.total as i32)
        .bind(record.frozen)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => {
                metrics::counter!("database_queries_total", "table" => "performance_records", "status" => "success").increment(1);
            }
            Err(_) => {
                metrics::counter!("database_queries_total", "table" => "performance_records", "status" => "error").increment(1);
            }
        }
        res?;
        Ok(())
    }

    pub async fn load_performance_records(&self) -> Result<Vec<PerformanceRecord>> {
        let rows =
            sqlx::query("SELECT unit, version, correct, total, frozen FROM performance_records")
                .fetch_all(&self.pool)
                .await?;

        let mut records = Vec::new();
        for row in rows {
            let unit_str: String = row.get("unit");
            let Some(unit) = UnitId::parse(&unit_str) else {
                warn!("Skipping performance record with unparsable unit: {}", unit_str);
                continue;
            };
            let version: i32 = row.get("version");
            let correct: i32 = row.get("correct");
            let total: i32 = row.get("total");
            records.push(PerformanceRecord {
                unit,
                version: version as u32,
                correct: correct as u32,
                total: total as u32,
                frozen: row.get("frozen"),
            });
        }
        Ok(records)
    }

    // --- Feedback ---

    pub async fn save_threshold_change(&self, change: &ThresholdChange) -> Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO threshold_changes (version, created_from, previous, value, win_rate, evaluations, ts_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (version) DO NOTHING
            "#,
        )
        .bind(change.version as i32)
        .bind(change.created_from as i32)
        .bind(change.previous)
        .bind(change.value)
        .bind(change.win_rate)
        .bind(change.evaluations as i32)
        .bind(change.ts_ms)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => {
                metrics::counter!("database_queries_total", "table" => "threshold_changes", "status" => "success").increment(1);
            }
            Err(_) => {
                metrics::counter!("database_queries_total", "table" => "threshold_changes", "status" => "error").increment(1);
            }
        }
        res?;
        Ok(())
    }

    pub async fn load_latest_threshold(&self) -> Result<Option<(f64, u32)>> {
        let row = sqlx::query(
            "SELECT value, version FROM threshold_changes ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let value: f64 = r.get("value");
            let version: i32 = r.get("version");
            (value, version as u32)
        }))
    }
}

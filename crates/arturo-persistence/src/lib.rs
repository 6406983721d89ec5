//! arturo-persistence: a narrow journaling interface. Treated as an opaque
//! sink by every other crate — no query builder, no ORM leakage, only the
//! operations the coordination layer actually needs.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Error,
    Terminated,
    Aborted,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Error => "error",
            RunStatus::Terminated => "terminated",
            RunStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestRun {
    pub id: String,
    pub script_path: String,
    pub script_hash: Option<String>,
    pub rma_id: Option<String>,
    pub station_instance: Option<String>,
    pub status: String,
    pub summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TestEvent {
    pub event_type: String,
    pub employee_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandResultRow {
    pub device_id: String,
    pub command_name: String,
    pub success: bool,
    pub response: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone)]
pub struct TemperatureSample {
    pub station_instance: String,
    pub device_id: String,
    pub stage: i16,
    pub temperature_k: f64,
}

/// The journal's narrow contract. Every method returns [`sqlx::Error`]
/// directly rather than a wrapper type, matching how the donor's repo
/// layer surfaces database errors to its callers.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn create_test_run(
        &self,
        id: &str,
        script_path: &str,
        rma_id: Option<&str>,
        station_instance: Option<&str>,
        script_hash: Option<&str>,
        source: Option<&str>,
    ) -> Result<(), sqlx::Error>;

    async fn finish_test_run(&self, id: &str, status: RunStatus, summary: &str) -> Result<(), sqlx::Error>;

    async fn delete_test_run(&self, id: &str) -> Result<(), sqlx::Error>;

    async fn record_command_result(
        &self,
        run_id: &str,
        device_id: &str,
        command_name: &str,
        success: bool,
        response: Option<&str>,
        duration_ms: i64,
    ) -> Result<(), sqlx::Error>;

    async fn record_temperature(
        &self,
        run_id: Option<&str>,
        station_instance: &str,
        device_id: &str,
        stage: i16,
        temperature_k: f64,
    ) -> Result<(), sqlx::Error>;

    async fn record_test_event(
        &self,
        run_id: &str,
        event_type: &str,
        employee_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), sqlx::Error>;

    async fn set_station_state(
        &self,
        instance: &str,
        state: &str,
        current_run_id: Option<&str>,
    ) -> Result<(), sqlx::Error>;

    async fn get_test_run(&self, id: &str) -> Result<Option<TestRun>, sqlx::Error>;
    async fn list_events_for_run(&self, run_id: &str) -> Result<Vec<TestEvent>, sqlx::Error>;
    async fn list_command_results_for_run(&self, run_id: &str) -> Result<Vec<CommandResultRow>, sqlx::Error>;
    async fn list_runs_for_rma(&self, rma_id: &str) -> Result<Vec<TestRun>, sqlx::Error>;
    async fn list_temperatures_since(
        &self,
        station_instance: &str,
        since_secs: i64,
    ) -> Result<Vec<TemperatureSample>, sqlx::Error>;
}

pub async fn create_pool(database_url: &str) -> PgPool {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .expect("failed to connect to Postgres")
}

pub async fn run_migrations(pool: &PgPool) {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .expect("failed to run database migrations")
}

pub struct PostgresJournal {
    pool: PgPool,
}

impl PostgresJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Journal for PostgresJournal {
    async fn create_test_run(
        &self,
        id: &str,
        script_path: &str,
        rma_id: Option<&str>,
        station_instance: Option<&str>,
        script_hash: Option<&str>,
        source: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO test_runs (id, script_path, script_hash, rma_id, station_instance, source) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(script_path)
        .bind(script_hash)
        .bind(rma_id)
        .bind(station_instance)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_test_run(&self, id: &str, status: RunStatus, summary: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE test_runs SET status = $2, summary = $3, finished_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_test_run(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM test_runs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_command_result(
        &self,
        run_id: &str,
        device_id: &str,
        command_name: &str,
        success: bool,
        response: Option<&str>,
        duration_ms: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO command_results (run_id, device_id, command_name, success, response, duration_ms) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(run_id)
        .bind(device_id)
        .bind(command_name)
        .bind(success)
        .bind(response)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_temperature(
        &self,
        run_id: Option<&str>,
        station_instance: &str,
        device_id: &str,
        stage: i16,
        temperature_k: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO temperature_samples (run_id, station_instance, device_id, stage, temperature_k) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run_id)
        .bind(station_instance)
        .bind(device_id)
        .bind(stage)
        .bind(temperature_k)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_test_event(
        &self,
        run_id: &str,
        event_type: &str,
        employee_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO test_events (run_id, event_type, employee_id, reason) VALUES ($1, $2, $3, $4)",
        )
        .bind(run_id)
        .bind(event_type)
        .bind(employee_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_station_state(
        &self,
        instance: &str,
        state: &str,
        current_run_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO station_state (instance, state, current_run_id, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (instance) DO UPDATE SET state = $2, current_run_id = $3, updated_at = now()",
        )
        .bind(instance)
        .bind(state)
        .bind(current_run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_test_run(&self, id: &str) -> Result<Option<TestRun>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, script_path, script_hash, rma_id, station_instance, status, summary \
             FROM test_runs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_test_run(&r)))
    }

    async fn list_events_for_run(&self, run_id: &str) -> Result<Vec<TestEvent>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT event_type, employee_id, reason FROM test_events WHERE run_id = $1 ORDER BY occurred_at",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TestEvent {
                event_type: r.get("event_type"),
                employee_id: r.get("employee_id"),
                reason: r.get("reason"),
            })
            .collect())
    }

    async fn list_command_results_for_run(&self, run_id: &str) -> Result<Vec<CommandResultRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT device_id, command_name, success, response, duration_ms \
             FROM command_results WHERE run_id = $1 ORDER BY recorded_at",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| CommandResultRow {
                device_id: r.get("device_id"),
                command_name: r.get("command_name"),
                success: r.get("success"),
                response: r.get("response"),
                duration_ms: r.get("duration_ms"),
            })
            .collect())
    }

    async fn list_runs_for_rma(&self, rma_id: &str) -> Result<Vec<TestRun>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, script_path, script_hash, rma_id, station_instance, status, summary \
             FROM test_runs WHERE rma_id = $1 ORDER BY created_at",
        )
        .bind(rma_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_test_run).collect())
    }

    async fn list_temperatures_since(
        &self,
        station_instance: &str,
        since_secs: i64,
    ) -> Result<Vec<TemperatureSample>, sqlx::Error> {
        let since = chrono::DateTime::from_timestamp(since_secs, 0).unwrap_or_default();
        let rows = sqlx::query(
            "SELECT station_instance, device_id, stage, temperature_k \
             FROM temperature_samples WHERE station_instance = $1 AND recorded_at >= $2 \
             ORDER BY recorded_at",
        )
        .bind(station_instance)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TemperatureSample {
                station_instance: r.get("station_instance"),
                device_id: r.get("device_id"),
                stage: r.get("stage"),
                temperature_k: r.get("temperature_k"),
            })
            .collect())
    }
}

fn row_to_test_run(row: &sqlx::postgres::PgRow) -> TestRun {
    TestRun {
        id: row.get("id"),
        script_path: row.get("script_path"),
        script_hash: row.get("script_hash"),
        rma_id: row.get("rma_id"),
        station_instance: row.get("station_instance"),
        status: row.get("status"),
        summary: row.get("summary"),
    }
}

//! SQLite-backed repository

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::{
    ArtifactRef, JobId, JobStatus, JobStore, ModelRecord, ModelStore, NewJob, NewModel,
    PredictionJob, StorageError,
};

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS models (\
        id INTEGER PRIMARY KEY AUTOINCREMENT, \
        title TEXT NOT NULL, \
        description TEXT, \
        instructions TEXT, \
        image TEXT, \
        author TEXT, \
        date TEXT, \
        category TEXT, \
        model_file TEXT, \
        created_at TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS prediction_jobs (\
        id INTEGER PRIMARY KEY AUTOINCREMENT, \
        model_id INTEGER NOT NULL, \
        model_key TEXT NOT NULL, \
        input_name TEXT NOT NULL, \
        input_image TEXT NOT NULL, \
        output_image TEXT, \
        status TEXT NOT NULL, \
        error TEXT, \
        created_at TEXT NOT NULL, \
        updated_at TEXT NOT NULL)",
];

const JOB_COLUMNS: &str = "\
    id, model_id, model_key, input_name, input_image, output_image, \
    status, error, created_at, updated_at";

const MODEL_COLUMNS: &str = "\
    id, title, description, instructions, image, author, date, category, \
    model_file, created_at";

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::DatabaseError(e.to_string())
}

/// Job and model records in a SQLite database
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open (creating if missing) the database at `url` and apply the schema
    ///
    /// `sqlite::memory:` gives a private database held by a single
    /// long-lived connection.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_err)?
            .create_if_missing(true);

        let in_memory = url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await.map_err(db_err)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(db_err)?;
        }

        info!("Opened SQLite repository at {}", url);
        Ok(Self { pool })
    }

    fn job_from_row(row: &SqliteRow) -> Result<PredictionJob, StorageError> {
        let status: String = row.try_get("status").map_err(db_err)?;
        Ok(PredictionJob {
            id: row.try_get("id").map_err(db_err)?,
            model_id: row.try_get("model_id").map_err(db_err)?,
            model_key: row.try_get("model_key").map_err(db_err)?,
            input_name: row.try_get("input_name").map_err(db_err)?,
            input_image: row.try_get("input_image").map_err(db_err)?,
            output_image: row.try_get("output_image").map_err(db_err)?,
            status: status.parse()?,
            error: row.try_get("error").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }

    fn model_from_row(row: &SqliteRow) -> Result<ModelRecord, StorageError> {
        Ok(ModelRecord {
            id: row.try_get("id").map_err(db_err)?,
            title: row.try_get("title").map_err(db_err)?,
            description: row.try_get("description").map_err(db_err)?,
            instructions: row.try_get("instructions").map_err(db_err)?,
            image: row.try_get("image").map_err(db_err)?,
            author: row.try_get("author").map_err(db_err)?,
            date: row.try_get("date").map_err(db_err)?,
            category: row.try_get("category").map_err(db_err)?,
            model_file: row.try_get("model_file").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
        })
    }

    /// Conditional terminal write: only a pending row is updated
    async fn finish_job(
        &self,
        id: JobId,
        status: JobStatus,
        output_image: Option<&str>,
        error: Option<&str>,
    ) -> Result<PredictionJob, StorageError> {
        let query = format!(
            "UPDATE prediction_jobs \
             SET status = ?, output_image = ?, error = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending' \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(status.as_str())
            .bind(output_image)
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => {
                debug!("Job {} -> {}", id, status);
                Self::job_from_row(&row)
            }
            None => {
                let current = self.get_job(id).await?;
                Err(StorageError::InvalidTransition {
                    id,
                    status: current.status,
                })
            }
        }
    }
}

#[async_trait]
impl JobStore for SqliteRepository {
    async fn create_job(&self, job: NewJob) -> Result<PredictionJob, StorageError> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO prediction_jobs \
             (model_id, model_key, input_name, input_image, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(job.model_id)
            .bind(&job.model_key)
            .bind(&job.input.name)
            .bind(&job.input.url)
            .bind(JobStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let record = Self::job_from_row(&row)?;
        debug!("Inserted job with ID {}", record.id);
        Ok(record)
    }

    async fn get_job(&self, id: JobId) -> Result<PredictionJob, StorageError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM prediction_jobs WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("job {}", id)))?;
        Self::job_from_row(&row)
    }

    async fn complete_job(
        &self,
        id: JobId,
        output: &ArtifactRef,
    ) -> Result<PredictionJob, StorageError> {
        self.finish_job(id, JobStatus::Done, Some(&output.url), None)
            .await
    }

    async fn fail_job(&self, id: JobId, message: &str) -> Result<PredictionJob, StorageError> {
        self.finish_job(id, JobStatus::Error, None, Some(message))
            .await
    }

    async fn job_count(&self) -> Result<usize, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prediction_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as usize)
    }

    async fn pending_jobs(&self) -> Result<Vec<JobId>, StorageError> {
        sqlx::query_scalar("SELECT id FROM prediction_jobs WHERE status = 'pending' ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl ModelStore for SqliteRepository {
    async fn create_model(&self, model: NewModel) -> Result<ModelRecord, StorageError> {
        let query = format!(
            "INSERT INTO models \
             (title, description, instructions, image, author, date, category, model_file, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {MODEL_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&model.title)
            .bind(&model.description)
            .bind(&model.instructions)
            .bind(&model.image)
            .bind(&model.author)
            .bind(&model.date)
            .bind(&model.category)
            .bind(&model.model_file)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let record = Self::model_from_row(&row)?;
        debug!("Inserted model with ID {}", record.id);
        Ok(record)
    }

    async fn get_model(&self, id: i64) -> Result<ModelRecord, StorageError> {
        let query = format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("model {}", id)))?;
        Self::model_from_row(&row)
    }

    async fn list_models(&self, limit: usize) -> Result<Vec<ModelRecord>, StorageError> {
        let query = format!("SELECT {MODEL_COLUMNS} FROM models ORDER BY id DESC LIMIT ?");
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::model_from_row).collect()
    }

    async fn model_count(&self) -> Result<usize, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM models")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

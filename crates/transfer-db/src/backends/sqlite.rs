//! SQLite backend implementation
//!
//! Persistent work queue using SQLite with WAL mode. Multi-row mutations
//! (file linkage and the Waiting to Executing transition) run in a single
//! transaction.

use crate::{
    Channel, ChannelBatch, ChannelId, FileId, FileJobLink, FileLinkAttribute, FileStatus,
    InconsistentJob, JobAttribute, JobId, JobStatus, LoggingEvent, QueuedFile, Result, StoreError,
    TransferJob, WorkQueueStore,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row};
use std::str::FromStr;
use tracing::debug;

/// SQLite-backed work queue
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a SQLite database at the specified path
    ///
    /// Automatically runs migrations to set up the schema.
    pub async fn open(path: &str) -> Result<Self> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        if !sqlx::Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            sqlx::Sqlite::create_database(&db_url).await?;
        }

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        debug!(path = %db_url, "Opened transfer database");
        Ok(Self { pool })
    }

    /// Get the underlying pool (for advanced usage)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a channel, returning the existing id if the pair is known
    pub async fn add_channel(
        &self,
        source: &str,
        destination: &str,
        space_token: Option<&str>,
    ) -> Result<ChannelId> {
        let row = sqlx::query(
            "INSERT INTO channels (source, destination, space_token) VALUES (?, ?, ?)
             ON CONFLICT (source, destination) DO UPDATE SET space_token = excluded.space_token
             RETURNING id",
        )
        .bind(source)
        .bind(destination)
        .bind(space_token)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Queue a file on a channel in the Waiting state
    pub async fn enqueue_file(
        &self,
        channel_id: ChannelId,
        lfn: &str,
        source_surl: &str,
        target_surl: &str,
        size: u64,
    ) -> Result<FileId> {
        let result = sqlx::query(
            "INSERT INTO channel_files (channel_id, lfn, source_surl, target_surl, size, status, queued_at)
             VALUES (?, ?, ?, ?, ?, 'Waiting', ?)",
        )
        .bind(channel_id)
        .bind(lfn)
        .bind(source_surl)
        .bind(target_surl)
        .bind(size as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Finish a job so it stops counting against its channel's cap
    pub async fn complete_job(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE transfer_jobs SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "job", id: job_id });
        }

        sqlx::query("INSERT INTO job_events (job_id, event, at) VALUES (?, ?, ?)")
            .bind(job_id)
            .bind(status.to_string())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn job(&self, job_id: JobId) -> Result<Option<TransferJob>> {
        let row = sqlx::query(
            "SELECT id, guid, server, channel_id, status, number_of_files, total_size, submitted_at
             FROM transfer_jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    pub async fn jobs_for_channel(&self, channel_id: ChannelId) -> Result<Vec<TransferJob>> {
        let rows = sqlx::query(
            "SELECT id, guid, server, channel_id, status, number_of_files, total_size, submitted_at
             FROM transfer_jobs WHERE channel_id = ? ORDER BY id ASC",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    pub async fn links_for_job(&self, job_id: JobId) -> Result<Vec<FileJobLink>> {
        let rows = sqlx::query(
            "SELECT file_id, job_id, channel_id, file_size FROM file_job_links
             WHERE job_id = ? ORDER BY file_id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(FileJobLink {
                    file_id: row.try_get("file_id")?,
                    job_id: row.try_get("job_id")?,
                    channel_id: row.try_get("channel_id")?,
                    file_size: row
                        .try_get::<Option<i64>, _>("file_size")?
                        .map(|s| s as u64),
                })
            })
            .collect()
    }

    pub async fn events_for_job(&self, job_id: JobId) -> Result<Vec<LoggingEvent>> {
        let rows = sqlx::query("SELECT job_id, event, at FROM job_events WHERE job_id = ? ORDER BY id ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let event: String = row.try_get("event")?;
                Ok(LoggingEvent {
                    job_id: row.try_get("job_id")?,
                    event: JobStatus::from_str(&event)?,
                    at: row.try_get("at")?,
                })
            })
            .collect()
    }

    pub async fn file_status(&self, file_id: FileId) -> Result<Option<FileStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM channel_files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;

        status.map(|s| FileStatus::from_str(&s)).transpose()
    }

    /// Number of files still waiting on a channel
    pub async fn queued_count(&self, channel_id: ChannelId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_files WHERE channel_id = ? AND status = 'Waiting'",
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    /// Jobs whose `number_of_files` is unset or differs from their links
    ///
    /// These are left behind when a cycle fails between job creation and
    /// file linkage, or when a best-effort attribute update is lost.
    pub async fn find_inconsistent_jobs(&self) -> Result<Vec<InconsistentJob>> {
        let rows = sqlx::query(
            "SELECT j.id, j.guid, j.channel_id, j.number_of_files, COUNT(l.file_id) AS linked
             FROM transfer_jobs j
             LEFT JOIN file_job_links l ON l.job_id = j.id
             GROUP BY j.id
             HAVING j.number_of_files IS NULL OR j.number_of_files != COUNT(l.file_id)
             ORDER BY j.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(InconsistentJob {
                    job_id: row.try_get("id")?,
                    guid: row.try_get("guid")?,
                    channel_id: row.try_get("channel_id")?,
                    recorded_files: row
                        .try_get::<Option<i64>, _>("number_of_files")?
                        .map(|n| n as u64),
                    linked_files: row.try_get::<i64, _>("linked")? as u64,
                })
            })
            .collect()
    }
}

fn row_to_job(row: &SqliteRow) -> Result<TransferJob> {
    let status: String = row.try_get("status")?;

    Ok(TransferJob {
        id: row.try_get("id")?,
        guid: row.try_get("guid")?,
        server: row.try_get("server")?,
        channel_id: row.try_get("channel_id")?,
        status: JobStatus::from_str(&status)?,
        number_of_files: row
            .try_get::<Option<i64>, _>("number_of_files")?
            .map(|n| n as u64),
        total_size: row.try_get::<Option<i64>, _>("total_size")?.map(|n| n as u64),
        submitted_at: row.try_get("submitted_at")?,
    })
}

fn row_to_file(row: &SqliteRow) -> Result<QueuedFile> {
    Ok(QueuedFile {
        id: row.try_get("id")?,
        lfn: row.try_get("lfn")?,
        source_surl: row.try_get("source_surl")?,
        target_surl: row.try_get("target_surl")?,
        size: row.try_get::<i64, _>("size")? as u64,
    })
}

#[async_trait]
impl WorkQueueStore for SqliteStore {
    async fn select_eligible_channel(&self, max_active_jobs: u32) -> Result<Option<Channel>> {
        // Both counts are read from one snapshot
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT c.id, c.source, c.destination, c.space_token,
                    (SELECT COUNT(*) FROM transfer_jobs j
                     WHERE j.channel_id = c.id AND j.status = 'Submitted') AS active
             FROM channels c
             WHERE c.status = 'Active'
               AND EXISTS (SELECT 1 FROM channel_files f
                           WHERE f.channel_id = c.id AND f.status = 'Waiting')
               AND (SELECT COUNT(*) FROM transfer_jobs j
                    WHERE j.channel_id = c.id AND j.status = 'Submitted') < ?
             ORDER BY active ASC, c.id ASC
             LIMIT 1",
        )
        .bind(max_active_jobs as i64)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        match row {
            Some(r) => Ok(Some(Channel {
                id: r.try_get("id")?,
                source: r.try_get("source")?,
                destination: r.try_get("destination")?,
                space_token: r.try_get("space_token")?,
            })),
            None => Ok(None),
        }
    }

    async fn take_queued_files(
        &self,
        channel_id: ChannelId,
        max_count: usize,
    ) -> Result<ChannelBatch> {
        let space_token: Option<Option<String>> =
            sqlx::query_scalar("SELECT space_token FROM channels WHERE id = ?")
                .bind(channel_id)
                .fetch_optional(&self.pool)
                .await?;
        let space_token = space_token.ok_or(StoreError::NotFound {
            kind: "channel",
            id: channel_id,
        })?;

        let rows = sqlx::query(
            "SELECT id, lfn, source_surl, target_surl, size FROM channel_files
             WHERE channel_id = ? AND status = 'Waiting'
             ORDER BY id ASC
             LIMIT ?",
        )
        .bind(channel_id)
        .bind(max_count as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ChannelBatch {
            space_token,
            files: rows.iter().map(row_to_file).collect::<Result<_>>()?,
        })
    }

    async fn create_job(&self, guid: &str, server: &str, channel_id: ChannelId) -> Result<JobId> {
        let result = sqlx::query(
            "INSERT INTO transfer_jobs (guid, server, channel_id, status, submitted_at)
             VALUES (?, ?, ?, 'Submitted', ?)",
        )
        .bind(guid)
        .bind(server)
        .bind(channel_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn set_job_attribute(&self, job_id: JobId, attribute: JobAttribute) -> Result<()> {
        let query = match attribute {
            JobAttribute::NumberOfFiles(n) => {
                sqlx::query("UPDATE transfer_jobs SET number_of_files = ? WHERE id = ?").bind(n as i64)
            }
            JobAttribute::TotalSize(n) => {
                sqlx::query("UPDATE transfer_jobs SET total_size = ? WHERE id = ?").bind(n as i64)
            }
        };

        let result = query.bind(job_id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "job", id: job_id });
        }
        Ok(())
    }

    async fn append_logging_event(&self, job_id: JobId, event: JobStatus) -> Result<()> {
        sqlx::query("INSERT INTO job_events (job_id, event, at) VALUES (?, ?, ?)")
            .bind(job_id)
            .bind(event.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn link_files_to_job(
        &self,
        job_id: JobId,
        file_ids: &[FileId],
        channel_id: ChannelId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for &file_id in file_ids {
            let moved = sqlx::query(
                "UPDATE channel_files SET status = 'Executing'
                 WHERE id = ? AND channel_id = ? AND status = 'Waiting'",
            )
            .bind(file_id)
            .bind(channel_id)
            .execute(&mut *tx)
            .await?;

            // Dropping the transaction rolls back links made so far
            if moved.rows_affected() != 1 {
                return Err(StoreError::NotQueued { file_id, channel_id });
            }

            sqlx::query("INSERT INTO file_job_links (file_id, job_id, channel_id) VALUES (?, ?, ?)")
                .bind(file_id)
                .bind(job_id)
                .bind(channel_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_file_link_attribute(
        &self,
        job_id: JobId,
        file_id: FileId,
        attribute: FileLinkAttribute,
    ) -> Result<()> {
        let FileLinkAttribute::FileSize(size) = attribute;

        let result = sqlx::query("UPDATE file_job_links SET file_size = ? WHERE job_id = ? AND file_id = ?")
            .bind(size as i64)
            .bind(job_id)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "file link", id: file_id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn open_temp() -> Result<(NamedTempFile, SqliteStore)> {
        let tmp = NamedTempFile::new().map_err(|e| StoreError::Database(e.to_string()))?;
        let store = SqliteStore::open(tmp.path().to_str().unwrap()).await?;
        Ok((tmp, store))
    }

    #[tokio::test]
    async fn test_no_channels_means_nothing_eligible() -> Result<()> {
        let (_tmp, store) = open_temp().await?;
        assert!(store.select_eligible_channel(2).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_channel_without_files_is_not_eligible() -> Result<()> {
        let (_tmp, store) = open_temp().await?;
        store.add_channel("CERN-RAW", "RAL-RAW", None).await?;
        assert!(store.select_eligible_channel(2).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_add_channel_is_idempotent() -> Result<()> {
        let (_tmp, store) = open_temp().await?;
        let first = store.add_channel("CERN-RAW", "RAL-RAW", None).await?;
        let second = store.add_channel("CERN-RAW", "RAL-RAW", Some("LHCb_RAW")).await?;
        assert_eq!(first, second);

        let batch = store.take_queued_files(first, 10).await?;
        assert_eq!(batch.space_token.as_deref(), Some("LHCb_RAW"));
        Ok(())
    }

    #[tokio::test]
    async fn test_take_queued_files_respects_limit_and_order() -> Result<()> {
        let (_tmp, store) = open_temp().await?;
        let channel = store.add_channel("CERN-RAW", "RAL-RAW", None).await?;
        for i in 0..5 {
            store
                .enqueue_file(channel, &format!("/lhcb/f{}", i), "srm://src", "srm://dst", 10 * i)
                .await?;
        }

        let batch = store.take_queued_files(channel, 3).await?;
        assert_eq!(batch.files.len(), 3);
        assert_eq!(batch.files[0].lfn, "/lhcb/f0");
        assert_eq!(batch.files[2].size, 20);

        // Reading does not consume
        assert_eq!(store.queued_count(channel).await?, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_take_queued_files_unknown_channel() -> Result<()> {
        let (_tmp, store) = open_temp().await?;
        let err = store.take_queued_files(99, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "channel", id: 99 }));
        Ok(())
    }

    #[tokio::test]
    async fn test_set_attribute_on_missing_job() -> Result<()> {
        let (_tmp, store) = open_temp().await?;
        let err = store
            .set_job_attribute(42, JobAttribute::TotalSize(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "job", .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_link_rolls_back_when_a_file_is_not_waiting() -> Result<()> {
        let (_tmp, store) = open_temp().await?;
        let channel = store.add_channel("CERN-RAW", "RAL-RAW", None).await?;
        let f1 = store.enqueue_file(channel, "/lhcb/a", "s", "d", 1).await?;
        let f2 = store.enqueue_file(channel, "/lhcb/b", "s", "d", 2).await?;

        let first = store.create_job("G1", "S1", channel).await?;
        store.link_files_to_job(first, &[f2], channel).await?;

        let second = store.create_job("G2", "S1", channel).await?;
        let err = store
            .link_files_to_job(second, &[f1, f2], channel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotQueued { file_id, .. } if file_id == f2));

        // f1 stays queued and unlinked
        assert_eq!(store.file_status(f1).await?, Some(FileStatus::Waiting));
        assert!(store.links_for_job(second).await?.is_empty());
        Ok(())
    }
}

use sqlx::PgPool;

use crate::{core::time::DateTime, home::SensorReading};

/// Append-only history of complete sensor readings, the only state that
/// survives a restart.
#[derive(Clone)]
pub struct ReadingRepository {
    pool: PgPool,
}

impl ReadingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, reading: &SensorReading, timestamp: DateTime) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO sensor_data (temperature, humidity, light_level, created_at)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.light_level)
        .bind(timestamp.into_db())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

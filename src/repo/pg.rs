#![cfg(feature = "db")]

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use super::TelemetryStore;
use crate::domain::{
    utc_day_start, AnchorReceipt, DailyDigest, HourlySummary, RecordStatus, TelemetryRecord,
};

pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .context("failed to connect to postgres")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        Ok(Self { pool })
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<TelemetryRecord> {
    let status: String = row.try_get("status")?;
    Ok(TelemetryRecord {
        site_id: row.try_get("site_id")?,
        timestamp: row.try_get("ts")?,
        poa_irradiance_wm2: row.try_get("poa_irradiance_wm2")?,
        temperature_c: row.try_get("temperature_c")?,
        wind_speed_mps: row.try_get("wind_speed_mps")?,
        ac_power_kw: row.try_get("ac_power_kw")?,
        ac_energy_kwh: row.try_get("ac_energy_kwh")?,
        status: status
            .parse::<RecordStatus>()
            .with_context(|| format!("unknown record status '{status}'"))?,
        row_hash: row.try_get("row_hash")?,
    })
}

fn digest_from_row(row: &sqlx::postgres::PgRow) -> Result<DailyDigest> {
    let rows: i64 = row.try_get("row_count")?;
    let interval: i32 = row.try_get("interval_minutes")?;
    let tx_id: Option<String> = row.try_get("anchor_tx_id")?;
    let block: Option<i64> = row.try_get("anchor_block_number")?;
    let anchor = match tx_id {
        Some(tx_id) => Some(AnchorReceipt {
            tx_id,
            tx_hash: row.try_get("anchor_tx_hash")?,
            block_number: block.map(|b| b as u64),
            anchored_at: row
                .try_get::<Option<_>, _>("anchored_at")?
                .context("anchored digest without anchored_at")?,
        }),
        None => None,
    };
    Ok(DailyDigest {
        site_id: row.try_get("site_id")?,
        day: row.try_get("day")?,
        rows: rows as usize,
        energy_kwh: row.try_get("energy_kwh")?,
        avoided_tco2e: row.try_get("avoided_tco2e")?,
        merkle_root: row.try_get("merkle_root")?,
        emission_factor_kg_per_kwh: row.try_get("emission_factor_kg_per_kwh")?,
        interval_minutes: interval as u32,
        created_at: row.try_get("created_at")?,
        anchor,
    })
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn upsert_records(&self, records: &[TelemetryRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO telemetry (site_id, ts, poa_irradiance_wm2, temperature_c,
                    wind_speed_mps, ac_power_kw, ac_energy_kwh, status, row_hash)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (site_id, ts) DO UPDATE SET
                    poa_irradiance_wm2 = EXCLUDED.poa_irradiance_wm2,
                    temperature_c = EXCLUDED.temperature_c,
                    wind_speed_mps = EXCLUDED.wind_speed_mps,
                    ac_power_kw = EXCLUDED.ac_power_kw,
                    ac_energy_kwh = EXCLUDED.ac_energy_kwh,
                    status = EXCLUDED.status,
                    row_hash = EXCLUDED.row_hash
                "#,
            )
            .bind(&r.site_id)
            .bind(r.timestamp)
            .bind(r.poa_irradiance_wm2)
            .bind(r.temperature_c)
            .bind(r.wind_speed_mps)
            .bind(r.ac_power_kw)
            .bind(r.ac_energy_kwh)
            .bind(r.status.to_string())
            .bind(&r.row_hash)
            .execute(&mut *tx)
            .await
            .context("telemetry upsert failed")?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn records_for_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<TelemetryRecord>> {
        let start = utc_day_start(day);
        let rows = sqlx::query(
            r#"
            SELECT site_id, ts, poa_irradiance_wm2, temperature_c, wind_speed_mps,
                   ac_power_kw, ac_energy_kwh, status, row_hash
            FROM telemetry
            WHERE site_id = $1 AND ts >= $2 AND ts < $3
            ORDER BY ts ASC
            "#,
        )
        .bind(site_id)
        .bind(start)
        .bind(start + Duration::days(1))
        .fetch_all(&self.pool)
        .await
        .context("telemetry query failed")?;

        rows.iter().map(record_from_row).collect()
    }

    async fn upsert_hourly(&self, summaries: &[HourlySummary]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for s in summaries {
            sqlx::query(
                r#"
                INSERT INTO telemetry_hourly (site_id, hour_start, samples, energy_kwh,
                    max_power_kw, mean_temperature_c, mean_irradiance_wm2)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (site_id, hour_start) DO UPDATE SET
                    samples = EXCLUDED.samples,
                    energy_kwh = EXCLUDED.energy_kwh,
                    max_power_kw = EXCLUDED.max_power_kw,
                    mean_temperature_c = EXCLUDED.mean_temperature_c,
                    mean_irradiance_wm2 = EXCLUDED.mean_irradiance_wm2
                "#,
            )
            .bind(&s.site_id)
            .bind(s.hour_start)
            .bind(s.samples as i32)
            .bind(s.energy_kwh)
            .bind(s.max_power_kw)
            .bind(s.mean_temperature_c)
            .bind(s.mean_irradiance_wm2)
            .execute(&mut *tx)
            .await
            .context("hourly upsert failed")?;
        }
        tx.commit().await?;
        Ok(summaries.len())
    }

    async fn hourly_for_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<HourlySummary>> {
        let start = utc_day_start(day);
        let rows = sqlx::query(
            r#"
            SELECT site_id, hour_start, samples, energy_kwh, max_power_kw,
                   mean_temperature_c, mean_irradiance_wm2
            FROM telemetry_hourly
            WHERE site_id = $1 AND hour_start >= $2 AND hour_start < $3
            ORDER BY hour_start ASC
            "#,
        )
        .bind(site_id)
        .bind(start)
        .bind(start + Duration::days(1))
        .fetch_all(&self.pool)
        .await
        .context("hourly query failed")?;

        rows.iter()
            .map(|row| {
                let samples: i32 = row.try_get("samples")?;
                Ok(HourlySummary {
                    site_id: row.try_get("site_id")?,
                    hour_start: row.try_get("hour_start")?,
                    samples: samples as usize,
                    energy_kwh: row.try_get("energy_kwh")?,
                    max_power_kw: row.try_get("max_power_kw")?,
                    mean_temperature_c: row.try_get("mean_temperature_c")?,
                    mean_irradiance_wm2: row.try_get("mean_irradiance_wm2")?,
                })
            })
            .collect()
    }

    async fn upsert_digest(&self, d: &DailyDigest) -> Result<()> {
        let anchor = d.anchor.as_ref();
        sqlx::query(
            r#"
            INSERT INTO daily_digest (site_id, day, row_count, energy_kwh, avoided_tco2e,
                merkle_root, emission_factor_kg_per_kwh, interval_minutes, created_at,
                anchor_tx_id, anchor_tx_hash, anchor_block_number, anchored_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (site_id, day) DO UPDATE SET
                row_count = EXCLUDED.row_count,
                energy_kwh = EXCLUDED.energy_kwh,
                avoided_tco2e = EXCLUDED.avoided_tco2e,
                merkle_root = EXCLUDED.merkle_root,
                emission_factor_kg_per_kwh = EXCLUDED.emission_factor_kg_per_kwh,
                interval_minutes = EXCLUDED.interval_minutes,
                created_at = EXCLUDED.created_at,
                anchor_tx_id = CASE WHEN daily_digest.anchor_tx_id IS NULL
                    THEN EXCLUDED.anchor_tx_id ELSE daily_digest.anchor_tx_id END,
                anchor_tx_hash = CASE WHEN daily_digest.anchor_tx_id IS NULL
                    THEN EXCLUDED.anchor_tx_hash ELSE daily_digest.anchor_tx_hash END,
                anchor_block_number = CASE WHEN daily_digest.anchor_tx_id IS NULL
                    THEN EXCLUDED.anchor_block_number ELSE daily_digest.anchor_block_number END,
                anchored_at = CASE WHEN daily_digest.anchor_tx_id IS NULL
                    THEN EXCLUDED.anchored_at ELSE daily_digest.anchored_at END
            "#,
        )
        .bind(&d.site_id)
        .bind(d.day)
        .bind(d.rows as i64)
        .bind(d.energy_kwh)
        .bind(d.avoided_tco2e)
        .bind(&d.merkle_root)
        .bind(d.emission_factor_kg_per_kwh)
        .bind(d.interval_minutes as i32)
        .bind(d.created_at)
        .bind(anchor.map(|a| a.tx_id.clone()))
        .bind(anchor.and_then(|a| a.tx_hash.clone()))
        .bind(anchor.and_then(|a| a.block_number).map(|b| b as i64))
        .bind(anchor.map(|a| a.anchored_at))
        .execute(&self.pool)
        .await
        .context("digest upsert failed")?;
        Ok(())
    }

    async fn attach_anchor(
        &self,
        site_id: &str,
        day: NaiveDate,
        merkle_root: &str,
        receipt: &AnchorReceipt,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE daily_digest SET
                anchor_tx_id = $4,
                anchor_tx_hash = $5,
                anchor_block_number = $6,
                anchored_at = $7
            WHERE site_id = $1 AND day = $2 AND merkle_root = $3
              AND anchor_tx_id IS NULL
            "#,
        )
        .bind(site_id)
        .bind(day)
        .bind(merkle_root)
        .bind(&receipt.tx_id)
        .bind(receipt.tx_hash.as_deref())
        .bind(receipt.block_number.map(|b| b as i64))
        .bind(receipt.anchored_at)
        .execute(&self.pool)
        .await
        .context("anchor receipt update failed")?;
        Ok(done.rows_affected() == 1)
    }

    async fn digest(&self, site_id: &str, day: NaiveDate) -> Result<Option<DailyDigest>> {
        let row = sqlx::query("SELECT * FROM daily_digest WHERE site_id = $1 AND day = $2")
            .bind(site_id)
            .bind(day)
            .fetch_optional(&self.pool)
            .await
            .context("digest query failed")?;
        row.as_ref().map(digest_from_row).transpose()
    }

    async fn unanchored_digests(&self, limit: usize) -> Result<Vec<DailyDigest>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM daily_digest
            WHERE anchor_tx_id IS NULL
            ORDER BY day ASC, site_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("unanchored digest query failed")?;
        rows.iter().map(digest_from_row).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("postgres ping failed")?;
        Ok(())
    }
}

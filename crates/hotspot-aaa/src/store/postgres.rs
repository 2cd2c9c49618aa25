//! PostgreSQL store backend
//!
//! Table layout:
//! - `hotspot_users`, `pricing_packages`, `vouchers`, `fup_configs`: read-only here
//! - `ip_pools`, `ip_leases`: pool definitions and leases
//! - `radius_sessions`: one row per accounting session
//!
//! A partial unique index on `ip_leases (pool_id, ip_address) WHERE status = 'active'`
//! enforces at most one active lease per address across concurrent allocators.

use super::{
    FupConfigStore, IpamStore, SessionStore, StoreError, StoreResult, SubscriberStore,
};
use crate::config::PostgresSettings;
use crate::model::{
    FupConfig, IpLease, IpPool, LeaseId, LeaseStatus, NewLease, NewPool, NewSession, PackageId,
    PoolId, PricingPackage, RadiusSession, ServiceType, Subscriber, UserId, Voucher,
    VoucherStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresStore { pool }
    }

    /// Open a connection pool sized from configuration
    pub async fn connect(settings: &PostgresSettings) -> StoreResult<Self> {
        debug!(url = %mask_url(&settings.url), "Creating PostgreSQL connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.timeout))
            .connect(&settings.url)
            .await
            .map_err(|e| StoreError::Backend(format!("connection failed: {}", e)))?;

        info!(
            max_connections = settings.max_connections,
            "PostgreSQL connection pool created"
        );
        Ok(Self::new(pool))
    }

    /// Create the schema if it does not exist
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS pricing_packages (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL DEFAULT '',
                duration INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS hotspot_users (
                id BIGSERIAL PRIMARY KEY,
                username VARCHAR(255) NOT NULL,
                mac_address VARCHAR(64) NOT NULL DEFAULT '',
                phone_number VARCHAR(32) NOT NULL DEFAULT '',
                password VARCHAR(255) NOT NULL DEFAULT '',
                service_type VARCHAR(16) NOT NULL DEFAULT 'hotspot',
                access_expires_at TIMESTAMPTZ NOT NULL,
                is_blacklisted BOOLEAN NOT NULL DEFAULT false,
                package_id BIGINT REFERENCES pricing_packages(id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_users_username ON hotspot_users(username)",
            "CREATE INDEX IF NOT EXISTS idx_users_mac ON hotspot_users(mac_address)",
            "CREATE INDEX IF NOT EXISTS idx_users_phone ON hotspot_users(phone_number)",
            r#"
            CREATE TABLE IF NOT EXISTS vouchers (
                code VARCHAR(64) PRIMARY KEY,
                status VARCHAR(16) NOT NULL,
                package_id BIGINT NOT NULL REFERENCES pricing_packages(id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS fup_configs (
                package_id BIGINT PRIMARY KEY,
                daily_limit BIGINT NOT NULL DEFAULT 0,
                monthly_limit BIGINT NOT NULL DEFAULT 0,
                throttled_down INTEGER NOT NULL,
                throttled_up INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ip_pools (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                subnet VARCHAR(64) NOT NULL,
                gateway VARCHAR(15) NOT NULL,
                start_ip VARCHAR(15) NOT NULL,
                end_ip VARCHAR(15) NOT NULL,
                pool_type VARCHAR(32) NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ip_leases (
                id BIGSERIAL PRIMARY KEY,
                pool_id BIGINT NOT NULL REFERENCES ip_pools(id),
                user_id BIGINT NOT NULL,
                ip_address VARCHAR(15) NOT NULL,
                mac_address VARCHAR(64) NOT NULL DEFAULT '',
                status VARCHAR(16) NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_leases_active_ip
                ON ip_leases(pool_id, ip_address) WHERE status = 'active'
            "#,
            "CREATE INDEX IF NOT EXISTS idx_leases_user ON ip_leases(pool_id, user_id)",
            r#"
            CREATE TABLE IF NOT EXISTS radius_sessions (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT,
                username VARCHAR(255) NOT NULL,
                nas_ip VARCHAR(45) NOT NULL,
                framed_ip VARCHAR(15),
                session_id VARCHAR(255) NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                stop_time TIMESTAMPTZ,
                input_octets BIGINT NOT NULL DEFAULT 0,
                output_octets BIGINT NOT NULL DEFAULT 0,
                termination_cause VARCHAR(64),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open
                ON radius_sessions(session_id) WHERE stop_time IS NULL
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_created ON radius_sessions(user_id, created_at)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Hide the password component of a connection URL for logging
fn mask_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            match credentials.find(':') {
                Some(colon) => format!(
                    "{}{}:****{}",
                    &url[..scheme_end + 3],
                    &credentials[..colon],
                    &url[at..]
                ),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_ipv4(value: &str, column: &str) -> StoreResult<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| StoreError::Backend(format!("invalid IPv4 in {}: {}", column, value)))
}

fn subscriber_from_row(row: &PgRow) -> StoreResult<Subscriber> {
    let service_type: String = row.try_get("service_type")?;
    Ok(Subscriber {
        id: to_u64(row.try_get("id")?),
        username: row.try_get("username")?,
        mac_address: row.try_get("mac_address")?,
        phone_number: row.try_get("phone_number")?,
        password: row.try_get("password")?,
        service_type: ServiceType::parse(&service_type).ok_or_else(|| {
            StoreError::Backend(format!("unknown service_type: {}", service_type))
        })?,
        access_expires_at: row.try_get("access_expires_at")?,
        is_blacklisted: row.try_get("is_blacklisted")?,
        package_id: row.try_get::<Option<i64>, _>("package_id")?.map(to_u64),
    })
}

fn pool_from_row(row: &PgRow) -> StoreResult<IpPool> {
    Ok(IpPool {
        id: to_u64(row.try_get("id")?),
        name: row.try_get("name")?,
        subnet: row.try_get("subnet")?,
        gateway: parse_ipv4(&row.try_get::<String, _>("gateway")?, "gateway")?,
        start_ip: parse_ipv4(&row.try_get::<String, _>("start_ip")?, "start_ip")?,
        end_ip: parse_ipv4(&row.try_get::<String, _>("end_ip")?, "end_ip")?,
        pool_type: row.try_get("pool_type")?,
    })
}

fn lease_from_row(row: &PgRow) -> StoreResult<IpLease> {
    let status: String = row.try_get("status")?;
    Ok(IpLease {
        id: to_u64(row.try_get("id")?),
        pool_id: to_u64(row.try_get("pool_id")?),
        user_id: to_u64(row.try_get("user_id")?),
        ip_address: parse_ipv4(&row.try_get::<String, _>("ip_address")?, "ip_address")?,
        mac_address: row.try_get("mac_address")?,
        status: LeaseStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown lease status: {}", status)))?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> StoreResult<RadiusSession> {
    let framed_ip = row
        .try_get::<Option<String>, _>("framed_ip")?
        .map(|ip| parse_ipv4(&ip, "framed_ip"))
        .transpose()?;
    Ok(RadiusSession {
        id: to_u64(row.try_get("id")?),
        user_id: row.try_get::<Option<i64>, _>("user_id")?.map(to_u64),
        username: row.try_get("username")?,
        nas_ip: row.try_get("nas_ip")?,
        framed_ip,
        session_id: row.try_get("session_id")?,
        start_time: row.try_get("start_time")?,
        stop_time: row.try_get("stop_time")?,
        input_octets: to_u64(row.try_get("input_octets")?),
        output_octets: to_u64(row.try_get("output_octets")?),
        termination_cause: row.try_get("termination_cause")?,
        created_at: row.try_get("created_at")?,
    })
}

const SESSION_COLUMNS: &str = "id, user_id, username, nas_ip, framed_ip, session_id, start_time, \
     stop_time, input_octets, output_octets, termination_cause, created_at";

const LEASE_COLUMNS: &str =
    "id, pool_id, user_id, ip_address, mac_address, status, expires_at, created_at";

#[async_trait]
impl SubscriberStore for PostgresStore {
    async fn find_subscriber(&self, identifier: &str) -> StoreResult<Option<Subscriber>> {
        if identifier.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(
            r#"
            SELECT * FROM hotspot_users
            WHERE username = $1 OR mac_address = $1 OR phone_number = $1
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscriber_from_row).transpose()
    }

    async fn find_subscriber_by_username(&self, username: &str) -> StoreResult<Option<Subscriber>> {
        let row = sqlx::query("SELECT * FROM hotspot_users WHERE username = $1 ORDER BY id LIMIT 1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subscriber_from_row).transpose()
    }

    async fn find_voucher(&self, code: &str) -> StoreResult<Option<Voucher>> {
        let row = sqlx::query(
            r#"
            SELECT v.code, v.status, p.id AS package_id, p.name, p.duration
            FROM vouchers v
            JOIN pricing_packages p ON p.id = v.package_id
            WHERE v.code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        let duration: i32 = row.try_get("duration")?;
        Ok(Some(Voucher {
            code: row.try_get("code")?,
            status: VoucherStatus::parse(&status)
                .ok_or_else(|| StoreError::Backend(format!("unknown voucher status: {}", status)))?,
            package: PricingPackage {
                id: to_u64(row.try_get("package_id")?),
                name: row.try_get("name")?,
                duration: u32::try_from(duration).unwrap_or(0),
            },
        }))
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn create_session(&self, session: NewSession) -> StoreResult<RadiusSession> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO radius_sessions
                (user_id, username, nas_ip, framed_ip, session_id, start_time, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session.user_id.map(to_i64))
        .bind(&session.username)
        .bind(&session.nas_ip)
        .bind(session.framed_ip.map(|ip| ip.to_string()))
        .bind(&session.session_id)
        .bind(session.start_time)
        .fetch_one(&self.pool)
        .await?;
        session_from_row(&row)
    }

    async fn find_open_session(&self, session_id: &str) -> StoreResult<Option<RadiusSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM radius_sessions WHERE session_id = $1 AND stop_time IS NULL",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn update_session(&self, session: &RadiusSession) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE radius_sessions
            SET input_octets = $2, output_octets = $3, stop_time = $4,
                termination_cause = $5, framed_ip = $6
            WHERE id = $1
            "#,
        )
        .bind(to_i64(session.id))
        .bind(to_i64(session.input_octets))
        .bind(to_i64(session.output_octets))
        .bind(session.stop_time)
        .bind(session.termination_cause.as_deref())
        .bind(session.framed_ip.map(|ip| ip.to_string()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session record {}", session.id)));
        }
        Ok(())
    }

    async fn usage_since(&self, user_id: UserId, since: DateTime<Utc>) -> StoreResult<u64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(input_octets + output_octets)::BIGINT
            FROM radius_sessions
            WHERE user_id = $1 AND created_at >= $2
            "#,
        )
        .bind(to_i64(user_id))
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.map(to_u64).unwrap_or(0))
    }
}

#[async_trait]
impl IpamStore for PostgresStore {
    async fn insert_pool(&self, pool: NewPool) -> StoreResult<IpPool> {
        let row = sqlx::query(
            r#"
            INSERT INTO ip_pools (name, subnet, gateway, start_ip, end_ip, pool_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, subnet, gateway, start_ip, end_ip, pool_type
            "#,
        )
        .bind(&pool.name)
        .bind(&pool.subnet)
        .bind(pool.gateway.to_string())
        .bind(pool.start_ip.to_string())
        .bind(pool.end_ip.to_string())
        .bind(&pool.pool_type)
        .fetch_one(&self.pool)
        .await?;
        pool_from_row(&row)
    }

    async fn get_pool(&self, pool_id: PoolId) -> StoreResult<Option<IpPool>> {
        let row = sqlx::query(
            "SELECT id, name, subnet, gateway, start_ip, end_ip, pool_type FROM ip_pools WHERE id = $1",
        )
        .bind(to_i64(pool_id))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pool_from_row).transpose()
    }

    async fn find_active_lease(
        &self,
        pool_id: PoolId,
        user_id: UserId,
        mac_address: &str,
    ) -> StoreResult<Option<IpLease>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM ip_leases
            WHERE pool_id = $1 AND status = 'active'
              AND (user_id = $2 OR ($3 <> '' AND mac_address = $3))
            ORDER BY id
            LIMIT 1
            "#,
            LEASE_COLUMNS
        ))
        .bind(to_i64(pool_id))
        .bind(to_i64(user_id))
        .bind(mac_address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(lease_from_row).transpose()
    }

    async fn active_addresses(&self, pool_id: PoolId) -> StoreResult<Vec<Ipv4Addr>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT ip_address FROM ip_leases WHERE pool_id = $1 AND status = 'active'",
        )
        .bind(to_i64(pool_id))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|ip| parse_ipv4(ip, "ip_address")).collect()
    }

    async fn insert_lease(&self, lease: NewLease) -> StoreResult<IpLease> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO ip_leases (pool_id, user_id, ip_address, mac_address, status, expires_at)
            VALUES ($1, $2, $3, $4, 'active', $5)
            RETURNING {}
            "#,
            LEASE_COLUMNS
        ))
        .bind(to_i64(lease.pool_id))
        .bind(to_i64(lease.user_id))
        .bind(lease.ip_address.to_string())
        .bind(&lease.mac_address)
        .bind(lease.expires_at)
        .fetch_one(&self.pool)
        .await?;
        lease_from_row(&row)
    }

    async fn set_lease_status(&self, lease_id: LeaseId, status: LeaseStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE ip_leases SET status = $2 WHERE id = $1")
            .bind(to_i64(lease_id))
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("lease {}", lease_id)));
        }
        Ok(())
    }

    async fn get_lease(&self, lease_id: LeaseId) -> StoreResult<Option<IpLease>> {
        let row = sqlx::query(&format!("SELECT {} FROM ip_leases WHERE id = $1", LEASE_COLUMNS))
            .bind(to_i64(lease_id))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lease_from_row).transpose()
    }
}

#[async_trait]
impl FupConfigStore for PostgresStore {
    async fn find_fup_config(&self, package_id: PackageId) -> StoreResult<Option<FupConfig>> {
        let row = sqlx::query(
            r#"
            SELECT package_id, daily_limit, monthly_limit, throttled_down, throttled_up
            FROM fup_configs WHERE package_id = $1
            "#,
        )
        .bind(to_i64(package_id))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let down: i32 = row.try_get("throttled_down")?;
        let up: i32 = row.try_get("throttled_up")?;
        Ok(Some(FupConfig {
            package_id: to_u64(row.try_get("package_id")?),
            daily_limit: to_u64(row.try_get("daily_limit")?),
            monthly_limit: to_u64(row.try_get("monthly_limit")?),
            throttled_down: u32::try_from(down).unwrap_or(0),
            throttled_up: u32::try_from(up).unwrap_or(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("postgres://radius:secret@db:5432/aaa"),
            "postgres://radius:****@db:5432/aaa"
        );
        assert_eq!(mask_url("postgres://db/aaa"), "postgres://db/aaa");
    }

    #[test]
    fn test_integer_conversions_saturate() {
        assert_eq!(to_i64(u64::MAX), i64::MAX);
        assert_eq!(to_u64(-5), 0);
        assert_eq!(to_u64(42), 42);
    }
}

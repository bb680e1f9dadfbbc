//! Concrete [`DeviceStore`] over `sqlx`'s SQLite driver, implementing the
//! persisted schema in spec §6 (`device`, `device_attr`, `device_twin`)
//! and the transactional multi-writes in spec §4.7.
//!
//! Grounded on `original_source/edge/pkg/devicetwin/dtclient`'s ORM-backed
//! `UpdateDeviceField`/`UpdateDeviceFields`/`QueryDevice`/`DeviceAttrTrans`
//! functions (see `device_db_test.go` for the expected call shapes), ported
//! from the Go source's per-statement ORM calls to `sqlx`'s query builder
//! with a `Transaction` wrapping every multi-statement operation.

use async_trait::async_trait;
use sqlx::{SqlitePool, Transaction};

use crate::error::{Error, Result};
use crate::store::DeviceStore;
use crate::types::{
    AttrColumnValue, DeviceAttrRow, DeviceAttrUpdate, DeviceDelete, DeviceFieldsUpdate, DeviceRow,
    DeviceTwinRow,
};

const CONTEXT: &str = "sqlite_device_store";

/// The closed set of columns `UpdateDeviceField(s)` may target (spec §6).
const DEVICE_COLUMNS: &[&str] = &["name", "description", "state", "last_online"];

fn validate_device_column(field: &str) -> Result<()> {
    if DEVICE_COLUMNS.contains(&field) {
        Ok(())
    } else {
        Err(Error::validation(
            CONTEXT,
            format!("unknown device column `{field}`"),
        ))
    }
}

pub struct SqliteDeviceStore {
    pool: SqlitePool,
}

impl SqliteDeviceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates `device`, `device_attr`, `device_twin` if they don't already
    /// exist. Idempotent, safe to call on every agent start.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT '',
                last_online TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| Error::storage(CONTEXT, err))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_attr (
                device_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL DEFAULT '',
                optional BOOLEAN NOT NULL DEFAULT 0,
                attr_type TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (device_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| Error::storage(CONTEXT, err))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_twin (
                device_id TEXT NOT NULL,
                name TEXT NOT NULL,
                expected TEXT,
                actual TEXT,
                expected_version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (device_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| Error::storage(CONTEXT, err))?;

        Ok(())
    }

    async fn apply_device_fields<'c>(
        tx: &mut Transaction<'c, sqlx::Sqlite>,
        id: &str,
        cols: &std::collections::BTreeMap<&'static str, String>,
    ) -> Result<()> {
        for field in cols.keys() {
            validate_device_column(field)?;
        }
        for (field, value) in cols {
            let sql = format!("UPDATE device SET {field} = ? WHERE id = ?");
            let result = sqlx::query(&sql)
                .bind(value)
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(|err| Error::storage(CONTEXT, err))?;
            if result.rows_affected() == 0 {
                return Err(Error::not_found(CONTEXT, id));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for SqliteDeviceStore {
    async fn update_device_field(&self, id: &str, field: &'static str, value: &str) -> Result<()> {
        validate_device_column(field)?;
        let sql = format!("UPDATE device SET {field} = ? WHERE id = ?");
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| Error::storage(CONTEXT, err))?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(CONTEXT, id));
        }
        Ok(())
    }

    async fn update_device_fields(&self, id: &str, cols: &std::collections::BTreeMap<&'static str, String>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|err| Error::storage(CONTEXT, err))?;
        Self::apply_device_fields(&mut tx, id, cols).await?;
        tx.commit().await.map_err(|err| Error::storage(CONTEXT, err))
    }

    async fn update_device_multi(&self, updates: &[DeviceFieldsUpdate]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|err| Error::storage(CONTEXT, err))?;
        for update in updates {
            if let Err(err) = Self::apply_device_fields(&mut tx, &update.device_id, &update.cols).await {
                let _ = tx.rollback().await;
                return Err(err);
            }
        }
        tx.commit().await.map_err(|err| Error::storage(CONTEXT, err))
    }

    async fn query_device(&self, field: &'static str, value: &str) -> Result<Vec<DeviceRow>> {
        if field != "id" && !DEVICE_COLUMNS.contains(&field) {
            return Err(Error::validation(CONTEXT, format!("unknown device column `{field}`")));
        }
        let sql = format!("SELECT id, name, description, state, last_online FROM device WHERE {field} = ?");
        sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| Error::storage(CONTEXT, err))
    }

    async fn query_device_all(&self) -> Result<Vec<DeviceRow>> {
        sqlx::query_as::<_, DeviceRow>("SELECT id, name, description, state, last_online FROM device")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| Error::storage(CONTEXT, err))
    }

    async fn query_device_attrs(&self, device_id: &str) -> Result<Vec<DeviceAttrRow>> {
        sqlx::query_as::<_, DeviceAttrRow>(
            "SELECT device_id, name, value, optional, attr_type, metadata FROM device_attr WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| Error::storage(CONTEXT, err))
    }

    async fn device_attr_trans(
        &self,
        add: &[DeviceAttrRow],
        del: &[DeviceDelete],
        update: &[DeviceAttrUpdate],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|err| Error::storage(CONTEXT, err))?;

        for row in add {
            let result = sqlx::query(
                r#"
                INSERT INTO device_attr (device_id, name, value, optional, attr_type, metadata)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(device_id, name) DO UPDATE SET
                    value = excluded.value,
                    optional = excluded.optional,
                    attr_type = excluded.attr_type,
                    metadata = excluded.metadata
                "#,
            )
            .bind(&row.device_id)
            .bind(&row.name)
            .bind(&row.value)
            .bind(row.optional)
            .bind(&row.attr_type)
            .bind(&row.metadata)
            .execute(&mut *tx)
            .await;
            if let Err(err) = result {
                let _ = tx.rollback().await;
                return Err(Error::storage(CONTEXT, err));
            }
        }

        for d in del {
            let result = sqlx::query("DELETE FROM device_attr WHERE device_id = ? AND name = ?")
                .bind(&d.device_id)
                .bind(&d.name)
                .execute(&mut *tx)
                .await;
            if let Err(err) = result {
                let _ = tx.rollback().await;
                return Err(Error::storage(CONTEXT, err));
            }
        }

        for u in update {
            if let Err(err) = apply_attr_update(&mut tx, u).await {
                let _ = tx.rollback().await;
                return Err(err);
            }
        }

        tx.commit().await.map_err(|err| Error::storage(CONTEXT, err))
    }

    async fn add_device_trans(
        &self,
        devices: &[DeviceRow],
        attrs: &[DeviceAttrRow],
        twins: &[DeviceTwinRow],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|err| Error::storage(CONTEXT, err))?;

        for d in devices {
            let result = sqlx::query(
                "INSERT INTO device (id, name, description, state, last_online) VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description,
                    state = excluded.state, last_online = excluded.last_online",
            )
            .bind(&d.id)
            .bind(&d.name)
            .bind(&d.description)
            .bind(&d.state)
            .bind(&d.last_online)
            .execute(&mut *tx)
            .await;
            if let Err(err) = result {
                let _ = tx.rollback().await;
                return Err(Error::storage(CONTEXT, err));
            }
        }

        for a in attrs {
            let result = sqlx::query(
                "INSERT INTO device_attr (device_id, name, value, optional, attr_type, metadata)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(device_id, name) DO UPDATE SET value = excluded.value, optional = excluded.optional,
                    attr_type = excluded.attr_type, metadata = excluded.metadata",
            )
            .bind(&a.device_id)
            .bind(&a.name)
            .bind(&a.value)
            .bind(a.optional)
            .bind(&a.attr_type)
            .bind(&a.metadata)
            .execute(&mut *tx)
            .await;
            if let Err(err) = result {
                let _ = tx.rollback().await;
                return Err(Error::storage(CONTEXT, err));
            }
        }

        for t in twins {
            let result = sqlx::query(
                "INSERT INTO device_twin (device_id, name, expected, actual, expected_version)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(device_id, name) DO UPDATE SET expected = excluded.expected,
                    actual = excluded.actual, expected_version = excluded.expected_version",
            )
            .bind(&t.device_id)
            .bind(&t.name)
            .bind(&t.expected)
            .bind(&t.actual)
            .bind(t.expected_version)
            .execute(&mut *tx)
            .await;
            if let Err(err) = result {
                let _ = tx.rollback().await;
                return Err(Error::storage(CONTEXT, err));
            }
        }

        tx.commit().await.map_err(|err| Error::storage(CONTEXT, err))
    }

    async fn delete_device_trans(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|err| Error::storage(CONTEXT, err))?;
        for id in ids {
            for sql in [
                "DELETE FROM device_twin WHERE device_id = ?",
                "DELETE FROM device_attr WHERE device_id = ?",
                "DELETE FROM device WHERE id = ?",
            ] {
                if let Err(err) = sqlx::query(sql).bind(id).execute(&mut *tx).await {
                    let _ = tx.rollback().await;
                    return Err(Error::storage(CONTEXT, err));
                }
            }
        }
        tx.commit().await.map_err(|err| Error::storage(CONTEXT, err))
    }
}

async fn apply_attr_update(tx: &mut Transaction<'_, sqlx::Sqlite>, update: &DeviceAttrUpdate) -> Result<()> {
    for (col, value) in &update.cols {
        let sql = format!("UPDATE device_attr SET {col} = ? WHERE device_id = ? AND name = ?");
        let query = sqlx::query(&sql);
        let query = match value {
            AttrColumnValue::Text(v) => query.bind(v),
            AttrColumnValue::OptText(v) => query.bind(v),
            AttrColumnValue::Bool(v) => query.bind(*v),
        };
        let result = query
            .bind(&update.device_id)
            .bind(&update.name)
            .execute(&mut **tx)
            .await
            .map_err(|err| Error::storage(CONTEXT, err))?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(
                CONTEXT,
                format!("{}/{}", update.device_id, update.name),
            ));
        }
    }
    Ok(())
}

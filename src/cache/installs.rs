// src/cache/installs.rs

//! Install records: what this cache last deployed to each device
//!
//! The device only reports paths and sizes. To learn which local revision is
//! installed without pulling it back, the deployer records the fingerprint
//! of every unit it successfully installs, keyed by device serial, package
//! and unit. A record is trusted only while the remote file size still
//! matches; anything else means the package changed behind our back.

use super::ArtifactCache;
use crate::apk::UnitName;
use crate::db;
use crate::error::Result;
use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub serial: String,
    pub package: String,
    pub unit: UnitName,
    /// Prefixed fingerprint of the installed APK
    pub fingerprint: String,
    pub size: u64,
    pub version_code: Option<i64>,
}

impl InstallRecord {
    /// Rows with an unrecognized unit key are skipped
    fn from_row(row: &Row) -> rusqlite::Result<Option<Self>> {
        let unit: String = row.get(2)?;
        let Some(unit) = UnitName::from_key(&unit) else {
            return Ok(None);
        };
        Ok(Some(Self {
            serial: row.get(0)?,
            package: row.get(1)?,
            unit,
            fingerprint: row.get(3)?,
            size: row.get::<_, i64>(4)? as u64,
            version_code: row.get(5)?,
        }))
    }
}

impl ArtifactCache {
    /// Insert or replace the record for one unit
    pub fn record_install(&self, record: &InstallRecord) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO installs
                 (serial, package, unit, fingerprint, size, version_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.serial,
                record.package,
                record.unit.as_key(),
                record.fingerprint,
                record.size as i64,
                record.version_code
            ],
        )?;
        Ok(())
    }

    /// Replace every record for a package on a device in one transaction
    pub fn replace_installs(
        &self,
        serial: &str,
        package: &str,
        records: &[InstallRecord],
    ) -> Result<()> {
        db::transaction(self.conn(), |tx| {
            tx.execute(
                "DELETE FROM installs WHERE serial = ?1 AND package = ?2",
                params![serial, package],
            )?;
            for record in records {
                tx.execute(
                    "INSERT INTO installs (serial, package, unit, fingerprint, size, version_code)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        serial,
                        package,
                        record.unit.as_key(),
                        record.fingerprint,
                        record.size as i64,
                        record.version_code
                    ],
                )?;
            }
            Ok(())
        })?;
        debug!(
            "Recorded {} installed units of {} on {}",
            records.len(),
            package,
            serial
        );
        Ok(())
    }

    pub fn installed_unit(
        &self,
        serial: &str,
        package: &str,
        unit: &UnitName,
    ) -> Result<Option<InstallRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT serial, package, unit, fingerprint, size, version_code FROM installs
                 WHERE serial = ?1 AND package = ?2 AND unit = ?3",
                params![serial, package, unit.as_key()],
                InstallRecord::from_row,
            )
            .optional()?;
        Ok(record.flatten())
    }

    /// Version code recorded with the last install of a package
    pub fn installed_version(&self, serial: &str, package: &str) -> Result<Option<i64>> {
        let version = self
            .conn()
            .query_row(
                "SELECT MAX(version_code) FROM installs WHERE serial = ?1 AND package = ?2",
                params![serial, package],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        Ok(version.flatten())
    }

    /// Drop every record for a package, e.g. after an uninstall
    pub fn forget_install(&self, serial: &str, package: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM installs WHERE serial = ?1 AND package = ?2",
            params![serial, package],
        )?;
        Ok(())
    }
}

// src/session/delta_install.rs

//! Delta install: upload only what changed
//!
//! MODIFIED units are written in full; UNCHANGED units are left out and the
//! session inherits them from the installed package (`-p`). A downgrade of
//! otherwise identical content is refused before any session is created.

use super::{CreateOptions, Dialect, InstallSession};
use crate::apk::PackageSpec;
use crate::device::Device;
use crate::diff::{PackageDiff, UnitDiff};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::MetricsLedger;
use tracing::info;

/// Status the package manager reports for a rejected downgrade
pub const DOWNGRADE_STATUS: &str = "INSTALL_FAILED_VERSION_DOWNGRADE";

/// Upload the modified units of `diff` and commit them
pub fn delta_install(
    device: &dyn Device,
    spec: &PackageSpec,
    diff: &PackageDiff,
    metrics: &mut MetricsLedger,
) -> Result<()> {
    let dialect = Dialect::for_api(device.api_level());

    let to_write: Vec<&UnitDiff> = diff.modified().collect();
    if to_write.is_empty() {
        if diff.downgrade {
            return Err(Error::with_device_status(
                ErrorKind::InstallFailed,
                DOWNGRADE_STATUS,
                format!(
                    "{} content is unchanged but its version is lower than the installed one",
                    spec.app_id
                ),
            ));
        }
        return Err(Error::new(
            ErrorKind::InternalError,
            format!("delta of {} has no modified unit to write", spec.app_id),
        ));
    }
    let inherits = diff.units.len() > to_write.len();

    info!(
        "Delta install of {}: writing {} of {} units",
        spec.app_id,
        to_write.len(),
        diff.units.len()
    );

    let upload = metrics.start("DELTAINSTALL_UPLOAD");
    let options = CreateOptions {
        inherit_package: inherits.then(|| spec.app_id.clone()),
        dont_kill: false,
    };
    let mut session = InstallSession::create(device, dialect, &options)?;
    for unit in &to_write {
        session.write(&unit.name, &unit.local.path, unit.local_size)?;
    }
    metrics.finish(upload);

    let install = metrics.start("DELTAINSTALL_INSTALL");
    let committed = session.commit();
    metrics.finish(install);
    committed
}

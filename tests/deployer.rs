// tests/deployer.rs

//! Install routing: delta, full fallback, skip and downgrade handling.

mod common;

use common::{APP, ApkBuilder, SERIAL, TestEnv, app_apk};
use swapdeploy::session::PackageManagerInstaller;
use swapdeploy::{DeltaSkipReason, ErrorKind, FailureClass, InstallOutcome, PackageSpec};

fn spec(paths: &[std::path::PathBuf], version: i64) -> PackageSpec {
    PackageSpec::new(APP, paths).unwrap().with_version_code(version)
}

fn split_apk(content: &[u8]) -> ApkBuilder {
    ApkBuilder::new(APP, 1).dex("classes.dex", content)
}

#[test]
fn test_fresh_package_forced_full_install() {
    let mut env = TestEnv::new(30);
    env.options.force_full_install = true;
    let base = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));

    let installer = PackageManagerInstaller::new(&env.device);
    let mut deployer = env.deployer(&installer);
    let outcome = deployer.install(&spec(&[base], 1)).unwrap();

    assert_eq!(
        outcome,
        InstallOutcome::FullInstalled {
            reason: DeltaSkipReason::Disabled
        }
    );
    assert_eq!(
        deployer.metrics().names(),
        ["DELTAINSTALL:DISABLED", "INSTALL:OK"]
    );
    assert_eq!(env.device.installed_version(APP), Some(1));
    // Forced installs never query the installed package
    assert!(env.device.commands_containing(" path ").is_empty());
}

#[test]
fn test_unknown_package_falls_back_to_full_install() {
    let env = TestEnv::new(30);
    let base = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));

    let installer = PackageManagerInstaller::new(&env.device);
    let mut deployer = env.deployer(&installer);
    deployer.install(&spec(&[base], 1)).unwrap();

    assert_eq!(
        deployer.metrics().names(),
        ["DELTAINSTALL:DUMP_UNKNOWN_PACKAGE", "INSTALL:OK"]
    );
    assert_eq!(env.cache.installed_version(SERIAL, APP).unwrap(), Some(1));
    assert!(!env.cache.has_duplicate_fingerprints().unwrap());
}

#[test]
fn test_code_change_writes_only_modified_unit() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base_v1 = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));
    let split = env.apk("v1", "split_feature.apk", &split_apk(b"feature"));
    env.deployer(&installer)
        .install(&spec(&[base_v1, split.clone()], 1))
        .unwrap();
    env.device.clear_history();

    let base_v2 = env.apk("v2", "base.apk", &app_apk(1, b"main v2"));
    let mut deployer = env.deployer(&installer);
    let outcome = deployer.install(&spec(&[base_v2.clone(), split.clone()], 1)).unwrap();

    assert_eq!(outcome, InstallOutcome::DeltaInstalled);
    assert_eq!(
        deployer.metrics().names(),
        [
            "DELTAINSTALL_UPLOAD",
            "DELTAINSTALL_INSTALL",
            "DELTAINSTALL:SUCCESS"
        ]
    );
    assert_eq!(env.device.written_units(), ["base.apk"]);

    let creates = env.device.commands_containing("install-create");
    assert_eq!(creates.len(), 1);
    assert!(creates[0].starts_with("cmd package install-create"));
    assert!(creates[0].contains(&format!("-p {APP}")));

    // What the device holds now is byte-identical to the local files
    let installed = env.device.installed(APP).unwrap();
    assert_eq!(installed["base.apk"], std::fs::read(&base_v2).unwrap());
    assert_eq!(installed["split_feature.apk"], std::fs::read(&split).unwrap());
}

#[test]
fn test_split_only_change_inherits_base() {
    let env = TestEnv::new(29);
    let installer = PackageManagerInstaller::new(&env.device);

    let base = env.apk("v1", "base.apk", &app_apk(1, b"main"));
    let split_v1 = env.apk("v1", "split_feature.apk", &split_apk(b"feature v1"));
    env.deployer(&installer)
        .install(&spec(&[base.clone(), split_v1], 1))
        .unwrap();
    env.device.clear_history();

    let split_v2 = env.apk("v2", "split_feature.apk", &split_apk(b"feature v2"));
    let outcome = env
        .deployer(&installer)
        .install(&spec(&[base, split_v2.clone()], 1))
        .unwrap();

    assert_eq!(outcome, InstallOutcome::DeltaInstalled);
    assert_eq!(env.device.written_units(), ["split_feature.apk"]);
    assert_eq!(
        env.device.installed(APP).unwrap()["split_feature.apk"],
        std::fs::read(&split_v2).unwrap()
    );
}

#[test]
fn test_same_content_reinstall_creates_no_session() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);
    let base = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));

    env.deployer(&installer)
        .install(&spec(&[base.clone()], 1))
        .unwrap();
    env.device.start_process(APP, 4242);
    env.device.clear_history();

    let mut deployer = env.deployer(&installer);
    let outcome = deployer.install(&spec(&[base], 1)).unwrap();

    assert_eq!(outcome, InstallOutcome::Skipped);
    assert_eq!(deployer.metrics().names(), ["INSTALL:SKIPPED_INSTALL"]);
    assert!(env.device.commands_containing("install-create").is_empty());
    assert_eq!(
        env.device.commands_containing("am force-stop"),
        [format!("am force-stop {APP}")]
    );
}

#[test]
fn test_lower_version_rejected_by_device_after_single_prompt() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base_v2 = env.apk("v2", "base.apk", &app_apk(2, b"main v2"));
    env.deployer(&installer)
        .install(&spec(&[base_v2], 2))
        .unwrap();

    env.ui.answer(false);
    let base_v1 = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));
    let mut deployer = env.deployer(&installer);
    let err = deployer.install(&spec(&[base_v1], 1)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InstallFailed);
    assert_eq!(err.device_status(), Some("INSTALL_FAILED_VERSION_DOWNGRADE"));
    assert_eq!(err.failure_class(), FailureClass::RejectedAtCommit);
    assert_eq!(env.ui.prompt_count(), 1);
    assert_eq!(
        deployer.metrics().names().last().map(String::as_str),
        Some("DELTAINSTALL:ERROR.INSTALL_FAILED_VERSION_DOWNGRADE")
    );
    assert_eq!(env.device.installed_version(APP), Some(2));
    // The failed delta is not retried as a full install
    assert_eq!(env.device.commands_containing("install-commit").len(), 2);
}

#[test]
fn test_confirmed_downgrade_uninstalls_then_installs_in_full() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base_v2 = env.apk("v2", "base.apk", &app_apk(2, b"main v2"));
    env.deployer(&installer)
        .install(&spec(&[base_v2], 2))
        .unwrap();

    env.ui.answer(true);
    let base_v1 = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));
    let mut deployer = env.deployer(&installer);
    let outcome = deployer.install(&spec(&[base_v1], 1)).unwrap();

    assert_eq!(
        outcome,
        InstallOutcome::FullInstalled {
            reason: DeltaSkipReason::Downgrade
        }
    );
    assert_eq!(
        deployer.metrics().names(),
        ["UNINSTALL:OK", "DELTAINSTALL:DOWNGRADE", "INSTALL:OK"]
    );
    assert_eq!(env.ui.prompt_count(), 1);
    assert_eq!(env.device.installed_version(APP), Some(1));
    assert_eq!(env.cache.installed_version(SERIAL, APP).unwrap(), Some(1));
}

#[test]
fn test_added_split_forces_full_install() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base = env.apk("v1", "base.apk", &app_apk(1, b"main"));
    env.deployer(&installer)
        .install(&spec(&[base.clone()], 1))
        .unwrap();

    let split = env.apk("v2", "split_feature.apk", &split_apk(b"feature"));
    let mut deployer = env.deployer(&installer);
    let outcome = deployer.install(&spec(&[base, split], 1)).unwrap();

    assert_eq!(
        outcome,
        InstallOutcome::FullInstalled {
            reason: DeltaSkipReason::CannotGenerateDelta
        }
    );
    assert_eq!(
        deployer.metrics().names(),
        ["DELTAINSTALL:CANNOT_GENERATE_DELTA", "INSTALL:OK"]
    );
    assert_eq!(env.device.installed(APP).unwrap().len(), 2);
}

#[test]
fn test_removed_split_forces_full_install() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base = env.apk("v1", "base.apk", &app_apk(1, b"main"));
    let split = env.apk("v1", "split_feature.apk", &split_apk(b"feature"));
    env.deployer(&installer)
        .install(&spec(&[base.clone(), split], 1))
        .unwrap();

    let mut deployer = env.deployer(&installer);
    deployer.install(&spec(&[base], 1)).unwrap();

    assert_eq!(
        deployer.metrics().names(),
        ["DELTAINSTALL:CANNOT_GENERATE_DELTA", "INSTALL:OK"]
    );
    let installed = env.device.installed(APP).unwrap();
    assert_eq!(installed.keys().collect::<Vec<_>>(), ["base.apk"]);
}

#[test]
fn test_split_added_below_multi_apk_floor() {
    let env = TestEnv::new(19);
    let installer = PackageManagerInstaller::new(&env.device);

    let base = env.apk("v1", "base.apk", &app_apk(1, b"main"));
    let mut deployer = env.deployer(&installer);
    deployer.install(&spec(&[base.clone()], 1)).unwrap();
    assert_eq!(
        deployer.metrics().names(),
        ["DELTAINSTALL:API_NOT_SUPPORTED", "INSTALL:OK"]
    );
    assert_eq!(env.device.commands_containing("pm install -r -t").len(), 1);
    env.device.clear_history();

    let split = env.apk("v2", "split_feature.apk", &split_apk(b"feature"));
    let mut deployer = env.deployer(&installer);
    let err = deployer.install(&spec(&[base, split], 1)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MultiApksNotSupportedBelow21);
    assert_eq!(
        deployer.metrics().names(),
        [
            "DELTAINSTALL:API_NOT_SUPPORTED",
            "INSTALL:MULTI_APKS_NO_SUPPORTED_BELOW21"
        ]
    );
    assert!(env.device.history().is_empty());
}

#[test]
fn test_legacy_dialect_full_install() {
    let env = TestEnv::new(23);
    let installer = PackageManagerInstaller::new(&env.device);

    let base = env.apk("v1", "base.apk", &app_apk(1, b"main"));
    let split = env.apk("v1", "split_feature.apk", &split_apk(b"feature"));
    let mut deployer = env.deployer(&installer);
    deployer.install(&spec(&[base, split], 1)).unwrap();

    assert_eq!(
        deployer.metrics().names(),
        ["DELTAINSTALL:API_NOT_SUPPORTED", "INSTALL:OK"]
    );
    let creates = env.device.commands_containing("install-create");
    assert_eq!(creates, ["pm install-create -t -r"]);
    assert_eq!(env.device.written_units(), ["base.apk", "split_feature.apk"]);
}

#[test]
fn test_dump_tier_delta_install() {
    let env = TestEnv::new(26);
    let installer = PackageManagerInstaller::new(&env.device);

    let base_v1 = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));
    env.deployer(&installer)
        .install(&spec(&[base_v1], 1))
        .unwrap();
    env.device.clear_history();

    let base_v2 = env.apk("v2", "base.apk", &app_apk(1, b"main v2"));
    let outcome = env
        .deployer(&installer)
        .install(&spec(&[base_v2], 1))
        .unwrap();

    assert_eq!(outcome, InstallOutcome::DeltaInstalled);
    assert_eq!(
        env.device.commands_containing(" dump "),
        [format!("cmd package dump {APP}")]
    );
    assert!(env.device.commands_containing("path").is_empty());
}

#[test]
fn test_unacknowledged_write_abandons_session() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base_v1 = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));
    env.deployer(&installer)
        .install(&spec(&[base_v1.clone()], 1))
        .unwrap();
    env.device.state.borrow_mut().fail_writes = true;

    let base_v2 = env.apk("v2", "base.apk", &app_apk(1, b"main v2"));
    let mut deployer = env.deployer(&installer);
    let err = deployer.install(&spec(&[base_v2], 1)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SessionWriteFailed);
    assert!(err.is_partial_apply());
    assert_eq!(
        deployer.metrics().names().last().map(String::as_str),
        Some("DELTAINSTALL:ERROR.DELTAINSTALL_WRITE_FAILED")
    );
    assert_eq!(env.device.open_sessions(), 0);
    assert_eq!(
        env.device.installed(APP).unwrap()["base.apk"],
        std::fs::read(&base_v1).unwrap()
    );
}

#[test]
fn test_install_records_follow_device() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base_v1 = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));
    env.deployer(&installer)
        .install(&spec(&[base_v1], 1))
        .unwrap();
    let base_v2 = env.apk("v2", "base.apk", &app_apk(2, b"main v2"));
    env.deployer(&installer)
        .install(&spec(&[base_v2.clone()], 2))
        .unwrap();

    let record = env
        .cache
        .installed_unit(SERIAL, APP, &swapdeploy::UnitName::Base)
        .unwrap()
        .unwrap();
    let local = env.cache.analyze(&base_v2).unwrap();
    assert_eq!(record.fingerprint, local.fingerprint.to_string());
    assert_eq!(record.version_code, Some(2));
    assert!(env.cache.lookup(&local.fingerprint).unwrap().is_some());
    assert!(!env.cache.has_duplicate_fingerprints().unwrap());
}

fn downgrade_on_legacy_device(api_level: u32, answer: bool) -> (TestEnv, Vec<String>) {
    let env = TestEnv::new(api_level);
    let installer = PackageManagerInstaller::new(&env.device);

    let base_v2 = env.apk("v2", "base.apk", &app_apk(2, b"main v2"));
    env.deployer(&installer)
        .install(&spec(&[base_v2], 2))
        .unwrap();

    env.ui.answer(answer);
    let base_v1 = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));
    let mut deployer = env.deployer(&installer);
    let result = deployer.install(&spec(&[base_v1], 1));
    let names = deployer.metrics().names();
    drop(deployer);

    match (answer, result) {
        (false, Err(err)) => {
            assert_eq!(err.kind(), ErrorKind::InstallFailed);
            assert_eq!(err.device_status(), Some("INSTALL_FAILED_VERSION_DOWNGRADE"));
        }
        (true, Ok(outcome)) => assert_eq!(
            outcome,
            InstallOutcome::FullInstalled {
                reason: DeltaSkipReason::Downgrade
            }
        ),
        (answer, result) => panic!("answer {answer} gave {result:?}"),
    }
    (env, names)
}

#[test]
fn test_legacy_device_downgrade_prompts_once() {
    for api_level in [19, 23] {
        let (env, names) = downgrade_on_legacy_device(api_level, false);
        assert_eq!(env.ui.prompt_count(), 1, "API {api_level}");
        assert_eq!(
            names,
            [
                "DELTAINSTALL:API_NOT_SUPPORTED",
                "INSTALL:INSTALL_FAILED_VERSION_DOWNGRADE"
            ],
            "API {api_level}"
        );
        assert_eq!(env.device.installed_version(APP), Some(2));
        assert_eq!(env.cache.installed_version(SERIAL, APP).unwrap(), Some(2));
    }
}

#[test]
fn test_legacy_device_confirmed_downgrade() {
    for api_level in [19, 23] {
        let (env, names) = downgrade_on_legacy_device(api_level, true);
        assert_eq!(env.ui.prompt_count(), 1, "API {api_level}");
        assert_eq!(
            names,
            ["UNINSTALL:OK", "DELTAINSTALL:DOWNGRADE", "INSTALL:OK"],
            "API {api_level}"
        );
        assert_eq!(env.device.installed_version(APP), Some(1));
        assert_eq!(env.cache.installed_version(SERIAL, APP).unwrap(), Some(1));
    }
}

#[test]
fn test_unchanged_content_at_lower_version_is_refused() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base = env.apk("v2", "base.apk", &app_apk(2, b"main v2"));
    env.deployer(&installer)
        .install(&spec(&[base.clone()], 2))
        .unwrap();
    env.device.clear_history();

    env.ui.answer(false);
    let mut deployer = env.deployer(&installer);
    let err = deployer.install(&spec(&[base], 1)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InstallFailed);
    assert_eq!(err.device_status(), Some("INSTALL_FAILED_VERSION_DOWNGRADE"));
    assert_eq!(env.ui.prompt_count(), 1);
    assert_eq!(
        deployer.metrics().names(),
        ["DELTAINSTALL:ERROR.INSTALL_FAILED_VERSION_DOWNGRADE"]
    );
    assert!(env.device.commands_containing("install-create").is_empty());
    assert_eq!(env.cache.installed_version(SERIAL, APP).unwrap(), Some(2));
}

#[test]
fn test_write_timeout_abandons_session() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base_v1 = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));
    env.deployer(&installer)
        .install(&spec(&[base_v1.clone()], 1))
        .unwrap();
    env.device.state.borrow_mut().timeout_on = Some("install-write".to_string());

    let base_v2 = env.apk("v2", "base.apk", &app_apk(1, b"main v2"));
    let mut deployer = env.deployer(&installer);
    let err = deployer.install(&spec(&[base_v2], 1)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DeviceTimeout);
    assert_eq!(
        deployer.metrics().names().last().map(String::as_str),
        Some("DELTAINSTALL:ERROR.DEVICE_TIMEOUT")
    );
    assert_eq!(env.device.open_sessions(), 0);
    assert_eq!(env.device.commands_containing("install-abandon").len(), 1);
    assert_eq!(
        env.device.installed(APP).unwrap()["base.apk"],
        std::fs::read(&base_v1).unwrap()
    );
}

#[test]
fn test_commit_timeout_abandons_session() {
    let env = TestEnv::new(30);
    let installer = PackageManagerInstaller::new(&env.device);

    let base_v1 = env.apk("v1", "base.apk", &app_apk(1, b"main v1"));
    env.deployer(&installer)
        .install(&spec(&[base_v1], 1))
        .unwrap();
    env.device.state.borrow_mut().timeout_on = Some("install-commit".to_string());

    let base_v2 = env.apk("v2", "base.apk", &app_apk(1, b"main v2"));
    let err = env
        .deployer(&installer)
        .install(&spec(&[base_v2], 1))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DeviceTimeout);
    assert_eq!(env.device.open_sessions(), 0);
    assert_eq!(env.device.commands_containing("install-abandon").len(), 1);
}

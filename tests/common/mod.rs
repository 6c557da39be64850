// tests/common/mod.rs

//! Shared test fixtures: an emulated device, a scripted prompt, an agent
//! double and an APK builder.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use swapdeploy::apk::MANIFEST_ENTRY;
use swapdeploy::cache::ArtifactCache;
use swapdeploy::db::paths;
use swapdeploy::device::{Device, DeviceError, ShellOutput};
use swapdeploy::hash;
use swapdeploy::session::FullInstaller;
use swapdeploy::swap::{AgentClient, AgentError, AttachRequest, ClassOutcome, TransformMode};
use swapdeploy::ui::UiService;
use swapdeploy::{Deployer, DeployerOptions};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const SERIAL: &str = "emulator-5554";
pub const APP: &str = "com.example.app";

// =============================================================================
// APK builder
// =============================================================================

/// Builds small but well-formed APKs
///
/// The manifest is plain text (`package=<id> versionCode=<n>`), which is all
/// the emulated package manager reads from it.
#[derive(Debug, Clone)]
pub struct ApkBuilder {
    entries: Vec<(String, Vec<u8>, bool)>,
}

impl ApkBuilder {
    pub fn new(package: &str, version_code: i64) -> Self {
        let manifest = format!("package={package} versionCode={version_code}");
        Self {
            entries: vec![(MANIFEST_ENTRY.to_string(), manifest.into_bytes(), false)],
        }
    }

    /// Add a deflated dex segment
    pub fn dex(mut self, name: &str, content: &[u8]) -> Self {
        self.entries.push((name.to_string(), content.to_vec(), true));
        self
    }

    /// Add a stored resource entry
    pub fn resource(mut self, name: &str, content: &[u8]) -> Self {
        self.entries.push((name.to_string(), content.to_vec(), false));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content, deflate) in &self.entries {
            let method = if *deflate {
                CompressionMethod::Deflated
            } else {
                CompressionMethod::Stored
            };
            zip.start_file(
                name.as_str(),
                SimpleFileOptions::default().compression_method(method),
            )
            .unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    pub fn write_to(&self, path: &Path) -> PathBuf {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, self.build()).unwrap();
        path.to_path_buf()
    }
}

/// Package id and version code from an APK's text manifest
pub fn manifest_identity(apk: &[u8]) -> Option<(String, i64)> {
    let mut zip = ZipArchive::new(Cursor::new(apk)).ok()?;
    let mut text = String::new();
    zip.by_name(MANIFEST_ENTRY)
        .ok()?
        .read_to_string(&mut text)
        .ok()?;

    let mut package = None;
    let mut version = None;
    for token in text.split_whitespace() {
        if let Some(value) = token.strip_prefix("package=") {
            package = Some(value.to_string());
        }
        if let Some(value) = token.strip_prefix("versionCode=") {
            version = value.parse().ok();
        }
    }
    Some((package?, version?))
}

// =============================================================================
// Emulated device
// =============================================================================

#[derive(Debug, Default)]
struct FakeSession {
    inherit: Option<String>,
    dont_kill: bool,
    written: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct DeviceState {
    /// Installed APKs per package, keyed by file name
    pub packages: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    /// Files pushed under /data/local/tmp
    pub files: HashMap<String, Vec<u8>>,
    pub running: HashMap<String, u32>,
    pub history: Vec<String>,
    pub pushes: Vec<String>,
    sessions: HashMap<u32, FakeSession>,
    next_session: u32,
    pub fail_writes: bool,
    pub fail_commit: Option<String>,
    /// Commands containing this text time out instead of running
    pub timeout_on: Option<String>,
}

/// Device that emulates the package manager, session protocol and helper
pub struct FakeDevice {
    api_level: u32,
    pub state: RefCell<DeviceState>,
}

fn ok(stdout: impl Into<String>) -> ShellOutput {
    ShellOutput::new(stdout, 0)
}

fn fail(stdout: impl Into<String>) -> ShellOutput {
    ShellOutput::new(stdout, 1)
}

fn code_path(package: &str) -> String {
    format!("/data/app/{package}-1")
}

impl FakeDevice {
    pub fn new(api_level: u32) -> Self {
        Self {
            api_level,
            state: RefCell::new(DeviceState {
                next_session: 1000,
                ..DeviceState::default()
            }),
        }
    }

    /// Install APKs without going through the deployer
    pub fn install_directly(&self, package: &str, apks: &[(&str, Vec<u8>)]) {
        let apks = apks
            .iter()
            .map(|(name, bytes)| (name.to_string(), bytes.clone()))
            .collect();
        self.state
            .borrow_mut()
            .packages
            .insert(package.to_string(), apks);
    }

    pub fn start_process(&self, package: &str, pid: u32) {
        self.state
            .borrow_mut()
            .running
            .insert(package.to_string(), pid);
    }

    pub fn installed(&self, package: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.state.borrow().packages.get(package).cloned()
    }

    pub fn installed_version(&self, package: &str) -> Option<i64> {
        let state = self.state.borrow();
        let base = state.packages.get(package)?.get("base.apk")?;
        manifest_identity(base).map(|(_, version)| version)
    }

    pub fn history(&self) -> Vec<String> {
        self.state.borrow().history.clone()
    }

    /// Forget recorded commands and pushes, keeping installed state
    pub fn clear_history(&self) {
        let mut state = self.state.borrow_mut();
        state.history.clear();
        state.pushes.clear();
    }

    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.history()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }

    /// Unit file names written with `install-write`, in order
    pub fn written_units(&self) -> Vec<String> {
        self.commands_containing(" install-write ")
            .iter()
            .filter_map(|command| {
                let tokens: Vec<&str> = command.split_whitespace().collect();
                let at = tokens.iter().position(|t| *t == "install-write")?;
                tokens.get(at + 4).map(|name| name.to_string())
            })
            .collect()
    }

    pub fn pushes_ending_with(&self, suffix: &str) -> usize {
        self.state
            .borrow()
            .pushes
            .iter()
            .filter(|p| p.ends_with(suffix))
            .count()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.borrow().sessions.len()
    }

    fn handle(&self, state: &mut DeviceState, command: &str) -> ShellOutput {
        if let Some(rest) = command
            .strip_prefix("cmd package ")
            .or_else(|| command.strip_prefix("pm "))
        {
            return self.package_manager(state, rest);
        }

        let args: Vec<&str> = command.split_whitespace().collect();
        match args.as_slice() {
            ["stat", "-c", "'%s", "%n'", paths @ ..] => stat(state, paths),
            ["pidof", package] => match state.running.get(*package) {
                Some(pid) => ok(format!("{pid}\n")),
                None => fail(""),
            },
            ["rm", "-f", path] => {
                state.files.remove(*path);
                ok("")
            }
            ["rm", "-rf", dir] => {
                let prefix = format!("{dir}/");
                state.files.retain(|path, _| !path.starts_with(&prefix));
                ok("")
            }
            ["mkdir", ..] | ["chmod", ..] | ["run-as", ..] => ok(""),
            ["am", "force-stop", package] => {
                state.running.remove(*package);
                ok("")
            }
            [installer, version, "version"] if installer.ends_with("/installer") => {
                let expected = version.strip_prefix("-version=").unwrap_or_default();
                match state.files.get(*installer) {
                    Some(bytes) if hash::sha256(bytes).short(16) == expected => {
                        ok(format!("{expected}\n"))
                    }
                    Some(_) => ShellOutput::new("version mismatch\n", 2),
                    None => ShellOutput::new(format!("{installer}: not found\n"), 127),
                }
            }
            _ => ShellOutput::new(format!("unknown command: {command}\n"), 127),
        }
    }

    fn package_manager(&self, state: &mut DeviceState, rest: &str) -> ShellOutput {
        let args: Vec<&str> = rest.split_whitespace().collect();
        match args.as_slice() {
            ["path", package] => match state.packages.get(*package) {
                Some(apks) => ok(apks
                    .keys()
                    .map(|name| format!("package:{}/{name}\n", code_path(package)))
                    .collect::<String>()),
                None => fail(""),
            },
            ["dump", package] => match state.packages.get(*package) {
                Some(apks) => {
                    let version = apks
                        .get("base.apk")
                        .and_then(|base| manifest_identity(base))
                        .map_or(0, |(_, version)| version);
                    ok(format!(
                        "Packages:\n  Package [{package}] (4a2b19c):\n    userId=10123\n    \
                         versionCode={version} minSdk=21 targetSdk=30\n    \
                         codePath={}\n    resourcePath={}\n",
                        code_path(package),
                        code_path(package)
                    ))
                }
                None => ok("Dexopt state:\n"),
            },
            ["install-create", flags @ ..] => {
                let mut session = FakeSession::default();
                let mut flags = flags.iter();
                while let Some(flag) = flags.next() {
                    match *flag {
                        "-p" => session.inherit = flags.next().map(|p| p.to_string()),
                        "--dont-kill" => session.dont_kill = true,
                        _ => {}
                    }
                }
                let id = state.next_session;
                state.next_session += 1;
                state.sessions.insert(id, session);
                ok(format!("Success: created install session [{id}]\n"))
            }
            ["install-write", "-S", size, id, name, remote] => {
                if state.fail_writes {
                    return fail("Failure [INSTALL_FAILED_MEDIA_UNAVAILABLE: write failed]\n");
                }
                let Some(bytes) = state.files.get(*remote).cloned() else {
                    return fail(format!("Failure [No such file: {remote}]\n"));
                };
                if size.parse::<usize>().ok() != Some(bytes.len()) {
                    return fail("Failure [INSTALL_FAILED_INVALID_APK: size mismatch]\n");
                }
                match id.parse().ok().and_then(|id: u32| state.sessions.get_mut(&id)) {
                    Some(session) => {
                        session.written.insert(name.to_string(), bytes.clone());
                        ok(format!("Success: streamed {} bytes\n", bytes.len()))
                    }
                    None => fail("Failure [unknown session]\n"),
                }
            }
            ["install-commit", id] => {
                let Some(session) = id.parse().ok().and_then(|id: u32| state.sessions.remove(&id))
                else {
                    return fail("Failure [unknown session]\n");
                };
                if let Some(code) = state.fail_commit.clone() {
                    return fail(format!("Failure [{code}: injected]\n"));
                }
                let mut apks = match &session.inherit {
                    Some(package) => match state.packages.get(package) {
                        Some(apks) => apks.clone(),
                        None => {
                            return fail(
                                "Failure [INSTALL_FAILED_INVALID_APK: nothing to inherit]\n",
                            );
                        }
                    },
                    None => BTreeMap::new(),
                };
                apks.extend(session.written);
                commit_package(state, apks, session.dont_kill)
            }
            ["install-abandon", id] => {
                match id.parse().ok().and_then(|id: u32| state.sessions.remove(&id)) {
                    Some(_) => ok("Success\n"),
                    None => fail("Failure [unknown session]\n"),
                }
            }
            ["install", "-r", "-t", remote] => match state.files.get(*remote).cloned() {
                Some(bytes) => {
                    let mut apks = BTreeMap::new();
                    apks.insert("base.apk".to_string(), bytes);
                    commit_package(state, apks, false)
                }
                None => fail("Failure [INSTALL_FAILED_INVALID_URI]\n"),
            },
            ["uninstall", package] => match state.packages.remove(*package) {
                Some(_) => {
                    state.running.remove(*package);
                    ok("Success\n")
                }
                None => fail("Failure [DELETE_FAILED_INTERNAL_ERROR]\n"),
            },
            _ => ShellOutput::new(format!("Unknown command: {rest}\n"), 255),
        }
    }
}

fn stat(state: &DeviceState, paths: &[&str]) -> ShellOutput {
    let mut out = String::new();
    for path in paths {
        let (dir, pattern) = path.rsplit_once('/').unwrap_or(("", path));
        for (package, apks) in &state.packages {
            if code_path(package) != dir {
                continue;
            }
            for (name, bytes) in apks {
                if pattern == "*.apk" || pattern == name {
                    out.push_str(&format!("{} {dir}/{name}\n", bytes.len()));
                }
            }
        }
    }
    if out.is_empty() {
        return fail("stat: No such file or directory\n");
    }
    ok(out)
}

fn commit_package(
    state: &mut DeviceState,
    apks: BTreeMap<String, Vec<u8>>,
    dont_kill: bool,
) -> ShellOutput {
    let Some((package, version)) = apks.get("base.apk").and_then(|base| manifest_identity(base))
    else {
        return fail("Failure [INSTALL_FAILED_INVALID_APK: missing base]\n");
    };

    let installed = state
        .packages
        .get(&package)
        .and_then(|apks| apks.get("base.apk"))
        .and_then(|base| manifest_identity(base))
        .map(|(_, version)| version);
    if let Some(installed) = installed
        && version < installed
    {
        return fail(format!(
            "Failure [INSTALL_FAILED_VERSION_DOWNGRADE: Downgrade detected: {version} < {installed}]\n"
        ));
    }

    if !dont_kill {
        state.running.remove(&package);
    }
    state.packages.insert(package, apks);
    ok("Success\n")
}

impl Device for FakeDevice {
    fn serial(&self) -> &str {
        SERIAL
    }

    fn api_level(&self) -> u32 {
        self.api_level
    }

    fn exec(&self, command: &str) -> Result<ShellOutput, DeviceError> {
        let mut state = self.state.borrow_mut();
        state.history.push(command.to_string());
        if let Some(needle) = &state.timeout_on
            && command.contains(needle.as_str())
        {
            return Err(DeviceError::Timeout {
                command: command.to_string(),
                seconds: 30,
            });
        }
        Ok(self.handle(&mut state, command))
    }

    fn push(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        let bytes = std::fs::read(local)?;
        let mut state = self.state.borrow_mut();
        state.pushes.push(remote.to_string());
        state.files.insert(remote.to_string(), bytes);
        Ok(())
    }

    fn pull(&self, remote: &str) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.borrow();
        if let Some(bytes) = state.files.get(remote) {
            return Ok(bytes.clone());
        }
        let (dir, name) = remote.rsplit_once('/').unwrap_or(("", remote));
        state
            .packages
            .iter()
            .find(|(package, _)| code_path(package) == dir)
            .and_then(|(_, apks)| apks.get(name).cloned())
            .ok_or_else(|| {
                DeviceError::Transport(format!("remote object '{remote}' does not exist"))
            })
    }
}

// =============================================================================
// Prompt and agent doubles
// =============================================================================

/// Prompt with a fixed answer that remembers every question
#[derive(Default)]
pub struct FakeUi {
    answer: Cell<bool>,
    pub questions: RefCell<Vec<String>>,
}

impl FakeUi {
    pub fn answer(&self, answer: bool) {
        self.answer.set(answer);
    }

    pub fn prompt_count(&self) -> usize {
        self.questions.borrow().len()
    }
}

impl UiService for FakeUi {
    fn prompt(&self, message: &str) -> bool {
        self.questions.borrow_mut().push(message.to_string());
        self.answer.get()
    }
}

/// Class that the agent reports for a dex segment
pub fn class_for(package: &str, entry_name: &str) -> String {
    let stem = entry_name.trim_end_matches(".dex");
    format!("{package}.{stem}")
}

/// Agent double: cached segments are redefined, anything else retransformed
#[derive(Default)]
pub struct FakeAgent {
    pub requests: RefCell<Vec<AttachRequest>>,
    pub fail: Option<String>,
}

impl AgentClient for FakeAgent {
    fn attach(&self, request: &AttachRequest) -> Result<Vec<ClassOutcome>, AgentError> {
        self.requests.borrow_mut().push(request.clone());
        if let Some(reason) = &self.fail {
            return Err(AgentError::Attach(reason.clone()));
        }

        Ok(request
            .segments
            .iter()
            .map(|segment| {
                let class_name = class_for(&request.package, &segment.entry_name);
                let cached = request.cached.iter().any(|entry| {
                    entry.class_name == class_name
                        && entry.segment_fingerprint == segment.fingerprint
                });
                if cached {
                    ClassOutcome {
                        class_name,
                        segment_fingerprint: segment.fingerprint.clone(),
                        mode: TransformMode::Redefined,
                        instrumented_ref: None,
                    }
                } else {
                    ClassOutcome {
                        instrumented_ref: Some(format!(
                            "instrumented/{}",
                            segment.fingerprint.replace(':', "_")
                        )),
                        class_name,
                        segment_fingerprint: segment.fingerprint.clone(),
                        mode: TransformMode::Retransformed,
                    }
                }
            })
            .collect())
    }
}

// =============================================================================
// Test environment
// =============================================================================

/// A temp directory with a cache, an emulated device and a prompt
pub struct TestEnv {
    pub dir: TempDir,
    pub device: FakeDevice,
    pub cache: ArtifactCache,
    pub ui: FakeUi,
    pub options: DeployerOptions,
}

impl TestEnv {
    pub fn new(api_level: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let cache = ArtifactCache::open(paths::cache_db(&cache_dir)).unwrap();
        let options = DeployerOptions::default().with_cache_path(&cache_dir);

        Self {
            dir,
            device: FakeDevice::new(api_level),
            cache,
            ui: FakeUi::default(),
            options,
        }
    }

    pub fn deployer<'a>(&'a self, installer: &'a dyn FullInstaller) -> Deployer<'a> {
        Deployer::new(
            &self.device,
            &self.cache,
            &self.ui,
            installer,
            self.options.clone(),
        )
    }

    /// Write an APK under `<tmp>/<revision>/<file_name>`
    pub fn apk(&self, revision: &str, file_name: &str, builder: &ApkBuilder) -> PathBuf {
        builder.write_to(&self.dir.path().join(revision).join(file_name))
    }

    /// Directory holding a fake installer helper and agent library
    pub fn helper_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("helpers");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("installer"), b"#!/system/bin/sh\necho helper\n").unwrap();
        std::fs::write(dir.join("agent.so"), b"\x7fELF agent").unwrap();
        dir
    }
}

/// Base APK of the example app at `version` with the given main dex content
pub fn app_apk(version: i64, classes: &[u8]) -> ApkBuilder {
    ApkBuilder::new(APP, version)
        .dex("classes.dex", classes)
        .dex("classes2.dex", b"library code")
        .resource("res/layout/main.xml", b"<LinearLayout/>")
        .resource("resources.arsc", b"table")
}

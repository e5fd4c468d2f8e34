use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bench_core::config::check_keys;
use bench_core::variables::scalar_text;
use bench_core::{ensure_dir, sha256_file, ConfigError, Expander, Scope, VarValue, VariableSpace};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::definitions::InputDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub status: String,
    pub success: bool,
    pub stderr_tail: String,
}

pub trait CommandRunner: Send + Sync {
    /// Runs `command` through the shell in `cwd`, appending output to `log`
    /// when given.
    fn run(&self, command: &str, cwd: &Path, log: Option<&Path>) -> Result<CommandOutcome>;
}

#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, cwd: &Path, log: Option<&Path>) -> Result<CommandOutcome> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).current_dir(cwd);
        cmd.stdin(Stdio::null());
        match log {
            Some(log) => {
                if let Some(parent) = log.parent() {
                    ensure_dir(parent)?;
                }
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log)
                    .with_context(|| format!("failed to open log {}", log.display()))?;
                cmd.stdout(Stdio::from(file.try_clone()?));
                cmd.stderr(Stdio::piped());
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::piped());
            }
        }
        debug!(shell = %self.shell, cwd = %cwd.display(), %command, "running command");
        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn {}", self.shell))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(log) = log {
            if !stderr.is_empty() {
                use std::io::Write;
                let mut file = fs::OpenOptions::new().append(true).open(log)?;
                file.write_all(stderr.as_bytes())?;
            }
        }
        let stderr_tail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string();
        Ok(CommandOutcome {
            status: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            success: output.status.success(),
            stderr_tail,
        })
    }
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Copies the tree under `src` to `dst`, skipping relative paths that
/// start with any of `exclude`. Symlinks are followed.
pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    let walker = walkdir::WalkDir::new(src)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(src).unwrap_or(e.path());
            rel.as_os_str().is_empty() || !exclude.iter().any(|ex| rel.starts_with(ex))
        });
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(src)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target)
                .with_context(|| format!("failed to copy {}", path.display()))?;
        }
    }
    Ok(())
}

pub trait InputFetcher: Send + Sync {
    fn fetch(&self, input: &InputDefinition, url: &str, dest: &Path) -> Result<()>;
}

/// Copies local inputs and hands remote ones to a configured command
/// template such as `curl -sSL -o {dest} {url}`.
pub struct DefaultFetcher {
    runner: Arc<dyn CommandRunner>,
    fetch_command: Option<String>,
}

impl DefaultFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>, fetch_command: Option<String>) -> Self {
        Self {
            runner,
            fetch_command,
        }
    }

    fn fetch_remote(&self, url: &str, dest: &Path) -> Result<()> {
        let template = self
            .fetch_command
            .as_deref()
            .ok_or_else(|| anyhow!("no fetch command configured for remote input {}", url))?;
        let mut space = VariableSpace::new();
        space.define(Scope::Generated, "url", VarValue::scalar(shell_quote(url)));
        space.define(
            Scope::Generated,
            "dest",
            VarValue::scalar(shell_quote(&dest.to_string_lossy())),
        );
        let command = Expander::new(&space).expand(template)?;
        let cwd = dest.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(cwd)?;
        let outcome = self.runner.run(&command, cwd, None)?;
        if !outcome.success {
            return Err(anyhow!(
                "fetching {} failed with status {}: {}",
                url,
                outcome.status,
                outcome.stderr_tail
            ));
        }
        Ok(())
    }
}

impl InputFetcher for DefaultFetcher {
    fn fetch(&self, input: &InputDefinition, url: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            debug!(input = %input.name, dest = %dest.display(), "input already present");
        } else {
            let local = Path::new(url.strip_prefix("file://").unwrap_or(url));
            if local.is_dir() {
                copy_dir_filtered(local, dest, &[])?;
            } else if local.is_file() {
                if let Some(parent) = dest.parent() {
                    ensure_dir(parent)?;
                }
                fs::copy(local, dest)
                    .with_context(|| format!("failed to copy input {}", local.display()))?;
            } else {
                self.fetch_remote(url, dest)?;
            }
            info!(input = %input.name, dest = %dest.display(), "fetched input");
        }
        if let Some(expected) = &input.sha256 {
            if dest.is_file() {
                let actual = sha256_file(dest)?;
                if !actual.eq_ignore_ascii_case(expected) {
                    let _ = fs::remove_file(dest);
                    return Err(anyhow!(
                        "checksum mismatch for input {}: expected {}, got {}",
                        input.name,
                        expected,
                        actual
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSpec {
    pub name: String,
    pub spec: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SoftwareEnvironment {
    pub name: String,
    pub packages: Vec<PackageSpec>,
}

/// The `software:` block: named packages and the environments built from
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftwareConfig {
    packages: BTreeMap<String, String>,
    environments: BTreeMap<String, Vec<String>>,
}

impl SoftwareConfig {
    pub fn from_json(value: Option<&Value>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let Some(value) = value else {
            return Ok(config);
        };
        check_keys("/bench/software", value, &["packages", "environments"])?;
        if let Some(Value::Object(packages)) = value.get("packages") {
            for (name, body) in packages {
                let path = format!("/bench/software/packages/{}", name);
                check_keys(&path, body, &["spec"])?;
                let spec = body
                    .get("spec")
                    .and_then(scalar_text)
                    .unwrap_or_else(|| name.clone());
                config.packages.insert(name.clone(), spec);
            }
        }
        if let Some(Value::Object(envs)) = value.get("environments") {
            for (name, body) in envs {
                let path = format!("/bench/software/environments/{}", name);
                check_keys(&path, body, &["packages"])?;
                let packages = bench_core::config::string_list(
                    &format!("{}/packages", path),
                    body.get("packages"),
                )?;
                for package in &packages {
                    if !config.packages.contains_key(package) {
                        return Err(ConfigError::new(
                            format!("{}/packages", path),
                            format!("unknown package '{}'", package),
                        ));
                    }
                }
                config.environments.insert(name.clone(), packages);
            }
        }
        Ok(config)
    }

    /// The environment called `name`; unknown names are empty
    /// environments.
    pub fn environment(&self, name: &str) -> SoftwareEnvironment {
        SoftwareEnvironment {
            name: name.to_string(),
            packages: self
                .environments
                .get(name)
                .map(|names| {
                    names
                        .iter()
                        .map(|pkg| PackageSpec {
                            name: pkg.clone(),
                            spec: self.packages.get(pkg).cloned().unwrap_or_else(|| pkg.clone()),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

pub trait PackageManager: Send + Sync {
    fn name(&self) -> &str;
    /// Builds `env` under `root` and returns each package's install path.
    fn create_env(&self, env: &SoftwareEnvironment, root: &Path) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryPackageManager;

impl PackageManager for DirectoryPackageManager {
    fn name(&self) -> &str {
        "directory"
    }

    fn create_env(&self, env: &SoftwareEnvironment, root: &Path) -> Result<BTreeMap<String, String>> {
        ensure_dir(root)?;
        let mut paths = BTreeMap::new();
        for package in &env.packages {
            let dir = root.join(&package.name);
            ensure_dir(&dir)?;
            paths.insert(package.name.clone(), dir.to_string_lossy().to_string());
        }
        Ok(paths)
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub fetcher: Arc<dyn InputFetcher>,
    pub package_manager: Arc<dyn PackageManager>,
}

impl Collaborators {
    pub fn local(shell: &str, fetch_command: Option<String>) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new(shell));
        Self {
            fetcher: Arc::new(DefaultFetcher::new(runner.clone(), fetch_command)),
            runner,
            package_manager: Arc::new(DirectoryPackageManager),
        }
    }
}

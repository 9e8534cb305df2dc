//! Shared helpers: external commands, size and duration parsing, naming

pub mod backoff;
pub mod index;
pub mod mount;

use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};

pub use backoff::backoff;
pub use index::Index;

/// Default per-command timeout
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(60);

static CMD_TIMEOUT_SECS: AtomicU64 = AtomicU64::new(60);

/// Set the timeout applied to every external command
pub fn set_cmd_timeout(timeout: Duration) {
    CMD_TIMEOUT_SECS.store(timeout.as_secs().max(1), Ordering::Relaxed);
}

pub fn cmd_timeout() -> Duration {
    Duration::from_secs(CMD_TIMEOUT_SECS.load(Ordering::Relaxed))
}

/// Run `binary args...` and return its stdout
///
/// A non-zero exit is a `Backend` error carrying stderr; a run longer than the
/// command timeout is killed and reported as `Timeout`.
pub fn execute(binary: &str, args: &[&str]) -> Result<String> {
    execute_with_timeout(binary, args, cmd_timeout())
}

pub fn execute_with_timeout(binary: &str, args: &[&str], timeout: Duration) -> Result<String> {
    log::debug!("Executing {} {}", binary, args.join(" "));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(async {
        let child = tokio::process::Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Backend(format!("failed to run {}: {}", binary, e)))?;

        // On timeout the child is dropped, which kills it
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(Error::Timeout(format!(
                "{} {} did not finish within {:?}",
                binary,
                args.join(" "),
                timeout
            ))),
        }
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Backend(format!(
            "{} {} failed ({}): {}{}",
            binary,
            args.join(" "),
            output.status,
            stdout.trim(),
            stderr.trim()
        )));
    }
    Ok(stdout)
}

/// Verify `binary args` reports a version of at least `min_version`
pub fn check_binary_version(binary: &str, min_version: &str, args: &[&str]) -> Result<()> {
    let output = execute(binary, args)?;
    let found = output.split_whitespace().next().unwrap_or("");
    if compare_versions(found, min_version)? == std::cmp::Ordering::Less {
        return Err(Error::InvalidArgument(format!(
            "{} version {} is older than required {}",
            binary, found, min_version
        )));
    }
    Ok(())
}

fn compare_versions(a: &str, b: &str) -> Result<std::cmp::Ordering> {
    let parse = |v: &str| -> Result<Vec<u64>> {
        v.trim()
            .split('.')
            .map(|p| {
                p.parse::<u64>()
                    .map_err(|_| Error::InvalidArgument(format!("invalid version: {}", v)))
            })
            .collect()
    };
    let (mut a, mut b) = (parse(a)?, parse(b)?);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Ok(a.cmp(&b))
}

/// Compile `pattern` once into `cell`
pub(crate) fn cached_regex(
    cell: &'static OnceLock<std::result::Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| Error::InvalidArgument(format!("bad pattern {}: {}", pattern, e)))
}

/// Parse a human size such as `100G`, `512m` or `4096`; "" is zero
pub fn parse_size(size: &str) -> Result<i64> {
    static SIZE_RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let size = size.trim();
    if size.is_empty() {
        return Ok(0);
    }

    let re = cached_regex(&SIZE_RE, r"^(\d+)([kKmMgGtT])?$")?;
    let caps = re
        .captures(size)
        .ok_or_else(|| Error::InvalidArgument(format!("invalid size {}", size)))?;
    let value: i64 = caps[1]
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid size {}", size)))?;
    let shift = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 0,
        Some(unit) => match unit.as_str() {
            "k" => 10,
            "m" => 20,
            "g" => 30,
            _ => 40,
        },
    };
    value
        .checked_mul(1i64 << shift)
        .ok_or_else(|| Error::InvalidArgument(format!("size {} overflows", size)))
}

/// Parse a duration such as `1m`, `90s` or `1h30m`
pub fn parse_duration(value: &str) -> Result<Duration> {
    static DURATION_RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let re = cached_regex(&DURATION_RE, r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$")?;

    let value = value.trim();
    let caps = re
        .captures(value)
        .filter(|_| !value.is_empty())
        .ok_or_else(|| Error::InvalidArgument(format!("invalid duration {}", value)))?;

    let mut secs = 0u64;
    for (idx, unit) in [(1, 3600u64), (2, 60), (3, 1)] {
        if let Some(m) = caps.get(idx) {
            let n: u64 = m
                .as_str()
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid duration {}", value)))?;
            secs += n * unit;
        }
    }
    Ok(Duration::from_secs(secs))
}

/// Format a duration the way `parse_duration` reads it
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{}s", s));
    }
    out
}

/// Current time as RFC 3339
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn is_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

/// Strip `prefix` and `suffix` from `name`; `None` if either is missing
pub fn extract_name<'a>(name: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?.strip_suffix(suffix)
}

pub fn extract_names(names: &[String], prefix: &str, suffix: &str) -> Vec<String> {
    names
        .iter()
        .filter_map(|n| extract_name(n, prefix, suffix))
        .map(str::to_string)
        .collect()
}

/// Volume and snapshot names: alphanumerics plus `_.-`, not starting with a separator
pub fn check_name(name: &str) -> Result<()> {
    static NAME_RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let re = cached_regex(&NAME_RE, r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$")?;
    if !re.is_match(name) {
        return Err(Error::InvalidArgument(format!("invalid name {:?}", name)));
    }
    Ok(())
}

/// Take an exclusive, non-blocking `flock` on `path`, creating the file.
///
/// The lock lives as long as the returned handle.
pub fn lock_file(path: &Path) -> Result<std::fs::File> {
    use std::os::unix::io::AsRawFd;

    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    match nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusiveNonblock) {
        Ok(()) => {}
        Err(nix::errno::Errno::EWOULDBLOCK) => {
            return Err(Error::Busy(format!(
                "{} is locked by another process",
                path.display()
            )))
        }
        Err(errno) => return Err(std::io::Error::from(errno).into()),
    }
    Ok(file)
}

/// Pack the contents of `dir` into the gzip tarball `file`
pub fn compress_dir(dir: &Path, file: &Path) -> Result<()> {
    let dir = path_str(dir)?;
    let file = path_str(file)?;
    execute("tar", &["czf", file, "-C", dir, "."])?;
    Ok(())
}

/// Unpack the gzip tarball `file` into `dir`, creating it if needed
pub fn decompress_dir(file: &Path, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let dir = path_str(dir)?;
    let file = path_str(file)?;
    execute("tar", &["xzf", file, "-C", dir])?;
    Ok(())
}

pub fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::InvalidArgument(format!("non UTF-8 path {}", path.display())))
}

/// Look up a required, non-empty option
pub fn require_opt<'a>(
    opts: &'a std::collections::HashMap<String, String>,
    key: &str,
) -> Result<&'a str> {
    match opts.get(key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::InvalidArgument(format!("missing required option {}", key))),
    }
}

//! DigitalOcean block storage API
//!
//! Only the handful of v2 endpoints the driver needs. Attach and detach are
//! asynchronous actions on the provider side; both calls block until the
//! action completes or the deadline passes.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub const GB: i64 = 1 << 30;

const API_URL: &str = "https://api.digitalocean.com/v2";
const METADATA_URL: &str = "http://169.254.169.254/metadata/v1.json";
const TOKEN_ENV: &str = "DO_TOKEN";

const ACTION_POLL_INTERVAL: Duration = Duration::from_secs(5);
const ACTION_DEADLINE: Duration = Duration::from_secs(5 * 60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DoVolume {
    pub id: String,
    pub name: String,
    pub size_gigabytes: i64,
    #[serde(default)]
    pub droplet_ids: Vec<i64>,
}

impl DoVolume {
    pub fn size_bytes(&self) -> i64 {
        self.size_gigabytes * GB
    }
}

/// Whole gigabytes needed to hold `size` bytes
pub fn gigabytes(size: i64) -> i64 {
    (size + GB - 1) / GB
}

/// Volume calls against the cloud API, scoped to the local droplet
pub trait DoClient: Send + Sync {
    fn get_volume(&self, id: &str) -> Result<DoVolume>;

    /// Create a volume of at least `size` bytes, returning its id
    fn create_volume(&self, name: &str, size: i64) -> Result<String>;

    fn delete_volume(&self, id: &str) -> Result<()>;

    /// Attach to this droplet and wait for the action to finish
    fn attach_volume(&self, id: &str) -> Result<()>;

    fn detach_volume(&self, id: &str) -> Result<()>;
}

/// Poll `status` until it reports `completed`.
///
/// `errored` fails with `Backend`; running past `deadline` is `Timeout`.
/// Transient status errors are retried at the next poll.
pub fn wait_for_action<F>(action: &str, interval: Duration, deadline: Duration, mut status: F) -> Result<()>
where
    F: FnMut() -> Result<String>,
{
    let start = Instant::now();
    loop {
        match status() {
            Ok(s) if s == "completed" => return Ok(()),
            Ok(s) if s == "errored" => {
                return Err(Error::Backend(format!("{} action failed", action)))
            }
            Ok(other) => log::debug!("{} action is {}", action, other),
            Err(e) if e.is_transient() => log::warn!("{} action status: {}", action, e),
            Err(e) => return Err(e),
        }
        if start.elapsed() + interval > deadline {
            return Err(Error::Timeout(format!(
                "{} action did not complete within {:?}",
                action, deadline
            )));
        }
        std::thread::sleep(interval);
    }
}

#[derive(Deserialize)]
struct Metadata {
    droplet_id: i64,
    region: String,
}

#[derive(Deserialize)]
struct VolumeEnvelope {
    volume: DoVolume,
}

#[derive(Deserialize)]
struct Action {
    id: i64,
    status: String,
}

#[derive(Deserialize)]
struct ActionEnvelope {
    action: Action,
}

#[derive(Serialize)]
struct CreateVolumeRequest<'a> {
    name: &'a str,
    region: &'a str,
    size_gigabytes: i64,
}

#[derive(Serialize)]
struct VolumeActionRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    droplet_id: i64,
    region: &'a str,
}

/// Blocking HTTP client authenticated with `DO_TOKEN`
pub struct DoHttpClient {
    http: reqwest::blocking::Client,
    token: String,
    droplet_id: i64,
    region: String,
}

fn http_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::Transient(e.to_string())
    } else {
        Error::Backend(e.to_string())
    }
}

impl DoHttpClient {
    /// Read the token from the environment and the droplet from the metadata service
    pub fn from_env() -> Result<Self> {
        let token = std::env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not set", TOKEN_ENV)))?;

        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(http_error)?;
        let metadata: Metadata = http
            .get(METADATA_URL)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(http_error)?;
        log::info!(
            "Running on droplet {} in region {}",
            metadata.droplet_id,
            metadata.region
        );

        Ok(Self {
            http,
            token,
            droplet_id: metadata.droplet_id,
            region: metadata.region,
        })
    }

    fn check(response: reqwest::blocking::Response, what: &str) -> Result<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(match status.as_u16() {
            404 => Error::NotFound(what.to_string()),
            429 | 500..=599 => Error::Transient(format!("{}: {} {}", what, status, body)),
            _ => Error::Backend(format!("{}: {} {}", what, status, body)),
        })
    }

    fn volume_action(&self, id: &str, kind: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/volumes/{}/actions", API_URL, id))
            .bearer_auth(&self.token)
            .json(&VolumeActionRequest {
                kind,
                droplet_id: self.droplet_id,
                region: &self.region,
            })
            .send()
            .map_err(http_error)?;
        let action: ActionEnvelope = Self::check(response, &format!("volume {}", id))?
            .json()
            .map_err(http_error)?;
        log::debug!("Started {} of volume {} (action {})", kind, id, action.action.id);

        wait_for_action(kind, ACTION_POLL_INTERVAL, ACTION_DEADLINE, || {
            self.action_status(action.action.id)
        })
    }

    fn action_status(&self, action_id: i64) -> Result<String> {
        let response = self
            .http
            .get(format!("{}/actions/{}", API_URL, action_id))
            .bearer_auth(&self.token)
            .send()
            .map_err(http_error)?;
        let action: ActionEnvelope = Self::check(response, &format!("action {}", action_id))?
            .json()
            .map_err(http_error)?;
        Ok(action.action.status)
    }
}

impl DoClient for DoHttpClient {
    fn get_volume(&self, id: &str) -> Result<DoVolume> {
        let response = self
            .http
            .get(format!("{}/volumes/{}", API_URL, id))
            .bearer_auth(&self.token)
            .send()
            .map_err(http_error)?;
        let envelope: VolumeEnvelope = Self::check(response, &format!("volume {}", id))?
            .json()
            .map_err(http_error)?;
        Ok(envelope.volume)
    }

    fn create_volume(&self, name: &str, size: i64) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/volumes", API_URL))
            .bearer_auth(&self.token)
            .json(&CreateVolumeRequest {
                name,
                region: &self.region,
                size_gigabytes: gigabytes(size),
            })
            .send()
            .map_err(http_error)?;
        let envelope: VolumeEnvelope = Self::check(response, &format!("volume {}", name))?
            .json()
            .map_err(http_error)?;
        Ok(envelope.volume.id)
    }

    fn delete_volume(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/volumes/{}", API_URL, id))
            .bearer_auth(&self.token)
            .send()
            .map_err(http_error)?;
        Self::check(response, &format!("volume {}", id))?;
        Ok(())
    }

    fn attach_volume(&self, id: &str) -> Result<()> {
        self.volume_action(id, "attach")
    }

    fn detach_volume(&self, id: &str) -> Result<()> {
        self.volume_action(id, "detach")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_for_action_completes() {
        let mut states = vec!["completed", "in-progress", "in-progress"];
        let result = wait_for_action("attach", Duration::from_millis(1), Duration::from_secs(5), || {
            Ok(states.pop().unwrap_or("completed").to_string())
        });
        assert!(result.is_ok());
        assert!(states.is_empty());
    }

    #[test]
    fn test_wait_for_action_errored_and_deadline() {
        let err = wait_for_action("detach", Duration::from_millis(1), Duration::from_secs(5), || {
            Ok("errored".to_string())
        });
        assert!(matches!(err, Err(Error::Backend(_))));

        let err = wait_for_action("attach", Duration::from_millis(5), Duration::from_millis(20), || {
            Ok("in-progress".to_string())
        });
        assert!(matches!(err, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_wait_for_action_retries_transient() {
        let mut calls = 0;
        let result = wait_for_action("attach", Duration::from_millis(1), Duration::from_secs(5), || {
            calls += 1;
            match calls {
                1 => Err(Error::Transient("502".into())),
                _ => Ok("completed".to_string()),
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, 2);

        let err = wait_for_action("attach", Duration::from_millis(1), Duration::from_secs(5), || {
            Err(Error::NotFound("action 7".into()))
        });
        assert!(matches!(err, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_gigabytes_rounds_up() {
        assert_eq!(gigabytes(0), 0);
        assert_eq!(gigabytes(1), 1);
        assert_eq!(gigabytes(GB), 1);
        assert_eq!(gigabytes(GB + 1), 2);
        assert_eq!(gigabytes(10 * GB), 10);
    }

    #[test]
    fn test_volume_json() {
        let json = r#"{"volume":{"id":"506f78a4","name":"example","size_gigabytes":10,
            "droplet_ids":[12],"region":{"slug":"nyc1"}}}"#;
        let envelope: VolumeEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.volume.name, "example");
        assert_eq!(envelope.volume.size_bytes(), 10 * GB);
        assert_eq!(envelope.volume.droplet_ids, vec![12]);
    }
}

//! Replica stacks on a Rancher control plane
//!
//! A volume is one stack holding two replica services and a controller. The
//! [`Orchestrator`] trait is the narrow slice of the Rancher API the driver
//! uses; [`RancherClient`] implements it over HTTP.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::backoff;

/// Replica and controller services of one stack
pub const SERVICE_COUNT: usize = 3;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const DOCKER_COMPOSE_TEMPLATE: &str = r#"
replica:
  restart: always
  labels:
    io.rancher.scheduler.affinity:container_label_ne: io.rancher.stack_service.name=replica
    io.rancher.container.pull_image: always
  entrypoint:
  - /bin/bash
  - -c
  command:
  - /usr/local/bin/replica --name {name} --create --size {size} --slab {size} | tee storage_replica.log
  working_dir: /storage
  volumes:
  - /storage
  image: rancher/longhorn
controller:
  restart: always
  labels:
    io.rancher.scheduler.affinity:container: {container}
    io.rancher.container.pull_image: always
  entrypoint:
  - /bin/bash
  - -c
  command:
  - /storage/start_controller.sh replica | tee storage_controller.log
  image: rancher/longhorn
  working_dir: /storage
  volumes:
  - /storage
  links:
  - replica:replica
"#;

const RANCHER_COMPOSE_TEMPLATE: &str = r#"
replica:
  scale: 2
controller:
  scale: 1
"#;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stack {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
    /// "yes" while the control plane is still changing the stack
    #[serde(default)]
    pub transitioning: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    pub name: String,
    pub docker_compose: String,
    pub rancher_compose: String,
    pub start_on_create: bool,
}

impl StackSpec {
    /// Stack `Longhorn-<volume>` with replicas of `size` bytes
    pub fn for_volume(volume: &str, size: i64, container: &str) -> Self {
        let size = size.to_string();
        Self {
            name: stack_name(volume),
            docker_compose: DOCKER_COMPOSE_TEMPLATE
                .replace("{name}", volume)
                .replace("{size}", &size)
                .replace("{container}", container),
            rancher_compose: RANCHER_COMPOSE_TEMPLATE.to_string(),
            start_on_create: false,
        }
    }
}

pub fn stack_name(volume: &str) -> String {
    format!("Longhorn-{}", volume)
}

pub trait Orchestrator: Send + Sync {
    fn find_stack(&self, name: &str) -> Result<Option<Stack>>;

    fn create_stack(&self, spec: &StackSpec) -> Result<Stack>;

    fn get_stack(&self, id: &str) -> Result<Stack>;

    fn delete_stack(&self, id: &str) -> Result<()>;

    fn list_services(&self, stack_id: &str) -> Result<Vec<Service>>;

    fn activate_services(&self, stack_id: &str) -> Result<()>;

    fn deactivate_services(&self, stack_id: &str) -> Result<()>;
}

/// Wait until the control plane stops transitioning the stack
pub fn wait_stack(orchestrator: &dyn Orchestrator, stack: &Stack, max: Duration) -> Result<Stack> {
    let mut current = stack.clone();
    backoff(max, &format!("stack {} did not settle", stack.name), || {
        current = orchestrator.get_stack(&stack.id)?;
        Ok(current.transitioning != "yes")
    })?;
    Ok(current)
}

/// Wait until `count` services of the stack are all in `state`
pub fn wait_services(
    orchestrator: &dyn Orchestrator,
    stack: &Stack,
    count: usize,
    state: &str,
    max: Duration,
) -> Result<()> {
    let message = format!("{} services of {} did not become {}", count, stack.name, state);
    backoff(max, &message, || {
        let services = orchestrator.list_services(&stack.id)?;
        log::debug!(
            "Waiting for {} services of {} to be {} ({} found)",
            count,
            stack.name,
            state,
            services.len()
        );
        Ok(services.len() == count && services.iter().all(|s| s.state == state))
    })
}

#[derive(Deserialize)]
struct Collection<T> {
    data: Vec<T>,
}

/// Rancher v1 API client
pub struct RancherClient {
    http: reqwest::blocking::Client,
    url: String,
    access_key: String,
    secret_key: String,
}

fn http_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::Transient(e.to_string())
    } else {
        Error::Backend(e.to_string())
    }
}

impl RancherClient {
    pub fn new(url: &str, access_key: &str, secret_key: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(http_error)?;
        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder, what: &str) -> Result<reqwest::blocking::Response> {
        let response = request
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .map_err(http_error)?;
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

    fn stack_action(&self, stack_id: &str, action: &str) -> Result<()> {
        self.send(
            self.http
                .post(format!("{}/environments/{}?action={}", self.url, stack_id, action)),
            &format!("stack {}", stack_id),
        )?;
        Ok(())
    }
}

impl Orchestrator for RancherClient {
    fn find_stack(&self, name: &str) -> Result<Option<Stack>> {
        let response = self.send(
            self.http
                .get(format!("{}/environments", self.url))
                .query(&[("name", name), ("removed_null", "")]),
            &format!("stack {}", name),
        )?;
        let mut stacks: Collection<Stack> = response.json().map_err(http_error)?;
        match stacks.data.len() {
            0 => Ok(None),
            1 => Ok(stacks.data.pop()),
            n => Err(Error::Backend(format!("{} stacks named {}", n, name))),
        }
    }

    fn create_stack(&self, spec: &StackSpec) -> Result<Stack> {
        let response = self.send(
            self.http.post(format!("{}/environments", self.url)).json(spec),
            &format!("stack {}", spec.name),
        )?;
        response.json().map_err(http_error)
    }

    fn get_stack(&self, id: &str) -> Result<Stack> {
        let response = self.send(
            self.http.get(format!("{}/environments/{}", self.url, id)),
            &format!("stack {}", id),
        )?;
        response.json().map_err(http_error)
    }

    fn delete_stack(&self, id: &str) -> Result<()> {
        self.send(
            self.http.delete(format!("{}/environments/{}", self.url, id)),
            &format!("stack {}", id),
        )?;
        Ok(())
    }

    fn list_services(&self, stack_id: &str) -> Result<Vec<Service>> {
        let response = self.send(
            self.http
                .get(format!("{}/environments/{}/services", self.url, stack_id)),
            &format!("services of stack {}", stack_id),
        )?;
        let services: Collection<Service> = response.json().map_err(http_error)?;
        Ok(services.data)
    }

    fn activate_services(&self, stack_id: &str) -> Result<()> {
        self.stack_action(stack_id, "activateservices")
    }

    fn deactivate_services(&self, stack_id: &str) -> Result<()> {
        self.stack_action(stack_id, "deactivateservices")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_for_volume() {
        let spec = StackSpec::for_volume("vol1", 1 << 30, "convoy");
        assert_eq!(spec.name, "Longhorn-vol1");
        assert!(spec.docker_compose.contains("--name vol1 --create --size 1073741824 --slab 1073741824"));
        assert!(spec.docker_compose.contains("io.rancher.scheduler.affinity:container: convoy"));
        assert!(!spec.docker_compose.contains('{'));

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["dockerCompose"], spec.docker_compose);
        assert_eq!(json["startOnCreate"], false);
    }

    #[test]
    fn test_stack_json() {
        let json = r#"{"data":[{"id":"1e5","name":"Longhorn-vol1","state":"active",
            "transitioning":"no","type":"environment"}]}"#;
        let stacks: Collection<Stack> = serde_json::from_str(json).unwrap();
        assert_eq!(stacks.data[0].id, "1e5");
        assert_eq!(stacks.data[0].transitioning, "no");
    }
}

use crate::filter::{Filter, FilterError, Order};
use crate::photo_store::{validate_identifier, RefreshJobRecord};
use crate::schedule::{Schedule, ScheduleError};
use serde_json::Value as JsonValue;
use std::net::ToSocketAddrs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RefreshJobError {
    #[error("invalid identifier")]
    InvalidIdentifier,

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("unknown order: \"{0}\"")]
    InvalidOrder(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("unknown post command: \"{0}\"")]
    UnknownPostCommand(String),
}

/// A validated refresh job: the stored record with its filter and order
/// parsed into their typed forms.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub id: Option<i64>,
    pub identifier: String,
    pub display_name: String,
    pub hostname: String,
    pub schedule: String,
    pub enabled: bool,
    pub filter: Filter,
    pub order: Order,
    pub affiche_options: JsonValue,
    pub post_command_id: String,
}

impl RefreshJob {
    pub fn from_record(record: RefreshJobRecord) -> Result<Self, RefreshJobError> {
        if !validate_identifier(&record.identifier) {
            return Err(RefreshJobError::InvalidIdentifier);
        }
        Schedule::parse(&record.schedule)?;
        let filter = Filter::parse(&record.filter)?;
        let order =
            Order::parse(&record.order).ok_or(RefreshJobError::InvalidOrder(record.order))?;

        Ok(Self {
            id: record.id,
            identifier: record.identifier,
            display_name: record.display_name,
            hostname: record.hostname,
            schedule: record.schedule,
            enabled: record.enabled,
            filter,
            order,
            affiche_options: record.affiche_options,
            post_command_id: record.post_command_id,
        })
    }

    /// The stored representation; the filter is rendered to its normalized
    /// wire form.
    pub fn to_record(&self) -> RefreshJobRecord {
        RefreshJobRecord {
            id: self.id,
            identifier: self.identifier.clone(),
            display_name: self.display_name.clone(),
            hostname: self.hostname.clone(),
            schedule: self.schedule.clone(),
            enabled: self.enabled,
            filter: self.filter.to_string(),
            order: self.order.as_str().to_string(),
            affiche_options: self.affiche_options.clone(),
            post_command_id: self.post_command_id.clone(),
        }
    }

    /// True when the target hostname resolves to a loopback IPv4 address.
    /// Unresolvable hostnames count as remote.
    pub fn hostname_is_local(&self) -> bool {
        hostname_is_local(&self.hostname)
    }

    /// The hostname as reachable from outside this machine: loopback targets
    /// are rewritten to the machine's own name, preserving the port.
    pub fn external_hostname(&self) -> String {
        if !self.hostname_is_local() {
            return self.hostname.clone();
        }

        let mut external = machine_hostname();
        if let Some((_, port)) = self.hostname.split_once(':') {
            external.push(':');
            external.push_str(port);
        }
        external
    }
}

pub(crate) fn hostname_is_local(hostname: &str) -> bool {
    let (host, port) = match hostname.split_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(80u16)),
        None => (hostname, 80),
    };
    match (host, port).to_socket_addrs() {
        Ok(addresses) => addresses
            .filter(|address| address.is_ipv4())
            .any(|address| address.ip().is_loopback()),
        Err(_) => false,
    }
}

pub(crate) fn machine_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

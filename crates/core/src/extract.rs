//! Desired-state extraction: pod attributes in, SNAT rule (or nothing) out. Pure, no I/O.

use std::net::IpAddr;

use thiserror::Error;

use crate::{DesiredRule, ObjectKey, ObjectSnapshot, SnatRule};

/// Malformed input. Callers treat it as "no rule desired" and surface it as a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("target annotation {value:?} is not an IP address")]
    InvalidTarget { value: String },
    #[error("status address {value:?} is not an IP address")]
    InvalidStatusAddress { value: String },
    #[error("target {target} is not usable as a SNAT address")]
    UnusableTarget { target: IpAddr },
    #[error("address families differ: source {source_addr}, target {target}")]
    FamilyMismatch { source_addr: IpAddr, target: IpAddr },
    #[error("pod uses the host network; refusing to SNAT the node address")]
    HostNetwork,
}

fn parse_ip(raw: &str) -> Option<IpAddr> { raw.trim().parse::<IpAddr>().ok() }

fn usable_target(ip: &IpAddr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() { return false; }
    match ip {
        IpAddr::V4(v4) => !v4.is_broadcast(),
        IpAddr::V6(_) => true,
    }
}

/// Derive the desired rule for `key` from its current snapshot.
///
/// A missing annotation, a pod without an address yet, or a finished pod all yield an absent rule.
pub fn extract(key: &ObjectKey, obj: &ObjectSnapshot) -> Result<DesiredRule, ExtractionError> {
    let Some(raw_target) = obj.target_annotation.as_deref() else {
        return Ok(DesiredRule::absent(key.clone()));
    };
    // a finished pod owns no address, whatever else is wrong with it
    if obj.terminal {
        return Ok(DesiredRule::absent(key.clone()));
    }
    let target = parse_ip(raw_target).ok_or_else(|| ExtractionError::InvalidTarget { value: raw_target.to_string() })?;
    if !usable_target(&target) {
        return Err(ExtractionError::UnusableTarget { target });
    }
    if obj.host_network {
        return Err(ExtractionError::HostNetwork);
    }
    let source = match obj.status_address.as_deref().map(str::trim) {
        None | Some("") => return Ok(DesiredRule::absent(key.clone())),
        Some(raw) => parse_ip(raw).ok_or_else(|| ExtractionError::InvalidStatusAddress { value: raw.to_string() })?,
    };
    if source.is_unspecified() {
        return Err(ExtractionError::InvalidStatusAddress { value: source.to_string() });
    }
    if source.is_ipv4() != target.is_ipv4() {
        return Err(ExtractionError::FamilyMismatch { source_addr: source, target });
    }
    Ok(DesiredRule { key: key.clone(), rule: Some(SnatRule { source, target }) })
}

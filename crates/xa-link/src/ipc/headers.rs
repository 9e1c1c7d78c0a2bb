//! # Context Propagation Headers
//!
//! Carries the active transaction context in RPC call metadata.

use crate::domain::{Timestamp, TransactionContext, TransactionId, XaError};
use std::collections::HashMap;
use tracing::debug;

/// Outbound/inbound RPC call metadata.
pub type RpcMetadata = HashMap<String, String>;

/// Global transaction id.
pub const HEADER_TRANSACTION_ID: &str = "xa-tid";
/// Coordinator address.
pub const HEADER_COORDINATOR: &str = "xa-coordinator";
/// Deadline in unix millis.
pub const HEADER_TIMEOUT_AT: &str = "xa-timeout-at";
/// Active flag.
pub const HEADER_ACTIVE: &str = "xa-active";

/// Metadata for an outbound call made under `context`.
///
/// Dormant contexts are not propagated.
pub fn inject(context: &TransactionContext) -> Option<RpcMetadata> {
    if !context.active {
        return None;
    }

    let mut metadata = RpcMetadata::new();
    metadata.insert(
        HEADER_TRANSACTION_ID.to_string(),
        context.transaction_id.to_string(),
    );
    metadata.insert(
        HEADER_COORDINATOR.to_string(),
        context.coordinator_address.clone(),
    );
    metadata.insert(HEADER_TIMEOUT_AT.to_string(), context.timeout_at.to_string());
    metadata.insert(HEADER_ACTIVE.to_string(), context.active.to_string());
    Some(metadata)
}

/// Rebuild the caller's context as a participant context.
///
/// Returns `Ok(None)` when the call carries no transaction, or only an
/// inactive one. Inactive contexts are never propagated, so a caller that
/// sends one gets no transaction on this side.
pub fn extract(metadata: &RpcMetadata) -> Result<Option<TransactionContext>, XaError> {
    let Some(tid) = metadata.get(HEADER_TRANSACTION_ID) else {
        return Ok(None);
    };
    if tid.is_empty() {
        return Err(XaError::MalformedContext(format!(
            "empty {}",
            HEADER_TRANSACTION_ID
        )));
    }

    let coordinator = metadata
        .get(HEADER_COORDINATOR)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| XaError::MalformedContext(format!("missing {}", HEADER_COORDINATOR)))?;

    let timeout_at = match metadata.get(HEADER_TIMEOUT_AT) {
        Some(raw) => raw.parse::<Timestamp>().map_err(|_| {
            XaError::MalformedContext(format!("bad {}: {}", HEADER_TIMEOUT_AT, raw))
        })?,
        None => 0,
    };

    let active = match metadata.get(HEADER_ACTIVE) {
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            XaError::MalformedContext(format!("bad {}: {}", HEADER_ACTIVE, raw))
        })?,
        None => true,
    };
    if !active {
        debug!(tid = %tid, "Ignoring inactive transaction context");
        return Ok(None);
    }

    Ok(Some(TransactionContext::participant(
        TransactionId::new(tid.clone()),
        coordinator.clone(),
        timeout_at,
        true,
    )))
}

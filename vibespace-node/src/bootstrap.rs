//! Startup: claiming an identifier and the one-shot rendezvous dial.

use std::future::Future;

use tracing::{debug, info};
use vibespace_core::PeerId;

use crate::registry::ConnectionRegistry;
use crate::transport::TransportError;

/// Rendezvous ids worth dialing right now: not ourselves, not already known.
pub fn rendezvous_targets(
    local: &str,
    rendezvous: &[PeerId],
    registry: &ConnectionRegistry,
) -> Vec<PeerId> {
    rendezvous
        .iter()
        .filter(|id| id.as_str() != local && !registry.is_known(id))
        .cloned()
        .collect()
}

/// Bind the first free identifier among `candidates`, falling back to
/// `fallback`. Only an id collision moves on to the next candidate; any other
/// error is returned as is.
pub async fn claim_identity<B, F, R>(
    candidates: &[PeerId],
    fallback: &str,
    mut bind: B,
) -> Result<(PeerId, R), TransportError>
where
    B: FnMut(PeerId) -> F,
    F: Future<Output = Result<R, TransportError>>,
{
    for candidate in candidates {
        match bind(candidate.clone()).await {
            Ok(bound) => {
                info!(peer = %candidate, "claimed rendezvous id");
                return Ok((candidate.clone(), bound));
            }
            Err(TransportError::IdTaken(_)) => {
                debug!(peer = %candidate, "rendezvous id already claimed");
            }
            Err(err) => return Err(err),
        }
    }

    let bound = bind(fallback.to_owned()).await?;
    info!(peer = %fallback, "bound session id");
    Ok((fallback.to_owned(), bound))
}

use super::{HypervisorError, StoreError};
use crate::core::domain::DomId;
use tracing::{debug, error, warn};

/// How a swallowed I/O failure was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorbed {
    Ok,
    Transient,
    Unexpected,
}

/// Swallow a hypervisor failure. Transient ones are expected while a domain
/// shuts down and only show up at debug level.
pub fn absorb_hypervisor(
    operation: &str,
    domid: DomId,
    result: Result<(), HypervisorError>,
) -> Absorbed {
    match result {
        Ok(()) => Absorbed::Ok,
        Err(e) if e.is_transient() => {
            debug!(domid, operation, error = %e, "Hypervisor call failed, domain likely gone");
            Absorbed::Transient
        }
        Err(e) => {
            error!(domid, operation, error = %e, "Hypervisor call failed unexpectedly");
            Absorbed::Unexpected
        }
    }
}

pub fn absorb_store(domid: DomId, result: Result<(), StoreError>) -> Absorbed {
    match result {
        Ok(()) => Absorbed::Ok,
        Err(e) => {
            warn!(domid, error = %e, "Store write failed");
            Absorbed::Unexpected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_hypervisor_failures() {
        assert_eq!(absorb_hypervisor("mem-set", 3, Ok(())), Absorbed::Ok);
        assert_eq!(
            absorb_hypervisor("mem-set", 3, Err(HypervisorError::DomainGone { domid: 3 })),
            Absorbed::Transient
        );
        assert_eq!(
            absorb_hypervisor(
                "mem-set",
                3,
                Err(HypervisorError::Parse("bad".into()))
            ),
            Absorbed::Unexpected
        );
    }
}

use std::collections::BTreeMap;

use preview_instance::PrNumber;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },
    #[error("requested port {0} is out of range")]
    OutOfRange(u16),
    #[error("requested port {0} is in use")]
    PortInUse(u16),
    #[error("max concurrent bindings reached ({0}); release stale instances before binding more ports")]
    CapacityReached(usize),
    #[error("all ports in range are in use")]
    PortsExhausted,
    #[error("port {0} is not assigned")]
    NotAssigned(u16),
}

/// Lifetime counters, reported on `/healthz`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PortStats {
    pub binds: u64,
    pub releases: u64,
    /// `release` calls for ports that were not assigned.
    pub stray_releases: u64,
}

/// Bookkeeping for the ports preview servers may listen on.
///
/// This never touches the network; it only tracks which PR holds which port.
/// Callers release a port only after the owning server has been told to stop.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    max_bindings: Option<usize>,
    assignments: BTreeMap<u16, PrNumber>,
    stats: PortStats,
}

impl PortAllocator {
    /// `max_bindings` of `None` or `Some(0)` means unbounded.
    pub fn new(min_port: u16, max_port: u16, max_bindings: Option<usize>) -> Result<Self, PortError> {
        if min_port == 0 || min_port > max_port {
            return Err(PortError::InvalidRange {
                min: min_port,
                max: max_port,
            });
        }
        Ok(Self {
            min_port,
            max_port,
            max_bindings: max_bindings.filter(|n| *n > 0),
            assignments: BTreeMap::new(),
            stats: PortStats::default(),
        })
    }

    pub fn min_port(&self) -> u16 {
        self.min_port
    }

    pub fn max_port(&self) -> u16 {
        self.max_port
    }

    pub fn capacity(&self) -> Option<usize> {
        self.max_bindings
    }

    pub fn assigned_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn stats(&self) -> PortStats {
        self.stats
    }

    pub fn check_in_range(&self, port: u16) -> bool {
        (self.min_port..=self.max_port).contains(&port)
    }

    pub fn check_available(&self, port: u16) -> bool {
        self.check_in_range(port) && !self.assignments.contains_key(&port)
    }

    pub fn under_capacity(&self) -> bool {
        self.max_bindings
            .is_none_or(|max| self.assignments.len() < max)
    }

    /// Who holds `port`, if anyone.
    pub fn binding(&self, port: u16) -> Option<PrNumber> {
        self.assignments.get(&port).copied()
    }

    pub fn bind_manual(&mut self, port: u16, owner: PrNumber) -> Result<u16, PortError> {
        if !self.check_in_range(port) {
            return Err(PortError::OutOfRange(port));
        }
        if self.assignments.contains_key(&port) {
            return Err(PortError::PortInUse(port));
        }
        self.ensure_capacity()?;
        self.assignments.insert(port, owner);
        self.stats.binds += 1;
        Ok(port)
    }

    /// Binds the lowest free port in `[min_port, max_port]`, both ends inclusive.
    pub fn bind_auto(&mut self, owner: PrNumber) -> Result<u16, PortError> {
        self.ensure_capacity()?;
        let port = (self.min_port..=self.max_port)
            .find(|p| !self.assignments.contains_key(p))
            .ok_or(PortError::PortsExhausted)?;
        self.assignments.insert(port, owner);
        self.stats.binds += 1;
        Ok(port)
    }

    /// Binds `preferred` when it is free and in range, otherwise falls back to [`Self::bind_auto`].
    pub fn bind_preferred(
        &mut self,
        preferred: Option<u16>,
        owner: PrNumber,
    ) -> Result<u16, PortError> {
        match preferred {
            Some(port) if self.check_available(port) => self.bind_manual(port, owner),
            _ => self.bind_auto(owner),
        }
    }

    pub fn release(&mut self, port: u16) -> Result<(), PortError> {
        if self.assignments.remove(&port).is_none() {
            self.stats.stray_releases += 1;
            return Err(PortError::NotAssigned(port));
        }
        self.stats.releases += 1;
        Ok(())
    }

    fn ensure_capacity(&self) -> Result<(), PortError> {
        if self.under_capacity() {
            return Ok(());
        }
        Err(PortError::CapacityReached(
            self.max_bindings.unwrap_or(usize::MAX),
        ))
    }
}

/// Port a PR would like to get: `base + pr`, if that still fits in a `u16`.
pub fn preferred_port(base: u16, pr: PrNumber) -> Option<u16> {
    u64::from(base)
        .checked_add(pr.0)
        .and_then(|p| u16::try_from(p).ok())
}

use std::{
    collections::BTreeSet,
    io::ErrorKind,
    net::TcpListener,
    sync::{Arc, Mutex, OnceLock},
};

use crate::error::{Error, Result};

pub const MAX_PORT: u16 = u16::MAX;

type Claims = Arc<Mutex<BTreeSet<u16>>>;

fn global_claims() -> &'static Claims {
    static CLAIMS: OnceLock<Claims> = OnceLock::new();
    CLAIMS.get_or_init(Claims::default)
}

/// Whether the OS lets us bind `port` on all interfaces right now.
///
/// The probe listener is dropped immediately; the port is only *likely* to
/// stay free until the engine binds it.
pub fn probe_tcp_port(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::debug!(port, error = %e, "port probe failed");
            false
        }
    }
}

/// Hands out host ports for instances of this process.
///
/// Every search runs inside one critical section and records its result as a
/// claim, so two instances provisioning at once never get the same port.
#[derive(Clone)]
pub struct PortAllocator {
    claims: Claims,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::global()
    }
}

impl PortAllocator {
    pub fn global() -> Self {
        Self {
            claims: global_claims().clone(),
        }
    }

    /// Allocator with its own claim set, independent of the process-wide one.
    pub fn isolated() -> Self {
        Self {
            claims: Claims::default(),
        }
    }

    /// First port in `start..=65535` that binds, is not in `excluded` and is
    /// not claimed. Does not claim it.
    pub fn find_available_port(&self, start: u16, excluded: &BTreeSet<u16>) -> Result<u16> {
        let claims = self.lock();
        find_in(start, excluded, &claims, "tcp")
    }

    /// Claims a service port and a distinct debug port together.
    pub fn reserve_pair(&self, service_start: u16, debug_start: u16) -> Result<PortLease> {
        let mut claims = self.lock();

        let service_port = find_in(service_start, &BTreeSet::new(), &claims, "service")?;
        let debug_port = find_in(debug_start, &BTreeSet::from([service_port]), &claims, "debug")?;

        claims.insert(service_port);
        claims.insert(debug_port);
        tracing::debug!(service = service_port, debug = debug_port, "ports claimed");
        Ok(PortLease {
            claims: Some(self.claims.clone()),
            service: service_port,
            debug: debug_port,
        })
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        // A panic while holding the lock leaves the set itself consistent.
        self.claims.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn find_in(
    start: u16,
    excluded: &BTreeSet<u16>,
    claimed: &BTreeSet<u16>,
    kind: &'static str,
) -> Result<u16> {
    let start = start.max(1);
    (start..=MAX_PORT)
        .find(|p| !excluded.contains(p) && !claimed.contains(p) && probe_tcp_port(*p))
        .ok_or(Error::PortExhaustion {
            kind,
            start,
            upper: MAX_PORT,
        })
}

/// Claimed service and debug ports; the claims go away on [`PortLease::release`]
/// or drop.
pub struct PortLease {
    claims: Option<Claims>,
    service: u16,
    debug: u16,
}

impl PortLease {
    pub fn service(&self) -> u16 {
        self.service
    }

    pub fn debug(&self) -> u16 {
        self.debug
    }

    pub fn release(&mut self) {
        let Some(claims) = self.claims.take() else {
            return;
        };
        let mut set = claims.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.service);
        set.remove(&self.debug);
        tracing::debug!(service = self.service, debug = self.debug, "ports released");
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease")
            .field("service", &self.service)
            .field("debug", &self.debug)
            .field("held", &self.claims.is_some())
            .finish()
    }
}

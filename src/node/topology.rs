/// `node/topology.rs` — runtime-resizable inlets and outlets
///
/// Growing appends ports at the end so existing indices (and the host
/// connections made to them) never move. Shrinking releases the trailing
/// ports immediately.
use crate::host::{Host, PortId};

pub const MIN_INLETS: usize = 1;
pub const MIN_OUTLETS: usize = 0;
/// Upper bound for either count; larger requests clamp to it.
pub const MAX_PORTS: usize = 1024;

#[derive(Debug, Default)]
pub struct Topology {
    inlets: Vec<PortId>,
    outlets: Vec<PortId>,
}

impl Topology {
    pub fn new(host: &dyn Host, inlets: usize, outlets: usize) -> Self {
        let mut topology = Self::default();
        topology.set_inlets(host, inlets as i64);
        topology.set_outlets(host, outlets as i64);
        topology
    }

    pub fn inlet_count(&self) -> usize {
        self.inlets.len()
    }

    pub fn outlet_count(&self) -> usize {
        self.outlets.len()
    }

    pub fn inlets(&self) -> &[PortId] {
        &self.inlets
    }

    pub fn outlets(&self) -> &[PortId] {
        &self.outlets
    }

    pub fn outlet(&self, index: usize) -> Option<PortId> {
        self.outlets.get(index).copied()
    }

    /// Resize inlets; counts clamp to `1..=MAX_PORTS`.
    pub fn set_inlets(&mut self, host: &dyn Host, count: i64) {
        let count = clamp(count, MIN_INLETS);
        resize(&mut self.inlets, count, || host.create_inlet(), |id| host.release_inlet(id));
    }

    /// Resize outlets; counts clamp to `0..=MAX_PORTS`.
    pub fn set_outlets(&mut self, host: &dyn Host, count: i64) {
        let count = clamp(count, MIN_OUTLETS);
        resize(&mut self.outlets, count, || host.create_outlet(), |id| host.release_outlet(id));
    }

    /// Back to one inlet and one outlet.
    pub fn reset(&mut self, host: &dyn Host) {
        self.set_inlets(host, 1);
        self.set_outlets(host, 1);
    }
}

fn clamp(count: i64, min: usize) -> usize {
    let wanted = usize::try_from(count).unwrap_or(0);
    if wanted > MAX_PORTS {
        log::warn!("[node] port count {count} clamped to {MAX_PORTS}");
    }
    wanted.clamp(min, MAX_PORTS)
}

fn resize(
    ports: &mut Vec<PortId>,
    count: usize,
    create: impl Fn() -> PortId,
    release: impl Fn(PortId),
) {
    if ports.len() > count {
        for id in ports.drain(count..) {
            release(id);
        }
    }
    while ports.len() < count {
        ports.push(create());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;

    #[test]
    fn growing_preserves_existing_ports() {
        let host = MemoryHost::default();
        let mut topology = Topology::new(&host, 1, 1);
        let first = topology.outlet(0).unwrap();

        topology.set_outlets(&host, 3);
        assert_eq!(topology.outlet_count(), 3);
        assert_eq!(topology.outlet(0), Some(first));

        let extra = topology.outlets()[1..].to_vec();
        topology.set_outlets(&host, 1);
        assert_eq!(topology.outlet_count(), 1);
        assert_eq!(topology.outlet(0), Some(first));
        assert_eq!(host.released(), extra);
    }

    #[test]
    fn counts_clamp_to_minimums() {
        let host = MemoryHost::default();
        let mut topology = Topology::new(&host, 2, 2);

        topology.set_inlets(&host, 0);
        topology.set_outlets(&host, -4);
        assert_eq!(topology.inlet_count(), 1);
        assert_eq!(topology.outlet_count(), 0);
        assert_eq!(topology.outlet(0), None);
    }

    #[test]
    fn huge_counts_clamp_to_maximum() {
        let host = MemoryHost::default();
        let mut topology = Topology::new(&host, 1, 1);
        topology.set_outlets(&host, 1_000_000_000_000);
        topology.set_inlets(&host, i64::MAX);
        assert_eq!(topology.outlet_count(), MAX_PORTS);
        assert_eq!(topology.inlet_count(), MAX_PORTS);
    }

    #[test]
    fn reset_returns_to_one_by_one() {
        let host = MemoryHost::default();
        let mut topology = Topology::new(&host, 4, 0);
        let inlet = topology.inlets()[0];
        topology.reset(&host);
        assert_eq!(topology.inlet_count(), 1);
        assert_eq!(topology.outlet_count(), 1);
        assert_eq!(topology.inlets()[0], inlet);
    }
}

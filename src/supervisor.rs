//! Scan, mirror-tree and periodic-poll supervision.
//!
//! Owns the lifecycle around the SDO engine: scanning the bus for
//! controllers, publishing one mirror per responder and driving the
//! continuous read loop that keeps the mirrors live. Failure policy per
//! the error design: a single failed read affects only its attribute for
//! that round; a lost transport or repeated dead sweeps restart the scan;
//! an empty bus is retried on a long pause and becomes fatal on the third
//! attempt.

use crate::mirror::{
    AttributePath, AttributeValue, ChipRegister, ControllerMirror, MonitoringTriplet, WriterTag,
    ADC_CHANNELS, ADC_TRIM_MASK, FIELD_MASK_10BIT, SUB_MASTERS,
};
use crate::scan::Scanner;
use crate::sdo::SdoClient;
use crate::{Error, Result};
use dcs_canif::NodeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Time source for the long supervisor pauses; injected so tests do not
/// wait out the 60-second rescan window.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Per-node probe timeout during a scan.
    pub scan_timeout: Duration,
    /// Timeout of the connected-bitmap read opening each chain sweep.
    pub bitmap_timeout: Duration,
    /// Timeout of every per-attribute read.
    pub attribute_timeout: Duration,
    /// Pause between full sweeps.
    pub sweep_pause: Duration,
    /// Pause before re-scanning an empty bus.
    pub rescan_wait: Duration,
    /// Scan attempts before an empty bus is fatal.
    pub scan_attempts: u32,
    /// Consecutive dead sweeps of one controller before the scan restarts.
    pub sweep_failure_limit: u32,
}

impl Default for SupervisorConfig {
    fn default() -> SupervisorConfig {
        SupervisorConfig {
            scan_timeout: crate::scan::DEFAULT_SCAN_TIMEOUT,
            bitmap_timeout: Duration::from_secs(3),
            attribute_timeout: Duration::from_secs(1),
            sweep_pause: Duration::from_millis(0),
            rescan_wait: Duration::from_secs(60),
            scan_attempts: 3,
            sweep_failure_limit: 3,
        }
    }
}

pub struct Supervisor {
    sdo: Arc<SdoClient>,
    scanner: Scanner,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
    shutdown: Arc<AtomicBool>,
    controllers: Mutex<Vec<Arc<ControllerMirror>>>,
    scan_rounds: AtomicU64,
    scan_restarts: AtomicU64,
}

impl Supervisor {
    pub fn new(
        sdo: Arc<SdoClient>,
        config: SupervisorConfig,
        clock: Arc<dyn Clock>,
        shutdown: Arc<AtomicBool>,
    ) -> Supervisor {
        let scanner = Scanner::new(Arc::clone(&sdo), config.scan_timeout);
        Supervisor {
            sdo,
            scanner,
            clock,
            config,
            shutdown,
            controllers: Mutex::new(Vec::new()),
            scan_rounds: AtomicU64::new(0),
            scan_restarts: AtomicU64::new(0),
        }
    }

    /// Mirrors of every controller found by the most recent scan.
    pub fn controllers(&self) -> Vec<Arc<ControllerMirror>> {
        self.controllers.lock().unwrap().clone()
    }

    pub fn controller(&self, node: NodeId) -> Option<Arc<ControllerMirror>> {
        self.controllers
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.node_id() == node)
            .cloned()
    }

    pub fn scan_rounds(&self) -> u64 {
        self.scan_rounds.load(Ordering::Relaxed)
    }

    pub fn scan_restarts(&self) -> u64 {
        self.scan_restarts.load(Ordering::Relaxed)
    }

    /// Runs one scan and atomically replaces the published mirror set.
    ///
    /// Mirrors are fresh on every scan; whatever the old set accumulated
    /// is gone, exactly as on the original connection loss path.
    pub fn scan_and_publish(&self) -> Result<Vec<Arc<ControllerMirror>>> {
        self.scan_rounds.fetch_add(1, Ordering::Relaxed);
        let live = self.scanner.scan()?;
        let mirrors: Vec<Arc<ControllerMirror>> = live
            .into_iter()
            .map(|node| Arc::new(ControllerMirror::new(node)))
            .collect();
        *self.controllers.lock().unwrap() = mirrors.clone();
        Ok(mirrors)
    }

    fn decode(path: &AttributePath, raw: u32) -> AttributeValue {
        match path {
            AttributePath::AdcTrim => AttributeValue::Byte(raw as u8 & ADC_TRIM_MASK),
            AttributePath::ConnectedChips { .. } => AttributeValue::Word(raw as u16),
            AttributePath::ChipStatus { .. } => AttributeValue::Flag(raw != 0),
            AttributePath::ChipMonitoring { .. } => {
                AttributeValue::Monitoring(MonitoringTriplet::unpack(raw))
            }
            AttributePath::ChipRegister { .. } => AttributeValue::Byte(raw as u8),
            AttributePath::ChipAdc { .. } => {
                AttributeValue::Word(raw as u16 & FIELD_MASK_10BIT)
            }
        }
    }

    /// Reads one attribute and pushes it into the mirror. A failed read
    /// leaves the mirror value unchanged and only costs this attribute
    /// this round.
    fn poll_attribute(
        &self,
        mirror: &ControllerMirror,
        path: AttributePath,
        timeout: Duration,
    ) -> Result<bool> {
        let node = mirror.node_id();
        let (index, sub) = path.sdo_address();
        match self.sdo.read(node, index, sub, timeout) {
            Ok(raw) => {
                let value = Self::decode(&path, raw);
                if let Err(e) = mirror.set(path, value, WriterTag::Server) {
                    log::warn!("Discarding polled {} of node {}: {}", path, node, e);
                }
                Ok(true)
            }
            Err(Error::TransportLost) => Err(Error::TransportLost),
            Err(e) => {
                log::warn!("{} of node {} not read this round: {}", path, node, e);
                Ok(false)
            }
        }
    }

    fn poll_chip(&self, mirror: &ControllerMirror, sub_master: u8, chip: u8) -> Result<u32> {
        let mut successes = 0;
        let mut paths = Vec::with_capacity(23);
        paths.push(AttributePath::ChipMonitoring { sub_master, chip });
        paths.push(AttributePath::ChipStatus { sub_master, chip });
        for channel in 0..ADC_CHANNELS {
            paths.push(AttributePath::ChipAdc {
                sub_master,
                chip,
                channel,
            });
        }
        for register in &ChipRegister::ALL {
            paths.push(AttributePath::ChipRegister {
                sub_master,
                chip,
                register: *register,
            });
        }
        for path in paths {
            if self.poll_attribute(mirror, path, self.config.attribute_timeout)? {
                successes += 1;
            }
        }
        Ok(successes)
    }

    /// One full sweep of one controller. Returns whether any exchange with
    /// the node succeeded; only a lost transport is an error.
    pub fn sweep_controller(&self, mirror: &ControllerMirror) -> Result<bool> {
        let node = mirror.node_id();
        let mut alive = false;
        for sub_master in 0..SUB_MASTERS {
            let path = AttributePath::ConnectedChips { sub_master };
            let (index, sub) = path.sdo_address();
            let bitmap = match self.sdo.read(node, index, sub, self.config.bitmap_timeout) {
                Ok(raw) => raw as u16,
                Err(Error::TransportLost) => return Err(Error::TransportLost),
                Err(e) => {
                    log::warn!(
                        "Chain {} of node {} skipped this round: {}",
                        sub_master,
                        node,
                        e
                    );
                    continue;
                }
            };
            alive = true;
            if let Err(e) = mirror.set(path, AttributeValue::Word(bitmap), WriterTag::Server) {
                log::warn!("Discarding bitmap of chain {}: {}", sub_master, e);
            }
            for chip in mirror.present_chips(sub_master)? {
                if self.poll_chip(mirror, sub_master, chip)? > 0 {
                    alive = true;
                }
            }
        }
        // Controller-level trim rides along with every sweep.
        if self.poll_attribute(mirror, AttributePath::AdcTrim, self.config.attribute_timeout)? {
            alive = true;
        }
        Ok(alive)
    }

    /// One sweep over every published controller. Returns the nodes whose
    /// sweep saw no successful exchange at all.
    pub fn sweep_once(&self) -> Result<Vec<NodeId>> {
        let mut dead = Vec::new();
        for mirror in self.controllers() {
            if !self.sweep_controller(&mirror)? {
                dead.push(mirror.node_id());
            }
        }
        Ok(dead)
    }

    /// Writes the four connected-chip bitmaps to the controller and stages
    /// them in its mirror.
    pub fn set_connected_chips(&self, node: NodeId, bitmaps: [u16; 4]) -> Result<()> {
        let mirror = self.controller(node).ok_or(Error::UnknownController(node))?;
        log::info!("Transmitting connected-chip info to node {}", node);
        for (sub_master, bitmap) in bitmaps.iter().enumerate() {
            let path = AttributePath::ConnectedChips {
                sub_master: sub_master as u8,
            };
            let (index, sub) = path.sdo_address();
            self.sdo.write(
                node,
                index,
                sub,
                *bitmap as u32,
                self.config.attribute_timeout,
            )?;
            if let Err(e) = mirror.set(path, AttributeValue::Word(*bitmap), WriterTag::Server) {
                log::warn!("Mirror rejected bitmap for chain {}: {}", sub_master, e);
            }
        }
        Ok(())
    }

    /// Main lifecycle: scan with retry, then sweep until shutdown,
    /// escalating to a rescan on a lost transport or on
    /// `sweep_failure_limit` consecutive dead sweeps of one controller.
    pub fn run(&self) -> Result<()> {
        let mut scan_failures = 0;
        'lifecycle: loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.scan_and_publish() {
                Ok(_) => {
                    scan_failures = 0;
                }
                Err(e) => {
                    scan_failures += 1;
                    log::error!("Scan attempt {} failed: {}", scan_failures, e);
                    if scan_failures >= self.config.scan_attempts {
                        log::error!("Giving up after {} scan attempts", scan_failures);
                        return Err(e);
                    }
                    log::info!(
                        "Restarting scan in {} s",
                        self.config.rescan_wait.as_secs()
                    );
                    self.clock.sleep(self.config.rescan_wait);
                    continue;
                }
            }

            let mut dead_sweeps: HashMap<u8, u32> = HashMap::new();
            while !self.shutdown.load(Ordering::SeqCst) {
                let dead = match self.sweep_once() {
                    Ok(dead) => dead,
                    Err(_) => {
                        log::error!("Transport lost; restarting scan");
                        self.scan_restarts.fetch_add(1, Ordering::Relaxed);
                        continue 'lifecycle;
                    }
                };
                for mirror in self.controllers() {
                    let raw = mirror.node_id().raw();
                    if dead.contains(&mirror.node_id()) {
                        let count = dead_sweeps.entry(raw).or_insert(0);
                        *count += 1;
                        if *count >= self.config.sweep_failure_limit {
                            log::error!(
                                "Node {} dead for {} consecutive sweeps; restarting scan",
                                raw,
                                count
                            );
                            self.scan_restarts.fetch_add(1, Ordering::Relaxed);
                            continue 'lifecycle;
                        }
                    } else {
                        dead_sweeps.insert(raw, 0);
                    }
                }
                if self.config.sweep_pause > Duration::from_millis(0) {
                    self.clock.sleep(self.config.sweep_pause);
                }
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rx::RxQueue;
    use crate::sim::SimulatedController;
    use crate::transport::{Transport, TransportFactory};
    use dcs_canif::virtual_bus;
    use std::sync::atomic::AtomicUsize;

    struct TestClock {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl TestClock {
        fn new() -> Arc<TestClock> {
            Arc::new(TestClock {
                sleeps: Mutex::new(Vec::new()),
            })
        }
    }

    impl Clock for TestClock {
        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    struct Rig {
        supervisor: Arc<Supervisor>,
        clock: Arc<TestClock>,
        shutdown: Arc<AtomicBool>,
        sim_thread: Option<thread::JoinHandle<()>>,
    }

    impl Rig {
        fn with_sim(sim: Option<Arc<SimulatedController>>, config: SupervisorConfig) -> Rig {
            let factory = TransportFactory::new(125_000).unwrap();
            let (channel, peer) = virtual_bus::pair();
            let rx = Arc::new(RxQueue::new());
            let transport = factory.direct(Box::new(channel), Arc::clone(&rx)).unwrap();
            transport.open().unwrap();
            let shutdown = Arc::new(AtomicBool::new(false));
            let sim_thread =
                sim.map(|sim| sim.spawn(peer, Arc::clone(&shutdown)));
            let sdo = Arc::new(SdoClient::new(transport, rx));
            let clock = TestClock::new();
            let injected: Arc<dyn Clock> = clock.clone();
            let supervisor = Arc::new(Supervisor::new(sdo, config, injected, Arc::clone(&shutdown)));
            Rig {
                supervisor,
                clock,
                shutdown,
                sim_thread,
            }
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::SeqCst);
            if let Some(handle) = self.sim_thread.take() {
                let _ = handle.join();
            }
        }
    }

    fn quick_config() -> SupervisorConfig {
        SupervisorConfig {
            scan_timeout: Duration::from_millis(10),
            bitmap_timeout: Duration::from_millis(200),
            attribute_timeout: Duration::from_millis(200),
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn sweep_visits_exactly_the_present_chips() {
        let sim = Arc::new(SimulatedController::new(NodeId::new(42).unwrap()));
        sim.preset_connected(1, 0x0005);
        let rig = Rig::with_sim(Some(Arc::clone(&sim)), quick_config());

        let mirrors = rig.supervisor.scan_and_publish().unwrap();
        assert_eq!(mirrors.len(), 1);
        let mirror = &mirrors[0];
        assert_eq!(mirror.node_id().raw(), 42);

        let polled = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&polled);
        mirror.subscribe(None, move |path, _, writer| {
            assert_eq!(writer, WriterTag::Server);
            if let AttributePath::ChipMonitoring { sub_master, chip } = path {
                assert_eq!(*sub_master, 1);
                assert!(*chip == 0 || *chip == 2);
                p.fetch_add(1, Ordering::SeqCst);
            }
        });

        let dead = rig.supervisor.sweep_once().unwrap();
        assert!(dead.is_empty());
        assert_eq!(polled.load(Ordering::SeqCst), 2);
        assert_eq!(mirror.present_chips(1).unwrap(), vec![0, 2]);

        // The present chips carry live monitoring data, the absent ones
        // keep their defaults.
        match mirror
            .get(AttributePath::ChipMonitoring { sub_master: 1, chip: 0 })
            .unwrap()
        {
            AttributeValue::Monitoring(t) => assert!(t.temperature >= 0x200),
            other => panic!("unexpected value {:?}", other),
        }
        match mirror
            .get(AttributePath::ChipMonitoring { sub_master: 1, chip: 1 })
            .unwrap()
        {
            AttributeValue::Monitoring(t) => assert_eq!(t.temperature, 0),
            other => panic!("unexpected value {:?}", other),
        }
        match mirror
            .get(AttributePath::ChipStatus { sub_master: 1, chip: 2 })
            .unwrap()
        {
            AttributeValue::Flag(v) => assert!(v),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn bitmap_write_reaches_the_device_and_next_sweep() {
        let sim = Arc::new(SimulatedController::new(NodeId::new(7).unwrap()));
        let rig = Rig::with_sim(Some(Arc::clone(&sim)), quick_config());
        rig.supervisor.scan_and_publish().unwrap();

        rig.supervisor
            .set_connected_chips(NodeId::new(7).unwrap(), [0x0001, 0, 0, 0x8000])
            .unwrap();
        rig.supervisor.sweep_once().unwrap();

        let mirror = rig.supervisor.controller(NodeId::new(7).unwrap()).unwrap();
        assert_eq!(mirror.present_chips(0).unwrap(), vec![0]);
        assert_eq!(mirror.present_chips(3).unwrap(), vec![15]);
        match mirror
            .get(AttributePath::ChipStatus { sub_master: 3, chip: 15 })
            .unwrap()
        {
            AttributeValue::Flag(v) => assert!(v),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn empty_bus_retries_then_goes_fatal() {
        let mut config = quick_config();
        config.scan_timeout = Duration::from_millis(1);
        let rig = Rig::with_sim(None, config);
        let result = rig.supervisor.run();
        assert!(matches!(result, Err(Error::BusEmpty)));
        // Two 60-second pauses were requested from the injected clock
        // before the third attempt went fatal.
        let sleeps = rig.clock.sleeps.lock().unwrap();
        assert_eq!(
            sleeps.as_slice(),
            &[Duration::from_secs(60), Duration::from_secs(60)]
        );
        assert_eq!(rig.supervisor.scan_rounds(), 3);
    }
}

use anyhow::Result;
use dcs_gateway::rx::RxQueue;
use dcs_gateway::scan::Scanner;
use dcs_gateway::sdo::SdoClient;
use dcs_gateway::sim::SimulatedController;
use dcs_gateway::transport::{Transport, TransportFactory};
use dcs_canif::{virtual_bus, NodeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scans a virtual bus with a handful of simulated controllers attached.
pub fn main() -> Result<()> {
    env_logger::init();

    let factory = TransportFactory::new(125_000)?;
    let rx = Arc::new(RxQueue::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    // One virtual channel per simulated node, all feeding the same
    // receive queue through their own transport would be overkill here;
    // a single channel with one node is enough to watch a scan happen.
    let (channel, peer) = virtual_bus::pair();
    let transport = factory.direct(Box::new(channel), Arc::clone(&rx))?;
    transport.open()?;

    let sim = Arc::new(SimulatedController::new(NodeId::new(42)?));
    let sim_thread = sim.spawn(peer, Arc::clone(&shutdown));

    let sdo = Arc::new(SdoClient::new(transport.clone(), rx));
    let scanner = Scanner::new(Arc::clone(&sdo), Duration::from_millis(10));
    let live = scanner.scan()?;
    for node in &live {
        println!("node {} is on the bus", node);
    }
    println!("counters: {:#?}", sdo.counters());

    shutdown.store(true, Ordering::SeqCst);
    sim_thread.join().ok();
    transport.close()?;
    Ok(())
}

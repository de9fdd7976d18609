use anyhow::Result;
use dcs_gateway::bridge::{ExternalBridge, DEFAULT_WRITE_TIMEOUT};
use dcs_gateway::mirror::{AttributePath, AttributeValue, ChipRegister, WriterTag};
use dcs_gateway::rx::RxQueue;
use dcs_gateway::sdo::SdoClient;
use dcs_gateway::sim::{controller_dictionary, SimulatedController};
use dcs_gateway::supervisor::{Supervisor, SupervisorConfig, SystemClock};
use dcs_gateway::transport::{Transport, TransportFactory};
use dcs_canif::{virtual_bus, NodeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Brings the whole engine up against one simulated controller: scan,
/// provision the connected chips, run a sweep and push one external write
/// through the bridge.
pub fn main() -> Result<()> {
    env_logger::init();

    let node = NodeId::new(42)?;
    let factory = TransportFactory::new(125_000)?;
    let rx = Arc::new(RxQueue::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let (channel, peer) = virtual_bus::pair();
    let transport = factory.direct(Box::new(channel), Arc::clone(&rx))?;
    transport.open()?;
    let sim = Arc::new(SimulatedController::new(node));
    let sim_thread = sim.spawn(peer, Arc::clone(&shutdown));

    let sdo = Arc::new(SdoClient::new(transport.clone(), rx));
    let config = SupervisorConfig {
        scan_timeout: Duration::from_millis(10),
        ..SupervisorConfig::default()
    };
    let supervisor = Supervisor::new(
        Arc::clone(&sdo),
        config,
        Arc::new(SystemClock),
        Arc::clone(&shutdown),
    );
    let bridge = ExternalBridge::new(
        Arc::clone(&sdo),
        Arc::new(controller_dictionary(0)),
        DEFAULT_WRITE_TIMEOUT,
    );

    let mirrors = supervisor.scan_and_publish()?;
    bridge.attach_all(&mirrors);
    bridge.subscribe(node, None, |path, value, writer| {
        let origin = match writer {
            WriterTag::Server => "poll",
            WriterTag::External => "peer",
        };
        println!("[{}] {} = {:?}", origin, path, value);
    })?;

    supervisor.set_connected_chips(node, [0x0005, 0, 0, 0])?;
    supervisor.sweep_once()?;

    bridge.submit_external_write(
        node,
        AttributePath::ChipRegister {
            sub_master: 0,
            chip: 0,
            register: ChipRegister::Control,
        },
        AttributeValue::Byte(0x2A),
    )?;

    let mirror = supervisor.controller(node).expect("node scanned");
    println!(
        "chips present on chain 0: {:?}",
        mirror.present_chips(0)?
    );
    println!("counters: {:#?}", sdo.counters());

    shutdown.store(true, Ordering::SeqCst);
    sim_thread.join().ok();
    transport.close()?;
    Ok(())
}

use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use wsrtu::{AnalogDevice, RelayDevice, RtuMaster};

const RUN_TIME: Duration = Duration::from_secs(30);

fn main() {
    env_logger::init();

    let port = std::env::args().nth(1).unwrap_or_else(|| "ttyUSB0".to_string());
    println!("ports known to the system: {:?}", wsrtu::available_ports().unwrap_or_default());

    let master = RtuMaster::new();
    master.set_port_name(&port);

    let relay = RelayDevice::new(&master);
    let adc = AnalogDevice::new(&master);
    let relay_events = relay.subscribe();
    let adc_events = adc.subscribe();

    relay.open();
    adc.open();

    std::thread::spawn(move || {
        for event in adc_events {
            println!("adc: {:?}", event);
        }
    });

    let deadline = Instant::now() + RUN_TIME;
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match relay_events.recv_timeout(timeout) {
            Ok(event) => println!("relay: {:?}", event),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    println!("firmware: relay {:#06x}, adc {:#06x}",
        relay.firmware_version(), adc.firmware_version());
    relay.close();
}

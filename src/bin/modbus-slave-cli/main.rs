use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

use clap::Parser;
use log::{debug, info, warn, LevelFilter};

use modbus_slave::codec::{RegValue, ValueTag};
use modbus_slave::error::StoreError;
use modbus_slave::link::{LinkContext, SerialLink};
use modbus_slave::register::{Permission, Ref, RegisterDescriptor, RegisterStore, RegisterTable};

/// Demo register map: a handful of holding registers any `modbus-slave-cli`
/// session exposes, for exercising the link against a real master.
static DEMO_REGISTERS: [RegisterDescriptor; 3] = [
    RegisterDescriptor::new(40001, 1, ValueTag::Integer, 0, Permission::READ_WRITE)
        .with_description("uptime seconds (demo counter)", "system"),
    RegisterDescriptor::new(40002, 1, ValueTag::Integer, 1, Permission::READ_WRITE)
        .with_description("setpoint, scaled x10 on the wire", "control"),
    RegisterDescriptor::new(40003, 2, ValueTag::Float, 0, Permission::READ),
];

struct DemoStore(HashMap<Ref, RegValue>);

impl DemoStore {
    fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(40001, RegValue::Integer(0));
        map.insert(40002, RegValue::Integer(250));
        map.insert(40003, RegValue::Float(98.6));
        DemoStore(map)
    }
}

impl RegisterStore for DemoStore {
    fn load(&mut self, reference: Ref, _tag: ValueTag) -> Result<RegValue, StoreError> {
        self.0.get(&reference).copied().ok_or(StoreError::NotFound)
    }

    fn save(&mut self, reference: Ref, value: RegValue) -> Result<(), StoreError> {
        self.0.insert(reference, value);
        Ok(())
    }
}

struct PortContext {
    port: Box<dyn serialport::SerialPort>,
}

impl LinkContext for PortContext {
    fn send_frame(&mut self, frame: &[u8]) {
        if let Err(err) = self.port.write_all(frame) {
            warn!("failed to write response frame: {err}");
        }
    }
}

/// Demo Modbus RTU slave: listens on a real serial port and answers Modbus
/// requests against an in-memory register map.
#[derive(Parser, Debug)]
#[command(name = "modbus-slave-cli")]
struct Args {
    /// Serial device, e.g. /dev/ttyUSB0
    #[arg(long)]
    port: String,

    #[arg(long, default_value_t = 19200)]
    baud: u32,

    #[arg(long, default_value_t = 1)]
    slave_id: u8,

    /// Inter-frame idle gap, in microseconds, treated as the frame delimiter
    /// (this host-side timing decision is the CLI's own, per the silence-based
    /// delimiter rule of Modbus RTU; the core crate has no timer of its own).
    #[arg(long, default_value_t = 1750)]
    silence_us: u64,
}

fn main() {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let write_half = match serialport::new(&args.port, args.baud)
        .timeout(Duration::from_micros(args.silence_us))
        .open()
    {
        Ok(port) => port,
        Err(err) => {
            eprintln!("failed to open {}: {err}", args.port);
            std::process::exit(1);
        }
    };
    let mut read_half = match write_half.try_clone() {
        Ok(port) => port,
        Err(err) => {
            eprintln!("failed to clone handle to {}: {err}", args.port);
            std::process::exit(1);
        }
    };

    let table = RegisterTable::new(&DEMO_REGISTERS, DemoStore::new());
    let context = PortContext { port: write_half };
    let mut link: SerialLink<DemoStore, PortContext> = SerialLink::new(args.slave_id, table, context);

    info!("listening on {} at {} baud, slave id {}", args.port, args.baud, args.slave_id);

    let mut byte = [0u8; 1];
    loop {
        match read_half.read(&mut byte) {
            Ok(1) => {
                link.putchar(byte[0]);
            }
            Ok(_) => unreachable!("read of a 1-byte buffer returns 0 or 1"),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                // Silence since the last byte: treat whatever is buffered as
                // one complete frame and let the link validate it.
                match link.frame_delimited() {
                    Ok(()) => debug!("frame dispatched, stats = {:?}", link.stats()),
                    Err(err) => debug!("dropped frame: {err}"),
                }
            }
            Err(err) => {
                warn!("serial read error: {err}");
            }
        }
    }
}

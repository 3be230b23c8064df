//! Loopback demonstration: TCP server, client and a polled device
//! sharing one process.
//!
//! Run with `RUST_LOG=info cargo run --bin demo`.

use std::sync::Arc;
use std::time::Duration;

use grid_modbus::{
    sink_f32, ModbusClient, ModbusServer, ModbusTcpClient, ModbusTcpServer,
    ModbusTcpServerConfig, PolledDevice, RegisterBank, RegisterMapping, SourceFormat, WordOrder,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Server with the in-memory register bank, bound to an ephemeral
    // port so the demo never collides with a real installation.
    let bank = Arc::new(RegisterBank::new());
    bank.set_holding_registers(0, &[0x002A, 0x0014, 0x1234])?;

    // Registers 100-101: 230.5 V as a low-word-first float.
    let voltage = grid_modbus::codec::from_f32(230.5, WordOrder::LowFirst);
    bank.set_holding_registers(100, &voltage)?;

    let config = ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".parse()?,
        ..Default::default()
    };
    let mut server = ModbusTcpServer::with_config(config, bank.clone());
    server.start().await?;
    let address = server.local_addr().expect("server bound");
    println!("server listening on {}", address);

    // Client exercising reads and writes.
    let client = Arc::new(ModbusTcpClient::new(address, Duration::from_secs(5)).await?);

    let registers = client.read_holding_registers(1, 0, 3).await?;
    println!("holding registers 0..3 = {:04X?}", registers);

    client.write_single_register(1, 10, 999).await?;
    client
        .write_multiple_coils(1, 0, &[true, false, true, true])
        .await?;
    let coils = client.read_coils(1, 0, 4).await?;
    println!("coils 0..4 = {:?}", coils);

    // Polled device mirroring the voltage register pair every 500 ms.
    let device = PolledDevice::new(client.clone(), 1).with_period(Duration::from_millis(500));
    device
        .add_mapping(RegisterMapping::scaled(
            100,
            2,
            SourceFormat::LittleEndianFloat,
            sink_f32(|v| println!("voltage mirror: {v} V")),
        )?)
        .await;
    device.start_polling();

    tokio::time::sleep(Duration::from_millis(1600)).await;

    device.stop_polling();
    client.close().await?;
    server.stop().await?;
    println!("demo complete");
    Ok(())
}

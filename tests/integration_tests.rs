//! Integration tests exercising the library components together:
//! wire-format conformance, loopback TCP client/server round trips,
//! the single-permit client gate and failure semantics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use grid_modbus::{
    crc16, sink_f32, ClientEvent, ModbusClient, ModbusError, ModbusRequest, ModbusServer,
    ModbusTcpClient, ModbusTcpServer, ModbusTcpServerConfig, PolledDevice, RegisterBank,
    RegisterMapping, ServerEvent, ServerId, SourceFormat, WordOrder,
};

/// Build a complete RTU frame for a request: unit + PDU + CRC.
fn rtu_frame(request: &ModbusRequest) -> Vec<u8> {
    let pdu = request.pdu();
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(request.unit_id);
    frame.extend_from_slice(&pdu);
    frame.extend_from_slice(&[0, 0]);
    crc16::fill_crc(&mut frame).unwrap();
    frame
}

/// Accept one connection, capture one request, answer with
/// `respond(request)` and return the captured request bytes.
async fn one_shot_server<F>(respond: F) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>)
where
    F: FnOnce(&[u8]) -> Vec<u8> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 512];
        let n = stream.read(&mut buf).await.unwrap();
        let request = buf[..n].to_vec();
        let response = respond(&request);
        if !response.is_empty() {
            stream.write_all(&response).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        request
    });
    (addr, handle)
}

/// Start a TCP server on an ephemeral port backed by `bank`.
async fn start_bank_server(bank: Arc<RegisterBank>) -> (ModbusTcpServer, SocketAddr) {
    let config = ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    let mut server = ModbusTcpServer::with_config(config, bank);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

// ---------------------------------------------------------------------------
// Wire-format scenarios
// ---------------------------------------------------------------------------

#[test]
fn s1_rtu_read_holding_registers() {
    let request = ModbusRequest::read(
        7,
        grid_modbus::FunctionCode::ReadHoldingRegisters,
        11,
        13,
    );
    assert_eq!(
        rtu_frame(&request),
        vec![0x07, 0x03, 0x00, 0x0B, 0x00, 0x0D, 0xF5, 0xAB]
    );
}

#[test]
fn s2_rtu_write_single_register() {
    let request = ModbusRequest::write_single_register(1, 7, 42);
    assert_eq!(
        rtu_frame(&request),
        vec![0x01, 0x06, 0x00, 0x07, 0x00, 0x2A, 0xB9, 0xD4]
    );
}

#[test]
fn s3_rtu_write_coil_on() {
    let request = ModbusRequest::write_single_coil(1, 7, true);
    assert_eq!(
        rtu_frame(&request),
        vec![0x01, 0x05, 0x00, 0x07, 0xFF, 0x00, 0x3D, 0xFB]
    );
}

#[test]
fn s4_rtu_read_coils() {
    let request = ModbusRequest::read(17, grid_modbus::FunctionCode::ReadCoils, 13, 7);
    assert_eq!(
        rtu_frame(&request),
        vec![0x11, 0x01, 0x00, 0x0D, 0x00, 0x07, 0xEE, 0x9B]
    );
}

#[test]
fn s5_rtu_write_multiple_coils() {
    let values: Vec<bool> = (0..17).map(|i| i % 2 == 0).collect();
    let request = ModbusRequest::write_multiple_coils(17, 19, &values);
    assert_eq!(
        rtu_frame(&request),
        vec![0x11, 0x0F, 0x00, 0x13, 0x00, 0x11, 0x03, 0x55, 0x55, 0x01, 0x51, 0xA1]
    );
}

#[tokio::test]
async fn s6_tcp_read_holding_registers() {
    let (addr, handle) = one_shot_server(|request| {
        // 13 registers back: byte count 26, MBAP length 29.
        let mut response = Vec::new();
        response.extend_from_slice(&request[0..2]);
        response.extend_from_slice(&[0x00, 0x00, 0x00, 0x1D, 0x07, 0x03, 0x1A]);
        response.extend_from_slice(&[0u8; 26]);
        response
    })
    .await;

    let client = ModbusTcpClient::new(addr, Duration::from_secs(1)).await.unwrap();
    let registers = client.read_holding_registers(7, 11, 13).await.unwrap();
    assert_eq!(registers.len(), 13);

    let request = handle.await.unwrap();
    assert_eq!(
        request,
        vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x07, 0x03, 0x00, 0x0B, 0x00, 0x0D]
    );
}

#[tokio::test]
async fn s7_tcp_write_coil_on_frames_ffff() {
    let (addr, handle) = one_shot_server(|request| request.to_vec()).await;

    let client = ModbusTcpClient::new(addr, Duration::from_secs(1)).await.unwrap();
    client.write_single_coil(1, 7, true).await.unwrap();

    let request = handle.await.unwrap();
    assert_eq!(
        request,
        vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0x07, 0xFF, 0xFF]
    );
}

#[tokio::test]
async fn tcp_write_register_normalises_legacy_addresses() {
    let (addr, handle) = one_shot_server(|request| request.to_vec()).await;

    let client = ModbusTcpClient::new(addr, Duration::from_secs(1)).await.unwrap();
    // 40008 is register 7 in the legacy 4xxxx notation.
    client.write_single_register(1, 40008, 42).await.unwrap();

    let request = handle.await.unwrap();
    assert_eq!(
        request,
        vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x07, 0x00, 0x2A]
    );
}

// ---------------------------------------------------------------------------
// CRC reference vectors
// ---------------------------------------------------------------------------

#[test]
fn crc_matches_reference_vectors() {
    let cases: &[(&[u8], [u8; 2])] = &[
        (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], [0xC4, 0x0B]),
        (&[0x01, 0x04, 0x00, 0x00, 0x00, 0x01], [0x31, 0xCA]),
        (&[0x11, 0x01, 0x00, 0x13, 0x00, 0x25], [0x0E, 0x84]),
    ];
    for (data, wire_bytes) in cases {
        let crc = crc16::crc16(data);
        assert_eq!(
            [(crc & 0xFF) as u8, (crc >> 8) as u8],
            *wire_bytes,
            "vector {:02X?}",
            data
        );
    }
}

// ---------------------------------------------------------------------------
// Loopback client/server round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loopback_register_write_read_roundtrip() {
    let bank = Arc::new(RegisterBank::new());
    let (mut server, addr) = start_bank_server(bank).await;
    let client = ModbusTcpClient::new(addr, Duration::from_secs(2)).await.unwrap();

    let values: Vec<u16> = (0..50).map(|i| i * 3 + 7).collect();
    client.write_multiple_registers(1, 200, &values).await.unwrap();
    let read_back = client.read_holding_registers(1, 200, 50).await.unwrap();
    assert_eq!(read_back, values);

    // A full 125-register write is within the per-transaction cap.
    let full: Vec<u16> = (0..125).map(|i| 0x8000 | i).collect();
    client.write_multiple_registers(1, 500, &full).await.unwrap();
    assert_eq!(
        client.read_holding_registers(1, 500, 125).await.unwrap(),
        full
    );

    client.write_single_register(1, 300, 0xBEEF).await.unwrap();
    assert_eq!(
        client.read_holding_registers(1, 300, 1).await.unwrap(),
        vec![0xBEEF]
    );

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn loopback_coil_pack_unpack_roundtrip() {
    let bank = Arc::new(RegisterBank::new());
    let (mut server, addr) = start_bank_server(bank).await;
    let client = ModbusTcpClient::new(addr, Duration::from_secs(2)).await.unwrap();

    let pattern: Vec<bool> = (0..23).map(|i| i % 5 != 2).collect();
    client.write_multiple_coils(1, 40, &pattern).await.unwrap();
    let read_back = client.read_coils(1, 40, 23).await.unwrap();
    assert_eq!(read_back, pattern);

    client.write_single_coil(1, 80, true).await.unwrap();
    assert_eq!(client.read_coils(1, 80, 1).await.unwrap(), vec![true]);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn loopback_read_write_multiple_registers() {
    let bank = Arc::new(RegisterBank::new());
    bank.set_holding_registers(10, &[0xAAAA, 0xBBBB]).unwrap();
    let (mut server, addr) = start_bank_server(bank).await;
    let client = ModbusTcpClient::new(addr, Duration::from_secs(2)).await.unwrap();

    let read = client
        .read_write_multiple_registers(1, 10, 2, 20, &[0x1111, 0x2222])
        .await
        .unwrap();
    assert_eq!(read, vec![0xAAAA, 0xBBBB]);
    assert_eq!(
        client.read_holding_registers(1, 20, 2).await.unwrap(),
        vec![0x1111, 0x2222]
    );

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn loopback_report_server_id() {
    let bank = Arc::new(RegisterBank::new().with_server_id(ServerId {
        server_id: 0x42,
        run_indicator: 0xFF,
        additional_data: b"grid".to_vec(),
    }));
    let (mut server, addr) = start_bank_server(bank).await;
    let client = ModbusTcpClient::new(addr, Duration::from_secs(2)).await.unwrap();

    let id = client.report_server_id(1).await.unwrap();
    assert_eq!(id.server_id, 0x42);
    assert_eq!(id.run_indicator, 0xFF);
    assert_eq!(id.additional_data, b"grid");

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn loopback_exception_response_maps_to_error() {
    let bank = Arc::new(RegisterBank::with_sizes(16, 16, 16, 16));
    let (mut server, addr) = start_bank_server(bank).await;
    let client = ModbusTcpClient::new(addr, Duration::from_secs(2)).await.unwrap();

    let err = client.read_holding_registers(1, 100, 5).await.unwrap_err();
    match err {
        ModbusError::Exception { function, code, .. } => {
            assert_eq!(function, 0x03);
            assert_eq!(code, 0x02);
        }
        other => panic!("expected exception, got {:?}", other),
    }

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn loopback_float_read_low_word_first() {
    let bank = Arc::new(RegisterBank::new());
    bank.set_holding_registers(100, &grid_modbus::codec::from_f32(230.5, WordOrder::LowFirst))
        .unwrap();
    let (mut server, addr) = start_bank_server(bank).await;
    let client = ModbusTcpClient::new(addr, Duration::from_secs(2)).await.unwrap();

    let floats = client.read_holding_registers_f32(1, 100, 1).await.unwrap();
    assert_eq!(floats.len(), 1);
    assert!((floats[0] - 230.5).abs() < f32::EPSILON);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Concurrency and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_callers_share_one_client() {
    let bank = Arc::new(RegisterBank::new());
    bank.set_holding_registers(0, &(0..100u16).collect::<Vec<_>>())
        .unwrap();
    let (mut server, addr) = start_bank_server(bank).await;
    let client = Arc::new(ModbusTcpClient::new(addr, Duration::from_secs(2)).await.unwrap());

    // Eight tasks hammering one client: the single-permit gate must
    // keep frames from interleaving, so every response parses.
    let mut tasks = Vec::new();
    for task_id in 0..8u16 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..5u16 {
                let start = (task_id * 10 + round) % 90;
                let registers = client.read_holding_registers(1, start, 10).await.unwrap();
                assert_eq!(registers[0], start);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn argument_errors_fail_before_io() {
    let (addr, _handle) = one_shot_server(|request| request.to_vec()).await;
    let client = ModbusTcpClient::new(addr, Duration::from_secs(1)).await.unwrap();

    assert!(matches!(
        client.read_holding_registers(1, 0, 126).await,
        Err(ModbusError::InvalidData { .. })
    ));
    assert!(matches!(
        client.read_coils(1, 0, 126).await,
        Err(ModbusError::InvalidData { .. })
    ));
    assert!(matches!(
        client.write_multiple_registers(1, 0, &[]).await,
        Err(ModbusError::InvalidData { .. })
    ));
    assert!(matches!(
        client.write_multiple_registers(1, 0, &[0u16; 126]).await,
        Err(ModbusError::InvalidData { .. })
    ));
    assert!(matches!(
        client.write_multiple_coils(1, 0, &[]).await,
        Err(ModbusError::InvalidData { .. })
    ));
}

#[tokio::test]
async fn response_timeout_surfaces_as_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 512];
        // Swallow the request and go silent.
        let _ = stream.read(&mut buf).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = ModbusTcpClient::new(addr, Duration::from_millis(200)).await.unwrap();
    let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }), "got {:?}", err);
    // A timed-out TCP exchange drops the connection.
    assert!(!client.is_connected());
}

#[tokio::test]
async fn transaction_mismatch_is_a_protocol_fault() {
    let (addr, _handle) = one_shot_server(|request| {
        let mut response = request.to_vec();
        // Corrupt the transaction id.
        response[0] ^= 0xFF;
        response
    })
    .await;

    let client = ModbusTcpClient::new(addr, Duration::from_secs(1)).await.unwrap();
    let err = client.write_single_register(1, 0, 1).await.unwrap_err();
    assert!(
        matches!(err, ModbusError::TransactionMismatch { .. }),
        "got {:?}",
        err
    );
}

#[tokio::test]
async fn client_emits_disconnected_event() {
    let bank = Arc::new(RegisterBank::new());
    let (mut server, addr) = start_bank_server(bank).await;

    let client = ModbusTcpClient::new(addr, Duration::from_secs(1)).await.unwrap();
    let mut events = client.subscribe_events();

    client.close().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), ClientEvent::Disconnected);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_emits_connection_events() {
    let bank = Arc::new(RegisterBank::new());
    let (mut server, addr) = start_bank_server(bank).await;
    let mut events = server.subscribe_events();

    let client = ModbusTcpClient::new(addr, Duration::from_secs(1)).await.unwrap();
    client.read_holding_registers(1, 0, 1).await.unwrap();

    match events.recv().await.unwrap() {
        ServerEvent::ClientConnected(_) => {}
        other => panic!("expected ClientConnected, got {:?}", other),
    }

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Polled device against a live server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn polled_device_mirrors_registers() {
    let bank = Arc::new(RegisterBank::new());
    // Signed 16-bit raw value 500, scaled by 0.1 with offset -40: 10.0.
    bank.set_holding_registers(5, &[500]).unwrap();
    bank.set_holding_registers(100, &grid_modbus::codec::from_f32(42.5, WordOrder::LowFirst))
        .unwrap();

    let (mut server, addr) = start_bank_server(bank).await;
    let client = Arc::new(ModbusTcpClient::new(addr, Duration::from_secs(2)).await.unwrap());

    let scaled = Arc::new(std::sync::Mutex::new(None::<f64>));
    let float = Arc::new(std::sync::Mutex::new(None::<f32>));

    let device = PolledDevice::new(client.clone(), 1).with_period(Duration::from_millis(100));
    {
        let slot = scaled.clone();
        device
            .add_mapping(
                RegisterMapping::scaled(
                    5,
                    1,
                    SourceFormat::BigEndianInteger,
                    move |v| {
                        *slot.lock().unwrap() = Some(v);
                        Ok(())
                    },
                )
                .unwrap()
                .with_scale(0.1)
                .with_offset(-40.0),
            )
            .await;
    }
    {
        let slot = float.clone();
        device
            .add_mapping(
                RegisterMapping::scaled(
                    100,
                    2,
                    SourceFormat::LittleEndianFloat,
                    sink_f32(move |v| {
                        *slot.lock().unwrap() = Some(v);
                    }),
                )
                .unwrap(),
            )
            .await;
    }

    device.refresh().await;

    assert_eq!(scaled.lock().unwrap().unwrap(), 10.0);
    assert!((float.lock().unwrap().unwrap() - 42.5).abs() < f32::EPSILON);

    // Writes route through the same client gate.
    device.write_holding_register(7, &[0x1234]).await.unwrap();
    assert_eq!(
        client.read_holding_registers(1, 7, 1).await.unwrap(),
        vec![0x1234]
    );
    device
        .write_holding_register(8, &[0x0001, 0x0002])
        .await
        .unwrap();
    assert_eq!(
        client.read_holding_registers(1, 8, 2).await.unwrap(),
        vec![0x0001, 0x0002]
    );

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn polled_device_timer_runs_and_stops() {
    let bank = Arc::new(RegisterBank::new());
    bank.set_holding_registers(0, &[7]).unwrap();
    let (mut server, addr) = start_bank_server(bank).await;
    let client = Arc::new(ModbusTcpClient::new(addr, Duration::from_secs(2)).await.unwrap());

    let count = Arc::new(std::sync::Mutex::new(0u32));
    let device = PolledDevice::new(client.clone(), 1).with_period(Duration::from_millis(100));
    {
        let count = count.clone();
        device
            .add_mapping(
                RegisterMapping::scaled(0, 1, SourceFormat::BigEndianInteger, move |_| {
                    *count.lock().unwrap() += 1;
                    Ok(())
                })
                .unwrap(),
            )
            .await;
    }

    device.start_polling();
    assert!(device.is_polling());
    tokio::time::sleep(Duration::from_millis(350)).await;
    device.stop_polling();
    assert!(!device.is_polling());

    // Let any in-flight pass drain before freezing the count.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let frozen = *count.lock().unwrap();
    assert!(frozen >= 2, "expected at least 2 ticks, got {}", frozen);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(*count.lock().unwrap(), frozen, "polling continued after stop");

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

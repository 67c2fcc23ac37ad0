//! Prologix GPIB-ETHERNET transport against an in-process fake controller.

use calseq::catalog::DriverCatalog;
use calseq::config::DeviceBinding;
use calseq::executor::{CancelSignal, RetryPolicy, RunContext, SequenceExecutor};
use calseq::instruction::ResponseValue;
use calseq::sequence::{compile, BindingContext, Operation};
use calseq::transport::{
    GpibTransport, InterfaceHandle, InterfaceManager, PrologixTransport, ReadMode, TcpSettings,
    TimeoutOptions, Transport, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const IDN: &str = "ACME,MODEL123,SN001,v1.0";

/// Accepts one connection, answers `++read eoi` with `reply` and returns
/// every line it received once the client hangs up.
async fn fake_controller(reply: &'static str) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut received = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if line == "++read eoi" {
                write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            }
            received.push(line);
        }
        received
    });
    (port, task)
}

/// Answers the last instrument command on each `++read eoi`. The first
/// `READ?` reply is split, its tail arriving well after `READ_TIMEOUT`.
async fn slow_controller() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut last = String::new();
        let mut volt_reads = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            if line != "++read eoi" {
                if !line.starts_with("++") {
                    last = line;
                }
                continue;
            }
            if last == "READ?" {
                volt_reads += 1;
                if volt_reads == 1 {
                    write.write_all(b"+1.0").await.unwrap();
                    tokio::time::sleep(READ_TIMEOUT + Duration::from_millis(100)).await;
                    write.write_all(b"0E+00\n").await.unwrap();
                } else {
                    write.write_all(b"+2.00E+00\n").await.unwrap();
                }
            } else if last == "*IDN?" {
                write.write_all(format!("{}\n", IDN).as_bytes()).await.unwrap();
            }
        }
    });
    port
}

const READ_TIMEOUT: Duration = Duration::from_millis(200);

fn slow_transport(port: u16) -> PrologixTransport {
    let mut prologix = transport(port);
    prologix
        .configure(TimeoutOptions {
            read_timeout: READ_TIMEOUT,
            ..TimeoutOptions::default()
        })
        .unwrap();
    prologix
}

fn transport(port: u16) -> PrologixTransport {
    PrologixTransport::tcp(
        "bench-gpib",
        TcpSettings {
            host: "127.0.0.1".to_string(),
            port,
        },
    )
}

#[tokio::test]
async fn test_connect_initializes_controller() {
    let (port, server) = fake_controller(IDN).await;
    let mut prologix = transport(port);

    prologix.connect().await.unwrap();
    prologix.set_address(22).await.unwrap();
    prologix.set_address(22).await.unwrap();
    prologix.write_string("*IDN?").await.unwrap();
    let reply = prologix.read(ReadMode::Terminated).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&reply).trim(), IDN);
    prologix.disconnect().await.unwrap();

    let lines = server.await.unwrap();
    assert_eq!(&lines[..4], &["++savecfg 0", "++auto 0", "++mode 1", "++ifc"]);
    assert!(lines[4].starts_with("++eos "));
    // address is cached after the first ++addr
    assert_eq!(lines.iter().filter(|l| *l == "++addr 22").count(), 1);
    assert_eq!(&lines[6..], &["*IDN?", "++read eoi"]);
}

#[tokio::test]
async fn test_trigger_splits_long_address_lists() {
    let (port, server) = fake_controller(IDN).await;
    let mut prologix = transport(port);
    prologix.connect().await.unwrap();

    let addresses: Vec<u8> = (1..=17).collect();
    prologix.trigger(&addresses).await.unwrap();
    prologix.selected_device_clear(Some(4)).await.unwrap();
    prologix.disconnect().await.unwrap();

    let lines = server.await.unwrap();
    let triggers: Vec<&String> = lines.iter().filter(|l| l.starts_with("++trg")).collect();
    assert_eq!(triggers.len(), 2);
    assert_eq!(triggers[1].as_str(), "++trg 16 17");
    assert!(lines.ends_with(&["++addr 4".to_string(), "++clr".to_string()]));
}

#[tokio::test]
async fn test_query_sequence_over_prologix() {
    let (port, server) = fake_controller(IDN).await;
    let manager = InterfaceManager::new();
    manager
        .register(InterfaceHandle::Gpib(Box::new(transport(port))))
        .unwrap();
    manager.enable_all();
    let manager = Arc::new(manager);

    let executor = SequenceExecutor::new(
        Arc::clone(&manager),
        vec![DeviceBinding {
            unit_id: "DMM1".to_string(),
            interface: "bench-gpib".to_string(),
            gpib_address: Some(22),
        }],
    );
    let plan = compile(
        &[Operation::command("DMM1", "query")
            .with_write_data("*IDN?")
            .with_read("string", "idnResult")],
        &DriverCatalog::default(),
        &BindingContext::new(),
    )
    .unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let mut run = RunContext::new("run-1");
    let results = executor
        .execute(&plan, &mut run, &CancelSignal::new(), &tx)
        .await
        .unwrap();
    assert_eq!(results[0].raw_value.as_deref(), Some(IDN));
    assert_eq!(run.bindings.responses().get("idnResult").map(String::as_str), Some(IDN));
    assert!(rx.try_recv().is_ok());

    manager.disable_all().await;
    let lines = server.await.unwrap();
    assert!(lines.contains(&"++addr 22".to_string()));
    assert!(lines.contains(&"*IDN?".to_string()));
}

#[tokio::test]
async fn test_late_reply_does_not_shift_later_responses() {
    let port = slow_controller().await;
    let mut prologix = slow_transport(port);
    prologix.connect().await.unwrap();
    prologix.set_address(22).await.unwrap();

    prologix.write_string("READ?").await.unwrap();
    let err = prologix.read(ReadMode::Terminated).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }));

    let retry = prologix.read(ReadMode::Terminated).await.unwrap();
    assert_eq!(retry, b"+2.00E+00");

    prologix.write_string("*IDN?").await.unwrap();
    let idn = prologix.read(ReadMode::Terminated).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&idn), IDN);
    prologix.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_read_retry_over_prologix() {
    let port = slow_controller().await;
    let manager = InterfaceManager::new();
    manager
        .register(InterfaceHandle::Gpib(Box::new(slow_transport(port))))
        .unwrap();
    manager.enable_all();
    let manager = Arc::new(manager);

    let executor = SequenceExecutor::new(
        Arc::clone(&manager),
        vec![DeviceBinding {
            unit_id: "DMM1".to_string(),
            interface: "bench-gpib".to_string(),
            gpib_address: Some(22),
        }],
    )
    .with_retry_policy(RetryPolicy::new(2, Duration::from_millis(10)));
    let plan = compile(
        &[
            Operation::command("DMM1", "query")
                .with_write_data("READ?")
                .with_read("double", "volts"),
            Operation::command("DMM1", "query")
                .with_write_data("*IDN?")
                .with_read("string", "idn"),
        ],
        &DriverCatalog::default(),
        &BindingContext::new(),
    )
    .unwrap();

    let (tx, _rx) = mpsc::channel(8);
    let mut run = RunContext::new("run-retry");
    let results = executor
        .execute(&plan, &mut run, &CancelSignal::new(), &tx)
        .await
        .unwrap();
    manager.disable_all().await;

    assert_eq!(results[0].attempts, 2);
    assert_eq!(results[0].value, Some(ResponseValue::Number(2.0)));
    assert_eq!(results[1].raw_value.as_deref(), Some(IDN));
    assert_eq!(run.bindings.responses().get("idn").map(String::as_str), Some(IDN));
}

use async_trait::async_trait;
use blocklink::blocks::{BlockGraph, BlockInstance, BlockKind};
use blocklink::bridge::flasher::{CHANGE_BAUDRATE, FLASH_BEGIN};
use blocklink::bridge::{BridgeError, BridgeEvent, BridgeHandle, BridgeState, CancelToken, SaveOutcome};
use blocklink::config::{Config, FlashConfig};
use blocklink::firmware::TransferError;
use blocklink::hardware::{Connector, SimConnector, SimOptions, SimulatedDevice, Transport, TransportError};
use blocklink::linker::{compile, CompiledProgram};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);
const BLOCK: usize = 0x4000;

fn bridge_for(device: &SimulatedDevice) -> BridgeHandle {
    BridgeHandle::spawn(Arc::new(device.connector()), &Config::default())
}

fn firmware(len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    image[0] = 0xE9;
    image
}

fn hello_program() -> CompiledProgram {
    compile(&BlockGraph::new(vec![BlockInstance::new(BlockKind::PrintLine).with_literal("VALUE", "hello")]))
}

type TokenSlot = Arc<Mutex<Option<CancelToken>>>;

/// Opens the simulated board, cancelling the pending flash once a given ROM command goes out.
struct CancelOnCommand {
    inner: SimConnector,
    op: u8,
    token: TokenSlot,
}

#[async_trait]
impl Connector for CancelOnCommand {
    async fn open(&self, device: &FlashConfig) -> Result<Box<dyn Transport>, TransportError> {
        let inner = self.inner.open(device).await?;
        Ok(Box::new(CancelOnWrite { inner, op: self.op, token: self.token.clone() }))
    }
}

struct CancelOnWrite {
    inner: Box<dyn Transport>,
    op: u8,
    token: TokenSlot,
}

#[async_trait]
impl Transport for CancelOnWrite {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.inner.read(buf).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let result = self.inner.write_all(data).await;
        // SLIP END, request direction, opcode.
        if data.len() > 2 && data[0] == 0xC0 && data[1] == 0x00 && data[2] == self.op {
            if let Some(token) = self.token.lock().unwrap().as_ref() {
                token.cancel();
            }
        }
        result
    }

    async fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.inner.set_baud_rate(baud).await
    }

    async fn enter_bootloader(&mut self) -> Result<(), TransportError> {
        self.inner.enter_bootloader().await
    }

    async fn hard_reset(&mut self) -> Result<(), TransportError> {
        self.inner.hard_reset().await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

fn cancelling_bridge(device: &SimulatedDevice, op: u8) -> (BridgeHandle, TokenSlot) {
    let token = TokenSlot::default();
    let connector = CancelOnCommand { inner: device.connector(), op, token: token.clone() };
    (BridgeHandle::spawn(Arc::new(connector), &Config::default()), token)
}

async fn wait_for_state(bridge: &BridgeHandle, state: BridgeState) {
    let mut status = bridge.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == state))
        .await
        .expect("state change timed out")
        .unwrap();
}

#[tokio::test]
async fn test_flash_writes_patched_image_and_reboots() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();

    let image = firmware(BLOCK * 2 + 1000);
    let task = bridge.flash(image.clone(), image.len() as u64).await.unwrap();
    let progress = task.progress.clone();
    let report = task.wait().await.unwrap();

    assert_eq!(report.written, image.len() as u64);
    assert_eq!(report.blocks, 3);
    assert_eq!(progress.borrow().written, image.len() as u64);

    let flashed = device.flash_image();
    assert_eq!(flashed.len(), BLOCK * 3);
    assert_eq!(&flashed[..2], &image[..2]);
    // Default config: dio, 8MB, 80m.
    assert_eq!(flashed[2], 0x02);
    assert_eq!(flashed[3], 0x3f);
    assert_eq!(&flashed[4..image.len()], &image[4..]);
    assert!(flashed[image.len()..].iter().all(|b| *b == 0xFF));

    assert!(device.flash_finished());
    assert_eq!(device.host_bauds(), vec![921_600, 115_200]);
    assert_eq!(bridge.status(), BridgeState::Connected);
}

#[tokio::test]
async fn test_cancel_before_first_block() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();

    let task = bridge.flash(firmware(BLOCK), BLOCK as u64).await.unwrap();
    task.cancel();
    assert!(matches!(task.wait().await, Err(BridgeError::Cancelled)));
    assert_eq!(device.blocks_received(), 0);
    assert_eq!(bridge.status(), BridgeState::Connected);
}

#[tokio::test]
async fn test_cancel_after_first_block_is_ignored() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();

    let image = firmware(BLOCK * 4);
    let task = bridge.flash(image.clone(), image.len() as u64).await.unwrap();
    let mut progress = task.progress.clone();
    tokio::time::timeout(WAIT, progress.wait_for(|p| p.written > 0)).await.unwrap().unwrap();
    task.cancel();
    let report = task.wait().await.unwrap();
    assert_eq!(report.written, image.len() as u64);
    assert!(device.flash_finished());
}

#[tokio::test]
async fn test_short_transfer_is_fatal() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();

    let task = bridge.flash(firmware(8_000), 10_000).await.unwrap();
    let err = task.wait().await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Transfer(TransferError::Truncated { actual: 8_000, expected: 10_000 })
    ));
    assert!(!device.flash_finished());
    // Rejected before the region is erased.
    assert_eq!(device.blocks_received(), 0);
    assert_eq!(device.resets(), 0);
    assert_eq!(bridge.status(), BridgeState::Error);
}

#[tokio::test]
async fn test_cancel_after_erase_is_ignored() {
    let device = SimulatedDevice::default();
    let (bridge, token) = cancelling_bridge(&device, FLASH_BEGIN);
    bridge.connect().await.unwrap();

    let image = firmware(BLOCK * 2);
    let task = bridge.flash(image.clone(), image.len() as u64).await.unwrap();
    *token.lock().unwrap() = Some(task.cancel_token());
    let report = task.wait().await.unwrap();

    assert_eq!(report.written, image.len() as u64);
    assert_eq!(device.blocks_received(), 2);
    assert_eq!(device.flash_image().len(), BLOCK * 2);
    assert!(device.flash_finished());
    assert_eq!(device.host_bauds(), vec![921_600, 115_200]);
    assert_eq!(bridge.status(), BridgeState::Connected);
}

#[tokio::test]
async fn test_cancel_after_baud_change_restores_handshake_baud() {
    let device = SimulatedDevice::default();
    let (bridge, token) = cancelling_bridge(&device, CHANGE_BAUDRATE);
    bridge.connect().await.unwrap();

    let task = bridge.flash(firmware(BLOCK), BLOCK as u64).await.unwrap();
    *token.lock().unwrap() = Some(task.cancel_token());
    assert!(matches!(task.wait().await, Err(BridgeError::Cancelled)));

    assert_eq!(device.blocks_received(), 0);
    assert!(!device.flash_finished());
    assert_eq!(device.host_bauds().last(), Some(&115_200));
    // Into the loader, then rebooted.
    assert_eq!(device.resets(), 2);
    assert_eq!(bridge.status(), BridgeState::Connected);

    bridge.run(hello_program()).await.unwrap();
    assert!(device.is_running());
}

#[tokio::test]
async fn test_tolerated_shortfall_succeeds() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();

    let task = bridge.flash(firmware(9_500), 10_000).await.unwrap();
    assert_eq!(task.wait().await.unwrap().written, 9_500);
}

#[tokio::test]
async fn test_link_loss_mid_flash_is_flash_interrupted() {
    let device = SimulatedDevice::new(SimOptions { disconnect_after_blocks: Some(2), ..SimOptions::default() });
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();

    let image = firmware(BLOCK * 3);
    let task = bridge.flash(image.clone(), image.len() as u64).await.unwrap();
    match task.wait().await {
        Err(BridgeError::FlashInterrupted { written, source }) => {
            assert_eq!(written, BLOCK as u64);
            assert!(matches!(source, TransportError::Closed));
        }
        other => panic!("expected FlashInterrupted, got {:?}", other.map(|r| r.written)),
    }
    assert_eq!(bridge.status(), BridgeState::Error);

    // Error only leaves through disconnect.
    assert!(matches!(bridge.connect().await, Err(BridgeError::InvalidTransition { .. })));
    bridge.disconnect().await.unwrap();
    assert_eq!(bridge.status(), BridgeState::Disconnected);
}

#[tokio::test]
async fn test_silent_loader_fails_sync() {
    let device = SimulatedDevice::new(SimOptions { silent_loader: true, ..SimOptions::default() });
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();

    let task = bridge.flash(firmware(1024), 1024).await.unwrap();
    assert!(matches!(task.wait().await, Err(BridgeError::Protocol(_))));
    assert_eq!(device.blocks_received(), 0);
    assert_eq!(bridge.status(), BridgeState::Error);
}

#[tokio::test]
async fn test_run_relays_output_and_input() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();
    let mut output = Box::pin(bridge.terminal_stream());

    let program = hello_program();
    bridge.run(program.clone()).await.unwrap();
    assert_eq!(bridge.status(), BridgeState::Running);
    assert!(device.is_running());
    assert_eq!(device.programs().last(), Some(&program.source().to_string()));

    let snapshot = bridge.snapshot().await.unwrap();
    assert_eq!(snapshot.lines, vec!["hello".to_string()]);

    device.emit(b"tick 1\r\n");
    let chunk = tokio::time::timeout(WAIT, output.next()).await.unwrap().unwrap();
    assert!(chunk.contains("hello") || chunk.contains("tick 1"));

    bridge.send_input("abc").await.unwrap();
    assert_eq!(device.host_input(), b"abc".to_vec());

    bridge.stop().await.unwrap();
    assert_eq!(bridge.status(), BridgeState::Connected);
    assert!(!device.is_running());
}

#[tokio::test]
async fn test_clear_only_drops_buffered_output() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();
    bridge.run(hello_program()).await.unwrap();

    bridge.clear().await.unwrap();
    let snapshot = bridge.snapshot().await.unwrap();
    assert!(snapshot.lines.is_empty());
    assert!(snapshot.partial.is_empty());
    assert!(device.is_running());
    assert_eq!(bridge.status(), BridgeState::Running);
}

#[tokio::test]
async fn test_program_exit_returns_to_connected() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();
    bridge.run(hello_program()).await.unwrap();

    device.emit(b"Traceback (most recent call last):\r\n");
    device.emit(&[0x04]);
    device.emit(&[0x04, b'>']);
    wait_for_state(&bridge, BridgeState::Connected).await;
}

#[tokio::test]
async fn test_rerun_replaces_running_program() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();
    bridge.run(hello_program()).await.unwrap();
    bridge.run(hello_program()).await.unwrap();
    assert_eq!(device.programs().len(), 2);
    assert_eq!(bridge.status(), BridgeState::Running);
}

#[tokio::test]
async fn test_flash_quiesces_running_terminal() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();
    bridge.run(hello_program()).await.unwrap();

    let task = bridge.flash(firmware(1024), 1024).await.unwrap();
    task.wait().await.unwrap();
    assert_eq!(bridge.status(), BridgeState::Connected);
}

#[tokio::test]
async fn test_save_writes_main_and_skips_unchanged() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    bridge.connect().await.unwrap();

    let program = hello_program();
    let outcome = bridge.save(program.clone()).await.unwrap();
    assert_eq!(
        outcome,
        SaveOutcome::Written { bytes: program.len(), digest: program.digest() }
    );
    assert_eq!(device.file("main.py"), Some(program.source().as_bytes().to_vec()));
    assert!(device.is_running());
    assert_eq!(bridge.status(), BridgeState::Running);
    assert_eq!(device.programs(), vec![program.source().to_string()]);

    let again = bridge.save(program.clone()).await.unwrap();
    assert_eq!(again, SaveOutcome::Unchanged { digest: program.digest() });
    assert_eq!(device.programs().len(), 1);
}

#[tokio::test]
async fn test_link_loss_mid_terminal_disconnects() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);
    let mut events = bridge.subscribe();
    bridge.connect().await.unwrap();
    bridge.run(hello_program()).await.unwrap();
    let mut output = Box::pin(bridge.terminal_stream());

    device.unplug();
    wait_for_state(&bridge, BridgeState::Disconnected).await;

    let mut saw_disconnect = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, BridgeEvent::Disconnected { .. }) {
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);
    assert!(tokio::time::timeout(WAIT, output.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_operations_require_a_connection() {
    let device = SimulatedDevice::default();
    let bridge = bridge_for(&device);

    assert!(matches!(
        bridge.run(hello_program()).await,
        Err(BridgeError::InvalidTransition { from: BridgeState::Disconnected, to: BridgeState::Running })
    ));
    let task = bridge.flash(firmware(16), 16).await.unwrap();
    assert!(matches!(task.wait().await, Err(BridgeError::InvalidTransition { .. })));
    assert!(matches!(bridge.send_input("x").await, Err(BridgeError::NotConnected)));
    assert!(matches!(bridge.stop().await, Err(BridgeError::InvalidTransition { .. })));

    // Disconnect is always safe.
    bridge.disconnect().await.unwrap();
    bridge.disconnect().await.unwrap();
    assert_eq!(bridge.status(), BridgeState::Disconnected);
}

#[tokio::test]
async fn test_connect_without_matching_device() {
    let device = SimulatedDevice::new(SimOptions { usb_id: (0x1234, 0x5678), ..SimOptions::default() });
    let bridge = bridge_for(&device);
    assert!(matches!(
        bridge.connect().await,
        Err(BridgeError::Transport(TransportError::NoDevice))
    ));
    assert_eq!(bridge.status(), BridgeState::Error);
    bridge.disconnect().await.unwrap();
    assert_eq!(bridge.status(), BridgeState::Disconnected);
}

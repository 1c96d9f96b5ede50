//! Per-device connection lifecycle machine.
//!
//! One machine per remote device, built on the generic HSM engine:
//!
//! ```text
//! Disconnected ──Open──▶ Connecting ──ChannelOpened──▶ Connected
//!      ▲                     │                        ┌──┴──────────────┐
//!      │      discovery/channel failure               │ AwaitingGet...  │
//!      └──────────◀──────────┘                        │ AwaitingSet...  │
//!      ▲                                              └──┬──────────────┘
//!      └────────── Disconnecting ◀──────Close────────────┘
//! ```
//!
//! Entry hooks drive the collaborators (discovery, channel bridge, kernel
//! transport); every asynchronous outcome returns as a posted device event.
//! Reaching Disconnected after a failure or teardown is always followed by a
//! removal event posted to the registry.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::domain::hsm::{Dispatch, State, StateMachine};
use crate::domain::models::{
    ConnectionStatus, DeviceAddress, DeviceEvent, DeviceIdentity, EventSender, HandshakeCode,
    HidSdpRecord, ServiceEvent,
};
use crate::infrastructure::discovery::DiscoveryClient;
use crate::infrastructure::kernel::{KernelSession, KernelTransportFactory};
use crate::infrastructure::transport::{ChannelBridge, HidFrame};

pub const DISCONNECTED: &str = "Disconnected";
pub const CONNECTING: &str = "Connecting";
pub const CONNECTED: &str = "Connected";
pub const AWAITING_GET_REPORT: &str = "AwaitingGetReportReply";
pub const AWAITING_SET_REPORT: &str = "AwaitingSetReportReply";
pub const DISCONNECTING: &str = "Disconnecting";

/// Who opened the in-flight control transaction.
#[derive(Debug, Clone, Copy)]
enum TransactionSource {
    Api,
    Kernel { request_id: u32 },
}

/// Mutable context shared by all states of one device machine.
pub struct DeviceContext {
    address: DeviceAddress,
    events: EventSender,
    discovery: Arc<dyn DiscoveryClient>,
    bridge: Arc<dyn ChannelBridge>,
    kernel_factory: Arc<dyn KernelTransportFactory>,
    identity: Option<DeviceIdentity>,
    record: Option<HidSdpRecord>,
    kernel: Option<KernelSession>,
    pending: Option<TransactionSource>,
}

impl DeviceContext {
    fn post(&self, event: DeviceEvent) {
        let _ = self
            .events
            .send(ServiceEvent::Device(self.address.clone(), event));
    }

    fn post_removal(&self) {
        let _ = self
            .events
            .send(ServiceEvent::RemoveMachine(self.address.clone()));
    }

    fn send_frame(&self, frame: HidFrame) {
        if let Err(e) = self.bridge.send(&self.address, frame) {
            warn!(device = %self.address, error = %e, "frame send failed");
        }
    }
}

struct DisconnectedState;

impl State<DeviceContext, DeviceEvent> for DisconnectedState {
    fn name(&self) -> &'static str {
        DISCONNECTED
    }

    fn on_entry(&mut self, ctx: &mut DeviceContext) {
        debug!(device = %ctx.address, "disconnected");
    }

    fn dispatch(&mut self, ctx: &mut DeviceContext, msg: &DeviceEvent) -> Dispatch {
        match msg {
            DeviceEvent::Open => Dispatch::Handled(Some(CONNECTING)),
            DeviceEvent::SendData(_)
            | DeviceEvent::GetReport(_)
            | DeviceEvent::SetReport(_)
            | DeviceEvent::ReceiveInterruptData(_)
            | DeviceEvent::ReceiveReportData(_)
            | DeviceEvent::ReceiveHandshake(_)
            | DeviceEvent::KernelGetReport { .. }
            | DeviceEvent::KernelSetReport { .. }
            | DeviceEvent::KernelOutput(_) => {
                debug!(device = %ctx.address, ?msg, "report event dropped while disconnected");
                Dispatch::Handled(None)
            }
            _ => Dispatch::Unhandled,
        }
    }
}

struct ConnectingState;

impl State<DeviceContext, DeviceEvent> for ConnectingState {
    fn name(&self) -> &'static str {
        CONNECTING
    }

    fn on_entry(&mut self, ctx: &mut DeviceContext) {
        info!(device = %ctx.address, "connecting, starting discovery");
        if let Err(e) = ctx.discovery.discover_device_identity(&ctx.address) {
            warn!(device = %ctx.address, error = %e, "identity discovery failed to start");
            ctx.post(DeviceEvent::DiscoveryFailed);
        }
    }

    fn dispatch(&mut self, ctx: &mut DeviceContext, msg: &DeviceEvent) -> Dispatch {
        match msg {
            DeviceEvent::DeviceIdentityComplete(identity) => {
                ctx.identity = Some(*identity);
                if let Err(e) = ctx.discovery.discover_hid_record(&ctx.address) {
                    warn!(device = %ctx.address, error = %e, "record discovery failed to start");
                    ctx.post(DeviceEvent::DiscoveryFailed);
                }
                Dispatch::Handled(None)
            }
            DeviceEvent::HidRecordComplete(record) => {
                ctx.record = Some(record.clone());
                if let Err(e) = ctx.bridge.open_channel(&ctx.address) {
                    warn!(device = %ctx.address, error = %e, "channel open failed to start");
                    ctx.post(DeviceEvent::ChannelOpenFailed);
                }
                Dispatch::Handled(None)
            }
            DeviceEvent::DiscoveryFailed | DeviceEvent::ChannelOpenFailed => {
                warn!(device = %ctx.address, ?msg, "connection attempt failed");
                ctx.post_removal();
                Dispatch::Handled(Some(DISCONNECTED))
            }
            DeviceEvent::ChannelOpened => Dispatch::Handled(Some(CONNECTED)),
            DeviceEvent::ChannelClosed => {
                ctx.post_removal();
                Dispatch::Handled(Some(DISCONNECTED))
            }
            DeviceEvent::Close | DeviceEvent::VirtualCableUnplug => {
                ctx.bridge.close_channel(&ctx.address);
                Dispatch::Handled(Some(DISCONNECTING))
            }
            _ => Dispatch::Unhandled,
        }
    }
}

struct ConnectedState;

impl State<DeviceContext, DeviceEvent> for ConnectedState {
    fn name(&self) -> &'static str {
        CONNECTED
    }

    fn on_entry(&mut self, ctx: &mut DeviceContext) {
        info!(device = %ctx.address, "connected");
        let Some(record) = ctx.record.clone() else {
            error!(device = %ctx.address, "connected without a service record");
            ctx.post(DeviceEvent::Close);
            return;
        };
        let identity = ctx.identity.unwrap_or(DeviceIdentity {
            vendor_id: record.vendor_id,
            product_id: record.product_id,
            version: record.version,
        });
        let transport = ctx.kernel_factory.create_transport(&ctx.address);
        match KernelSession::open(
            transport,
            ctx.address.clone(),
            &record.descriptor,
            &identity,
            ctx.events.clone(),
        ) {
            Ok(session) => ctx.kernel = Some(session),
            Err(e) => {
                // Absorbed: surfaced only through the observer after the
                // teardown this triggers.
                error!(device = %ctx.address, error = %e, "kernel transport unavailable");
                ctx.post(DeviceEvent::Close);
            }
        }
    }

    fn on_exit(&mut self, ctx: &mut DeviceContext) {
        ctx.pending = None;
        if let Some(session) = ctx.kernel.take() {
            session.shutdown();
        }
    }

    fn dispatch(&mut self, ctx: &mut DeviceContext, msg: &DeviceEvent) -> Dispatch {
        match msg {
            DeviceEvent::SendData(report) => {
                ctx.send_frame(HidFrame::Data(report.clone()));
                Dispatch::Handled(None)
            }
            DeviceEvent::GetReport(params) => {
                ctx.pending = Some(TransactionSource::Api);
                ctx.send_frame(HidFrame::GetReport(*params));
                Dispatch::Handled(Some(AWAITING_GET_REPORT))
            }
            DeviceEvent::SetReport(report) => {
                ctx.pending = Some(TransactionSource::Api);
                ctx.send_frame(HidFrame::SetReport(report.clone()));
                Dispatch::Handled(Some(AWAITING_SET_REPORT))
            }
            DeviceEvent::KernelGetReport { request_id, params } => {
                ctx.pending = Some(TransactionSource::Kernel {
                    request_id: *request_id,
                });
                ctx.send_frame(HidFrame::GetReport(*params));
                Dispatch::Handled(Some(AWAITING_GET_REPORT))
            }
            DeviceEvent::KernelSetReport { request_id, report } => {
                ctx.pending = Some(TransactionSource::Kernel {
                    request_id: *request_id,
                });
                ctx.send_frame(HidFrame::SetReport(report.clone()));
                Dispatch::Handled(Some(AWAITING_SET_REPORT))
            }
            DeviceEvent::KernelOutput(report) => {
                ctx.send_frame(HidFrame::Data(report.clone()));
                Dispatch::Handled(None)
            }
            DeviceEvent::ReceiveInterruptData(report) => {
                if let Some(kernel) = &ctx.kernel {
                    kernel.output(report);
                }
                Dispatch::Handled(None)
            }
            DeviceEvent::ReceiveHandshake(code) => {
                debug!(device = %ctx.address, ?code, "unsolicited handshake");
                Dispatch::Handled(None)
            }
            DeviceEvent::Close => {
                ctx.bridge.close_channel(&ctx.address);
                Dispatch::Handled(Some(DISCONNECTING))
            }
            DeviceEvent::VirtualCableUnplug => {
                ctx.send_frame(HidFrame::VirtualCableUnplug);
                ctx.bridge.close_channel(&ctx.address);
                Dispatch::Handled(Some(DISCONNECTING))
            }
            DeviceEvent::ChannelClosed => {
                // Remote-initiated teardown.
                ctx.post_removal();
                Dispatch::Handled(Some(DISCONNECTED))
            }
            _ => Dispatch::Unhandled,
        }
    }
}

struct AwaitingGetReportReplyState;

impl State<DeviceContext, DeviceEvent> for AwaitingGetReportReplyState {
    fn name(&self) -> &'static str {
        AWAITING_GET_REPORT
    }

    fn parent(&self) -> Option<&'static str> {
        Some(CONNECTED)
    }

    fn dispatch(&mut self, ctx: &mut DeviceContext, msg: &DeviceEvent) -> Dispatch {
        match msg {
            DeviceEvent::ReceiveReportData(report) => {
                match ctx.pending.take() {
                    Some(TransactionSource::Kernel { request_id }) => {
                        if let Some(kernel) = &ctx.kernel {
                            kernel.feature_reply(
                                request_id,
                                HandshakeCode::Successful,
                                &report.data,
                            );
                        }
                    }
                    _ => {
                        // API-originated replies are delivered to the host
                        // like any inbound report.
                        if let Some(kernel) = &ctx.kernel {
                            kernel.output(report);
                        }
                    }
                }
                Dispatch::Handled(Some(CONNECTED))
            }
            DeviceEvent::ReceiveHandshake(code) => {
                warn!(device = %ctx.address, ?code, "get-report rejected by remote");
                if let Some(TransactionSource::Kernel { request_id }) = ctx.pending.take() {
                    if let Some(kernel) = &ctx.kernel {
                        kernel.feature_reply(request_id, *code, &[]);
                    }
                }
                Dispatch::Handled(Some(CONNECTED))
            }
            _ => Dispatch::Unhandled,
        }
    }
}

struct AwaitingSetReportReplyState;

impl State<DeviceContext, DeviceEvent> for AwaitingSetReportReplyState {
    fn name(&self) -> &'static str {
        AWAITING_SET_REPORT
    }

    fn parent(&self) -> Option<&'static str> {
        Some(CONNECTED)
    }

    fn dispatch(&mut self, ctx: &mut DeviceContext, msg: &DeviceEvent) -> Dispatch {
        match msg {
            DeviceEvent::ReceiveHandshake(code) => {
                if let Some(TransactionSource::Kernel { request_id }) = ctx.pending.take() {
                    if let Some(kernel) = &ctx.kernel {
                        kernel.set_report_reply(request_id, *code);
                    }
                }
                Dispatch::Handled(Some(CONNECTED))
            }
            _ => Dispatch::Unhandled,
        }
    }
}

struct DisconnectingState;

impl State<DeviceContext, DeviceEvent> for DisconnectingState {
    fn name(&self) -> &'static str {
        DISCONNECTING
    }

    fn on_entry(&mut self, ctx: &mut DeviceContext) {
        info!(device = %ctx.address, "disconnecting");
    }

    fn dispatch(&mut self, ctx: &mut DeviceContext, msg: &DeviceEvent) -> Dispatch {
        match msg {
            DeviceEvent::ChannelClosed
            | DeviceEvent::ChannelOpenFailed
            | DeviceEvent::DiscoveryFailed => {
                ctx.post_removal();
                Dispatch::Handled(Some(DISCONNECTED))
            }
            DeviceEvent::ChannelOpened => {
                // Open raced against the close request; close again.
                ctx.bridge.close_channel(&ctx.address);
                Dispatch::Handled(None)
            }
            DeviceEvent::Close | DeviceEvent::VirtualCableUnplug => Dispatch::Handled(None),
            _ => Dispatch::Unhandled,
        }
    }
}

/// One device's machine: the engine plus its context.
pub struct DeviceMachine {
    hsm: StateMachine<DeviceContext, DeviceEvent>,
    ctx: DeviceContext,
}

impl DeviceMachine {
    pub fn new(
        address: DeviceAddress,
        events: EventSender,
        discovery: Arc<dyn DiscoveryClient>,
        bridge: Arc<dyn ChannelBridge>,
        kernel_factory: Arc<dyn KernelTransportFactory>,
    ) -> Self {
        let mut hsm = StateMachine::new();
        let states: Vec<Box<dyn State<DeviceContext, DeviceEvent>>> = vec![
            Box::new(DisconnectedState),
            Box::new(ConnectingState),
            Box::new(ConnectedState),
            Box::new(AwaitingGetReportReplyState),
            Box::new(AwaitingSetReportReplyState),
            Box::new(DisconnectingState),
        ];
        for state in states {
            if let Err(e) = hsm.register(state) {
                // Static hierarchy; cannot fail for the states above.
                error!(error = %e, "device state rejected");
            }
        }

        let mut ctx = DeviceContext {
            address,
            events,
            discovery,
            bridge,
            kernel_factory,
            identity: None,
            record: None,
            kernel: None,
            pending: None,
        };
        hsm.init_state(&mut ctx, DISCONNECTED);
        Self { hsm, ctx }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.ctx.address
    }

    /// Feed one event through the machine. Unhandled events are dropped at
    /// the root with a diagnostic only.
    pub fn process(&mut self, event: &DeviceEvent) -> bool {
        let handled = self.hsm.process_message(&mut self.ctx, event);
        if !handled {
            debug!(device = %self.ctx.address, ?event, "event dropped at root");
        }
        handled
    }

    /// Externally visible connection state derived from the active leaf.
    pub fn status(&self) -> ConnectionStatus {
        match self.hsm.state() {
            Some(CONNECTING) => ConnectionStatus::Connecting,
            Some(CONNECTED) | Some(AWAITING_GET_REPORT) | Some(AWAITING_SET_REPORT) => {
                ConnectionStatus::Connected
            }
            Some(DISCONNECTING) => ConnectionStatus::Disconnecting,
            _ => ConnectionStatus::Disconnected,
        }
    }

    #[cfg(test)]
    pub(crate) fn leaf(&self) -> Option<&'static str> {
        self.hsm.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        GetReportParams, HidReport, ProfileError, ReportType,
    };
    use crate::infrastructure::kernel::{KernelEvent, KernelReportTransport};
    use std::io;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct NoopDiscovery;

    impl DiscoveryClient for NoopDiscovery {
        fn discover_device_identity(&self, _address: &DeviceAddress) -> Result<(), ProfileError> {
            Ok(())
        }
        fn discover_hid_record(&self, _address: &DeviceAddress) -> Result<(), ProfileError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBridge {
        opened: Mutex<Vec<DeviceAddress>>,
        closed: Mutex<Vec<DeviceAddress>>,
        sent: Mutex<Vec<HidFrame>>,
    }

    impl ChannelBridge for RecordingBridge {
        fn open_channel(&self, address: &DeviceAddress) -> Result<(), ProfileError> {
            self.opened.lock().unwrap().push(address.clone());
            Ok(())
        }
        fn close_channel(&self, address: &DeviceAddress) {
            self.closed.lock().unwrap().push(address.clone());
        }
        fn send(&self, _address: &DeviceAddress, frame: HidFrame) -> Result<(), ProfileError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum KernelCall {
        Output(Vec<u8>),
        FeatureReply(u32, HandshakeCode),
        SetReportReply(u32, HandshakeCode),
    }

    #[derive(Default)]
    struct RecordingKernel {
        calls: Arc<Mutex<Vec<KernelCall>>>,
    }

    impl KernelReportTransport for RecordingKernel {
        fn create(&self, _descriptor: &[u8], _identity: &DeviceIdentity) -> io::Result<()> {
            Ok(())
        }
        fn start(&self) -> io::Result<()> {
            Ok(())
        }
        fn stop(&self) -> io::Result<()> {
            Ok(())
        }
        fn open(&self) -> io::Result<()> {
            Ok(())
        }
        fn close(&self) -> io::Result<()> {
            Ok(())
        }
        fn output(&self, report: &HidReport) -> io::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(KernelCall::Output(report.data.clone()));
            Ok(())
        }
        fn feature_reply(
            &self,
            request_id: u32,
            status: HandshakeCode,
            _data: &[u8],
        ) -> io::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(KernelCall::FeatureReply(request_id, status));
            Ok(())
        }
        fn set_report_reply(&self, request_id: u32, status: HandshakeCode) -> io::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(KernelCall::SetReportReply(request_id, status));
            Ok(())
        }
        fn destroy(&self) -> io::Result<()> {
            Ok(())
        }
        fn next_event(&self) -> io::Result<Option<KernelEvent>> {
            Ok(None)
        }
    }

    struct RecordingKernelFactory {
        calls: Arc<Mutex<Vec<KernelCall>>>,
    }

    impl KernelTransportFactory for RecordingKernelFactory {
        fn create_transport(&self, _address: &DeviceAddress) -> Arc<dyn KernelReportTransport> {
            Arc::new(RecordingKernel {
                calls: Arc::clone(&self.calls),
            })
        }
    }

    struct Harness {
        machine: DeviceMachine,
        bridge: Arc<RecordingBridge>,
        kernel_calls: Arc<Mutex<Vec<KernelCall>>>,
        rx: mpsc::UnboundedReceiver<ServiceEvent>,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(RecordingBridge::default());
        let kernel_calls = Arc::new(Mutex::new(Vec::new()));
        let machine = DeviceMachine::new(
            DeviceAddress::from("AA:BB:CC:DD:EE:FF"),
            tx,
            Arc::new(NoopDiscovery),
            Arc::clone(&bridge) as Arc<dyn ChannelBridge>,
            Arc::new(RecordingKernelFactory {
                calls: Arc::clone(&kernel_calls),
            }),
        );
        Harness {
            machine,
            bridge,
            kernel_calls,
            rx,
        }
    }

    fn record() -> HidSdpRecord {
        HidSdpRecord {
            vendor_id: 0x054c,
            product_id: 0x0268,
            version: 0x0100,
            country_code: 0x21,
            descriptor: vec![0x05, 0x01, 0x09, 0x06],
            service_name: "Wireless Keyboard".into(),
            provider_name: "Acme".into(),
        }
    }

    fn connect(h: &mut Harness) {
        h.machine.process(&DeviceEvent::Open);
        h.machine
            .process(&DeviceEvent::DeviceIdentityComplete(DeviceIdentity {
                vendor_id: 0x054c,
                product_id: 0x0268,
                version: 0x0100,
            }));
        h.machine
            .process(&DeviceEvent::HidRecordComplete(record()));
        h.machine.process(&DeviceEvent::ChannelOpened);
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServiceEvent>) -> Vec<ServiceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn open_walks_through_connecting_to_connected() {
        let mut h = harness();
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);

        h.machine.process(&DeviceEvent::Open);
        assert_eq!(h.machine.status(), ConnectionStatus::Connecting);

        h.machine
            .process(&DeviceEvent::DeviceIdentityComplete(DeviceIdentity {
                vendor_id: 1,
                product_id: 2,
                version: 3,
            }));
        h.machine.process(&DeviceEvent::HidRecordComplete(record()));
        assert_eq!(h.bridge.opened.lock().unwrap().len(), 1);

        h.machine.process(&DeviceEvent::ChannelOpened);
        assert_eq!(h.machine.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn discovery_failure_ends_disconnected_with_removal_posted() {
        let mut h = harness();
        h.machine.process(&DeviceEvent::Open);
        h.machine.process(&DeviceEvent::DiscoveryFailed);

        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
        let events = drain(&mut h.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServiceEvent::RemoveMachine(_))));
    }

    #[test]
    fn close_tears_down_through_disconnecting() {
        let mut h = harness();
        connect(&mut h);
        drain(&mut h.rx);

        h.machine.process(&DeviceEvent::Close);
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnecting);
        assert_eq!(h.bridge.closed.lock().unwrap().len(), 1);

        h.machine.process(&DeviceEvent::ChannelClosed);
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
        let events = drain(&mut h.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServiceEvent::RemoveMachine(_))));
    }

    #[test]
    fn get_report_round_trip_through_sub_state() {
        let mut h = harness();
        connect(&mut h);

        h.machine.process(&DeviceEvent::GetReport(GetReportParams {
            report_type: ReportType::Feature,
            report_id: 2,
            buffer_size: 64,
        }));
        assert_eq!(h.machine.leaf(), Some(AWAITING_GET_REPORT));
        // Sub-states still count as Connected externally.
        assert_eq!(h.machine.status(), ConnectionStatus::Connected);
        assert!(matches!(
            h.bridge.sent.lock().unwrap().last(),
            Some(HidFrame::GetReport(_))
        ));

        h.machine
            .process(&DeviceEvent::ReceiveReportData(HidReport {
                report_type: ReportType::Feature,
                data: vec![1, 2, 3],
            }));
        assert_eq!(h.machine.leaf(), Some(CONNECTED));
        assert!(h
            .kernel_calls
            .lock()
            .unwrap()
            .contains(&KernelCall::Output(vec![1, 2, 3])));
    }

    #[test]
    fn kernel_get_report_reply_echoes_request_id() {
        let mut h = harness();
        connect(&mut h);

        h.machine.process(&DeviceEvent::KernelGetReport {
            request_id: 9,
            params: GetReportParams {
                report_type: ReportType::Feature,
                report_id: 1,
                buffer_size: 16,
            },
        });
        h.machine
            .process(&DeviceEvent::ReceiveReportData(HidReport {
                report_type: ReportType::Feature,
                data: vec![7],
            }));

        assert!(h
            .kernel_calls
            .lock()
            .unwrap()
            .contains(&KernelCall::FeatureReply(9, HandshakeCode::Successful)));
    }

    #[test]
    fn set_report_handshake_forwarded_to_kernel() {
        let mut h = harness();
        connect(&mut h);

        h.machine.process(&DeviceEvent::KernelSetReport {
            request_id: 4,
            report: HidReport {
                report_type: ReportType::Output,
                data: vec![0xff],
            },
        });
        assert_eq!(h.machine.leaf(), Some(AWAITING_SET_REPORT));

        h.machine
            .process(&DeviceEvent::ReceiveHandshake(HandshakeCode::Successful));
        assert_eq!(h.machine.leaf(), Some(CONNECTED));
        assert!(h
            .kernel_calls
            .lock()
            .unwrap()
            .contains(&KernelCall::SetReportReply(4, HandshakeCode::Successful)));
    }

    #[test]
    fn close_bubbles_up_from_await_sub_state() {
        let mut h = harness();
        connect(&mut h);

        h.machine.process(&DeviceEvent::GetReport(GetReportParams {
            report_type: ReportType::Input,
            report_id: 0,
            buffer_size: 8,
        }));
        // Close is not handled by the sub-state; the Connected parent takes it.
        h.machine.process(&DeviceEvent::Close);
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnecting);
    }

    #[test]
    fn virtual_cable_unplug_sends_the_unplug_frame() {
        let mut h = harness();
        connect(&mut h);

        h.machine.process(&DeviceEvent::VirtualCableUnplug);
        assert!(h
            .bridge
            .sent
            .lock()
            .unwrap()
            .contains(&HidFrame::VirtualCableUnplug));
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnecting);
    }

    #[test]
    fn report_events_while_connecting_fall_off_the_root() {
        let mut h = harness();
        h.machine.process(&DeviceEvent::Open);

        let handled = h.machine.process(&DeviceEvent::SendData(HidReport {
            report_type: ReportType::Output,
            data: vec![0],
        }));
        assert!(!handled);
        assert_eq!(h.machine.status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn interrupt_data_is_relayed_to_the_kernel() {
        let mut h = harness();
        connect(&mut h);

        h.machine
            .process(&DeviceEvent::ReceiveInterruptData(HidReport {
                report_type: ReportType::Input,
                data: vec![9, 9],
            }));
        assert!(h
            .kernel_calls
            .lock()
            .unwrap()
            .contains(&KernelCall::Output(vec![9, 9])));
    }
}

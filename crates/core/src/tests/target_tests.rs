//! Tests for the framed TCP target against a loopback fake device

use crate::error::TargetError;
use crate::protocol::envelope::{self, DISPATCH_MESSAGE_FROM_TARGET, SEND_MESSAGE_TO_TARGET};
use crate::protocol::frame::{FrameDecoder, encode_frame};
use crate::target::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct FakeDevice {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl FakeDevice {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("target never connected")
            .unwrap();
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    async fn recv(&mut self) -> String {
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return String::from_utf8(frame.to_vec()).unwrap();
            }
            let n = timeout(WAIT, self.stream.read_buf(self.decoder.buffer_mut()))
                .await
                .expect("nothing reached the device")
                .unwrap();
            assert!(n > 0, "target closed the device socket");
        }
    }

    async fn recv_json(&mut self) -> Value {
        serde_json::from_str(&self.recv().await).unwrap()
    }

    async fn send(&mut self, raw: &str) {
        let frame = encode_frame(raw.as_bytes()).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_json(&mut self, message: &Value) {
        self.send(&message.to_string()).await;
    }
}

struct Harness {
    target: AndroidTarget,
    listener: TcpListener,
    tools: mpsc::UnboundedSender<String>,
    client: mpsc::UnboundedReceiver<String>,
}

impl Harness {
    async fn new(options: TargetOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let target = AndroidTarget::spawn("device-1", address, options);
        let (tools, client) = mpsc::unbounded_channel();
        Self {
            target,
            listener,
            tools,
            client,
        }
    }

    async fn connect(&self) -> FakeDevice {
        self.target.connect_to("/android/device-1", self.tools.clone());
        FakeDevice::accept(&self.listener).await
    }

    async fn client_recv(&mut self) -> String {
        timeout(WAIT, self.client.recv())
            .await
            .expect("nothing reached the client")
            .expect("client channel closed")
    }

    async fn client_recv_json(&mut self) -> Value {
        serde_json::from_str(&self.client_recv().await).unwrap()
    }
}

async fn wait_for_close(events: &mut broadcast::Receiver<TargetEvent>) -> String {
    loop {
        match timeout(WAIT, events.recv()).await.expect("no socketClosed") {
            Ok(TargetEvent::SocketClosed { target_id }) => return target_id,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(e) => panic!("event stream ended: {}", e),
        }
    }
}

mod relay {
    use super::*;

    #[tokio::test]
    async fn test_request_and_response_are_relayed_verbatim() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let mut device = harness.connect().await;

        let request = r#"{"id":1,"method":"Runtime.enable"}"#;
        harness.target.forward(request.to_string());
        assert_eq!(device.recv().await, request);

        let response = r#"{"id":1,"result":{}}"#;
        device.send(response).await;
        assert_eq!(harness.client_recv().await, response);
    }

    #[tokio::test]
    async fn test_notifications_reach_the_client() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let mut device = harness.connect().await;

        let paused = envelope::notification("Debugger.paused", json!({"reason": "other"}));
        device.send_json(&paused).await;
        assert_eq!(harness.client_recv_json().await, paused);
    }

    #[tokio::test]
    async fn test_messages_before_connect_are_replayed_in_order() {
        let mut harness = Harness::new(TargetOptions::default()).await;

        for id in 1..=5 {
            harness
                .target
                .forward(envelope::request(id, "Debugger.enable", json!({})).to_string());
        }
        let mut device = harness.connect().await;
        for id in 6..=8 {
            harness
                .target
                .forward(envelope::request(id, "Debugger.enable", json!({})).to_string());
        }

        for id in 1..=8 {
            assert_eq!(device.recv_json().await["id"], id);
        }
    }

    #[tokio::test]
    async fn test_byte_at_a_time_device_stream() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let mut device = harness.connect().await;

        let first = envelope::notification("Debugger.scriptParsed", json!({"scriptId": "1"}));
        let second = envelope::notification("Debugger.scriptParsed", json!({"scriptId": "2"}));
        let mut stream = encode_frame(first.to_string().as_bytes()).unwrap().to_vec();
        stream.extend_from_slice(&encode_frame(second.to_string().as_bytes()).unwrap());

        for byte in stream {
            device.stream.write_all(&[byte]).await.unwrap();
            device.stream.flush().await.unwrap();
        }

        assert_eq!(harness.client_recv_json().await, first);
        assert_eq!(harness.client_recv_json().await, second);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_alone() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let mut device = harness.connect().await;

        device.send("{not json").await;
        let resumed = envelope::notification("Debugger.resumed", json!({}));
        device.send_json(&resumed).await;

        assert_eq!(harness.client_recv_json().await, resumed);
    }

    #[tokio::test]
    async fn test_unknown_response_is_forwarded() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let mut device = harness.connect().await;

        let stray = json!({"id": 99, "result": {}});
        device.send_json(&stray).await;
        assert_eq!(harness.client_recv_json().await, stray);
    }

    #[tokio::test]
    async fn test_fire_to_tools_bypasses_device() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let _device = harness.connect().await;

        harness
            .target
            .fire_event_to_tools("Runtime.executionContextCreated", json!({"context": {"id": 1}}));
        harness.target.fire_result_to_tools(4, json!({}));

        assert_eq!(
            harness.client_recv_json().await,
            json!({"method": "Runtime.executionContextCreated", "params": {"context": {"id": 1}}})
        );
        assert_eq!(harness.client_recv_json().await, json!({"id": 4, "result": {}}));
    }

    #[tokio::test]
    async fn test_second_connect_is_ignored() {
        let harness = Harness::new(TargetOptions::default()).await;
        let _device = harness.connect().await;

        harness.target.direct_connect_to("/android/device-1");
        let second = timeout(Duration::from_millis(200), harness.listener.accept()).await;
        assert!(second.is_err(), "target opened a second device connection");
    }
}

mod filters {
    use super::*;

    #[tokio::test]
    async fn test_tools_filter_rewrites_before_device() {
        let harness = Harness::new(TargetOptions::default()).await;
        harness.target.add_message_filter(
            FilterKey::tools("Debugger.setBreakpointByUrl"),
            Arc::new(|mut message: Value| async move {
                message["params"]["lineNumber"] = json!(10);
                FilterOutcome::Forward(message)
            }),
        );
        let mut device = harness.connect().await;

        harness.target.forward(
            envelope::request(3, "Debugger.setBreakpointByUrl", json!({"lineNumber": 9}))
                .to_string(),
        );
        assert_eq!(device.recv_json().await["params"]["lineNumber"], 10);
    }

    #[tokio::test]
    async fn test_dropped_message_does_not_block_later_ones() {
        let harness = Harness::new(TargetOptions::default()).await;
        harness.target.add_message_filter(
            FilterKey::tools("Profiler.enable"),
            Arc::new(|_message: Value| async { FilterOutcome::Drop }),
        );
        let mut device = harness.connect().await;

        harness
            .target
            .forward(envelope::request(1, "Profiler.enable", json!({})).to_string());
        harness
            .target
            .forward(envelope::request(2, "Debugger.enable", json!({})).to_string());
        assert_eq!(device.recv_json().await["id"], 2);
    }

    #[tokio::test]
    async fn test_slow_filter_keeps_client_order() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        harness.target.add_message_filter(
            FilterKey::target("Debugger.scriptParsed"),
            Arc::new(|message: Value| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                FilterOutcome::Forward(message)
            }),
        );
        let mut device = harness.connect().await;

        let parsed = envelope::notification("Debugger.scriptParsed", json!({"scriptId": "1"}));
        let paused = envelope::notification("Debugger.paused", json!({}));
        device.send_json(&parsed).await;
        device.send_json(&paused).await;

        assert_eq!(harness.client_recv_json().await, parsed);
        assert_eq!(harness.client_recv_json().await, paused);
    }

    #[tokio::test]
    async fn test_error_responses_use_error_filter() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        harness.target.add_message_filter(
            FilterKey::target_error(),
            Arc::new(|message: Value| async move {
                let id = envelope::message_id(&message).unwrap_or_default();
                FilterOutcome::Forward(envelope::result(id, json!({})))
            }),
        );
        let mut device = harness.connect().await;

        harness
            .target
            .forward(envelope::request(5, "Page.reload", json!({})).to_string());
        device.recv().await;
        device
            .send_json(&json!({"id": 5, "error": {"code": -32601, "message": "not found"}}))
            .await;

        assert_eq!(harness.client_recv_json().await, json!({"id": 5, "result": {}}));
    }

    #[tokio::test]
    async fn test_response_filter_keyed_by_request_method() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        harness.target.add_message_filter(
            FilterKey::target("Debugger.enable"),
            Arc::new(|mut message: Value| async move {
                message["result"]["debuggerId"] = json!("rewritten");
                FilterOutcome::Forward(message)
            }),
        );
        let mut device = harness.connect().await;

        harness
            .target
            .forward(envelope::request(2, "Debugger.enable", json!({})).to_string());
        device.recv().await;
        device
            .send_json(&json!({"id": 2, "result": {"debuggerId": "abc"}}))
            .await;

        assert_eq!(
            harness.client_recv_json().await["result"]["debuggerId"],
            "rewritten"
        );
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let harness = Harness::new(TargetOptions::default()).await;
        let mut events = harness.target.subscribe();
        let _device = harness.connect().await;

        harness
            .target
            .forward(envelope::request(1, "Runtime.enable", json!({})).to_string());

        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            TargetEvent::Tools { method, message } => {
                assert_eq!(method, "Runtime.enable");
                assert_eq!(message["id"], 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

mod calls {
    use super::*;

    #[tokio::test]
    async fn test_call_resolves_once() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let mut device = harness.connect().await;

        let target = harness.target.clone();
        let call = tokio::spawn(async move {
            target
                .call_target("Valdi.enumerateDebuggableDevices", json!({}))
                .await
        });

        let request = device.recv_json().await;
        assert_eq!(request["id"], -1);
        assert_eq!(request["method"], "Valdi.enumerateDebuggableDevices");

        let response = json!({"id": -1, "result": [{"id": 1}]});
        device.send_json(&response).await;
        assert_eq!(call.await.unwrap(), Ok(json!([{"id": 1}])));

        // A duplicate is no longer correlated and goes to the client
        device.send_json(&response).await;
        assert_eq!(harness.client_recv_json().await, response);
    }

    #[tokio::test]
    async fn test_ids_count_down() {
        let harness = Harness::new(TargetOptions::default()).await;
        let mut device = harness.connect().await;

        for expected in [-1, -2, -3] {
            let target = harness.target.clone();
            let call = tokio::spawn(async move { target.call_target("Runtime.evaluate", json!({})).await });
            let request = device.recv_json().await;
            assert_eq!(request["id"], expected);
            device
                .send_json(&json!({"id": expected, "result": {}}))
                .await;
            assert!(call.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_error_response_rejects_call() {
        let harness = Harness::new(TargetOptions::default()).await;
        let mut device = harness.connect().await;

        let target = harness.target.clone();
        let call = tokio::spawn(async move { target.call_target("Valdi.connectToDebuggableDevice", json!({"id": "9"})).await });

        device.recv().await;
        device
            .send_json(&json!({"id": -1, "error": {"message": "no such runtime"}}))
            .await;
        assert_eq!(
            call.await.unwrap(),
            Err(TargetError::Rejected(json!({"message": "no such runtime"})))
        );
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let options = TargetOptions::default().with_call_timeout(Duration::from_millis(50));
        let harness = Harness::new(options).await;
        let mut device = harness.connect().await;

        let result = harness.target.call_target("Runtime.evaluate", json!({})).await;
        assert_eq!(result, Err(TargetError::Timeout { millis: 50 }));
        device.recv().await;
    }

    #[tokio::test]
    async fn test_call_before_connect_is_sent_in_order() {
        let harness = Harness::new(TargetOptions::default()).await;

        harness
            .target
            .forward(envelope::request(1, "Debugger.enable", json!({})).to_string());
        let target = harness.target.clone();
        let call = tokio::spawn(async move { target.call_target("Runtime.evaluate", json!({})).await });
        tokio::task::yield_now().await;
        harness
            .target
            .forward(envelope::request(2, "Debugger.enable", json!({})).to_string());

        let mut device = harness.connect().await;
        assert_eq!(device.recv_json().await["id"], 1);
        assert_eq!(device.recv_json().await["id"], -1);
        assert_eq!(device.recv_json().await["id"], 2);

        device.send_json(&json!({"id": -1, "result": {}})).await;
        assert!(call.await.unwrap().is_ok());
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_device_close_emits_socket_closed() {
        let harness = Harness::new(TargetOptions::default()).await;
        let mut events = harness.target.subscribe();
        let device = harness.connect().await;

        drop(device);
        assert_eq!(wait_for_close(&mut events).await, "device-1");

        let result = harness.target.call_target("Runtime.evaluate", json!({})).await;
        assert_eq!(result, Err(TargetError::Closed));
    }

    #[tokio::test]
    async fn test_pending_call_is_closed_with_socket() {
        let harness = Harness::new(TargetOptions::default()).await;
        let mut device = harness.connect().await;

        let target = harness.target.clone();
        let call = tokio::spawn(async move { target.call_target("Runtime.evaluate", json!({})).await });
        device.recv().await;
        drop(device);

        assert_eq!(call.await.unwrap(), Err(TargetError::Closed));
    }

    #[tokio::test]
    async fn test_connect_failure_emits_socket_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let target = AndroidTarget::spawn("gone", address, TargetOptions::default());
        let mut events = target.subscribe();
        target.direct_connect_to("/android/gone");
        assert_eq!(wait_for_close(&mut events).await, "gone");
    }

    #[tokio::test]
    async fn test_forward_after_close_reports_socket_closed() {
        let harness = Harness::new(TargetOptions::default()).await;
        let mut events = harness.target.subscribe();
        let device = harness.connect().await;
        drop(device);
        wait_for_close(&mut events).await;

        // Give the task time to finish
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness
            .target
            .forward(envelope::request(1, "Debugger.enable", json!({})).to_string());
        assert_eq!(wait_for_close(&mut events).await, "device-1");
    }

    #[tokio::test]
    async fn test_kill_is_silent() {
        let harness = Harness::new(TargetOptions::default()).await;
        let mut events = harness.target.subscribe();
        let mut device = harness.connect().await;

        harness.target.kill();

        let mut buf = [0u8; 16];
        let n = timeout(WAIT, device.stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_update_client_reconnects() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let _first = harness.connect().await;

        let (tools, mut client) = mpsc::unbounded_channel();
        harness.target.update_client(tools);
        let mut second = FakeDevice::accept(&harness.listener).await;

        let paused = envelope::notification("Debugger.paused", json!({}));
        second.send_json(&paused).await;
        assert_eq!(
            timeout(WAIT, client.recv()).await.unwrap().unwrap(),
            paused.to_string()
        );
        assert!(harness.client.try_recv().is_err());
    }
}

mod target_based {
    use super::*;

    fn options() -> TargetOptions {
        TargetOptions::default().target_based("page-7")
    }

    #[tokio::test]
    async fn test_outgoing_messages_are_wrapped() {
        let harness = Harness::new(options()).await;
        let mut device = harness.connect().await;

        let request = envelope::request(4, "Debugger.enable", json!({}));
        harness.target.forward(request.to_string());

        let wrapped = device.recv_json().await;
        assert_eq!(wrapped["method"], SEND_MESSAGE_TO_TARGET);
        assert_eq!(wrapped["params"]["targetId"], "page-7");
        let inner: Value =
            serde_json::from_str(wrapped["params"]["message"].as_str().unwrap()).unwrap();
        assert_eq!(inner, request);

        let own = envelope::request(5, "Target.setDiscoverTargets", json!({"discover": true}));
        harness.target.forward(own.to_string());
        assert_eq!(device.recv_json().await, own);
    }

    #[tokio::test]
    async fn test_incoming_messages_are_unwrapped() {
        let mut harness = Harness::new(options()).await;
        let mut device = harness.connect().await;

        harness
            .target
            .forward(envelope::request(4, "Debugger.enable", json!({})).to_string());
        device.recv().await;

        // Bare session traffic is not accepted on a multiplexed transport
        device.send_json(&json!({"id": 4, "result": {}})).await;

        let inner = r#"{"id":4,"result":{"debuggerId":"x"}}"#;
        let dispatched = envelope::notification(
            DISPATCH_MESSAGE_FROM_TARGET,
            json!({"targetId": "page-7", "message": inner}),
        );
        device.send_json(&dispatched).await;

        assert_eq!(harness.client_recv().await, inner);
    }
}

mod local_replies {
    use super::*;

    #[tokio::test]
    async fn test_reply_with_empty_answers_without_device() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let target = harness.target.clone();
        harness.target.add_message_filter(
            FilterKey::tools("Profiler.enable"),
            Arc::new(move |message: Value| {
                let outcome = target.reply_with_empty(&message);
                async move { outcome }
            }),
        );
        harness.target.add_message_filter(
            FilterKey::target("Profiler.enable"),
            Arc::new(|mut message: Value| async move {
                message["result"]["correlated"] = json!(true);
                FilterOutcome::Forward(message)
            }),
        );
        let mut device = harness.connect().await;

        harness
            .target
            .forward(envelope::request(5, "Profiler.enable", json!({})).to_string());
        assert_eq!(harness.client_recv_json().await, json!({"id": 5, "result": {}}));

        harness
            .target
            .forward(envelope::request(6, "Debugger.enable", json!({})).to_string());
        assert_eq!(device.recv_json().await["id"], 6);

        // The entry for 5 is gone, so a stray response skips the response filter
        let stray = json!({"id": 5, "result": {}});
        device.send_json(&stray).await;
        assert_eq!(harness.client_recv_json().await, stray);
    }
}

mod hermes_session {
    use super::*;
    use crate::protocols::HermesProtocol;
    use crate::protocols::hermes::CONNECT_METHOD;

    fn script(id: &str) -> Value {
        envelope::notification("Debugger.scriptParsed", json!({ "scriptId": id }))
    }

    #[tokio::test]
    async fn test_deferred_scripts_replay_before_run_response() {
        let mut harness = Harness::new(TargetOptions::default()).await;
        let target: Arc<dyn Target> = Arc::new(harness.target.clone());
        let _protocol = HermesProtocol::new(target, "1");
        let mut device = harness.connect().await;

        let attach = device.recv_json().await;
        assert_eq!(attach["method"], CONNECT_METHOD);
        device
            .send_json(&json!({ "id": attach["id"], "result": {} }))
            .await;

        harness
            .target
            .forward(envelope::request(1, "Runtime.enable", json!({})).to_string());
        assert_eq!(device.recv_json().await["id"], 1);
        device.send_json(&script("a")).await;
        device.send_json(&script("b")).await;
        device.send_json(&json!({"id": 1, "result": {}})).await;
        assert_eq!(harness.client_recv_json().await, json!({"id": 1, "result": {}}));
        device.send_json(&script("c")).await;

        harness.target.forward(
            envelope::request(2, "Runtime.runIfWaitingForDebugger", json!({})).to_string(),
        );
        assert_eq!(device.recv_json().await["id"], 2);
        device.send_json(&json!({"id": 2, "result": {}})).await;

        for id in ["a", "b", "c"] {
            assert_eq!(harness.client_recv_json().await, script(id));
        }
        assert_eq!(harness.client_recv_json().await, json!({"id": 2, "result": {}}));

        device.send_json(&script("d")).await;
        assert_eq!(harness.client_recv_json().await, script("d"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.client.try_recv().is_err());
    }
}

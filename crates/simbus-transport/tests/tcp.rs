//! Integration tests for the TCP binding.
//!
//! These spin up real listeners on loopback and connect comms instances
//! to them, so every byte goes through the socket, the framing, and the
//! registration handshake.

#[cfg(feature = "tcp")]
mod tcp {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use simbus_protocol::{Deframer, MIN_FRAME_SIZE};
    use simbus_transport::{
        Action, ActionMessage, ConnectionStatus, ProtocolCommand, RouteId, TcpComms,
    };
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    /// Everything a comms instance's callback has seen.
    #[derive(Clone, Default)]
    struct Inbox(Arc<Mutex<Vec<ActionMessage>>>);

    impl Inbox {
        fn attach(&self, comms: &TcpComms) {
            let seen = Arc::clone(&self.0);
            comms.set_callback(move |msg| seen.lock().push(msg));
        }

        fn count(&self, pred: impl Fn(&ActionMessage) -> bool) -> usize {
            self.0.lock().iter().filter(|m| pred(m)).count()
        }

        fn data(&self) -> Vec<ActionMessage> {
            self.0
                .lock()
                .iter()
                .filter(|m| m.action == Action::Data)
                .cloned()
                .collect()
        }
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// A connected server-mode root on a free port.
    async fn start_broker(name: &str) -> (TcpComms, Inbox) {
        let broker = TcpComms::default();
        broker.set_name(name);
        broker.set_server_mode(true);
        let inbox = Inbox::default();
        inbox.attach(&broker);
        assert!(broker.connect().await, "broker should connect");
        (broker, inbox)
    }

    /// A connected client of `broker`.
    async fn start_client(name: &str, broker: &TcpComms) -> (TcpComms, Inbox) {
        let client = TcpComms::default();
        client.set_name(name);
        client.load_target_info("localhost", broker.address());
        let inbox = Inbox::default();
        inbox.attach(&client);
        assert!(client.connect().await, "{name} should connect");
        (client, inbox)
    }

    /// A loopback port nothing is listening on right now.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// A connected server-mode root listening on `127.0.0.1:port`.
    async fn start_on_port(name: &str, port: u16) -> (TcpComms, Inbox) {
        let comms = TcpComms::default();
        comms.set_name(name);
        comms.set_server_mode(true);
        comms.set_port_number(port);
        comms.load_target_info("127.0.0.1", "");
        let inbox = Inbox::default();
        inbox.attach(&comms);
        assert!(comms.connect().await, "{name} should listen on {port}");
        (comms, inbox)
    }

    fn registrations(inbox: &Inbox) -> usize {
        inbox.count(|m| m.is_protocol(ProtocolCommand::ConnectionInfo))
    }

    #[tokio::test]
    async fn test_client_frames_to_raw_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpComms::default();
        client.set_name("core1");
        client.load_target_info("localhost", format!("127.0.0.1:{port}"));
        assert!(client.connect().await);
        client.transmit(RouteId::PARENT, Action::Ignore);

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut deframer = Deframer::default();
        let mut messages = Vec::new();
        while messages.len() < 2 {
            let n = stream.read_buf(deframer.buffer_mut()).await.unwrap();
            assert!(n > 0, "stream ended early");
            while let Some(msg) = deframer.next_message().unwrap() {
                messages.push(msg);
            }
        }

        // Registration first, then the data.
        assert!(messages[0].is_protocol(ProtocolCommand::ConnectionInfo));
        assert_eq!(messages[0].name, "core1");
        assert_eq!(messages[1].action, Action::Ignore);
        assert!(messages[1].packetize().unwrap().len() > 32);
        assert!(MIN_FRAME_SIZE > 32);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_listener_callback_fires_once_for_ignore() {
        let (broker, inbox) = start_broker("broker").await;
        let (client, _) = start_client("core1", &broker).await;

        client.transmit(RouteId::PARENT, Action::Ignore);
        eventually("ignore message", || inbox.count(|m| m.action == Action::Ignore) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(inbox.count(|m| m.action == Action::Ignore), 1);

        // The handshake came first and carried the client's name.
        let seen = inbox.0.lock().clone();
        let first = &seen[0];
        assert!(first.is_protocol(ProtocolCommand::ConnectionInfo));
        assert_eq!(first.name, "core1");

        client.disconnect().await;
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_server_without_port_publishes_bound_port() {
        let (broker, _) = start_broker("broker").await;
        let port = broker.port().expect("port is published");
        assert_ne!(port, 0);
        assert_eq!(broker.address(), format!("localhost:{port}"));

        // Something is really listening there.
        let stream = tokio::net::TcpStream::connect(("localhost", port)).await;
        assert!(stream.is_ok());
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_client_address_is_its_name() {
        let (broker, _) = start_broker("broker").await;
        let (client, _) = start_client("core7", &broker).await;
        assert_eq!(client.address(), "core7");
        assert!(client.port().is_none());
        client.disconnect().await;
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_ack_reaches_broker() {
        let (broker, inbox) = start_broker("broker").await;
        let (client, _) = start_client("core1", &broker).await;

        client.transmit(
            RouteId::PARENT,
            ActionMessage::new(Action::Ack).with_name("core1").with_source(3, 4),
        );
        eventually("ack", || inbox.count(|m| m.action == Action::Ack) == 1).await;
        let ack = inbox
            .0
            .lock()
            .iter()
            .find(|m| m.action == Action::Ack)
            .cloned()
            .unwrap();
        assert_eq!((ack.source_id, ack.source_handle), (3, 4));

        client.disconnect().await;
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_routes_deliver_only_to_their_target() {
        let (broker, broker_inbox) = start_broker("broker").await;
        let (client1, inbox1) = start_client("client1", &broker).await;
        let (client2, inbox2) = start_client("client2", &broker).await;
        eventually("both registrations", || registrations(&broker_inbox) == 2).await;

        broker.add_route(RouteId(1), client1.address());
        broker.add_route(RouteId(2), client2.address());
        broker.transmit(RouteId(1), ActionMessage::new(Action::Data).with_payload(b"one".to_vec()));
        broker.transmit(RouteId(2), ActionMessage::new(Action::Data).with_payload(b"two".to_vec()));

        eventually("client1 data", || inbox1.data().len() == 1).await;
        eventually("client2 data", || inbox2.data().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(inbox1.data().len(), 1);
        assert_eq!(inbox1.data()[0].payload, b"one");
        assert_eq!(inbox2.data().len(), 1);
        assert_eq!(inbox2.data()[0].payload, b"two");

        for comms in [&client1, &client2, &broker] {
            comms.disconnect().await;
        }
    }

    #[tokio::test]
    async fn test_unknown_route_falls_back_to_parent() {
        let (broker, inbox) = start_broker("broker").await;
        let (client, _) = start_client("core1", &broker).await;

        client.transmit(RouteId(99), Action::Data);
        eventually("fallback delivery", || inbox.data().len() == 1).await;

        client.disconnect().await;
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_address_route_is_dialed_on_demand() {
        let (target, target_inbox) = start_broker("target").await;
        let (source, _) = start_broker("source").await;

        source.add_route(RouteId(3), target.address());
        source.transmit(RouteId(3), ActionMessage::new(Action::Data).with_name("direct"));

        eventually("direct delivery", || target_inbox.data().len() == 1).await;
        let seen = target_inbox.0.lock().clone();
        assert!(seen[0].is_protocol(ProtocolCommand::ConnectionInfo));
        assert_eq!(seen[0].name, "source");
        assert_eq!(target_inbox.data()[0].name, "direct");

        source.disconnect().await;
        target.disconnect().await;
    }

    #[tokio::test]
    async fn test_per_route_order_is_preserved() {
        let (broker, inbox) = start_broker("broker").await;
        let (client, _) = start_client("core1", &broker).await;

        for i in 0..200 {
            client.transmit(RouteId::PARENT, ActionMessage::new(Action::Data).with_source(i, 0));
        }
        eventually("all messages", || inbox.data().len() == 200).await;
        let order: Vec<i32> = inbox.data().iter().map(|m| m.source_id).collect();
        assert_eq!(order, (0..200).collect::<Vec<_>>());

        client.disconnect().await;
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_messages_queued_before_connect_are_sent() {
        let (broker, inbox) = start_broker("broker").await;

        let client = TcpComms::default();
        client.set_name("early");
        client.load_target_info("localhost", broker.address());
        client.transmit(RouteId::PARENT, Action::Data);
        assert_eq!(client.pending(), 1);

        assert!(client.connect().await);
        eventually("queued message", || inbox.data().len() == 1).await;
        assert_eq!(client.pending(), 0);

        client.disconnect().await;
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_to_closed_listener_fails_within_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TcpComms::default();
        client.set_name("core1");
        client.load_target_info("localhost", format!("127.0.0.1:{port}"));
        client.set_timeout(Duration::from_millis(500));

        let started = Instant::now();
        assert!(!client.connect().await);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!client.is_connected());
        assert_eq!(client.tx_status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_disconnect_is_final_and_repeatable() {
        let (broker, _) = start_broker("broker").await;
        let (client, _) = start_client("core1", &broker).await;
        assert!(client.is_connected());
        assert!(client.connect().await, "connect is a no-op when connected");

        client.disconnect().await;
        assert!(!client.is_connected());
        assert_eq!(client.rx_status(), ConnectionStatus::Terminated);
        assert_eq!(client.tx_status(), ConnectionStatus::Terminated);

        client.disconnect().await;
        assert!(!client.connect().await);
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_broker_sees_goodbye_without_failing() {
        let (broker, _) = start_broker("broker").await;
        let (client, _) = start_client("core1", &broker).await;

        client.disconnect().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.is_connected());
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_losing_the_broker_is_an_error() {
        let (broker, _) = start_broker("broker").await;
        let (client, _) = start_client("core1", &broker).await;

        broker.disconnect().await;
        eventually("client notices", || !client.is_connected()).await;
        assert_eq!(client.rx_status(), ConnectionStatus::Error);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_oversized_message_is_dropped() {
        let (broker, inbox) = start_broker("broker").await;
        let client = TcpComms::default();
        client.set_name("core1");
        client.load_target_info("localhost", broker.address());
        client.set_message_size(256, 16);
        assert!(client.connect().await);

        client.transmit(RouteId::PARENT, ActionMessage::new(Action::Data).with_payload(vec![0u8; 1024]));
        client.transmit(RouteId::PARENT, ActionMessage::new(Action::Data).with_source(1, 1));
        eventually("small message", || inbox.data().len() == 1).await;
        assert_eq!(inbox.data()[0].source_id, 1);

        client.disconnect().await;
        broker.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_add_route_while_transmitting() {
        let (broker, inbox) = start_broker("broker").await;
        let (client, _) = start_client("core1", &broker).await;
        let client = Arc::new(client);

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let client = Arc::clone(&client);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = RouteId(1 + t * 50 + i);
                        // Names that are not connected fall back to the broker.
                        client.add_route(id, format!("peer-{t}-{i}"));
                        client.transmit(id, ActionMessage::new(Action::Data).with_source(id.0, 0));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        eventually("all messages", || inbox.data().len() == 200).await;
        assert_eq!(client.context().routes().len(), 200);
        client.disconnect().await;
        broker.disconnect().await;
    }

    #[tokio::test]
    async fn test_route_target_restart_is_redialed() {
        let port = free_port().await;
        let (source, _) = start_broker("source").await;
        source.add_route(RouteId(3), format!("127.0.0.1:{port}"));

        let (first, first_inbox) = start_on_port("target", port).await;
        source.transmit(RouteId(3), ActionMessage::new(Action::Data).with_name("one"));
        eventually("first delivery", || first_inbox.data().len() == 1).await;

        // The target goes away and comes back on the same port.
        first.disconnect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (second, second_inbox) = start_on_port("target", port).await;
        source.transmit(RouteId(3), ActionMessage::new(Action::Data).with_name("two"));
        eventually("delivery after restart", || second_inbox.data().len() == 1).await;
        assert_eq!(second_inbox.data()[0].name, "two");
        assert!(source.is_connected());

        source.disconnect().await;
        second.disconnect().await;
    }

    #[tokio::test]
    async fn test_unreachable_route_target_drops_message() {
        let port = free_port().await;
        let (source, _) = start_broker("source").await;
        source.add_route(RouteId(3), format!("127.0.0.1:{port}"));

        let (target, _) = start_on_port("target", port).await;
        target.disconnect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // No peer and no parent: logged and dropped, the source stays up.
        source.transmit(RouteId(3), ActionMessage::new(Action::Data).with_name("lost"));
        eventually("queue drained", || source.pending() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(source.is_connected());

        // The dropped message is not replayed to a later peer.
        let (later, later_inbox) = start_on_port("target", port).await;
        source.transmit(RouteId(3), ActionMessage::new(Action::Data).with_name("kept"));
        eventually("later delivery", || later_inbox.data().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let names: Vec<_> = later_inbox.data().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["kept".to_string()]);

        source.disconnect().await;
        later.disconnect().await;
    }

    #[tokio::test]
    async fn test_unreachable_parent_fails_both_sides() {
        let (broker, _) = start_broker("broker").await;
        let client = TcpComms::default();
        client.set_name("sub");
        client.set_server_mode(true);
        client.load_target_info("127.0.0.1", broker.address());
        assert!(client.connect().await);

        broker.disconnect().await;
        client.transmit(RouteId::PARENT, Action::Data);
        eventually("transmitter error", || client.tx_status() == ConnectionStatus::Error).await;
        eventually("receiver error", || client.rx_status() == ConnectionStatus::Error).await;
        assert!(!client.is_connected());

        // The parent is gone for good, so a retry fails too.
        client.set_timeout(Duration::from_millis(300));
        assert!(!client.connect().await);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_transmitter_error_stops_receiver() {
        let (broker, _) = start_broker("broker").await;
        let client = TcpComms::default();
        client.set_name("sub");
        client.set_server_mode(true);
        client.load_target_info("127.0.0.1", broker.address());
        let inbox = Inbox::default();
        inbox.attach(&client);
        assert!(client.connect().await);
        let address = client.address();

        client.context().set_tx_status(ConnectionStatus::Error);
        eventually("receiver stops", || client.rx_status() == ConnectionStatus::Error).await;

        // The listener went with the receiver.
        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(&address).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused, "receiver still accepting on {address}");
        assert_eq!(registrations(&inbox), 0);

        client.disconnect().await;
        broker.disconnect().await;
    }
}

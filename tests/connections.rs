//! End-to-end tests driving an `AsyncCore` over in-memory duplex streams and TCP.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use packet_engine::config::EngineConfig;
use packet_engine::core::{PacketReader, PacketWriter};
use packet_engine::error::{constants, ProtocolError, Result};
use packet_engine::protocol::{
    Compression, ConnectionState, Encryption, EncryptionInit, IncomingPacket, OutgoingPacket,
    PacketGroup, Protocol, ReadPacketResult,
};
use packet_engine::transport::{AsyncCore, CipherMode, Connection};
use packet_engine::utils::compression::{BlockCompression, CompressionKind};
use packet_engine::utils::logging::init_logging;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const SAY: u8 = 0x03;
const ECHO: u8 = 0x04;
const CRASH: u8 = 0x05;
const OOPS: u8 = 0x06;
const PANIC: u8 = 0x07;

#[derive(Clone, Copy, Default)]
struct Options {
    encrypted: bool,
    compressed: bool,
    joining: bool,
}

#[derive(Default)]
struct Player {
    options: Options,
    said: Mutex<Vec<String>>,
    closes: Mutex<Vec<String>>,
}

impl Player {
    fn said(&self) -> Vec<String> {
        self.said.lock().unwrap().clone()
    }

    fn closes(&self) -> Vec<String> {
        self.closes.lock().unwrap().clone()
    }
}

impl ConnectionState for Player {
    fn encryption(&self) -> Option<Box<dyn Encryption>> {
        if self.options.encrypted {
            Some(Box::new(Xor))
        } else {
            None
        }
    }

    fn compression(&self) -> Option<Arc<dyn Compression>> {
        if self.options.compressed {
            Some(Arc::new(BlockCompression::new(CompressionKind::Lz4)))
        } else {
            None
        }
    }

    fn packet_groups_joining_allowed(&self) -> bool {
        self.options.joining
    }

    fn on_close(&self, reason: &str) {
        self.closes.lock().unwrap().push(reason.to_string());
    }
}

/// Handshake `[0xc0, 1]` selects XOR 0x21, `[0xc0, 0]` plaintext.
struct Xor;

impl Encryption for Xor {
    fn init(&mut self, bytes: &[u8]) -> EncryptionInit {
        match bytes {
            [] | [0xc0] => EncryptionInit::NotEnoughData,
            [0xc0, 1, ..] => EncryptionInit::UseEncryption { consumed: 2 },
            [0xc0, 0, ..] => EncryptionInit::NoEncryption { consumed: 2 },
            _ => EncryptionInit::InvalidData,
        }
    }

    fn decrypt(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        for (o, i) in output.iter_mut().zip(input) {
            *o = i ^ 0x21;
        }
        Ok(input.len())
    }

    fn encrypt(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        self.decrypt(input, output)
    }
}

fn xor(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b ^ 0x21).collect()
}

#[derive(Default)]
struct Say {
    text: String,
}

impl IncomingPacket<Player> for Say {
    fn read(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult> {
        let len = reader.read_u16()? as usize;
        self.text = reader.read_ascii(len)?;
        Ok(ReadPacketResult::Success)
    }

    fn handle(self: Box<Self>, conn: &Arc<Connection<Player>>, state: &Player) -> Result<()> {
        state.said.lock().unwrap().push(self.text.clone());
        conn.send_packet(Echo(self.text));
        Ok(())
    }
}

/// Handler failing with the error chosen at registration.
struct Failing {
    fatal: bool,
}

impl IncomingPacket<Player> for Failing {
    fn read(&mut self, _reader: &mut PacketReader<'_>) -> Result<ReadPacketResult> {
        Ok(ReadPacketResult::Success)
    }

    fn handle(self: Box<Self>, _conn: &Arc<Connection<Player>>, _state: &Player) -> Result<()> {
        if self.fatal {
            Err(ProtocolError::Fatal("world state corrupted".into()))
        } else {
            Err(ProtocolError::Handler("bad target".into()))
        }
    }
}

/// Handler that panics instead of returning an error.
struct Panicking;

impl IncomingPacket<Player> for Panicking {
    fn read(&mut self, _reader: &mut PacketReader<'_>) -> Result<ReadPacketResult> {
        Ok(ReadPacketResult::Success)
    }

    fn handle(self: Box<Self>, _conn: &Arc<Connection<Player>>, _state: &Player) -> Result<()> {
        panic!("handler bug");
    }
}

/// Outgoing packet whose serializer panics on the worker.
struct Boom;

impl OutgoingPacket for Boom {
    fn id(&self) -> u8 {
        ECHO
    }

    fn write(&self, _writer: &mut PacketWriter<'_>) -> Result<()> {
        panic!("serializer bug");
    }
}

struct Echo(String);

impl OutgoingPacket for Echo {
    fn id(&self) -> u8 {
        ECHO
    }

    fn write(&self, writer: &mut PacketWriter<'_>) -> Result<()> {
        writer.write_u16(self.0.len() as u16)?;
        writer.write_ascii(&self.0)
    }
}

fn say(text: &str) -> Vec<u8> {
    let mut bytes = vec![SAY];
    bytes.extend_from_slice(&(text.len() as u16).to_be_bytes());
    bytes.extend_from_slice(text.as_bytes());
    bytes
}

fn echo(text: &str) -> Vec<u8> {
    let mut bytes = say(text);
    bytes[0] = ECHO;
    bytes
}

fn protocol() -> Protocol<Player> {
    Protocol::new()
        .register(SAY, "Say", || Box::<Say>::default())
        .register(CRASH, "Crash", || Box::new(Failing { fatal: true }))
        .register(OOPS, "Oops", || Box::new(Failing { fatal: false }))
        .register(PANIC, "Panic", || Box::new(Panicking))
}

fn config() -> EngineConfig {
    EngineConfig::default_with_overrides(|c| {
        c.core.buffer_size = 4096;
        c.core.worker_threads = 2;
        c.core.joined_group_interval = Duration::from_millis(200);
    })
}

fn core_with(config: &EngineConfig, options: Options) -> AsyncCore<Player> {
    init_logging(&config.logging);
    AsyncCore::new(config, protocol(), move |_, _| Player {
        options,
        ..Player::default()
    })
    .unwrap()
}

fn endpoint() -> SocketAddr {
    "127.0.0.1:2593".parse().unwrap()
}

fn attach(core: &AsyncCore<Player>) -> (DuplexStream, Arc<Connection<Player>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = core.accept(server, endpoint()).unwrap();
    (client, conn)
}

/// Tick the core until `done` holds.
async fn pump<F: Fn() -> bool>(core: &AsyncCore<Player>, done: F) {
    for _ in 0..400 {
        core.cycle().unwrap();
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn read_exactly(client: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("timed out waiting for server bytes")
        .unwrap();
    buf
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fragmented_packet_is_handled_and_answered() {
    let core = core_with(&config(), Options::default());
    let (mut client, conn) = attach(&core);

    let bytes = say("hello");
    client.write_all(&bytes[..3]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(&bytes[3..]).await.unwrap();

    pump(&core, || conn.state().said().len() == 1).await;
    assert_eq!(conn.state().said(), vec!["hello"]);
    assert_eq!(read_exactly(&mut client, 8).await, echo("hello"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_packets_dispatched_in_stream_order() {
    let core = core_with(&config(), Options::default());
    let (mut client, conn) = attach(&core);

    let mut bytes = say("a");
    bytes.extend(say("bb"));
    bytes.extend(say("ccc"));
    client.write_all(&bytes).await.unwrap();

    pump(&core, || conn.state().said().len() == 3).await;
    assert_eq!(conn.state().said(), vec!["a", "bb", "ccc"]);

    let mut expected = echo("a");
    expected.extend(echo("bb"));
    expected.extend(echo("ccc"));
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_packet_keeps_connection_open() {
    let core = core_with(&config(), Options::default());
    let (mut client, conn) = attach(&core);

    client.write_all(&[0x7f, 1, 2, 3]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(&say("still here")).await.unwrap();

    pump(&core, || conn.state().said().len() == 1).await;
    assert!(!conn.is_closed());
    assert_eq!(core.metrics().snapshot().packets_unknown, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_close_notifies_state_once() {
    let core = core_with(&config(), Options::default());
    let (client, conn) = attach(&core);
    assert_eq!(core.connection_count(), 1);

    drop(client);
    pump(&core, || !conn.state().closes().is_empty()).await;

    assert_eq!(conn.state().closes(), vec![constants::REASON_REMOTE_CLOSED]);
    assert_eq!(core.connection_count(), 0);
    assert!(core.connection(conn.id()).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_close_is_idempotent() {
    let core = core_with(&config(), Options::default());
    let (_client, conn) = attach(&core);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let conn = conn.clone();
            std::thread::spawn(move || conn.close(&format!("reason {i}")))
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|closed| *closed)
        .count();
    assert_eq!(winners, 1);

    pump(&core, || !conn.state().closes().is_empty()).await;
    for _ in 0..5 {
        core.cycle().unwrap();
    }
    let closes = conn.state().closes();
    assert_eq!(closes.len(), 1);
    assert_eq!(Some(closes[0].as_str()), conn.closing_reason());
    assert!(!conn.close("late"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fatal_handler_error_aborts_cycle() {
    let core = core_with(&config(), Options::default());
    let (mut client, conn) = attach(&core);

    let mut bytes = vec![OOPS, CRASH];
    bytes.extend(say("after"));
    client.write_all(&bytes).await.unwrap();

    let mut fatal = None;
    for _ in 0..400 {
        match core.cycle() {
            Err(e) => {
                fatal = Some(e);
                break;
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    assert!(fatal.is_some_and(|e| e.is_fatal()));
    assert_eq!(core.metrics().snapshot().handler_errors, 1);

    // the rest of the batch stays queued
    pump(&core, || conn.state().said() == vec!["after"]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_handler_does_not_lose_batch() {
    let core = core_with(&config(), Options::default());
    let (mut client, conn) = attach(&core);

    let mut bytes = vec![PANIC];
    bytes.extend(say("survivor"));
    client.write_all(&bytes).await.unwrap();

    pump(&core, || conn.state().said() == vec!["survivor"]).await;
    assert_eq!(core.metrics().snapshot().handler_errors, 1);
    assert!(!conn.is_closed());
    assert_eq!(read_exactly(&mut client, 11).await, echo("survivor"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_panic_closes_only_its_connection() {
    // one worker serves both connections
    let config = EngineConfig::default_with_overrides(|c| {
        c.core.buffer_size = 4096;
        c.core.worker_threads = 1;
    });
    let core = core_with(&config, Options::default());
    let (_a, broken) = attach(&core);
    let (mut client, healthy) = attach(&core);

    broken.send_packet(Boom);
    pump(&core, || !broken.state().closes().is_empty()).await;
    assert_eq!(broken.state().closes(), vec![constants::ERR_SEND_PANICKED]);

    client.write_all(&say("after")).await.unwrap();
    pump(&core, || healthy.state().said().len() == 1).await;
    assert_eq!(read_exactly(&mut client, 8).await, echo("after"));
    assert!(!healthy.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_delivers_close_notifications() {
    let core = core_with(&config(), Options::default());
    let (_a, first) = attach(&core);
    let (_b, second) = attach(&core);

    drop(core);
    assert_eq!(first.state().closes(), vec![constants::REASON_SHUTDOWN]);
    assert_eq!(second.state().closes(), vec![constants::REASON_SHUTDOWN]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_encrypted_round_trip() {
    let options = Options {
        encrypted: true,
        ..Options::default()
    };
    let core = core_with(&config(), options);
    let (mut client, conn) = attach(&core);
    assert_eq!(conn.cipher_mode(), CipherMode::Pending);

    client.write_all(&[0xc0]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(conn.cipher_mode(), CipherMode::Pending);

    let mut bytes = vec![1];
    bytes.extend(xor(&say("secret")));
    client.write_all(&bytes).await.unwrap();

    pump(&core, || conn.state().said().len() == 1).await;
    assert_eq!(conn.cipher_mode(), CipherMode::Encrypted);
    assert_eq!(conn.state().said(), vec!["secret"]);
    assert_eq!(xor(&read_exactly(&mut client, 9).await), echo("secret"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plaintext_handshake_selects_no_encryption() {
    let options = Options {
        encrypted: true,
        ..Options::default()
    };
    let core = core_with(&config(), options);
    let (mut client, conn) = attach(&core);

    let mut bytes = vec![0xc0, 0];
    bytes.extend(say("plain"));
    client.write_all(&bytes).await.unwrap();

    pump(&core, || conn.state().said().len() == 1).await;
    assert_eq!(conn.cipher_mode(), CipherMode::Plain);
    assert_eq!(read_exactly(&mut client, 8).await, echo("plain"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sending_before_handshake_closes_connection() {
    let options = Options {
        encrypted: true,
        ..Options::default()
    };
    let core = core_with(&config(), options);
    let (_client, conn) = attach(&core);

    conn.send_packet(Echo("too early".into()));
    pump(&core, || !conn.state().closes().is_empty()).await;
    assert_eq!(
        conn.state().closes(),
        vec![constants::ERR_ENCRYPTION_NOT_INITIALISED]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrecognised_handshake_closes_connection() {
    let options = Options {
        encrypted: true,
        ..Options::default()
    };
    let core = core_with(&config(), options);
    let (mut client, conn) = attach(&core);

    client.write_all(&[0x99, 0x01]).await.unwrap();
    pump(&core, || !conn.state().closes().is_empty()).await;
    assert_eq!(
        conn.state().closes(),
        vec![constants::ERR_ENCRYPTION_NOT_RECOGNISED]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_packet_fills_incoming_buffer() {
    let config = EngineConfig::default_with_overrides(|c| c.core.buffer_size = 1024);
    let core = core_with(&config, Options::default());
    let (mut client, conn) = attach(&core);

    let mut bytes = vec![SAY];
    bytes.extend_from_slice(&4000u16.to_be_bytes());
    bytes.extend(std::iter::repeat(b'x').take(2000));
    client.write_all(&bytes).await.unwrap();

    pump(&core, || !conn.state().closes().is_empty()).await;
    assert_eq!(
        conn.state().closes(),
        vec![constants::ERR_INCOMING_BUFFER_FULL]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compressed_round_trip() {
    let options = Options {
        compressed: true,
        ..Options::default()
    };
    let core = core_with(&config(), options);
    let (mut client, conn) = attach(&core);
    let strategy = BlockCompression::new(CompressionKind::Lz4);

    let mut framed = vec![0u8; 1024];
    let n = strategy.compress(&say("squeezed"), &mut framed).unwrap();
    client.write_all(&framed[..n]).await.unwrap();

    pump(&core, || conn.state().said().len() == 1).await;

    let header = read_exactly(&mut client, 4).await;
    let block_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mut frame = header;
    frame.extend(read_exactly(&mut client, block_len).await);

    let mut plain = vec![0u8; 1024];
    let d = strategy.decompress(&frame, &mut plain).unwrap();
    assert_eq!(d.consumed, frame.len());
    assert_eq!(&plain[..d.produced], echo("squeezed").as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_joined_groups_sent_as_one() {
    let options = Options {
        joining: true,
        ..Options::default()
    };
    let core = core_with(&config(), options);
    let (mut client, conn) = attach(&core);

    conn.send_packet(Echo("one".into()));
    conn.send_packet(Echo("two".into()));

    let mut expected = echo("one");
    expected.extend(echo("two"));
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
    // the worker counts the group right after handing it to the writer
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(core.metrics().snapshot().groups_sent, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_group_is_not_joined() {
    let options = Options {
        joining: true,
        ..Options::default()
    };
    let core = core_with(&config(), options);
    let (mut client, conn) = attach(&core);

    let group = PacketGroup::multi_use(core.pool());
    group.add(Echo("kept".into()));
    conn.send_packet_group(group.clone());
    conn.send_packet_group(group.clone());

    let mut expected = echo("kept");
    expected.extend(echo("kept"));
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
    assert!(!group.is_disposed());
    assert!(group.dispose());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_disposes_single_use_group_after_last_send() {
    let core = core_with(&config(), Options::default());
    let mut clients = Vec::new();
    let mut conns = Vec::new();
    for _ in 0..3 {
        let (client, conn) = attach(&core);
        clients.push(client);
        conns.push(conn);
    }

    let group = PacketGroup::single_use(core.pool());
    group.add(Echo("all".into()));
    core.broadcast(&conns, &group);

    for client in &mut clients {
        assert_eq!(read_exactly(client, 6).await, echo("all"));
    }
    for _ in 0..100 {
        if group.is_disposed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(group.is_disposed());
    assert_eq!(group.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_group_is_ignored() {
    let core = core_with(&config(), Options::default());
    let (_client, conn) = attach(&core);

    let group = PacketGroup::single_use(core.pool());
    conn.send_packet_group(group.clone());
    assert_eq!(group.in_flight(), 0);
    assert!(!conn.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit() {
    let config = EngineConfig::default_with_overrides(|c| c.server.max_connections = 1);
    let core = core_with(&config, Options::default());
    let (_client, _conn) = attach(&core);

    let (_other, server) = tokio::io::duplex(1024);
    let rejected = core.accept(server, endpoint());
    assert!(matches!(rejected, Err(ProtocolError::ConnectionLimit(1))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_connections_and_is_repeatable() {
    let core = core_with(&config(), Options::default());
    let (_a, first) = attach(&core);
    let (_b, second) = attach(&core);

    core.shutdown();
    core.shutdown();
    assert!(core.is_shut_down());
    core.cycle().unwrap();

    assert_eq!(first.state().closes(), vec![constants::REASON_SHUTDOWN]);
    assert_eq!(second.state().closes(), vec![constants::REASON_SHUTDOWN]);
    assert_eq!(core.connection_count(), 0);

    let (_c, server) = tokio::io::duplex(1024);
    assert!(core.accept(server, endpoint()).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_listener_accepts_clients() {
    let config = EngineConfig::default_with_overrides(|c| c.server.address = "127.0.0.1:0".into());
    let core = core_with(&config, Options::default());
    let addr = core.listen(&config.server.address).await.unwrap();

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    client.write_all(&say("over tcp")).await.unwrap();

    pump(&core, || {
        core.connections()
            .iter()
            .any(|c| c.state().said() == vec!["over tcp"])
    })
    .await;

    let mut reply = vec![0u8; 11];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, echo("over tcp"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_dials_listener() {
    let config = EngineConfig::default_with_overrides(|c| c.server.address = "127.0.0.1:0".into());
    let core = core_with(&config, Options::default());
    let addr = core.listen(&config.server.address).await.unwrap();

    let dialed = core.connect(&addr.to_string()).await.unwrap();
    dialed.send_packet(Echo("ping".into()));

    // both ends belong to this core
    pump(&core, || core.connection_count() == 2).await;
    assert_eq!(dialed.endpoint(), addr);
}

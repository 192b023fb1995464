//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EtherNet/IP transport tests against an in-process fake controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plclink_common::{AppConfig, ControllerConfig};
use plclink_core::{
    LinkError, TagRegistry, TagService, TagValue, TransportAdapter, WireRead, WireType,
    WireValue, WireWrite,
};
use plclink_net::adapters::cip::TagPath;
use plclink_net::CipTransport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SESSION: u32 = 0x0BAD_F00D;

type Memory = Arc<Mutex<HashMap<Vec<u8>, (u16, Vec<u8>)>>>;

/// Minimal Logix responder: register/unregister session and tag services
/// routed through Unconnected Send.
struct FakeController {
    addr: SocketAddr,
    memory: Memory,
    connections: Arc<AtomicUsize>,
}

impl FakeController {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let memory: Memory = Arc::default();
        let connections = Arc::new(AtomicUsize::new(0));
        let (mem, count) = (memory.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, mem.clone()));
            }
        });
        Self {
            addr,
            memory,
            connections,
        }
    }

    fn seed(&self, address: &str, type_code: u16, data: &[u8]) {
        let path = TagPath::parse(address).unwrap().encode();
        self.memory
            .lock()
            .unwrap()
            .insert(path, (type_code, data.to_vec()));
    }

    fn stored(&self, address: &str) -> Option<(u16, Vec<u8>)> {
        let path = TagPath::parse(address).unwrap().encode();
        self.memory.lock().unwrap().get(&path).cloned()
    }

    fn transport(&self) -> CipTransport {
        CipTransport::new(&ControllerConfig {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            io_timeout: Duration::from_secs(2),
            ..ControllerConfig::default()
        })
    }
}

async fn serve(mut socket: TcpStream, memory: Memory) {
    loop {
        let mut head = [0u8; 24];
        if socket.read_exact(&mut head).await.is_err() {
            return;
        }
        let command = u16::from_le_bytes([head[0], head[1]]);
        let length = u16::from_le_bytes([head[2], head[3]]) as usize;
        let mut body = vec![0u8; length];
        if socket.read_exact(&mut body).await.is_err() {
            return;
        }
        match command {
            0x0065 => reply(&mut socket, 0x0065, &[1, 0, 0, 0]).await,
            0x0066 => return,
            0x006F => {
                let cip = handle_cip(&body[16..], &memory);
                let mut payload = vec![0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0xB2, 0];
                payload.extend_from_slice(&(cip.len() as u16).to_le_bytes());
                payload.extend_from_slice(&cip);
                reply(&mut socket, 0x006F, &payload).await;
            }
            other => panic!("unexpected command 0x{other:04X}"),
        }
    }
}

async fn reply(socket: &mut TcpStream, command: u16, payload: &[u8]) {
    let mut frame = Vec::with_capacity(24 + payload.len());
    frame.extend_from_slice(&command.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&SESSION.to_le_bytes());
    frame.extend_from_slice(&[0; 16]);
    frame.extend_from_slice(payload);
    socket.write_all(&frame).await.unwrap();
}

fn handle_cip(cip: &[u8], memory: &Memory) -> Vec<u8> {
    assert_eq!(cip[0], 0x52, "requests are routed through unconnected send");
    let size = u16::from_le_bytes([cip[8], cip[9]]) as usize;
    let embedded = &cip[10..10 + size];
    let service = embedded[0];
    let words = embedded[1] as usize;
    let path = embedded[2..2 + words * 2].to_vec();
    let rest = &embedded[2 + words * 2..];
    let mut memory = memory.lock().unwrap();

    match service {
        0x4C => match memory.get(&path) {
            Some((code, data)) => {
                let mut out = vec![0xCC, 0, 0, 0];
                out.extend_from_slice(&code.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
            None => vec![0xCC, 0, 0x05, 0],
        },
        0x4D => {
            let code = u16::from_le_bytes([rest[0], rest[1]]);
            memory.insert(path, (code, rest[4..].to_vec()));
            vec![0xCD, 0, 0, 0]
        }
        0x4E => {
            let size = u16::from_le_bytes([rest[0], rest[1]]) as usize;
            let or_mask = &rest[2..2 + size];
            let and_mask = &rest[2 + size..2 + 2 * size];
            let (code, current) = memory.get(&path).cloned().unwrap_or_else(|| {
                let code = match size {
                    1 => 0x00C2,
                    2 => 0x00C3,
                    _ => 0x00C4,
                };
                (code, vec![0; size])
            });
            if current.len() != size {
                return vec![0xCE, 0, 0x13, 0];
            }
            let next = current
                .iter()
                .zip(and_mask.iter().zip(or_mask))
                .map(|(cur, (and, or))| (cur & and) | or)
                .collect();
            memory.insert(path, (code, next));
            vec![0xCE, 0, 0, 0]
        }
        other => vec![other | 0x80, 0, 0x08, 0],
    }
}

fn read(address: &str, wire_type: WireType) -> WireRead {
    WireRead {
        address: address.into(),
        wire_type,
    }
}

#[tokio::test]
async fn writes_and_reads_scalars_one_connection_per_call() {
    let plc = FakeController::start().await;
    let transport = plc.transport();

    transport
        .write(&WireWrite {
            address: "Reel.RealData[0]".into(),
            value: WireValue::Real(42.5),
        })
        .await
        .unwrap();
    let value = transport
        .read(&read("Reel.RealData[0]", WireType::Real))
        .await
        .unwrap();
    assert_eq!(value, WireValue::Real(42.5));
    assert_eq!(plc.connections.load(Ordering::SeqCst), 2);

    plc.seed("Line.Count", 0x00C3, &(-7i16).to_le_bytes());
    let value = transport
        .read(&read("Line.Count", WireType::Dint))
        .await
        .unwrap();
    assert_eq!(value, WireValue::Dint(-7));
}

#[tokio::test]
async fn bit_addresses_touch_only_their_bit() {
    let plc = FakeController::start().await;
    plc.seed("_200_GLB.BoolData[0]", 0x00C4, &4u32.to_le_bytes());
    let transport = plc.transport();

    transport
        .write(&WireWrite {
            address: "_200_GLB.BoolData[0].0".into(),
            value: WireValue::Bool(true),
        })
        .await
        .unwrap();
    assert_eq!(
        plc.stored("_200_GLB.BoolData[0]").unwrap().1,
        5u32.to_le_bytes().to_vec()
    );

    let set = transport
        .read(&read("_200_GLB.BoolData[0].2", WireType::Bool))
        .await
        .unwrap();
    assert_eq!(set, WireValue::Bool(true));
    let clear = transport
        .read(&read("_200_GLB.BoolData[0].1", WireType::Bool))
        .await
        .unwrap();
    assert_eq!(clear, WireValue::Bool(false));

    let err = transport
        .write(&WireWrite {
            address: "_200_GLB.BoolData[0].1".into(),
            value: WireValue::Dint(1),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::InvalidAddressFormat(_)));
}

#[tokio::test]
async fn bit_writes_on_sint_words_send_one_byte_masks() {
    let plc = FakeController::start().await;
    plc.seed("Flags", 0x00C2, &[0b0001]);
    let transport = plc.transport();

    transport
        .write(&WireWrite {
            address: "Flags.3".into(),
            value: WireValue::Bool(true),
        })
        .await
        .unwrap();
    assert_eq!(plc.stored("Flags"), Some((0x00C2, vec![0b1001])));
    assert_eq!(plc.connections.load(Ordering::SeqCst), 1);

    transport
        .write(&WireWrite {
            address: "Flags.0".into(),
            value: WireValue::Bool(false),
        })
        .await
        .unwrap();
    assert_eq!(plc.stored("Flags"), Some((0x00C2, vec![0b1000])));
}

#[tokio::test]
async fn int_words_expose_sixteen_bits() {
    let plc = FakeController::start().await;
    plc.seed("Word", 0x00C3, &0x8000u16.to_le_bytes());
    let transport = plc.transport();

    let top = transport
        .read(&read("Word.15", WireType::Bool))
        .await
        .unwrap();
    assert_eq!(top, WireValue::Bool(true));

    let err = transport
        .read(&read("Word.20", WireType::Bool))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::InvalidAddressFormat(_)), "{err:?}");

    let err = transport
        .write(&WireWrite {
            address: "Word.20".into(),
            value: WireValue::Bool(true),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::InvalidAddressFormat(_)), "{err:?}");
    assert_eq!(
        plc.stored("Word"),
        Some((0x00C3, 0x8000u16.to_le_bytes().to_vec()))
    );
}

#[tokio::test]
async fn bit_selectors_on_real_tags_are_rejected() {
    let plc = FakeController::start().await;
    plc.seed("Level", 0x00CA, &1.0f32.to_le_bytes());
    let err = plc
        .transport()
        .read(&read("Level.0", WireType::Bool))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::InvalidAddressFormat(_)), "{err:?}");
}

#[tokio::test]
async fn controller_errors_carry_cip_status() {
    let plc = FakeController::start().await;
    let err = plc
        .transport()
        .read(&read("Missing.Tag", WireType::Dint))
        .await
        .unwrap_err();
    match err {
        LinkError::Transport { address, cause } => {
            assert_eq!(address, "Missing.Tag");
            assert!(cause.contains("path destination unknown"), "{cause}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn malformed_addresses_fail_before_connecting() {
    let plc = FakeController::start().await;
    let err = plc
        .transport()
        .read(&read("Tag[oops]", WireType::Dint))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::InvalidAddressFormat(_)));
    assert_eq!(plc.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn probe_reports_reachability() {
    let plc = FakeController::start().await;
    plc.transport().probe().await.unwrap();

    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);
    let unreachable = CipTransport::new(&ControllerConfig {
        host: "127.0.0.1".into(),
        port,
        connect_timeout: Duration::from_millis(500),
        ..ControllerConfig::default()
    });
    let status = unreachable.status().await;
    assert!(!status.connected);
    assert!(status.error.unwrap().contains("connect to 127.0.0.1"));
}

#[tokio::test]
async fn string_tags_round_trip_through_elements() {
    let plc = FakeController::start().await;
    let config = AppConfig::default();
    let registry = TagRegistry::from_config(&config.tags).unwrap();
    let service = TagService::new(Arc::new(registry), Arc::new(plc.transport()));

    let ack = service
        .write("userName", &TagValue::Text("OPS".into()))
        .await
        .unwrap();
    assert_eq!(ack.elements, 16);
    assert_eq!(
        plc.stored("_200_GLB.StringData[0][1]"),
        Some((0x00C2, vec![b'P']))
    );
    assert_eq!(
        service.read("userName").await.unwrap(),
        TagValue::Text("OPS".into())
    );
}

use crate::*;

use std::net::SocketAddr;
use std::sync::Arc;

use dinet_core::reg::base;
use dinet_core::{ModuleType, Packet, RegWidth};
use dinet_host::{Transport, UdpTransport};
use tokio::net::UdpSocket;

/// Serve a simulated target on a loopback UDP socket. Replies go to the
/// last sender.
async fn serve_udp() -> (SocketAddr, SimulatedTarget) {
    let config = DinetConfig::default();
    let subnet = Subnet::new(&config.link, &config.target).unwrap();
    let (bridge, device) = ChannelTransport::pair(64);
    let target = SimulatedTarget::spawn(subnet, device, Duration::ZERO);

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        let mut peer: Option<SocketAddr> = None;
        loop {
            tokio::select! {
                r = socket.recv_from(&mut buf) => {
                    let Ok((len, from)) = r else { return };
                    peer = Some(from);
                    if let Ok(p) = Packet::from_bytes(&buf[..len]) {
                        if bridge.send(p).await.is_err() {
                            return;
                        }
                    }
                }
                r = bridge.recv() => {
                    let Ok(p) = r else { return };
                    if let Some(to) = peer {
                        let _ = socket.send_to(&p.to_bytes(), to).await;
                    }
                }
            }
        }
    });
    (addr, target)
}

#[tokio::test]
async fn test_session_over_udp() {
    let (addr, target) = serve_udp().await;
    let transport = UdpTransport::connect("127.0.0.1:0", addr).await.unwrap();
    assert_eq!(transport.peer(), addr);

    let session = HostSession::new(transport, session_config(&DinetConfig::default()));
    let report = session.connect().await.unwrap();
    assert_eq!(report.modules, 3);

    assert_eq!(
        session.register_read(STM, RegWidth::W16, base::MOD_TYPE).await.unwrap(),
        u128::from(ModuleType::Stm.raw())
    );
    session
        .register_write(MAM, RegWidth::W128, 0x280, 0x0011_2233_4455_6677_8899_aabb_ccdd_eeff)
        .await
        .unwrap();
    assert_eq!(
        session.register_read(MAM, RegWidth::W128, 0x280).await.unwrap(),
        0x0011_2233_4455_6677_8899_aabb_ccdd_eeff
    );

    session.set_event_destination(STM).await.unwrap();
    session.set_event_active(STM, true).await.unwrap();
    let payload: Vec<u16> = (0..30).collect();
    target.emit_event(STM, payload.clone()).await.unwrap();
    let event = session.event_receive().await.unwrap();
    assert_eq!(event.payload, payload);

    session.disconnect().await;
    target.shutdown().await;
}

#[tokio::test]
async fn test_garbage_datagrams_are_ignored() {
    let (addr, target) = serve_udp().await;
    let transport = UdpTransport::connect("127.0.0.1:0", addr).await.unwrap();
    let local = transport.local_addr().unwrap();

    // Noise aimed at the host socket from a stranger.
    let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    noise.send_to(&[0xff; 3], local).await.unwrap();

    let session = HostSession::new(transport, session_config(&DinetConfig::default()));
    assert_eq!(session.connect().await.unwrap().modules, 3);
    session.disconnect().await;
    target.shutdown().await;
}

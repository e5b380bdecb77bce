use crate::*;

use std::sync::Arc;

use dinet_core::{EventKind, Packet, PacketClass, PacketKind, RegKind, RegWidth, Subtype};
use dinet_fabric::FabricError;
use dinet_host::{EventHandler, SessionError, SimError};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_module_event_is_reassembled() {
    let rig = rig().await.unwrap();
    start_stm(&rig).await.unwrap();

    let payload: Vec<u16> = (0..20).map(|i| 0x100 + i).collect();
    let packets = rig.target.emit_event(STM, payload.clone()).await.unwrap();
    assert_eq!(packets, 3);

    let event = rig.session.event_receive().await.unwrap();
    assert_eq!(event.src, STM);
    assert_eq!(event.dest, rig.session.host_address());
    assert_eq!(event.kind, PacketKind::Event(EventKind::LAST));
    assert_eq!(event.payload, payload);

    let none = rig
        .session
        .event_receive_timeout(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(none.is_none());
    rig.shutdown().await;
}

#[tokio::test]
async fn test_empty_event_is_delivered() {
    let rig = rig().await.unwrap();
    start_stm(&rig).await.unwrap();

    assert_eq!(rig.target.emit_event(STM, vec![]).await.unwrap(), 1);
    let event = rig.session.event_receive().await.unwrap();
    assert!(event.payload.is_empty());
    rig.shutdown().await;
}

#[tokio::test]
async fn test_stalled_module_emits_nothing() {
    let rig = rig().await.unwrap();
    rig.session.set_event_destination(STM).await.unwrap();

    let err = rig.target.emit_event(STM, vec![1, 2]).await.unwrap_err();
    assert!(matches!(err, SimError::Fabric(FabricError::ModuleInactive(_))));

    rig.session.set_event_active(STM, true).await.unwrap();
    rig.target.emit_event(STM, vec![1, 2]).await.unwrap();
    rig.session.set_event_active(STM, false).await.unwrap();
    let err = rig.target.emit_event(STM, vec![3]).await.unwrap_err();
    assert!(matches!(err, SimError::Fabric(FabricError::ModuleInactive(_))));

    let event = rig.session.event_receive().await.unwrap();
    assert_eq!(event.payload, vec![1, 2]);
    rig.shutdown().await;
}

#[tokio::test]
async fn test_handler_takes_every_event() {
    let rig = rig().await.unwrap();
    start_stm(&rig).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: EventHandler = Arc::new(move |p: Packet| {
        let _ = tx.send(p);
    });
    rig.session.set_event_handler(Some(handler)).await;

    for i in 0..3u16 {
        rig.target.emit_event(STM, vec![i; 10]).await.unwrap();
    }
    for i in 0..3u16 {
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload, vec![i; 10]);
    }
    let queued = rig
        .session
        .event_receive_timeout(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(queued.is_none());

    // Removing the handler sends events back to the queue.
    rig.session.set_event_handler(None).await;
    rig.target.emit_event(STM, vec![9]).await.unwrap();
    assert_eq!(rig.session.event_receive().await.unwrap().payload, vec![9]);
    rig.shutdown().await;
}

#[tokio::test]
async fn test_full_event_queue_drops_new_events() {
    let mut config = DinetConfig::default();
    config.host.event_queue_depth = 2;
    let rig = rig_with(&config).await.unwrap();
    start_stm(&rig).await.unwrap();

    for i in 0..4u16 {
        rig.target.emit_event(STM, vec![i]).await.unwrap();
    }
    rig.session
        .register_read(STM, RegWidth::W16, dinet_core::reg::base::MOD_CS)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut got = Vec::new();
    while let Some(p) = rig
        .session
        .event_receive_timeout(Duration::from_millis(50))
        .await
        .unwrap()
    {
        got.push(p.payload[0]);
    }
    assert_eq!(got, vec![0, 1]);
    rig.shutdown().await;
}

#[tokio::test]
async fn test_host_events_are_fragmented_to_fit() {
    let rig = rig().await.unwrap();
    let before = rig.target.stats().await.unwrap().subnet.routed_packets;

    let payload: Vec<u16> = (0..19).collect();
    let sent = rig.session.event_send_payload(MAM, &payload).await.unwrap();
    assert_eq!(sent, 3);

    // The register read queues behind the event packets on the same path.
    rig.session.register_read(MAM, RegWidth::W16, 0).await.unwrap();
    let after = rig.target.stats().await.unwrap().subnet.routed_packets;
    assert_eq!(after - before, 4);
    rig.shutdown().await;
}

#[tokio::test]
async fn test_raw_sends_are_checked() {
    let rig = rig().await.unwrap();
    let host = rig.session.host_address();

    let plain = Packet::new(MAM, host, PacketKind::Plain(Subtype::new(3).unwrap()), vec![1, 2]);
    rig.session.event_send(plain).await.unwrap();

    let reg = Packet::new(MAM, host, PacketKind::Register(RegKind::ReadRequest(RegWidth::W16)), vec![0]);
    let err = rig.session.event_send(reg).await.unwrap_err();
    assert!(matches!(err, SessionError::BadArgument(_)));

    let too_long = Packet::new(MAM, host, PacketKind::Event(EventKind::LAST), vec![0; 10]);
    assert_eq!(too_long.class(), PacketClass::Event);
    let err = rig.session.event_send(too_long).await.unwrap_err();
    assert!(matches!(err, SessionError::BadArgument(_)));
    rig.shutdown().await;
}

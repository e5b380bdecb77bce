use crate::*;

use dinet_core::config::{ModuleSpec, TargetConfig};
use dinet_core::reg::scm;
use dinet_core::{ModuleIdentity, ModuleType, PacketKind, RegKind, RegWidth};
use dinet_fabric::{DynBackend, MapBackend};
use dinet_host::{SessionError, Transport};

fn quick() -> SessionConfig {
    SessionConfig {
        register_timeout: Duration::from_millis(100),
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn test_silent_target_times_out() {
    let (host, _device) = ChannelTransport::pair(8);
    let session = HostSession::new(host, quick());
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout { module, address } if module == SCM && address == scm::NUM_MOD));
    assert!(!session.is_connected());
    assert!(session.directory().is_empty());
}

#[tokio::test]
async fn test_connect_twice_is_refused_and_reconnect_works() {
    let rig = rig().await.unwrap();
    let err = rig.session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyConnected));

    rig.session.disconnect().await;
    assert!(!rig.session.is_connected());
    assert!(matches!(
        rig.session.register_read(MAM, RegWidth::W16, 0).await,
        Err(SessionError::NotConnected)
    ));

    let report = rig.session.connect().await.unwrap();
    assert_eq!(report.modules, 3);
    assert_eq!(
        rig.session.register_read(MAM, RegWidth::W16, 1).await.unwrap(),
        u128::from(ModuleType::Mam.raw())
    );
    rig.shutdown().await;
}

#[tokio::test]
async fn test_stopped_target_fails_calls() {
    let rig = rig().await.unwrap();
    let Rig { session, target, .. } = rig;
    target.shutdown().await;

    // The receive loop notices the closed transport and drops the session.
    tokio::time::timeout(Duration::from_secs(1), async {
        while session.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let err = session.register_read(MAM, RegWidth::W16, 0).await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
    let err = session.event_receive().await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
    session.disconnect().await;
}

#[tokio::test]
async fn test_wrong_response_subclass_is_invalid() {
    let (host, device) = ChannelTransport::pair(8);
    tokio::spawn(async move {
        while let Ok(req) = device.recv().await {
            // Acknowledge everything as a write.
            let reply = req.reply(PacketKind::Register(RegKind::WriteSuccess), vec![]);
            if device.send(reply).await.is_err() {
                break;
            }
        }
    });
    let session = HostSession::new(host, quick());
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidResponse { module, .. } if module == SCM));
}

#[tokio::test]
async fn test_failing_backend_register_is_device_error() {
    let mut config = DinetConfig::default();
    config.target = TargetConfig {
        modules: vec![ModuleSpec {
            identity: ModuleIdentity::osd(ModuleType::Mam, 0),
            can_stall: false,
        }],
        ..TargetConfig::default()
    };
    let mut backend = MapBackend::new(0x200..0x300).with_latency(5);
    backend.fail_address(0x2ff);
    let subnet = Subnet::with_backends(&config.link, &config.target, vec![Box::new(backend) as DynBackend]).unwrap();

    let (host, device) = ChannelTransport::pair(64);
    let target = SimulatedTarget::spawn(subnet, device, Duration::ZERO);
    let session = HostSession::new(host, session_config(&config));
    let report = session.connect().await.unwrap();
    assert_eq!(report.modules, 2);

    session.register_write(MAM, RegWidth::W64, 0x2fe, 42).await.unwrap();
    assert_eq!(session.register_read(MAM, RegWidth::W64, 0x2fe).await.unwrap(), 42);
    let err = session.register_read(MAM, RegWidth::W16, 0x2ff).await.unwrap_err();
    assert!(matches!(err, SessionError::DeviceError { address: 0x2ff, .. }));

    session.disconnect().await;
    target.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_module_is_listed_as_undescribed() {
    // Answers the SCM only; module 1 never replies.
    let (host, device) = ChannelTransport::pair(8);
    tokio::spawn(async move {
        while let Ok(req) = device.recv().await {
            if req.dest != SCM {
                continue;
            }
            let value = match req.payload.first() {
                Some(&scm::NUM_MOD) => 2,
                Some(&scm::MAX_PKT_LEN) => 12,
                _ => 0,
            };
            let reply = req.reply(PacketKind::Register(RegKind::ReadSuccess(RegWidth::W16)), vec![value]);
            if device.send(reply).await.is_err() {
                break;
            }
        }
    });
    let session = HostSession::new(host, quick());
    let report = session.connect().await.unwrap();
    assert_eq!(report.undescribed, vec![MAM]);
    assert!(!report.is_complete());

    let entry = session.directory().get(&MAM).map(|e| e.value().clone()).unwrap();
    assert!(!entry.described);
    assert_eq!(entry.identity, ModuleIdentity::UNKNOWN);
    session.disconnect().await;
}

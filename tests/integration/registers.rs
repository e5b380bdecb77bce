use crate::*;

use dinet_core::reg::{base, scm};
use dinet_core::{ModuleType, RegWidth};
use dinet_host::directory::{find_by_type, snapshot};
use dinet_host::SessionError;

#[tokio::test]
async fn test_discovery_describes_every_module() {
    let rig = rig().await.unwrap();
    assert_eq!(rig.report.modules, 3);
    assert_eq!(rig.report.max_packet_len, 12);
    assert!(rig.report.is_complete());
    assert_eq!(rig.session.max_event_words(), 9);

    let modules = snapshot(rig.session.directory());
    let types: Vec<ModuleType> = modules.iter().map(|m| m.identity.module_type).collect();
    assert_eq!(types, vec![ModuleType::Scm, ModuleType::Mam, ModuleType::Stm]);
    assert!(modules.iter().all(|m| m.described));
    assert_eq!(find_by_type(rig.session.directory(), ModuleType::Stm), vec![STM]);

    let json = serde_json::to_value(&modules[2]).unwrap();
    assert_eq!(json["address"], 2);
    assert_eq!(json["identity"]["type"], ModuleType::Stm.raw());
    rig.shutdown().await;
}

#[tokio::test]
async fn test_every_width_round_trips() {
    let rig = rig().await.unwrap();
    let values = [0xbeef_u128, 0x1234_5678, 0x0102_0304_0506_0708, u128::MAX - 7];
    for (width, value) in RegWidth::ALL.into_iter().zip(values) {
        let address = 0x200 + width.index() as u16;
        rig.session
            .register_write(MAM, width, address, value)
            .await
            .unwrap();
        let read = rig.session.register_read(MAM, width, address).await.unwrap();
        assert_eq!(read, value, "{width}-bit register");
    }
    rig.shutdown().await;
}

#[tokio::test]
async fn test_control_bit_follows_stall_capability() {
    let rig = rig().await.unwrap();

    // The STM can stall: it starts stopped and the active bit sticks.
    assert_eq!(rig.session.register_read(STM, RegWidth::W16, base::MOD_CS).await.unwrap(), 0);
    rig.session.set_event_active(STM, true).await.unwrap();
    assert_eq!(rig.session.register_read(STM, RegWidth::W16, base::MOD_CS).await.unwrap(), 1);

    // The MAM cannot: always active, writes accepted but ignored.
    rig.session
        .register_write(MAM, RegWidth::W16, base::MOD_CS, 0)
        .await
        .unwrap();
    assert_eq!(rig.session.register_read(MAM, RegWidth::W16, base::MOD_CS).await.unwrap(), 1);
    rig.shutdown().await;
}

#[tokio::test]
async fn test_event_destination_keeps_address_bits() {
    let rig = rig().await.unwrap();
    rig.session
        .register_write(STM, RegWidth::W16, base::MOD_EVENT_DEST, 0xfc05)
        .await
        .unwrap();
    let dest = rig
        .session
        .register_read(STM, RegWidth::W16, base::MOD_EVENT_DEST)
        .await
        .unwrap();
    assert_eq!(dest, 0x005);
    rig.shutdown().await;
}

#[tokio::test]
async fn test_refused_accesses_are_device_errors() {
    let rig = rig().await.unwrap();
    let s = &rig.session;

    let err = s.register_read(MAM, RegWidth::W16, 0x100).await.unwrap_err();
    assert!(matches!(err, SessionError::DeviceError { address: 0x100, .. }));

    let err = s.register_write(MAM, RegWidth::W16, base::MOD_VENDOR, 7).await.unwrap_err();
    assert!(matches!(err, SessionError::DeviceError { .. }));

    // Internal registers are 16 bits wide.
    let err = s.register_read(MAM, RegWidth::W32, base::MOD_TYPE).await.unwrap_err();
    assert!(matches!(err, SessionError::DeviceError { .. }));

    let err = s.register_write(SCM, RegWidth::W16, scm::NUM_MOD, 9).await.unwrap_err();
    assert!(matches!(err, SessionError::DeviceError { .. }));

    // The module keeps answering after refusals.
    assert_eq!(
        s.register_read(MAM, RegWidth::W16, base::MOD_TYPE).await.unwrap(),
        u128::from(ModuleType::Mam.raw())
    );
    rig.shutdown().await;
}

#[tokio::test]
async fn test_width_limit_is_enforced_by_the_module() {
    let mut config = DinetConfig::default();
    config.target.max_reg_width = RegWidth::W32;
    let rig = rig_with(&config).await.unwrap();

    rig.session
        .register_write(MAM, RegWidth::W32, 0x210, 0xdead_beef)
        .await
        .unwrap();
    let err = rig
        .session
        .register_read(MAM, RegWidth::W64, 0x210)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::DeviceError { .. }));
    rig.shutdown().await;
}

#[tokio::test]
async fn test_arguments_are_checked_before_sending() {
    let rig = rig().await.unwrap();
    let s = &rig.session;

    let err = s.register_write(MAM, RegWidth::W16, 0x200, 0x1_0000).await.unwrap_err();
    assert!(matches!(err, SessionError::BadArgument(_)));

    let nowhere = DiAddr::from_word(0x55);
    let err = s.register_read(nowhere, RegWidth::W16, 0).await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownModule(a) if a == nowhere));

    let err = s.register_set_bit(STM, base::MOD_CS, 16, true).await.unwrap_err();
    assert!(matches!(err, SessionError::BadArgument(_)));
    rig.shutdown().await;
}

#[tokio::test]
async fn test_modules_are_served_concurrently() {
    let rig = rig().await.unwrap();
    let s = &rig.session;
    for i in 0..8u16 {
        s.register_write(MAM, RegWidth::W16, 0x200 + i, u128::from(i * 3)).await.unwrap();
    }

    let mam = async {
        let mut got = Vec::new();
        for i in 0..8u16 {
            got.push(s.register_read(MAM, RegWidth::W16, 0x200 + i).await.unwrap());
        }
        got
    };
    let stm = async {
        let mut got = Vec::new();
        for _ in 0..8 {
            got.push(s.register_read(STM, RegWidth::W16, base::MOD_TYPE).await.unwrap());
        }
        got
    };
    let scm = s.register_read(SCM, RegWidth::W16, scm::SYSTEM_VENDOR_ID);
    let (mam, stm, vendor) = tokio::join!(mam, stm, scm);

    assert_eq!(mam, (0..8u128).map(|i| i * 3).collect::<Vec<_>>());
    assert!(stm.iter().all(|&t| t == u128::from(ModuleType::Stm.raw())));
    assert_eq!(vendor.unwrap(), 1);
    rig.shutdown().await;
}

#[tokio::test]
async fn test_system_reset_pulse() {
    let rig = rig().await.unwrap();
    let s = &rig.session;
    s.register_set_bit(SCM, scm::SYSRST, 1, true).await.unwrap();
    assert_eq!(
        s.register_read(SCM, RegWidth::W16, scm::SYSRST).await.unwrap(),
        u128::from(scm::SYSRST_CPU)
    );
    s.register_set_bit(SCM, scm::SYSRST, 1, false).await.unwrap();
    assert_eq!(s.register_read(SCM, RegWidth::W16, scm::SYSRST).await.unwrap(), 0);
    rig.shutdown().await;
}
